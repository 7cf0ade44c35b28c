//! Host function registration on an import surface.
//!
//! Each `register_*` function adds one family of imports to an
//! [`ImportSurface`]. Guests may only call what was registered before they
//! were instantiated.

use grammar_bridge_common::BridgeError;
use grammar_bridge_core::{HostContext, ImportSurface};
use tracing::{debug, warn};
use wasmtime::{Caller, Extern};

use crate::logging::{LoggingHost, level_from_i32};

/// Register every standard import: `env.log` and WASI preview1.
///
/// # Errors
///
/// Returns an error if a definition clashes with one already on the surface.
pub fn register_all(surface: &mut ImportSurface) -> Result<(), BridgeError> {
    register_logging(surface)?;
    register_wasi(surface)?;
    Ok(())
}

/// Register `env.log(level: i32, ptr: i32, len: i32)`.
///
/// The message is read from the guest's exported `memory`. Calls with a
/// region outside that memory are dropped with a warning instead of
/// trapping the guest.
pub fn register_logging(surface: &mut ImportSurface) -> Result<(), BridgeError> {
    surface
        .linker_mut()
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, HostContext>, level: i32, ptr: i32, len: i32| {
                if ptr < 0 || len < 0 {
                    warn!(ptr, len, "Guest log with negative pointer or length");
                    return;
                }

                let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory)
                else {
                    warn!("Guest logged without exporting memory");
                    return;
                };

                // Copy out first; the context borrow below needs `caller` mutably
                #[allow(clippy::cast_sign_loss)]
                let message = {
                    let data = memory.data(&caller);
                    let start = ptr as usize;
                    let Some(end) = start.checked_add(len as usize) else {
                        warn!(ptr, len, "Guest log region overflows");
                        return;
                    };

                    let Some(bytes) = data.get(start..end) else {
                        warn!(
                            start,
                            end,
                            memory_size = data.len(),
                            "Guest log region out of bounds"
                        );
                        return;
                    };

                    String::from_utf8_lossy(bytes).into_owned()
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            BridgeError::invalid_config(format!("Failed to register env.log: {e}"))
        })?;

    debug!("Registered env.log");
    Ok(())
}

/// Register the WASI preview1 imports.
///
/// The context only inherits stderr: no files, sockets, environment or
/// arguments are visible to the guest.
pub fn register_wasi(surface: &mut ImportSurface) -> Result<(), BridgeError> {
    wasmtime_wasi::preview1::add_to_linker_sync(surface.linker_mut(), HostContext::wasi_mut)
        .map_err(|e| BridgeError::invalid_config(format!("Failed to register WASI: {e}")))?;

    debug!("Registered wasi_snapshot_preview1");
    Ok(())
}
