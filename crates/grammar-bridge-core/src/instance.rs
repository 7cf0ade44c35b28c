//! Instance creation and import surfaces.
//!
//! This module provides:
//! - [`ImportSurface`]: the host functions offered to a module (often empty)
//! - [`GuestInstance`]: a live activation of a module inside a store, with a
//!   fixed export table

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{ExternType, ImportType, Linker, Store, Trap};

use crate::exports::{ExportDescriptor, FuncSignature};
use crate::store::{HostContext, SandboxStore, StoreHandle, arm_for_call, record_call};
use crate::{CompiledModule, WasmEngine};
use grammar_bridge_common::{BridgeError, ExecutionConfig};

/// Host-provided functions and values a module may import.
///
/// An empty surface satisfies modules without imports. Host functions are
/// registered on the underlying linker, see the `grammar-bridge-host` crate.
pub struct ImportSurface {
    engine: WasmEngine,
    linker: Linker<HostContext>,
}

impl ImportSurface {
    /// Create an import surface offering nothing.
    pub fn empty(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
            linker: Linker::new(engine.inner()),
        }
    }

    /// Get a mutable reference to the linker, to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<HostContext> {
        &mut self.linker
    }

    /// The engine this surface was built for.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Imports of `module` this surface does not satisfy, with the reason.
    fn unresolved(
        &self,
        store: &mut Store<HostContext>,
        module: &CompiledModule,
    ) -> Vec<(String, String)> {
        module
            .inner()
            .imports()
            .filter_map(|import| {
                let name = format!("{}::{}", import.module(), import.name());
                self.check_import(store, &import)
                    .err()
                    .map(|reason| (name, reason))
            })
            .collect()
    }

    fn check_import(
        &self,
        store: &mut Store<HostContext>,
        import: &ImportType<'_>,
    ) -> Result<(), String> {
        let provided = self
            .linker
            .get(&mut *store, import.module(), import.name())
            .ok_or_else(|| "not defined".to_string())?;

        match (import.ty(), provided.ty(&*store)) {
            (ExternType::Func(expected), ExternType::Func(actual)) => {
                let expected = FuncSignature::from_func_type(&expected);
                let actual = FuncSignature::from_func_type(&actual);
                if expected == actual {
                    Ok(())
                } else {
                    Err(format!("expected func {expected}, host provides func {actual}"))
                }
            }
            (ExternType::Func(_), _) => Err("expected a function".into()),
            (_, ExternType::Func(_)) => Err("host provides a function".into()),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ImportSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportSurface").finish_non_exhaustive()
    }
}

/// A live activation of a [`CompiledModule`] inside a [`SandboxStore`].
///
/// The export table is fixed at instantiation. The instance does not keep
/// its store alive; after the store is released every operation fails with
/// [`BridgeError::StoreReleased`].
///
/// Once a guest call traps, runs out of fuel, times out, or hands back
/// memory the host cannot read, the instance is poisoned and refuses
/// further calls.
pub struct GuestInstance {
    id: Uuid,
    store: StoreHandle,
    instance: wasmtime::Instance,
    module_hash: String,
    exports: BTreeMap<String, ExportDescriptor>,
    poisoned: Option<String>,
}

impl GuestInstance {
    /// Instantiate `module` in `store`, resolving its imports from `imports`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::EngineMismatch`] if the module or import surface
    ///   belong to a different engine than the store
    /// - [`BridgeError::ImportResolution`] if an import is missing or has
    ///   the wrong type
    /// - [`BridgeError::RuntimeTrap`] (or a resource limit error) if the
    ///   module's start function traps
    /// - [`BridgeError::StoreReleased`] if the store is gone
    #[instrument(skip_all, fields(module = %module.content_hash(), store_id = %store.id()))]
    pub fn instantiate(
        store: &SandboxStore,
        module: &CompiledModule,
        imports: &ImportSurface,
    ) -> Result<Self, BridgeError> {
        if !store.engine().same(module.inner().engine()) {
            return Err(BridgeError::engine_mismatch(
                "module was compiled under a different engine than the store",
            ));
        }
        if !store.engine().same(imports.engine().inner()) {
            return Err(BridgeError::engine_mismatch(
                "import surface was built for a different engine than the store",
            ));
        }

        let handle = store.handle();
        let start = Instant::now();

        let instance = handle.with_store(|s| {
            let unresolved = imports.unresolved(s, module);
            if !unresolved.is_empty() {
                let reason = unresolved
                    .iter()
                    .map(|(name, why)| format!("{name}: {why}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(reason = %reason, "Module imports not satisfied");
                return Err(BridgeError::ImportResolution {
                    missing: unresolved.into_iter().map(|(name, _)| name).collect(),
                    reason,
                });
            }

            arm_for_call(s, handle.engine(), handle.execution())?;
            let result = imports.linker.instantiate(&mut *s, module.inner());
            record_call(s, handle.engine(), handle.execution(), start);

            result.map_err(|e| classify_call_error(&e, handle.execution()))
        })?;

        let id = Uuid::new_v4();

        info!(
            instance_id = %id,
            exports = module.exports().len(),
            duration_ms = start.elapsed().as_millis(),
            "Instance created"
        );

        Ok(Self {
            id,
            store: handle,
            instance,
            module_hash: module.content_hash().to_string(),
            exports: module.exports().clone(),
            poisoned: None,
        })
    }

    /// Unique id of this instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Every export of the instance, by name.
    pub fn exports(&self) -> &BTreeMap<String, ExportDescriptor> {
        &self.exports
    }

    /// Content hash of the module this instance was created from.
    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    /// Handle to the owning store.
    pub fn store_handle(&self) -> &StoreHandle {
        &self.store
    }

    /// Returns `true` if the instance must no longer be called.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Why the instance was poisoned, if it was.
    pub fn poison_reason(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    /// Run `f` with exclusive access to the owning store.
    pub fn with_store<R>(
        &self,
        f: impl FnOnce(&mut Store<HostContext>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        self.store.with_store(f)
    }

    pub(crate) fn raw(&self) -> &wasmtime::Instance {
        &self.instance
    }

    pub(crate) fn poison(&mut self, reason: String) {
        if self.poisoned.is_none() {
            error!(instance_id = %self.id, reason = %reason, "Instance poisoned");
            self.poisoned = Some(reason);
        }
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("id", &self.id)
            .field("module_hash", &self.module_hash)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

/// Map a failed guest call onto the error taxonomy.
pub(crate) fn classify_call_error(error: &wasmtime::Error, config: &ExecutionConfig) -> BridgeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => BridgeError::FuelExhausted,
        Some(Trap::Interrupt) => BridgeError::ExecutionTimeout {
            duration_ms: config.timeout_ms,
        },
        Some(trap) => BridgeError::trap(error.to_string(), Some(format!("{trap:?}"))),
        None => BridgeError::trap(error.to_string(), None),
    }
}
