//! WebAssembly module compilation and introspection.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that validates and compiles a guest artifact and records the static
//! description of its exports and imports.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use grammar_bridge_common::BridgeError;

use crate::exports::ExportDescriptor;

/// A compiled, validated guest module.
///
/// Immutable once constructed. Cloning is cheap and a module may be
/// instantiated any number of times under stores of the same engine.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// Process-local 64-bit hash of the original artifact bytes.
    content_hash: String,

    exports: BTreeMap<String, ExportDescriptor>,

    /// Declared imports as `module::name`.
    imports: Vec<String>,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ModuleCompile`] if the bytes are not a valid
    /// module or use features the engine does not support.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, BridgeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            BridgeError::module_compile(format!("Core module compilation failed: {e}"))
        })?;

        let compiled = Self::describe(module, compute_hash(bytes));

        info!(
            content_hash = %compiled.content_hash,
            exports = compiled.exports.len(),
            imports = compiled.imports.len(),
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(compiled)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, BridgeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat)
            .map_err(|e| BridgeError::module_compile(format!("WAT compilation failed: {e}")))?;

        let compiled = Self::describe(module, compute_hash(wat.as_bytes()));

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(compiled)
    }

    /// Load a module previously produced by [`CompiledModule::serialize`].
    ///
    /// # Safety
    ///
    /// The bytes are trusted machine code. Only pass artifacts serialized by
    /// the same Wasmtime version with a compatible engine configuration.
    #[allow(unsafe_code)]
    pub unsafe fn from_serialized(engine: &Engine, bytes: &[u8]) -> Result<Self, BridgeError> {
        // SAFETY: upheld by the caller per this function's contract
        let module = unsafe { Module::deserialize(engine, bytes) }.map_err(|e| {
            BridgeError::module_compile(format!("Failed to load serialized module: {e}"))
        })?;

        let compiled = Self::describe(module, compute_hash(bytes));
        debug!(content_hash = %compiled.content_hash, "Serialized module loaded");

        Ok(compiled)
    }

    /// Serialize the compiled module for ahead-of-time caching.
    pub fn serialize(&self) -> Result<Vec<u8>, BridgeError> {
        self.inner.serialize().map_err(|e| {
            BridgeError::module_compile(format!("Module serialization failed: {e}"))
        })
    }

    fn describe(module: Module, content_hash: String) -> Self {
        let exports = module
            .exports()
            .map(|export| {
                (
                    export.name().to_string(),
                    ExportDescriptor::from_extern_type(&export.ty()),
                )
            })
            .collect();

        let imports = module
            .imports()
            .map(|import| format!("{}::{}", import.module(), import.name()))
            .collect();

        Self {
            inner: module,
            content_hash,
            exports,
            imports,
        }
    }

    /// Get the content hash of the original artifact.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Every export the module declares, by name.
    pub fn exports(&self) -> &BTreeMap<String, ExportDescriptor> {
        &self.exports
    }

    /// Every import the module declares, as `module::name`.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Validate WebAssembly header (magic number and core version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), BridgeError> {
        if bytes.len() < 8 {
            return Err(BridgeError::module_compile("Invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(BridgeError::module_compile("Invalid Wasm: bad magic number"));
        }

        if bytes[4..8] != [0x01, 0x00, 0x00, 0x00] {
            return Err(BridgeError::module_compile(
                "Invalid Wasm: not a core module (components are not supported)",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("exports", &self.exports.len())
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}

/// 64-bit hex digest of `bytes`, for logs and module identity.
///
/// Only comparable within one process: `DefaultHasher` output may change
/// between Rust releases.
pub(crate) fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
