//! Host-side bridge for driving a sandboxed PEG grammar engine.
//!
//! The grammar engine ships as a precompiled WebAssembly module. This crate
//! loads it into an isolated store, binds its grammar exports, and exposes a
//! compile-then-parse API with a discriminated error for every way a call
//! can go wrong.
//!
//! # Usage
//!
//! ```no_run
//! use grammar_bridge::{Bridge, BridgeConfig, BridgeError};
//!
//! # fn main() -> Result<(), BridgeError> {
//! let bytes = std::fs::read("peg_engine.wasm").expect("module on disk");
//!
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! let mut session = bridge.open_session(&bytes)?;
//!
//! session.compile_grammar("alpha = { 'a'..'z' | 'A'..'Z' }", "alpha")?;
//! match session.parse_input("alpha", "a") {
//!     Ok(result) => println!("{}", result.output),
//!     Err(BridgeError::Parse { diagnostic, .. }) => println!("no match: {diagnostic}"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The free functions ([`load_engine`], [`open_store`], [`load_module`],
//! [`create_instance`], [`open_session`]) expose each step separately for
//! hosts that manage stores and instances themselves.

use std::path::Path;

use tracing::{info, instrument, warn};

pub use grammar_bridge_common::{
    BridgeConfig, BridgeError, ConfigFile, ConfigFileError, EngineConfig, ExecutionConfig,
    GrammarEntry, GrammarSlots, GuestAbiConfig, OptLevel,
};
pub use grammar_bridge_core::{
    CompiledModule, ExportDescriptor, GuestInstance, ImportSurface, SandboxStore, StoreHandle,
    WasmEngine,
};
pub use grammar_bridge_session::{
    GrammarEngine, GrammarSession, GrammarStatus, ParseResult, SharedSession, WasmGrammarEngine,
};

/// A grammar session over a guest instance.
pub type Session = GrammarSession<WasmGrammarEngine>;

/// Create an engine.
pub fn load_engine(config: &EngineConfig) -> Result<WasmEngine, BridgeError> {
    WasmEngine::new(config)
}

/// Create a store bound to `engine`.
pub fn open_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<SandboxStore, BridgeError> {
    SandboxStore::new(engine, config)
}

/// Validate and compile a module artifact for `store`'s engine.
pub fn load_module(store: &SandboxStore, bytes: &[u8]) -> Result<CompiledModule, BridgeError> {
    CompiledModule::from_bytes(store.engine().inner(), bytes)
}

/// Read a module artifact from `path` and compile it.
///
/// # Errors
///
/// An unreadable file is reported as [`BridgeError::ModuleCompile`].
pub fn load_module_file(
    store: &SandboxStore,
    path: impl AsRef<Path>,
) -> Result<CompiledModule, BridgeError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        BridgeError::module_compile(format!("Failed to read '{}': {e}", path.display()))
    })?;
    load_module(store, &bytes)
}

/// Instantiate `module` in `store` against `imports`.
pub fn create_instance(
    store: &SandboxStore,
    module: &CompiledModule,
    imports: &ImportSurface,
) -> Result<GuestInstance, BridgeError> {
    GuestInstance::instantiate(store, module, imports)
}

/// Import surface with every standard host function registered.
pub fn standard_imports(engine: &WasmEngine) -> Result<ImportSurface, BridgeError> {
    let mut imports = ImportSurface::empty(engine);
    grammar_bridge_host::register_all(&mut imports)?;
    Ok(imports)
}

/// Bind the grammar exports of `instance` and start a session.
pub fn open_session(instance: GuestInstance, abi: &GuestAbiConfig) -> Result<Session, BridgeError> {
    Ok(GrammarSession::new(WasmGrammarEngine::attach(instance, abi)?))
}

/// Compile `text` under `name` in `session`.
pub fn compile_grammar(session: &mut Session, text: &str, name: &str) -> Result<(), BridgeError> {
    session.compile_grammar(text, name)
}

/// Parse `text` with the grammar compiled under `name`.
pub fn parse_input(
    session: &mut Session,
    name: &str,
    text: &str,
) -> Result<ParseResult, BridgeError> {
    session.parse_input(name, text)
}

/// One engine and import surface, configured once, opening sessions on
/// demand.
///
/// Every session gets a store of its own. Dropping a session tears down its
/// store and guest memory, so recovering from a trapped or timed-out
/// session is a matter of dropping it and opening another.
pub struct Bridge {
    config: BridgeConfig,
    grammars: Vec<GrammarEntry>,
    engine: WasmEngine,
    imports: ImportSurface,
}

impl Bridge {
    /// Create an engine and standard import surface from `config`.
    #[instrument(skip_all)]
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let engine = load_engine(&config.engine)?;
        let imports = standard_imports(&engine)?;

        info!(grammar_slots = ?config.abi.grammar_slots, "Bridge ready");

        Ok(Self {
            config,
            grammars: Vec::new(),
            engine,
            imports,
        })
    }

    /// Create a bridge from a parsed configuration file. Its grammars are
    /// compiled into every session opened later.
    ///
    /// On a single-slot guest only the last configured grammar stays ready.
    pub fn from_config_file(file: ConfigFile) -> Result<Self, BridgeError> {
        let mut bridge = Self::new(file.runtime)?;
        if bridge.config.abi.grammar_slots == GrammarSlots::Single && file.grammars.len() > 1 {
            warn!(
                grammars = file.grammars.len(),
                "Single-slot guest keeps only the last configured grammar"
            );
        }
        bridge.grammars = file.grammars;
        Ok(bridge)
    }

    /// Compile a module artifact once for use with
    /// [`Bridge::open_session_with`].
    pub fn compile_module(&self, bytes: &[u8]) -> Result<CompiledModule, BridgeError> {
        CompiledModule::from_bytes(self.engine.inner(), bytes)
    }

    /// Load a module, instantiate it, and start a session with the
    /// configured grammars compiled.
    #[instrument(skip_all, fields(bytes_len = bytes.len()))]
    pub fn open_session(&self, bytes: &[u8]) -> Result<Session, BridgeError> {
        let module = self.compile_module(bytes)?;
        self.open_session_with(&module)
    }

    /// Start a session on an already compiled module, in a fresh store.
    pub fn open_session_with(&self, module: &CompiledModule) -> Result<Session, BridgeError> {
        let store = open_store(&self.engine, &self.config.execution)?;
        let store_id = store.id();
        let instance = create_instance(&store, module, &self.imports)?;
        let engine = WasmGrammarEngine::attach_owned(store, instance, &self.config.abi)?;
        let mut session = GrammarSession::new(engine);

        let compiled = session.compile_all(&self.grammars)?;
        info!(%store_id, grammars = compiled, "Session opened");

        Ok(session)
    }

    /// Configuration the bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Grammars compiled into each new session.
    pub fn grammars(&self) -> &[GrammarEntry] {
        &self.grammars
    }

    /// The engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("engine", &self.engine)
            .field("grammars", &self.grammars.len())
            .finish_non_exhaustive()
    }
}
