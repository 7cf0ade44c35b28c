//! Error types for grammar-bridge.
//!
//! Every operation at the host/guest boundary returns [`BridgeError`], so a
//! caller can tell "no match" apart from "the engine broke" apart from
//! "the grammar was never compiled" without inspecting strings.

use thiserror::Error;

/// Errors raised by the embedding, marshalling and session layers.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The module artifact is malformed or uses unsupported features.
    #[error("Module compilation failed: {reason}")]
    ModuleCompile {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module declares imports the supplied import surface does not satisfy.
    #[error("Import resolution failed: {reason}")]
    ImportResolution {
        /// Imports (`module::name`) that could not be resolved.
        missing: Vec<String>,
        /// Description of the resolution failure.
        reason: String,
    },

    /// No export with the requested name exists on the instance.
    #[error("Export not found: {name}")]
    ExportNotFound {
        /// The export name that was looked up.
        name: String,
    },

    /// An export exists but its type differs from what the host expects.
    #[error("Export '{name}' has signature {actual}, expected {expected}")]
    ExportSignatureMismatch {
        /// The export name.
        name: String,
        /// Signature the host asked for.
        expected: String,
        /// Signature the guest declares.
        actual: String,
    },

    /// A value could not be moved across the guest memory boundary.
    #[error("Marshalling failed: {reason}")]
    Marshal {
        /// Description of the bounds or encoding violation.
        reason: String,
    },

    /// The guest trapped while executing a call.
    #[error("Wasm trap: {message}")]
    RuntimeTrap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// The guest call exhausted its fuel budget.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The guest call ran past its epoch deadline.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The configured timeout in milliseconds.
        duration_ms: u64,
    },

    /// The guest rejected a grammar text.
    #[error("Grammar '{grammar}' failed to compile: {diagnostic}")]
    GrammarCompile {
        /// Name the grammar was to be compiled under.
        grammar: String,
        /// Diagnostic reported by the guest.
        diagnostic: String,
    },

    /// The input did not match the grammar.
    #[error("Input does not match grammar '{grammar}': {diagnostic}")]
    Parse {
        /// Name of the grammar used for parsing.
        grammar: String,
        /// Diagnostic reported by the guest.
        diagnostic: String,
    },

    /// Parse was requested for a grammar name that was never compiled.
    #[error("Unknown grammar: {grammar}")]
    UnknownGrammar {
        /// The grammar name that was requested.
        grammar: String,
    },

    /// A grammar name was reused with different grammar text.
    #[error("Grammar '{grammar}' is already compiled with different text")]
    GrammarConflict {
        /// The conflicting grammar name.
        grammar: String,
    },

    /// The store owning an instance has been released.
    #[error("Store has been released")]
    StoreReleased,

    /// Two runtime objects were created under different engines.
    #[error("Engine mismatch: {reason}")]
    EngineMismatch {
        /// Which objects disagree.
        reason: String,
    },

    /// An export handle was used with an instance it was not resolved from.
    #[error("Export '{name}' belongs to a different instance")]
    InstanceMismatch {
        /// The export name.
        name: String,
    },

    /// The instance failed earlier and must not be called again.
    #[error("Instance is poisoned: {reason}")]
    InstancePoisoned {
        /// The failure that poisoned the instance.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A blocking worker task failed before producing a result.
    #[error("Worker failed: {reason}")]
    WorkerFailed {
        /// Why the worker did not complete.
        reason: String,
    },
}

impl BridgeError {
    /// Create a new `ModuleCompile` error.
    pub fn module_compile(reason: impl Into<String>) -> Self {
        Self::ModuleCompile {
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `Marshal` error.
    pub fn marshal(reason: impl Into<String>) -> Self {
        Self::Marshal {
            reason: reason.into(),
        }
    }

    /// Create a new `RuntimeTrap` error.
    pub fn trap(message: impl Into<String>, code: Option<String>) -> Self {
        Self::RuntimeTrap {
            message: message.into(),
            code,
        }
    }

    /// Create a new `UnknownGrammar` error.
    pub fn unknown_grammar(grammar: impl Into<String>) -> Self {
        Self::UnknownGrammar {
            grammar: grammar.into(),
        }
    }

    /// Create a new `EngineMismatch` error.
    pub fn engine_mismatch(reason: impl Into<String>) -> Self {
        Self::EngineMismatch {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` for outcomes a caller can handle and carry on with the
    /// same instance.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GrammarCompile { .. }
                | Self::Parse { .. }
                | Self::UnknownGrammar { .. }
                | Self::GrammarConflict { .. }
        )
    }

    /// Returns `true` if the guest state can no longer be trusted after this
    /// error and the instance must be recreated.
    pub fn poisons_instance(&self) -> bool {
        matches!(
            self,
            Self::RuntimeTrap { .. }
                | Self::FuelExhausted
                | Self::ExecutionTimeout { .. }
                | Self::Marshal { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::ExecutionTimeout { .. })
    }
}
