//! The grammar engine seam.
//!
//! [`GrammarEngine`] is the narrow interface a session drives. The
//! production implementation, [`WasmGrammarEngine`], forwards to a sandboxed
//! guest; tests substitute in-memory stand-ins.

use tracing::{debug, instrument, warn};

use grammar_bridge_common::{BridgeError, GrammarSlots, GuestAbiConfig};
use grammar_bridge_core::{
    CallMarshaller, ExportResolver, ExportedFunction, FuncSignature, GuestInstance, GuestRecord,
    HostValue, SandboxStore, ValKind,
};

/// Successful outcome of a parse call.
///
/// `output` is whatever the engine produced for the match. Its format is
/// defined by the engine and not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    /// Grammar the input was parsed with.
    pub grammar: String,
    /// Engine-defined match payload.
    pub output: String,
}

/// A PEG engine that compiles grammars by name and parses with them.
pub trait GrammarEngine {
    /// Compile `grammar` and keep it under `name`.
    ///
    /// A grammar the engine rejects is reported as
    /// [`BridgeError::GrammarCompile`].
    fn compile(&mut self, grammar: &str, name: &str) -> Result<(), BridgeError>;

    /// Parse `input` with the grammar kept under `name`.
    ///
    /// Input that does not match is reported as [`BridgeError::Parse`],
    /// never as a trap.
    fn parse(&mut self, name: &str, input: &str) -> Result<ParseResult, BridgeError>;

    /// How many compiled grammars the engine keeps at once.
    fn grammar_slots(&self) -> GrammarSlots {
        GrammarSlots::PerName
    }
}

/// [`GrammarEngine`] backed by a guest instance.
///
/// Exports are resolved once at attach time and reused for every call.
/// An engine built with [`WasmGrammarEngine::attach_owned`] also owns the
/// instance's store, so dropping the engine tears the store down with it.
#[derive(Debug)]
pub struct WasmGrammarEngine {
    instance: GuestInstance,
    marshaller: CallMarshaller,
    compile: ExportedFunction,
    parse: ExportedFunction,
    grammar_slots: GrammarSlots,
    store: Option<SandboxStore>,
}

impl WasmGrammarEngine {
    /// Bind to the grammar exports of `instance`.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::ExportNotFound`] or
    /// [`BridgeError::ExportSignatureMismatch`] if the instance does not
    /// follow the calling convention named by `abi`.
    #[instrument(skip_all, fields(instance_id = %instance.id()))]
    pub fn attach(instance: GuestInstance, abi: &GuestAbiConfig) -> Result<Self, BridgeError> {
        let marshaller = CallMarshaller::new(&instance, abi)?;
        let compile = ExportResolver::resolve(
            &instance,
            &abi.compile,
            &FuncSignature::new([ValKind::I32, ValKind::I32], [ValKind::I64]),
        )?;
        let parse = ExportResolver::resolve(
            &instance,
            &abi.parse,
            &FuncSignature::new(
                [ValKind::I32, ValKind::I32, ValKind::I32, ValKind::I32],
                [ValKind::I64],
            ),
        )?;

        debug!(
            compile = %abi.compile,
            parse = %abi.parse,
            grammar_slots = ?abi.grammar_slots,
            "Grammar exports bound"
        );

        Ok(Self {
            instance,
            marshaller,
            compile,
            parse,
            grammar_slots: abi.grammar_slots,
            store: None,
        })
    }

    /// Bind to `instance` and take ownership of the store it lives in.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::InvalidConfig`] if `instance` was not
    /// created in `store`, otherwise as [`WasmGrammarEngine::attach`].
    pub fn attach_owned(
        store: SandboxStore,
        instance: GuestInstance,
        abi: &GuestAbiConfig,
    ) -> Result<Self, BridgeError> {
        if instance.store_handle().store_id() != store.id() {
            return Err(BridgeError::invalid_config(format!(
                "instance {} does not live in store {}",
                instance.id(),
                store.id()
            )));
        }

        let mut engine = Self::attach(instance, abi)?;
        engine.store = Some(store);
        Ok(engine)
    }

    /// The store this engine owns, if it was attached with
    /// [`WasmGrammarEngine::attach_owned`].
    pub fn store(&self) -> Option<&SandboxStore> {
        self.store.as_ref()
    }

    /// The instance this engine calls into.
    pub fn instance(&self) -> &GuestInstance {
        &self.instance
    }

    /// Detach and return the instance.
    ///
    /// An owned store is released here; calls through the returned instance
    /// then fail with [`BridgeError::StoreReleased`].
    pub fn into_instance(self) -> GuestInstance {
        self.instance
    }
}

impl GrammarEngine for WasmGrammarEngine {
    fn compile(&mut self, grammar: &str, name: &str) -> Result<(), BridgeError> {
        let record = self.marshaller.invoke_record(
            &mut self.instance,
            &self.compile,
            &[HostValue::Str(grammar)],
        )?;

        match record {
            GuestRecord::Success(_) => Ok(()),
            GuestRecord::Failure(diagnostic) => {
                warn!(grammar = name, %diagnostic, "Guest rejected grammar");
                Err(BridgeError::GrammarCompile {
                    grammar: name.to_string(),
                    diagnostic,
                })
            }
        }
    }

    fn parse(&mut self, name: &str, input: &str) -> Result<ParseResult, BridgeError> {
        let record = self.marshaller.invoke_record(
            &mut self.instance,
            &self.parse,
            &[HostValue::Str(name), HostValue::Str(input)],
        )?;

        match record {
            GuestRecord::Success(output) => Ok(ParseResult {
                grammar: name.to_string(),
                output,
            }),
            GuestRecord::Failure(diagnostic) => Err(BridgeError::Parse {
                grammar: name.to_string(),
                diagnostic,
            }),
        }
    }

    fn grammar_slots(&self) -> GrammarSlots {
        self.grammar_slots
    }
}
