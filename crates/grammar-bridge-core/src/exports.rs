//! Export signatures and name-based export resolution.
//!
//! The guest is addressed purely by export name. [`ExportResolver`] turns a
//! name plus the signature the host expects into an [`ExportedFunction`]
//! handle, failing fast when the name is absent or the types differ.

use std::fmt;

use tracing::debug;
use uuid::Uuid;
use wasmtime::{ExternType, Func, FuncType, Memory, ValType};

use grammar_bridge_common::BridgeError;

use crate::GuestInstance;

/// Kind of a WebAssembly value at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValKind {
    I32,
    I64,
    F32,
    F64,
    V128,
    /// Any reference type (funcref, externref, ...).
    Ref,
}

impl ValKind {
    fn from_val_type(ty: &ValType) -> Self {
        match ty {
            ValType::I32 => Self::I32,
            ValType::I64 => Self::I64,
            ValType::F32 => Self::F32,
            ValType::F64 => Self::F64,
            ValType::V128 => Self::V128,
            _ => Self::Ref,
        }
    }
}

impl fmt::Display for ValKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::Ref => "ref",
        };
        f.write_str(name)
    }
}

/// Parameter and result kinds of a function export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSignature {
    pub params: Vec<ValKind>,
    pub results: Vec<ValKind>,
}

impl FuncSignature {
    /// Create a signature from parameter and result kinds.
    pub fn new(params: impl Into<Vec<ValKind>>, results: impl Into<Vec<ValKind>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Signature of a Wasmtime function type.
    pub fn from_func_type(ty: &FuncType) -> Self {
        Self {
            params: ty.params().map(|t| ValKind::from_val_type(&t)).collect(),
            results: ty.results().map(|t| ValKind::from_val_type(&t)).collect(),
        }
    }
}

impl fmt::Display for FuncSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |kinds: &[ValKind]| {
            kinds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        write!(f, "({})", join(&self.params))?;
        match self.results.as_slice() {
            [] => Ok(()),
            [single] => write!(f, " -> {single}"),
            many => write!(f, " -> ({})", join(many)),
        }
    }
}

/// Static description of one export of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportDescriptor {
    /// A callable function.
    Func(FuncSignature),
    /// A linear memory with its declared minimum size in 64 KiB pages.
    Memory { minimum_pages: u64 },
    /// A table.
    Table,
    /// A global.
    Global,
    /// Any other extern kind.
    Other,
}

impl ExportDescriptor {
    /// Describe a Wasmtime extern type.
    pub fn from_extern_type(ty: &ExternType) -> Self {
        match ty {
            ExternType::Func(func) => Self::Func(FuncSignature::from_func_type(func)),
            ExternType::Memory(memory) => Self::Memory {
                minimum_pages: memory.minimum(),
            },
            ExternType::Table(_) => Self::Table,
            ExternType::Global(_) => Self::Global,
            _ => Self::Other,
        }
    }

    /// The function signature, if this export is a function.
    pub fn as_func(&self) -> Option<&FuncSignature> {
        match self {
            Self::Func(signature) => Some(signature),
            _ => None,
        }
    }

    fn kind_name(&self) -> String {
        match self {
            Self::Func(signature) => format!("func {signature}"),
            Self::Memory { .. } => "memory".into(),
            Self::Table => "table".into(),
            Self::Global => "global".into(),
            Self::Other => "extern".into(),
        }
    }
}

/// A resolved, typed function export.
///
/// The handle is tied to the instance it was resolved from and may be
/// called any number of times through that instance only.
#[derive(Debug, Clone)]
pub struct ExportedFunction {
    name: String,
    signature: FuncSignature,
    func: Func,
    instance_id: Uuid,
}

impl ExportedFunction {
    /// Export name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signature verified at resolution time.
    pub fn signature(&self) -> &FuncSignature {
        &self.signature
    }

    /// Id of the instance this handle was resolved from.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub(crate) fn func(&self) -> &Func {
        &self.func
    }
}

/// Name-based export lookup with signature checking.
pub struct ExportResolver;

impl ExportResolver {
    /// Resolve a function export by exact name and expected signature.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ExportNotFound`] if no export has that name
    /// - [`BridgeError::ExportSignatureMismatch`] if the export is not a
    ///   function or its parameter/result kinds differ from `expected`
    /// - [`BridgeError::StoreReleased`] if the instance's store is gone
    pub fn resolve(
        instance: &GuestInstance,
        name: &str,
        expected: &FuncSignature,
    ) -> Result<ExportedFunction, BridgeError> {
        let descriptor = instance
            .exports()
            .get(name)
            .ok_or_else(|| BridgeError::export_not_found(name))?;

        match descriptor.as_func() {
            Some(actual) if actual == expected => {}
            _ => {
                return Err(BridgeError::ExportSignatureMismatch {
                    name: name.to_string(),
                    expected: format!("func {expected}"),
                    actual: descriptor.kind_name(),
                });
            }
        }

        let func = instance
            .with_store(|store| Ok(instance.raw().get_func(&mut *store, name)))?
            .ok_or_else(|| BridgeError::export_not_found(name))?;

        debug!(export = name, signature = %expected, "Export resolved");

        Ok(ExportedFunction {
            name: name.to_string(),
            signature: expected.clone(),
            func,
            instance_id: instance.id(),
        })
    }

    /// Resolve an optional function export: absence is not an error, a
    /// signature mismatch still is.
    pub fn resolve_optional(
        instance: &GuestInstance,
        name: &str,
        expected: &FuncSignature,
    ) -> Result<Option<ExportedFunction>, BridgeError> {
        match Self::resolve(instance, name, expected) {
            Ok(func) => Ok(Some(func)),
            Err(BridgeError::ExportNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve an exported linear memory by name.
    pub fn resolve_memory(instance: &GuestInstance, name: &str) -> Result<Memory, BridgeError> {
        match instance.exports().get(name) {
            None => return Err(BridgeError::export_not_found(name)),
            Some(ExportDescriptor::Memory { .. }) => {}
            Some(other) => {
                return Err(BridgeError::ExportSignatureMismatch {
                    name: name.to_string(),
                    expected: "memory".into(),
                    actual: other.kind_name(),
                });
            }
        }

        instance
            .with_store(|store| Ok(instance.raw().get_memory(&mut *store, name)))?
            .ok_or_else(|| BridgeError::export_not_found(name))
    }
}
