//! Moving values across the guest memory boundary.
//!
//! [`CallMarshaller`] implements the guest calling convention:
//!
//! - String and byte arguments are copied into a fresh region obtained from
//!   the guest allocator and passed as `(ptr: i32, len: i32)`
//! - Scalar arguments are passed by value
//! - Structured results come back as one `i64` packing `(ptr << 32) | len`;
//!   exactly `len` bytes are copied out of linear memory
//! - Argument and result regions are handed back to the guest deallocator
//!   (when it exports one) before the call returns
//!
//! No guest pointer outlives the call that produced it. The store lock is
//! held from the first allocation until the result has been copied out,
//! so no other call can touch guest memory in between.

use std::time::Instant;

use tracing::{debug, instrument, warn};
use uuid::Uuid;
use wasmtime::{Memory, Store, Val};

use grammar_bridge_common::{BridgeError, GuestAbiConfig};

use crate::GuestInstance;
use crate::exports::{ExportResolver, ExportedFunction, FuncSignature, ValKind};
use crate::instance::classify_call_error;
use crate::store::{HostContext, StoreHandle, arm_for_call, record_call};

/// A host-native argument of a guest call.
#[derive(Debug, Clone, Copy)]
pub enum HostValue<'a> {
    /// UTF-8 text, passed as `(ptr, len)`.
    Str(&'a str),
    /// Raw bytes, passed as `(ptr, len)`.
    Bytes(&'a [u8]),
    I32(i32),
    I64(i64),
}

impl HostValue<'_> {
    fn push_kinds(&self, kinds: &mut Vec<ValKind>) {
        match self {
            Self::Str(_) | Self::Bytes(_) => kinds.extend([ValKind::I32, ValKind::I32]),
            Self::I32(_) => kinds.push(ValKind::I32),
            Self::I64(_) => kinds.push(ValKind::I64),
        }
    }
}

/// How a guest function reports its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnConvention {
    /// No results.
    Unit,
    /// A single `i32` or `i64` status or length.
    Scalar,
    /// A single `i64` packing a `(ptr, len)` region of linear memory.
    PackedSlice,
}

/// A decoded guest return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestValue {
    Unit,
    I32(i32),
    I64(i64),
    /// Bytes copied out of guest memory.
    Bytes(Vec<u8>),
}

/// A region of guest linear memory.
///
/// Only meaningful during the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
}

impl GuestSlice {
    /// Split a packed `(ptr << 32) | len` return value.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn unpack(packed: i64) -> Self {
        let bits = packed as u64;
        Self {
            ptr: (bits >> 32) as u32,
            len: bits as u32,
        }
    }

    /// Pack into the `(ptr << 32) | len` representation.
    #[allow(clippy::cast_possible_wrap)]
    pub fn pack(self) -> i64 {
        ((u64::from(self.ptr) << 32) | u64::from(self.len)) as i64
    }

    /// Check the region lies inside a memory of `memory_size` bytes.
    fn check_bounds(self, memory_size: usize) -> Result<(), BridgeError> {
        let start = self.ptr as usize;
        match start.checked_add(self.len as usize) {
            Some(end) if end <= memory_size => Ok(()),
            _ => Err(BridgeError::marshal(format!(
                "region at {} of {} bytes lies outside guest memory of {memory_size} bytes",
                self.ptr, self.len
            ))),
        }
    }
}

/// A tagged result record produced by the grammar entry points.
///
/// Byte 0 is the tag, the rest is a UTF-8 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestRecord {
    /// The guest succeeded; payload is its output.
    Success(String),
    /// The guest reported a failure; payload is its diagnostic.
    Failure(String),
}

impl GuestRecord {
    pub const SUCCESS_TAG: u8 = 0;
    pub const FAILURE_TAG: u8 = 1;

    /// Decode a record copied out of guest memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| BridgeError::marshal("guest returned an empty result record"))?;

        let payload = std::str::from_utf8(payload)
            .map_err(|e| BridgeError::marshal(format!("result payload is not UTF-8: {e}")))?
            .to_string();

        match tag {
            Self::SUCCESS_TAG => Ok(Self::Success(payload)),
            Self::FAILURE_TAG => Ok(Self::Failure(payload)),
            other => Err(BridgeError::marshal(format!(
                "unknown result record tag {other}"
            ))),
        }
    }

    /// Encode into the wire layout. Used by hosts and tests that stand in
    /// for a guest.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Self::Success(p) => (Self::SUCCESS_TAG, p),
            Self::Failure(p) => (Self::FAILURE_TAG, p),
        };
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(tag);
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }
}

/// Encodes arguments into, and decodes results out of, one instance's
/// linear memory.
#[derive(Debug)]
pub struct CallMarshaller {
    instance_id: Uuid,
    memory: Memory,
    alloc: ExportedFunction,
    dealloc: Option<ExportedFunction>,
}

impl CallMarshaller {
    /// Resolve the memory and allocator exports named by `abi`.
    ///
    /// # Errors
    ///
    /// Fails if the memory or allocator is missing, or if any of them has
    /// the wrong type. A missing deallocator is allowed.
    #[instrument(skip_all, fields(instance_id = %instance.id()))]
    pub fn new(instance: &GuestInstance, abi: &GuestAbiConfig) -> Result<Self, BridgeError> {
        let memory = ExportResolver::resolve_memory(instance, &abi.memory)?;
        let alloc = ExportResolver::resolve(
            instance,
            &abi.alloc,
            &FuncSignature::new([ValKind::I32], [ValKind::I32]),
        )?;

        let dealloc = match &abi.dealloc {
            Some(name) => ExportResolver::resolve_optional(
                instance,
                name,
                &FuncSignature::new([ValKind::I32, ValKind::I32], []),
            )?,
            None => None,
        };

        if dealloc.is_none() {
            debug!("Guest exports no deallocator; argument regions are left to the guest");
        }

        Ok(Self {
            instance_id: instance.id(),
            memory,
            alloc,
            dealloc,
        })
    }

    /// Call `export` with `args`, decoding the result per `convention`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InstancePoisoned`] if an earlier call failed fatally
    /// - [`BridgeError::InstanceMismatch`] if `export` or this marshaller
    ///   belong to another instance
    /// - [`BridgeError::ExportSignatureMismatch`] if `args` or `convention`
    ///   do not fit the export's signature
    /// - [`BridgeError::Marshal`] on bounds or encoding violations
    /// - [`BridgeError::RuntimeTrap`], [`BridgeError::FuelExhausted`],
    ///   [`BridgeError::ExecutionTimeout`] if the guest call fails
    ///
    /// Errors that leave guest state untrustworthy poison the instance.
    #[instrument(skip_all, fields(export = %export.name()))]
    pub fn invoke(
        &self,
        instance: &mut GuestInstance,
        export: &ExportedFunction,
        args: &[HostValue<'_>],
        convention: ReturnConvention,
    ) -> Result<GuestValue, BridgeError> {
        self.check_owner(instance, Some(export))?;
        check_shape(export, args, convention)?;

        let handle = instance.store_handle().clone();
        let outcome = handle.with_store(|store| {
            let call = Call {
                marshaller: self,
                handle: &handle,
                store,
            };
            call.run(export, args, convention)
        });

        self.observe(instance, outcome)
    }

    /// Call an export that answers with a packed [`GuestRecord`].
    ///
    /// A record that cannot be decoded poisons the instance like any other
    /// marshalling failure.
    pub fn invoke_record(
        &self,
        instance: &mut GuestInstance,
        export: &ExportedFunction,
        args: &[HostValue<'_>],
    ) -> Result<GuestRecord, BridgeError> {
        let outcome = match self.invoke(instance, export, args, ReturnConvention::PackedSlice)? {
            GuestValue::Bytes(bytes) => GuestRecord::decode(&bytes),
            other => Err(BridgeError::marshal(format!(
                "expected a result record, got {other:?}"
            ))),
        };
        self.observe(instance, outcome)
    }

    /// Copy `bytes` into a freshly allocated guest region.
    pub fn encode(
        &self,
        instance: &mut GuestInstance,
        bytes: &[u8],
    ) -> Result<GuestSlice, BridgeError> {
        self.check_owner(instance, None)?;
        let handle = instance.store_handle().clone();
        let outcome = handle.with_store(|store| {
            Call {
                marshaller: self,
                handle: &handle,
                store,
            }
            .write(bytes)
        });
        self.observe(instance, outcome)
    }

    /// Copy the bytes of a guest region out of linear memory.
    pub fn decode(
        &self,
        instance: &mut GuestInstance,
        slice: GuestSlice,
    ) -> Result<Vec<u8>, BridgeError> {
        self.check_owner(instance, None)?;
        let handle = instance.store_handle().clone();
        let outcome = handle.with_store(|store| {
            Call {
                marshaller: self,
                handle: &handle,
                store,
            }
            .read(slice)
        });
        self.observe(instance, outcome)
    }

    /// Hand a region back to the guest deallocator, if there is one.
    pub fn release(
        &self,
        instance: &mut GuestInstance,
        slice: GuestSlice,
    ) -> Result<(), BridgeError> {
        self.check_owner(instance, None)?;
        let handle = instance.store_handle().clone();
        let outcome = handle.with_store(|store| {
            Call {
                marshaller: self,
                handle: &handle,
                store,
            }
            .free(slice)
        });
        self.observe(instance, outcome)
    }

    /// Returns `true` if the guest exports a deallocator.
    pub fn has_dealloc(&self) -> bool {
        self.dealloc.is_some()
    }

    fn check_owner(
        &self,
        instance: &GuestInstance,
        export: Option<&ExportedFunction>,
    ) -> Result<(), BridgeError> {
        if let Some(reason) = instance.poison_reason() {
            return Err(BridgeError::InstancePoisoned {
                reason: reason.to_string(),
            });
        }
        if self.instance_id != instance.id() {
            return Err(BridgeError::InstanceMismatch {
                name: self.alloc.name().to_string(),
            });
        }
        if let Some(export) = export {
            if export.instance_id() != instance.id() {
                return Err(BridgeError::InstanceMismatch {
                    name: export.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn observe<T>(
        &self,
        instance: &mut GuestInstance,
        outcome: Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        if let Err(e) = &outcome {
            if e.poisons_instance() {
                instance.poison(e.to_string());
            }
        }
        outcome
    }
}

/// Verify `args` and `convention` fit the export before touching the guest.
fn check_shape(
    export: &ExportedFunction,
    args: &[HostValue<'_>],
    convention: ReturnConvention,
) -> Result<(), BridgeError> {
    let mut params = Vec::with_capacity(args.len() * 2);
    for arg in args {
        arg.push_kinds(&mut params);
    }

    let results_fit = match convention {
        ReturnConvention::Unit => export.signature().results.is_empty(),
        ReturnConvention::Scalar => matches!(
            export.signature().results.as_slice(),
            [ValKind::I32 | ValKind::I64]
        ),
        ReturnConvention::PackedSlice => export.signature().results == [ValKind::I64],
    };

    if params != export.signature().params || !results_fit {
        return Err(BridgeError::ExportSignatureMismatch {
            name: export.name().to_string(),
            expected: format!("{} returning {convention:?}", FuncSignature::new(params, [])),
            actual: format!("func {}", export.signature()),
        });
    }
    Ok(())
}

/// One locked session with the store.
struct Call<'a> {
    marshaller: &'a CallMarshaller,
    handle: &'a StoreHandle,
    store: &'a mut Store<HostContext>,
}

impl Call<'_> {
    fn run(
        mut self,
        export: &ExportedFunction,
        args: &[HostValue<'_>],
        convention: ReturnConvention,
    ) -> Result<GuestValue, BridgeError> {
        let mut written = Vec::new();
        let result = self.call_with(export, args, convention, &mut written);

        match result {
            Ok(value) => {
                for slice in written {
                    self.free(slice)?;
                }
                Ok(value)
            }
            Err(e) if !e.poisons_instance() => {
                for slice in written {
                    if let Err(free_err) = self.free(slice) {
                        warn!(error = %free_err, "Failed to release argument region");
                    }
                }
                Err(e)
            }
            // Guest state is untrustworthy; do not call back into it
            Err(e) => Err(e),
        }
    }

    fn call_with(
        &mut self,
        export: &ExportedFunction,
        args: &[HostValue<'_>],
        convention: ReturnConvention,
        written: &mut Vec<GuestSlice>,
    ) -> Result<GuestValue, BridgeError> {
        let mut params = Vec::with_capacity(export.signature().params.len());
        for arg in args {
            match *arg {
                HostValue::Str(s) => self.push_region(s.as_bytes(), &mut params, written)?,
                HostValue::Bytes(b) => self.push_region(b, &mut params, written)?,
                HostValue::I32(v) => params.push(Val::I32(v)),
                HostValue::I64(v) => params.push(Val::I64(v)),
            }
        }

        let mut results = vec![Val::I32(0); export.signature().results.len()];
        self.call(export, &params, &mut results)?;

        match convention {
            ReturnConvention::Unit => Ok(GuestValue::Unit),
            ReturnConvention::Scalar => match results.first() {
                Some(Val::I32(v)) => Ok(GuestValue::I32(*v)),
                Some(Val::I64(v)) => Ok(GuestValue::I64(*v)),
                _ => Err(BridgeError::marshal("guest returned no scalar result")),
            },
            ReturnConvention::PackedSlice => {
                let packed = results
                    .first()
                    .and_then(Val::i64)
                    .ok_or_else(|| BridgeError::marshal("guest returned no packed slice"))?;
                let slice = GuestSlice::unpack(packed);
                let bytes = self.read(slice)?;
                self.free(slice)?;
                Ok(GuestValue::Bytes(bytes))
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn push_region(
        &mut self,
        bytes: &[u8],
        params: &mut Vec<Val>,
        written: &mut Vec<GuestSlice>,
    ) -> Result<(), BridgeError> {
        let slice = self.write(bytes)?;
        written.push(slice);
        params.push(Val::I32(slice.ptr as i32));
        params.push(Val::I32(slice.len as i32));
        Ok(())
    }

    fn call(
        &mut self,
        export: &ExportedFunction,
        params: &[Val],
        results: &mut [Val],
    ) -> Result<(), BridgeError> {
        let handle = self.handle;
        let engine = handle.engine();
        let execution = handle.execution();

        arm_for_call(self.store, engine, execution)?;
        let started = Instant::now();
        let result = export.func().call(&mut *self.store, params, results);
        record_call(self.store, engine, execution, started);

        result.map_err(|e| classify_call_error(&e, execution))?;

        debug!(
            export = export.name(),
            duration_us = started.elapsed().as_micros(),
            "Guest call returned"
        );
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    fn write(&mut self, bytes: &[u8]) -> Result<GuestSlice, BridgeError> {
        let len = i32::try_from(bytes.len()).map_err(|_| {
            BridgeError::marshal(format!(
                "argument of {} bytes exceeds the guest address space",
                bytes.len()
            ))
        })?;

        let marshaller = self.marshaller;
        let mut out = [Val::I32(0)];
        self.call(&marshaller.alloc, &[Val::I32(len)], &mut out)?;

        let ptr = out[0]
            .i32()
            .ok_or_else(|| BridgeError::marshal("allocator returned a non-i32 value"))?;
        if ptr < 0 {
            return Err(BridgeError::marshal(format!(
                "allocator returned negative pointer {ptr}"
            )));
        }

        let slice = GuestSlice {
            ptr: ptr as u32,
            len: len as u32,
        };
        let memory = marshaller.memory;
        slice.check_bounds(memory.data_size(&*self.store))?;

        memory
            .write(&mut *self.store, slice.ptr as usize, bytes)
            .map_err(|e| BridgeError::marshal(format!("write to guest memory failed: {e}")))?;

        Ok(slice)
    }

    fn read(&mut self, slice: GuestSlice) -> Result<Vec<u8>, BridgeError> {
        let memory = self.marshaller.memory;
        slice.check_bounds(memory.data_size(&*self.store))?;

        let mut bytes = vec![0u8; slice.len as usize];
        memory
            .read(&*self.store, slice.ptr as usize, &mut bytes)
            .map_err(|e| BridgeError::marshal(format!("read from guest memory failed: {e}")))?;
        Ok(bytes)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn free(&mut self, slice: GuestSlice) -> Result<(), BridgeError> {
        let marshaller = self.marshaller;
        let Some(dealloc) = &marshaller.dealloc else {
            return Ok(());
        };
        self.call(
            dealloc,
            &[Val::I32(slice.ptr as i32), Val::I32(slice.len as i32)],
            &mut [],
        )
    }
}
