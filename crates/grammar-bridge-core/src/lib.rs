//! Wasmtime embedding layer for grammar-bridge.
//!
//! This crate owns every step between guest bytes and a typed guest call:
//! - [`WasmEngine`]: Configured Wasmtime engine (fuel, epochs, allocator)
//! - [`SandboxStore`]: Isolated state container that owns all instance state
//! - [`CompiledModule`]: Validated guest module with its export/import surface
//! - [`GuestInstance`]: A module bound to a store through an [`ImportSurface`]
//! - [`ExportResolver`]: Name-based, signature-checked export lookup
//! - [`CallMarshaller`]: Copies arguments and results across guest memory
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe, owns the epoch ticker)           │
//! └─────────────────────────────────────────────────────────┘
//!              │                              │
//!              ▼                              ▼
//! ┌──────────────────────────┐  ┌──────────────────────────┐
//! │      CompiledModule      │  │       SandboxStore       │
//! │  (Immutable, shareable)  │  │  (Fuel, limits, logs)    │
//! └──────────────────────────┘  └──────────────────────────┘
//!              │                              │
//!              └──────────────┬───────────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            GuestInstance (+ ImportSurface)              │
//! │  - Resolved exports                                     │
//! │  - Poisoned after a fatal call failure                  │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        ExportResolver  →  CallMarshaller                │
//! │  (ptr/len arguments, packed slice results)              │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod exports;
pub mod instance;
pub mod marshal;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use exports::{ExportDescriptor, ExportResolver, ExportedFunction, FuncSignature, ValKind};
pub use instance::{GuestInstance, ImportSurface};
pub use marshal::{CallMarshaller, GuestRecord, GuestSlice, GuestValue, HostValue, ReturnConvention};
pub use module::CompiledModule;
pub use store::{CallMetrics, HostContext, LogEntry, LogLevel, SandboxStore, StoreHandle};
