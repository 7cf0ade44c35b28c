//! Host functions offered to grammar-bridge guests.
//!
//! Grammar modules are sandboxed: they see exactly the imports placed on
//! their [`ImportSurface`](grammar_bridge_core::ImportSurface) and nothing
//! else. This crate provides the standard ones.
//!
//! # Imports
//!
//! - [`logging`]: `env.log(level, ptr, len)` for guest diagnostics
//! - [`linker`]: registration helpers, including WASI preview1 for guests
//!   built against a libc

pub mod linker;
pub mod logging;

pub use linker::{register_all, register_logging, register_wasi};
pub use logging::LoggingHost;
