//! Common types, errors, and configuration for grammar-bridge.
//!
//! This crate provides shared functionality used across the workspace:
//! - [`BridgeError`], the error taxonomy of the host/guest boundary
//! - Configuration structures for the engine, per-call limits and guest ABI
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    BridgeConfig, EngineConfig, ExecutionConfig, GrammarSlots, GuestAbiConfig, OptLevel,
};
pub use config_file::{ConfigFile, ConfigFileError, GrammarEntry};
pub use error::BridgeError;
