//! Configuration structures for grammar-bridge.
//!
//! This module defines configuration options for various components:
//! - [`BridgeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (code generation, metering)
//! - [`ExecutionConfig`]: Per-call limits (fuel, timeout, memory)
//! - [`GuestAbiConfig`]: Export names of the guest calling convention

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Guest calling convention.
    #[serde(default)]
    pub abi: GuestAbiConfig,
}

/// Cranelift optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimizations, fastest compilation.
    None,
    /// Optimize for execution speed.
    #[default]
    Speed,
    /// Optimize for speed and code size.
    SpeedAndSize,
}

/// Wasmtime engine configuration.
///
/// These settings are process-wide for every store created from the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator.
    ///
    /// Only pays off when many instances are created; one long-lived
    /// instance per process does not need it.
    #[serde(default)]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Cranelift optimization level.
    #[serde(default)]
    pub opt_level: OptLevel,

    /// Enable fuel metering.
    ///
    /// When enabled, every guest call is limited by
    /// [`ExecutionConfig::max_fuel`].
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Enable epoch-based interruption.
    ///
    /// When enabled, a background ticker advances the engine epoch and every
    /// guest call is limited by [`ExecutionConfig::timeout_ms`].
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Milliseconds between epoch increments.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: false,
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            opt_level: OptLevel::default(),
            fuel_metering: defaults::fuel_metering(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-call execution configuration.
///
/// Apart from `max_guest_logs`, these settings apply to each individual
/// guest call, not to the lifetime of a store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fuel granted to each guest call.
    ///
    /// Compiling a large grammar inside the guest can take tens of
    /// millions of instructions.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Wall-clock budget of each guest call in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Guest log entries kept per store; the oldest are dropped first.
    #[serde(default = "defaults::max_guest_logs")]
    pub max_guest_logs: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            max_guest_logs: defaults::max_guest_logs(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }

    /// Number of epoch ticks a call may run for, given the tick interval.
    pub fn epoch_deadline_ticks(&self, engine: &EngineConfig) -> u64 {
        (self.timeout_ms / engine.epoch_tick_ms.max(1)).max(1)
    }
}

/// Export names making up the guest calling convention.
///
/// The grammar engine module exposes a linear memory, an allocator, and
/// the two grammar entry points. Names are configurable so that modules
/// built with different toolchains can be driven without recompiling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestAbiConfig {
    /// Exported linear memory.
    #[serde(default = "defaults::memory_export")]
    pub memory: String,

    /// `(len: i32) -> i32` allocator.
    #[serde(default = "defaults::alloc_export")]
    pub alloc: String,

    /// Optional `(ptr: i32, len: i32)` deallocator.
    #[serde(default = "defaults::dealloc_export")]
    pub dealloc: Option<String>,

    /// `(text_ptr, text_len) -> i64` grammar compilation entry point.
    #[serde(default = "defaults::compile_export")]
    pub compile: String,

    /// `(name_ptr, name_len, input_ptr, input_len) -> i64` parse entry point.
    #[serde(default = "defaults::parse_export")]
    pub parse: String,

    /// How many compiled grammars the guest keeps at once.
    #[serde(default)]
    pub grammar_slots: GrammarSlots,
}

/// Grammar retention of the guest engine.
///
/// A single-slot guest replaces its one compiled grammar on every compile,
/// so only the most recently compiled name can be parsed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarSlots {
    /// Each compile evicts the previous grammar.
    #[default]
    Single,
    /// Every compiled grammar stays available under its own name.
    PerName,
}

impl Default for GuestAbiConfig {
    fn default() -> Self {
        Self {
            memory: defaults::memory_export(),
            alloc: defaults::alloc_export(),
            dealloc: defaults::dealloc_export(),
            compile: defaults::compile_export(),
            parse: defaults::parse_export(),
            grammar_slots: GrammarSlots::default(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn max_fuel() -> u64 {
        100_000_000
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn max_guest_logs() -> usize {
        1_024
    }

    pub fn memory_export() -> String {
        "memory".to_string()
    }

    pub fn alloc_export() -> String {
        "alloc".to_string()
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn dealloc_export() -> Option<String> {
        Some("dealloc".to_string())
    }

    pub fn compile_export() -> String {
        "compile_grammar".to_string()
    }

    pub fn parse_export() -> String {
        "parse_input".to_string()
    }
}
