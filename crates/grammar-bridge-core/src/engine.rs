//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the bridge. It is:
//! - Created once and shared by every store opened from it
//! - Configured for blocking calls only (no async support)
//! - Set up with fuel metering and epoch interruption for bounding guest calls

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use grammar_bridge_common::{BridgeError, EngineConfig, OptLevel};

/// Thread-safe WebAssembly engine wrapper.
///
/// Holds no per-call state. Cloning is cheap and every clone refers to the
/// same underlying engine; identity is what matters for compatibility
/// between modules, stores and import surfaces.
///
/// # Configuration
///
/// - **Fuel Metering**: deterministic CPU limit per guest call
/// - **Epoch Interruption**: wall-clock limit per guest call, driven by a
///   background ticker thread owned by the engine
/// - **Pooling Allocator**: optional, for hosts that create many instances
///
/// # Example
///
/// ```ignore
/// use grammar_bridge_common::EngineConfig;
/// use grammar_bridge_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
    ticker: Option<Arc<EpochTicker>>,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be started
    pub fn new(config: &EngineConfig) -> Result<Self, BridgeError> {
        let mut wasmtime_config = Config::new();

        // Guest calls are blocking from the host's perspective
        wasmtime_config.async_support(false);

        wasmtime_config.consume_fuel(config.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);

        wasmtime_config.cranelift_opt_level(match config.opt_level {
            OptLevel::None => wasmtime::OptLevel::None,
            OptLevel::Speed => wasmtime::OptLevel::Speed,
            OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        });

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            BridgeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let ticker = if config.epoch_interruption {
            let ticker = EpochTicker::spawn(engine.clone(), config.epoch_tick())?;
            debug!(tick_ms = config.epoch_tick_ms, "Epoch ticker started");
            Some(Arc::new(ticker))
        } else {
            None
        };

        info!(
            opt_level = ?config.opt_level,
            fuel_metering = config.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
            ticker,
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns `true` if `other` is the same underlying engine.
    pub fn same(&self, other: &Engine) -> bool {
        Engine::same(&self.engine, other)
    }

    /// Returns `true` if guest calls are fuel metered.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    /// Returns `true` if guest calls are bounded by epoch deadlines.
    pub fn is_epoch_enabled(&self) -> bool {
        self.ticker.is_some()
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("opt_level", &self.config.opt_level)
            .field("fuel_metering", &self.config.fuel_metering)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("pooling_allocator", &self.config.pooling_allocator)
            .finish_non_exhaustive()
    }
}

/// Background thread advancing the engine epoch at a fixed interval.
///
/// Stops when the last [`WasmEngine`] clone is dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, interval: Duration) -> Result<Self, BridgeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("grammar-bridge-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| {
                BridgeError::invalid_config(format!("Failed to start epoch ticker: {e}"))
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config).unwrap();

        assert!(engine.is_fuel_enabled());
        assert!(engine.is_epoch_enabled());
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_pooling() {
        let config = EngineConfig {
            pooling_allocator: true,
            max_instances: 4,
            instance_memory_mb: 16,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();

        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_without_metering() {
        let config = EngineConfig {
            fuel_metering: false,
            epoch_interruption: false,
            opt_level: OptLevel::None,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();

        assert!(!engine.is_fuel_enabled());
        assert!(!engine.is_epoch_enabled());
    }

    #[test]
    fn test_engine_identity() {
        let config = EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        };
        let a = WasmEngine::new(&config).unwrap();
        let b = WasmEngine::new(&config).unwrap();
        let a_clone = a.clone();

        assert!(a.same(a_clone.inner()));
        assert!(!a.same(b.inner()));
    }

    #[test]
    fn test_engine_drop_stops_ticker() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let clone = engine.clone();
        drop(engine);
        assert!(clone.is_epoch_enabled());
        // Dropping the last clone joins the ticker thread; must not hang.
        drop(clone);
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("fuel_metering"));
    }
}
