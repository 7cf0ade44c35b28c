//! Store ownership and per-store host context.
//!
//! This module provides:
//! - [`SandboxStore`]: exclusive owner of a Wasmtime store and every guest
//!   memory allocated in it
//! - [`StoreHandle`]: a weak reference held by instances, so that use after
//!   the store is released fails with [`BridgeError::StoreReleased`]
//! - [`HostContext`]: state reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: structured logging from guest code
//! - [`CallMetrics`]: counters for guest calls made through the store

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use grammar_bridge_common::{BridgeError, ExecutionConfig};

/// State stored alongside guest instances in a Wasmtime store.
///
/// Host functions reach it through [`wasmtime::Caller::data_mut`].
pub struct HostContext {
    /// WASI preview1 context, only used when the import surface offers WASI.
    wasi: WasiP1Ctx,

    /// Resource limits enforced by the store limiter.
    limits: StoreLimits,

    /// Id of the owning store, for tracing.
    pub store_id: String,

    /// Most recent logs collected from guest code, oldest first.
    pub logs: VecDeque<LogEntry>,

    max_logs: usize,

    /// Guest call counters.
    pub metrics: CallMetrics,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Counters for guest calls made through one store.
#[derive(Debug, Clone, Default)]
pub struct CallMetrics {
    /// Number of guest calls, including allocator calls.
    pub calls: u64,

    /// Total fuel consumed across calls.
    pub fuel_consumed: u64,

    /// Duration of the most recent call.
    pub last_call: Option<Duration>,
}

impl CallMetrics {
    fn record(&mut self, fuel_consumed: u64, duration: Duration) {
        self.calls += 1;
        self.fuel_consumed = self.fuel_consumed.saturating_add(fuel_consumed);
        self.last_call = Some(duration);
    }
}

impl HostContext {
    /// Create a new host context for the store with the given id.
    pub fn new(store_id: String, config: &ExecutionConfig) -> Self {
        // Guests get stderr for panic messages and nothing else
        let wasi = WasiCtxBuilder::new().inherit_stderr().build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();

        Self {
            wasi,
            limits,
            store_id,
            logs: VecDeque::new(),
            max_logs: config.max_guest_logs,
            metrics: CallMetrics::default(),
        }
    }

    /// Add a log entry, dropping the oldest once the store's cap is reached.
    pub fn log(&mut self, level: LogLevel, message: String) {
        if self.max_logs == 0 {
            return;
        }
        while self.logs.len() >= self.max_logs {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Remove and return every retained log entry.
    pub fn take_logs(&mut self) -> Vec<LogEntry> {
        self.logs.drain(..).collect()
    }

    /// WASI preview1 context, for linking WASI imports.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// Exclusive owner of a Wasmtime store.
///
/// Every instance created in this store, and all of its linear memory,
/// lives until the store is released. Instances keep only a
/// [`StoreHandle`]; once the store is gone, their calls fail with
/// [`BridgeError::StoreReleased`].
///
/// All guest calls into the store are serialized by an internal mutex.
pub struct SandboxStore {
    id: Uuid,
    engine: WasmEngine,
    execution: ExecutionConfig,
    inner: Arc<Mutex<Store<HostContext>>>,
}

impl SandboxStore {
    /// Open a new store bound to `engine`.
    ///
    /// # Errors
    ///
    /// Returns an error if fuel cannot be set on the store.
    #[instrument(skip(engine, config))]
    pub fn new(engine: &WasmEngine, config: &ExecutionConfig) -> Result<Self, BridgeError> {
        let id = Uuid::new_v4();
        let context = HostContext::new(id.to_string(), config);
        let mut store = Store::new(engine.inner(), context);

        store.limiter(|ctx| &mut ctx.limits);
        arm_for_call(&mut store, engine, config)?;

        info!(store_id = %id, max_memory_mb = config.max_memory_mb, "Store opened");

        Ok(Self {
            id,
            engine: engine.clone(),
            execution: config.clone(),
            inner: Arc::new(Mutex::new(store)),
        })
    }

    /// Unique id of this store.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The engine this store is bound to.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Per-call execution limits applied to guest calls in this store.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Weak handle for objects that must not keep the store alive.
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            store_id: self.id,
            engine: self.engine.clone(),
            execution: self.execution.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Read the host context (guest logs, call metrics).
    pub fn with_context<R>(&self, f: impl FnOnce(&HostContext) -> R) -> R {
        let store = self.inner.lock();
        f(store.data())
    }

    /// Drain the guest logs collected so far.
    pub fn take_logs(&self) -> Vec<LogEntry> {
        self.inner.lock().data_mut().take_logs()
    }

    /// Release the store and everything allocated in it.
    pub fn release(self) {
        debug!(store_id = %self.id, "Store released");
        drop(self);
    }
}

impl std::fmt::Debug for SandboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxStore")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Non-owning reference to a [`SandboxStore`].
#[derive(Clone)]
pub struct StoreHandle {
    store_id: Uuid,
    engine: WasmEngine,
    execution: ExecutionConfig,
    inner: Weak<Mutex<Store<HostContext>>>,
}

impl StoreHandle {
    /// Id of the referenced store.
    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    /// Engine of the referenced store.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Per-call execution limits of the referenced store.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Returns `true` once the store has been released.
    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Run `f` with exclusive access to the store.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StoreReleased`] if the store no longer exists,
    /// otherwise whatever `f` returns.
    pub fn with_store<R>(
        &self,
        f: impl FnOnce(&mut Store<HostContext>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        let store = self.inner.upgrade().ok_or(BridgeError::StoreReleased)?;
        let mut guard = store.lock();
        f(&mut guard)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store_id", &self.store_id)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Refuel the store and reset its epoch deadline ahead of a guest call.
pub(crate) fn arm_for_call(
    store: &mut Store<HostContext>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<(), BridgeError> {
    if engine.is_fuel_enabled() {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| BridgeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    if engine.is_epoch_enabled() {
        store.set_epoch_deadline(config.epoch_deadline_ticks(engine.config()));
    }

    Ok(())
}

/// Record a finished guest call in the store's metrics.
pub(crate) fn record_call(
    store: &mut Store<HostContext>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
    started: Instant,
) {
    let fuel_consumed = if engine.is_fuel_enabled() {
        config
            .max_fuel
            .saturating_sub(store.get_fuel().unwrap_or(0))
    } else {
        0
    };
    store
        .data_mut()
        .metrics
        .record(fuel_consumed, started.elapsed());
}
