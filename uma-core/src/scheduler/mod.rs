//! Adaptive collector scheduling.
//!
//! One independent worker per registered metric: a slow probe never blocks
//! another. Each cycle runs the collector, writes the result to the cache
//! with TTL = 2 × the current interval (one missed cycle is tolerated),
//! records timing against the priority's target, and re-reads the adaptive
//! interval, rebuilding its ticker when the cadence changed.

pub mod adaptive;
pub mod collectors;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::error::ProbeError;
use crate::types::Namespace;

use self::adaptive::{AdaptivePolicy, PressureSignal, PressureSource};

/// Grace period when joining workers on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Soft per-cycle latency target; overruns are logged, not fatal.
    pub fn target_time(&self) -> Duration {
        match self {
            Self::High => Duration::from_millis(10),
            Self::Medium => Duration::from_millis(30),
            Self::Low => Duration::from_millis(100),
        }
    }
}

/// A metric producer driven by the scheduler.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self) -> Result<Value, ProbeError>;
}

/// Static description of one registered metric.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub namespace: Namespace,
    pub key: String,
    pub interval: Duration,
    pub priority: Priority,
}

/// Live status of a registration, reported by `/system/health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectorStatus {
    pub name: String,
    pub priority: Priority,
    pub interval_secs: f64,
    pub runs: u64,
    pub error_streak: u32,
    pub overruns: u64,
    pub last_duration_ms: u64,
    pub last_run: Option<i64>,
    pub last_success: Option<i64>,
}

struct RegistrationState {
    spec: Registration,
    collector: Arc<dyn Collector>,
    current_interval_ms: AtomicU64,
    error_streak: AtomicU32,
    runs: AtomicU64,
    overruns: AtomicU64,
    last_duration_ms: AtomicU64,
    last_run_unix: AtomicI64,
    last_success_unix: AtomicI64,
    /// Set once the first cycle has produced a cached value; the read
    /// surface primes cold keys only before this point.
    produced: AtomicBool,
    /// Serializes `run_once` with itself for this registration.
    priming: tokio::sync::Mutex<()>,
}

impl RegistrationState {
    fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_interval_ms.load(Ordering::Relaxed))
    }

    fn status(&self) -> CollectorStatus {
        let last_run = self.last_run_unix.load(Ordering::Relaxed);
        let last_success = self.last_success_unix.load(Ordering::Relaxed);
        CollectorStatus {
            name: self.spec.name.clone(),
            priority: self.spec.priority,
            interval_secs: self.current_interval().as_secs_f64(),
            runs: self.runs.load(Ordering::Relaxed),
            error_streak: self.error_streak.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            last_run: (last_run != 0).then_some(last_run),
            last_success: (last_success != 0).then_some(last_success),
        }
    }
}

pub struct CollectorScheduler {
    cache: Arc<MetricsCache>,
    pressure: Option<Arc<dyn PressureSource>>,
    adaptive: bool,
    registrations: RwLock<HashMap<String, Arc<RegistrationState>>>,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CollectorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorScheduler")
            .field("registrations", &self.registrations.read().len())
            .field("workers", &self.workers.lock().len())
            .field("adaptive", &self.adaptive)
            .finish()
    }
}

impl CollectorScheduler {
    pub fn new(
        cache: Arc<MetricsCache>,
        pressure: Option<Arc<dyn PressureSource>>,
        adaptive: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            pressure,
            adaptive,
            registrations: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Register a metric and spawn its worker. Registering an existing name
    /// is rejected; every active registration has exactly one worker.
    pub fn register(
        self: &Arc<Self>,
        spec: Registration,
        collector: Arc<dyn Collector>,
    ) -> crate::Result<()> {
        let name = spec.name.clone();
        let state = Arc::new(RegistrationState {
            current_interval_ms: AtomicU64::new(spec.interval.as_millis() as u64),
            spec,
            collector,
            error_streak: AtomicU32::new(0),
            runs: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            last_duration_ms: AtomicU64::new(0),
            last_run_unix: AtomicI64::new(0),
            last_success_unix: AtomicI64::new(0),
            produced: AtomicBool::new(false),
            priming: tokio::sync::Mutex::new(()),
        });

        {
            let mut registrations = self.registrations.write();
            if registrations.contains_key(&name) {
                return Err(crate::CoreError::Internal(format!(
                    "collector {name} is already registered"
                )));
            }
            registrations.insert(name.clone(), state.clone());
        }

        let handle = self.clone().spawn_worker(state);
        self.workers.lock().push((name, handle));
        Ok(())
    }

    fn spawn_worker(
        self: Arc<Self>,
        state: Arc<RegistrationState>,
    ) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let name = state.spec.name.clone();
            debug!(collector = %name, "collector worker started");

            let mut interval = state.current_interval();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(collector = %name, "collector worker stopping");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                self.run_cycle(&state).await;

                let next = self.next_interval(&state).await;
                if next != interval {
                    debug!(
                        collector = %name,
                        from_secs = interval.as_secs_f64(),
                        to_secs = next.as_secs_f64(),
                        "adaptive interval changed"
                    );
                    state
                        .current_interval_ms
                        .store(next.as_millis() as u64, Ordering::Relaxed);
                    interval = next;
                    ticker = tokio::time::interval(next);
                    ticker
                        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    // Consume the rebuilt ticker's immediate first tick.
                    ticker.tick().await;
                }
            }
        })
    }

    /// One collect-and-cache cycle for a registration.
    async fn run_cycle(&self, state: &RegistrationState) {
        let _guard = state.priming.lock().await;
        let started = Instant::now();
        let result = state.collector.collect().await;
        let elapsed = started.elapsed();

        state.runs.fetch_add(1, Ordering::Relaxed);
        state
            .last_run_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        state
            .last_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);

        let target = state.spec.priority.target_time();
        if elapsed > target {
            state.overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                collector = %state.spec.name,
                elapsed_ms = elapsed.as_millis() as u64,
                target_ms = target.as_millis() as u64,
                "collector cycle overran its target time"
            );
        }

        match result {
            Ok(value) => {
                // TTL covers two cycles so one missed probe keeps the
                // previous value visible.
                let ttl = state.current_interval() * 2;
                self.cache.set_with_ttl(
                    state.spec.namespace,
                    &state.spec.key,
                    value,
                    ttl,
                );
                state.error_streak.store(0, Ordering::Relaxed);
                state
                    .last_success_unix
                    .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                state.produced.store(true, Ordering::Release);
            }
            Err(err) => {
                let streak = state.error_streak.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    collector = %state.spec.name,
                    error = %err,
                    streak,
                    "collector probe failed; previous cached value remains"
                );
            }
        }
    }

    async fn next_interval(&self, state: &RegistrationState) -> Duration {
        if !self.adaptive {
            return state.spec.interval;
        }

        let pressure = match &self.pressure {
            Some(source) => source.sample().await,
            None => None,
        };
        let age = self
            .cache
            .last_access_age(state.spec.namespace, &state.spec.key);

        AdaptivePolicy::interval_for(
            state.spec.interval,
            age,
            state.current_interval(),
            pressure,
            state.error_streak.load(Ordering::Relaxed),
        )
    }

    /// Run a registration's collector immediately if it has never produced a
    /// value, so a cold read can be served. Returns whether a value is now
    /// expected in the cache.
    pub async fn prime(&self, namespace: Namespace, key: &str) -> bool {
        let state = {
            let registrations = self.registrations.read();
            registrations
                .values()
                .find(|s| s.spec.namespace == namespace && s.spec.key == key)
                .cloned()
        };
        let Some(state) = state else {
            return false;
        };

        if state.produced.load(Ordering::Acquire) {
            // The scheduler has produced before; a miss now means the value
            // expired and the next cycle will refresh it.
            return false;
        }
        self.run_cycle(&state).await;
        state.produced.load(Ordering::Acquire)
    }

    /// Run one registration's cycle immediately, by name.
    pub async fn run_once(&self, name: &str) -> crate::Result<()> {
        let state = self
            .registrations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                crate::CoreError::Internal(format!("no collector named {name}"))
            })?;
        self.run_cycle(&state).await;
        Ok(())
    }

    pub fn statuses(&self) -> Vec<CollectorStatus> {
        let mut statuses: Vec<CollectorStatus> = self
            .registrations
            .read()
            .values()
            .map(|state| state.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Cancel workers and join them with a grace period.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<(String, JoinHandle<()>)> =
            self.workers.lock().drain(..).collect();
        for (name, handle) in workers {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!(collector = %name, "worker did not stop within grace period");
            }
        }
        info!("collector scheduler stopped");
    }
}

/// The system probe doubles as the scheduler's pressure source.
#[async_trait]
impl PressureSource for crate::probes::system::SystemProbe {
    async fn sample(&self) -> Option<PressureSignal> {
        match self.pressure().await {
            Ok((load_per_cpu, memory_used)) => Some(PressureSignal {
                load_per_cpu,
                memory_used,
            }),
            Err(err) => {
                debug!(error = %err, "pressure sample unavailable");
                None
            }
        }
    }
}
