//! Root supervisor.
//!
//! Owns every core service and worker for the daemon's lifetime. There are
//! no global singletons: the HTTP surface receives this supervisor and
//! reaches services through it. Teardown cancels the root token and joins
//! every worker with a grace period.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::invalidation::InvalidationRouter;
use crate::cache::{MetricsCache, spawn_janitor};
use crate::events::{ChangeDetector, EventBus};
use crate::operations::AsyncOperationManager;
use crate::probes::ShellCommandRunner;
use crate::ratelimit::RateLimiter;
use crate::scheduler::CollectorScheduler;
use crate::scheduler::collectors::{ProbeSet, register_defaults};

/// Detector cadence; one diff pass per second across all domains.
const DETECTOR_INTERVAL: Duration = Duration::from_secs(1);

/// Operation-registry cleanup cadence.
const OPERATION_JANITOR_INTERVAL: Duration = Duration::from_secs(300);

/// Rate-limit buckets idle longer than this are dropped.
const BUCKET_IDLE_FOR: Duration = Duration::from_secs(3600);

const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: uma_config::Config,
    cache: Arc<MetricsCache>,
    bus: EventBus,
    probes: Arc<ProbeSet>,
    scheduler: Arc<CollectorScheduler>,
    detector: Arc<ChangeDetector>,
    router: Arc<InvalidationRouter>,
    operations: Arc<AsyncOperationManager>,
    rate_limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("collectors", &self.scheduler.worker_count())
            .field("workers", &self.workers.lock().len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Supervisor {
    pub fn new(config: uma_config::Config) -> Self {
        let shutdown = CancellationToken::new();
        let cache = Arc::new(MetricsCache::from_settings(&config.cache));
        let bus = EventBus::new(crate::events::bus::DEFAULT_QUEUE_CAPACITY);

        let runner = Arc::new(ShellCommandRunner::default());
        let probes = Arc::new(ProbeSet::from_config(&config.probes, runner));

        let scheduler = Arc::new(CollectorScheduler::new(
            cache.clone(),
            Some(probes.system.clone()),
            config.scheduler.adaptive,
            shutdown.child_token(),
        ));
        let detector = Arc::new(ChangeDetector::new(
            cache.clone(),
            bus.clone(),
            DETECTOR_INTERVAL,
        ));
        let router = Arc::new(InvalidationRouter::with_default_wiring(cache.clone()));
        let operations = Arc::new(AsyncOperationManager::new(
            bus.clone(),
            &config.operations,
            shutdown.child_token(),
        ));
        let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limit));

        Self {
            config,
            cache,
            bus,
            probes,
            scheduler,
            detector,
            router,
            operations,
            rate_limiter,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register the default collector set and spawn every background worker.
    pub fn start(&self) -> crate::Result<()> {
        register_defaults(&self.scheduler, &self.probes, &self.config.scheduler)?;

        let mut workers = self.workers.lock();
        workers.push(spawn_janitor(
            self.cache.clone(),
            Duration::from_secs(self.config.cache.janitor_interval_secs),
            self.shutdown.child_token(),
        ));
        workers.push(
            self.detector
                .clone()
                .spawn(self.shutdown.child_token()),
        );
        workers.push(
            self.router
                .clone()
                .spawn(self.bus.clone(), self.shutdown.child_token()),
        );
        workers.push(
            self.operations
                .spawn_janitor(OPERATION_JANITOR_INTERVAL, self.shutdown.child_token()),
        );
        workers.push(self.spawn_bucket_sweep(self.shutdown.child_token()));

        info!(
            collectors = self.scheduler.worker_count(),
            "core services started"
        );
        Ok(())
    }

    fn spawn_bucket_sweep(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self.rate_limiter.clone();
        let interval = Duration::from_secs(self.config.cache.janitor_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep_idle(BUCKET_IDLE_FOR);
                    }
                }
            }
        })
    }

    /// Cancel every worker and join them before returning.
    pub async fn shutdown(&self) {
        info!("core services stopping");
        self.shutdown.cancel();

        self.scheduler.stop().await;
        self.operations.stop().await;

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if tokio::time::timeout(STOP_GRACE, worker).await.is_err() {
                warn!("worker did not stop within grace period");
            }
        }

        self.bus.shutdown();
        info!("core services stopped");
    }

    pub fn config(&self) -> &uma_config::Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetricsCache> {
        &self.cache
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<CollectorScheduler> {
        &self.scheduler
    }

    pub fn operations(&self) -> &Arc<AsyncOperationManager> {
        &self.operations
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn probes(&self) -> &Arc<ProbeSet> {
        &self.probes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_shutdown_leaves_no_workers() {
        let mut config = uma_config::Config::default();
        // Point file probes at an empty directory; collectors degrade
        // gracefully and the lifecycle is what is under test.
        let dir = tempfile::tempdir().unwrap();
        config.probes.proc_root = dir.path().display().to_string();

        let supervisor = Supervisor::new(config);
        supervisor.start().unwrap();
        assert!(supervisor.scheduler().worker_count() > 0);

        supervisor.shutdown().await;
        assert_eq!(supervisor.scheduler().worker_count(), 0);
        assert_eq!(supervisor.workers.lock().len(), 0);
    }
}
