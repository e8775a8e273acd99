//! Per-client request admission.
//!
//! Token-window buckets keyed by `(client_id, operation class)`. Windows
//! reset at the boundary rather than sliding: bucket state is one counter
//! and one instant, and over-burst at window edges is an accepted trade.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Request cost classes. Each class has an independent budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    General,
    HealthCheck,
    Bulk,
    Expensive,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::HealthCheck => "health_check",
            Self::Bulk => "bulk",
            Self::Expensive => "expensive",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassBudget {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Admission decision with the retry hint for denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

pub struct RateLimiter {
    budgets: HashMap<OperationClass, ClassBudget>,
    buckets: Mutex<HashMap<(String, OperationClass), Bucket>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.buckets.lock().len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(budgets: HashMap<OperationClass, ClassBudget>) -> Self {
        Self {
            budgets,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &uma_config::RateLimitSettings) -> Self {
        let mut budgets = HashMap::new();
        budgets.insert(
            OperationClass::General,
            ClassBudget {
                limit: settings.general_limit,
                window: Duration::from_secs(settings.general_window_secs),
            },
        );
        budgets.insert(
            OperationClass::HealthCheck,
            ClassBudget {
                limit: settings.health_limit,
                window: Duration::from_secs(settings.health_window_secs),
            },
        );
        budgets.insert(
            OperationClass::Bulk,
            ClassBudget {
                limit: settings.bulk_limit,
                window: Duration::from_secs(settings.bulk_window_secs),
            },
        );
        budgets.insert(
            OperationClass::Expensive,
            ClassBudget {
                limit: settings.expensive_limit,
                window: Duration::from_secs(settings.expensive_window_secs),
            },
        );
        Self::new(budgets)
    }

    /// Admit or deny one request.
    pub fn check(&self, client_id: &str, class: OperationClass) -> Admission {
        let Some(budget) = self.budgets.get(&class).copied() else {
            // No configured budget means the class is unmetered.
            return Admission::Allowed;
        };
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((client_id.to_string(), class))
            .or_insert(Bucket {
                window_start: now,
                count: 0,
            });

        if now.duration_since(bucket.window_start) >= budget.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count < budget.limit {
            bucket.count += 1;
            Admission::Allowed
        } else {
            let elapsed = now.duration_since(bucket.window_start);
            let retry_after = budget.window.saturating_sub(elapsed);
            debug!(
                client = client_id,
                class = class.as_str(),
                "rate limit exceeded"
            );
            Admission::Denied { retry_after }
        }
    }

    /// Convenience wrapper for callers that only need the boolean.
    pub fn allow(&self, client_id: &str, class: OperationClass) -> bool {
        self.check(client_id, class).is_allowed()
    }

    /// Drop buckets idle long enough that their window has long passed.
    /// Called from a periodic sweep; bucket state is cheap but unbounded
    /// client ids are not.
    pub fn sweep_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.window_start) < idle_for
        });
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}
