//! Adaptive interval policy.
//!
//! Each collector's interval is its base interval scaled by
//! `clamp(f_activity × f_pressure × f_error, 0.5, 4.0)`: idle metrics and a
//! stressed host stretch the cadence, actively-read metrics on a calm host
//! compress it. Factor calibration:
//!
//! - activity: 0.5 when the cache key was read within one interval, 1.0 when
//!   read within the idle window, 2.0 beyond it
//! - pressure: stepped on 1-minute load per cpu (0.75 / 1.5) and memory
//!   used (80 % / 90 %)
//! - error: `1 + 0.5 × min(streak, 6)`

use std::time::Duration;

use async_trait::async_trait;

/// Floor of the combined factor: the cadence never compresses below half the
/// base interval.
pub const MIN_FACTOR: f64 = 0.5;
/// Ceiling of the combined factor: the cadence never stretches past 4× base.
pub const MAX_FACTOR: f64 = 4.0;

/// A key untouched for longer than this counts as idle.
pub const IDLE_WINDOW: Duration = Duration::from_secs(300);

const LOAD_STRESSED: f64 = 0.75;
const LOAD_CRITICAL: f64 = 1.5;
const MEMORY_STRESSED: f64 = 0.80;
const MEMORY_CRITICAL: f64 = 0.90;

/// Host pressure sample: 1-minute load average per cpu and the used-memory
/// fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSignal {
    pub load_per_cpu: f64,
    pub memory_used: f64,
}

/// Source of the global pressure signal. Implemented by the system probe;
/// faked in tests.
#[async_trait]
pub trait PressureSource: Send + Sync {
    /// `None` when the sample could not be taken; treated as calm.
    async fn sample(&self) -> Option<PressureSignal>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptivePolicy;

impl AdaptivePolicy {
    /// How recently readers touched the key, relative to the collector's own
    /// cadence.
    pub fn activity_factor(
        last_access_age: Option<Duration>,
        interval: Duration,
    ) -> f64 {
        match last_access_age {
            Some(age) if age <= interval => 0.5,
            Some(age) if age <= IDLE_WINDOW => 1.0,
            _ => 2.0,
        }
    }

    pub fn pressure_factor(signal: Option<PressureSignal>) -> f64 {
        let Some(signal) = signal else {
            return 1.0;
        };
        if signal.load_per_cpu >= LOAD_CRITICAL
            || signal.memory_used >= MEMORY_CRITICAL
        {
            2.0
        } else if signal.load_per_cpu >= LOAD_STRESSED
            || signal.memory_used >= MEMORY_STRESSED
        {
            1.5
        } else {
            1.0
        }
    }

    pub fn error_factor(error_streak: u32) -> f64 {
        1.0 + 0.5 * error_streak.min(6) as f64
    }

    pub fn combined_factor(activity: f64, pressure: f64, error: f64) -> f64 {
        (activity * pressure * error).clamp(MIN_FACTOR, MAX_FACTOR)
    }

    /// The interval a collector should use next cycle.
    pub fn interval_for(
        base: Duration,
        last_access_age: Option<Duration>,
        current_interval: Duration,
        pressure: Option<PressureSignal>,
        error_streak: u32,
    ) -> Duration {
        let factor = Self::combined_factor(
            Self::activity_factor(last_access_age, current_interval),
            Self::pressure_factor(pressure),
            Self::error_factor(error_streak),
        );
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(10);

    fn calm() -> Option<PressureSignal> {
        Some(PressureSignal {
            load_per_cpu: 0.2,
            memory_used: 0.4,
        })
    }

    #[test]
    fn hot_key_on_calm_host_compresses_to_floor() {
        let interval = AdaptivePolicy::interval_for(
            BASE,
            Some(Duration::from_secs(2)),
            BASE,
            calm(),
            0,
        );
        assert_eq!(interval, Duration::from_secs(5));
    }

    #[test]
    fn idle_key_under_critical_pressure_hits_ceiling() {
        let interval = AdaptivePolicy::interval_for(
            BASE,
            None,
            BASE,
            Some(PressureSignal {
                load_per_cpu: 2.0,
                memory_used: 0.95,
            }),
            6,
        );
        // 2.0 × 2.0 × 4.0 = 16, clamped to 4×.
        assert_eq!(interval, Duration::from_secs(40));
    }

    #[test]
    fn recent_but_not_hot_key_keeps_base() {
        let interval = AdaptivePolicy::interval_for(
            BASE,
            Some(Duration::from_secs(60)),
            BASE,
            calm(),
            0,
        );
        assert_eq!(interval, BASE);
    }

    #[test]
    fn error_streak_backs_off_and_saturates() {
        assert_eq!(AdaptivePolicy::error_factor(0), 1.0);
        assert_eq!(AdaptivePolicy::error_factor(2), 2.0);
        assert_eq!(AdaptivePolicy::error_factor(6), 4.0);
        assert_eq!(AdaptivePolicy::error_factor(100), 4.0);
    }

    #[test]
    fn stressed_steps_are_ordered() {
        let calm_f = AdaptivePolicy::pressure_factor(calm());
        let stressed = AdaptivePolicy::pressure_factor(Some(PressureSignal {
            load_per_cpu: 1.0,
            memory_used: 0.5,
        }));
        let critical = AdaptivePolicy::pressure_factor(Some(PressureSignal {
            load_per_cpu: 0.1,
            memory_used: 0.95,
        }));
        assert_eq!(calm_f, 1.0);
        assert_eq!(stressed, 1.5);
        assert_eq!(critical, 2.0);
    }

    #[test]
    fn missing_pressure_sample_is_calm() {
        assert_eq!(AdaptivePolicy::pressure_factor(None), 1.0);
    }

    #[test]
    fn combined_factor_is_clamped_both_ways() {
        assert_eq!(AdaptivePolicy::combined_factor(0.5, 1.0, 1.0), 0.5);
        assert_eq!(AdaptivePolicy::combined_factor(0.1, 1.0, 1.0), 0.5);
        assert_eq!(AdaptivePolicy::combined_factor(2.0, 2.0, 4.0), 4.0);
    }
}
