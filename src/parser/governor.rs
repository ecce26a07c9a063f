// Resource governor.
//
// Samples CPU and memory at most every 2 s and maps them to a concurrency
// multiplier: stressed systems throttle to 0.3x, idle systems boost to
// 2.5x. Under SARI_TEST_MODE the sample interval drops to zero so tests
// observe transitions immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::System;

pub struct ResourceGovernor {
    inner: Mutex<GovernorState>,
    check_interval: Duration,
}

struct GovernorState {
    sys: System,
    cached_factor: f64,
    last_check: Option<Instant>,
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceGovernor {
    pub fn new() -> Self {
        let check_interval = if std::env::var("SARI_TEST_MODE").as_deref() == Ok("1") {
            Duration::ZERO
        } else {
            Duration::from_secs(2)
        };
        Self {
            inner: Mutex::new(GovernorState {
                sys: System::new(),
                cached_factor: 1.0,
                last_check: None,
            }),
            check_interval,
        }
    }

    /// Concurrency multiplier: 0.3 stressed, 2.5 idle, 1.0 otherwise.
    pub fn concurrency_factor(&self) -> f64 {
        let mut state = self.inner.lock().unwrap();
        if let Some(last) = state.last_check {
            if last.elapsed() < self.check_interval {
                return state.cached_factor;
            }
        }
        state.sys.refresh_cpu_usage();
        state.sys.refresh_memory();
        let cpu = state.sys.global_cpu_usage() as f64;
        let total_mem = state.sys.total_memory() as f64;
        let mem = if total_mem > 0.0 {
            state.sys.used_memory() as f64 / total_mem * 100.0
        } else {
            0.0
        };

        let factor = classify(cpu, mem);
        state.cached_factor = factor;
        state.last_check = Some(Instant::now());
        factor
    }

    /// Worker count for a base size under the current factor, clamped to
    /// at least one.
    pub fn scale_workers(&self, base: usize) -> usize {
        ((base as f64 * self.concurrency_factor()).round() as usize).max(1)
    }
}

fn classify(cpu_percent: f64, mem_percent: f64) -> f64 {
    if cpu_percent > 90.0 || mem_percent > 90.0 {
        0.3
    } else if cpu_percent < 20.0 && mem_percent < 40.0 {
        2.5
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_bands() {
        assert_eq!(classify(95.0, 10.0), 0.3);
        assert_eq!(classify(10.0, 95.0), 0.3);
        assert_eq!(classify(10.0, 30.0), 2.5);
        assert_eq!(classify(50.0, 50.0), 1.0);
        assert_eq!(classify(19.9, 39.9), 2.5);
    }

    #[test]
    fn scale_workers_never_drops_to_zero() {
        let governor = ResourceGovernor::new();
        assert!(governor.scale_workers(1) >= 1);
        assert!(governor.scale_workers(4) >= 1);
    }
}
