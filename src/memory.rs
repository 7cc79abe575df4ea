// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod cgroup;
mod meminfo;
mod smaps;

use std::cmp;
use std::fmt;
use std::time::Duration;

use log::info;
use log::warn;

pub use self::cgroup::cgroup_memory_limit_bytes;
pub use self::meminfo::system_memory_bytes;
pub use self::meminfo::MemInfo;
pub use self::smaps::process_memory_bytes;
use crate::log_rate;
use crate::sched::PeriodicTaskRunner;

// Name under which the sampling task is scheduled on the runner.
const MONITOR_TASK_NAME: &str = "MemoryMonitor.CheckIsMemoryUsageAboveThreshold";

/// Point-in-time memory accounting for the whole node. Assembled fresh on
/// every sampling tick and discarded after the update callback returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemorySnapshot {
    /// Machine-wide used memory; `None` when the kernel counters were
    /// unreadable or inconsistent.
    pub heap_used_bytes: Option<u64>,
    /// Usage reported by the external subsystem (e.g. an object cache).
    pub object_store_used_bytes: u64,
    /// Effective capacity: the system total, lowered to the cgroup ceiling
    /// when one actually constrains the node.
    pub total_bytes: Option<u64>,
}

impl MemorySnapshot {
    /// Combined usage. `None` while the heap side is unknown, since a sum
    /// over an unknown quantity is itself unknown.
    pub fn total_used_bytes(&self) -> Option<u64> {
        self.heap_used_bytes
            .map(|heap| heap + self.object_store_used_bytes)
    }
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap used bytes: {}, object store used bytes: {}, total bytes: {}",
            unknown_or(self.heap_used_bytes),
            self.object_store_used_bytes,
            unknown_or(self.total_bytes)
        )
    }
}

fn unknown_or(value: Option<u64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "unknown".to_string(),
    }
}

/// Receives each tick's verdict: whether usage is above the threshold, the
/// snapshot it was computed from, and the configured usage fraction.
///
/// Called synchronously on the sampling task, once per tick and never
/// concurrently with itself. It must not block for long or it delays
/// subsequent ticks; expensive reactions belong on their own executor.
pub type MemoryUpdateCallback = Box<dyn FnMut(bool, &MemorySnapshot, f64) + Send>;

/// Supplies the externally tracked used bytes folded into each snapshot.
pub type ObjectStoreUsageFetcher = Box<dyn FnMut() -> u64 + Send>;

/// Monitor configuration, validated once at startup and immutable after.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Fraction of effective total memory above which usage counts as
    /// pressure. Must be within [0, 1].
    pub usage_threshold: f64,
    /// Absolute headroom to keep free. `None` disables the absolute bound.
    pub max_overhead_bytes: Option<u64>,
    /// Sampling cadence. Zero permanently disables sampling.
    pub interval: Duration,
}

/// Periodically samples node memory usage and reports threshold crossings
/// to the update callback.
pub struct MemoryMonitor {
    usage_threshold: f64,
    max_overhead_bytes: Option<u64>,
}

impl MemoryMonitor {
    /// Validates `config` and, on Linux with a non-zero interval, schedules
    /// periodic sampling on `runner`. With a zero interval the monitor is
    /// permanently disabled; on other operating systems sampling is skipped
    /// with a warning, since only Linux exposes the counters it reads.
    ///
    /// # Panics
    ///
    /// When `config.usage_threshold` is outside [0, 1].
    pub fn start(
        config: MonitorConfig,
        mut on_update: MemoryUpdateCallback,
        mut fetch_object_store_used: ObjectStoreUsageFetcher,
        runner: &dyn PeriodicTaskRunner,
    ) -> Self {
        assert!(
            (0.0..=1.0).contains(&config.usage_threshold),
            "usage threshold {} outside [0, 1]",
            config.usage_threshold
        );
        let monitor = Self {
            usage_threshold: config.usage_threshold,
            max_overhead_bytes: config.max_overhead_bytes,
        };
        if config.interval.is_zero() {
            info!("Memory monitor disabled. Configure a sampling interval > 0 to enable it.");
            return monitor;
        }
        if !cfg!(target_os = "linux") {
            warn!("Not sampling memory. Only Linux exposes the counters the monitor reads.");
            return monitor;
        }
        let sampler = Self {
            usage_threshold: config.usage_threshold,
            max_overhead_bytes: config.max_overhead_bytes,
        };
        runner.run_periodically(
            MONITOR_TASK_NAME,
            config.interval,
            Box::new(move || {
                let (used_bytes, total_bytes) = memory_bytes();
                let snapshot = MemorySnapshot {
                    heap_used_bytes: used_bytes,
                    object_store_used_bytes: fetch_object_store_used(),
                    total_bytes,
                };
                let above = sampler.is_usage_above_threshold(&snapshot);
                on_update(above, &snapshot, sampler.usage_threshold);
            }),
        );
        info!("Memory monitor sampling every {:?}", config.interval);
        monitor
    }

    /// Whether `snapshot` exceeds the configured threshold. Unknown readings
    /// fail open: pressure is never signaled from an indeterminate sample.
    pub fn is_usage_above_threshold(&self, snapshot: &MemorySnapshot) -> bool {
        let (Some(total_bytes), Some(heap_used_bytes)) =
            (snapshot.total_bytes, snapshot.heap_used_bytes)
        else {
            if log_rate::should_log("snapshot_unknown") {
                warn!(
                    "Unable to capture node memory; usage above threshold will not be detected."
                );
            }
            return false;
        };
        let threshold_bytes =
            memory_threshold_bytes(total_bytes, self.usage_threshold, self.max_overhead_bytes);
        let total_used_bytes = heap_used_bytes + snapshot.object_store_used_bytes;
        let above = total_used_bytes > threshold_bytes;
        if above {
            info!(
                "Node memory usage above threshold, heap used: {}, object store used: {}, \
                 total used: {}, threshold: {}, system total: {}",
                heap_used_bytes,
                snapshot.object_store_used_bytes,
                total_used_bytes,
                threshold_bytes,
                total_bytes
            );
        }
        above
    }
}

/// One sampling pass over the kernel's accounting: machine-wide used bytes
/// and the effective total in bytes, either side `None` when unreadable.
pub fn memory_bytes() -> (Option<u64>, Option<u64>) {
    let (system_used_bytes, system_total_bytes) = meminfo::system_memory_bytes();
    // A cgroup ceiling only matters when it actually constrains the node: an
    // unset limit, or one above the physical total, leaves the system total
    // in charge.
    let total_bytes = nullable_min(system_total_bytes, cgroup::cgroup_memory_limit_bytes());
    // Used bytes always come from the system counters. The cgroup's own
    // accounting includes reclaimable cache and buffers, which do not
    // predict when the kernel OOM killer fires.
    (system_used_bytes, total_bytes)
}

/// Minimum over optional quantities: `None` is absent, not zero.
pub fn nullable_min(left: Option<u64>, right: Option<u64>) -> Option<u64> {
    match (left, right) {
        (Some(left), Some(right)) => Some(cmp::min(left, right)),
        (Some(left), None) => Some(left),
        (None, right) => right,
    }
}

/// Byte threshold above which usage counts as memory pressure: the larger
/// of the fractional bound and, when an overhead budget is configured, the
/// total minus that budget. Taking the larger is deliberate; the monitor
/// alarms only past the less conservative of the two bounds.
///
/// # Panics
///
/// When `usage_fraction` is outside [0, 1] or the overhead budget exceeds
/// the total; both are configuration contract violations.
pub fn memory_threshold_bytes(
    total_bytes: u64,
    usage_fraction: f64,
    max_overhead_bytes: Option<u64>,
) -> u64 {
    assert!(
        (0.0..=1.0).contains(&usage_fraction),
        "usage fraction {} outside [0, 1]",
        usage_fraction
    );
    let fraction_threshold_bytes = (total_bytes as f64 * usage_fraction) as u64;
    match max_overhead_bytes {
        Some(overhead_bytes) => {
            let absolute_threshold_bytes =
                total_bytes.checked_sub(overhead_bytes).unwrap_or_else(|| {
                    panic!(
                        "overhead budget {} exceeds total memory {}",
                        overhead_bytes, total_bytes
                    )
                });
            cmp::max(fraction_threshold_bytes, absolute_threshold_bytes)
        }
        None => fraction_threshold_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Stand-in runner for monitors that must never schedule sampling.
    struct FailRunner;

    impl PeriodicTaskRunner for FailRunner {
        fn run_periodically(
            &self,
            _name: &'static str,
            _interval: Duration,
            _task: Box<dyn FnMut() + Send>,
        ) {
            panic!("expected monitor to not run");
        }
    }

    fn disabled_monitor(usage_threshold: f64, max_overhead_bytes: Option<u64>) -> MemoryMonitor {
        MemoryMonitor::start(
            MonitorConfig {
                usage_threshold,
                max_overhead_bytes,
                interval: Duration::ZERO,
            },
            Box::new(|_, _, _| panic!("expected monitor to not run")),
            Box::new(|| 0),
            &FailRunner,
        )
    }

    fn snapshot(
        heap_used_bytes: Option<u64>,
        object_store_used_bytes: u64,
        total_bytes: Option<u64>,
    ) -> MemorySnapshot {
        MemorySnapshot {
            heap_used_bytes,
            object_store_used_bytes,
            total_bytes,
        }
    }

    #[test]
    fn test_threshold_zero_is_always_above() {
        let monitor = disabled_monitor(0.0, None);
        assert!(monitor.is_usage_above_threshold(&snapshot(Some(1), 0, Some(10))));
    }

    #[test]
    fn test_threshold_zero_with_full_overhead_budget() {
        // total = 10, overhead = 10: the threshold collapses to 0 and a
        // single used byte already registers.
        let monitor = disabled_monitor(0.0, Some(10));
        assert!(monitor.is_usage_above_threshold(&snapshot(Some(1), 0, Some(10))));
    }

    #[test]
    fn test_threshold_one_is_never_above_below_total() {
        let monitor = disabled_monitor(1.0, None);
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(9), 0, Some(10))));
    }

    #[test]
    fn test_usage_at_threshold_is_not_above() {
        let monitor = disabled_monitor(0.5, None);
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(4), 0, Some(10))));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(2), 2, Some(10))));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(0), 4, Some(10))));

        // The comparison is strictly greater-than: exactly at the threshold
        // is not above it.
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(5), 0, Some(10))));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(2), 3, Some(10))));

        assert!(monitor.is_usage_above_threshold(&snapshot(Some(6), 0, Some(10))));
        assert!(monitor.is_usage_above_threshold(&snapshot(Some(3), 3, Some(10))));
        assert!(monitor.is_usage_above_threshold(&snapshot(Some(0), 6, Some(10))));
    }

    #[test]
    fn test_zero_overhead_budget_raises_threshold_to_total() {
        let monitor = disabled_monitor(0.5, Some(0));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(9), 0, Some(10))));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(10), 0, Some(10))));
        assert!(monitor.is_usage_above_threshold(&snapshot(Some(11), 0, Some(10))));
    }

    #[test]
    fn test_unknown_readings_fail_open() {
        let monitor = disabled_monitor(0.0, None);
        assert!(!monitor.is_usage_above_threshold(&snapshot(None, 5, Some(10))));
        assert!(!monitor.is_usage_above_threshold(&snapshot(Some(5), 5, None)));
        assert!(!monitor.is_usage_above_threshold(&snapshot(None, 5, None)));
    }

    #[test]
    #[should_panic(expected = "usage threshold")]
    fn test_out_of_range_threshold_is_fatal() {
        let _ = disabled_monitor(1.1, None);
    }

    #[test]
    fn test_memory_threshold_takes_the_greater_bound() {
        assert_eq!(memory_threshold_bytes(100, 0.5, Some(0)), 100);
        assert_eq!(memory_threshold_bytes(100, 0.5, Some(60)), 50);

        assert_eq!(memory_threshold_bytes(100, 1.0, Some(10)), 100);
        assert_eq!(memory_threshold_bytes(100, 1.0, Some(100)), 100);

        assert_eq!(memory_threshold_bytes(100, 0.1, Some(100)), 10);
        assert_eq!(memory_threshold_bytes(100, 0.0, Some(10)), 90);
        assert_eq!(memory_threshold_bytes(100, 0.0, Some(100)), 0);

        assert_eq!(memory_threshold_bytes(100, 0.0, None), 0);
        assert_eq!(memory_threshold_bytes(100, 0.5, None), 50);
        assert_eq!(memory_threshold_bytes(100, 1.0, None), 100);
    }

    #[test]
    #[should_panic(expected = "exceeds total memory")]
    fn test_overhead_budget_beyond_total_is_fatal() {
        let _ = memory_threshold_bytes(100, 0.5, Some(150));
    }

    #[test]
    fn test_nullable_min() {
        assert_eq!(nullable_min(None, Some(4)), Some(4));
        assert_eq!(nullable_min(Some(4), None), Some(4));
        assert_eq!(nullable_min(Some(3), Some(4)), Some(3));
        assert_eq!(nullable_min(Some(4), Some(3)), Some(3));
        assert_eq!(nullable_min(None, None), None);
    }

    #[test]
    fn test_snapshot_total_used_bytes() {
        assert_eq!(snapshot(Some(3), 4, Some(10)).total_used_bytes(), Some(7));
        assert_eq!(snapshot(None, 4, Some(10)).total_used_bytes(), None);
    }

    #[test]
    fn test_snapshot_display_spells_out_unknowns() {
        assert_eq!(
            snapshot(Some(3), 4, None).to_string(),
            "heap used bytes: 3, object store used bytes: 4, total bytes: unknown"
        );
        assert_eq!(
            snapshot(None, 0, Some(10)).to_string(),
            "heap used bytes: unknown, object store used bytes: 0, total bytes: 10"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_bytes_live() {
        let (used_bytes, total_bytes) = memory_bytes();
        assert!(used_bytes.is_some());
        assert!(total_bytes.is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_periodic_sampling_invokes_callback() {
        use crate::sched::TokioTaskRunner;

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let runner = TokioTaskRunner::new();
        let _monitor = MemoryMonitor::start(
            MonitorConfig {
                usage_threshold: 1.0,
                max_overhead_bytes: None,
                interval: Duration::from_millis(1),
            },
            Box::new(move |above, snapshot, usage_threshold| {
                let _ = sender.send((above, *snapshot, usage_threshold));
            }),
            Box::new(|| 0),
            &runner,
        );
        let (_, snapshot, usage_threshold) = receiver.recv().await.unwrap();
        assert_eq!(usage_threshold, 1.0);
        assert!(snapshot.total_bytes.unwrap() > 0);
        assert!(snapshot.heap_used_bytes.unwrap() > 0);
    }
}
