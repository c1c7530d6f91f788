//! Latency measurement for the trading system's critical paths.
//!
//! A [`LatencyRegistry`] hands out named [`LatencyTracker`]s. Each tracker
//! folds start/end pairs into running aggregates (min, max, sum, count) and
//! optionally keeps a bounded sample buffer for percentile queries. The
//! registry is an explicit handle owned by the coordinator and passed to the
//! components that measure; there is no process-global state.
//!
//! The registry lock is taken only to register a tracker. Every other
//! operation goes through the tracker's own lock, so concurrent callers on
//! different trackers never contend.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

/// Default bound on the per-tracker sample buffer.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// Token returned by [`LatencyTracker::start`], consumed by
/// [`LatencyTracker::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartToken(u64);

#[derive(Debug)]
struct TrackerInner {
    starts: HashMap<u64, Instant>,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u128,
    count: u64,
    store_samples: bool,
    max_samples: usize,
    samples: Vec<u64>,
}

/// A single named latency histogram.
#[derive(Debug)]
pub struct LatencyTracker {
    name: String,
    next_id: AtomicU64,
    inner: Mutex<TrackerInner>,
}

impl LatencyTracker {
    fn new(name: &str, store_samples: bool, max_samples: usize) -> Self {
        Self {
            name: name.to_string(),
            next_id: AtomicU64::new(0),
            inner: Mutex::new(TrackerInner {
                starts: HashMap::new(),
                min_ns: u64::MAX,
                max_ns: 0,
                sum_ns: 0,
                count: 0,
                store_samples,
                max_samples,
                samples: Vec::new(),
            }),
        }
    }

    /// Tracker name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin a measurement.
    pub fn start(&self) -> StartToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.starts.insert(id, now);
        StartToken(id)
    }

    /// Complete a measurement started with [`start`](Self::start).
    ///
    /// An unknown token is logged and ignored.
    pub fn end(&self, token: StartToken) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let Some(started) = inner.starts.remove(&token.0) else {
            warn!(tracker = %self.name, token = token.0, "no start time recorded for token");
            return;
        };
        let delta_ns = now.duration_since(started).as_nanos().min(u64::MAX as u128) as u64;
        inner.min_ns = inner.min_ns.min(delta_ns);
        inner.max_ns = inner.max_ns.max(delta_ns);
        inner.sum_ns += delta_ns as u128;
        inner.count += 1;
        if inner.store_samples && inner.samples.len() < inner.max_samples {
            inner.samples.push(delta_ns);
        }
    }

    /// Scoped measurement: `end` runs when the guard drops, on every exit
    /// path including unwind.
    pub fn timer(self: &Arc<Self>) -> ScopedTimer {
        ScopedTimer {
            tracker: self.clone(),
            token: Some(self.start()),
        }
    }

    /// Owned snapshot of the current aggregates and samples.
    pub fn snapshot(&self) -> LatencySnapshot {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        LatencySnapshot {
            name: self.name.clone(),
            count: inner.count,
            min_ns: if inner.count == 0 { 0 } else { inner.min_ns },
            max_ns: inner.max_ns,
            sum_ns: inner.sum_ns,
            store_samples: inner.store_samples,
            samples: inner.samples.clone(),
        }
    }

    /// Zero the aggregates and clear samples. The tracker stays registered
    /// and keeps its sample-storage settings.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.min_ns = u64::MAX;
        inner.max_ns = 0;
        inner.sum_ns = 0;
        inner.count = 0;
        inner.samples.clear();
    }
}

/// Drop guard created by [`LatencyTracker::timer`].
#[derive(Debug)]
pub struct ScopedTimer {
    tracker: Arc<LatencyTracker>,
    token: Option<StartToken>,
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.tracker.end(token);
        }
    }
}

/// Point-in-time view of one tracker's aggregates.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    pub name: String,
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub sum_ns: u128,
    pub store_samples: bool,
    pub samples: Vec<u64>,
}

impl LatencySnapshot {
    pub fn avg_ns(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ns as f64 / self.count as f64
        }
    }

    pub fn avg_us(&self) -> f64 {
        self.avg_ns() / 1_000.0
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_ns() / 1_000_000.0
    }

    /// Percentile over the stored samples with linear interpolation.
    /// Returns 0.0 when the buffer is empty.
    pub fn percentile_ns(&self, percentile: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let index = percentile * (sorted.len() - 1) as f64 / 100.0;
        let lower = index.floor() as usize;
        let upper = index.ceil() as usize;
        if lower == upper {
            return sorted[lower] as f64;
        }
        let weight = index - lower as f64;
        sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
    }
}

/// Map of named trackers. Cheap to clone a handle via `Arc`.
#[derive(Debug, Default)]
pub struct LatencyRegistry {
    trackers: Mutex<HashMap<String, Arc<LatencyTracker>>>,
}

impl LatencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tracker registered under `name`, creating it atomically if
    /// absent. The storage settings only apply on creation.
    pub fn get_tracker(
        &self,
        name: &str,
        store_samples: bool,
        max_samples: usize,
    ) -> Arc<LatencyTracker> {
        let mut trackers = self.trackers.lock().expect("registry lock poisoned");
        trackers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LatencyTracker::new(name, store_samples, max_samples)))
            .clone()
    }

    /// Sample-storing tracker with the default buffer bound.
    pub fn tracker(&self, name: &str) -> Arc<LatencyTracker> {
        self.get_tracker(name, true, DEFAULT_MAX_SAMPLES)
    }

    /// Snapshots of every registered tracker, sorted by name.
    pub fn snapshots(&self) -> Vec<LatencySnapshot> {
        let trackers = self.trackers.lock().expect("registry lock poisoned");
        let mut snapshots: Vec<LatencySnapshot> =
            trackers.values().map(|t| t.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset every registered tracker.
    pub fn reset_all(&self) {
        let trackers = self.trackers.lock().expect("registry lock poisoned");
        for tracker in trackers.values() {
            tracker.reset();
        }
    }

    /// Render all trackers as CSV, one row per tracker. Percentile columns
    /// are `N/A` when the tracker stores no samples.
    pub fn to_csv_string(&self) -> String {
        let mut out = String::from(
            "Operation,Count,Min (ns),Max (ns),Avg (ns),Avg (us),Avg (ms),P50 (ns),P90 (ns),P99 (ns)\n",
        );
        for snapshot in self.snapshots() {
            let _ = write!(
                out,
                "{},{},{},{},{:.3},{:.3},{:.3},",
                snapshot.name,
                snapshot.count,
                snapshot.min_ns,
                snapshot.max_ns,
                snapshot.avg_ns(),
                snapshot.avg_us(),
                snapshot.avg_ms(),
            );
            if snapshot.samples.is_empty() {
                out.push_str("N/A,N/A,N/A\n");
            } else {
                let _ = writeln!(
                    out,
                    "{:.3},{:.3},{:.3}",
                    snapshot.percentile_ns(50.0),
                    snapshot.percentile_ns(90.0),
                    snapshot.percentile_ns(99.0),
                );
            }
        }
        out
    }

    /// Write the CSV rendering to `path`.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn aggregates_fold_start_end_pairs() {
        let registry = LatencyRegistry::new();
        let tracker = registry.tracker("op");

        for _ in 0..5 {
            let token = tracker.start();
            thread::sleep(Duration::from_micros(50));
            tracker.end(token);
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 5);
        assert_eq!(snapshot.samples.len(), 5);
        assert!(snapshot.min_ns > 0);
        assert!(snapshot.min_ns as f64 <= snapshot.avg_ns());
        assert!(snapshot.avg_ns() <= snapshot.max_ns as f64);
    }

    #[test]
    fn get_tracker_returns_same_instance() {
        let registry = LatencyRegistry::new();
        let a = registry.tracker("same");
        let b = registry.tracker("same");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn percentile_interpolates_between_samples() {
        let snapshot = LatencySnapshot {
            name: "p".into(),
            count: 4,
            min_ns: 100,
            max_ns: 400,
            sum_ns: 1_000,
            store_samples: true,
            samples: vec![100, 200, 300, 400],
        };
        assert_eq!(snapshot.percentile_ns(0.0), 100.0);
        assert_eq!(snapshot.percentile_ns(100.0), 400.0);
        // index 1.5 -> halfway between 200 and 300
        assert_eq!(snapshot.percentile_ns(50.0), 250.0);
        // index 2.7 -> 300 + 0.7 * 100
        assert!((snapshot.percentile_ns(90.0) - 370.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_of_empty_buffer_is_zero() {
        let registry = LatencyRegistry::new();
        let tracker = registry.get_tracker("no_samples", false, 0);
        let token = tracker.start();
        tracker.end(token);
        assert_eq!(tracker.snapshot().percentile_ns(99.0), 0.0);
    }

    #[test]
    fn sample_buffer_is_bounded() {
        let registry = LatencyRegistry::new();
        let tracker = registry.get_tracker("bounded", true, 3);
        for _ in 0..10 {
            let token = tracker.start();
            tracker.end(token);
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 10);
        assert_eq!(snapshot.samples.len(), 3);
    }

    #[test]
    fn reset_clears_aggregates_but_keeps_registration() {
        let registry = LatencyRegistry::new();
        let tracker = registry.tracker("resettable");
        let token = tracker.start();
        tracker.end(token);
        assert_eq!(tracker.snapshot().count, 1);

        tracker.reset();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.min_ns, 0);
        assert!(snapshot.samples.is_empty());
        assert!(Arc::ptr_eq(&tracker, &registry.tracker("resettable")));
    }

    #[test]
    fn end_with_unknown_token_is_ignored() {
        let registry = LatencyRegistry::new();
        let tracker = registry.tracker("unknown_token");
        tracker.end(StartToken(999));
        assert_eq!(tracker.snapshot().count, 0);
    }

    #[test]
    fn scoped_timer_records_on_drop() {
        let registry = LatencyRegistry::new();
        let tracker = registry.tracker("scoped");
        {
            let _timer = tracker.timer();
        }
        assert_eq!(tracker.snapshot().count, 1);
    }

    #[test]
    fn scoped_timer_records_on_unwind() {
        let registry = Arc::new(LatencyRegistry::new());
        let tracker = registry.tracker("unwind");
        let t = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _timer = t.timer();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(tracker.snapshot().count, 1);
    }

    #[test]
    fn csv_marks_sampleless_trackers_na() {
        let registry = LatencyRegistry::new();
        let sampled = registry.get_tracker("sampled", true, 16);
        let unsampled = registry.get_tracker("bare", false, 0);
        for tracker in [&sampled, &unsampled] {
            let token = tracker.start();
            tracker.end(token);
        }

        let csv = registry.to_csv_string();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Operation,Count,Min (ns),Max (ns),Avg (ns),Avg (us),Avg (ms),P50 (ns),P90 (ns),P99 (ns)"
        );
        let bare = lines.next().unwrap();
        assert!(bare.starts_with("bare,1,"));
        assert!(bare.ends_with("N/A,N/A,N/A"));
        let sampled_row = lines.next().unwrap();
        assert!(sampled_row.starts_with("sampled,1,"));
        assert!(!sampled_row.contains("N/A"));
    }

    #[test]
    fn concurrent_measurements_are_all_counted() {
        let registry = Arc::new(LatencyRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                let tracker = registry.tracker("parallel");
                for _ in 0..100 {
                    let token = tracker.start();
                    tracker.end(token);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.tracker("parallel").snapshot().count, 400);
    }
}
