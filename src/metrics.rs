//! Per-stage throughput counters.
//!
//! A [`MetricsRecorder`] belongs to one execution context. It maps each stage
//! name to three monotonically increasing counters (`records.in`,
//! `records.out`, `records.error`). Counters are atomics, so partitions and
//! concurrent drivers can share one recorder without lost updates.
//!
//! Lifecycle: [`MetricsRecorder::reset`] at the start of an execution,
//! [`MetricsRecorder::flush`] to hand deltas to a [`MetricsPublisher`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// The three counters kept per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    In,
    Out,
    Error,
}

impl CounterKind {
    pub const ALL: [CounterKind; 3] = [CounterKind::In, CounterKind::Out, CounterKind::Error];

    /// Metric suffix, e.g. `records.out`.
    pub fn metric_name(self) -> &'static str {
        match self {
            CounterKind::In => "records.in",
            CounterKind::Out => "records.out",
            CounterKind::Error => "records.error",
        }
    }

    fn index(self) -> usize {
        match self {
            CounterKind::In => 0,
            CounterKind::Out => 1,
            CounterKind::Error => 2,
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

/// Backend that receives flushed counter deltas.
///
/// Delivery only needs to be eventually durable; no acknowledgement is
/// expected.
pub trait MetricsPublisher: Send + Sync {
    fn publish(&self, stage: &str, kind: CounterKind, delta: u64);
}

/// Publisher that writes each delta as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl MetricsPublisher for LogPublisher {
    fn publish(&self, stage: &str, kind: CounterKind, delta: u64) {
        info!(stage, metric = kind.metric_name(), delta, "stage metric");
    }
}

#[derive(Debug, Default)]
struct StageCounters {
    current: [AtomicU64; 3],
    published: [AtomicU64; 3],
}

/// Point-in-time copy of one stage's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub records_error: u64,
}

/// Counter table for one execution context.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    stages: DashMap<String, Arc<StageCounters>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for one stage. Handles stay valid across [`reset`](Self::reset).
    pub fn stage(&self, name: &str) -> StageMetrics {
        let counters = self
            .stages
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        StageMetrics {
            name: Arc::from(name),
            counters,
        }
    }

    pub fn increment(&self, stage: &str, kind: CounterKind, delta: u64) {
        self.stage(stage).increment(kind, delta);
    }

    /// Current value of one counter; zero for stages never seen.
    pub fn get(&self, stage: &str, kind: CounterKind) -> u64 {
        self.stages
            .get(stage)
            .map(|counters| counters.current[kind.index()].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Look up a counter by its full metric name, e.g. `sink1.records.out`.
    pub fn count(&self, metric: &str) -> u64 {
        CounterKind::ALL
            .iter()
            .find_map(|&kind| {
                metric
                    .strip_suffix(kind.metric_name())
                    .and_then(|rest| rest.strip_suffix('.'))
                    .map(|stage| self.get(stage, kind))
            })
            .unwrap_or(0)
    }

    /// Copy of every stage's counters, ordered by stage name.
    pub fn snapshot(&self) -> BTreeMap<String, StageSnapshot> {
        self.stages
            .iter()
            .map(|entry| {
                let load = |kind: CounterKind| entry.value().current[kind.index()].load(Ordering::Relaxed);
                (
                    entry.key().clone(),
                    StageSnapshot {
                        records_in: load(CounterKind::In),
                        records_out: load(CounterKind::Out),
                        records_error: load(CounterKind::Error),
                    },
                )
            })
            .collect()
    }

    /// Zero every counter. Called at the start of an execution context.
    pub fn reset(&self) {
        for entry in self.stages.iter() {
            for i in 0..3 {
                entry.value().current[i].store(0, Ordering::Relaxed);
                entry.value().published[i].store(0, Ordering::Relaxed);
            }
        }
    }

    /// Publish every non-zero delta since the previous flush.
    ///
    /// Returns the number of `(stage, kind, delta)` tuples published.
    pub fn flush(&self, publisher: &dyn MetricsPublisher) -> usize {
        let mut published = 0;
        for entry in self.stages.iter() {
            for kind in CounterKind::ALL {
                let i = kind.index();
                let current = entry.value().current[i].load(Ordering::Relaxed);
                let previous = entry.value().published[i].swap(current, Ordering::Relaxed);
                if current > previous {
                    publisher.publish(entry.key(), kind, current - previous);
                    published += 1;
                }
            }
        }
        published
    }
}

/// Counter handle bound to one stage name.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    name: Arc<str>,
    counters: Arc<StageCounters>,
}

impl StageMetrics {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn increment(&self, kind: CounterKind, delta: u64) {
        self.counters.current[kind.index()].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, kind: CounterKind) -> u64 {
        self.counters.current[kind.index()].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct RecordingPublisher {
        tuples: Mutex<Vec<(String, CounterKind, u64)>>,
    }

    impl MetricsPublisher for RecordingPublisher {
        fn publish(&self, stage: &str, kind: CounterKind, delta: u64) {
            self.tuples.lock().push((stage.to_string(), kind, delta));
        }
    }

    #[test]
    fn test_unknown_stage_reads_zero() {
        let metrics = MetricsRecorder::new();
        assert_eq!(metrics.get("missing", CounterKind::In), 0);
        assert_eq!(metrics.count("missing.records.out"), 0);
    }

    #[test]
    fn test_count_by_metric_name() {
        let metrics = MetricsRecorder::new();
        metrics.increment("my.sink", CounterKind::Out, 3);
        metrics.increment("my.sink", CounterKind::Error, 1);
        assert_eq!(metrics.count("my.sink.records.out"), 3);
        assert_eq!(metrics.count("my.sink.records.error"), 1);
        assert_eq!(metrics.count("my.sink.records.in"), 0);
        assert_eq!(metrics.count("records.out"), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    let stage = metrics.stage("hot");
                    for _ in 0..10_000 {
                        stage.increment(CounterKind::In, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get("hot", CounterKind::In), 80_000);
    }

    #[test]
    fn test_reset_keeps_handles_live() {
        let metrics = MetricsRecorder::new();
        let stage = metrics.stage("t1");
        stage.increment(CounterKind::Out, 5);
        metrics.reset();
        assert_eq!(stage.get(CounterKind::Out), 0);
        stage.increment(CounterKind::Out, 2);
        assert_eq!(metrics.get("t1", CounterKind::Out), 2);
    }

    #[test]
    fn test_flush_publishes_deltas_only() {
        let metrics = MetricsRecorder::new();
        let publisher = RecordingPublisher::default();
        metrics.increment("t1", CounterKind::In, 4);
        assert_eq!(metrics.flush(&publisher), 1);
        assert_eq!(metrics.flush(&publisher), 0);
        metrics.increment("t1", CounterKind::In, 2);
        metrics.flush(&publisher);
        let tuples = publisher.tuples.lock().clone();
        assert_eq!(
            tuples,
            vec![
                ("t1".to_string(), CounterKind::In, 4),
                ("t1".to_string(), CounterKind::In, 2),
            ]
        );
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let metrics = MetricsRecorder::new();
        metrics.increment("b", CounterKind::In, 1);
        metrics.increment("a", CounterKind::Out, 2);
        let snapshot = metrics.snapshot();
        let names: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(snapshot["a"].records_out, 2);
        assert_eq!(snapshot["b"].records_in, 1);
    }
}
