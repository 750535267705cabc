use crate::stats::{MetricKind, Sample, ShardedAggregator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What one iteration recorded, so the executor can fold it into the outcome.
#[derive(Debug, Default)]
pub struct IterationTracker {
    samples: AtomicUsize,
    failed_checks: AtomicUsize,
}

impl IterationTracker {
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn failed_checks(&self) -> usize {
        self.failed_checks.load(Ordering::Relaxed)
    }

    pub(crate) fn note_check(&self, passed: bool) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.failed_checks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Recording facility handed to scenario code. Writes land in the shard
/// owned by the VU, so sibling VUs rarely contend on the same lock.
#[derive(Clone)]
pub struct MetricsHandle {
    aggregator: Arc<ShardedAggregator>,
    key: usize,
    tracker: Arc<IterationTracker>,
    /// Enclosing group path (`outer::inner`), empty outside any group.
    group: Arc<Mutex<String>>,
}

impl MetricsHandle {
    pub fn new(aggregator: Arc<ShardedAggregator>, key: usize) -> Self {
        Self {
            aggregator,
            key,
            tracker: Arc::new(IterationTracker::default()),
            group: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn group_path(&self) -> String {
        self.group.lock().clone()
    }

    /// Nest `name` under the current group; returns the path to restore.
    pub(crate) fn enter_group(&self, name: &str) -> String {
        let mut group = self.group.lock();
        let previous = group.clone();
        if !group.is_empty() {
            group.push_str("::");
        }
        group.push_str(name);
        previous
    }

    pub(crate) fn restore_group(&self, previous: String) {
        *self.group.lock() = previous;
    }

    fn scoped(&self, name: &str) -> String {
        let group = self.group.lock();
        if group.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", group, name)
        }
    }

    pub fn tracker(&self) -> &Arc<IterationTracker> {
        &self.tracker
    }

    pub fn record(&self, name: &str, kind: MetricKind, value: f64) {
        self.tracker.samples.fetch_add(1, Ordering::Relaxed);
        self.aggregator.add(self.key, Sample::new(name, kind, value));
    }

    pub fn trend(&self, name: &str, value: f64) {
        self.record(name, MetricKind::Trend, value);
    }

    pub fn counter(&self, name: &str, value: f64) {
        self.record(name, MetricKind::Counter, value);
    }

    /// Rate observation. k6-style `errorRate.add(1)` maps to `rate(name, true)`.
    pub fn rate(&self, name: &str, observation: bool) {
        self.record(name, MetricKind::Rate, if observation { 1.0 } else { 0.0 });
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.record(name, MetricKind::Gauge, value);
    }

    pub(crate) fn add_check(&self, name: &str, passed: bool) {
        self.tracker.note_check(passed);
        self.aggregator.add_check(self.key, &self.scoped(name), passed);
    }
}
