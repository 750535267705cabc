use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub mod thresholds;

// Built-in metric names, recorded by the engine itself.
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATION_FAILED: &str = "iteration_failed";
pub const ITERATIONS_ABORTED: &str = "iterations_aborted";
pub const CHECKS: &str = "checks";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const GROUP_DURATION: &str = "group_duration";

/// Trend values are kept with 1/1000 resolution of the recorded unit.
const TREND_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum.
    Counter,
    /// Fraction of observations that were true (non-zero).
    Rate,
    /// Distribution summary: min/max/avg/percentiles.
    Trend,
    /// Last value wins.
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(name)
    }
}

/// One observation handed to the aggregator. Samples are append-only inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    pub fn rate(name: impl Into<String>, observation: bool) -> Self {
        Self::new(name, MetricKind::Rate, if observation { 1.0 } else { 0.0 })
    }

    pub fn trend(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Trend, value)
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, value)
    }
}

fn new_histogram() -> Histogram<u64> {
    // Auto-resizing, so no recorded magnitude is clamped.
    Histogram::<u64>::new(3).expect("3 significant figures is a valid precision")
}

fn record_magnitude(histogram: &mut Histogram<u64>, magnitude: f64) {
    let scaled = (magnitude * TREND_SCALE).round() as u64;
    if histogram.record(scaled).is_err() {
        histogram.saturating_record(scaled);
    }
}

/// Value of the `rank`-th smallest recorded magnitude (1-based).
fn magnitude_at_rank(histogram: &Histogram<u64>, rank: u64) -> f64 {
    let mut seen = 0;
    for step in histogram.iter_recorded() {
        seen += step.count_at_value();
        if seen >= rank {
            return histogram.highest_equivalent(step.value_iterated_to()) as f64 / TREND_SCALE;
        }
    }
    histogram.max() as f64 / TREND_SCALE
}

/// Mergeable distribution state behind a trend metric. Negative values are
/// kept as magnitudes in a histogram of their own.
#[derive(Clone)]
pub struct TrendState {
    histogram: Histogram<u64>,
    negative: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl fmt::Debug for TrendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendState")
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

impl Default for TrendState {
    fn default() -> Self {
        Self {
            histogram: new_histogram(),
            negative: new_histogram(),
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }
}

impl TrendState {
    fn add(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
        if value < 0.0 {
            record_magnitude(&mut self.negative, -value);
        } else {
            record_magnitude(&mut self.histogram, value);
        }
    }

    fn merge(&mut self, other: &TrendState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 || other.min < self.min {
            self.min = other.min;
        }
        if self.count == 0 || other.max > self.max {
            self.max = other.max;
        }
        self.count += other.count;
        self.sum += other.sum;
        // Auto-resizing histograms grow to fit, so adding cannot fail.
        let _ = self.histogram.add(&other.histogram);
        let _ = self.negative.add(&other.negative);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Percentile `p` in `[0, 100]`. An empty series reports 0.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let rank = ((quantile * self.count as f64).ceil() as u64).clamp(1, self.count);
        let negatives = self.negative.len();
        let value = if rank <= negatives {
            // Ascending order runs from the largest negative magnitude down.
            -magnitude_at_rank(&self.negative, negatives - rank + 1)
        } else {
            magnitude_at_rank(&self.histogram, rank - negatives)
        };
        // Bucket rounding may land a hair outside the observed range.
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone)]
enum MetricState {
    Counter(f64),
    Rate { trues: u64, total: u64 },
    Trend(TrendState),
    Gauge(f64),
}

impl MetricState {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricState::Counter(0.0),
            MetricKind::Rate => MetricState::Rate { trues: 0, total: 0 },
            MetricKind::Trend => MetricState::Trend(TrendState::default()),
            MetricKind::Gauge => MetricState::Gauge(0.0),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            MetricState::Counter(_) => MetricKind::Counter,
            MetricState::Rate { .. } => MetricKind::Rate,
            MetricState::Trend(_) => MetricKind::Trend,
            MetricState::Gauge(_) => MetricKind::Gauge,
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            MetricState::Counter(sum) => *sum += value,
            MetricState::Rate { trues, total } => {
                *total += 1;
                if value != 0.0 {
                    *trues += 1;
                }
            }
            MetricState::Trend(trend) => trend.add(value),
            MetricState::Gauge(last) => *last = value,
        }
    }

    fn merge(&mut self, other: &MetricState) {
        match (self, other) {
            (MetricState::Counter(a), MetricState::Counter(b)) => *a += b,
            (
                MetricState::Rate { trues, total },
                MetricState::Rate {
                    trues: other_trues,
                    total: other_total,
                },
            ) => {
                *trues += other_trues;
                *total += other_total;
            }
            (MetricState::Trend(a), MetricState::Trend(b)) => a.merge(b),
            (MetricState::Gauge(a), MetricState::Gauge(b)) => *a = *b,
            _ => {}
        }
    }

    fn summarize(&self) -> MetricSummary {
        match self {
            MetricState::Counter(sum) => MetricSummary::Counter { count: *sum },
            MetricState::Rate { trues, total } => MetricSummary::Rate {
                rate: rate_of(*trues, *total),
                trues: *trues,
                total: *total,
            },
            MetricState::Trend(trend) => MetricSummary::Trend(TrendSummary::from_state(trend)),
            MetricState::Gauge(value) => MetricSummary::Gauge { value: *value },
        }
    }
}

/// 0/0 is reported as 0.
pub fn rate_of(trues: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        trues as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

/// Unsynchronized accumulation for one shard. [`ShardedAggregator`] owns the locking.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    metrics: HashMap<String, MetricState>,
    checks: BTreeMap<String, CheckTally>,
    samples: u64,
    dropped: u64,
    last_sample_at: Option<DateTime<Utc>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: Sample) {
        if !sample.value.is_finite() {
            tracing::debug!(metric = %sample.name, "dropping non-finite sample");
            self.dropped += 1;
            return;
        }
        let state = self
            .metrics
            .entry(sample.name)
            .or_insert_with(|| MetricState::empty(sample.kind));
        if state.kind() != sample.kind {
            // The first kind recorded under a name wins.
            self.dropped += 1;
            return;
        }
        state.add(sample.value);
        self.samples += 1;
        if self.last_sample_at.is_none_or(|t| sample.timestamp > t) {
            self.last_sample_at = Some(sample.timestamp);
        }
    }

    pub fn add_check(&mut self, name: &str, passed: bool) {
        let tally = self.checks.entry(name.to_string()).or_default();
        if passed {
            tally.passes += 1;
        } else {
            tally.fails += 1;
        }
        self.add(Sample::rate(CHECKS, passed));
    }

    pub fn merge_from(&mut self, other: &StatsAggregator) {
        for (name, state) in &other.metrics {
            match self.metrics.get_mut(name) {
                Some(existing) if existing.kind() == state.kind() => existing.merge(state),
                Some(_) => self.dropped += 1,
                None => {
                    self.metrics.insert(name.clone(), state.clone());
                }
            }
        }
        for (name, tally) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_default();
            entry.passes += tally.passes;
            entry.fails += tally.fails;
        }
        self.samples += other.samples;
        self.dropped += other.dropped;
        if let Some(t) = other.last_sample_at {
            if self.last_sample_at.is_none_or(|own| t > own) {
                self.last_sample_at = Some(t);
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            last_sample_at: self.last_sample_at,
            samples: self.samples,
            dropped_samples: self.dropped,
            metrics: self
                .metrics
                .iter()
                .map(|(name, state)| (name.clone(), state.summarize()))
                .collect(),
            checks: self.checks.clone(),
        }
    }
}

/// Striped aggregator: writers lock only the shard picked by their key
/// (normally the VU id), readers merge every shard into a point-in-time view.
pub struct ShardedAggregator {
    shards: Vec<Mutex<StatsAggregator>>,
}

impl ShardedAggregator {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Mutex::new(StatsAggregator::new()))
            .collect();
        Self { shards }
    }

    /// Target ~100 VUs per shard, bounded to keep merges cheap.
    pub fn for_workers(max_workers: usize) -> Self {
        Self::new((max_workers / 100).clamp(16, 256))
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: usize) -> &Mutex<StatsAggregator> {
        &self.shards[key % self.shards.len()]
    }

    pub fn add(&self, key: usize, sample: Sample) {
        self.shard(key).lock().add(sample);
    }

    pub fn record(&self, key: usize, name: &str, kind: MetricKind, value: f64) {
        self.add(key, Sample::new(name, kind, value));
    }

    pub fn add_check(&self, key: usize, name: &str, passed: bool) {
        self.shard(key).lock().add_check(name, passed);
    }

    pub fn merge(&self) -> StatsAggregator {
        let mut merged = StatsAggregator::new();
        for shard in &self.shards {
            merged.merge_from(&shard.lock());
        }
        merged
    }

    pub fn snapshot(&self) -> Snapshot {
        self.merge().to_snapshot()
    }

    pub fn reset(&self) {
        for shard in &self.shards {
            shard.lock().reset();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(skip)]
    distribution: TrendState,
}

impl TrendSummary {
    fn from_state(state: &TrendState) -> Self {
        Self {
            count: state.count(),
            min: state.min,
            max: state.max,
            avg: state.avg(),
            med: state.percentile(50.0),
            p90: state.percentile(90.0),
            p95: state.percentile(95.0),
            p99: state.percentile(99.0),
            distribution: state.clone(),
        }
    }

    pub fn percentile(&self, p: f64) -> f64 {
        self.distribution.percentile(p)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter { count: f64 },
    Rate { rate: f64, trues: u64, total: u64 },
    Trend(TrendSummary),
    Gauge { value: f64 },
}

impl MetricSummary {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSummary::Counter { .. } => MetricKind::Counter,
            MetricSummary::Rate { .. } => MetricKind::Rate,
            MetricSummary::Trend(_) => MetricKind::Trend,
            MetricSummary::Gauge { .. } => MetricKind::Gauge,
        }
    }
}

/// Point-in-time view of every metric, produced by [`ShardedAggregator::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub samples: u64,
    pub dropped_samples: u64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    /// Rate value of `name`, 0 when absent or empty.
    pub fn rate(&self, name: &str) -> f64 {
        match self.metrics.get(name) {
            Some(MetricSummary::Rate { rate, .. }) => *rate,
            _ => 0.0,
        }
    }

    /// Counter value of `name`, 0 when absent.
    pub fn counter(&self, name: &str) -> f64 {
        match self.metrics.get(name) {
            Some(MetricSummary::Counter { count }) => *count,
            _ => 0.0,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendSummary> {
        match self.metrics.get(name) {
            Some(MetricSummary::Trend(t)) => Some(t),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn report(&self) {
        println!("\n--- Test Summary ---");
        if self.metrics.is_empty() {
            println!("No metrics collected.");
            println!("--------------------\n");
            return;
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for (name, tally) in &self.checks {
                let total = tally.passes + tally.fails;
                let percent = rate_of(tally.passes, total) * 100.0;
                let mark = if tally.fails == 0 { "✓" } else { "✗" };
                println!(
                    "  {} {} : {:.2}% ({} passed, {} failed)",
                    mark, name, percent, tally.passes, tally.fails
                );
            }
        }

        println!("\nMetrics:");
        for (name, summary) in &self.metrics {
            match summary {
                MetricSummary::Counter { count } => println!("  {}: {}", name, count),
                MetricSummary::Rate { rate, trues, total } => {
                    println!("  {}: {:.2}% ({}/{})", name, rate * 100.0, trues, total)
                }
                MetricSummary::Trend(t) => println!(
                    "  {}: avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2} p(99)={:.2} count={}",
                    name, t.avg, t.min, t.med, t.max, t.p90, t.p95, t.p99, t.count
                ),
                MetricSummary::Gauge { value } => println!("  {}: {:.2}", name, value),
            }
        }
        if self.dropped_samples > 0 {
            println!("\nDropped samples: {}", self.dropped_samples);
        }
        println!("--------------------\n");
    }
}
