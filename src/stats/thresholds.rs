//! Threshold expressions such as `rate<0.05` or `p(95) < 2000`, evaluated
//! against a metrics [`Snapshot`].
//!
//! Empty-metric policy: a threshold that references a metric with no
//! observations (or a metric that was never recorded) is evaluated against
//! zero. `rate<0.05` on an empty rate therefore passes and `count>0` fails.
//! An aggregation that does not apply to the metric's kind (for example
//! `p(95)` on a rate) always fails.

use crate::error::ConfigError;
use crate::stats::{MetricKind, MetricSummary, Snapshot};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    fn parse(s: &str) -> Option<Self> {
        let agg = match s {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "value" => Aggregation::Value,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let inner = s.strip_prefix('p')?;
                let inner = inner
                    .strip_prefix('(')
                    .and_then(|rest| rest.strip_suffix(')'))
                    .unwrap_or(inner);
                let p: f64 = inner.parse().ok()?;
                if !(0.0..=100.0).contains(&p) {
                    return None;
                }
                Aggregation::Percentile(p)
            }
        };
        Some(agg)
    }

    /// Value of this aggregation for a metric, `None` when it does not apply.
    fn observe(&self, summary: &MetricSummary) -> Option<f64> {
        match (self, summary) {
            (Aggregation::Rate, MetricSummary::Rate { rate, .. }) => Some(*rate),
            (Aggregation::Count, MetricSummary::Rate { total, .. }) => Some(*total as f64),
            (Aggregation::Count | Aggregation::Value, MetricSummary::Counter { count }) => {
                Some(*count)
            }
            (Aggregation::Value, MetricSummary::Gauge { value }) => Some(*value),
            (Aggregation::Count, MetricSummary::Trend(t)) => Some(t.count as f64),
            (Aggregation::Avg, MetricSummary::Trend(t)) => Some(t.avg),
            (Aggregation::Min, MetricSummary::Trend(t)) => Some(t.min),
            (Aggregation::Max, MetricSummary::Trend(t)) => Some(t.max),
            (Aggregation::Med, MetricSummary::Trend(t)) => Some(t.med),
            (Aggregation::Percentile(p), MetricSummary::Trend(t)) => Some(t.percentile(*p)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(&self, actual: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => actual < bound,
            Comparison::Le => actual <= bound,
            Comparison::Gt => actual > bound,
            Comparison::Ge => actual >= bound,
            Comparison::Eq => actual == bound,
            Comparison::Ne => actual != bound,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        f.write_str(op)
    }
}

/// A declared pass/fail predicate over one aggregated metric.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    /// Stop the run as soon as this threshold is breached.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let op_start = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (lhs, rest) = compact.split_at(op_start);

        let (comparison, rhs) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .iter()
        .find_map(|(token, cmp)| rest.strip_prefix(token).map(|rhs| (*cmp, rhs)))
        .ok_or_else(|| invalid("unknown comparison operator"))?;

        let aggregation = Aggregation::parse(lhs)
            .ok_or_else(|| invalid(&format!("unknown aggregation '{}'", lhs)))?;
        let bound: f64 = rhs
            .parse()
            .map_err(|_| invalid(&format!("'{}' is not a number", rhs)))?;
        if !bound.is_finite() {
            return Err(invalid("bound must be finite"));
        }

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            aggregation,
            comparison,
            bound,
            abort_on_fail: false,
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    /// Current value of the threshold's aggregation, applying the empty-metric policy.
    pub fn observe(&self, snapshot: &Snapshot) -> Option<f64> {
        match snapshot.get(&self.metric) {
            Some(summary) => self.aggregation.observe(summary),
            None => Some(0.0),
        }
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdResult {
        let actual = self.observe(snapshot);
        let passed = actual.is_some_and(|v| self.comparison.holds(v, self.bound));
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            actual,
            kind: snapshot.get(&self.metric).map(MetricSummary::kind),
            passed,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the aggregation does not apply to the metric kind.
    pub actual: Option<f64>,
    pub kind: Option<MetricKind>,
    pub passed: bool,
    pub abort_on_fail: bool,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "✓" } else { "✗" };
        match (self.actual, self.kind) {
            (Some(v), _) => write!(f, "{} {}: {} (actual: {:.4})", mark, self.metric, self.expression, v),
            (None, Some(kind)) => write!(
                f,
                "{} {}: {} (not applicable to a {} metric)",
                mark, self.metric, self.expression, kind
            ),
            (None, None) => write!(f, "{} {}: {}", mark, self.metric, self.expression),
        }
    }
}

/// All thresholds declared for a run. Immutable once the run begins.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self { thresholds }
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    pub fn has_abort_on_fail(&self) -> bool {
        self.thresholds.iter().any(|t| t.abort_on_fail)
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> Vec<ThresholdResult> {
        self.thresholds.iter().map(|t| t.evaluate(snapshot)).collect()
    }

    /// First breached threshold that requests an early abort. Mid-run, a
    /// metric nobody has recorded yet cannot trip an abort.
    pub fn breached_abort(&self, snapshot: &Snapshot) -> Option<ThresholdResult> {
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail && snapshot.get(&t.metric).is_some())
            .map(|t| t.evaluate(snapshot))
            .find(|r| !r.passed)
    }
}
