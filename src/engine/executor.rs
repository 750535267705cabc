use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::data::Dataset;
use crate::bridge::http::HttpClient;
use crate::bridge::metrics::MetricsHandle;
use crate::bridge::{ScenarioContext, SetupData};
use crate::error::ScenarioError;
use crate::stats::{
    MetricKind, ShardedAggregator, ITERATIONS, ITERATIONS_ABORTED, ITERATION_DURATION, ITERATION_FAILED,
};

/// User-supplied workload. The engine never looks inside it: it calls
/// `setup` once, `run` once per iteration on every VU, and `teardown` once.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    fn name(&self) -> &str {
        "default"
    }

    /// One-time preparation. The returned value becomes the run's setup data.
    /// Any error aborts the run before a single VU starts.
    async fn setup(&self, _ctx: &ScenarioContext) -> Result<Option<JsonValue>, ScenarioError> {
        Ok(None)
    }

    /// One iteration. Errors and panics mark the iteration failed; they never
    /// reach sibling VUs.
    async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError>;

    /// One-time cleanup, best-effort. Setup data is available via `ctx.setup_data()`.
    async fn teardown(&self, _ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    /// Pause after every iteration, overriding the run's global pacing.
    fn pacing(&self) -> Option<Duration> {
        None
    }

    /// Refuse to start unless a non-empty dataset is loaded. Combined with
    /// the run's own `require_dataset` setting.
    fn requires_dataset(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Ok,
    Failed,
    /// Still running when the drain grace period expired.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub vu_id: usize,
    pub iteration: u64,
    pub status: IterationStatus,
    pub duration: Duration,
    /// Samples the scenario recorded during the iteration, checks included.
    pub samples: usize,
    pub failed_checks: usize,
    pub error: Option<String>,
}

impl Outcome {
    pub fn aborted(ctx: &ScenarioContext, started: Instant) -> Self {
        let tracker = ctx.metrics().tracker();
        Self {
            vu_id: ctx.vu_id(),
            iteration: ctx.iteration(),
            status: IterationStatus::Aborted,
            duration: started.elapsed(),
            samples: tracker.samples(),
            failed_checks: tracker.failed_checks(),
            error: Some("iteration interrupted by hard stop".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
pub struct OutcomeTally {
    succeeded: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
}

impl OutcomeTally {
    fn add(&self, status: IterationStatus) {
        let counter = match status {
            IterationStatus::Ok => &self.succeeded,
            IterationStatus::Failed => &self.failed,
            IterationStatus::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> OutcomeCounts {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let aborted = self.aborted.load(Ordering::Relaxed);
        OutcomeCounts {
            total: succeeded + failed + aborted,
            succeeded,
            failed,
            aborted,
        }
    }
}

enum Ran {
    Completed(Result<(), ScenarioError>),
    Panicked(String),
    TimedOut(Duration),
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scenario panicked".to_string()
    }
}

/// Runs single iterations in isolation and turns whatever happens inside
/// them into an [`Outcome`].
pub struct ScenarioExecutor {
    scenario: Arc<dyn Scenario>,
    dataset: Dataset,
    setup_data: SetupData,
    aggregator: Arc<ShardedAggregator>,
    http: HttpClient,
    iteration_timeout: Option<Duration>,
    tally: OutcomeTally,
}

impl ScenarioExecutor {
    pub fn new(
        scenario: Arc<dyn Scenario>,
        dataset: Dataset,
        setup_data: SetupData,
        aggregator: Arc<ShardedAggregator>,
        http: HttpClient,
        iteration_timeout: Option<Duration>,
    ) -> Self {
        Self {
            scenario,
            dataset,
            setup_data,
            aggregator,
            http,
            iteration_timeout,
            tally: OutcomeTally::default(),
        }
    }

    pub fn scenario(&self) -> &Arc<dyn Scenario> {
        &self.scenario
    }

    pub fn context(&self, vu_id: usize, iteration: u64) -> ScenarioContext {
        ScenarioContext::new(
            vu_id,
            iteration,
            self.dataset.clone(),
            self.setup_data.clone(),
            MetricsHandle::new(self.aggregator.clone(), vu_id),
            self.http.clone(),
        )
    }

    pub async fn run_iteration(&self, ctx: &ScenarioContext) -> Outcome {
        let started = Instant::now();
        let guarded = AssertUnwindSafe(self.scenario.run(ctx)).catch_unwind();
        let ran = match self.iteration_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(Ok(result)) => Ran::Completed(result),
                Ok(Err(payload)) => Ran::Panicked(panic_message(payload)),
                Err(_) => Ran::TimedOut(limit),
            },
            None => match guarded.await {
                Ok(result) => Ran::Completed(result),
                Err(payload) => Ran::Panicked(panic_message(payload)),
            },
        };
        let duration = started.elapsed();

        let tracker = ctx.metrics().tracker();
        let failed_checks = tracker.failed_checks();
        let error = match ran {
            Ran::Completed(Ok(())) if failed_checks == 0 => None,
            Ran::Completed(Ok(())) => Some(format!("{} check(s) failed", failed_checks)),
            Ran::Completed(Err(e)) => Some(e.to_string()),
            Ran::Panicked(msg) => Some(format!("panic: {}", msg)),
            Ran::TimedOut(limit) => Some(format!("iteration exceeded timeout of {:?}", limit)),
        };
        if let Some(e) = &error {
            tracing::debug!(vu = ctx.vu_id(), iteration = ctx.iteration(), error = %e, "iteration failed");
        }

        Outcome {
            vu_id: ctx.vu_id(),
            iteration: ctx.iteration(),
            status: if error.is_none() {
                IterationStatus::Ok
            } else {
                IterationStatus::Failed
            },
            duration,
            samples: tracker.samples(),
            failed_checks,
            error,
        }
    }

    /// Fold an outcome into the built-in metrics and the tally. Called exactly
    /// once per iteration.
    pub fn record_outcome(&self, outcome: &Outcome) {
        self.tally.add(outcome.status);
        let key = outcome.vu_id;
        match outcome.status {
            IterationStatus::Ok | IterationStatus::Failed => {
                let failed = outcome.status == IterationStatus::Failed;
                self.aggregator.record(key, ITERATIONS, MetricKind::Counter, 1.0);
                self.aggregator.record(
                    key,
                    ITERATION_DURATION,
                    MetricKind::Trend,
                    outcome.duration.as_secs_f64() * 1000.0,
                );
                self.aggregator.record(
                    key,
                    ITERATION_FAILED,
                    MetricKind::Rate,
                    if failed { 1.0 } else { 0.0 },
                );
            }
            IterationStatus::Aborted => {
                self.aggregator
                    .record(key, ITERATIONS_ABORTED, MetricKind::Counter, 1.0);
            }
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        self.tally.counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Scripted {
        mode: &'static str,
    }

    #[async_trait]
    impl Scenario for Scripted {
        async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
            match self.mode {
                "ok" => {
                    ctx.metrics().trend("login_duration", 12.0);
                    ctx.check("logged in", true);
                    Ok(())
                }
                "check" => {
                    ctx.check("channel created", false);
                    Ok(())
                }
                "error" => Err(ScenarioError::abort("login failed")),
                "panic" => panic!("unexpected data shape"),
                "slow" => {
                    ctx.sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn executor(mode: &'static str, timeout: Option<Duration>) -> (ScenarioExecutor, Arc<ShardedAggregator>) {
        let agg = Arc::new(ShardedAggregator::new(4));
        let exec = ScenarioExecutor::new(
            Arc::new(Scripted { mode }),
            Dataset::new(vec![json!({"login_id": "a"})]),
            Arc::new(json!({"team_id": "t"})),
            agg.clone(),
            HttpClient::new().unwrap(),
            timeout,
        );
        (exec, agg)
    }

    async fn run_once(exec: &ScenarioExecutor) -> Outcome {
        let ctx = exec.context(1, 0);
        let outcome = exec.run_iteration(&ctx).await;
        exec.record_outcome(&outcome);
        outcome
    }

    #[tokio::test]
    async fn test_ok_iteration() {
        let (exec, agg) = executor("ok", None);
        let outcome = run_once(&exec).await;
        assert_eq!(outcome.status, IterationStatus::Ok);
        assert_eq!(outcome.samples, 2);
        assert!(outcome.error.is_none());

        let snap = agg.snapshot();
        assert_eq!(snap.counter(ITERATIONS), 1.0);
        assert_eq!(snap.rate(ITERATION_FAILED), 0.0);
        assert_eq!(snap.trend(ITERATION_DURATION).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_failed_check_fails_iteration() {
        let (exec, agg) = executor("check", None);
        let outcome = run_once(&exec).await;
        assert_eq!(outcome.status, IterationStatus::Failed);
        assert_eq!(outcome.failed_checks, 1);
        assert_eq!(agg.snapshot().rate(ITERATION_FAILED), 1.0);
    }

    #[tokio::test]
    async fn test_error_is_contained() {
        let (exec, _) = executor("error", None);
        let outcome = run_once(&exec).await;
        assert_eq!(outcome.status, IterationStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("aborted: login failed"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (exec, _) = executor("panic", None);
        let outcome = run_once(&exec).await;
        assert_eq!(outcome.status, IterationStatus::Failed);
        assert!(outcome.error.unwrap().contains("unexpected data shape"));
        // The executor keeps working after a panic.
        let again = run_once(&exec).await;
        assert_eq!(again.status, IterationStatus::Failed);
        assert_eq!(exec.counts().failed, 2);
    }

    #[tokio::test]
    async fn test_iteration_timeout() {
        let (exec, _) = executor("slow", Some(Duration::from_millis(20)));
        let outcome = run_once(&exec).await;
        assert_eq!(outcome.status, IterationStatus::Failed);
        assert!(outcome.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_aborted_counted_separately() {
        let (exec, agg) = executor("ok", None);
        let ctx = exec.context(2, 3);
        let aborted = Outcome::aborted(&ctx, Instant::now());
        exec.record_outcome(&aborted);
        run_once(&exec).await;

        let counts = exec.counts();
        assert_eq!(counts.aborted, 1);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.total, 2);

        let snap = agg.snapshot();
        assert_eq!(snap.counter(ITERATIONS_ABORTED), 1.0);
        assert_eq!(snap.counter(ITERATIONS), 1.0);
        assert_eq!(snap.rate(ITERATION_FAILED), 0.0);
    }
}
