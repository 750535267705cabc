//! Facilities the engine exposes to scenario code: the shared dataset,
//! metric recording, checks and the request-execution client.

pub mod check;
pub mod data;
pub mod group;
pub mod http;
pub mod metrics;

use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use self::data::Dataset;
use self::http::{Http, HttpClient};
use self::metrics::MetricsHandle;

/// Value returned by setup, shared read-only by every iteration and by teardown.
/// `Null` when the scenario has no setup or its setup returned nothing.
pub type SetupData = Arc<JsonValue>;

/// Everything one iteration (or setup/teardown, with `vu_id == 0`) may touch.
pub struct ScenarioContext {
    vu_id: usize,
    iteration: u64,
    dataset: Dataset,
    setup_data: SetupData,
    metrics: MetricsHandle,
    http: HttpClient,
}

impl ScenarioContext {
    pub fn new(
        vu_id: usize,
        iteration: u64,
        dataset: Dataset,
        setup_data: SetupData,
        metrics: MetricsHandle,
        http: HttpClient,
    ) -> Self {
        Self {
            vu_id,
            iteration,
            dataset,
            setup_data,
            metrics,
            http,
        }
    }

    /// Stable VU id, 1-based. Setup and teardown run as VU 0.
    pub fn vu_id(&self) -> usize {
        self.vu_id
    }

    /// Iteration number within this VU, starting at 0.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// The dataset record assigned to this VU (`vu_id % len`).
    pub fn dataset_record(&self) -> Option<&JsonValue> {
        self.dataset.wrapped(self.vu_id)
    }

    pub fn setup_data(&self) -> &JsonValue {
        &self.setup_data
    }

    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }

    pub fn http(&self) -> Http<'_> {
        Http::new(&self.http, &self.metrics)
    }

    pub fn check(&self, name: &str, passed: bool) -> bool {
        check::check(&self.metrics, name, passed)
    }

    pub fn check_all<T: ?Sized>(&self, subject: &T, checks: &[(&str, &dyn Fn(&T) -> bool)]) -> bool {
        check::check_all(&self.metrics, subject, checks)
    }

    /// k6-style `group`: checks recorded inside `body` are prefixed with the
    /// group path and the body's wall time is recorded as `group_duration`.
    pub async fn group<F: Future>(&self, name: &str, body: F) -> F::Output {
        group::group(&self.metrics, name, body).await
    }

    /// Think time inside an iteration. Cancelled with the iteration on hard stop.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ShardedAggregator;
    use serde_json::json;

    fn context(vu_id: usize, dataset: Dataset) -> (ScenarioContext, Arc<ShardedAggregator>) {
        let agg = Arc::new(ShardedAggregator::new(2));
        let ctx = ScenarioContext::new(
            vu_id,
            0,
            dataset,
            Arc::new(json!({"team_id": "t1"})),
            MetricsHandle::new(agg.clone(), vu_id),
            HttpClient::new().unwrap(),
        );
        (ctx, agg)
    }

    #[test]
    fn test_dataset_record_wraps_by_vu() {
        let dataset = Dataset::new(vec![json!("admin"), json!("u1"), json!("u2")]);
        let (ctx, _) = context(4, dataset);
        assert_eq!(ctx.dataset_record(), Some(&json!("u1")));
        assert_eq!(ctx.setup_data()["team_id"], "t1");
    }

    #[tokio::test]
    async fn test_group_scopes_checks() {
        let (ctx, agg) = context(2, Dataset::empty());
        let passed = ctx
            .group("Login and create channel", async { ctx.check("channel created", true) })
            .await;
        assert!(passed);
        ctx.check("after group", true);
        let snap = agg.snapshot();
        assert_eq!(snap.checks["Login and create channel::channel created"].passes, 1);
        assert_eq!(snap.checks["after group"].passes, 1);
        assert!(snap.trend(crate::stats::GROUP_DURATION).is_some());
    }

    #[test]
    fn test_check_goes_through_metrics() {
        let (ctx, agg) = context(1, Dataset::empty());
        assert!(!ctx.check("logged in", false));
        assert_eq!(ctx.metrics().tracker().failed_checks(), 1);
        assert_eq!(agg.snapshot().checks["logged in"].fails, 1);
        assert!(ctx.dataset_record().is_none());
    }
}
