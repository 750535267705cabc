use std::future::Future;
use std::time::Instant;

use crate::bridge::metrics::MetricsHandle;
use crate::stats::GROUP_DURATION;

/// Holds a group open on a [`MetricsHandle`]; the previous path comes back
/// on drop, also when the group body is cancelled mid-await.
struct GroupScope<'a> {
    metrics: &'a MetricsHandle,
    previous: Option<String>,
}

impl<'a> GroupScope<'a> {
    fn enter(metrics: &'a MetricsHandle, name: &str) -> Self {
        let previous = metrics.enter_group(name);
        Self {
            metrics,
            previous: Some(previous),
        }
    }
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.metrics.restore_group(previous);
        }
    }
}

/// Run `body` inside the named group. Checks recorded meanwhile are named
/// `group::check`, and the group's wall time lands in `group_duration` (ms).
pub async fn group<F: Future>(metrics: &MetricsHandle, name: &str, body: F) -> F::Output {
    let scope = GroupScope::enter(metrics, name);
    let started = Instant::now();
    let output = body.await;
    drop(scope);
    metrics.trend(GROUP_DURATION, started.elapsed().as_secs_f64() * 1000.0);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ShardedAggregator;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle() -> (MetricsHandle, Arc<ShardedAggregator>) {
        let agg = Arc::new(ShardedAggregator::new(1));
        (MetricsHandle::new(agg.clone(), 1), agg)
    }

    #[tokio::test]
    async fn test_nested_groups_prefix_checks() {
        let (metrics, agg) = handle();
        let value = group(&metrics, "Login and post message", async {
            metrics.add_check("login ok", true);
            group(&metrics, "post", async {
                metrics.add_check("status is 201", false);
            })
            .await;
            7
        })
        .await;

        assert_eq!(value, 7);
        assert_eq!(metrics.group_path(), "");
        let snap = agg.snapshot();
        assert_eq!(snap.checks["Login and post message::login ok"].passes, 1);
        assert_eq!(snap.checks["Login and post message::post::status is 201"].fails, 1);
        assert_eq!(snap.trend(GROUP_DURATION).unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_group_duration_covers_body() {
        let (metrics, agg) = handle();
        group(&metrics, "think", tokio::time::sleep(Duration::from_millis(20))).await;
        let duration = agg.snapshot().trend(GROUP_DURATION).unwrap().max;
        assert!(duration >= 20.0, "group_duration was {}", duration);
    }

    #[tokio::test]
    async fn test_cancelled_group_restores_path() {
        let (metrics, agg) = handle();
        let body = group(&metrics, "stuck", std::future::pending::<()>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), body).await;
        assert!(timed_out.is_err());
        assert_eq!(metrics.group_path(), "");
        assert!(agg.snapshot().trend(GROUP_DURATION).is_none());
    }
}
