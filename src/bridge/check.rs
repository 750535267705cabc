use crate::bridge::metrics::MetricsHandle;

/// Record one named check. A failed check marks the running iteration failed
/// but does not stop it; the returned bool lets scenario code branch on it.
pub fn check(metrics: &MetricsHandle, name: &str, passed: bool) -> bool {
    if !passed {
        tracing::debug!(check = name, "check failed");
    }
    metrics.add_check(name, passed);
    passed
}

/// Run every named predicate against `subject`, recording each one.
/// Returns true only when all of them passed.
pub fn check_all<T: ?Sized>(
    metrics: &MetricsHandle,
    subject: &T,
    checks: &[(&str, &dyn Fn(&T) -> bool)],
) -> bool {
    let mut all_passed = true;
    for (name, predicate) in checks {
        all_passed &= check(metrics, name, predicate(subject));
    }
    all_passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ShardedAggregator;
    use std::sync::Arc;

    #[test]
    fn test_check_returns_condition() {
        let agg = Arc::new(ShardedAggregator::new(1));
        let metrics = MetricsHandle::new(agg.clone(), 1);
        assert!(check(&metrics, "ok", true));
        assert!(!check(&metrics, "bad", false));
        let snap = agg.snapshot();
        assert_eq!(snap.checks["ok"].passes, 1);
        assert_eq!(snap.checks["bad"].fails, 1);
    }

    #[test]
    fn test_check_all_records_every_predicate() {
        let agg = Arc::new(ShardedAggregator::new(1));
        let metrics = MetricsHandle::new(agg.clone(), 1);
        let status: u16 = 201;
        let is_201 = |s: &u16| *s == 201;
        let is_200 = |s: &u16| *s == 200;
        let checks: [(&str, &dyn Fn(&u16) -> bool); 2] =
            [("status is 201", &is_201), ("status is 200", &is_200)];
        let passed = check_all(&metrics, &status, &checks);
        assert!(!passed);
        assert_eq!(metrics.tracker().failed_checks(), 1);
        assert_eq!(agg.snapshot().checks.len(), 2);
    }
}
