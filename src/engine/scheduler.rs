use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::control::ControlState;
use crate::bridge::ScenarioContext;
use crate::engine::executor::{IterationStatus, Outcome, ScenarioExecutor};

/// How often a paused VU re-checks the pause flag.
const PAUSE_POLL: Duration = Duration::from_millis(100);
/// How long hard-stopped VUs get to record their aborted outcome before
/// their tasks are cancelled outright.
const HARD_STOP_JOIN: Duration = Duration::from_secs(1);

/// Dense VU ids: the smallest released id is handed out first, so the live
/// set stays close to `1..=n`.
#[derive(Debug)]
pub struct IdPool {
    free: BTreeSet<usize>,
    next: usize,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            free: BTreeSet::new(),
            next: 1,
        }
    }

    pub fn acquire(&mut self) -> usize {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn release(&mut self, id: usize) {
        debug_assert!(id < self.next);
        self.free.insert(id);
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pause inserted between iterations of one VU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pacing {
    pub fixed: Option<Duration>,
    /// Iterations shorter than this are padded up to it.
    pub min_iteration_duration: Option<Duration>,
}

impl Pacing {
    /// `scenario` is the scenario's own pacing and replaces `fixed` when set.
    pub fn pause_after(&self, elapsed: Duration, scenario: Option<Duration>) -> Option<Duration> {
        let fixed = scenario.or(self.fixed).unwrap_or(Duration::ZERO);
        let padding = self
            .min_iteration_duration
            .and_then(|min| min.checked_sub(elapsed))
            .unwrap_or(Duration::ZERO);
        let pause = fixed.max(padding);
        (pause > Duration::ZERO).then_some(pause)
    }
}

// Retirement handshake. Only the scheduler moves a VU between RUNNING and
// RETIRING; only the VU itself moves RETIRING to EXITED.
const VU_RUNNING: u8 = 0;
const VU_RETIRING: u8 = 1;
const VU_EXITED: u8 = 2;

struct VuHandle {
    state: Arc<AtomicU8>,
    retire: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl VuHandle {
    fn retire(&self) {
        let _ = self
            .state
            .compare_exchange(VU_RUNNING, VU_RETIRING, Ordering::SeqCst, Ordering::SeqCst);
        self.retire.send_replace(true);
    }

    /// Cancel a pending retirement. False once the VU has committed to exiting.
    fn reinstate(&self) -> bool {
        self.retire.send_replace(false);
        self.state
            .compare_exchange(VU_RETIRING, VU_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            && !self.handle.is_finished()
    }
}

/// Records the in-flight iteration as aborted if the VU task is dropped
/// before the iteration produced an outcome.
struct InFlight<'a> {
    executor: &'a ScenarioExecutor,
    ctx: &'a ScenarioContext,
    started: Instant,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(executor: &'a ScenarioExecutor, ctx: &'a ScenarioContext) -> Self {
        Self {
            executor,
            ctx,
            started: Instant::now(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.executor.record_outcome(&Outcome::aborted(self.ctx, self.started));
        }
    }
}

/// Resolves once `rx` carries `true`. A dropped sender never signals.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Owns the VU tasks and keeps their number equal to the desired concurrency.
pub struct VuScheduler {
    executor: Arc<ScenarioExecutor>,
    control: Arc<ControlState>,
    pacing: Pacing,
    max_iterations: Option<u64>,
    hard_stop: watch::Sender<bool>,
    ids: IdPool,
    active: BTreeMap<usize, VuHandle>,
    retiring: BTreeMap<usize, VuHandle>,
    peak: usize,
}

impl VuScheduler {
    pub fn new(
        executor: Arc<ScenarioExecutor>,
        control: Arc<ControlState>,
        pacing: Pacing,
        max_iterations: Option<u64>,
    ) -> Self {
        let (hard_stop, _) = watch::channel(false);
        Self {
            executor,
            control,
            pacing,
            max_iterations,
            hard_stop,
            ids: IdPool::new(),
            active: BTreeMap::new(),
            retiring: BTreeMap::new(),
            peak: 0,
        }
    }

    /// Grow or shrink towards `desired`. Growing first takes back VUs that
    /// are still retiring, lowest id first, then spawns new ones; shrinking
    /// asks the highest-numbered VUs to exit after their current iteration.
    pub fn reconcile(&mut self, desired: usize) {
        self.reap();

        let retiring: Vec<usize> = self.retiring.keys().copied().collect();
        for id in retiring {
            if self.active.len() >= desired {
                break;
            }
            let Some(vu) = self.retiring.remove(&id) else {
                continue;
            };
            if vu.reinstate() {
                tracing::debug!(vu = id, "reinstating retiring VU");
                self.active.insert(id, vu);
            } else {
                // The task is on its way out and runs no further iteration.
                self.ids.release(id);
            }
        }

        while self.active.len() < desired {
            let id = self.ids.acquire();
            let vu = self.spawn(id);
            self.active.insert(id, vu);
        }

        while self.active.len() > desired {
            if let Some((id, vu)) = self.active.pop_last() {
                vu.retire();
                self.retiring.insert(id, vu);
            }
        }

        self.peak = self.peak.max(self.running());
    }

    /// VU slots currently assigned. Slots whose VU hit the iteration limit
    /// still count, so they are not respawned.
    pub fn assigned(&self) -> usize {
        self.active.len()
    }

    /// Tasks still alive, retiring ones included.
    pub fn running(&self) -> usize {
        self.active.values().filter(|vu| !vu.handle.is_finished()).count()
            + self.retiring.values().filter(|vu| !vu.handle.is_finished()).count()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn active_ids(&self) -> Vec<usize> {
        self.active.keys().copied().collect()
    }

    /// True once every assigned VU has exited on its own (iteration limit).
    pub fn exhausted(&self) -> bool {
        !self.active.is_empty() && self.active.values().all(|vu| vu.handle.is_finished())
    }

    fn reap(&mut self) {
        let ids = &mut self.ids;
        self.retiring.retain(|id, vu| {
            if vu.handle.is_finished() {
                ids.release(*id);
                false
            } else {
                true
            }
        });
    }

    fn spawn(&self, vu_id: usize) -> VuHandle {
        let (retire, retire_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(VU_RUNNING));
        tracing::debug!(vu = vu_id, "spawning VU");
        let handle = tokio::spawn(vu_main(
            vu_id,
            self.executor.clone(),
            self.control.clone(),
            self.pacing,
            self.max_iterations,
            state.clone(),
            retire_rx,
            self.hard_stop.subscribe(),
        ));
        VuHandle {
            state,
            retire,
            handle,
        }
    }

    /// Retire every VU and wait up to `grace` for in-flight iterations. VUs
    /// still busy afterwards are hard-stopped and their iteration recorded
    /// as aborted. Returns true when the hard stop was needed.
    pub async fn drain(&mut self, grace: Duration) -> bool {
        for (id, vu) in std::mem::take(&mut self.active) {
            vu.retire();
            self.retiring.insert(id, vu);
        }
        let mut handles: Vec<(usize, JoinHandle<()>)> = std::mem::take(&mut self.retiring)
            .into_iter()
            .map(|(id, vu)| (id, vu.handle))
            .collect();

        let started = Instant::now();
        let graceful = tokio::time::timeout(
            grace,
            futures::future::join_all(handles.iter_mut().map(|(_, h)| h)),
        )
        .await
        .is_ok();

        if !graceful {
            let busy = handles.iter().filter(|(_, h)| !h.is_finished()).count();
            tracing::warn!(busy, grace = ?grace, "graceful stop expired, aborting in-flight iterations");
            self.hard_stop.send_replace(true);
            let stopped = tokio::time::timeout(
                HARD_STOP_JOIN,
                futures::future::join_all(
                    handles.iter_mut().filter(|(_, h)| !h.is_finished()).map(|(_, h)| h),
                ),
            )
            .await
            .is_ok();
            if !stopped {
                for (id, handle) in &handles {
                    if !handle.is_finished() {
                        tracing::error!(vu = id, "VU ignored hard stop, cancelling task");
                        handle.abort();
                    }
                }
                // A cancelled task records its aborted iteration when it is
                // dropped, which waits for its current poll to return.
                let cancelled = tokio::time::timeout(
                    HARD_STOP_JOIN,
                    futures::future::join_all(
                        handles.iter_mut().filter(|(_, h)| !h.is_finished()).map(|(_, h)| h),
                    ),
                )
                .await
                .is_ok();
                if !cancelled {
                    tracing::error!("cancelled VUs are still blocking their worker threads");
                }
            }
        } else {
            tracing::debug!(elapsed = ?started.elapsed(), "all VUs drained");
        }

        for (id, _) in handles {
            self.ids.release(id);
        }
        !graceful
    }
}

async fn vu_main(
    vu_id: usize,
    executor: Arc<ScenarioExecutor>,
    control: Arc<ControlState>,
    pacing: Pacing,
    max_iterations: Option<u64>,
    state: Arc<AtomicU8>,
    mut retire: watch::Receiver<bool>,
    mut hard_stop: watch::Receiver<bool>,
) {
    let mut iteration: u64 = 0;
    loop {
        let hard_stopped = *hard_stop.borrow();
        let retired = state
            .compare_exchange(VU_RETIRING, VU_EXITED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if hard_stopped || retired {
            return;
        }
        if control.is_paused() {
            tokio::select! {
                biased;
                _ = signalled(&mut hard_stop) => return,
                _ = signalled(&mut retire) => {}
                _ = tokio::time::sleep(PAUSE_POLL) => {}
            }
            continue;
        }

        let ctx = executor.context(vu_id, iteration);
        let mut in_flight = InFlight::new(&executor, &ctx);
        // Retirement is only observed between iterations; a hard stop is
        // the one thing that cuts an iteration short.
        let outcome = tokio::select! {
            biased;
            _ = signalled(&mut hard_stop) => Outcome::aborted(&ctx, in_flight.started),
            outcome = executor.run_iteration(&ctx) => outcome,
        };
        in_flight.disarm();
        drop(in_flight);
        executor.record_outcome(&outcome);
        if outcome.status == IterationStatus::Aborted {
            return;
        }

        iteration += 1;
        if max_iterations.is_some_and(|max| iteration >= max) {
            tracing::debug!(vu = vu_id, iterations = iteration, "VU reached iteration limit");
            return;
        }

        if let Some(pause) = pacing.pause_after(outcome.duration, executor.scenario().pacing()) {
            tokio::select! {
                biased;
                _ = signalled(&mut hard_stop) => return,
                _ = signalled(&mut retire) => {}
                _ = tokio::time::sleep(pause) => {}
            }
        } else {
            // Scenarios that never await would otherwise hog the worker thread.
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::data::Dataset;
    use crate::bridge::http::HttpClient;
    use crate::bridge::ScenarioContext;
    use crate::engine::executor::Scenario;
    use crate::error::ScenarioError;
    use crate::stats::ShardedAggregator;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Sleeper {
        work: Duration,
        started: AtomicU64,
        finished: AtomicU64,
    }

    impl Sleeper {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                started: AtomicU64::new(0),
                finished: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Scenario for Sleeper {
        async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            ctx.sleep(self.work).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks its worker thread, then parks on a long sleep.
    struct Blocker {
        block: Duration,
        started: AtomicU64,
    }

    #[async_trait]
    impl Scenario for Blocker {
        async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.block);
            ctx.sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn scheduler(scenario: Arc<dyn Scenario>, pacing: Pacing, max_iterations: Option<u64>) -> (VuScheduler, Arc<ScenarioExecutor>, Arc<ControlState>) {
        let executor = Arc::new(ScenarioExecutor::new(
            scenario,
            Dataset::empty(),
            Arc::new(JsonValue::Null),
            Arc::new(ShardedAggregator::new(4)),
            HttpClient::new().unwrap(),
            None,
        ));
        let control = Arc::new(ControlState::new());
        let sched = VuScheduler::new(executor.clone(), control.clone(), pacing, max_iterations);
        (sched, executor, control)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_id_pool_reuses_smallest() {
        let mut pool = IdPool::new();
        assert_eq!((pool.acquire(), pool.acquire(), pool.acquire()), (1, 2, 3));
        pool.release(3);
        pool.release(2);
        assert_eq!(pool.acquire(), 2);
        assert_eq!(pool.acquire(), 3);
        assert_eq!(pool.acquire(), 4);
    }

    #[test]
    fn test_pacing() {
        let none = Pacing::default();
        assert_eq!(none.pause_after(Duration::from_millis(5), None), None);

        let fixed = Pacing { fixed: Some(Duration::from_millis(100)), min_iteration_duration: None };
        assert_eq!(fixed.pause_after(Duration::ZERO, None), Some(Duration::from_millis(100)));
        // Scenario pacing wins over the global one.
        assert_eq!(
            fixed.pause_after(Duration::ZERO, Some(Duration::from_millis(7))),
            Some(Duration::from_millis(7))
        );

        let padded = Pacing { fixed: None, min_iteration_duration: Some(Duration::from_millis(50)) };
        assert_eq!(padded.pause_after(Duration::from_millis(20), None), Some(Duration::from_millis(30)));
        assert_eq!(padded.pause_after(Duration::from_millis(80), None), None);
    }

    #[tokio::test]
    async fn test_grow_and_shrink_keeps_ids_dense() {
        let scenario = Sleeper::new(Duration::from_millis(20));
        let (mut sched, executor, _) = scheduler(scenario.clone(), Pacing::default(), None);

        sched.reconcile(4);
        assert_eq!(sched.active_ids(), vec![1, 2, 3, 4]);

        sched.reconcile(2);
        assert_eq!(sched.active_ids(), vec![1, 2]);

        // Retired VUs finish their iteration, then their ids come back.
        wait_until(|| sched.running() == 2).await;
        sched.reconcile(3);
        assert_eq!(sched.active_ids(), vec![1, 2, 3]);
        assert_eq!(sched.peak(), 4);

        assert!(!sched.drain(Duration::from_secs(5)).await);
        let counts = executor.counts();
        assert_eq!(counts.aborted, 0);
        assert_eq!(scenario.started.load(Ordering::SeqCst), scenario.finished.load(Ordering::SeqCst));
        assert_eq!(counts.succeeded, scenario.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_regrow_reinstates_retiring_vus() {
        let scenario = Sleeper::new(Duration::from_millis(300));
        let (mut sched, executor, _) = scheduler(scenario.clone(), Pacing::default(), None);

        sched.reconcile(4);
        wait_until(|| scenario.started.load(Ordering::SeqCst) == 4).await;
        sched.reconcile(2);
        sched.reconcile(4);
        assert_eq!(sched.active_ids(), vec![1, 2, 3, 4]);

        // The reinstated VUs keep iterating instead of exiting.
        wait_until(|| scenario.started.load(Ordering::SeqCst) >= 8).await;
        sched.reconcile(4);
        assert_eq!(sched.active_ids(), vec![1, 2, 3, 4]);
        assert_eq!(sched.running(), 4);
        assert_eq!(sched.peak(), 4);

        assert!(!sched.drain(Duration::from_secs(5)).await);
        assert_eq!(executor.counts().aborted, 0);
    }

    #[tokio::test]
    async fn test_reinstated_vu_exits_when_retired_again() {
        let scenario = Sleeper::new(Duration::from_millis(50));
        let (mut sched, _, _) = scheduler(scenario.clone(), Pacing::default(), None);

        sched.reconcile(2);
        sched.reconcile(1);
        sched.reconcile(2);
        sched.reconcile(1);
        assert_eq!(sched.active_ids(), vec![1]);
        wait_until(|| sched.running() == 1).await;
        sched.reconcile(2);
        assert_eq!(sched.active_ids(), vec![1, 2]);
        sched.drain(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_hard_stop_aborts_long_iterations() {
        let scenario = Sleeper::new(Duration::from_secs(30));
        let (mut sched, executor, _) = scheduler(scenario.clone(), Pacing::default(), None);

        sched.reconcile(2);
        wait_until(|| scenario.started.load(Ordering::SeqCst) == 2).await;

        assert!(sched.drain(Duration::from_millis(50)).await);
        let counts = executor.counts();
        assert_eq!(counts.aborted, 2);
        assert_eq!(counts.total, 2);
        assert_eq!(scenario.finished.load(Ordering::SeqCst), 0);
        assert_eq!(sched.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_vu_records_aborted_iteration() {
        let scenario = Arc::new(Blocker {
            block: Duration::from_millis(1500),
            started: AtomicU64::new(0),
        });
        let (mut sched, executor, _) = scheduler(scenario.clone(), Pacing::default(), None);

        sched.reconcile(1);
        wait_until(|| scenario.started.load(Ordering::SeqCst) == 1).await;

        assert!(sched.drain(Duration::from_millis(50)).await);
        let counts = executor.counts();
        assert_eq!(counts.aborted, 1);
        assert_eq!(counts.total, 1);
        assert_eq!(sched.running(), 0);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let scenario = Sleeper::new(Duration::from_millis(1));
        let (mut sched, executor, _) = scheduler(scenario, Pacing::default(), Some(2));

        sched.reconcile(3);
        wait_until(|| sched.exhausted()).await;
        // Exhausted slots are not respawned.
        sched.reconcile(3);
        wait_until(|| sched.exhausted()).await;

        sched.drain(Duration::from_secs(1)).await;
        assert_eq!(executor.counts().succeeded, 6);
    }

    #[tokio::test]
    async fn test_paused_vus_do_not_iterate() {
        let scenario = Sleeper::new(Duration::from_millis(1));
        let (mut sched, _, control) = scheduler(scenario.clone(), Pacing::default(), None);

        control.pause();
        sched.reconcile(2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scenario.started.load(Ordering::SeqCst), 0);

        control.resume();
        wait_until(|| scenario.finished.load(Ordering::SeqCst) > 0).await;
        sched.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pacing_sleep_is_cut_by_retire() {
        let scenario = Sleeper::new(Duration::ZERO);
        let pacing = Pacing { fixed: Some(Duration::from_secs(60)), min_iteration_duration: None };
        let (mut sched, executor, _) = scheduler(scenario.clone(), pacing, None);

        sched.reconcile(1);
        wait_until(|| scenario.finished.load(Ordering::SeqCst) == 1).await;
        assert!(!sched.drain(Duration::from_secs(1)).await);
        assert_eq!(executor.counts().succeeded, 1);
    }
}
