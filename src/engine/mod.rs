//! Run orchestration: setup, the ramp control loop, draining, teardown and
//! the final verdict.

pub mod control;
pub mod executor;
pub mod ramp;
pub mod scheduler;

use crossbeam_channel::Receiver;
use futures::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::data::{self, Dataset, DatasetSource};
use crate::bridge::http::HttpClient;
use crate::bridge::metrics::MetricsHandle;
use crate::bridge::{ScenarioContext, SetupData};
use crate::cli::config::Config;
use crate::error::{ConfigError, EngineError, EXIT_OK, EXIT_THRESHOLDS_FAILED};
use crate::stats::thresholds::{ThresholdResult, ThresholdSet};
use crate::stats::{MetricKind, ShardedAggregator, Snapshot, VUS, VUS_MAX};

use self::control::{ControlCommand, ControlState};
use self::executor::{panic_message, OutcomeCounts, Scenario, ScenarioExecutor};
use self::ramp::{RampController, RampProfile, RampState, RampStrategy};
use self::scheduler::{Pacing, VuScheduler};

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Shard key used for engine-level samples (setup, teardown, VU gauges).
const ENGINE_KEY: usize = 0;

/// Everything that shapes a run, resolved and validated.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub profile: RampProfile,
    pub strategy: RampStrategy,
    pub thresholds: ThresholdSet,
    pub pacing: Pacing,
    /// Drain period after the profile ends or a stop is requested.
    pub graceful_stop: Duration,
    pub iteration_timeout: Option<Duration>,
    /// Per-VU iteration limit.
    pub max_iterations: Option<u64>,
    pub tick: Duration,
    pub dataset: Option<DatasetSource>,
    pub require_dataset: bool,
}

impl RunPlan {
    pub fn new(profile: RampProfile) -> Self {
        Self {
            profile,
            strategy: RampStrategy::default(),
            thresholds: ThresholdSet::default(),
            pacing: Pacing::default(),
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            iteration_timeout: None,
            max_iterations: None,
            tick: DEFAULT_TICK,
            dataset: None,
            require_dataset: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if config.iterations == Some(0) {
            return Err(ConfigError::Invalid("iterations must be at least 1".to_string()));
        }
        Ok(Self {
            profile: config.profile()?,
            strategy: config.ramp_strategy()?,
            thresholds: config.thresholds()?,
            pacing: Pacing {
                fixed: config.pacing()?,
                min_iteration_duration: config.min_iteration_duration()?,
            },
            graceful_stop: config.graceful_stop()?.unwrap_or(DEFAULT_GRACEFUL_STOP),
            iteration_timeout: config.iteration_timeout()?,
            max_iterations: config.iterations,
            tick: config.tick()?.unwrap_or(DEFAULT_TICK),
            dataset: config.dataset_source(),
            require_dataset: config.require_dataset.unwrap_or(false),
        })
    }
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Final snapshot plus verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub metrics: Snapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub outcomes: OutcomeCounts,
    #[serde(serialize_with = "as_secs", rename = "elapsed_secs")]
    pub elapsed: Duration,
    /// Stopped from outside (Ctrl-C, `stop` command) before the profile ended.
    pub interrupted: bool,
    /// The drain grace period expired and in-flight iterations were aborted.
    pub hard_stopped: bool,
    /// The abort-on-fail threshold that ended the run early.
    pub aborted_by: Option<ThresholdResult>,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.aborted_by.is_none() && self.thresholds.iter().all(|t| t.passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            EXIT_OK
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn report(&self) {
        self.metrics.report();
        println!(
            "Iterations: {} total, {} succeeded, {} failed, {} aborted ({:.2}s)",
            self.outcomes.total,
            self.outcomes.succeeded,
            self.outcomes.failed,
            self.outcomes.aborted,
            self.elapsed.as_secs_f64()
        );
        if self.interrupted {
            println!("Run was interrupted before the profile completed.");
        }
        if let Some(breach) = &self.aborted_by {
            println!("Run aborted early by threshold: {}", breach);
        }
        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for result in &self.thresholds {
                println!("  {}", result);
            }
        }
        println!("\nResult: {}", if self.passed() { "PASSED" } else { "FAILED" });
    }
}

/// Drives one run of a scenario against a [`RunPlan`].
pub struct Engine {
    plan: RunPlan,
    control: Arc<ControlState>,
}

impl Engine {
    pub fn new(plan: RunPlan) -> Self {
        Self {
            plan,
            control: Arc::new(ControlState::new()),
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Handle for outside callers (signal handlers, interactive input).
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub async fn run(
        &self,
        scenario: Arc<dyn Scenario>,
        control_rx: Option<Receiver<ControlCommand>>,
    ) -> Result<RunResult, EngineError> {
        let plan = &self.plan;
        let require_dataset = plan.require_dataset || scenario.requires_dataset();
        let dataset = match &plan.dataset {
            Some(source) => data::load(source, require_dataset)?,
            None if require_dataset => {
                return Err(ConfigError::DatasetEmpty("<none configured>".to_string()).into())
            }
            None => Dataset::empty(),
        };

        let max_workers = plan.profile.max_target();
        let aggregator = Arc::new(ShardedAggregator::for_workers(max_workers));
        let http = HttpClient::for_workers(max_workers)
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {}", e)))?;

        let lifecycle_ctx = |setup_data: SetupData| {
            ScenarioContext::new(
                ENGINE_KEY,
                0,
                dataset.clone(),
                setup_data,
                MetricsHandle::new(aggregator.clone(), ENGINE_KEY),
                http.clone(),
            )
        };

        tracing::info!(scenario = scenario.name(), "running setup");
        let setup_data: SetupData = Arc::new(
            run_setup(scenario.as_ref(), &lifecycle_ctx(Arc::new(JsonValue::Null)))
                .await?
                .unwrap_or(JsonValue::Null),
        );
        tracing::info!("setup complete");

        let executor = Arc::new(ScenarioExecutor::new(
            scenario.clone(),
            dataset.clone(),
            setup_data.clone(),
            aggregator.clone(),
            http.clone(),
            plan.iteration_timeout,
        ));
        let mut scheduler = VuScheduler::new(
            executor.clone(),
            self.control.clone(),
            plan.pacing,
            plan.max_iterations,
        );
        let mut ramp = RampController::new(plan.profile.clone(), plan.strategy);

        let started = Instant::now();
        let paused_before = self.control.total_paused();
        let mut interrupted = false;
        let mut aborted_by = None;
        let mut ticker = tokio::time::interval(plan.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            stages = plan.profile.stages().len(),
            duration = ?plan.profile.total_duration(),
            max_vus = max_workers,
            "starting ramp"
        );
        ramp.start();
        loop {
            ticker.tick().await;

            if let Some(rx) = &control_rx {
                while let Ok(cmd) = rx.try_recv() {
                    self.apply_command(cmd, &scheduler, &ramp, &executor);
                }
            }
            if self.control.is_stopped() {
                interrupted = ramp.state() != RampState::Draining;
                break;
            }

            // The profile clock stands still while paused.
            let paused = self.control.total_paused().saturating_sub(paused_before);
            let elapsed = started.elapsed().saturating_sub(paused);
            let scheduled = ramp.tick(elapsed);
            if ramp.state() == RampState::Draining {
                break;
            }

            let desired = self.control.target_override().unwrap_or(scheduled);
            scheduler.reconcile(desired);
            aggregator.record(ENGINE_KEY, VUS, MetricKind::Gauge, scheduler.running() as f64);
            aggregator.record(ENGINE_KEY, VUS_MAX, MetricKind::Gauge, scheduler.peak() as f64);

            if plan.thresholds.has_abort_on_fail() {
                if let Some(breach) = plan.thresholds.breached_abort(&aggregator.snapshot()) {
                    tracing::warn!(threshold = %breach, "abort-on-fail threshold breached, stopping run");
                    aborted_by = Some(breach);
                    break;
                }
            }
        }

        ramp.cancel();
        tracing::info!(grace = ?plan.graceful_stop, vus = scheduler.running(), "draining VUs");
        let hard_stopped = scheduler.drain(plan.graceful_stop).await;
        ramp.finish();
        let elapsed = started.elapsed();

        tracing::info!("running teardown");
        run_teardown(scenario.as_ref(), &lifecycle_ctx(setup_data)).await;

        let metrics = aggregator.snapshot();
        let thresholds = plan.thresholds.evaluate(&metrics);
        let outcomes = executor.counts();
        tracing::info!(
            iterations = outcomes.total,
            failed = outcomes.failed,
            aborted = outcomes.aborted,
            "run finished"
        );

        Ok(RunResult {
            metrics,
            thresholds,
            outcomes,
            elapsed,
            interrupted,
            hard_stopped,
            aborted_by,
        })
    }

    fn apply_command(
        &self,
        cmd: ControlCommand,
        scheduler: &VuScheduler,
        ramp: &RampController,
        executor: &ScenarioExecutor,
    ) {
        match cmd {
            ControlCommand::Ramp(target) => {
                tracing::info!(vus = target, "control: ramping to fixed VU count");
                self.control.set_target_override(target);
            }
            ControlCommand::Pause => {
                tracing::info!("control: pausing VUs");
                self.control.pause();
            }
            ControlCommand::Resume => {
                tracing::info!("control: resuming VUs");
                self.control.resume();
            }
            ControlCommand::Status => {
                let counts = executor.counts();
                let state = if self.control.is_paused() { "PAUSED" } else { "RUNNING" };
                println!(
                    "[Status] VUs: {} (desired {}), State: {}, Stage: {:?}, Iterations: {} ({} failed)",
                    scheduler.running(),
                    self.control.target_override().unwrap_or(ramp.desired()),
                    state,
                    ramp.state(),
                    counts.total,
                    counts.failed
                );
            }
            ControlCommand::Stop => {
                tracing::info!("control: stopping test");
                self.control.stop();
            }
        }
    }
}

/// Any error or panic in setup fails the whole run before a VU exists.
async fn run_setup(
    scenario: &dyn Scenario,
    ctx: &ScenarioContext,
) -> Result<Option<JsonValue>, EngineError> {
    let failure = match AssertUnwindSafe(scenario.setup(ctx)).catch_unwind().await {
        Ok(Ok(data)) => return Ok(data),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload)),
    };
    tracing::error!(error = %failure, "setup failed, no VUs will start");
    Err(EngineError::Setup(failure))
}

/// Teardown is best-effort; failures are logged and leave the verdict alone.
async fn run_teardown(scenario: &dyn Scenario, ctx: &ScenarioContext) {
    match AssertUnwindSafe(scenario.teardown(ctx)).catch_unwind().await {
        Ok(Ok(())) => tracing::info!("teardown complete"),
        Ok(Err(e)) => tracing::warn!(error = %e, "teardown failed"),
        Err(payload) => tracing::warn!(error = %panic_message(payload), "teardown panicked"),
    }
}
