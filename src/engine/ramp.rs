use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// One segment of a ramp profile: reach `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How desired concurrency moves inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RampStrategy {
    /// Interpolate from the stage's starting concurrency to its target.
    #[default]
    Linear,
    /// Jump to the stage's target as soon as the stage begins.
    Step,
}

impl FromStr for RampStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(RampStrategy::Linear),
            "step" => Ok(RampStrategy::Step),
            other => Err(ConfigError::UnknownRampStrategy(other.to_string())),
        }
    }
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    stages: Vec<Stage>,
}

impl RampProfile {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyProfile);
        }
        Ok(Self { stages })
    }

    /// `workers` VUs for the whole of `duration`.
    pub fn constant(workers: usize, duration: Duration) -> Self {
        Self {
            stages: vec![Stage::new(Duration::ZERO, workers), Stage::new(duration, workers)],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    pub fn final_target(&self) -> usize {
        self.stages.last().map(|s| s.target).unwrap_or(0)
    }

    /// Stage index active at `elapsed` (None once the profile has ended) and
    /// the desired concurrency at that instant. After the end the final
    /// target is held.
    pub fn position(&self, strategy: RampStrategy, elapsed: Duration) -> (Option<usize>, usize) {
        let mut stage_start = Duration::ZERO;
        let mut from = 0usize;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let desired = match strategy {
                    RampStrategy::Step => stage.target,
                    RampStrategy::Linear => {
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        let diff = stage.target as f64 - from as f64;
                        (from as f64 + diff * progress).round() as usize
                    }
                };
                return (Some(index), desired);
            }
            stage_start = stage_end;
            from = stage.target;
        }
        (None, self.final_target())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    Idle,
    Ramping(usize),
    Draining,
    Done,
}

/// Single writer of desired concurrency. Driven by the engine's control loop.
#[derive(Debug)]
pub struct RampController {
    profile: RampProfile,
    strategy: RampStrategy,
    state: RampState,
    desired: usize,
}

impl RampController {
    pub fn new(profile: RampProfile, strategy: RampStrategy) -> Self {
        Self {
            profile,
            strategy,
            state: RampState::Idle,
            desired: 0,
        }
    }

    pub fn profile(&self) -> &RampProfile {
        &self.profile
    }

    pub fn state(&self) -> RampState {
        self.state
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    pub fn start(&mut self) {
        if self.state == RampState::Idle {
            self.state = RampState::Ramping(0);
            self.tick(Duration::ZERO);
        }
    }

    /// Advance to `elapsed` since start and return the desired concurrency.
    pub fn tick(&mut self, elapsed: Duration) -> usize {
        if let RampState::Ramping(current) = self.state {
            let (stage, desired) = self.profile.position(self.strategy, elapsed);
            self.desired = desired;
            match stage {
                Some(index) => {
                    if index != current {
                        tracing::info!(stage = index, vus = self.profile.stages[index].target, "entering stage");
                    }
                    self.state = RampState::Ramping(index);
                }
                None => {
                    tracing::info!(desired, "ramp profile complete, draining");
                    self.state = RampState::Draining;
                }
            }
        }
        self.desired
    }

    /// External stop: force draining from any state but `Done`.
    pub fn cancel(&mut self) {
        if self.state != RampState::Done && self.state != RampState::Draining {
            tracing::info!(state = ?self.state, "ramp cancelled, draining");
            self.state = RampState::Draining;
        }
    }

    pub fn finish(&mut self) {
        self.cancel();
        self.state = RampState::Done;
        self.desired = 0;
    }
}
