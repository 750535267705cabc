use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::data::DatasetSource;
use crate::engine::ramp::{RampProfile, RampStrategy, Stage};
use crate::error::ConfigError;
use crate::stats::thresholds::{Threshold, ThresholdSet};
use crate::utils::parse_duration_str;

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// One pass/fail expression. Either a bare string (`"p(95) < 500"`) or the
/// k6 object form with `abortOnFail`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
    },
}

impl ThresholdEntry {
    fn to_threshold(&self, metric: &str) -> Result<Threshold, ConfigError> {
        match self {
            ThresholdEntry::Expression(expr) => Threshold::parse(metric, expr),
            ThresholdEntry::Detailed {
                threshold,
                abort_on_fail,
            } => Ok(Threshold::parse(metric, threshold)?.with_abort_on_fail(*abort_on_fail)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Number of concurrent workers (VUs) when no schedule is given
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration of the test (e.g., "10s", "1m") when no schedule is given
    pub duration: Option<String>,
    /// Ramping schedule (stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Pass/Fail criteria (thresholds), keyed by metric name
    #[serde(alias = "thresholds")]
    pub criteria: Option<BTreeMap<String, Vec<ThresholdEntry>>>,
    /// How concurrency moves inside a stage: "linear" (default) or "step"
    pub ramp: Option<String>,
    /// Fixed pause after every iteration
    pub pacing: Option<String>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Graceful shutdown wait time (default 30s)
    #[serde(alias = "gracefulStop")]
    pub stop: Option<String>,
    /// Iterations running longer than this are failed
    #[serde(alias = "iterationTimeout")]
    pub iteration_timeout: Option<String>,
    /// Fixed number of iterations per worker
    pub iterations: Option<u64>,
    /// Control loop tick (default 100ms)
    pub tick: Option<String>,
    /// Stop the run as soon as any threshold is breached
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Path to a JSON array of records shared by every VU
    pub dataset: Option<PathBuf>,
    /// Refuse to start when the dataset has no records
    #[serde(alias = "requireDataset")]
    pub require_dataset: Option<bool>,
    /// URL hit by the built-in probe scenario
    pub target: Option<String>,
    /// HTTP method used by the probe scenario (default GET)
    pub method: Option<String>,
}

fn optional_duration(field: &'static str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|raw| {
            parse_duration_str(raw).ok_or_else(|| ConfigError::InvalidDuration {
                field,
                value: raw.to_string(),
            })
        })
        .transpose()
}

impl Config {
    /// Read a YAML or JSON config file. The format follows the extension;
    /// anything that is not `.json` is read as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::ConfigMalformed {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Values set in `overrides` replace the ones in `self`.
    pub fn merge(mut self, overrides: Config) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() { self.$field = overrides.$field; })*
            };
        }
        take!(
            workers,
            duration,
            schedule,
            criteria,
            ramp,
            pacing,
            min_iteration_duration,
            stop,
            iteration_timeout,
            iterations,
            tick,
            abort_on_fail,
            dataset,
            require_dataset,
            target,
            method
        );
        self
    }

    /// The ramp profile: the schedule when given, otherwise `workers` held
    /// for `duration`.
    pub fn profile(&self) -> Result<RampProfile, ConfigError> {
        match &self.schedule {
            Some(steps) => {
                let stages = steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| {
                        parse_duration_str(&step.duration)
                            .map(|duration| Stage::new(duration, step.target))
                            .ok_or_else(|| ConfigError::InvalidStageDuration {
                                index,
                                value: step.duration.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                RampProfile::new(stages)
            }
            None => {
                let duration = optional_duration("duration", self.duration.as_deref())?
                    .unwrap_or(DEFAULT_DURATION);
                Ok(RampProfile::constant(self.workers.unwrap_or(DEFAULT_WORKERS), duration))
            }
        }
    }

    pub fn ramp_strategy(&self) -> Result<RampStrategy, ConfigError> {
        self.ramp
            .as_deref()
            .map(str::parse::<RampStrategy>)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// All thresholds, in metric-name order. `abort_on_fail` set at the top
    /// level applies to every one of them.
    pub fn thresholds(&self) -> Result<ThresholdSet, ConfigError> {
        let abort_all = self.abort_on_fail.unwrap_or(false);
        let mut parsed = Vec::new();
        for (metric, entries) in self.criteria.iter().flatten() {
            for entry in entries {
                let threshold = entry.to_threshold(metric)?;
                let abort = threshold.abort_on_fail || abort_all;
                parsed.push(threshold.with_abort_on_fail(abort));
            }
        }
        Ok(ThresholdSet::new(parsed))
    }

    pub fn pacing(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("pacing", self.pacing.as_deref())
    }

    pub fn min_iteration_duration(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("min_iteration_duration", self.min_iteration_duration.as_deref())
    }

    pub fn graceful_stop(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("stop", self.stop.as_deref())
    }

    pub fn iteration_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        optional_duration("iteration_timeout", self.iteration_timeout.as_deref())
    }

    pub fn tick(&self) -> Result<Option<Duration>, ConfigError> {
        match optional_duration("tick", self.tick.as_deref())? {
            Some(tick) if tick.is_zero() => Err(ConfigError::InvalidDuration {
                field: "tick",
                value: self.tick.clone().unwrap_or_default(),
            }),
            other => Ok(other),
        }
    }

    pub fn dataset_source(&self) -> Option<DatasetSource> {
        self.dataset.clone().map(DatasetSource::File)
    }
}
