use std::path::PathBuf;
use thiserror::Error;

/// Exit status for a run whose thresholds all passed.
pub const EXIT_OK: i32 = 0;
/// Exit status when at least one threshold failed.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Exit status for unexpected engine failures.
pub const EXIT_INTERNAL: i32 = 103;
/// Exit status for configuration errors detected before any VU runs.
pub const EXIT_CONFIG: i32 = 104;
/// Exit status when the setup callable aborted the run.
pub const EXIT_SETUP: i32 = 107;

/// Fatal problems with the run configuration. None of these let a VU start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ramp profile has no stages")]
    EmptyProfile,

    #[error("stage {index}: invalid duration '{value}'")]
    InvalidStageDuration { index: usize, value: String },

    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid threshold '{expression}' for metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("unknown ramp strategy '{0}' (expected 'linear' or 'step')")]
    UnknownRampStrategy(String),

    #[error("failed to read dataset {path}: {source}")]
    DatasetUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dataset {origin}: {source}")]
    DatasetMalformed {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("dataset {0} is empty but the scenario requires records")]
    DatasetEmpty(String),

    #[error("failed to read config {path}: {source}")]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    ConfigMalformed { path: PathBuf, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised by scenario code (iterations, setup or teardown).
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Explicit abort signal, the equivalent of k6's `fail()`.
    #[error("aborted: {0}")]
    Abort(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScenarioError {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }
}

/// Errors that prevent a run from producing a snapshot at all.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => EXIT_CONFIG,
            EngineError::Setup(_) => EXIT_SETUP,
            EngineError::Internal(_) => EXIT_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let config = EngineError::Config(ConfigError::EmptyProfile);
        let setup = EngineError::Setup("no admin".to_string());
        assert_eq!(config.exit_code(), EXIT_CONFIG);
        assert_eq!(setup.exit_code(), EXIT_SETUP);
        assert_ne!(config.exit_code(), EXIT_THRESHOLDS_FAILED);
        assert_ne!(setup.exit_code(), EXIT_THRESHOLDS_FAILED);
        assert_ne!(config.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_scenario_abort_message() {
        let err = ScenarioError::abort("could not find any team");
        assert_eq!(err.to_string(), "aborted: could not find any team");
    }
}
