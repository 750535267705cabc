pub mod bridge;
pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use bridge::ScenarioContext;
pub use engine::executor::Scenario;
pub use engine::{Engine, RunPlan, RunResult};
pub use error::{ConfigError, EngineError, ScenarioError};
pub use utils::parse_duration_str;
