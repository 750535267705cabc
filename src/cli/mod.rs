pub mod config;
pub mod probe;
pub mod validate;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use self::config::Config;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Staged load generation with virtual users, metrics and thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test with the built-in HTTP probe scenario
    Run(RunArgs),
    /// Check a configuration file without running it
    Validate {
        /// Path to the configuration file (YAML/JSON)
        config: PathBuf,
    },
    /// Print the JSON schema of the configuration file
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to the configuration file (YAML/JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Concurrent VUs when no schedule is configured
    #[arg(short, long, alias = "vus")]
    pub workers: Option<usize>,

    /// Test duration when no schedule is configured (e.g. 30s, 1m)
    #[arg(short, long)]
    pub duration: Option<String>,

    /// URL the probe scenario requests
    #[arg(short, long)]
    pub target: Option<String>,

    /// HTTP method for the probe scenario
    #[arg(short = 'X', long)]
    pub method: Option<String>,

    /// JSON array of records; each VU sends its record as the request body
    #[arg(long)]
    pub dataset: Option<PathBuf>,

    /// Ramp strategy inside stages: linear or step
    #[arg(long)]
    pub ramp: Option<String>,

    /// Graceful stop period before in-flight iterations are aborted
    #[arg(long)]
    pub stop: Option<String>,

    /// Iterations per VU
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Print the final summary as JSON instead of text
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Export final summary to a JSON file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Read control commands (ramp N, pause, resume, status, stop) from stdin
    #[arg(long, default_value_t = false)]
    pub interactive: bool,
}

impl RunArgs {
    /// Flag values as a config layer that overrides the file.
    pub fn overrides(&self) -> Config {
        Config {
            workers: self.workers,
            duration: self.duration.clone(),
            target: self.target.clone(),
            method: self.method.clone(),
            dataset: self.dataset.clone(),
            ramp: self.ramp.clone(),
            stop: self.stop.clone(),
            iterations: self.iterations,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "barrage", "run", "--vus", "25", "-d", "1m", "-t", "http://localhost:8065", "-X", "POST", "--json",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, Some(25));
        assert!(args.json);

        let file = Config {
            workers: Some(5),
            stop: Some("10s".to_string()),
            ..Default::default()
        };
        let merged = file.merge(args.overrides());
        assert_eq!(merged.workers, Some(25));
        assert_eq!(merged.duration.as_deref(), Some("1m"));
        assert_eq!(merged.method.as_deref(), Some("POST"));
        assert_eq!(merged.stop.as_deref(), Some("10s"));
    }

    #[test]
    fn test_parse_validate_and_schema() {
        let cli = Cli::parse_from(["barrage", "validate", "load.yaml"]);
        assert!(matches!(cli.command, Commands::Validate { .. }));
        let cli = Cli::parse_from(["barrage", "schema", "-o", "schema.json"]);
        assert!(matches!(cli.command, Commands::Schema { output: Some(_) }));
    }
}
