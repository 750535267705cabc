use std::path::Path;

use crate::cli::config::Config;
use crate::engine::RunPlan;
use crate::error::ConfigError;
use crate::utils::format_duration;

/// Validate a config file without running it: parse it, resolve the ramp
/// profile, thresholds and durations, and print what the run would do.
pub fn run_validate(config_path: &Path) -> Result<RunPlan, ConfigError> {
    println!("Validating {}...", config_path.display());

    let config = Config::load(config_path).inspect_err(|e| println!("  ✗ {}", e))?;
    println!("  ✓ Config file parsed");

    let plan = RunPlan::from_config(&config).inspect_err(|e| println!("  ✗ {}", e))?;
    println!("  ✓ Configuration valid");

    println!(
        "    stages: {} stage(s), {} total, up to {} VUs ({:?})",
        plan.profile.stages().len(),
        format_duration(plan.profile.total_duration()),
        plan.profile.max_target(),
        plan.strategy
    );
    println!("    graceful stop: {}", format_duration(plan.graceful_stop));
    if let Some(max) = plan.max_iterations {
        println!("    iterations per VU: {}", max);
    }
    for threshold in plan.thresholds.iter() {
        let abort = if threshold.abort_on_fail { " (abort on fail)" } else { "" };
        println!("    threshold {}: {}{}", threshold.metric, threshold.expression, abort);
    }
    match &config.target {
        Some(target) => println!("    target: {} {}", config.method.as_deref().unwrap_or("GET"), target),
        None => println!("  ⚠ No 'target' set; `run` will need --target"),
    }

    Ok(plan)
}
