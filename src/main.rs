use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use barrage::cli::config::Config;
use barrage::cli::probe::HttpProbe;
use barrage::cli::{Cli, Commands, RunArgs};
use barrage::engine::control::{parse_control_command, ControlCommand};
use barrage::engine::{Engine, RunPlan};
use barrage::error::{ConfigError, EngineError, EXIT_CONFIG, EXIT_OK};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_interactive_input() -> crossbeam_channel::Receiver<ControlCommand> {
    use std::io::BufRead;

    let (tx, rx) = crossbeam_channel::unbounded::<ControlCommand>();

    println!("Interactive mode enabled. Commands: ramp <N>, pause, resume, status, stop");
    println!("   Type commands and press Enter.\n");

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(|line| line.ok()) {
            if let Some(cmd) = parse_control_command(&line) {
                if tx.send(cmd).is_err() {
                    break; // Channel closed
                }
            } else if !line.trim().is_empty() {
                println!("Unknown command: {}", line.trim());
            }
        }
    });

    rx
}

fn run(args: RunArgs) -> Result<i32, EngineError> {
    let file_config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = file_config.merge(args.overrides());
    let plan = RunPlan::from_config(&config)?;
    let target = config
        .target
        .clone()
        .ok_or_else(|| ConfigError::Invalid("no target URL: set 'target' or pass --target".to_string()))?;
    let probe = HttpProbe::new(target, config.method.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to start runtime: {}", e)))?;

    let engine = Engine::new(plan);
    let control_rx = args.interactive.then(spawn_interactive_input);

    let result = runtime.block_on(async {
        let control = engine.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping test");
                control.stop();
            }
        });
        engine.run(Arc::new(probe), control_rx).await
    })?;

    if args.json {
        println!("{}", result.to_json());
    } else {
        result.report();
    }
    if let Some(path) = &args.export_json {
        match std::fs::write(path, result.to_json()) {
            Ok(()) => tracing::info!(path = %path.display(), "summary exported"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to export summary"),
        }
    }

    Ok(result.exit_code())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => match run(args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {}", e);
                e.exit_code()
            }
        },
        Commands::Validate { config } => match barrage::cli::validate::run_validate(&config) {
            Ok(_) => EXIT_OK,
            Err(_) => EXIT_CONFIG,
        },
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            EXIT_OK
        }
    };

    std::process::exit(code);
}
