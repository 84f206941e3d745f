use anyhow::Result;
use clap::{Parser, Subcommand};
use fuzz_runner::config::{self, FuzzConfig, CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mapfuzz", version = "0.3.0", about = "Map and action-sequence fuzzer")]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Target argv prefix after `--`; map path and action sequence are
        /// appended.
        #[arg(last = true, value_name = "TARGET")]
        target: Vec<String>,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        results: Option<PathBuf>,
    },
}

#[derive(Default)]
struct RunOverrides {
    target: Option<Vec<String>>,
    iterations: Option<usize>,
    timeout_ms: Option<u64>,
    results: Option<PathBuf>,
    seed: Option<u64>,
}

impl RunOverrides {
    fn apply(self, config: &mut FuzzConfig) {
        if let Some(target) = self.target {
            config.target.command = target;
        }
        if let Some(n) = self.iterations {
            config.budget.max_iterations = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.budget.iteration_timeout_ms = ms;
        }
        if let Some(root) = self.results {
            config.results.root = root;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so stdout stays clean for `--json`.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            target,
            iterations,
            timeout_ms,
            results,
            seed,
            json,
        } => {
            let mut cfg = resolve_config(config.as_deref())?;
            RunOverrides {
                target: (!target.is_empty()).then_some(target),
                iterations,
                timeout_ms,
                results,
                seed,
            }
            .apply(&mut cfg);
            let summary = fuzz_runner::run_fuzz(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&summary)?
                })));
            }
            print_run_summary(&summary);
        }
        Commands::Describe { config, json } => {
            let cfg = resolve_config(config.as_deref())?;
            cfg.validate()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config": serde_json::to_value(&cfg)?
                })));
            }
            print!("{}", cfg.to_yaml()?);
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join(DEFAULT_CONFIG_FILE);
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: mapfuzz describe --config {}", path.display());
        }
        Commands::Clean { config, results } => {
            let root = match results {
                Some(root) => root,
                None => resolve_config(config.as_deref())?.results.root,
            };
            if fuzz_runner::remove_results(&root)? {
                println!("removed: {}", root.display());
            } else {
                println!("nothing to remove: {}", root.display());
            }
        }
    }
    Ok(None)
}

/// An explicit `--config` must exist; otherwise `fuzz.yaml` in the working
/// directory is used when present, falling back to built-in defaults.
fn resolve_config(path: Option<&Path>) -> Result<FuzzConfig> {
    match path {
        Some(p) => config::load_config(p),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                config::load_config(&default_path)
            } else {
                debug!("no {} in working directory; using defaults", DEFAULT_CONFIG_FILE);
                Ok(FuzzConfig::default())
            }
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn print_run_summary(summary: &fuzz_runner::RunSummary) {
    println!("attempt: {}", summary.attempt);
    println!("iterations: {}", summary.iterations);
    println!("accepted: {}", summary.counts.accepted);
    println!("crashed: {}", summary.counts.crashed);
    println!("rejected: {}", summary.counts.rejected);
    println!("timed_out: {}", summary.counts.timed_out);
    println!("unknown: {}", summary.counts.unknown);
    println!(
        "stopped_by: {}",
        match summary.stop_reason {
            fuzz_runner::StopReason::IterationBudget => "iteration_budget",
            fuzz_runner::StopReason::TimeBudget => "time_budget",
        }
    );
    println!("elapsed_ms: {}", summary.elapsed_ms);
    println!("results_root: {}", summary.results_root.display());
    println!("logs_dir: {}", summary.logs_dir.display());
    for failure in &summary.log_failures {
        println!("log_write_failed: {}", failure);
    }
}
