//! Cellnet Simulator CLI
//!
//! Run the built-in scenarios, or a JSON configuration, under the virtual clock.

use cellnet_core::SimConfig;
use cellnet_sim::scenarios::ScenarioId;
use cellnet_env::RecordSink;
use cellnet_sim::{JsonLinesSink, ScenarioResult, ScenarioRunner, SimExport};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Ticks a configuration file runs for when it sets no `max_ticks`.
const DEFAULT_CONFIG_TICKS: u64 = 100;

/// Cellular network simulation CLI
#[derive(Parser, Debug)]
#[command(name = "cellnet-sim")]
#[command(about = "Run the cellular network actor simulation", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time) [default: 42, or the config's seed]
    #[arg(short, long)]
    seed: Option<u64>,

    /// Scenario to run (nearest_tower, capacity_reject, coverage_drop, handoff, city, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Run a JSON configuration file instead of a built-in scenario
    #[arg(short, long, conflicts_with = "scenario")]
    config: Option<PathBuf>,

    /// Override the number of ticks
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Override the tick interval in milliseconds (configuration files only)
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export CDRs and the final report of a single run to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Stream every emitted CDR, one JSON object per line, to this file
    #[arg(long)]
    cdr_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if !args.json {
        info!("Cellnet Simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let config = match &args.config {
        Some(path) => match SimConfig::from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(2);
            }
        },
        None => None,
    };

    let scenarios: Vec<ScenarioId> = if config.is_some() {
        Vec::new()
    } else if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!(
                "Available scenarios: {}, all",
                ScenarioId::all().iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
            );
            std::process::exit(1);
        })]
    };

    let runs_per_seed = if config.is_some() { 1 } else { scenarios.len() };
    if args.export.is_some() && runs_per_seed * args.seeds > 1 {
        eprintln!("Error: --export only supports a single run");
        std::process::exit(1);
    }

    // Determine base seed
    let base_seed = match args.seed {
        Some(0) => std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1),
        Some(seed) => seed,
        None => config.as_ref().map_or(42, |c| c.seed),
    };

    let cdr_output: Option<Arc<dyn RecordSink>> = match &args.cdr_out {
        Some(path) => match File::create(path) {
            Ok(file) => Some(Arc::new(JsonLinesSink::new(BufWriter::new(file)))),
            Err(e) => {
                eprintln!("Error: cannot create {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => None,
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let mut runner = ScenarioRunner::new(seed);
        if let Some(ticks) = args.ticks {
            runner = runner.with_ticks(ticks);
        }
        if let Some(output) = &cdr_output {
            runner = runner.with_cdr_output(Arc::clone(output));
        }

        let outcomes = match &config {
            Some(config) => {
                let mut config = config.clone();
                config.seed = seed;
                if let Some(interval) = args.tick_interval {
                    config.tick_interval_ms = interval;
                }
                config.max_ticks = args.ticks.or(config.max_ticks).or(Some(DEFAULT_CONFIG_TICKS));
                vec![runner.run_config("custom", config).await]
            }
            None => {
                let mut outcomes = Vec::with_capacity(scenarios.len());
                for scenario in &scenarios {
                    outcomes.push(runner.run(*scenario).await);
                }
                outcomes
            }
        };

        for outcome in outcomes {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!("Run (seed={}) aborted: {}", seed, e);
                    failed_count += 1;
                    continue;
                }
            };

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", result.scenario, result.seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        result.scenario,
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    if let Some(path) = &args.export {
        if let Some(result) = all_results.first() {
            match SimExport::from_result(result).write_to_file(path) {
                Ok(()) => info!("Exported {} CDRs to {}", result.cdrs.len(), path.display()),
                Err(e) => {
                    error!("Failed to write export: {}", e);
                    failed_count += 1;
                }
            }
        }
    }

    if let (Some(path), false) = (&args.cdr_out, args.json) {
        info!("CDR stream written to {}", path.display());
    }

    // Summary
    let total = all_results.len();
    let passed = all_results.iter().filter(|r| r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario,
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else if failed_count == 0 {
        info!("All {} runs passed", total);
    } else {
        error!("{} run(s) failed", failed_count);
        for result in all_results.iter().filter(|r| !r.passed) {
            error!(
                "  - {} seed={}: {}",
                result.scenario,
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
