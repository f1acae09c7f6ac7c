use anyhow::Result;
use clap::{Parser, Subcommand};
use sbench_analysis::{AggregationOutcome, AggregationSettings};
use sbench_core::{DEFAULT_REPORTING_PERIOD_SECS, DEFAULT_TIMEOUT_SECS};
use sbench_runner::{BenchPlan, RunOutcome, RunResult};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbench", version, about = "Streaming query benchmark harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every configured run, one at a time.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print the planned runs.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Collect the per-run metric logs into a single table.
    Aggregate {
        results: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
        #[arg(long, default_value_t = DEFAULT_REPORTING_PERIOD_SECS)]
        reporting_period: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
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
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SBENCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let plan = sbench_runner::load_plan(&config)?;
            let results = sbench_runner::run_plan(&plan)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "plan": plan_to_json(&plan),
                    "runs": results.iter().map(run_result_to_json).collect::<Vec<_>>(),
                })));
            }
            for result in &results {
                println!(
                    "{}: {} peak_memory={} elapsed={:.1}s",
                    result.id,
                    outcome_label(&result.outcome),
                    result.peak_memory.unwrap_or(0),
                    result.elapsed.as_secs_f64()
                );
            }
            println!("runs_completed: {}", results.len());
        }
        Commands::Describe { config, json } => {
            let plan = sbench_runner::load_plan(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": plan_to_json(&plan),
                })));
            }
            print_plan(&plan);
        }
        Commands::Aggregate {
            results,
            output,
            timeout,
            reporting_period,
            json,
        } => {
            if reporting_period == 0 {
                return Err(anyhow::anyhow!("--reporting-period must be at least 1"));
            }
            let settings = AggregationSettings {
                timeout_secs: timeout,
                reporting_period_secs: reporting_period,
            };
            let outcome = sbench_analysis::aggregate_results(&results, &settings)?;
            sbench_analysis::write_aggregated_report(&output, &outcome.records)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "output": output.display().to_string(),
                    "aggregation": aggregation_to_json(&outcome),
                })));
            }
            for failure in &outcome.failures {
                eprintln!("error: {}", failure);
            }
            println!("runs_aggregated: {}", outcome.records.len());
            println!("runs_skipped: {}", outcome.failures.len());
            println!("output: {}", output.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Aggregate { json, .. } => *json,
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Exited { code: Some(code) } => format!("exited({})", code),
        RunOutcome::Exited { code: None } => "exited(signal)".to_string(),
        RunOutcome::TimedOut => "timed_out".to_string(),
    }
}

fn plan_to_json(plan: &BenchPlan) -> Value {
    json!({
        "config": plan.config_path.display().to_string(),
        "project_base": plan.project_base.display().to_string(),
        "dataset": plan.dataset.display().to_string(),
        "report_folder": plan.report_folder.display().to_string(),
        "input_type": plan.input_kind,
        "timeout_secs": plan.timeout.as_secs(),
        "poll_interval_secs": plan.poll_interval.as_secs(),
        "log_level": plan.log_level,
        "runs": plan.runs.iter().map(|spec| json!({
            "run_id": spec.id.encode(),
            "report_dir": spec.report_dir.display().to_string(),
            "command": spec.command_line(),
        })).collect::<Vec<_>>(),
    })
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.id.encode(),
        "report_dir": result.report_dir.display().to_string(),
        "outcome": result.outcome.as_str(),
        "peak_memory_bytes": result.peak_memory,
        "elapsed_secs": result.elapsed.as_secs_f64(),
    })
}

fn aggregation_to_json(outcome: &AggregationOutcome) -> Value {
    json!({
        "records": outcome.records.len(),
        "failures": outcome.failures.iter().map(|f| json!({
            "run": f.run(),
            "message": f.to_string(),
        })).collect::<Vec<_>>(),
    })
}

fn print_plan(plan: &BenchPlan) {
    println!("config: {}", plan.config_path.display());
    println!("dataset: {}", plan.dataset.display());
    println!("report_folder: {}", plan.report_folder.display());
    println!("input_type: {}", plan.input_kind);
    println!("timeout: {}s", plan.timeout.as_secs());
    println!("poll_interval: {}s", plan.poll_interval.as_secs());
    println!("runs: {}", plan.runs.len());
    for spec in &plan.runs {
        println!("  {}", spec.id);
        println!("    command: {:?}", spec.command_line());
    }
}
