use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use eval_runner::config::Schedule;
use eval_runner::orchestrator::ParallelOptions;
use eval_runner::preflight::RequiredTool;
use eval_runner::{
    check_required_tools, dry_run_listing, harness_tools, install_signal_listener, is_interrupted,
    render_table, resolve_repo_root, EnvOverrides, Harness, HarnessConfig, Interrupt,
    PreconditionError, RunMode, RunReport, SuiteManifest, CONFIG_FILE_NAME,
};
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_PRECONDITION: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "evals", version, about = "Prompt evaluation harness")]
struct Cli {
    /// Suite id, or `all`.
    #[arg(default_value = "all")]
    filter: String,
    /// List cases without invoking anything.
    #[arg(long)]
    dry: bool,
    #[arg(long)]
    eval_model: Option<String>,
    #[arg(long)]
    judge_model: Option<String>,
    /// Run suites in worker processes; N defaults to the configured ceiling.
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    parallel: Option<Option<u64>>,
    #[arg(long, value_enum)]
    schedule: Option<ScheduleArg>,
    /// Directory holding suite files; defaults to `<repo>/evals`.
    #[arg(long)]
    evals_dir: Option<PathBuf>,
    /// Defaults to `<evals-dir>/harness.yaml`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, hide = true, requires = "run_dir")]
    worker_suite: Option<String>,
    #[arg(long, hide = true, requires = "worker_suite")]
    run_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScheduleArg {
    #[value(name = "batched")]
    Batched,
    #[value(name = "pool")]
    Pool,
}

impl From<ScheduleArg> for Schedule {
    fn from(value: ScheduleArg) -> Self {
        match value {
            ScheduleArg::Batched => Schedule::Batched,
            ScheduleArg::Pool => Schedule::Pool,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing();
    let interrupt = Interrupt::new();
    if let Err(err) = install_signal_listener(&interrupt) {
        warn!(%err, "running without interrupt handling");
    }
    let json_mode = cli.json;
    let code = match run(cli, &interrupt) {
        Ok(code) => code,
        Err(err) => {
            let (code, kind) = classify(&err);
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": { "kind": kind, "message": format!("{:#}", err) },
                }));
            } else {
                error!("{:#}", err);
                eprintln!("error: {:#}", err);
            }
            code
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn classify(err: &anyhow::Error) -> (i32, &'static str) {
    if is_interrupted(err) {
        (EXIT_INTERRUPTED, "interrupted")
    } else if err.downcast_ref::<PreconditionError>().is_some() {
        (EXIT_PRECONDITION, "precondition_failed")
    } else {
        (EXIT_FAILED, "command_failed")
    }
}

fn run_mode(cli: &Cli, config: &HarnessConfig) -> RunMode {
    if let (Some(suite), Some(run_dir)) = (&cli.worker_suite, &cli.run_dir) {
        return RunMode::Worker {
            suite: suite.clone(),
            run_dir: run_dir.clone(),
        };
    }
    if cli.dry {
        return RunMode::Dry;
    }
    match cli.parallel {
        Some(n) => RunMode::Parallel {
            max: n.map(|n| n as usize).unwrap_or(config.parallel.default_max),
            schedule: cli
                .schedule
                .map(Into::into)
                .unwrap_or(config.parallel.schedule),
        },
        None => RunMode::Sequential,
    }
}

fn run(cli: Cli, interrupt: &Interrupt) -> Result<i32> {
    let env = EnvOverrides::from_vars(std::env::vars())?;
    let cwd = std::env::current_dir().context("failed to read current directory")?;

    if !cli.dry {
        check_required_tools(&[RequiredTool {
            program: "git",
            role: "sandbox",
        }])?;
    }
    let repo_root = match resolve_repo_root(&cwd) {
        Ok(root) => root,
        Err(_) if cli.dry => cwd.clone(),
        Err(err) => return Err(err.into()),
    };
    let evals_dir = match &cli.evals_dir {
        Some(dir) => absolutize(&cwd, dir),
        None => repo_root.join("evals"),
    };
    let config_path = match &cli.config {
        Some(path) => absolutize(&cwd, path),
        None => evals_dir.join(CONFIG_FILE_NAME),
    };

    let mut config = HarnessConfig::load_or_default(&config_path)?;
    config.apply_env(&env);
    if let Some(model) = &cli.eval_model {
        config.models.eval = model.clone();
    }
    if let Some(model) = &cli.judge_model {
        config.models.judge = model.clone();
    }
    let mode = run_mode(&cli, &config);
    let harness = Harness::new(config, &repo_root, &evals_dir, interrupt)?;

    if let RunMode::Worker { suite, run_dir } = &mode {
        harness.run_worker(suite, run_dir)?;
        return Ok(EXIT_OK);
    }

    let suites = harness.load_suites(&cli.filter)?;
    if mode == RunMode::Dry {
        print_dry_run(&suites, cli.json);
        return Ok(EXIT_OK);
    }

    check_required_tools(&harness_tools(
        harness.target_program(),
        harness.judge_program(),
    ))?;
    match harness.sandboxes().sweep_stale() {
        Ok(report) if !report.skipped_live.is_empty() => {
            info!(branches = ?report.skipped_live, "left sandbox branches of live runs alone")
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "stale sandbox sweep failed"),
    }

    let report = match &mode {
        RunMode::Parallel { max, schedule } => {
            let options = ParallelOptions::new(*max, *schedule);
            let forwarded = worker_args(&evals_dir, &config_path, harness.config());
            harness.run_parallel(&suites, &options, forwarded)?
        }
        _ => harness.run_sequential(&suites)?,
    };
    print_report(&report, mode.label(), cli.json);
    Ok(report.totals.exit_code())
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Flags a worker needs to resolve the same configuration as its parent.
/// Environment overrides reach workers by inheritance.
fn worker_args(evals_dir: &Path, config_path: &Path, config: &HarnessConfig) -> Vec<String> {
    let mut args = vec![
        "--evals-dir".to_string(),
        evals_dir.to_string_lossy().to_string(),
        "--eval-model".to_string(),
        config.models.eval.clone(),
        "--judge-model".to_string(),
        config.models.judge.clone(),
    ];
    if config_path.is_file() {
        args.push("--config".to_string());
        args.push(config_path.to_string_lossy().to_string());
    }
    args
}

fn print_dry_run(suites: &[SuiteManifest], json_mode: bool) {
    if json_mode {
        let cases: Vec<Value> = suites
            .iter()
            .flat_map(|suite| {
                suite.cases.iter().map(move |case| {
                    json!({
                        "suite": suite.id,
                        "id": case.id,
                        "should_trigger": case.should_trigger,
                        "prompt": case.prompt,
                        "expected_behaviors": case.expected_behaviors,
                    })
                })
            })
            .collect();
        emit_json(&json!({ "ok": true, "mode": "dry", "cases": cases }));
        return;
    }
    print!("{}", dry_run_listing(suites));
}

fn print_report(report: &RunReport, mode: &str, json_mode: bool) {
    if json_mode {
        emit_json(&json!({
            "ok": report.totals.failed == 0,
            "mode": mode,
            "run_id": report.run_id,
            "run_dir": report.run_dir.display().to_string(),
            "totals": report.totals,
            "crashed": report.crashed,
            "lines": report.lines,
        }));
        return;
    }
    print!(
        "{}",
        render_table(&report.lines, std::io::stdout().is_terminal())
    );
    println!("run_id: {}", report.run_id);
    println!("run_dir: {}", report.run_dir.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => eprintln!("failed to render json output: {}", err),
    }
}
