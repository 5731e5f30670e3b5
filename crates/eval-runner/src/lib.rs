pub mod cases;
pub mod config;
pub mod fsutil;
pub mod grade;
pub mod interrupt;
pub mod invoke;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod report;
pub mod results;
pub mod runner;
pub mod sandbox;
pub mod template;

pub use cases::{discover_suites, load_suite, MalformedSuiteError, SuiteManifest, TestCase};
pub use config::{EnvOverrides, HarnessConfig, Schedule, CONFIG_FILE_NAME};
pub use grade::{parse_judge_response, Grader, JudgeClient, JudgeVerdict};
pub use interrupt::{install_signal_listener, is_interrupted, Interrupt, InterruptedError};
pub use orchestrator::{plan_batches, ParallelOptions, WorkerSpawner};
pub use preflight::{check_required_tools, harness_tools, resolve_repo_root, PreconditionError};
pub use report::{render_table, RunTotals, SummaryLine};
pub use runner::{dry_run_listing, Harness, RunMode, RunReport};
pub use sandbox::{SandboxGuard, SandboxManager, ScopeId};
