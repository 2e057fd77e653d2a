//! nvstack Binary
//!
//! Run with: `nvstack [exec|recover] --heap PATH --stacks DIR`

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nvstack_driver::{run_exec, run_recover, CrashPlan, DemoPaths, INITIAL_VALUE};
use nvstack_runtime::{FaultPoint, LogLevel, RuntimeConfig};

#[derive(Parser)]
#[command(name = "nvstack")]
#[command(about = "Crash-consistent CAS workload over persistent stacks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct Common {
    /// Number of worker threads (default: NVSTACK_NUM_THREADS or CPU count)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Heap file
    #[arg(long)]
    heap: PathBuf,

    /// Directory holding the per-thread stack files
    #[arg(long)]
    stacks: PathBuf,

    /// Create and format a new heap
    #[arg(long)]
    init_heap: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demonstration workload
    Exec {
        #[command(flatten)]
        common: Common,

        /// Stop every worker at this point
        #[arg(long, value_enum)]
        crash_at: Option<CrashPoint>,

        /// Function on top of the stack when crashing
        #[arg(long, default_value = "cas", requires = "crash_at")]
        crash_in: String,
    },

    /// Restore the stacks left by a previous run
    Recover {
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CrashPoint {
    /// Right after the callee's frame is durable
    AfterPush,
    /// Right before the callee's frame is removed
    BeforePop,
    /// Right after an answer is written
    AfterAnswer,
}

impl From<CrashPoint> for FaultPoint {
    fn from(point: CrashPoint) -> Self {
        match point {
            CrashPoint::AfterPush => FaultPoint::AfterFramePush,
            CrashPoint::BeforePop => FaultPoint::BeforeFrameRemove,
            CrashPoint::AfterAnswer => FaultPoint::AfterAnswerWrite,
        }
    }
}

fn load_config(common: &Common) -> RuntimeConfig {
    let mut config = RuntimeConfig::from_env();
    if let Some(threads) = common.threads {
        config.workers.num_threads = threads;
    }
    config
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = match &cli.command {
        Commands::Exec { common, .. } | Commands::Recover { common } => common,
    };
    let config = load_config(common);

    // Initialize logging
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        config.log.level
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .init();

    let paths = DemoPaths::new(&common.heap, &common.stacks);
    info!(
        threads = config.workers.num_threads,
        heap = %paths.heap.display(),
        stacks = %paths.stacks.display(),
        "starting"
    );

    match cli.command {
        Commands::Exec {
            common,
            crash_at,
            crash_in,
        } => {
            let crash = crash_at.map(|point| CrashPlan {
                point: point.into(),
                function: crash_in,
            });
            let summary = run_exec(&config, &paths, common.init_heap, crash)?;

            for report in &summary.reports {
                println!(
                    "worker {}: {} completed, {} failed{}",
                    report.thread_id,
                    report.completed,
                    report.failed,
                    if report.crashed { ", crashed" } else { "" }
                );
            }
            for outcome in &summary.outcomes {
                println!(
                    "cas {} -> {}: {}",
                    outcome.value_from,
                    outcome.value_to,
                    if outcome.result { "ok" } else { "failed" }
                );
            }
            if common.init_heap {
                if let Err(e) = summary.check_history(INITIAL_VALUE) {
                    warn!(error = %e, "history is not linearizable");
                }
            }
            println!(
                "register: <{}, {}>",
                summary.register.owner, summary.register.value
            );
        }

        Commands::Recover { common } => {
            if common.init_heap {
                bail!("--init-heap cannot be used with recover");
            }
            let summary = run_recover(&config, &paths)?;
            for (id, frames) in summary.recovered.iter().enumerate() {
                println!("stack {}: {} frames recovered", id, frames);
            }
            println!(
                "register: <{}, {}>",
                summary.register.owner, summary.register.value
            );
        }
    }

    Ok(())
}
