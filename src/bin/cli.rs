//! CLI binary for rebade.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rebade::config::RebadeConfig;
use rebade::engine::{Action, BackupEngine};
use rebade::plan::{Plan, PlanSet};
use rebade::scheduler::{
    EventDeviceSensor, RetrySupervisor, Scheduler, StateStore, SystemClock,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Restic backup daemon: backs up once the machine has seen enough use.
#[derive(Parser)]
#[command(name = "rebade", version, about)]
struct Cli {
    /// Path to the configuration file (TOML, or JSON with a `.json` extension).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity. Can be given multiple times.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// restic binary, overriding the configuration.
    #[arg(long, global = true)]
    restic_binary: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Plans to act on.
#[derive(Args)]
struct PlanArgs {
    /// Plan names. If none are given, the default plan is used.
    plans: Vec<String>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Back up now, retrying failed plans.
    Backup {
        #[command(flatten)]
        plans: PlanArgs,
        /// Give up after this many rounds (0 retries forever).
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Watch for activity and back up when a threshold is reached.
    Daemon {
        #[command(flatten)]
        plans: PlanArgs,
        /// File in which activity and holdoffs are kept.
        #[arg(short, long)]
        state_file: Option<PathBuf>,
        /// Tick length in seconds.
        #[arg(short, long)]
        timestep_secs: Option<u64>,
        /// Directory with the input event devices.
        #[arg(long, default_value = rebade::scheduler::activity::INPUT_DEVICE_DIR)]
        input_dir: PathBuf,
    },

    /// Mount a backup repository.
    Mount {
        /// Plan to mount. If not given, the default plan is used.
        plan: Option<String>,
        /// Where to mount the repository.
        #[arg(short, long)]
        mountpoint: Option<PathBuf>,
    },

    /// Forget old snapshots and prune the repository.
    Forget {
        #[command(flatten)]
        plans: PlanArgs,
        /// Multiply every retention count by this factor.
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
    },

    /// Check repository integrity.
    Check(PlanArgs),

    /// Remove stale repository locks.
    Unlock(PlanArgs),

    /// List snapshots.
    Snapshots(PlanArgs),

    /// Remove unreferenced data from the repository.
    Prune(PlanArgs),

    /// Initialize the repository.
    Init(PlanArgs),
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(RebadeConfig::default_config_path);
    let mut config = RebadeConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(binary) = cli.restic_binary {
        config.engine.restic_binary = binary;
    }

    let plan_set = config.plan_set()?;
    let engine = BackupEngine::new(
        config.engine.process_runner(),
        config.engine.exit_code_map()?,
    );

    match cli.command {
        Command::Backup {
            plans,
            max_attempts,
        } => {
            let plans = plan_set.select(&plans.plans)?;
            let mut policy = config.retry.policy();
            if let Some(max_attempts) = max_attempts {
                policy.max_attempts = max_attempts;
            }
            let report = RetrySupervisor::new(Arc::new(engine), policy)
                .run(&plans)
                .await?;
            if !report.is_success() {
                error!(failed = ?report.failed, "backups did not succeed");
            }
            Ok(report.exit_code())
        }

        Command::Daemon {
            plans,
            state_file,
            timestep_secs,
            input_dir,
        } => {
            let plans = plan_set.select(&plans.plans)?;
            let state_file = state_file.unwrap_or_else(|| config.daemon.state_file.clone());
            let mut scheduler_config = config.daemon.scheduler_config();
            if let Some(secs) = timestep_secs {
                anyhow::ensure!(secs > 0, "--timestep-secs must be positive");
                scheduler_config.step = std::time::Duration::from_secs(secs);
            }

            let state = StateStore::load(&state_file, config.daemon.state_write_interval());
            let scheduler = Scheduler::new(plans, state, Arc::new(engine), Arc::new(SystemClock))
                .with_config(scheduler_config);

            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone())?;
            scheduler.run(EventDeviceSensor::new(input_dir), cancel).await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Mount { plan, mountpoint } => {
            let names: Vec<String> = plan.into_iter().collect();
            let mountpoint = mountpoint.unwrap_or_else(|| config.engine.mountpoint.clone());
            let plans = plan_set.select(&names)?;
            run_action(&engine, &plans, &Action::Mount { mountpoint }).await
        }

        Command::Forget { plans, scale } => {
            let action = Action::forget(scale)?;
            run_action(&engine, &plan_set.select(&plans.plans)?, &action).await
        }

        Command::Check(args) => run_simple(&engine, &plan_set, args, Action::Check).await,
        Command::Unlock(args) => run_simple(&engine, &plan_set, args, Action::Unlock).await,
        Command::Snapshots(args) => run_simple(&engine, &plan_set, args, Action::Snapshots).await,
        Command::Prune(args) => run_simple(&engine, &plan_set, args, Action::Prune).await,
        Command::Init(args) => run_simple(&engine, &plan_set, args, Action::Init).await,
    }
}

async fn run_simple(
    engine: &BackupEngine,
    plan_set: &PlanSet,
    args: PlanArgs,
    action: Action,
) -> anyhow::Result<ExitCode> {
    let plans = plan_set.select(&args.plans)?;
    run_action(engine, &plans, &action).await
}

/// Run `action` on every plan in turn. Fails the process if any plan failed.
async fn run_action(
    engine: &BackupEngine,
    plans: &[Plan],
    action: &Action,
) -> anyhow::Result<ExitCode> {
    let mut failed = Vec::new();
    for plan in plans {
        info!(plan = %plan.name, %action, "running");
        if !engine.execute(plan, action).await? {
            failed.push(plan.name.as_str());
        }
    }
    if failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(?failed, %action, "action failed");
        Ok(ExitCode::FAILURE)
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down..."),
            _ = terminate.recv() => info!("received SIGTERM, shutting down..."),
        }
        cancel.cancel();
    });
    Ok(())
}
