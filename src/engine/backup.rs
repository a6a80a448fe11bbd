//! Plan execution against restic.
//!
//! [`BackupEngine`] ties the command builder, the process runner, the exit
//! code table and the hook runner together. Schedulers talk to it through
//! the [`PlanExecutor`] trait so they can be driven by fakes in tests.

use crate::engine::command::{self, Action};
use crate::engine::hooks::HookRunner;
use crate::engine::mounts::{self, MountedFilesystem, PROC_MOUNTS};
use crate::engine::outcome::{ExitCodeMap, Outcome};
use crate::engine::process::ProcessRunner;
use crate::error::Result;
use crate::plan::Plan;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Runs the backup action of a plan.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    /// Back up `plan` once and classify the result.
    ///
    /// # Errors
    ///
    /// Operational failures that prevent restic from running at all, such as
    /// a missing binary.
    async fn backup(&self, plan: &Plan) -> Result<Outcome>;
}

/// restic-backed plan executor.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    runner: ProcessRunner,
    hooks: HookRunner,
    exit_codes: ExitCodeMap,
    mount_table: PathBuf,
}

impl BackupEngine {
    /// Create an engine with the given process settings and exit-code table.
    pub fn new(runner: ProcessRunner, exit_codes: ExitCodeMap) -> Self {
        Self {
            runner,
            hooks: HookRunner::new(),
            exit_codes,
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Read mounted filesystems from `path` instead of `/proc/mounts`.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    /// The process settings in use.
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Back up `plan`, surrounded by its pre and post hooks.
    pub async fn execute_backup(&self, plan: &Plan) -> Result<Outcome> {
        self.hooks.run_hooks(&plan.pre_hooks, None).await;

        let result = self.run_backup(plan).await;
        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(_) => Outcome::Failure,
        };

        self.hooks.run_hooks(&plan.post_hooks, Some(outcome)).await;
        result
    }

    async fn run_backup(&self, plan: &Plan) -> Result<Outcome> {
        let mounts = self.current_mounts(plan)?;
        let cmd = command::build(plan, &Action::Backup, &mounts);
        let exit_code = self.runner.run(cmd).await.inspect_err(|e| {
            error!(plan = %plan.name, "restic did not start: {e}");
        })?;

        let outcome = self.exit_codes.classify(exit_code);
        match outcome {
            Outcome::Success => info!(plan = %plan.name, "backup complete"),
            Outcome::IncompleteSnapshot => {
                warn!(plan = %plan.name, exit_code, "backup finished with unreadable sources");
            }
            Outcome::Failure | Outcome::Unknown(_) => {
                warn!(plan = %plan.name, exit_code, %outcome, "backup failed");
            }
        }
        Ok(outcome)
    }

    /// Snapshot of the mount table, only read for plans that filter by filesystem type.
    fn current_mounts(&self, plan: &Plan) -> Result<Vec<MountedFilesystem>> {
        if plan.source.filesystems.is_none() {
            return Ok(Vec::new());
        }
        Ok(mounts::read_mount_table(&self.mount_table)?)
    }

    /// Run any action on `plan`. Returns whether it succeeded.
    ///
    /// Backups succeed on a complete or partial snapshot, everything else on
    /// a zero exit code.
    pub async fn execute(&self, plan: &Plan, action: &Action) -> Result<bool> {
        if *action == Action::Backup {
            return Ok(self.execute_backup(plan).await?.is_success());
        }

        if let Action::Mount { mountpoint } = action {
            std::fs::create_dir_all(mountpoint)?;
        }

        let cmd = command::build(plan, action, &[]);
        let exit_code = self.runner.run(cmd).await?;
        if exit_code == 0 {
            info!(plan = %plan.name, %action, "restic finished");
        } else {
            warn!(plan = %plan.name, %action, exit_code, "restic failed");
        }
        Ok(exit_code == 0)
    }
}

#[async_trait]
impl PlanExecutor for BackupEngine {
    async fn backup(&self, plan: &Plan) -> Result<Outcome> {
        self.execute_backup(plan).await
    }
}
