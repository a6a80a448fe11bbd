//! restic command construction.
//!
//! [`build`] turns a [`Plan`] and an [`Action`] into an [`ExecutionCommand`]:
//! the restic argument vector plus the environment entries restic needs.
//! It performs no I/O; the current mount table is passed in by the caller.

use crate::engine::mounts::MountedFilesystem;
use crate::error::{RebadeError, Result};
use crate::plan::{Plan, Target};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

/// Environment variable restic reads the REST server user from.
pub const ENV_REST_USERNAME: &str = "RESTIC_REST_USERNAME";

/// Environment variable restic reads the REST server password from.
pub const ENV_REST_PASSWORD: &str = "RESTIC_REST_PASSWORD";

/// A restic subcommand run against a plan's repository.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Take a snapshot of the plan's sources.
    Backup,
    /// Apply the retention policy, scaled by the given factor, and prune.
    Forget {
        /// Multiplier for every retention count.
        scale: f64,
    },
    /// FUSE-mount the repository.
    Mount {
        /// Where to mount it.
        mountpoint: PathBuf,
    },
    /// Verify repository integrity.
    Check,
    /// Remove stale repository locks.
    Unlock,
    /// List snapshots.
    Snapshots,
    /// Remove unreferenced data.
    Prune,
    /// Create the repository.
    Init,
}

impl Action {
    /// A forget action with a validated scale factor.
    pub fn forget(scale: f64) -> Result<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(RebadeError::Config(format!(
                "retention scale must be a positive number, got {scale}"
            )));
        }
        Ok(Self::Forget { scale })
    }

    /// The restic subcommand.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Forget { .. } => "forget",
            Self::Mount { .. } => "mount",
            Self::Check => "check",
            Self::Unlock => "unlock",
            Self::Snapshots => "snapshots",
            Self::Prune => "prune",
            Self::Init => "init",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Snapshot retention counts for `restic forget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Monthly snapshots kept.
    pub monthly: u64,
    /// Weekly snapshots kept.
    pub weekly: u64,
    /// Daily snapshots kept.
    pub daily: u64,
    /// Hourly snapshots kept.
    pub hourly: u64,
}

impl Default for RetentionPolicy {
    /// Three years of monthlies, a year of weeklies, three weeks of dailies,
    /// a day of hourlies. Yearlies are kept forever.
    fn default() -> Self {
        Self {
            monthly: 36,
            weekly: 52,
            daily: 21,
            hourly: 24,
        }
    }
}

impl RetentionPolicy {
    /// Multiply every count by `scale`, rounding up.
    pub fn scaled(self, scale: f64) -> Self {
        let scale_count = |count: u64| (count as f64 * scale).ceil().max(0.0) as u64;
        Self {
            monthly: scale_count(self.monthly),
            weekly: scale_count(self.weekly),
            daily: scale_count(self.daily),
            hourly: scale_count(self.hourly),
        }
    }

    fn push_args(&self, cmd: &mut ExecutionCommand) {
        cmd.push_args(["--keep-yearly", "unlimited"]);
        for (flag, count) in [
            ("--keep-monthly", self.monthly),
            ("--keep-weekly", self.weekly),
            ("--keep-daily", self.daily),
            ("--keep-hourly", self.hourly),
        ] {
            cmd.push_args([flag.to_owned(), count.to_string()]);
        }
    }
}

/// A fully built restic invocation, consumed by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionCommand {
    /// Arguments after the restic binary. Paths keep their raw bytes.
    pub args: Vec<OsString>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ExecutionCommand {
    fn push_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }
}

/// Build the restic invocation for `action` on `plan`.
///
/// `mounts` is only consulted for [`Action::Backup`] on plans with a
/// filesystem allowlist.
pub fn build(plan: &Plan, action: &Action, mounts: &[MountedFilesystem]) -> ExecutionCommand {
    let mut cmd = ExecutionCommand::default();
    cmd.push_args([action.verb()]);
    push_repository_args(plan, &mut cmd);

    match action {
        Action::Backup => {
            for exclude in &plan.source.exclude {
                cmd.push_args(["--exclude", exclude.as_str()]);
            }
            for mountpoint in foreign_mountpoints(plan, mounts) {
                cmd.push_args([OsString::from("--exclude"), mountpoint.into_os_string()]);
            }
            cmd.push_args(&plan.source.paths);
        }
        Action::Forget { scale } => {
            RetentionPolicy::default().scaled(*scale).push_args(&mut cmd);
            cmd.push_args(["--prune"]);
        }
        Action::Mount { mountpoint } => {
            cmd.push_args([mountpoint]);
        }
        Action::Check | Action::Unlock | Action::Snapshots | Action::Prune | Action::Init => {}
    }
    cmd
}

fn push_repository_args(plan: &Plan, cmd: &mut ExecutionCommand) {
    cmd.push_args([OsString::from("-p"), plan.keyfile.clone().into_os_string()]);

    match &plan.target {
        Target::Local { path } => {
            cmd.push_args(["-r", path.as_str()]);
        }
        Target::Sftp {
            hostname,
            port,
            username,
            remote_path,
        } => {
            let mut uri = String::from("sftp://");
            if let Some(user) = username {
                uri.push_str(user);
                uri.push('@');
            }
            uri.push_str(hostname);
            if let Some(port) = port {
                uri.push_str(&format!(":{port}"));
            }
            uri.push('/');
            uri.push_str(remote_path);
            cmd.push_args(["-r".to_owned(), uri]);
        }
        Target::Rest {
            hostname,
            port,
            protocol,
            path,
            username,
            password,
            ca_cert,
        } => {
            let mut uri = format!("rest:{protocol}://{hostname}");
            if let Some(port) = port {
                uri.push_str(&format!(":{port}"));
            }
            uri.push('/');
            uri.push_str(path.trim_start_matches('/'));
            cmd.push_args(["-r".to_owned(), uri]);
            if let Some(ca_cert) = ca_cert {
                cmd.push_args([OsString::from("--cacert"), ca_cert.clone().into_os_string()]);
            }
            // Credentials stay out of the process list.
            if let Some(user) = username {
                cmd.env.insert(ENV_REST_USERNAME.to_owned(), user.clone());
            }
            if let Some(password) = password {
                cmd.env.insert(ENV_REST_PASSWORD.to_owned(), password.clone());
            }
        }
    }
}

/// Mountpoints whose filesystem type is outside the plan's allowlist.
fn foreign_mountpoints(plan: &Plan, mounts: &[MountedFilesystem]) -> Vec<PathBuf> {
    let Some(allowed) = &plan.source.filesystems else {
        return Vec::new();
    };
    mounts
        .iter()
        .filter(|mount| !allowed.iter().any(|fstype| *fstype == mount.fstype))
        .map(|mount| mount.mountpoint.clone())
        .collect()
}
