//! rebade: activity-driven restic backups.
//!
//! Backups run when the machine has accumulated enough active use since the
//! last successful snapshot, preferring moments when the user is away.
//!
//! # Architecture
//!
//! - **Plans** ([`plan`]): validated backup definitions with source, target,
//!   keyfile, activity periods and hooks.
//! - **Engine** ([`engine`]): builds restic command lines, runs them behind
//!   `systemd-inhibit`/`nice`/`ionice`, classifies exit codes and fires hooks.
//! - **Scheduler** ([`scheduler`]): the activity daemon, which watches input
//!   devices and persists per-plan activity and holdoffs, and the one-shot
//!   retry supervisor.
//! - **Config** ([`config`]): TOML/JSON configuration file.

pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod scheduler;

pub use config::RebadeConfig;
pub use engine::{Action, BackupEngine, Outcome, PlanExecutor};
pub use error::{RebadeError, Result};
pub use plan::{Plan, PlanSet};
pub use scheduler::{RetrySupervisor, Scheduler};
