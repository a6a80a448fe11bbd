//! Error types for the backup daemon.

use std::path::PathBuf;

/// Top-level error type for plan resolution, execution and scheduling.
#[derive(Debug, thiserror::Error)]
pub enum RebadeError {
    /// Malformed configuration or plan definition.
    #[error("config error: {0}")]
    Config(String),

    /// Keyfile is accessible by someone other than its owner.
    #[error(
        "permissions of {} must be owner-only (e.g. 600) but are {mode:o}, refusing to use this keyfile",
        path.display()
    )]
    InsecureKeyfile {
        /// Offending keyfile.
        path: PathBuf,
        /// Permission bits found on disk.
        mode: u32,
    },

    /// A plan was requested by name but is not configured.
    #[error("no such plan: {0}")]
    PlanNotFound(String),

    /// No plan was named and none is marked as default.
    #[error("no plan is marked as default")]
    NoDefaultPlan,

    /// More than one plan is marked as default.
    #[error("duplicate default plan: '{first}' and '{second}' are both marked as default")]
    DuplicateDefaultPlan {
        /// The default plan seen first.
        first: String,
        /// The conflicting plan.
        second: String,
    },

    /// The external binary could not be started.
    #[error("failed to launch {binary}: {source}")]
    Launch {
        /// Program that was spawned.
        binary: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// Input device polling error (device removed, readiness failure).
    #[error("activity device error: {0}")]
    Device(String),

    /// State file persistence error.
    #[error("state error: {0}")]
    State(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RebadeError {
    /// Returns `true` for errors that stem from configuration and must never be retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InsecureKeyfile { .. }
                | Self::PlanNotFound(_)
                | Self::NoDefaultPlan
                | Self::DuplicateDefaultPlan { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RebadeError>;
