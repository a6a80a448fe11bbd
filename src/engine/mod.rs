//! restic execution: command construction, process supervision, exit-code
//! classification and notification hooks.

pub mod backup;
pub mod command;
pub mod hooks;
pub mod mounts;
pub mod outcome;
pub mod process;

pub use backup::{BackupEngine, PlanExecutor};
pub use command::{Action, ExecutionCommand, RetentionPolicy};
pub use hooks::HookRunner;
pub use mounts::MountedFilesystem;
pub use outcome::{ExitCodeMap, MappedOutcome, Outcome};
pub use process::ProcessRunner;
