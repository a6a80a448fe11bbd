//! Child process execution.
//!
//! The restic binary runs behind up to three wrappers, outermost first:
//! `systemd-inhibit` (holds a sleep inhibitor lock for exactly as long as the
//! child lives, so it is released even if this process dies), `nice` and
//! `ionice`. Output is inherited; only the exit code is consumed.
//!
//! Every program in the chain is looked up on `$PATH` before spawning. A
//! wrapper would otherwise report a missing restic as its own exit status.

use crate::engine::command::ExecutionCommand;
use crate::error::{RebadeError, Result};
use std::ffi::OsString;
use std::process::Stdio;
use tracing::debug;

/// Process settings for restic invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRunner {
    /// restic binary, a path or a name looked up on `$PATH`.
    pub restic_binary: String,
    /// CPU niceness; `None` skips the `nice` wrapper.
    pub nice: Option<i32>,
    /// I/O scheduling class; `None` skips the `ionice` wrapper.
    pub ionice_class: Option<String>,
    /// Wrap with `systemd-inhibit`.
    pub inhibit_suspend: bool,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            restic_binary: "restic".to_owned(),
            nice: Some(19),
            ionice_class: Some("idle".to_owned()),
            inhibit_suspend: true,
        }
    }
}

impl ProcessRunner {
    /// Runner that executes `binary` directly, without any wrapper.
    pub fn bare(binary: impl Into<String>) -> Self {
        Self {
            restic_binary: binary.into(),
            nice: None,
            ionice_class: None,
            inhibit_suspend: false,
        }
    }

    /// Full argument vector, program first.
    pub fn argv(&self, cmd: &ExecutionCommand) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::with_capacity(cmd.args.len() + 12);
        if self.inhibit_suspend {
            argv.extend(
                [
                    "systemd-inhibit",
                    "--what=sleep",
                    "--who=rebade",
                    "--why=restic backup in progress",
                    "--mode=block",
                ]
                .map(OsString::from),
            );
        }
        if let Some(nice) = self.nice {
            argv.extend(["nice".into(), "-n".into(), nice.to_string().into()]);
        }
        if let Some(class) = &self.ionice_class {
            argv.extend(["ionice".into(), "-c".into(), class.into()]);
        }
        argv.push(self.restic_binary.clone().into());
        argv.extend(cmd.args.iter().cloned());
        argv
    }

    /// Programs exec'd in turn, outermost wrapper first, restic last.
    fn programs(&self) -> Vec<&str> {
        let mut programs = Vec::with_capacity(4);
        if self.inhibit_suspend {
            programs.push("systemd-inhibit");
        }
        if self.nice.is_some() {
            programs.push("nice");
        }
        if self.ionice_class.is_some() {
            programs.push("ionice");
        }
        programs.push(self.restic_binary.as_str());
        programs
    }

    /// Check that every program in the chain can be found.
    ///
    /// # Errors
    ///
    /// [`RebadeError::Launch`] naming the first program that is missing.
    pub fn resolve(&self) -> Result<()> {
        for program in self.programs() {
            which::which(program).map_err(|e| RebadeError::Launch {
                binary: program.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, e),
            })?;
        }
        Ok(())
    }

    /// Spawn the wrapped command, wait for it and return its exit code.
    ///
    /// A child killed by a signal reports `128 + signal`, like a shell.
    ///
    /// # Errors
    ///
    /// [`RebadeError::Launch`] when restic or one of its wrappers cannot be
    /// found, or the outermost program cannot be spawned.
    pub async fn run(&self, cmd: ExecutionCommand) -> Result<i32> {
        self.resolve()?;
        let argv = self.argv(&cmd);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RebadeError::Config("empty command line".to_owned()))?;
        debug!(program = %program.to_string_lossy(), args = ?args, "spawning");

        let status = tokio::process::Command::new(program)
            .args(args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| RebadeError::Launch {
                binary: program.to_string_lossy().into_owned(),
                source,
            })?;

        Ok(exit_code(status))
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
