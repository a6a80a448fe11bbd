//! Configuration file for the backup tool.
//!
//! TOML by default; a `.json` extension selects JSON. Every section is
//! optional and falls back to the defaults below.

use crate::engine::outcome::{ExitCodeMap, MappedOutcome};
use crate::engine::process::ProcessRunner;
use crate::error::{RebadeError, Result};
use crate::plan::{PlanConfig, PlanSet};
use crate::scheduler::retry::{self, RetryPolicy};
use crate::scheduler::runner::{self, SchedulerConfig};
use crate::scheduler::state;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rebade/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebadeConfig {
    /// How restic is invoked.
    pub engine: EngineConfig,
    /// Activity scheduler settings.
    pub daemon: DaemonConfig,
    /// One-shot retry settings.
    pub retry: RetryConfig,
    /// Backup plans by name.
    pub plans: BTreeMap<String, PlanConfig>,
}

/// restic invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// restic binary, a path or a name looked up on `$PATH`.
    pub restic_binary: String,
    /// CPU niceness; `0` or absent disables the `nice` wrapper.
    pub nice: Option<i32>,
    /// `ionice` class; empty or absent disables the `ionice` wrapper.
    pub ionice_class: Option<String>,
    /// Hold a sleep inhibitor lock while restic runs.
    pub inhibit_suspend: bool,
    /// Default mountpoint for `mount`.
    pub mountpoint: PathBuf,
    /// Exit code (as a string key) to outcome, layered over the restic defaults.
    pub exit_codes: BTreeMap<String, MappedOutcome>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let runner = ProcessRunner::default();
        Self {
            restic_binary: runner.restic_binary,
            nice: runner.nice,
            ionice_class: runner.ionice_class,
            inhibit_suspend: runner.inhibit_suspend,
            mountpoint: PathBuf::from("/mnt/restic"),
            exit_codes: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Process settings for restic.
    pub fn process_runner(&self) -> ProcessRunner {
        ProcessRunner {
            restic_binary: self.restic_binary.clone(),
            nice: self.nice.filter(|n| *n != 0),
            ionice_class: self.ionice_class.clone().filter(|c| !c.trim().is_empty()),
            inhibit_suspend: self.inhibit_suspend,
        }
    }

    /// Exit-code table with the configured overrides applied.
    ///
    /// # Errors
    ///
    /// A key that is not an integer.
    pub fn exit_code_map(&self) -> Result<ExitCodeMap> {
        let mut overrides = BTreeMap::new();
        for (key, outcome) in &self.exit_codes {
            let code: i32 = key.trim().parse().map_err(|_| {
                RebadeError::Config(format!("exit code '{key}' is not an integer"))
            })?;
            overrides.insert(code, *outcome);
        }
        Ok(ExitCodeMap::with_overrides(&overrides))
    }
}

/// Activity scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Where activity counters and holdoffs are persisted.
    pub state_file: PathBuf,
    /// Tick length.
    pub timestep_secs: u64,
    /// Minimum time between debounced state writes.
    pub state_write_interval_secs: u64,
    /// Idle time after which the soft period applies.
    pub away_after_secs: u64,
    /// Holdoff after a failed backup.
    pub holdoff_secs: u64,
    /// Delay before reopening input devices after an error.
    pub restart_delay_secs: u64,
    /// Allowed deviation of a tick from `timestep_secs`.
    pub drift_tolerance_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/etc/rebade/state.json"),
            timestep_secs: runner::DEFAULT_STEP_SECS,
            state_write_interval_secs: state::DEFAULT_WRITE_INTERVAL_SECS,
            away_after_secs: runner::DEFAULT_AWAY_AFTER_SECS,
            holdoff_secs: runner::DEFAULT_HOLDOFF_SECS,
            restart_delay_secs: runner::DEFAULT_RESTART_DELAY_SECS,
            drift_tolerance_ms: runner::DEFAULT_DRIFT_TOLERANCE.as_millis() as u64,
        }
    }
}

impl DaemonConfig {
    /// Timing policy for the scheduler loop.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            step: Duration::from_secs(self.timestep_secs),
            away_after: Duration::from_secs(self.away_after_secs),
            holdoff: Duration::from_secs(self.holdoff_secs),
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            drift_tolerance: Duration::from_millis(self.drift_tolerance_ms),
        }
    }

    /// Debounce interval for activity writes.
    pub fn state_write_interval(&self) -> Duration {
        Duration::from_secs(self.state_write_interval_secs)
    }
}

/// One-shot retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum rounds; `0` is unlimited.
    pub max_attempts: u32,
    /// Delay unit between rounds.
    pub base_delay_secs: u64,
    /// Cap on the delay multiplier.
    pub max_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_secs: retry::DEFAULT_BASE_DELAY_SECS,
            max_multiplier: retry::DEFAULT_MAX_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Retry policy for one-shot backups.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_multiplier: self.max_multiplier,
        }
    }
}

impl RebadeConfig {
    /// Load configuration from a TOML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// [`RebadeConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RebadeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RebadeError::Config(e.to_string()))
    }

    /// Parse JSON text without validation.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| RebadeError::Config(e.to_string()))
    }

    /// Returns the default config file path, `/etc/rebade/config.toml`.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Check settings that serde cannot express. Plans are validated by
    /// [`RebadeConfig::plan_set`].
    pub fn validate(&self) -> Result<()> {
        if self.engine.restic_binary.trim().is_empty() {
            return Err(RebadeError::Config("engine.restic_binary is empty".to_owned()));
        }
        if self.daemon.timestep_secs == 0 {
            return Err(RebadeError::Config(
                "daemon.timestep_secs must be positive".to_owned(),
            ));
        }
        if self.retry.base_delay_secs == 0 {
            return Err(RebadeError::Config(
                "retry.base_delay_secs must be positive".to_owned(),
            ));
        }
        self.engine.exit_code_map()?;
        Ok(())
    }

    /// Validate the configured plans.
    ///
    /// # Errors
    ///
    /// Any plan validation failure, see [`PlanSet::from_config`].
    pub fn plan_set(&self) -> Result<PlanSet> {
        PlanSet::from_config(self.plans.clone())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::engine::outcome::Outcome;
    use crate::plan::Target;
    use std::os::unix::fs::PermissionsExt;

    fn keyfile(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("key");
        std::fs::write(&path, "secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        path
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = RebadeConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.restic_binary, "restic");
        assert_eq!(config.engine.nice, Some(19));
        assert_eq!(config.daemon.timestep_secs, 30);
        assert_eq!(config.daemon.holdoff_secs, 1800);
        assert_eq!(config.retry.base_delay_secs, 60);
        assert!(config.plans.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn full_toml_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let key = keyfile(&dir);
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                r#"
[engine]
restic_binary = "/usr/local/bin/restic"
nice = 0
ionice_class = ""

[engine.exit_codes]
"3" = "failure"
"42" = "success"

[daemon]
timestep_secs = 10
away_after_secs = 60

[retry]
max_attempts = 4

[plans.home]
default = true
keyfile = "{}"
source = {{ paths = ["/home"], exclude = ["*.tmp"] }}
target = {{ method = "sftp", hostname = "nas", remote_path = "restic/home" }}
post_hooks = [{{ method = "http_get", condition = "success", uri = "https://hc.example/ping" }}]
"#,
                key.display()
            ),
        )
        .unwrap();

        let config = RebadeConfig::from_file(&path).unwrap();
        let runner = config.engine.process_runner();
        assert_eq!(runner.nice, None);
        assert_eq!(runner.ionice_class, None);
        assert!(runner.inhibit_suspend);

        let codes = config.engine.exit_code_map().unwrap();
        assert_eq!(codes.classify(3), Outcome::Failure);
        assert_eq!(codes.classify(42), Outcome::Success);
        assert_eq!(codes.classify(12), Outcome::Failure);

        let scheduler = config.daemon.scheduler_config();
        assert_eq!(scheduler.step, Duration::from_secs(10));
        assert_eq!(scheduler.away_after, Duration::from_secs(60));
        assert_eq!(scheduler.holdoff, Duration::from_secs(1800));
        assert_eq!(config.retry.policy().max_attempts, 4);

        let plans = config.plan_set().unwrap();
        let home = plans.default_plan().unwrap();
        assert_eq!(home.name, "home");
        assert_eq!(home.soft_period_secs, 12 * 3600);
        assert_eq!(home.hard_period_secs, 16 * 3600);
        assert_eq!(home.post_hooks.len(), 1);
        assert!(matches!(home.target, Target::Sftp { .. }));
    }

    #[test]
    fn json_extension_selects_json() {
        let dir = tempfile::tempdir().unwrap();
        let key = keyfile(&dir);
        let path = dir.path().join("config.json");
        let json = serde_json::json!({
            "plans": {
                "usb": {
                    "keyfile": key,
                    "soft_period_secs": 60,
                    "hard_period_secs": 120,
                    "source": { "paths": ["/srv"] },
                    "target": { "method": "local", "path": "/media/usb/restic" }
                }
            }
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let config = RebadeConfig::from_file(&path).unwrap();
        let plans = config.plan_set().unwrap();
        assert_eq!(plans.get("usb").unwrap().hard_period_secs, 120);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = RebadeConfig::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(RebadeError::Config(_))));
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(RebadeConfig::from_file(&path).is_err());
    }

    #[test]
    fn non_numeric_exit_code_is_rejected() {
        let config = RebadeConfig::from_toml_str("[engine.exit_codes]\nthree = \"failure\"\n").unwrap();
        assert!(matches!(config.validate(), Err(RebadeError::Config(_))));
    }

    #[test]
    fn zero_timestep_is_rejected() {
        let config = RebadeConfig::from_toml_str("[daemon]\ntimestep_secs = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn world_readable_keyfile_fails_plan_validation() {
        let dir = tempfile::tempdir().unwrap();
        let key = keyfile(&dir);
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).unwrap();
        let config = RebadeConfig::from_toml_str(&format!(
            "[plans.home]\nkeyfile = \"{}\"\nsource = {{ paths = [\"/home\"] }}\ntarget = {{ method = \"local\", path = \"/r\" }}\n",
            key.display()
        ))
        .unwrap();
        assert!(matches!(
            config.plan_set(),
            Err(RebadeError::InsecureKeyfile { .. })
        ));
    }

    #[test]
    fn default_config_path_is_under_etc() {
        assert_eq!(
            RebadeConfig::default_config_path(),
            PathBuf::from("/etc/rebade/config.toml")
        );
    }
}
