//! Backup plan model.
//!
//! A [`Plan`] describes one backup task: what to back up ([`Source`]), where
//! to ([`Target`]), how much user activity may accumulate before it runs, and
//! which notification [`Hook`]s surround it. Plans are validated once when
//! the configuration is loaded and are immutable afterwards.

use crate::error::{RebadeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default soft period: 12 hours of accumulated activity.
pub const DEFAULT_SOFT_PERIOD_SECS: u64 = 12 * 3600;

/// Default hard period: 16 hours of accumulated activity.
pub const DEFAULT_HARD_PERIOD_SECS: u64 = 16 * 3600;

/// What gets backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Paths handed to restic as positional arguments.
    pub paths: Vec<String>,
    /// Exclusion globs, one `--exclude` each.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Filesystem types the backup may descend into. Mounted filesystems of
    /// any other type are excluded by mountpoint. `None` disables the filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystems: Option<Vec<String>>,
}

/// Where the restic repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Target {
    /// Repository on a locally reachable path.
    Local {
        /// Repository directory.
        path: String,
    },
    /// Repository reached over SFTP.
    Sftp {
        /// Remote host.
        hostname: String,
        /// SSH port, when not the default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Login user, when not the ssh default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Repository path on the remote host.
        remote_path: String,
    },
    /// Repository served by restic's REST server.
    Rest {
        /// Server host.
        hostname: String,
        /// Server port.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// `http` or `https`.
        #[serde(default = "default_rest_protocol")]
        protocol: String,
        /// Repository path below the server root.
        #[serde(default)]
        path: String,
        /// HTTP basic auth user, passed via the environment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// HTTP basic auth password, passed via the environment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// CA certificate used to verify the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca_cert: Option<PathBuf>,
    },
}

fn default_rest_protocol() -> String {
    "https".to_owned()
}

/// How a hook notifies the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HookMethod {
    /// Fire-and-forget HTTP GET request.
    HttpGet {
        /// Request URI.
        uri: String,
    },
}

/// When a hook fires, relative to the outcome of the surrounding action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Fire regardless of the outcome.
    #[default]
    Always,
    /// Fire unless the action is known to have failed.
    Success,
    /// Fire unless the action is known to have succeeded.
    Failure,
}

/// A notification run before or after a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Dispatch method and its arguments.
    #[serde(flatten)]
    pub method: HookMethod,
    /// Outcome gate.
    #[serde(default)]
    pub condition: Condition,
}

impl Hook {
    /// Build an HTTP GET hook.
    pub fn http_get(uri: impl Into<String>, condition: Condition) -> Self {
        Self {
            method: HookMethod::HttpGet { uri: uri.into() },
            condition,
        }
    }
}

/// Plan entry as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Whether this plan is used when no plan is named.
    #[serde(default)]
    pub default: bool,
    /// restic password file.
    pub keyfile: PathBuf,
    /// Activity threshold while the user is away.
    #[serde(default = "default_soft_period_secs")]
    pub soft_period_secs: u64,
    /// Activity threshold while the user is present.
    #[serde(default = "default_hard_period_secs")]
    pub hard_period_secs: u64,
    /// What to back up.
    pub source: Source,
    /// Where to back it up.
    pub target: Target,
    /// Hooks run before the backup.
    #[serde(default)]
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the backup.
    #[serde(default)]
    pub post_hooks: Vec<Hook>,
}

fn default_soft_period_secs() -> u64 {
    DEFAULT_SOFT_PERIOD_SECS
}

fn default_hard_period_secs() -> u64 {
    DEFAULT_HARD_PERIOD_SECS
}

/// A validated backup plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Unique plan name (the key in the configuration table).
    pub name: String,
    /// Whether this plan is used when no plan is named.
    pub is_default: bool,
    /// restic password file, owner-only permissions.
    pub keyfile: PathBuf,
    /// Activity threshold (seconds) used while the user is away.
    pub soft_period_secs: u64,
    /// Activity threshold (seconds) used while the user is present.
    pub hard_period_secs: u64,
    /// What to back up.
    pub source: Source,
    /// Where to back it up.
    pub target: Target,
    /// Hooks run before the backup, in order.
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the backup, in order.
    pub post_hooks: Vec<Hook>,
}

impl Plan {
    /// Validate a configuration entry into a plan.
    ///
    /// # Errors
    ///
    /// Fails when the keyfile is missing or not owner-only, when no source
    /// path is given, or when the activity periods are inconsistent.
    pub fn from_config(name: &str, config: PlanConfig) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(RebadeError::Config("plan name must not be empty".to_owned()));
        }
        if config.source.paths.is_empty() {
            return Err(RebadeError::Config(format!(
                "plan '{name}' has no source paths"
            )));
        }
        if config.hard_period_secs == 0 {
            return Err(RebadeError::Config(format!(
                "plan '{name}' has a zero hard period"
            )));
        }
        if config.soft_period_secs > config.hard_period_secs {
            return Err(RebadeError::Config(format!(
                "plan '{name}' has a soft period ({}s) longer than its hard period ({}s)",
                config.soft_period_secs, config.hard_period_secs
            )));
        }
        check_keyfile(&config.keyfile)?;

        Ok(Self {
            name: name.to_owned(),
            is_default: config.default,
            keyfile: config.keyfile,
            soft_period_secs: config.soft_period_secs,
            hard_period_secs: config.hard_period_secs,
            source: config.source,
            target: config.target,
            pre_hooks: config.pre_hooks,
            post_hooks: config.post_hooks,
        })
    }
}

/// Reject keyfiles that anyone but the owner can read or write.
pub fn check_keyfile(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        RebadeError::Config(format!("cannot stat keyfile {}: {e}", path.display()))
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(RebadeError::InsecureKeyfile {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// All configured plans, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    plans: BTreeMap<String, Plan>,
    default_plan: Option<String>,
}

impl PlanSet {
    /// Build a plan set from already validated plans.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names or when more than one plan is marked default.
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Result<Self> {
        let mut set = Self::default();
        for plan in plans {
            if plan.is_default {
                if let Some(first) = &set.default_plan {
                    return Err(RebadeError::DuplicateDefaultPlan {
                        first: first.clone(),
                        second: plan.name.clone(),
                    });
                }
                set.default_plan = Some(plan.name.clone());
            }
            if set.plans.contains_key(&plan.name) {
                return Err(RebadeError::Config(format!(
                    "plan '{}' is defined twice",
                    plan.name
                )));
            }
            set.plans.insert(plan.name.clone(), plan);
        }
        Ok(set)
    }

    /// Validate every configured plan entry.
    pub fn from_config(entries: BTreeMap<String, PlanConfig>) -> Result<Self> {
        let plans = entries
            .into_iter()
            .map(|(name, config)| Plan::from_config(&name, config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(plans)
    }

    /// Look up a plan by name.
    pub fn get(&self, name: &str) -> Result<&Plan> {
        self.plans
            .get(name)
            .ok_or_else(|| RebadeError::PlanNotFound(name.to_owned()))
    }

    /// The plan marked as default.
    pub fn default_plan(&self) -> Result<&Plan> {
        self.default_plan
            .as_deref()
            .and_then(|name| self.plans.get(name))
            .ok_or(RebadeError::NoDefaultPlan)
    }

    /// Resolve the plans an invocation operates on.
    ///
    /// An empty name list selects the default plan.
    pub fn select(&self, names: &[String]) -> Result<Vec<Plan>> {
        if names.is_empty() {
            return Ok(vec![self.default_plan()?.clone()]);
        }
        names
            .iter()
            .map(|name| self.get(name).cloned())
            .collect()
    }

    /// Iterate over all plans in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    /// Number of configured plans.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether no plan is configured.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
