//! Pre/post backup notification hooks.
//!
//! Hooks are best-effort: a failing hook is logged and otherwise ignored, it
//! never changes the outcome of the backup it surrounds.

use crate::engine::outcome::Outcome;
use crate::plan::{Condition, Hook, HookMethod};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout applied to every hook request.
const HOOK_TIMEOUT_SECS: u64 = 15;

/// Executes hook lists in configured order.
#[derive(Debug, Clone)]
pub struct HookRunner {
    client: reqwest::Client,
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRunner {
    /// Create a runner with the default request timeout.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HOOK_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("cannot build hook HTTP client, using defaults: {e}");
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Run `hooks` in order. `outcome` is the result of the surrounding action,
    /// `None` when it has not run yet.
    pub async fn run_hooks(&self, hooks: &[Hook], outcome: Option<Outcome>) {
        for hook in hooks {
            if !condition_satisfied(hook.condition, outcome) {
                debug!(hook = ?hook.method, condition = ?hook.condition, "hook condition not met, skipping");
                continue;
            }
            self.run_hook(&hook.method).await;
        }
    }

    async fn run_hook(&self, method: &HookMethod) {
        match method {
            HookMethod::HttpGet { uri } => match self.client.get(uri).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(uri = %uri, status = %response.status(), "hook delivered");
                }
                Ok(response) => {
                    warn!(uri = %uri, status = %response.status(), "hook returned an error status");
                }
                Err(e) => {
                    warn!(uri = %uri, "hook request failed: {e}");
                }
            },
        }
    }
}

/// Whether a hook with `condition` fires given the outcome so far.
///
/// Without an outcome every condition is satisfied.
pub fn condition_satisfied(condition: Condition, outcome: Option<Outcome>) -> bool {
    let succeeded = outcome.map(Outcome::is_success);
    match condition {
        Condition::Always => true,
        Condition::Success => succeeded.unwrap_or(true),
        Condition::Failure => !succeeded.unwrap_or(false),
    }
}
