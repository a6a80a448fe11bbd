//! One-shot backups with retries.
//!
//! Every plan is backed up once. Plans that did not succeed are retried in
//! rounds with a linearly growing delay until all succeed or the attempt
//! budget runs out.

use crate::engine::backup::PlanExecutor;
use crate::error::{RebadeError, Result};
use crate::plan::Plan;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default delay unit between rounds.
pub const DEFAULT_BASE_DELAY_SECS: u64 = 60;

/// Default cap on the delay multiplier.
pub const DEFAULT_MAX_MULTIPLIER: u32 = 30;

/// Retry timing and budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of rounds; `0` retries until every plan succeeds.
    pub max_attempts: u32,
    /// Delay after the first failed round.
    pub base_delay: Duration,
    /// The delay grows by `base_delay` per round up to this many units.
    pub max_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after round `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.clamp(1, self.max_multiplier.max(1)))
    }

    fn budget_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Result of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// Rounds executed.
    pub attempts: u32,
    /// Plans that never succeeded, in configuration order.
    pub failed: Vec<String>,
}

impl RetryReport {
    /// Whether every plan eventually succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Process exit status for this report.
    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Backs up a fixed set of plans, retrying failures.
pub struct RetrySupervisor {
    executor: Arc<dyn PlanExecutor>,
    policy: RetryPolicy,
}

impl RetrySupervisor {
    /// Supervisor that runs plans through `executor`, pacing rounds by `policy`.
    pub fn new(executor: Arc<dyn PlanExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    /// Back up `plans` until all succeed or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// [`RebadeError::Launch`] when restic cannot be started at all; retrying
    /// would not help.
    pub async fn run(&self, plans: &[Plan]) -> Result<RetryReport> {
        let mut pending: Vec<&Plan> = plans.iter().collect();
        let mut attempt = 0u32;

        while !pending.is_empty() {
            attempt += 1;
            info!(attempt, plans = pending.len(), "starting backup round");

            let mut failed = Vec::new();
            for plan in pending {
                match self.executor.backup(plan).await {
                    Ok(outcome) if outcome.is_success() => {
                        info!(plan = %plan.name, %outcome, "backup succeeded");
                    }
                    Ok(outcome) => {
                        warn!(plan = %plan.name, %outcome, "backup failed");
                        failed.push(plan);
                    }
                    Err(e @ RebadeError::Launch { .. }) => return Err(e),
                    Err(e) => {
                        warn!(plan = %plan.name, "backup failed: {e}");
                        failed.push(plan);
                    }
                }
            }
            pending = failed;

            if pending.is_empty() {
                break;
            }
            if self.policy.budget_exhausted(attempt) {
                let names: Vec<String> = pending.iter().map(|p| p.name.clone()).collect();
                error!(attempt, failed = ?names, "giving up on failed backups");
                return Ok(RetryReport {
                    attempts: attempt,
                    failed: names,
                });
            }

            let delay = self.policy.delay_after(attempt);
            info!(
                plans = pending.len(),
                "retrying failed backups in {}s",
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
        }

        Ok(RetryReport {
            attempts: attempt,
            failed: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::engine::outcome::Outcome;
    use crate::plan::test_support::sample_plan;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Executor replaying scripted outcomes per plan, then succeeding.
    struct ScriptedExecutor {
        script: Mutex<HashMap<String, Vec<Outcome>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedExecutor {
        fn with(script: Vec<(&str, Vec<Outcome>)>) -> Arc<Self> {
            let map = script
                .into_iter()
                .map(|(name, outcomes)| (name.to_owned(), outcomes))
                .collect();
            Arc::new(Self {
                script: Mutex::new(map),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls_for(&self, name: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl PlanExecutor for ScriptedExecutor {
        async fn backup(&self, plan: &Plan) -> Result<Outcome> {
            self.calls
                .lock()
                .unwrap()
                .push((plan.name.clone(), Instant::now()));
            let mut script = self.script.lock().unwrap();
            let queue = script.entry(plan.name.clone()).or_default();
            if queue.is_empty() {
                Ok(Outcome::Success)
            } else {
                Ok(queue.remove(0))
            }
        }
    }

    #[test]
    fn delay_grows_linearly_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(60));
        assert_eq!(policy.delay_after(2), Duration::from_secs(120));
        assert_eq!(policy.delay_after(30), Duration::from_secs(1800));
        assert_eq!(policy.delay_after(31), Duration::from_secs(1800));
        assert_eq!(policy.delay_after(500), Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_plan_is_retried_until_success() {
        let executor = ScriptedExecutor::with(vec![("b", vec![Outcome::Failure, Outcome::Failure])]);
        let supervisor = RetrySupervisor::new(executor.clone(), RetryPolicy::default());
        let plans = vec![sample_plan("a"), sample_plan("b"), sample_plan("c")];

        let report = supervisor.run(&plans).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.attempts, 3);

        assert_eq!(executor.calls_for("a").len(), 1);
        assert_eq!(executor.calls_for("c").len(), 1);
        let b = executor.calls_for("b");
        assert_eq!(b.len(), 3);
        assert_eq!(b[1] - b[0], Duration::from_secs(60));
        assert_eq!(b[2] - b[1], Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_outcomes_are_retried_and_partial_snapshots_are_not() {
        let executor = ScriptedExecutor::with(vec![
            ("a", vec![Outcome::Unknown(99)]),
            ("b", vec![Outcome::IncompleteSnapshot]),
        ]);
        let supervisor = RetrySupervisor::new(executor.clone(), RetryPolicy::default());
        let report = supervisor
            .run(&[sample_plan("a"), sample_plan("b")])
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(executor.calls_for("a").len(), 2);
        assert_eq!(executor.calls_for("b").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_limits_rounds() {
        let executor = ScriptedExecutor::with(vec![("a", vec![Outcome::Failure; 5])]);
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let report = RetrySupervisor::new(executor.clone(), policy)
            .run(&[sample_plan("a")])
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(report.failed, vec!["a".to_owned()]);
        assert!(!report.is_success());
        assert_eq!(executor.calls_for("a").len(), 2);
    }

    #[tokio::test]
    async fn empty_plan_list_succeeds_immediately() {
        let executor = ScriptedExecutor::with(Vec::new());
        let report = RetrySupervisor::new(executor, RetryPolicy::default())
            .run(&[])
            .await
            .unwrap();
        assert_eq!(report.attempts, 0);
        assert!(report.is_success());
    }
}
