//! Activity-driven backup scheduler.
//!
//! Every tick the scheduler waits one step for user input. A tick with
//! input adds the step length to every plan's accumulated activity; a tick
//! without input extends the current idle streak. A plan becomes due once its
//! activity exceeds its soft period (user away for longer than
//! [`SchedulerConfig::away_after`]) or its hard period (user present), and no
//! holdoff is pending. Due plans run as one sequential batch. Success resets
//! the plan's activity, failure sets a holdoff instead.

use crate::engine::backup::PlanExecutor;
use crate::plan::Plan;
use crate::scheduler::activity::{ActivitySensor, ActivitySession};
use crate::scheduler::clock::{Clock, format_timestamp};
use crate::scheduler::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default tick length.
pub const DEFAULT_STEP_SECS: u64 = 30;

/// Idle time after which the user counts as away.
pub const DEFAULT_AWAY_AFTER_SECS: u64 = 5 * 60;

/// Holdoff applied after a failed backup.
pub const DEFAULT_HOLDOFF_SECS: u64 = 30 * 60;

/// Minimum delay before reopening the activity sensor after an error.
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 3;

/// Allowed deviation of a tick from its nominal length.
pub const DEFAULT_DRIFT_TOLERANCE: Duration = Duration::from_millis(500);

/// Timing policy of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Tick length.
    pub step: Duration,
    /// Idle streak after which the soft period applies.
    pub away_after: Duration,
    /// Holdoff applied after a failed backup.
    pub holdoff: Duration,
    /// Delay before reopening the activity sensor after an error.
    pub restart_delay: Duration,
    /// Ticks deviating from `step` by this much or more do not count as activity.
    pub drift_tolerance: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(DEFAULT_STEP_SECS),
            away_after: Duration::from_secs(DEFAULT_AWAY_AFTER_SECS),
            holdoff: Duration::from_secs(DEFAULT_HOLDOFF_SECS),
            restart_delay: Duration::from_secs(DEFAULT_RESTART_DELAY_SECS),
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
        }
    }
}

/// The activity threshold that applies to `plan` after `inactivity_secs` idle seconds.
pub fn threshold_secs(plan: &Plan, inactivity_secs: u64, away_after_secs: u64) -> u64 {
    if inactivity_secs > away_after_secs {
        plan.soft_period_secs
    } else {
        plan.hard_period_secs
    }
}

/// Whether a plan with the given activity and holdoff should run at `now`.
pub fn is_due(activity_secs: u64, threshold_secs: u64, holdoff_until: f64, now: f64) -> bool {
    activity_secs > threshold_secs && now > holdoff_until
}

/// Outcome of one tick's activity measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSample {
    /// Input was seen and the tick had its nominal length.
    Active,
    /// No input was seen.
    Idle,
    /// Input was seen but the tick was stretched (suspend, clock jump).
    Drifted,
}

/// The activity-driven backup scheduler.
pub struct Scheduler {
    plans: Vec<Plan>,
    state: StateStore,
    executor: Arc<dyn PlanExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Seconds since input was last seen. Not persisted.
    inactivity_secs: u64,
}

impl Scheduler {
    /// Create a scheduler over `plans`, persisting into `state`.
    pub fn new(
        plans: Vec<Plan>,
        state: StateStore,
        executor: Arc<dyn PlanExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            plans,
            state,
            executor,
            clock,
            config: SchedulerConfig::default(),
            inactivity_secs: 0,
        }
    }

    /// Override the timing policy.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Plans under schedule.
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    /// The state store.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Mutable access to the state store.
    pub fn state_mut(&mut self) -> &mut StateStore {
        &mut self.state
    }

    /// Current idle streak in seconds.
    pub fn inactivity_secs(&self) -> u64 {
        self.inactivity_secs
    }

    /// Apply one tick's measurement to the activity counters.
    pub fn record_sample(&mut self, sample: TickSample) {
        let step_secs = self.config.step.as_secs();
        match sample {
            TickSample::Active => {
                for plan in &self.plans {
                    self.state.add_activity(&plan.name, step_secs);
                }
                self.inactivity_secs = 0;
            }
            TickSample::Idle | TickSample::Drifted => {
                self.inactivity_secs = self.inactivity_secs.saturating_add(step_secs);
            }
        }
    }

    /// Plans that should run at `now`, in configuration order.
    pub fn due_plans(&mut self, now: f64) -> Vec<Plan> {
        let away_after_secs = self.config.away_after.as_secs();
        let mut due = Vec::new();
        for plan in &self.plans {
            let activity_secs = self.state.get_activity(&plan.name);
            let holdoff_until = self.state.get_holdoff(&plan.name);
            let threshold = threshold_secs(plan, self.inactivity_secs, away_after_secs);
            debug!(
                plan = %plan.name,
                activity_secs,
                holdoff_until,
                threshold,
                "evaluating plan"
            );
            if is_due(activity_secs, threshold, holdoff_until, now) {
                due.push(plan.clone());
            }
        }
        due
    }

    /// Back up `plans` one after another, updating activity and holdoffs.
    ///
    /// Suspend is inhibited per restic process, so the lock goes away with
    /// the child even if the daemon is killed. Hooks and the gaps between
    /// plans run without it; a suspend there delays the batch but cannot
    /// interrupt a snapshot.
    pub async fn execute_batch(&mut self, plans: &[Plan]) {
        if plans.is_empty() {
            return;
        }
        info!(count = plans.len(), "starting backup batch");

        for plan in plans {
            info!(plan = %plan.name, "executing backup");
            let succeeded = match self.executor.backup(plan).await {
                Ok(outcome) => outcome.is_success(),
                Err(e) => {
                    error!(plan = %plan.name, "backup could not run: {e}");
                    false
                }
            };

            if succeeded {
                if let Err(e) = self.state.reset_activity(&plan.name) {
                    error!(plan = %plan.name, "cannot persist activity reset: {e}");
                }
                info!(plan = %plan.name, "backup succeeded");
            } else {
                let until = self.clock.now() + self.config.holdoff.as_secs_f64();
                if let Err(e) = self.state.set_holdoff(&plan.name, until) {
                    error!(plan = %plan.name, "cannot persist holdoff: {e}");
                }
                warn!(
                    plan = %plan.name,
                    "backup failed, holding off until {}",
                    format_timestamp(until)
                );
            }
        }
    }

    /// Measure one tick on `session`. Returns `None` when cancelled.
    async fn sample_tick<S: ActivitySession>(
        &self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> crate::Result<Option<TickSample>> {
        let step = self.config.step;
        let started = self.clock.now();

        let active = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = session.observed_activity(step) => result?,
        };

        let elapsed = self.clock.now() - started;
        let remaining = step.as_secs_f64() - elapsed;
        if remaining > 0.0 {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(Duration::from_secs_f64(remaining)) => {}
            }
        }

        let tick_secs = self.clock.now() - started;
        let deviation = (tick_secs - step.as_secs_f64()).abs();
        let sample = if !active {
            TickSample::Idle
        } else if deviation < self.config.drift_tolerance.as_secs_f64() {
            TickSample::Active
        } else {
            debug!(tick_secs, "tick length drifted, discarding activity sample");
            TickSample::Drifted
        };
        Ok(Some(sample))
    }

    /// Run ticks on one sensing session until cancelled or the session fails.
    async fn run_session<S: ActivitySession>(
        &mut self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        loop {
            let Some(sample) = self.sample_tick(session, cancel).await? else {
                return Ok(());
            };
            self.record_sample(sample);

            let due = self.due_plans(self.clock.now());
            self.execute_batch(&due).await;
        }
    }

    /// Run until `cancel` fires, reopening the sensor after errors.
    ///
    /// Returns the state store, flushed.
    pub async fn run<A: ActivitySensor>(
        mut self,
        mut sensor: A,
        cancel: CancellationToken,
    ) -> StateStore {
        info!(
            plans = self.plans.len(),
            step_secs = self.config.step.as_secs(),
            "scheduler started"
        );

        loop {
            let result = match sensor.open() {
                Ok(mut session) => self.run_session(&mut session, &cancel).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "activity monitoring failed, restarting in {:?}: {e}",
                        self.config.restart_delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
            }
        }

        if let Err(e) = self.state.flush() {
            error!("cannot persist scheduler state: {e}");
        }
        info!("scheduler stopped");
        self.state
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::engine::outcome::Outcome;
    use crate::plan::test_support::sample_plan;
    use crate::scheduler::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const NOW: u64 = 1_700_000_000;

    /// Executor returning a fixed outcome and recording plan names.
    struct FixedExecutor {
        outcome: Outcome,
        calls: Mutex<Vec<String>>,
    }

    impl FixedExecutor {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PlanExecutor for FixedExecutor {
        async fn backup(&self, plan: &Plan) -> crate::Result<Outcome> {
            self.calls.lock().unwrap().push(plan.name.clone());
            Ok(self.outcome)
        }
    }

    fn scheduler_with(executor: Arc<FixedExecutor>, clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::new(
            vec![sample_plan("home")],
            StateStore::in_memory(),
            executor,
            clock,
        )
    }

    #[test]
    fn soft_threshold_applies_when_user_is_away() {
        let plan = sample_plan("home");
        assert_eq!(threshold_secs(&plan, 310, 300), 100);
        assert_eq!(threshold_secs(&plan, 100, 300), 500);
        assert_eq!(threshold_secs(&plan, 300, 300), 500);

        assert!(is_due(150, threshold_secs(&plan, 310, 300), 0.0, NOW as f64));
        assert!(!is_due(150, threshold_secs(&plan, 100, 300), 0.0, NOW as f64));
    }

    #[test]
    fn activity_accumulates_and_idle_streak_resets() {
        let clock = Arc::new(ManualClock::starting_at(NOW));
        let mut scheduler = scheduler_with(FixedExecutor::new(Outcome::Success), clock);

        scheduler.record_sample(TickSample::Idle);
        scheduler.record_sample(TickSample::Drifted);
        assert_eq!(scheduler.inactivity_secs(), 60);

        scheduler.record_sample(TickSample::Active);
        assert_eq!(scheduler.inactivity_secs(), 0);
        assert_eq!(scheduler.state_mut().get_activity("home"), 30);
    }

    #[test]
    fn due_plans_follow_idle_streak() {
        let clock = Arc::new(ManualClock::starting_at(NOW));
        let mut scheduler = scheduler_with(FixedExecutor::new(Outcome::Success), clock);
        scheduler.state_mut().add_activity("home", 150);

        assert!(scheduler.due_plans(NOW as f64).is_empty());

        for _ in 0..11 {
            scheduler.record_sample(TickSample::Idle);
        }
        assert_eq!(scheduler.inactivity_secs(), 330);
        let due = scheduler.due_plans(NOW as f64);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "home");
    }

    #[tokio::test]
    async fn success_resets_activity() {
        let clock = Arc::new(ManualClock::starting_at(NOW));
        let executor = FixedExecutor::new(Outcome::IncompleteSnapshot);
        let mut scheduler = scheduler_with(executor.clone(), clock);
        scheduler.state_mut().add_activity("home", 600);

        let due = scheduler.due_plans(NOW as f64);
        scheduler.execute_batch(&due).await;

        assert_eq!(executor.calls.lock().unwrap().as_slice(), ["home"]);
        assert_eq!(scheduler.state_mut().get_activity("home"), 0);
        assert_eq!(scheduler.state().get_holdoff("home"), 0.0);
    }

    #[tokio::test]
    async fn failure_sets_holdoff_and_keeps_activity() {
        let clock = Arc::new(ManualClock::starting_at(NOW));
        let executor = FixedExecutor::new(Outcome::Unknown(2));
        let mut scheduler = scheduler_with(executor.clone(), clock.clone());
        scheduler.state_mut().add_activity("home", 600);

        let due = scheduler.due_plans(clock.now());
        scheduler.execute_batch(&due).await;

        let holdoff = scheduler.state().get_holdoff("home");
        assert_eq!(holdoff, NOW as f64 + 1800.0);
        assert_eq!(scheduler.state_mut().get_activity("home"), 600);

        // Held off until the deadline passes, then due again without intervention.
        clock.advance(Duration::from_secs(1799));
        assert!(scheduler.due_plans(clock.now()).is_empty());
        clock.advance(Duration::from_secs(2));
        assert_eq!(scheduler.due_plans(clock.now()).len(), 1);
    }
}
