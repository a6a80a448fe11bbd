//! Backup scheduling.
//!
//! Two drivers share the [`PlanExecutor`](crate::engine::PlanExecutor) seam:
//! the activity-driven [`Scheduler`] daemon and the one-shot
//! [`RetrySupervisor`].

pub mod activity;
pub mod clock;
pub mod retry;
pub mod runner;
pub mod state;

pub use activity::{ActivitySensor, ActivitySession, EventDeviceSensor, EventDeviceSession};
pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{RetryPolicy, RetryReport, RetrySupervisor};
pub use runner::{Scheduler, SchedulerConfig, TickSample};
pub use state::StateStore;
