//! Carbon-aware scheduling
//!
//! Triggers decide when a job should fire, the gate suppresses firings a
//! trigger has moved away from, and the runner ties both to a job.

pub mod gate;
pub mod refresh;
pub mod runner;
pub mod schedule;
pub mod statistics;
pub mod trigger;

pub use gate::FiringGate;
pub use refresh::ForecastRefresher;
pub use runner::{CommandJob, FireContext, FireOutcome, Job, JobRunner};
pub use schedule::{CronSchedule, ScheduleFunction};
pub use statistics::{
    JsonLinesStatisticsSink, LogStatisticsSink, StatisticsRecorder, StatisticsSink,
};
pub use trigger::{
    CarbonAwareTrigger, TriggerBounds, TriggerBuilder, TriggerConfig, TriggerRuntimeState,
    TriggerState,
};
