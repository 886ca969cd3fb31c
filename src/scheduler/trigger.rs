//! Carbon-aware trigger
//!
//! A trigger alternates between asking its base schedule for the next
//! occurrence and asking the forecast source for a cleaner moment inside the
//! `[base, deadline)` window that follows it:
//!
//! ```text
//! Pending ──► Ready ──► DeterminedBetterTime ──► Ready ──► ...
//!               │
//!               └─────► DataUnavailable ──────► Ready ──► ...
//! ```
//!
//! Forecast problems never surface to the caller. The trigger falls back to
//! the base schedule and says so in the log.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::carbon_aware::source::{resolve_optimal_point, ForecastSource};
use crate::carbon_aware::types::{EmissionDataPoint, Location};
use crate::error::{Error, Result};
use crate::scheduler::schedule::ScheduleFunction;

pub const DEFAULT_GROUP: &str = "DEFAULT";
pub const DEFAULT_FORECAST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Created, nothing computed yet
    Pending,
    /// Next call will look for a better execution time
    Ready,
    /// A shifted execution time has been chosen
    DeterminedBetterTime,
    /// No usable forecast; the base schedule is used as-is
    DataUnavailable,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerState::Pending => "PENDING",
            TriggerState::Ready => "READY",
            TriggerState::DeterminedBetterTime => "DETERMINED_BETTER_TIME",
            TriggerState::DataUnavailable => "DATA_UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// Scheduling window owned by the host; the trigger only reads it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerBounds {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

pub struct TriggerConfig {
    pub name: String,
    pub group: String,
    pub base_schedule: Arc<dyn ScheduleFunction>,
    pub deadline_schedule: Arc<dyn ScheduleFunction>,
    pub job_duration_minutes: u32,
    pub location: String,
    pub forecast_source: Arc<dyn ForecastSource>,
    pub forecast_timeout: Duration,
    pub bounds: TriggerBounds,
}

impl TriggerConfig {
    /// `group.name`, used in logs
    pub fn key(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::ConfigError("Trigger name must not be empty".into()));
        }
        if self.job_duration_minutes == 0 {
            return Err(Error::ConfigError(format!(
                "Trigger {}: job duration must be greater than zero",
                self.key()
            )));
        }
        if self.location.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "Trigger {}: location must not be empty",
                self.key()
            )));
        }
        Location::from_code(&self.location)?;
        if let (Some(start), Some(end)) = (self.bounds.start_time, self.bounds.end_time) {
            if end < start {
                return Err(Error::ConfigError(format!(
                    "Trigger {}: end time {} is before start time {}",
                    self.key(),
                    end,
                    start
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("job_duration_minutes", &self.job_duration_minutes)
            .field("location", &self.location)
            .field("forecast_timeout", &self.forecast_timeout)
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

/// Mutable part of a trigger
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TriggerRuntimeState {
    pub state: TriggerState,
    /// Base-schedule time the last successful shift was computed for
    pub configured_execution_time: Option<DateTime<Utc>>,
    pub optimal_execution_time: Option<DateTime<Utc>>,
    pub chosen_data_point: Option<EmissionDataPoint>,
}

impl Default for TriggerRuntimeState {
    fn default() -> Self {
        Self {
            state: TriggerState::Pending,
            configured_execution_time: None,
            optimal_execution_time: None,
            chosen_data_point: None,
        }
    }
}

#[derive(Debug)]
pub struct CarbonAwareTrigger {
    config: TriggerConfig,
    runtime: TriggerRuntimeState,
}

impl CarbonAwareTrigger {
    pub fn new(config: TriggerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            runtime: TriggerRuntimeState::default(),
        })
    }

    pub fn builder(name: impl Into<String>) -> TriggerBuilder {
        TriggerBuilder::new(name)
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn current_state(&self) -> TriggerState {
        self.runtime.state
    }

    pub fn runtime_state(&self) -> &TriggerRuntimeState {
        &self.runtime
    }

    /// Next instant the trigger wants to fire strictly after `after`.
    ///
    /// `None` means the trigger is finished, either because the host bounds
    /// are exhausted or the base schedule has no further occurrence.
    pub async fn next_fire_time_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let bounds = self.config.bounds;
        if bounds.end_time.is_some_and(|end| after >= end) {
            return None;
        }

        let after = match bounds.start_time {
            Some(start) if start > after => start - ChronoDuration::seconds(1),
            _ => after,
        };

        let Some(base_next) = self.config.base_schedule.next_after(after) else {
            debug!("Trigger {}: base schedule is exhausted", self.config.key());
            return None;
        };
        if bounds.end_time.is_some_and(|end| base_next > end) {
            return None;
        }

        match self.runtime.state {
            TriggerState::Pending
            | TriggerState::DataUnavailable
            | TriggerState::DeterminedBetterTime => {
                self.transition(TriggerState::Ready);
                Some(base_next)
            }
            TriggerState::Ready => Some(self.determine_better_time(base_next).await),
        }
    }

    async fn determine_better_time(&mut self, base_next: DateTime<Utc>) -> DateTime<Utc> {
        let key = self.config.key();

        let Some(deadline) = self.config.deadline_schedule.next_after(base_next) else {
            warn!(
                "Trigger {}: deadline schedule has no occurrence after {}, using base schedule",
                key, base_next
            );
            self.transition(TriggerState::DataUnavailable);
            return base_next;
        };

        let lookup = resolve_optimal_point(
            self.config.forecast_source.as_ref(),
            &self.config.location,
            base_next,
            deadline,
            self.config.job_duration_minutes,
            base_next,
        );

        match tokio::time::timeout(self.config.forecast_timeout, lookup).await {
            Ok(Ok(point)) => {
                info!(
                    "Trigger {}: shifting execution from {} to {} ({:.1} gCO2eq/kWh in {})",
                    key, base_next, point.timestamp, point.intensity, self.config.location
                );
                let optimal = point.timestamp;
                self.runtime.configured_execution_time = Some(base_next);
                self.runtime.optimal_execution_time = Some(optimal);
                self.runtime.chosen_data_point = Some(point);
                self.transition(TriggerState::DeterminedBetterTime);
                optimal
            }
            Ok(Err(e)) => {
                warn!(
                    "Trigger {}: no forecast for window {} - {}, using base schedule: {}",
                    key, base_next, deadline, e
                );
                self.transition(TriggerState::DataUnavailable);
                base_next
            }
            Err(_) => {
                warn!(
                    "Trigger {}: {}, using base schedule",
                    key,
                    Error::Timeout(self.config.forecast_timeout)
                );
                self.transition(TriggerState::DataUnavailable);
                base_next
            }
        }
    }

    fn transition(&mut self, next: TriggerState) {
        if self.runtime.state != next {
            debug!(
                "Trigger {}: {} -> {}",
                self.config.key(),
                self.runtime.state,
                next
            );
        }
        self.runtime.state = next;
    }
}

/// Collects trigger settings and validates them on [`TriggerBuilder::build`]
pub struct TriggerBuilder {
    name: String,
    group: String,
    base_schedule: Option<Arc<dyn ScheduleFunction>>,
    deadline_schedule: Option<Arc<dyn ScheduleFunction>>,
    job_duration_minutes: u32,
    location: String,
    forecast_source: Option<Arc<dyn ForecastSource>>,
    forecast_timeout: Duration,
    bounds: TriggerBounds,
}

impl TriggerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: DEFAULT_GROUP.to_string(),
            base_schedule: None,
            deadline_schedule: None,
            job_duration_minutes: 0,
            location: String::new(),
            forecast_source: None,
            forecast_timeout: DEFAULT_FORECAST_TIMEOUT,
            bounds: TriggerBounds::default(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn base_schedule(mut self, schedule: Arc<dyn ScheduleFunction>) -> Self {
        self.base_schedule = Some(schedule);
        self
    }

    pub fn deadline_schedule(mut self, schedule: Arc<dyn ScheduleFunction>) -> Self {
        self.deadline_schedule = Some(schedule);
        self
    }

    pub fn job_duration_minutes(mut self, minutes: u32) -> Self {
        self.job_duration_minutes = minutes;
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn forecast_source(mut self, source: Arc<dyn ForecastSource>) -> Self {
        self.forecast_source = Some(source);
        self
    }

    pub fn forecast_timeout(mut self, timeout: Duration) -> Self {
        self.forecast_timeout = timeout;
        self
    }

    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.bounds.start_time = Some(start);
        self
    }

    pub fn end_time(mut self, end: DateTime<Utc>) -> Self {
        self.bounds.end_time = Some(end);
        self
    }

    pub fn build(self) -> Result<CarbonAwareTrigger> {
        let key = format!("{}.{}", self.group, self.name);
        let missing =
            |what: &str| Error::ConfigError(format!("Trigger {key}: {what} is required"));
        let config = TriggerConfig {
            base_schedule: self
                .base_schedule
                .ok_or_else(|| missing("base schedule"))?,
            deadline_schedule: self
                .deadline_schedule
                .ok_or_else(|| missing("deadline schedule"))?,
            forecast_source: self
                .forecast_source
                .ok_or_else(|| missing("forecast source"))?,
            name: self.name,
            group: self.group,
            job_duration_minutes: self.job_duration_minutes,
            location: self.location,
            forecast_timeout: self.forecast_timeout,
            bounds: self.bounds,
        };
        CarbonAwareTrigger::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carbon_aware::source::testing::StaticSource;
    use crate::scheduler::schedule::CronSchedule;
    use chrono::TimeZone;

    fn on(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, day, hour, minute, 0).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        on(16, hour, minute)
    }

    fn cron(expr: &str) -> Arc<dyn ScheduleFunction> {
        Arc::new(CronSchedule::parse(expr).unwrap())
    }

    /// Hourly forecast for 09:00-16:00 with its minimum at 13:00
    fn hourly_source() -> StaticSource {
        let values = [300.0, 280.0, 250.0, 220.0, 180.0, 200.0, 240.0, 260.0];
        StaticSource::with_points(
            "de",
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| EmissionDataPoint::new(at(9 + i as u32, 0), v, 60))
                .collect(),
        )
    }

    fn daily_builder(source: StaticSource) -> TriggerBuilder {
        CarbonAwareTrigger::builder("nightly-report")
            .group("reports")
            .base_schedule(cron("0 0 9 * * *"))
            .deadline_schedule(cron("0 0 17 * * *"))
            .job_duration_minutes(30)
            .location("de")
            .forecast_source(Arc::new(source))
    }

    // ── state machine ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pending_moves_to_ready_with_base_time() {
        let mut trigger = daily_builder(hourly_source()).build().unwrap();
        assert_eq!(trigger.current_state(), TriggerState::Pending);

        let next = trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(next, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::Ready);
    }

    #[tokio::test]
    async fn test_ready_determines_better_time() {
        let mut trigger = daily_builder(hourly_source()).build().unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;

        let next = trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(next, Some(at(13, 0)));
        assert_eq!(trigger.current_state(), TriggerState::DeterminedBetterTime);

        let runtime = trigger.runtime_state();
        assert_eq!(runtime.configured_execution_time, Some(at(9, 0)));
        assert_eq!(runtime.optimal_execution_time, Some(at(13, 0)));
        assert_eq!(runtime.chosen_data_point.as_ref().unwrap().intensity, 180.0);
    }

    #[tokio::test]
    async fn test_full_cycle_returns_to_ready() {
        let mut trigger = daily_builder(hourly_source()).build().unwrap();
        let mut states = vec![trigger.current_state()];
        for _ in 0..4 {
            trigger.next_fire_time_after(at(8, 0)).await;
            states.push(trigger.current_state());
        }
        assert_eq!(
            states,
            vec![
                TriggerState::Pending,
                TriggerState::Ready,
                TriggerState::DeterminedBetterTime,
                TriggerState::Ready,
                TriggerState::DeterminedBetterTime,
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_source_falls_back_to_base_time() {
        let mut trigger = daily_builder(StaticSource::failing()).build().unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;

        let next = trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(next, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::DataUnavailable);
        assert_eq!(trigger.runtime_state().configured_execution_time, None);

        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::Ready);
    }

    #[tokio::test]
    async fn test_empty_forecast_is_data_unavailable() {
        let source = StaticSource::with_points("de", vec![]);
        let mut trigger = daily_builder(source).build().unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;

        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::DataUnavailable);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let source = StaticSource {
            delay: Some(Duration::from_millis(500)),
            ..hourly_source()
        };
        let mut trigger = daily_builder(source)
            .forecast_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;

        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::DataUnavailable);
    }

    #[tokio::test]
    async fn test_forecast_is_only_queried_when_ready() {
        let source = Arc::new(hourly_source());
        let mut trigger = daily_builder(StaticSource::failing())
            .forecast_source(source.clone())
            .build()
            .unwrap();

        trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(source.calls(), 0);
        trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(source.calls(), 1);
        trigger.next_fire_time_after(at(8, 0)).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_deadline_is_data_unavailable() {
        let mut trigger = daily_builder(hourly_source())
            .deadline_schedule(cron("0 0 17 1 1 * 2020"))
            .build()
            .unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;

        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, Some(at(9, 0)));
        assert_eq!(trigger.current_state(), TriggerState::DataUnavailable);
    }

    // ── bounds ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_end_time_finishes_trigger_without_state_change() {
        let mut trigger = daily_builder(hourly_source())
            .end_time(at(12, 0))
            .build()
            .unwrap();

        assert_eq!(trigger.next_fire_time_after(at(12, 0)).await, None);
        assert_eq!(trigger.current_state(), TriggerState::Pending);
    }

    #[tokio::test]
    async fn test_base_time_after_end_time_finishes_trigger() {
        let mut trigger = daily_builder(hourly_source())
            .end_time(at(8, 30))
            .build()
            .unwrap();
        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, None);
    }

    #[tokio::test]
    async fn test_start_time_in_future_is_honoured() {
        let mut trigger = daily_builder(hourly_source())
            .start_time(on(18, 9, 0))
            .build()
            .unwrap();
        assert_eq!(
            trigger.next_fire_time_after(at(8, 0)).await,
            Some(on(18, 9, 0))
        );
    }

    #[tokio::test]
    async fn test_exhausted_base_schedule_returns_none() {
        let mut trigger = daily_builder(hourly_source())
            .base_schedule(cron("0 0 9 1 1 * 2020"))
            .build()
            .unwrap();
        assert_eq!(trigger.next_fire_time_after(at(8, 0)).await, None);
        assert_eq!(trigger.current_state(), TriggerState::Pending);
    }

    // ── validation ────────────────────────────────────────────────────────

    #[test]
    fn test_builder_requires_schedules_and_source() {
        let err = CarbonAwareTrigger::builder("job")
            .deadline_schedule(cron("0 0 17 * * *"))
            .job_duration_minutes(30)
            .location("de")
            .forecast_source(Arc::new(StaticSource::failing()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("base schedule is required"));

        let err = CarbonAwareTrigger::builder("job")
            .base_schedule(cron("0 0 9 * * *"))
            .deadline_schedule(cron("0 0 17 * * *"))
            .job_duration_minutes(30)
            .location("de")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("forecast source is required"));
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        let zero = daily_builder(hourly_source()).job_duration_minutes(0).build();
        assert!(matches!(zero, Err(Error::ConfigError(_))));

        let empty = daily_builder(hourly_source()).location("").build();
        assert!(matches!(empty, Err(Error::ConfigError(_))));

        let unknown = daily_builder(hourly_source()).location("atlantis").build();
        assert!(matches!(unknown, Err(Error::UnknownLocation(_))));

        let inverted = daily_builder(hourly_source())
            .start_time(at(12, 0))
            .end_time(at(10, 0))
            .build();
        assert!(matches!(inverted, Err(Error::ConfigError(_))));
    }
}
