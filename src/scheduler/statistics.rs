//! Carbon statistics for time-shifted executions
//!
//! Every time a trigger fires right after deciding on a better execution
//! time, the recorder compares the intensity at the originally configured
//! time with the intensity at the chosen time and hands the pair to a sink.

use async_trait::async_trait;
use chrono::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::carbon_aware::source::{resolve_optimal_point, ForecastSource};
use crate::carbon_aware::types::CarbonStatistic;
use crate::error::Result;
use crate::scheduler::runner::FireContext;
use crate::scheduler::trigger::{CarbonAwareTrigger, TriggerState};

#[async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn record(&self, statistic: &CarbonStatistic) -> Result<()>;
}

/// Writes each statistic to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatisticsSink;

#[async_trait]
impl StatisticsSink for LogStatisticsSink {
    async fn record(&self, statistic: &CarbonStatistic) -> Result<()> {
        info!(
            job = %format!("{}.{}", statistic.job_group, statistic.job_name),
            location = %statistic.location,
            dry_run = statistic.dry_run,
            "Carbon statistic: configured {} ({:?} gCO2eq/kWh) -> executed {} ({:?} gCO2eq/kWh)",
            statistic.configured_timestamp,
            statistic.carbon_intensity_configured,
            statistic.execution_timestamp,
            statistic.carbon_intensity_rescheduled,
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonLinesStatisticsSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesStatisticsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StatisticsSink for JsonLinesStatisticsSink {
    async fn record(&self, statistic: &CarbonStatistic) -> Result<()> {
        let mut line = serde_json::to_string(statistic)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct StatisticsRecorder {
    source: Arc<dyn ForecastSource>,
    sink: Arc<dyn StatisticsSink>,
    dry_run: bool,
}

impl StatisticsRecorder {
    pub fn new(
        source: Arc<dyn ForecastSource>,
        sink: Arc<dyn StatisticsSink>,
        dry_run: bool,
    ) -> Self {
        Self {
            source,
            sink,
            dry_run,
        }
    }

    /// Record a statistic if `trigger` has just shifted its execution.
    ///
    /// Returns the statistic that was handed to the sink. A failing intensity
    /// lookup records `None` for the configured intensity; a failing sink is
    /// logged and otherwise ignored.
    pub async fn on_trigger_fired(
        &self,
        trigger: &CarbonAwareTrigger,
        ctx: &FireContext,
    ) -> Option<CarbonStatistic> {
        if trigger.current_state() != TriggerState::DeterminedBetterTime {
            return None;
        }

        let config = trigger.config();
        let runtime = trigger.runtime_state();
        let (Some(configured), Some(optimal)) = (
            runtime.configured_execution_time,
            runtime.optimal_execution_time,
        ) else {
            return None;
        };

        let lookup_end =
            configured + Duration::minutes(i64::from(config.job_duration_minutes) + 1);
        let carbon_intensity_configured = match resolve_optimal_point(
            self.source.as_ref(),
            &config.location,
            configured,
            lookup_end,
            config.job_duration_minutes,
            configured,
        )
        .await
        {
            Ok(point) => Some(point.intensity),
            Err(e) => {
                debug!(
                    "No intensity for configured time {} of {}: {}",
                    configured,
                    config.key(),
                    e
                );
                None
            }
        };

        let statistic = CarbonStatistic {
            job_execution_id: ctx.job_execution_id.clone(),
            job_name: ctx.job_name.clone(),
            job_group: ctx.job_group.clone(),
            configured_timestamp: configured,
            execution_timestamp: optimal,
            job_duration_minutes: config.job_duration_minutes,
            carbon_intensity_configured,
            carbon_intensity_rescheduled: runtime.chosen_data_point.as_ref().map(|p| p.intensity),
            location: config.location.clone(),
            dry_run: self.dry_run,
        };

        if let Err(e) = self.sink.record(&statistic).await {
            warn!(
                "Failed to record carbon statistic for {}: {}",
                config.key(),
                e
            );
        }
        Some(statistic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carbon_aware::source::testing::StaticSource;
    use crate::carbon_aware::types::EmissionDataPoint;
    use crate::error::Error;
    use crate::scheduler::schedule::CronSchedule;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex as StdMutex;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 16, hour, minute, 0).unwrap()
    }

    #[derive(Default)]
    struct MemorySink {
        records: StdMutex<Vec<CarbonStatistic>>,
    }

    #[async_trait]
    impl StatisticsSink for MemorySink {
        async fn record(&self, statistic: &CarbonStatistic) -> Result<()> {
            self.records.lock().unwrap().push(statistic.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl StatisticsSink for BrokenSink {
        async fn record(&self, _statistic: &CarbonStatistic) -> Result<()> {
            Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    fn source() -> Arc<StaticSource> {
        Arc::new(StaticSource::with_points(
            "de",
            vec![
                EmissionDataPoint::new(at(9, 0), 300.0, 60),
                EmissionDataPoint::new(at(10, 0), 120.0, 60),
                EmissionDataPoint::new(at(11, 0), 200.0, 60),
            ],
        ))
    }

    async fn shifted_trigger(source: Arc<StaticSource>) -> CarbonAwareTrigger {
        let mut trigger = CarbonAwareTrigger::builder("report")
            .group("nightly")
            .base_schedule(Arc::new(CronSchedule::parse("0 0 9 * * *").unwrap()))
            .deadline_schedule(Arc::new(CronSchedule::parse("0 0 12 * * *").unwrap()))
            .job_duration_minutes(30)
            .location("de")
            .forecast_source(source)
            .build()
            .unwrap();
        trigger.next_fire_time_after(at(8, 0)).await;
        trigger.next_fire_time_after(at(8, 0)).await;
        trigger
    }

    fn ctx() -> FireContext {
        FireContext {
            job_execution_id: "report-1".to_string(),
            job_name: "report".to_string(),
            job_group: "nightly".to_string(),
            fired_at: at(9, 0),
        }
    }

    #[tokio::test]
    async fn test_records_shifted_execution() {
        let sink = Arc::new(MemorySink::default());
        let trigger = shifted_trigger(source()).await;
        let recorder = StatisticsRecorder::new(source(), sink.clone(), false);

        let statistic = recorder.on_trigger_fired(&trigger, &ctx()).await.unwrap();
        assert_eq!(statistic.configured_timestamp, at(9, 0));
        assert_eq!(statistic.execution_timestamp, at(10, 0));
        assert_eq!(statistic.carbon_intensity_rescheduled, Some(120.0));
        // StaticSource ignores the window, so the lookup sees the same minimum
        assert_eq!(statistic.carbon_intensity_configured, Some(120.0));
        assert_eq!(statistic.job_execution_id, "report-1");
        assert!(!statistic.dry_run);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_unshifted_firings() {
        let sink = Arc::new(MemorySink::default());
        let mut trigger = shifted_trigger(source()).await;
        trigger.next_fire_time_after(at(10, 0)).await;
        assert_eq!(trigger.current_state(), TriggerState::Ready);

        let recorder = StatisticsRecorder::new(source(), sink.clone(), false);
        assert!(recorder.on_trigger_fired(&trigger, &ctx()).await.is_none());
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_lookup_records_none() {
        let sink = Arc::new(MemorySink::default());
        let trigger = shifted_trigger(source()).await;
        let recorder =
            StatisticsRecorder::new(Arc::new(StaticSource::failing()), sink.clone(), true);

        let statistic = recorder.on_trigger_fired(&trigger, &ctx()).await.unwrap();
        assert_eq!(statistic.carbon_intensity_configured, None);
        assert_eq!(statistic.carbon_intensity_rescheduled, Some(120.0));
        assert!(statistic.dry_run);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_fatal() {
        let trigger = shifted_trigger(source()).await;
        let recorder = StatisticsRecorder::new(source(), Arc::new(BrokenSink), false);
        assert!(recorder.on_trigger_fired(&trigger, &ctx()).await.is_some());
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesStatisticsSink::new(dir.path().join("stats.jsonl"));
        let trigger = shifted_trigger(source()).await;
        let recorder = StatisticsRecorder::new(source(), Arc::new(MemorySink::default()), false);
        let statistic = recorder.on_trigger_fired(&trigger, &ctx()).await.unwrap();

        sink.record(&statistic).await.unwrap();
        sink.record(&statistic).await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: CarbonStatistic = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, statistic);
    }

    #[tokio::test]
    async fn test_log_sink_accepts_statistics() {
        let trigger = shifted_trigger(source()).await;
        let recorder = StatisticsRecorder::new(source(), Arc::new(LogStatisticsSink), false);
        assert!(recorder.on_trigger_fired(&trigger, &ctx()).await.is_some());
    }
}
