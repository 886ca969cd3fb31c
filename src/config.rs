//! Scheduler settings loaded from a TOML file
//!
//! ```toml
//! dry_run = false
//!
//! [statistics]
//! enabled = true
//! path = "carbon-statistics.jsonl"
//!
//! [forecast]
//! provider = "energy-charts"
//! timeout_secs = 10
//! locations = ["de"]
//!
//! [[jobs]]
//! name = "nightly-backup"
//! cron = "0 0 22 * * *"
//! deadline_cron = "0 0 6 * * *"
//! duration_minutes = 60
//! location = "de"
//! command = "./backup.sh"
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::carbon_aware::api::{
    CarbonAwareComputingClient, EnergyChartsFeed, DEFAULT_ENERGY_CHARTS_URL,
};
use crate::carbon_aware::cache::ForecastCache;
use crate::carbon_aware::source::ForecastSource;
use crate::carbon_aware::types::Location;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::scheduler::refresh::DEFAULT_REFRESH_CRON;
use crate::scheduler::schedule::CronSchedule;
use crate::scheduler::statistics::{JsonLinesStatisticsSink, LogStatisticsSink, StatisticsSink};
use crate::scheduler::trigger::{CarbonAwareTrigger, DEFAULT_GROUP};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Compute and record shifts but keep running jobs on their base schedule
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub statistics: StatisticsSettings,
    pub forecast: ForecastSettings,
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StatisticsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// JSON lines file; statistics are logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ForecastSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub provider: ForecastProvider,
}

/// Where forecasts come from
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ForecastProvider {
    /// Cached Energy-Charts feed, refreshed on a schedule
    EnergyCharts {
        #[serde(default)]
        locations: Vec<String>,
        #[serde(default = "default_url_template")]
        url_template: String,
        #[serde(default = "default_refresh_cron")]
        refresh_cron: String,
    },
    /// Live carbon-aware-computing forecast API
    CarbonAwareComputing {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct JobSettings {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Base schedule
    pub cron: String,
    /// Latest acceptable start, evaluated after each base occurrence
    pub deadline_cron: String,
    pub duration_minutes: u32,
    pub location: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_url_template() -> String {
    DEFAULT_ENERGY_CHARTS_URL.to_string()
}

fn default_refresh_cron() -> String {
    DEFAULT_REFRESH_CRON.to_string()
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Forecast source plus the cache behind it, if any
pub struct ForecastBackend {
    pub source: Arc<dyn ForecastSource>,
    pub cache: Option<Arc<ForecastCache>>,
}

impl Settings {
    /// Load and validate a settings file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Cannot read settings file {}: {}", path.display(), e))
        })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.forecast.timeout_secs == 0 {
            return Err(Error::ConfigError(
                "forecast.timeout_secs must be greater than zero".into(),
            ));
        }

        match &self.forecast.provider {
            ForecastProvider::EnergyCharts {
                locations,
                url_template,
                refresh_cron,
            } => {
                for location in locations {
                    Location::from_code(location)?;
                }
                if !url_template.contains("{location}") {
                    return Err(Error::ConfigError(format!(
                        "forecast.url_template '{url_template}' has no {{location}} placeholder"
                    )));
                }
                CronSchedule::parse(refresh_cron)?;
            }
            ForecastProvider::CarbonAwareComputing { url, .. } => {
                if url.trim().is_empty() {
                    return Err(Error::ConfigError("forecast.url must not be empty".into()));
                }
            }
        }

        let mut keys = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !keys.insert((job.group.as_str(), job.name.as_str())) {
                return Err(Error::ConfigError(format!(
                    "Job {}.{} is defined more than once",
                    job.group, job.name
                )));
            }
        }
        Ok(())
    }

    pub fn forecast_timeout(&self) -> Duration {
        Duration::from_secs(self.forecast.timeout_secs)
    }

    /// Every location the cache has to serve, in first-seen order
    pub fn locations(&self) -> Vec<String> {
        let configured: &[String] = match &self.forecast.provider {
            ForecastProvider::EnergyCharts { locations, .. } => locations.as_slice(),
            ForecastProvider::CarbonAwareComputing { .. } => &[],
        };
        let mut merged: Vec<String> = Vec::new();
        for location in configured
            .iter()
            .chain(self.jobs.iter().map(|job| &job.location))
        {
            if !merged.contains(location) {
                merged.push(location.clone());
            }
        }
        merged
    }

    /// Build the configured forecast source. A cache is created but not
    /// initialized; the caller decides when to load it.
    pub fn build_forecast_backend(&self, clock: Arc<dyn Clock>) -> Result<ForecastBackend> {
        let timeout = self.forecast_timeout();
        match &self.forecast.provider {
            ForecastProvider::EnergyCharts { url_template, .. } => {
                let feed = EnergyChartsFeed::new(url_template.clone(), timeout)?;
                let cache = Arc::new(ForecastCache::new(Arc::new(feed), clock));
                Ok(ForecastBackend {
                    source: cache.clone(),
                    cache: Some(cache),
                })
            }
            ForecastProvider::CarbonAwareComputing { url, api_key } => {
                let client =
                    CarbonAwareComputingClient::new(url.clone(), api_key.clone(), timeout)?;
                Ok(ForecastBackend {
                    source: Arc::new(client),
                    cache: None,
                })
            }
        }
    }

    /// Refresh schedule for the cache, when the provider has one
    pub fn refresh_schedule(&self) -> Result<Option<CronSchedule>> {
        match &self.forecast.provider {
            ForecastProvider::EnergyCharts { refresh_cron, .. } => {
                CronSchedule::parse(refresh_cron).map(Some)
            }
            ForecastProvider::CarbonAwareComputing { .. } => Ok(None),
        }
    }

    pub fn statistics_sink(&self) -> Option<Arc<dyn StatisticsSink>> {
        if !self.statistics.enabled {
            return None;
        }
        Some(match &self.statistics.path {
            Some(path) => Arc::new(JsonLinesStatisticsSink::new(path.clone())),
            None => Arc::new(LogStatisticsSink),
        })
    }
}

impl FromStr for Settings {
    type Err = Error;

    fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }
}

impl JobSettings {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::ConfigError("Job name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "Job {}.{}: command must not be empty",
                self.group, self.name
            )));
        }
        CronSchedule::parse(&self.cron)?;
        CronSchedule::parse(&self.deadline_cron)?;
        if self.duration_minutes == 0 {
            return Err(Error::ConfigError(format!(
                "Job {}.{}: duration_minutes must be greater than zero",
                self.group, self.name
            )));
        }
        Location::from_code(&self.location)?;
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end < start {
                return Err(Error::ConfigError(format!(
                    "Job {}.{}: end_time {} is before start_time {}",
                    self.group, self.name, end, start
                )));
            }
        }
        Ok(())
    }

    pub fn build_trigger(
        &self,
        source: Arc<dyn ForecastSource>,
        forecast_timeout: Duration,
    ) -> Result<CarbonAwareTrigger> {
        let mut builder = CarbonAwareTrigger::builder(self.name.clone())
            .group(self.group.clone())
            .base_schedule(Arc::new(CronSchedule::parse(&self.cron)?))
            .deadline_schedule(Arc::new(CronSchedule::parse(&self.deadline_cron)?))
            .job_duration_minutes(self.duration_minutes)
            .location(self.location.clone())
            .forecast_source(source)
            .forecast_timeout(forecast_timeout);
        if let Some(start) = self.start_time {
            builder = builder.start_time(start);
        }
        if let Some(end) = self.end_time {
            builder = builder.end_time(end);
        }
        builder.build()
    }
}
