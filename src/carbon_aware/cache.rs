//! In-memory forecast cache refreshed from a remote feed
//!
//! Each location owns one immutable [`CachedSeries`] behind an `Arc`. A
//! refresh builds a complete new snapshot off to the side and then swaps the
//! pointer, so readers always see either the previous or the next series in
//! full. Queries are answered from memory without touching the network.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::carbon_aware::api::{ForecastFeed, RawSeries};
use crate::carbon_aware::source::ForecastSource;
use crate::carbon_aware::types::{CachedSeries, EmissionDataPoint, EmissionForecast, Location};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Snapshots older than this are still served, with a warning
const STALE_AFTER_MINUTES: i64 = 24 * 60;

pub struct ForecastCache {
    feed: Arc<dyn ForecastFeed>,
    clock: Arc<dyn Clock>,
    /// Guards initialization; `true` once the first refresh succeeded
    initialized: Mutex<bool>,
    locations: RwLock<Vec<String>>,
    series: RwLock<HashMap<String, Arc<CachedSeries>>>,
}

impl ForecastCache {
    pub fn new(feed: Arc<dyn ForecastFeed>, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed,
            clock,
            initialized: Mutex::new(false),
            locations: RwLock::new(Vec::new()),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Register the served locations and load them before returning.
    ///
    /// Calling this again after a successful initialization does nothing.
    pub async fn initialize<I, S>(&self, locations: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            warn!("Forecast cache is already initialized");
            return Ok(());
        }

        let mut codes: Vec<String> = Vec::new();
        for location in locations {
            let code = Location::from_code(location.as_ref().trim())?.code().to_string();
            if !codes.contains(&code) {
                codes.push(code);
            }
        }

        *self.locations.write().await = codes.clone();
        self.refresh().await?;
        *initialized = true;

        info!("Forecast cache initialized with locations: {}", codes.join(", "));
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    pub async fn locations(&self) -> Vec<String> {
        self.locations.read().await.clone()
    }

    /// Reload every known location.
    ///
    /// Locations are fetched concurrently. Each successful location is swapped
    /// in as soon as its whole series is parsed; a failed one keeps serving
    /// its previous snapshot and is reported in [`Error::RefreshFailed`].
    pub async fn refresh(&self) -> Result<()> {
        let locations = self.locations().await;
        if locations.is_empty() {
            debug!("No locations registered, skipping forecast refresh");
            return Ok(());
        }

        let fetches = locations.iter().map(|location| async move {
            let result = self.load_series(location).await;
            (location.clone(), result)
        });
        let results = futures::future::join_all(fetches).await;

        let mut failures = Vec::new();
        for (location, result) in results {
            match result {
                Ok(series) => {
                    debug!(
                        "Refreshed forecast for {} ({} points every {:?} min, horizon {})",
                        location,
                        series.points.len(),
                        series.sample_duration_minutes(),
                        series.max_forecast_timestamp
                    );
                    self.series
                        .write()
                        .await
                        .insert(location, Arc::new(series));
                }
                Err(e) => {
                    warn!("Failed to refresh forecast for {}: {}", location, e);
                    failures.push((location, e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            info!("Forecast cache refreshed for {} location(s)", locations.len());
            Ok(())
        } else {
            Err(Error::RefreshFailed(failures))
        }
    }

    /// Current snapshot for a location
    pub async fn get_series(&self, location: &str) -> Option<Arc<CachedSeries>> {
        self.series.read().await.get(location).cloned()
    }

    async fn load_series(&self, location: &str) -> Result<CachedSeries> {
        let raw = self.feed.fetch_series(location).await?;
        let points = build_points(&raw, location);
        if points.is_empty() {
            warn!("No valid emission data found for location: {}", location);
        }
        Ok(CachedSeries::new(self.clock.now(), points))
    }
}

/// Turn the feed's parallel columns into an ascending, de-duplicated series.
///
/// Measured values win over forecast values. Each point is valid until the
/// next timestamp (the last point reuses the gap to its predecessor). Points
/// with neither value are dropped.
pub fn build_points(raw: &RawSeries, location: &str) -> Vec<EmissionDataPoint> {
    let timestamps: Vec<i64> = raw.unix_seconds.iter().flatten().copied().collect();
    if timestamps.len() != raw.co2eq.len() || timestamps.len() != raw.co2eq_forecast.len() {
        warn!(
            "Invalid co2eq payload for location {}: {} timestamps, {} values, {} forecast values",
            location,
            timestamps.len(),
            raw.co2eq.len(),
            raw.co2eq_forecast.len()
        );
        return Vec::new();
    }
    if timestamps.len() < 2 {
        debug!(
            "Location {} has fewer than two timestamps, sample duration is unknown",
            location
        );
        return Vec::new();
    }

    let mut rows: Vec<(i64, Option<f64>)> = timestamps
        .iter()
        .zip(raw.co2eq.iter().zip(raw.co2eq_forecast.iter()))
        .map(|(&ts, (&measured, &forecast))| (ts, measured.or(forecast)))
        .filter(|&(ts, _)| {
            let representable = Utc.timestamp_opt(ts, 0).single().is_some();
            if !representable {
                warn!("Dropping out-of-range timestamp {} for location {}", ts, location);
            }
            representable
        })
        .collect();
    rows.sort_by_key(|(ts, _)| *ts);
    rows.dedup_by_key(|(ts, _)| *ts);
    if rows.len() < 2 {
        return Vec::new();
    }

    let last = rows.len() - 1;
    rows.iter()
        .enumerate()
        .filter_map(|(i, &(ts, value))| {
            let neighbour = if i == last { rows[i - 1].0 } else { rows[i + 1].0 };
            let gap_seconds = neighbour.checked_sub(ts)?.checked_abs()?;
            let timestamp = Utc.timestamp_opt(ts, 0).single()?;
            value.map(|intensity| EmissionDataPoint::new(timestamp, intensity, gap_seconds / 60))
        })
        .collect()
}

#[async_trait]
impl ForecastSource for ForecastCache {
    async fn get_forecast(
        &self,
        locations: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_minutes: u32,
    ) -> Result<Vec<EmissionForecast>> {
        let mut result = Vec::with_capacity(locations.len());

        for code in locations {
            let location = Location::from_code(code)?;
            let series = self
                .get_series(location.code())
                .await
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::NoForecast(format!(
                        "No forecast available for location [{}]",
                        location.display_name()
                    ))
                })?;

            if series.is_stale(self.clock.now(), STALE_AFTER_MINUTES) {
                warn!(
                    "Forecast for {} was last refreshed at {}",
                    location.code(),
                    series.last_updated
                );
            }

            if series.max_forecast_timestamp < start {
                return Err(Error::NoForecast(format!(
                    "Start date {} is after forecasted maximum date {}",
                    start, series.max_forecast_timestamp
                )));
            }

            let end = if end > series.max_forecast_timestamp {
                warn!(
                    "End date {} is after forecasted maximum date {}. Forecasted maximum date will be set as end date!",
                    end, series.max_forecast_timestamp
                );
                series.max_forecast_timestamp
            } else {
                end
            };

            result.push(EmissionForecast {
                location: location.code().to_string(),
                requested_window_minutes: window_minutes,
                points: series.window(start, end),
            });
        }

        Ok(result)
    }
}
