//! Pluggable forecast capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::carbon_aware::selector::{select_optimal, window_len};
use crate::carbon_aware::types::{EmissionDataPoint, EmissionForecast};
use crate::error::{Error, Result};

/// Anything that can answer "what will the grid look like between `start` and `end`"
#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Forecasts for each requested location over `[start, end)`.
    ///
    /// `window_minutes` is the duration of the job the caller wants to place.
    async fn get_forecast(
        &self,
        locations: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_minutes: u32,
    ) -> Result<Vec<EmissionForecast>>;
}

/// Query `source` and select the best execution point for one location.
///
/// Returns [`Error::NoForecast`] when the source has nothing for the location
/// and [`Error::InsufficientData`] when the data is too short for the job.
pub async fn resolve_optimal_point(
    source: &dyn ForecastSource,
    location: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    job_duration_minutes: u32,
    query_time: DateTime<Utc>,
) -> Result<EmissionDataPoint> {
    let forecasts = source
        .get_forecast(&[location.to_string()], start, end, job_duration_minutes)
        .await?;

    let points: Vec<EmissionDataPoint> = forecasts
        .into_iter()
        .filter(|f| f.location == location)
        .flat_map(|f| f.points)
        .collect();

    if points.is_empty() {
        return Err(Error::NoForecast(format!(
            "No forecast available for location [{location}]"
        )));
    }

    select_optimal(&points, job_duration_minutes, query_time).ok_or_else(|| {
        let sample = points[0].sample_duration_minutes.max(1);
        Error::InsufficientData {
            location: location.to_string(),
            job_duration_minutes,
            required: window_len(i64::from(job_duration_minutes), sample),
            available: points.len(),
        }
    })
}
