//! Types for carbon-aware scheduling

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Carbon intensity valid for a span of time starting at `timestamp`
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EmissionDataPoint {
    /// Start of the validity interval
    pub timestamp: DateTime<Utc>,
    /// Grid carbon intensity in gCO2eq/kWh
    pub intensity: f64,
    /// Length of the validity interval in minutes
    pub sample_duration_minutes: i64,
}

impl EmissionDataPoint {
    pub fn new(timestamp: DateTime<Utc>, intensity: f64, sample_duration_minutes: i64) -> Self {
        Self {
            timestamp,
            intensity,
            sample_duration_minutes,
        }
    }

    /// End of the validity interval (exclusive), saturating at the latest
    /// representable instant
    pub fn valid_until(&self) -> DateTime<Utc> {
        TimeDelta::try_minutes(self.sample_duration_minutes)
            .and_then(|d| self.timestamp.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True when `[timestamp, valid_until)` overlaps `[start, end)`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.valid_until() > start && self.timestamp < end
    }
}

/// Emission time series answering one forecast query
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EmissionForecast {
    /// Location code (e.g. "de")
    pub location: String,
    /// Job duration the query was made for
    pub requested_window_minutes: u32,
    /// Points ordered by timestamp, ascending
    pub points: Vec<EmissionDataPoint>,
}

/// Snapshot of the forecast held for one location
#[derive(Clone, Debug)]
pub struct CachedSeries {
    pub last_updated: DateTime<Utc>,
    /// Timestamp of the last point; queries never look past it
    pub max_forecast_timestamp: DateTime<Utc>,
    pub points: Vec<EmissionDataPoint>,
}

impl CachedSeries {
    /// Build a snapshot, deriving the horizon from the last point
    pub fn new(last_updated: DateTime<Utc>, points: Vec<EmissionDataPoint>) -> Self {
        let max_forecast_timestamp = points
            .last()
            .map(|p| p.timestamp)
            .unwrap_or(last_updated);
        Self {
            last_updated,
            max_forecast_timestamp,
            points,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sample duration shared by every point of the series
    pub fn sample_duration_minutes(&self) -> Option<i64> {
        self.points.first().map(|p| p.sample_duration_minutes)
    }

    /// Points whose validity interval intersects `[start, end)`
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<EmissionDataPoint> {
        self.points
            .iter()
            .filter(|p| p.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Check if data is stale (older than specified minutes)
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_minutes: i64) -> bool {
        now.signed_duration_since(self.last_updated).num_minutes() > max_age_minutes
    }
}

/// Bidding zones published by the Energy-Charts CO2 feed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    De,
    Ch,
    Eu,
    All,
    Ba,
    At,
    Be,
    Bg,
    Cy,
    Cz,
    Dk,
    Ee,
    Es,
    Fi,
    Fr,
    Ge,
    Gr,
    Hr,
    Hu,
    Ie,
    It,
    Lt,
    Lu,
    Lv,
    Md,
    Me,
    Mk,
    Nl,
    No,
    Pl,
    Pt,
    Ro,
    Rs,
    Se,
    Si,
    Sk,
    Uk,
    Xk,
}

impl Location {
    pub const ALL: [Location; 38] = [
        Location::De,
        Location::Ch,
        Location::Eu,
        Location::All,
        Location::Ba,
        Location::At,
        Location::Be,
        Location::Bg,
        Location::Cy,
        Location::Cz,
        Location::Dk,
        Location::Ee,
        Location::Es,
        Location::Fi,
        Location::Fr,
        Location::Ge,
        Location::Gr,
        Location::Hr,
        Location::Hu,
        Location::Ie,
        Location::It,
        Location::Lt,
        Location::Lu,
        Location::Lv,
        Location::Md,
        Location::Me,
        Location::Mk,
        Location::Nl,
        Location::No,
        Location::Pl,
        Location::Pt,
        Location::Ro,
        Location::Rs,
        Location::Se,
        Location::Si,
        Location::Sk,
        Location::Uk,
        Location::Xk,
    ];

    /// Lowercase code used by the feed
    pub fn code(&self) -> &'static str {
        match self {
            Location::De => "de",
            Location::Ch => "ch",
            Location::Eu => "eu",
            Location::All => "all",
            Location::Ba => "ba",
            Location::At => "at",
            Location::Be => "be",
            Location::Bg => "bg",
            Location::Cy => "cy",
            Location::Cz => "cz",
            Location::Dk => "dk",
            Location::Ee => "ee",
            Location::Es => "es",
            Location::Fi => "fi",
            Location::Fr => "fr",
            Location::Ge => "ge",
            Location::Gr => "gr",
            Location::Hr => "hr",
            Location::Hu => "hu",
            Location::Ie => "ie",
            Location::It => "it",
            Location::Lt => "lt",
            Location::Lu => "lu",
            Location::Lv => "lv",
            Location::Md => "md",
            Location::Me => "me",
            Location::Mk => "mk",
            Location::Nl => "nl",
            Location::No => "no",
            Location::Pl => "pl",
            Location::Pt => "pt",
            Location::Ro => "ro",
            Location::Rs => "rs",
            Location::Se => "se",
            Location::Si => "si",
            Location::Sk => "sk",
            Location::Uk => "uk",
            Location::Xk => "xk",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Location::De => "Germany",
            Location::Ch => "Switzerland",
            Location::Eu => "European Union",
            Location::All => "Europe",
            Location::Ba => "Bosnia-Herzegovina",
            Location::At => "Austria",
            Location::Be => "Belgium",
            Location::Bg => "Bulgaria",
            Location::Cy => "Cyprus",
            Location::Cz => "Czech Republic",
            Location::Dk => "Denmark",
            Location::Ee => "Estonia",
            Location::Es => "Spain",
            Location::Fi => "Finland",
            Location::Fr => "France",
            Location::Ge => "Georgia",
            Location::Gr => "Greece",
            Location::Hr => "Croatia",
            Location::Hu => "Hungary",
            Location::Ie => "Ireland",
            Location::It => "Italy",
            Location::Lt => "Lithuania",
            Location::Lu => "Luxembourg",
            Location::Lv => "Latvia",
            Location::Md => "Moldova",
            Location::Me => "Montenegro",
            Location::Mk => "North Macedonia",
            Location::Nl => "Netherlands",
            Location::No => "Norway",
            Location::Pl => "Poland",
            Location::Pt => "Portugal",
            Location::Ro => "Romania",
            Location::Rs => "Serbia",
            Location::Se => "Sweden",
            Location::Si => "Slovenia",
            Location::Sk => "Slovak Republic",
            Location::Uk => "United Kingdom",
            Location::Xk => "Kosovo",
        }
    }

    /// Resolve a lowercase feed code such as "de"
    pub fn from_code(code: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.code() == code)
            .ok_or_else(|| Error::UnknownLocation(code.to_string()))
    }
}

/// Outcome of one time-shifted firing, handed to statistics sinks
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CarbonStatistic {
    pub job_execution_id: String,
    pub job_name: String,
    pub job_group: String,
    /// When the base schedule wanted the job to run
    pub configured_timestamp: DateTime<Utc>,
    /// When the job was moved to
    pub execution_timestamp: DateTime<Utc>,
    pub job_duration_minutes: u32,
    pub carbon_intensity_configured: Option<f64>,
    pub carbon_intensity_rescheduled: Option<f64>,
    pub location: String,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 16, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_location_round_trips_through_code() {
        for location in Location::ALL {
            assert_eq!(Location::from_code(location.code()).unwrap(), location);
        }
        assert_eq!(Location::from_code("de").unwrap().display_name(), "Germany");
    }

    #[test]
    fn test_unknown_location_is_rejected() {
        let err = Location::from_code("DE").unwrap_err();
        assert!(matches!(err, Error::UnknownLocation(code) if code == "DE"));
    }

    #[test]
    fn test_series_horizon_follows_last_point() {
        let series = CachedSeries::new(
            at(8, 0),
            vec![
                EmissionDataPoint::new(at(9, 0), 300.0, 15),
                EmissionDataPoint::new(at(9, 15), 310.0, 15),
            ],
        );
        assert_eq!(series.max_forecast_timestamp, at(9, 15));

        let empty = CachedSeries::new(at(8, 0), vec![]);
        assert_eq!(empty.max_forecast_timestamp, at(8, 0));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_window_keeps_points_still_in_effect_at_start() {
        let series = CachedSeries::new(
            at(8, 0),
            vec![
                EmissionDataPoint::new(at(8, 30), 1.0, 15),
                EmissionDataPoint::new(at(8, 46), 2.0, 15),
                EmissionDataPoint::new(at(9, 0), 3.0, 15),
                EmissionDataPoint::new(at(9, 15), 4.0, 15),
            ],
        );
        let window = series.window(at(9, 0), at(9, 15));
        let values: Vec<f64> = window.iter().map(|p| p.intensity).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_valid_until_saturates_on_huge_duration() {
        let point = EmissionDataPoint::new(at(9, 0), 100.0, 16_666_666_666_666);
        assert_eq!(point.valid_until(), DateTime::<Utc>::MAX_UTC);
        assert!(point.overlaps(at(9, 0), at(10, 0)));

        let point = EmissionDataPoint::new(at(9, 0), 100.0, i64::MAX);
        assert_eq!(point.valid_until(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_staleness() {
        let series = CachedSeries::new(at(8, 0), vec![]);
        assert!(!series.is_stale(at(8, 10), 15));
        assert!(series.is_stale(at(8, 16), 15));
    }
}
