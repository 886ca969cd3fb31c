//! Carbon intensity forecasts
//!
//! This module fetches grid carbon-intensity forecasts, keeps them in memory
//! and picks the lowest-emission point for a job of a given duration.

pub mod api;
pub mod cache;
pub mod selector;
pub mod source;
pub mod types;

pub use api::{CarbonAwareComputingClient, EnergyChartsFeed, ForecastFeed, RawSeries};
pub use cache::ForecastCache;
pub use selector::select_optimal;
pub use source::{resolve_optimal_point, ForecastSource};
pub use types::{CachedSeries, CarbonStatistic, EmissionDataPoint, EmissionForecast, Location};
