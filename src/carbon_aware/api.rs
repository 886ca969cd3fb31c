//! Carbon intensity API integration

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::carbon_aware::source::ForecastSource;
use crate::carbon_aware::types::{EmissionDataPoint, EmissionForecast};
use crate::error::{Error, Result};

/// Default Energy-Charts CO2 endpoint, `{location}` is replaced by the zone code
pub const DEFAULT_ENERGY_CHARTS_URL: &str =
    "https://api.energy-charts.info/co2eq?country={location}";

const USER_AGENT: &str = concat!("carbon-aware-scheduler/", env!("CARGO_PKG_VERSION"));

/// Raw columns of the Energy-Charts `co2eq` payload
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RawSeries {
    #[serde(default)]
    pub unix_seconds: Vec<Option<i64>>,
    /// Measured intensity, null where only a forecast exists
    #[serde(default)]
    pub co2eq: Vec<Option<f64>>,
    #[serde(default)]
    pub co2eq_forecast: Vec<Option<f64>>,
}

/// Remote feed the forecast cache refreshes from
#[async_trait]
pub trait ForecastFeed: Send + Sync {
    async fn fetch_series(&self, location: &str) -> Result<RawSeries>;
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(Error::HttpError)
}

/// Energy-Charts (Fraunhofer ISE) CO2-equivalent feed
#[derive(Clone)]
pub struct EnergyChartsFeed {
    client: Client,
    url_template: String,
}

impl EnergyChartsFeed {
    /// Create a feed client for a URL template containing `{location}`
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{location}") {
            return Err(Error::ConfigError(format!(
                "Forecast feed URL template '{url_template}' has no {{location}} placeholder"
            )));
        }
        Ok(Self {
            client: build_client(timeout)?,
            url_template,
        })
    }

    fn url_for(&self, location: &str) -> String {
        self.url_template.replace("{location}", location)
    }
}

#[async_trait]
impl ForecastFeed for EnergyChartsFeed {
    async fn fetch_series(&self, location: &str) -> Result<RawSeries> {
        let url = self.url_for(location);
        debug!("Fetching CO2 forecast feed: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::NetworkError(format!(
                "Energy-Charts API error for {}: {}",
                location,
                response.status()
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            Error::ParseError(format!("malformed co2eq payload for {location}: {e}"))
        })
    }
}

/// One optimal point as returned by the carbon-aware-computing forecast API
#[derive(Debug, Deserialize)]
struct RemoteDataPoint {
    timestamp: DateTime<Utc>,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteForecast {
    location: String,
    window_size: Option<u32>,
    #[serde(default)]
    optimal_data_points: Vec<RemoteDataPoint>,
}

/// Live forecast source backed by the carbon-aware-computing REST API
#[derive(Clone)]
pub struct CarbonAwareComputingClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl CarbonAwareComputingClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            api_key,
        })
    }

    fn to_forecast(remote: RemoteForecast, requested_window_minutes: u32) -> EmissionForecast {
        let window = remote.window_size.unwrap_or(requested_window_minutes);
        let points = remote
            .optimal_data_points
            .into_iter()
            .filter_map(|p| {
                p.value
                    .map(|value| EmissionDataPoint::new(p.timestamp, value, i64::from(window)))
            })
            .collect();
        EmissionForecast {
            location: remote.location,
            requested_window_minutes: window,
            points,
        }
    }
}

#[async_trait]
impl ForecastSource for CarbonAwareComputingClient {
    async fn get_forecast(
        &self,
        locations: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_minutes: u32,
    ) -> Result<Vec<EmissionForecast>> {
        let mut result = Vec::with_capacity(locations.len());

        for location in locations {
            let mut request = self.client.get(&self.url).query(&[
                ("location", location.clone()),
                ("dataStartAt", start.to_rfc3339()),
                ("dataEndAt", end.to_rfc3339()),
                ("windowSize", window_minutes.to_string()),
            ]);
            if let Some(key) = &self.api_key {
                request = request.header("x-api-key", key);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(Error::NetworkError(format!(
                    "Forecast API error for {}: {}",
                    location,
                    response.status()
                )));
            }

            let forecasts: Vec<RemoteForecast> = response.json().await?;
            result.extend(
                forecasts
                    .into_iter()
                    .map(|f| Self::to_forecast(f, window_minutes)),
            );
        }

        info!(
            "Fetched {} emission forecast(s) from carbon-aware-computing API",
            result.len()
        );
        Ok(result)
    }
}
