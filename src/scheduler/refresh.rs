//! Periodic forecast cache refresh

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::carbon_aware::cache::ForecastCache;
use crate::clock::Clock;
use crate::error::Result;
use crate::scheduler::schedule::{CronSchedule, ScheduleFunction};

/// Several refreshes a day, clustered around the evening forecast updates
pub const DEFAULT_REFRESH_CRON: &str = "0 20 8,12,16,18,19,20 * * *";

const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(15);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(5));
    base.saturating_mul(factor).min(max)
}

pub struct ForecastRefresher {
    cache: Arc<ForecastCache>,
    schedule: Arc<dyn ScheduleFunction>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ForecastRefresher {
    pub fn new(
        cache: Arc<ForecastCache>,
        schedule: Arc<dyn ScheduleFunction>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            schedule,
            clock,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Refresher on [`DEFAULT_REFRESH_CRON`]
    pub fn with_default_schedule(cache: Arc<ForecastCache>, clock: Arc<dyn Clock>) -> Result<Self> {
        let schedule = CronSchedule::parse(DEFAULT_REFRESH_CRON)?;
        Ok(Self::new(cache, Arc::new(schedule), clock))
    }

    pub fn with_retry(
        mut self,
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Refresh on every schedule occurrence until the schedule is exhausted
    pub async fn run(&self) {
        info!("Starting forecast refresher");

        loop {
            let now = self.clock.now();
            let Some(next) = self.schedule.next_after(now) else {
                warn!("Forecast refresh schedule has no further occurrence, stopping");
                return;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if let Err(e) = self.refresh_with_retry().await {
                error!("Forecast refresh cycle failed: {}", e);
            }
        }
    }

    /// One refresh cycle, retried with backoff while it keeps failing
    pub async fn refresh_with_retry(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.cache.refresh().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    let delay = calculate_backoff(attempt, self.base_delay, self.max_delay);
                    warn!(
                        "Forecast refresh attempt {} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
