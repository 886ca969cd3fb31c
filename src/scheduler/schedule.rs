//! Recurrence rules

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Given an instant, yields the next instant matching a recurrence rule
pub trait ScheduleFunction: Send + Sync {
    /// First matching instant strictly after `after`, or `None` if the rule
    /// never fires again
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Cron expression with a seconds field (`sec min hour dom month dow [year]`)
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let schedule =
            cron::Schedule::from_str(expression.trim()).map_err(|e| Error::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl ScheduleFunction for CronSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}
