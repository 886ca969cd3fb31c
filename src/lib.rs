//! Carbon-aware job scheduling
//!
//! This crate shifts recurring jobs into low-carbon-intensity intervals of
//! the power grid. A [`scheduler::CarbonAwareTrigger`] asks a
//! [`carbon_aware::ForecastSource`] for the cleanest moment between a job's
//! base schedule and its deadline, and a [`scheduler::FiringGate`] makes sure
//! the job runs only at that moment.

pub mod carbon_aware;
pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;

pub use crate::error::{Error, Result};
