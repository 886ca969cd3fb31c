//! Job runner driving one carbon-aware trigger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::scheduler::gate::FiringGate;
use crate::scheduler::statistics::StatisticsRecorder;
use crate::scheduler::trigger::CarbonAwareTrigger;

/// Identity of one firing, shared with the job and the statistics recorder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FireContext {
    pub job_execution_id: String,
    pub job_name: String,
    pub job_group: String,
    pub fired_at: DateTime<Utc>,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn group(&self) -> &str;

    async fn execute(&self, ctx: &FireContext) -> anyhow::Result<()>;
}

/// Runs a shell command
#[derive(Clone, Debug)]
pub struct CommandJob {
    name: String,
    group: String,
    command: String,
}

impl CommandJob {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            command: command.into(),
        }
    }

    fn shell_command(&self) -> tokio::process::Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(&self.command);
        cmd
    }
}

#[async_trait]
impl Job for CommandJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> &str {
        &self.group
    }

    async fn execute(&self, ctx: &FireContext) -> anyhow::Result<()> {
        debug!("Running command for {}: {}", ctx.job_execution_id, self.command);
        let status = self
            .shell_command()
            .env("CARBON_JOB_EXECUTION_ID", &ctx.job_execution_id)
            .env("CARBON_JOB_FIRED_AT", ctx.fired_at.to_rfc3339())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("command '{}' exited with {}", self.command, status);
        }
        Ok(())
    }
}

/// What happened at one fire time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FireOutcome {
    pub fired_at: DateTime<Utc>,
    pub executed: bool,
    pub next: Option<DateTime<Utc>>,
}

pub struct JobRunner {
    trigger: CarbonAwareTrigger,
    job: Arc<dyn Job>,
    gate: FiringGate,
    statistics: Option<Arc<StatisticsRecorder>>,
    clock: Arc<dyn Clock>,
}

impl JobRunner {
    pub fn new(
        trigger: CarbonAwareTrigger,
        job: Arc<dyn Job>,
        gate: FiringGate,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            trigger,
            job,
            gate,
            statistics: None,
            clock,
        }
    }

    pub fn with_statistics(mut self, recorder: Arc<StatisticsRecorder>) -> Self {
        self.statistics = Some(recorder);
        self
    }

    pub fn trigger(&self) -> &CarbonAwareTrigger {
        &self.trigger
    }

    /// First fire time, computed from the current clock
    pub async fn first_fire_time(&mut self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.trigger.next_fire_time_after(now).await
    }

    /// Handle the firing scheduled for `fire_at`.
    ///
    /// The trigger is advanced first, then statistics are recorded and the
    /// gate decides whether the job runs. Job failures are logged.
    pub async fn fire(&mut self, fire_at: DateTime<Utc>) -> FireOutcome {
        let next = self.trigger.next_fire_time_after(fire_at).await;

        let ctx = FireContext {
            job_execution_id: format!(
                "{}.{}-{}",
                self.job.group(),
                self.job.name(),
                fire_at.timestamp_millis()
            ),
            job_name: self.job.name().to_string(),
            job_group: self.job.group().to_string(),
            fired_at: fire_at,
        };

        if let Some(recorder) = &self.statistics {
            recorder.on_trigger_fired(&self.trigger, &ctx).await;
        }

        let state = self.trigger.current_state();
        let executed = if self.gate.should_veto(state) {
            info!(
                "Skipping {} at {} (trigger state {}), next fire time {:?}",
                ctx.job_execution_id, fire_at, state, next
            );
            false
        } else {
            info!("Executing {} at {}", ctx.job_execution_id, fire_at);
            if let Err(e) = self.job.execute(&ctx).await {
                error!("Job {} failed: {:#}", ctx.job_execution_id, e);
            }
            true
        };

        FireOutcome {
            fired_at: fire_at,
            executed,
            next,
        }
    }

    /// Fire until the trigger has no further fire time
    pub async fn run(mut self) {
        let key = self.trigger.config().key();
        let mut next = self.first_fire_time().await;
        info!(
            "Scheduled {}{}, first fire time {:?}",
            key,
            if self.gate.is_dry_run() { " (dry run)" } else { "" },
            next
        );

        while let Some(fire_at) = next {
            let wait = (fire_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            next = self.fire(fire_at).await.next;
        }

        info!("Trigger {} has no further fire time", key);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
