use std::path::PathBuf;
use std::sync::Arc;

use carbon_aware_scheduler::carbon_aware::{resolve_optimal_point, Location};
use carbon_aware_scheduler::clock::{Clock, SystemClock};
use carbon_aware_scheduler::config::Settings;
use carbon_aware_scheduler::scheduler::{
    CommandJob, CronSchedule, FiringGate, ForecastRefresher, JobRunner, ScheduleFunction,
    StatisticsRecorder,
};
use carbon_aware_scheduler::Error;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured jobs
    Run(RunArgs),
    /// Show the best execution point for a job starting now
    Forecast(ForecastArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Settings file
    #[arg(long, env = "CARBON_SCHEDULER_CONFIG")]
    config: PathBuf,

    /// Compute and record shifts but run jobs on their original schedule
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ForecastArgs {
    /// Settings file
    #[arg(long, env = "CARBON_SCHEDULER_CONFIG")]
    config: PathBuf,

    /// Location code, e.g. "de"
    #[arg(long)]
    location: String,

    /// Job duration in minutes
    #[arg(long, default_value_t = 30)]
    duration: u32,

    /// Latest acceptable start, as a cron expression with seconds
    #[arg(long, default_value = "0 0 6 * * *")]
    deadline_cron: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Carbon Aware Scheduler v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_json);
            run_scheduler(run_args).await
        }
        Commands::Forecast(forecast_args) => {
            init_tracing(args.log_json);
            run_forecast(forecast_args).await
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json_layer = json.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn run_scheduler(args: RunArgs) -> Result<(), Error> {
    let mut settings = Settings::from_path(&args.config)?;
    if args.dry_run {
        settings.dry_run = true;
    }

    info!(
        "Starting Carbon Aware Scheduler v{} with {} job(s){}",
        env!("CARGO_PKG_VERSION"),
        settings.jobs.len(),
        if settings.dry_run { " in dry-run mode" } else { "" }
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = settings.build_forecast_backend(clock.clone())?;

    let mut refresher = None;
    if let Some(cache) = &backend.cache {
        match cache.initialize(settings.locations()).await {
            Ok(()) => {}
            Err(Error::RefreshFailed(failures)) => {
                warn!(
                    "Initial forecast load incomplete, affected jobs use their base schedule until the next refresh: {}",
                    Error::RefreshFailed(failures)
                );
            }
            Err(e) => return Err(e),
        }
        if let Some(schedule) = settings.refresh_schedule()? {
            info!("Refreshing forecasts on '{}'", schedule.expression());
            refresher = Some(
                ForecastRefresher::new(cache.clone(), Arc::new(schedule), clock.clone()).spawn(),
            );
        }
    }

    let gate = FiringGate::new(settings.dry_run);
    let recorder = settings.statistics_sink().map(|sink| {
        Arc::new(StatisticsRecorder::new(
            backend.source.clone(),
            sink,
            settings.dry_run,
        ))
    });

    let mut runners = Vec::with_capacity(settings.jobs.len());
    for job in &settings.jobs {
        let trigger = job.build_trigger(backend.source.clone(), settings.forecast_timeout())?;
        let command = Arc::new(CommandJob::new(
            job.name.clone(),
            job.group.clone(),
            job.command.clone(),
        ));
        let mut runner = JobRunner::new(trigger, command, gate, clock.clone());
        if let Some(recorder) = &recorder {
            runner = runner.with_statistics(recorder.clone());
        }
        runners.push(runner.spawn());
    }

    if runners.is_empty() {
        warn!("No jobs configured, nothing to schedule");
    }

    tokio::select! {
        _ = futures::future::join_all(runners) => {
            info!("All triggers finished");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    if let Some(handle) = refresher {
        handle.abort();
    }
    Ok(())
}

async fn run_forecast(args: ForecastArgs) -> Result<(), Error> {
    let settings = Settings::from_path(&args.config)?;
    let location = Location::from_code(&args.location)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = settings.build_forecast_backend(clock.clone())?;
    if let Some(cache) = &backend.cache {
        cache.initialize([location.code()]).await?;
    }

    let now = clock.now();
    let deadline = CronSchedule::parse(&args.deadline_cron)?
        .next_after(now)
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "Deadline '{}' has no occurrence after {}",
                args.deadline_cron, now
            ))
        })?;

    let timeout = settings.forecast_timeout();
    let point = tokio::time::timeout(
        timeout,
        resolve_optimal_point(
            backend.source.as_ref(),
            location.code(),
            now,
            deadline,
            args.duration,
            now,
        ),
    )
    .await
    .map_err(|_| Error::Timeout(timeout))??;

    println!(
        "Best start for a {}-minute job in {} before {}: {} ({:.1} gCO2eq/kWh)",
        args.duration,
        location.display_name(),
        deadline,
        point.timestamp,
        point.intensity
    );
    Ok(())
}
