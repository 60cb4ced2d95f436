use clap::Parser;
use ensemble_scheduler::{
    config::SchedulerConfig,
    drivers,
    scheduler::{EnsembleOutcome, Scheduler},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// exit code of a run cancelled by an interrupt
const CANCELLED_EXIT_CODE: u8 = 130;

/// Run an ensemble of realizations on a local or cluster queue
#[derive(Parser, Debug)]
#[command(name = "ensemble-scheduler", version, about)]
struct Args {
    /// Path to the scheduler config (yaml)
    #[arg(short, long)]
    config: PathBuf,

    /// Stop once this many realizations succeeded, overrides the config
    #[arg(long)]
    min_required: Option<usize>,

    /// Only run the preflight checks on the config
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match SchedulerConfig::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load {}: {error}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        error!("Config contains errors, see above");
        return ExitCode::FAILURE;
    }
    if args.check {
        info!("Config passed all preflight checks");
        return ExitCode::SUCCESS;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_log();

    runtime.block_on(run(config, args.min_required))
}

async fn run(config: SchedulerConfig, min_required: Option<usize>) -> ExitCode {
    let realizations = config.ensemble.realizations();
    for realization in realizations.iter().filter(|realization| realization.active) {
        let runpath = &realization.run_arg.runpath;
        if let Err(error) = tokio::fs::create_dir_all(runpath).await {
            error!(error = ?error, "Failed to create runpath {}", runpath.display());
            return ExitCode::FAILURE;
        }
    }

    let driver = drivers::load(&config.queue);
    let mut scheduler = match Scheduler::new(driver, realizations, config.queue.options()) {
        Ok(scheduler) => scheduler,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(dispatch) = &config.dispatch {
        match dispatch.dispatch_info() {
            Ok(info) => scheduler = scheduler.with_dispatch_info(info),
            Err(error) => {
                error!(error = ?error, "{error}");
                return ExitCode::FAILURE;
            }
        }
        if let Err(error) = scheduler.add_dispatch_information_to_jobs_file() {
            error!(error = ?error, "{error}");
            return ExitCode::FAILURE;
        }
    }

    let scheduler = Arc::new(scheduler);

    if let Some(mut status_events) = scheduler.take_status_events() {
        tokio::spawn(async move {
            while let Some(event) = status_events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(event) => debug!(%event, "Status update"),
                    Err(error) => warn!(error = ?error, "Unserializable status update"),
                }
            }
        });
    }

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted, cancelling all jobs");
                    scheduler.cancel_all_jobs();
                }
                Err(error) => error!(error = ?error, "Unable to listen for interrupts"),
            }
        });
    }

    let min_required = min_required.or(config.min_required_realizations);
    match scheduler.execute(min_required).await {
        Ok(EnsembleOutcome::Stopped) => ExitCode::SUCCESS,
        Ok(EnsembleOutcome::Cancelled) => ExitCode::from(CANCELLED_EXIT_CODE),
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
