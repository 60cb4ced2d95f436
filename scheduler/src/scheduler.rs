mod job;

pub use job::{JobRuntime, JobState, KillReason};

use crate::{
    drivers::Driver,
    event::{EventQueue, RealizationEvent},
    realization::Realization,
};
use futures::{stream::FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver},
        watch, MutexGuard, Semaphore, SemaphorePermit,
    },
    time::{sleep_until, Instant},
};
use tracing::{debug, info, instrument, warn};

/// certificate of the ensemble evaluator, written into every runpath
pub const CERT_FILE: &str = ".ee.pem";
/// job manifest read by the job script
pub const JOBS_FILE: &str = "jobs.json";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfiguration(String),
    #[error("The driver events are already consumed by another run")]
    AlreadyExecuting,
    #[error("Failed to access {path}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Job manifest {path} is not a JSON object")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// How a call to [`Scheduler::execute`] ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnsembleOutcome {
    Stopped,
    Cancelled,
}

/// Run-wide halt signal, only ever raised
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Halt {
    Continue,
    StopLongRunning,
    Cancel,
}

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// 0 means no limit
    pub max_running: usize,
    pub max_submit: u32,
    /// minimum spacing between two submissions
    pub submit_sleep: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_running: 0,
            max_submit: 2,
            submit_sleep: Duration::ZERO,
        }
    }
}

/// Connection details of the ensemble evaluator, passed on to the jobs
#[derive(Clone, Debug, Default)]
pub struct DispatchInfo {
    pub ens_id: Option<String>,
    pub ee_uri: Option<String>,
    pub ee_token: Option<String>,
    /// certificate content, not a path
    pub ee_cert: Option<String>,
}

/// Runs an ensemble of realizations on a [`Driver`].
///
/// Each active realization gets a supervisor that submits it, follows the
/// driver events for its `iens` and retries failures up to `max_submit`.
#[derive(Debug)]
pub struct Scheduler {
    driver: Arc<dyn Driver>,
    realizations: Vec<Realization>,
    options: SchedulerOptions,
    dispatch: DispatchInfo,
    slots: Option<Semaphore>,
    last_submit: tokio::sync::Mutex<Option<Instant>>,
    halt: watch::Sender<Halt>,
    states: Mutex<BTreeMap<usize, JobRuntime>>,
    running: AtomicUsize,
    status_events: EventQueue<RealizationEvent>,
}

impl Scheduler {
    pub fn new(
        driver: Arc<dyn Driver>,
        realizations: Vec<Realization>,
        options: SchedulerOptions,
    ) -> Result<Self, SchedulerError> {
        if options.max_submit == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "max_submit must be at least 1".to_owned(),
            ));
        }

        let slots = (options.max_running > 0).then(|| Semaphore::new(options.max_running));
        let (halt, _) = watch::channel(Halt::Continue);

        Ok(Self {
            driver,
            realizations,
            options,
            dispatch: DispatchInfo::default(),
            slots,
            last_submit: tokio::sync::Mutex::new(None),
            halt,
            states: Mutex::default(),
            running: AtomicUsize::new(0),
            status_events: EventQueue::new(),
        })
    }

    pub fn with_dispatch_info(mut self, dispatch: DispatchInfo) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn realizations(&self) -> &[Realization] {
        &self.realizations
    }

    /// Run every active realization to a terminal state.
    ///
    /// With `min_required_realizations` set (and nonzero) the run stops early
    /// once that many realizations succeeded, killing the rest.
    #[instrument(skip(self), level = "info")]
    pub async fn execute(
        &self,
        min_required_realizations: Option<usize>,
    ) -> Result<EnsembleOutcome, SchedulerError> {
        let mut driver_events = self
            .driver
            .event_queue()
            .take_receiver()
            .ok_or(SchedulerError::AlreadyExecuting)?;

        let poller = {
            let driver = Arc::clone(&self.driver);
            tokio::spawn(async move { driver.poll().await })
        };

        let mut routes = HashMap::new();
        let mut jobs = FuturesUnordered::new();
        for realization in self.realizations.iter().filter(|realization| realization.active) {
            let (sender, receiver) = unbounded_channel();
            routes.insert(realization.iens, sender);
            self.update_runtime(realization.iens, &JobRuntime::default());
            jobs.push(self.run_job(realization, receiver, self.halt.subscribe()));
        }
        info!("Running {} realizations", jobs.len());

        let min_required = min_required_realizations.filter(|required| *required > 0);
        let mut succeeded = 0;
        loop {
            tokio::select! {
                finished = jobs.next() => match finished {
                    Some((iens, state)) => {
                        routes.remove(&iens);
                        if state != JobState::Succeeded {
                            continue;
                        }
                        succeeded += 1;
                        if min_required.is_some_and(|required| succeeded >= required)
                            && self.raise_halt(Halt::StopLongRunning)
                        {
                            info!("{succeeded} realizations succeeded, stopping long running jobs");
                        }
                    }
                    None => break,
                },
                Some(event) = driver_events.recv() => match routes.get(&event.iens()) {
                    Some(route) => {
                        let _ = route.send(event);
                    }
                    None => debug!(?event, "Dropping event of a realization without supervisor"),
                },
            }
        }

        poller.abort();
        self.driver.finish().await;
        self.driver.event_queue().restore_receiver(driver_events);

        let outcome = match *self.halt.borrow() {
            Halt::Cancel => EnsembleOutcome::Cancelled,
            Halt::Continue | Halt::StopLongRunning => EnsembleOutcome::Stopped,
        };
        info!(?outcome, succeeded, "Ensemble run finished");

        Ok(outcome)
    }

    /// Kill everything that is submitted or running and submit nothing else.
    ///
    /// `execute` returns `Cancelled` once all realizations terminated.
    pub fn cancel_all_jobs(&self) {
        if self.raise_halt(Halt::Cancel) {
            warn!("Cancelling all jobs");
        }
    }

    pub fn kill_all_jobs(&self) {
        self.cancel_all_jobs()
    }

    /// true while at least one realization has started and not yet finished
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    pub fn runtime_state(&self, iens: usize) -> Option<JobRuntime> {
        self.states.lock().get(&iens).cloned()
    }

    /// state changes of all realizations, None if already taken
    pub fn take_status_events(&self) -> Option<UnboundedReceiver<RealizationEvent>> {
        self.status_events.take_receiver()
    }

    /// Write the evaluator connection into every active realization's job manifest
    pub fn add_dispatch_information_to_jobs_file(&self) -> Result<(), SchedulerError> {
        for realization in self.realizations.iter().filter(|realization| realization.active) {
            let runpath = &realization.run_arg.runpath;

            let cert_path = match &self.dispatch.ee_cert {
                Some(cert) => {
                    let path = runpath.join(CERT_FILE);
                    fs::write(&path, cert).map_err(|source| SchedulerError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    Some(path)
                }
                None => None,
            };

            let path = runpath.join(JOBS_FILE);
            let content = fs::read_to_string(&path).map_err(|source| SchedulerError::Io {
                path: path.clone(),
                source,
            })?;
            let mut manifest: Map<String, Value> =
                serde_json::from_str(&content).map_err(|source| SchedulerError::Manifest {
                    path: path.clone(),
                    source,
                })?;

            manifest.insert("ens_id".to_owned(), self.dispatch.ens_id.clone().into());
            manifest.insert("real_id".to_owned(), realization.iens.into());
            manifest.insert("dispatch_url".to_owned(), self.dispatch.ee_uri.clone().into());
            manifest.insert("ee_token".to_owned(), self.dispatch.ee_token.clone().into());
            manifest.insert(
                "ee_cert_path".to_owned(),
                cert_path
                    .map(|path| path.to_string_lossy().into_owned())
                    .into(),
            );

            let content = serde_json::to_string_pretty(&manifest).map_err(|source| {
                SchedulerError::Manifest {
                    path: path.clone(),
                    source,
                }
            })?;
            fs::write(&path, content).map_err(|source| SchedulerError::Io {
                path: path.clone(),
                source,
            })?;
            debug!("Added dispatch information to {}", path.display());
        }

        Ok(())
    }

    /// returns whether the signal actually changed
    fn raise_halt(&self, halt: Halt) -> bool {
        self.halt.send_if_modified(|current| {
            if halt > *current {
                *current = halt;
                true
            } else {
                false
            }
        })
    }

    async fn acquire_slot(&self) -> Option<SemaphorePermit<'_>> {
        match &self.slots {
            Some(slots) => slots.acquire().await.ok(),
            None => None,
        }
    }

    /// Wait until `submit_sleep` passed since the previous submission.
    ///
    /// The returned guard keeps other submitters out until the caller records
    /// its own submission time, or drops it without submitting.
    async fn submit_turn(&self) -> Option<MutexGuard<'_, Option<Instant>>> {
        if self.options.submit_sleep.is_zero() {
            return None;
        }

        let last_submit = self.last_submit.lock().await;
        if let Some(last) = *last_submit {
            sleep_until(last + self.options.submit_sleep).await;
        }
        Some(last_submit)
    }

    fn update_runtime(&self, iens: usize, runtime: &JobRuntime) {
        let previous = self.states.lock().insert(iens, runtime.clone());

        let was_live = previous.as_ref().is_some_and(JobRuntime::is_live);
        let is_live = runtime.is_live();
        if is_live && !was_live {
            self.running.fetch_add(1, Ordering::SeqCst);
        } else if was_live && !is_live {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }

        if previous.map(|previous| previous.state) != Some(runtime.state) {
            self.status_events.put(RealizationEvent {
                ensemble_id: self.dispatch.ens_id.clone(),
                iens,
                state: runtime.state,
                attempt: runtime.attempts,
            });
        }
    }
}
