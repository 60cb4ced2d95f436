pub mod local;
pub mod lsf;
pub mod openpbs;
pub mod slurm;

use crate::{
    config::{QueueConfig, QueueSystem},
    event::{Event, EventQueue},
};
use async_trait::async_trait;
use itertools::Itertools;
use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt::Debug,
    future::Future,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{process::Command, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// default interval between two status queries against a remote backend
pub const POLL_PERIOD: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Submission of realization {iens} was rejected: {reason}")]
    Submission { iens: usize, reason: String },
    #[error("Backend status query failed: {0}")]
    PollTransient(String),
    #[error("Failed to kill realization {iens}: {reason}")]
    Kill { iens: usize, reason: String },
    #[error("Backend reported unknown job state {0:?}")]
    BackendStateUnknown(String),
    #[error("Failed to run backend command")]
    Spawn(#[from] io::Error),
}

/// Everything a backend needs to start one realization
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub iens: usize,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub name: String,
    pub runpath: Option<PathBuf>,
    pub num_cpu: u32,
}

/// Common interface of all compute backends.
///
/// Drivers translate backend specific job states into [`Event`]s which are put
/// on their [`EventQueue`], they never decide about retries or timeouts.
#[async_trait]
pub trait Driver: Debug + Send + Sync {
    fn event_queue(&self) -> &EventQueue<Event>;

    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError>;

    /// request termination, the resulting `Finished` is reported as usual
    async fn kill(&self, iens: usize);

    /// runs until cancelled
    async fn poll(&self);

    async fn finish(&self);
}

/// select and construct the driver configured for the queue
pub fn load(config: &QueueConfig) -> Arc<dyn Driver> {
    let queue_name = config.queue_name.clone();

    match config.system {
        QueueSystem::Local => Arc::new(local::LocalDriver::new()),
        QueueSystem::Lsf => Arc::new(lsf::LsfDriver::new(
            queue_name,
            config.lsf.clone().unwrap_or_default(),
        )),
        QueueSystem::OpenPbs => Arc::new(openpbs::OpenPbsDriver::new(
            queue_name,
            config.openpbs.clone().unwrap_or_default(),
        )),
        QueueSystem::Slurm => Arc::new(slurm::SlurmDriver::new(
            queue_name,
            config.slurm.clone().unwrap_or_default(),
        )),
    }
}

/// Closed set of states every backend vocabulary is reduced to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed { returncode: i32, aborted: bool },
}

/// Last known status of every job a remote driver submitted
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    jobs: HashMap<String, (usize, JobStatus)>,
    job_ids: HashMap<usize, String>,
}

impl JobRegistry {
    pub fn track(&mut self, iens: usize, job_id: String) {
        if let Some(previous) = self.job_ids.insert(iens, job_id.clone()) {
            debug!("Realization {iens} resubmitted, forgetting job {previous}");
            self.jobs.remove(&previous);
        }
        self.jobs.insert(job_id, (iens, JobStatus::Queued));
    }

    pub fn job_id(&self, iens: usize) -> Option<&str> {
        self.job_ids.get(&iens).map(String::as_str)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().sorted().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Record a polled status, returning the event the change amounts to.
    ///
    /// Terminal statuses make the registry forget the job. A started job stays
    /// started when suspended or requeued, so it never starts twice.
    pub fn transition(&mut self, job_id: &str, status: JobStatus) -> Option<Event> {
        let (iens, previous) = *self.jobs.get(job_id)?;
        if previous == status {
            return None;
        }

        match status {
            JobStatus::Queued if previous == JobStatus::Running => {
                debug!("Realization {iens} (job {job_id}) is back in the queue, still counted as running");
                None
            }
            JobStatus::Queued => {
                self.jobs.insert(job_id.to_owned(), (iens, status));
                None
            }
            JobStatus::Running => {
                self.jobs.insert(job_id.to_owned(), (iens, status));
                debug!("Realization {iens} (job {job_id}) is running");
                Some(Event::Started { iens })
            }
            JobStatus::Succeeded => {
                self.forget(iens, job_id);
                info!("Realization {iens} (job {job_id}) succeeded");
                Some(Event::Finished {
                    iens,
                    returncode: 0,
                    aborted: false,
                })
            }
            JobStatus::Failed {
                returncode,
                aborted,
            } => {
                self.forget(iens, job_id);
                info!(returncode, aborted, "Realization {iens} (job {job_id}) failed");
                Some(Event::Finished {
                    iens,
                    returncode,
                    aborted,
                })
            }
        }
    }

    fn forget(&mut self, iens: usize, job_id: &str) {
        self.jobs.remove(job_id);
        if self.job_ids.get(&iens).map(String::as_str) == Some(job_id) {
            self.job_ids.remove(&iens);
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// short reason for log lines and errors
    pub fn reason(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();

        match (self.code, stderr.is_empty()) {
            (Some(code), false) => format!("exit code {code}: {stderr}"),
            (Some(code), true) => format!("exit code {code}: {stdout}"),
            (None, _) => "terminated by signal".to_owned(),
        }
    }
}

/// run a backend command to completion and capture its output
pub(crate) async fn run_command<I, S>(program: &Path, args: I) -> Result<CommandOutput, DriverError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Persist the backend job id next to the realization.
///
/// The job is already accepted at this point, a failed write only gets logged.
pub(crate) async fn write_job_info(runpath: &Path, file_name: &str, job_id: &str) {
    let path = runpath.join(file_name);
    let content = serde_json::json!({ "job_id": job_id }).to_string();

    if let Err(error) = tokio::fs::write(&path, content).await {
        error!(error = ?error, "Failed to write job metadata to {}", path.display());
    }
}

/// Call `poll_once` every `period` forever, logging failed rounds
pub(crate) async fn poll_forever<F, Fut>(period: Duration, mut poll_once: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), DriverError>> + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        if let Err(error) = poll_once().await {
            warn!("Polling the backend failed, retrying in {period:?}: {error}");
        }
    }
}

/// executable followed by its arguments, as passed to backend submit commands
pub(crate) fn command_line(request: &SubmitRequest) -> Vec<String> {
    std::iter::once(request.executable.to_string_lossy().into_owned())
        .chain(request.args.iter().cloned())
        .collect()
}
