use super::{
    command_line, poll_forever, run_command, write_job_info, Driver, DriverError, JobRegistry,
    JobStatus, SubmitRequest, POLL_PERIOD,
};
use crate::event::{Event, EventQueue};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};
use tracing::{debug, error, info, instrument, warn};

pub const LSF_INFO_JSON_FILENAME: &str = "lsf_info.json";

static BSUB_JOB_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Job <([0-9]+)> is submitted to .+ queue").expect("bsub pattern is valid")
});

/// Site specific overrides for the LSF commands
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct LsfOptions {
    pub bsub_cmd: Option<PathBuf>,
    pub bjobs_cmd: Option<PathBuf>,
    pub bkill_cmd: Option<PathBuf>,
}

impl LsfOptions {
    pub fn commands(&self) -> Vec<(&'static str, &PathBuf)> {
        [
            ("bsub_cmd", &self.bsub_cmd),
            ("bjobs_cmd", &self.bjobs_cmd),
            ("bkill_cmd", &self.bkill_cmd),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.as_ref().map(|path| (name, path)))
        .collect()
    }
}

/// Job states as printed in the STAT column of bjobs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LsfState {
    Pend,
    Run,
    Done,
    Exit,
    Zombi,
    Pdone,
    Ssusp,
    Ususp,
    Psusp,
    Unkwn,
}

impl FromStr for LsfState {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PEND" => Ok(Self::Pend),
            "RUN" => Ok(Self::Run),
            "DONE" => Ok(Self::Done),
            "EXIT" => Ok(Self::Exit),
            "ZOMBI" => Ok(Self::Zombi),
            "PDONE" => Ok(Self::Pdone),
            "SSUSP" => Ok(Self::Ssusp),
            "USUSP" => Ok(Self::Ususp),
            "PSUSP" => Ok(Self::Psusp),
            "UNKWN" => Ok(Self::Unkwn),
            other => Err(DriverError::BackendStateUnknown(other.to_owned())),
        }
    }
}

impl LsfState {
    /// None for states that do not change what the scheduler knows
    pub fn status(self) -> Option<JobStatus> {
        match self {
            Self::Pend => Some(JobStatus::Queued),
            Self::Run => Some(JobStatus::Running),
            Self::Done => Some(JobStatus::Succeeded),
            Self::Exit => Some(JobStatus::Failed {
                returncode: 1,
                aborted: true,
            }),
            Self::Zombi | Self::Pdone | Self::Ssusp | Self::Ususp | Self::Psusp | Self::Unkwn => {
                None
            }
        }
    }
}

/// job id from the output of bsub
pub fn parse_bsub(stdout: &str) -> Option<String> {
    BSUB_JOB_ID
        .captures(stdout)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_owned())
}

/// Parse the table printed by bjobs.
///
/// Only lines starting with a job id are considered, unknown states are logged
/// and skipped.
pub fn parse_bjobs(stdout: &str) -> BTreeMap<String, LsfState> {
    let mut states = BTreeMap::new();

    for line in stdout.lines() {
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [job_id, _user, state, ..] = tokens.as_slice() else {
            debug!("Skipping short bjobs line {line:?}");
            continue;
        };

        match state.parse::<LsfState>() {
            Ok(state) => {
                states.insert((*job_id).to_owned(), state);
            }
            Err(error) => error!("Ignoring job {job_id}: {error}"),
        }
    }

    states
}

/// Driver for IBM Spectrum LSF
#[derive(Debug)]
pub struct LsfDriver {
    events: EventQueue<Event>,
    queue_name: Option<String>,
    bsub_cmd: PathBuf,
    bjobs_cmd: PathBuf,
    bkill_cmd: PathBuf,
    jobs: Mutex<JobRegistry>,
    poll_period: Duration,
}

impl LsfDriver {
    pub fn new(queue_name: Option<String>, options: LsfOptions) -> Self {
        Self {
            events: EventQueue::new(),
            queue_name,
            bsub_cmd: options.bsub_cmd.unwrap_or_else(|| "bsub".into()),
            bjobs_cmd: options.bjobs_cmd.unwrap_or_else(|| "bjobs".into()),
            bkill_cmd: options.bkill_cmd.unwrap_or_else(|| "bkill".into()),
            jobs: Mutex::default(),
            poll_period: POLL_PERIOD,
        }
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    fn submit_args(&self, request: &SubmitRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(queue_name) = &self.queue_name {
            args.extend(["-q".to_owned(), queue_name.clone()]);
        }
        if request.num_cpu > 1 {
            args.extend(["-n".to_owned(), request.num_cpu.to_string()]);
        }
        args.extend(["-J".to_owned(), request.name.clone()]);
        args.extend(command_line(request));
        args
    }

    async fn poll_once(&self) -> Result<(), DriverError> {
        let job_ids = self.jobs.lock().job_ids();
        if job_ids.is_empty() {
            return Ok(());
        }

        let output = run_command(&self.bjobs_cmd, &job_ids).await?;
        if !output.success() {
            // bjobs fails as soon as one id is unknown but still reports the others
            warn!("bjobs gave {}", output.reason());
        }

        let states = parse_bjobs(&output.stdout);
        let events: Vec<Event> = {
            let mut jobs = self.jobs.lock();
            job_ids
                .iter()
                .filter_map(|job_id| match states.get(job_id) {
                    Some(state) => state
                        .status()
                        .and_then(|status| jobs.transition(job_id, status)),
                    None => {
                        warn!("bjobs did not give status for job_id {job_id}");
                        None
                    }
                })
                .collect()
        };

        for event in events {
            self.events.put(event);
        }

        Ok(())
    }

    async fn kill_job(&self, iens: usize, job_id: &str) -> Result<(), DriverError> {
        let output = run_command(&self.bkill_cmd, [job_id]).await?;
        if !output.success() {
            return Err(DriverError::Kill {
                iens,
                reason: output.reason(),
            });
        }

        if !output
            .stdout
            .contains(&format!("Job <{job_id}> is being terminated"))
        {
            return Err(DriverError::Kill {
                iens,
                reason: format!("unexpected bkill output {:?}", output.stdout.trim()),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Driver for LsfDriver {
    fn event_queue(&self) -> &EventQueue<Event> {
        &self.events
    }

    #[instrument(skip_all, fields(iens = request.iens), level = "debug")]
    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError> {
        let iens = request.iens;
        let args = self.submit_args(&request);
        debug!("Submitting to LSF with command {:?} {args:?}", self.bsub_cmd);

        let output = run_command(&self.bsub_cmd, &args)
            .await
            .map_err(|error| DriverError::Submission {
                iens,
                reason: error.to_string(),
            })?;

        if !output.success() {
            return Err(DriverError::Submission {
                iens,
                reason: output.reason(),
            });
        }

        let job_id = parse_bsub(&output.stdout).ok_or_else(|| DriverError::Submission {
            iens,
            reason: format!("could not understand {:?} from bsub", output.stdout.trim()),
        })?;
        info!("Realization {iens} accepted by LSF, got id {job_id}");

        if let Some(runpath) = &request.runpath {
            write_job_info(runpath, LSF_INFO_JSON_FILENAME, &job_id).await;
        }
        self.jobs.lock().track(iens, job_id);

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        let Some(job_id) = self.jobs.lock().job_id(iens).map(str::to_owned) else {
            error!("LSF kill failed due to missing jobid for realization {iens}");
            return;
        };

        debug!("Killing realization {iens} with LSF id {job_id}");
        if let Err(error) = self.kill_job(iens, &job_id).await {
            error!("{error}");
        }
    }

    async fn poll(&self) {
        poll_forever(self.poll_period, || self.poll_once()).await
    }

    async fn finish(&self) {
        debug!("LSF driver done, {} jobs still tracked", self.jobs.lock().job_ids().len());
    }
}
