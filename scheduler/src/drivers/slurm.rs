use super::{
    command_line, poll_forever, run_command, write_job_info, Driver, DriverError, JobRegistry,
    JobStatus, SubmitRequest, POLL_PERIOD,
};
use crate::event::{Event, EventQueue};
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, collections::BTreeMap, path::PathBuf, time::Duration};
use tracing::{debug, error, info, instrument, warn};

pub const SLURM_INFO_JSON_FILENAME: &str = "slurm_info.json";

const QUEUED: &[&str] = &["PENDING", "CONFIGURING", "REQUEUED", "RESIZING", "SUSPENDED"];
const RUNNING: &[&str] = &["RUNNING", "COMPLETING", "STAGE_OUT"];
const FAILED: &[&str] = &["FAILED", "OUT_OF_MEMORY"];
const ABORTED: &[&str] = &[
    "CANCELLED",
    "TIMEOUT",
    "PREEMPTED",
    "NODE_FAIL",
    "BOOT_FAIL",
    "DEADLINE",
];

/// Site specific overrides for the Slurm commands
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SlurmOptions {
    pub sbatch_cmd: Option<PathBuf>,
    pub squeue_cmd: Option<PathBuf>,
    pub scontrol_cmd: Option<PathBuf>,
    pub scancel_cmd: Option<PathBuf>,
}

impl SlurmOptions {
    pub fn commands(&self) -> Vec<(&'static str, &PathBuf)> {
        [
            ("sbatch_cmd", &self.sbatch_cmd),
            ("squeue_cmd", &self.squeue_cmd),
            ("scontrol_cmd", &self.scontrol_cmd),
            ("scancel_cmd", &self.scancel_cmd),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.as_ref().map(|path| (name, path)))
        .collect()
    }
}

fn nonzero(exit_code: Option<i32>) -> i32 {
    match exit_code {
        Some(code) if code != 0 => code,
        _ => 1,
    }
}

/// Map a Slurm job state, None for states without a scheduler counterpart
pub fn slurm_status(state: &str, exit_code: Option<i32>) -> Result<Option<JobStatus>, DriverError> {
    // squeue may append a reason, e.g. "CANCELLED by 1000"
    let state = state.split_whitespace().next().unwrap_or_default();

    let status = if QUEUED.contains(&state) {
        JobStatus::Queued
    } else if RUNNING.contains(&state) {
        JobStatus::Running
    } else if state == "COMPLETED" {
        match exit_code {
            Some(0) | None => JobStatus::Succeeded,
            Some(returncode) => JobStatus::Failed {
                returncode,
                aborted: false,
            },
        }
    } else if FAILED.contains(&state) {
        JobStatus::Failed {
            returncode: nonzero(exit_code),
            aborted: false,
        }
    } else if ABORTED.contains(&state) {
        JobStatus::Failed {
            returncode: nonzero(exit_code),
            aborted: true,
        }
    } else if state == "SPECIAL_EXIT" || state == "REVOKED" {
        return Ok(None);
    } else {
        return Err(DriverError::BackendStateUnknown(state.to_owned()));
    };

    Ok(Some(status))
}

fn is_terminal(state: &str) -> bool {
    let state = state.split_whitespace().next().unwrap_or_default();
    !QUEUED.contains(&state) && !RUNNING.contains(&state)
}

/// job id from `sbatch --parsable`, which prints `id` or `id;cluster`
pub fn parse_sbatch(stdout: &str) -> Option<String> {
    let job_id = stdout.lines().next()?.split(';').next()?.trim();

    (!job_id.is_empty() && job_id.chars().all(|c| c.is_ascii_digit() || c == '_'))
        .then(|| job_id.to_owned())
}

/// job id to state from `squeue --noheader --format="%i %T"`
pub fn parse_squeue(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once(char::is_whitespace))
        .map(|(job_id, state)| (job_id.to_owned(), state.trim().to_owned()))
        .collect()
}

/// State and exit code from `scontrol show job`.
///
/// `ExitCode=rc:signal`, a signal death is reported as 128 + signal.
pub fn parse_scontrol(stdout: &str) -> Option<(String, Option<i32>)> {
    let mut state = None;
    let mut exit_code = None;

    for token in stdout.split_whitespace() {
        if let Some(value) = token.strip_prefix("JobState=") {
            state = Some(value.to_owned());
        } else if let Some(value) = token.strip_prefix("ExitCode=") {
            exit_code = value.split_once(':').and_then(|(code, signal)| {
                let code = code.parse::<i32>().ok()?;
                match signal.parse::<i32>().ok()? {
                    0 => Some(code),
                    signal => signal.checked_add(128),
                }
            });
        }
    }

    state.map(|state| (state, exit_code))
}

/// quote a word for the `sh -c` that `sbatch --wrap` runs
fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));

    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Driver for the Slurm workload manager
#[derive(Debug)]
pub struct SlurmDriver {
    events: EventQueue<Event>,
    partition: Option<String>,
    sbatch_cmd: PathBuf,
    squeue_cmd: PathBuf,
    scontrol_cmd: PathBuf,
    scancel_cmd: PathBuf,
    jobs: Mutex<JobRegistry>,
    poll_period: Duration,
}

impl SlurmDriver {
    pub fn new(partition: Option<String>, options: SlurmOptions) -> Self {
        Self {
            events: EventQueue::new(),
            partition,
            sbatch_cmd: options.sbatch_cmd.unwrap_or_else(|| "sbatch".into()),
            squeue_cmd: options.squeue_cmd.unwrap_or_else(|| "squeue".into()),
            scontrol_cmd: options.scontrol_cmd.unwrap_or_else(|| "scontrol".into()),
            scancel_cmd: options.scancel_cmd.unwrap_or_else(|| "scancel".into()),
            jobs: Mutex::default(),
            poll_period: POLL_PERIOD,
        }
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    fn submit_args(&self, request: &SubmitRequest) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_owned(),
            format!("--job-name={}", request.name),
        ];
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }
        args.push(format!("--ntasks={}", request.num_cpu));
        if let Some(runpath) = &request.runpath {
            args.push(format!("--chdir={}", runpath.display()));
        }

        let wrapped = command_line(request)
            .iter()
            .map(|word| shell_quote(word))
            .join(" ");
        args.extend(["--wrap".to_owned(), wrapped]);
        args
    }

    /// ask scontrol about a job squeue no longer (or finally) knows
    async fn scontrol_status(&self, job_id: &str) -> Result<Option<JobStatus>, DriverError> {
        let output = run_command(&self.scontrol_cmd, ["show", "job", job_id]).await?;
        if !output.success() {
            return Err(DriverError::PollTransient(format!(
                "scontrol for job {job_id} gave {}",
                output.reason()
            )));
        }

        match parse_scontrol(&output.stdout) {
            Some((state, exit_code)) => slurm_status(&state, exit_code),
            None => Err(DriverError::PollTransient(format!(
                "scontrol did not give a JobState for job {job_id}"
            ))),
        }
    }

    async fn poll_once(&self) -> Result<(), DriverError> {
        let job_ids = self.jobs.lock().job_ids();
        if job_ids.is_empty() {
            return Ok(());
        }

        let output = run_command(
            &self.squeue_cmd,
            [
                "--noheader".to_owned(),
                "--format=%i %T".to_owned(),
                format!("--jobs={}", job_ids.join(",")),
            ],
        )
        .await?;
        if !output.success() {
            // squeue rejects the whole query once one id was purged, scontrol covers those
            warn!("squeue gave {}", output.reason());
        }
        let reported = parse_squeue(&output.stdout);

        let mut statuses = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let status = match reported.get(&job_id) {
                Some(state) if !is_terminal(state) => slurm_status(state, None),
                _ => self.scontrol_status(&job_id).await,
            };

            match status {
                Ok(Some(status)) => statuses.push((job_id, status)),
                Ok(None) => {}
                Err(error) => warn!("No status for job_id {job_id}: {error}"),
            }
        }

        let events: Vec<Event> = {
            let mut jobs = self.jobs.lock();
            statuses
                .iter()
                .filter_map(|(job_id, status)| jobs.transition(job_id, *status))
                .collect()
        };

        for event in events {
            self.events.put(event);
        }

        Ok(())
    }

    async fn kill_job(&self, iens: usize, job_id: &str) -> Result<(), DriverError> {
        let output = run_command(&self.scancel_cmd, [job_id]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(DriverError::Kill {
                iens,
                reason: output.reason(),
            })
        }
    }
}

#[async_trait]
impl Driver for SlurmDriver {
    fn event_queue(&self) -> &EventQueue<Event> {
        &self.events
    }

    #[instrument(skip_all, fields(iens = request.iens), level = "debug")]
    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError> {
        let iens = request.iens;
        let args = self.submit_args(&request);
        debug!("Submitting to Slurm with command {:?} {args:?}", self.sbatch_cmd);

        let output = run_command(&self.sbatch_cmd, &args)
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

        let job_id = parse_sbatch(&output.stdout).ok_or_else(|| DriverError::Submission {
            iens,
            reason: format!("could not understand {:?} from sbatch", output.stdout.trim()),
        })?;
        info!("Realization {iens} accepted by Slurm, got id {job_id}");

        if let Some(runpath) = &request.runpath {
            write_job_info(runpath, SLURM_INFO_JSON_FILENAME, &job_id).await;
        }
        self.jobs.lock().track(iens, job_id);

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        let Some(job_id) = self.jobs.lock().job_id(iens).map(str::to_owned) else {
            error!("Slurm kill failed due to missing jobid for realization {iens}");
            return;
        };

        debug!("Killing realization {iens} with Slurm id {job_id}");
        if let Err(error) = self.kill_job(iens, &job_id).await {
            error!("{error}");
        }
    }

    async fn poll(&self) {
        poll_forever(self.poll_period, || self.poll_once()).await
    }

    async fn finish(&self) {
        debug!("Slurm driver done, {} jobs still tracked", self.jobs.lock().job_ids().len());
    }
}
