use super::{
    command_line, poll_forever, run_command, write_job_info, Driver, DriverError, JobRegistry,
    JobStatus, SubmitRequest, POLL_PERIOD,
};
use crate::event::{Event, EventQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use tracing::{debug, error, info, instrument, warn};

pub const PBS_INFO_JSON_FILENAME: &str = "pbs_info.json";

/// Site specific overrides for the PBS commands
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct OpenPbsOptions {
    pub qsub_cmd: Option<PathBuf>,
    pub qstat_cmd: Option<PathBuf>,
    pub qdel_cmd: Option<PathBuf>,
}

impl OpenPbsOptions {
    pub fn commands(&self) -> Vec<(&'static str, &PathBuf)> {
        [
            ("qsub_cmd", &self.qsub_cmd),
            ("qstat_cmd", &self.qstat_cmd),
            ("qdel_cmd", &self.qdel_cmd),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.as_ref().map(|path| (name, path)))
        .collect()
    }
}

#[derive(Deserialize, Debug)]
struct QstatReport {
    #[serde(rename = "Jobs", default)]
    jobs: BTreeMap<String, QstatJob>,
}

#[derive(Deserialize, Debug)]
struct QstatJob {
    job_state: String,
    #[serde(rename = "Exit_status", default)]
    exit_status: Option<i32>,
}

/// Map a PBS job_state letter, None for states without a scheduler counterpart
pub fn pbs_status(job_state: &str, exit_status: Option<i32>) -> Result<Option<JobStatus>, DriverError> {
    let status = match job_state {
        "Q" | "H" | "W" | "T" => Some(JobStatus::Queued),
        "R" | "E" => Some(JobStatus::Running),
        "F" => Some(match exit_status {
            Some(0) => JobStatus::Succeeded,
            Some(returncode) => JobStatus::Failed {
                returncode,
                // PBS reports signal deaths as 256 + signal
                aborted: returncode >= 256,
            },
            // deleted before it ever ran
            None => JobStatus::Failed {
                returncode: 1,
                aborted: true,
            },
        }),
        "B" | "M" | "S" | "U" | "X" => None,
        other => return Err(DriverError::BackendStateUnknown(other.to_owned())),
    };

    Ok(status)
}

/// Parse `qstat -f -x -F json`, skipping jobs in unknown states
pub fn parse_qstat_json(stdout: &str) -> Result<BTreeMap<String, JobStatus>, DriverError> {
    if stdout.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let report: QstatReport = serde_json::from_str(stdout)
        .map_err(|error| DriverError::PollTransient(format!("unreadable qstat output: {error}")))?;

    let mut statuses = BTreeMap::new();
    for (job_id, job) in report.jobs {
        match pbs_status(&job.job_state, job.exit_status) {
            Ok(Some(status)) => {
                statuses.insert(job_id, status);
            }
            Ok(None) => {}
            Err(error) => error!("Ignoring job {job_id}: {error}"),
        }
    }

    Ok(statuses)
}

/// Driver for OpenPBS and compatible PBS flavours
#[derive(Debug)]
pub struct OpenPbsDriver {
    events: EventQueue<Event>,
    queue_name: Option<String>,
    qsub_cmd: PathBuf,
    qstat_cmd: PathBuf,
    qdel_cmd: PathBuf,
    jobs: Mutex<JobRegistry>,
    poll_period: Duration,
}

impl OpenPbsDriver {
    pub fn new(queue_name: Option<String>, options: OpenPbsOptions) -> Self {
        Self {
            events: EventQueue::new(),
            queue_name,
            qsub_cmd: options.qsub_cmd.unwrap_or_else(|| "qsub".into()),
            qstat_cmd: options.qstat_cmd.unwrap_or_else(|| "qstat".into()),
            qdel_cmd: options.qdel_cmd.unwrap_or_else(|| "qdel".into()),
            jobs: Mutex::default(),
            poll_period: POLL_PERIOD,
        }
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    fn submit_args(&self, request: &SubmitRequest) -> Vec<String> {
        let mut args = vec!["-N".to_owned(), request.name.clone()];
        if let Some(queue_name) = &self.queue_name {
            args.extend(["-q".to_owned(), queue_name.clone()]);
        }
        args.extend([
            "-l".to_owned(),
            format!("select=1:ncpus={}", request.num_cpu),
            "--".to_owned(),
        ]);
        args.extend(command_line(request));
        args
    }

    async fn poll_once(&self) -> Result<(), DriverError> {
        let job_ids = self.jobs.lock().job_ids();
        if job_ids.is_empty() {
            return Ok(());
        }

        let output = run_command(
            &self.qstat_cmd,
            ["-f", "-x", "-F", "json"]
                .into_iter()
                .map(str::to_owned)
                .chain(job_ids.iter().cloned()),
        )
        .await?;
        if !output.success() {
            warn!("qstat gave {}", output.reason());
        }

        let statuses = parse_qstat_json(&output.stdout)?;
        let events: Vec<Event> = {
            let mut jobs = self.jobs.lock();
            job_ids
                .iter()
                .filter_map(|job_id| match statuses.get(job_id) {
                    Some(status) => jobs.transition(job_id, *status),
                    None => {
                        warn!("qstat did not give status for job_id {job_id}");
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
        let output = run_command(&self.qdel_cmd, [job_id]).await?;
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
impl Driver for OpenPbsDriver {
    fn event_queue(&self) -> &EventQueue<Event> {
        &self.events
    }

    #[instrument(skip_all, fields(iens = request.iens), level = "debug")]
    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError> {
        let iens = request.iens;
        let args = self.submit_args(&request);
        debug!("Submitting to PBS with command {:?} {args:?}", self.qsub_cmd);

        let output = run_command(&self.qsub_cmd, &args)
            .await
            .map_err(|error| DriverError::Submission {
                iens,
                reason: error.to_string(),
            })?;

        let job_id = output.stdout.trim();
        if !output.success() || job_id.is_empty() {
            return Err(DriverError::Submission {
                iens,
                reason: output.reason(),
            });
        }
        info!("Realization {iens} accepted by PBS, got id {job_id}");

        if let Some(runpath) = &request.runpath {
            write_job_info(runpath, PBS_INFO_JSON_FILENAME, job_id).await;
        }
        self.jobs.lock().track(iens, job_id.to_owned());

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        let Some(job_id) = self.jobs.lock().job_id(iens).map(str::to_owned) else {
            error!("PBS kill failed due to missing jobid for realization {iens}");
            return;
        };

        debug!("Killing realization {iens} with PBS id {job_id}");
        if let Err(error) = self.kill_job(iens, &job_id).await {
            error!("{error}");
        }
    }

    async fn poll(&self) {
        poll_forever(self.poll_period, || self.poll_once()).await
    }

    async fn finish(&self) {
        debug!("PBS driver done, {} jobs still tracked", self.jobs.lock().job_ids().len());
    }
}
