use super::{Driver, DriverError, SubmitRequest};
use crate::event::{Event, EventQueue};
use async_trait::async_trait;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::{mpsc::UnboundedSender, Notify},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, instrument, warn};

/// time a process gets to exit after SIGTERM before it is killed
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct LocalJob {
    kill: Arc<Notify>,
    handle: JoinHandle<()>,
}

type JobMap = Arc<Mutex<HashMap<usize, LocalJob>>>;

/// Driver running every realization as a child process of this one
#[derive(Debug)]
pub struct LocalDriver {
    events: EventQueue<Event>,
    jobs: JobMap,
    grace_period: Duration,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self {
            events: EventQueue::new(),
            jobs: Arc::default(),
            grace_period: KILL_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn event_queue(&self) -> &EventQueue<Event> {
        &self.events
    }

    #[instrument(skip_all, fields(iens = request.iens), level = "debug")]
    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError> {
        let iens = request.iens;
        let mut command = Command::new(&request.executable);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(runpath) = &request.runpath {
            command.current_dir(runpath);
        }

        let child = command.spawn().map_err(|error| DriverError::Submission {
            iens,
            reason: format!("failed to start {}: {error}", request.executable.display()),
        })?;
        debug!(pid = child.id(), "Started {}", request.executable.display());

        let kill = Arc::new(Notify::new());
        // the wait task removes its own entry, so it must not run before the insert
        let mut jobs = self.jobs.lock();
        let handle = tokio::spawn(wait_for_child(
            iens,
            child,
            Arc::clone(&kill),
            self.events.sender(),
            Arc::clone(&self.jobs),
            self.grace_period,
        ));
        jobs.insert(iens, LocalJob { kill, handle });

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        match self.jobs.lock().get(&iens) {
            Some(job) => job.kill.notify_one(),
            None => error!("Local kill failed due to missing process for realization {iens}"),
        }
    }

    async fn poll(&self) {
        // processes report through their wait tasks
        futures::future::pending::<()>().await
    }

    async fn finish(&self) {
        let jobs: Vec<LocalJob> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        if jobs.is_empty() {
            return;
        }

        info!("Terminating {} leftover local processes", jobs.len());
        for job in jobs.iter() {
            job.kill.notify_one();
        }
        for job in jobs {
            if let Err(error) = job.handle.await {
                warn!(error = ?error, "Local process supervisor did not shut down cleanly");
            }
        }
    }
}

async fn wait_for_child(
    iens: usize,
    mut child: Child,
    kill: Arc<Notify>,
    events: UnboundedSender<Event>,
    jobs: JobMap,
    grace_period: Duration,
) {
    let _ = events.send(Event::Started { iens });

    let (status, aborted) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill.notified() => (terminate(&mut child, grace_period).await, true),
    };

    jobs.lock().remove(&iens);

    let returncode = match status {
        Ok(status) => returncode(status),
        Err(error) => {
            error!(error = ?error, "Lost track of the process of realization {iens}");
            1
        }
    };
    debug!(returncode, aborted, "Realization {iens} process exited");

    let _ = events.send(Event::Finished {
        iens,
        returncode,
        aborted,
    });
}

/// SIGTERM, then SIGKILL once the grace period is over
async fn terminate(child: &mut Child, grace_period: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        if let Err(errno) = signal::kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {pid} failed: {errno}");
        }

        if let Ok(status) = timeout(grace_period, child.wait()).await {
            return status;
        }
        warn!("Process {pid} ignored SIGTERM for {grace_period:?}, killing it");
    }

    child.kill().await?;
    child.wait().await
}

fn returncode(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or_default())
}
