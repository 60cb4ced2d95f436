use super::{Halt, Scheduler};
use crate::{event::Event, realization::Realization};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Killed,
}

/// Why the scheduler asked the driver to kill a realization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    StopLongRunning,
    Cancel,
}

/// Mutable bookkeeping of one realization, owned by its supervisor
#[derive(Clone, Debug)]
pub struct JobRuntime {
    pub state: JobState,
    /// submit attempts so far, including failed submissions
    pub attempts: u32,
    pub started_at: Option<Instant>,
    pub kill_requested_at: Option<Instant>,
    pub kill_reason: Option<KillReason>,
    /// end of the current attempt, whatever its outcome
    pub finished_at: Option<Instant>,
}

impl Default for JobRuntime {
    fn default() -> Self {
        Self {
            state: JobState::Waiting,
            attempts: 0,
            started_at: None,
            kill_requested_at: None,
            kill_reason: None,
            finished_at: None,
        }
    }
}

impl JobRuntime {
    /// started and not yet finished, a timed out job counts until its kill lands
    pub fn is_live(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }

    /// Tag a kill, returns whether the driver still has to be asked.
    ///
    /// Cancel overrides any earlier reason but never causes a second kill.
    pub(crate) fn request_kill(&mut self, reason: KillReason) -> bool {
        match self.kill_reason {
            None => {
                self.kill_reason = Some(reason);
                self.kill_requested_at = Some(Instant::now());
                true
            }
            Some(KillReason::Cancel) => false,
            Some(_) => {
                if reason == KillReason::Cancel {
                    self.kill_reason = Some(reason);
                }
                false
            }
        }
    }

    /// final state of the current attempt once the driver reported `Finished`
    pub(crate) fn classify(&self, returncode: i32, aborted: bool) -> JobState {
        match self.kill_reason {
            Some(KillReason::Timeout) => JobState::TimedOut,
            Some(KillReason::StopLongRunning | KillReason::Cancel) => JobState::Killed,
            None if returncode == 0 && !aborted => JobState::Succeeded,
            None => JobState::Failed,
        }
    }

    fn reset_attempt(&mut self) {
        self.state = JobState::Waiting;
        self.started_at = None;
        self.kill_requested_at = None;
        self.kill_reason = None;
        self.finished_at = None;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

async fn halted(halt: &mut watch::Receiver<Halt>) {
    loop {
        if *halt.borrow_and_update() != Halt::Continue {
            return;
        }
        if halt.changed().await.is_err() {
            return;
        }
    }
}

impl Scheduler {
    /// Drive one realization through all its attempts, returning its final state
    pub(super) async fn run_job(
        &self,
        realization: &Realization,
        mut events: UnboundedReceiver<Event>,
        mut halt: watch::Receiver<Halt>,
    ) -> (usize, JobState) {
        let iens = realization.iens;
        let max_submit = self.options.max_submit;
        let mut runtime = JobRuntime::default();

        loop {
            match self
                .run_attempt(realization, &mut runtime, &mut events, &mut halt)
                .await
            {
                JobState::Failed if runtime.attempts < max_submit => {
                    warn!(
                        "Realization {iens} failed, resubmitting ({}/{max_submit} attempts used)",
                        runtime.attempts
                    );
                    runtime.reset_attempt();
                    self.update_runtime(iens, &runtime);
                }
                JobState::Failed => {
                    error!("Realization {iens} failed after reaching max submit ({max_submit})");
                    return (iens, JobState::Failed);
                }
                state => return (iens, state),
            }
        }
    }

    async fn run_attempt(
        &self,
        realization: &Realization,
        runtime: &mut JobRuntime,
        events: &mut UnboundedReceiver<Event>,
        halt: &mut watch::Receiver<Halt>,
    ) -> JobState {
        let iens = realization.iens;

        let _slot = tokio::select! {
            biased;
            _ = halted(halt) => return self.end_attempt(iens, runtime, JobState::Killed),
            slot = self.acquire_slot() => slot,
        };
        let turn = tokio::select! {
            biased;
            _ = halted(halt) => return self.end_attempt(iens, runtime, JobState::Killed),
            turn = self.submit_turn() => turn,
        };

        let current = *halt.borrow_and_update();
        if current != Halt::Continue {
            return self.end_attempt(iens, runtime, JobState::Killed);
        }
        if let Some(mut last_submit) = turn {
            *last_submit = Some(Instant::now());
        }

        runtime.attempts += 1;
        if let Err(error) = self.driver.submit(realization.submit_request()).await {
            error!("Failed to submit realization {iens}: {error}");
            return self.end_attempt(iens, runtime, JobState::Failed);
        }
        runtime.state = JobState::Submitted;
        self.update_runtime(iens, runtime);

        // a halt raised while submit was in flight
        let current = *halt.borrow_and_update();
        match current {
            Halt::Continue => {}
            Halt::StopLongRunning => self.request_kill(iens, runtime, KillReason::StopLongRunning),
            Halt::Cancel => self.request_kill(iens, runtime, KillReason::Cancel),
        }

        let mut deadline = None;
        let mut halt_closed = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(Event::Started { .. }) => {
                        if runtime.state != JobState::Submitted {
                            debug!("Ignoring repeated start of realization {iens}");
                            continue;
                        }
                        let now = Instant::now();
                        runtime.state = JobState::Running;
                        runtime.started_at = Some(now);
                        deadline = realization.max_runtime.map(|max_runtime| now + max_runtime);
                        self.update_runtime(iens, runtime);
                    }
                    Some(Event::Finished { returncode, aborted, .. }) => {
                        let state = runtime.classify(returncode, aborted);
                        match state {
                            JobState::Succeeded => info!("Realization {iens} succeeded"),
                            JobState::Failed => warn!(
                                returncode,
                                aborted, "Realization {iens} failed"
                            ),
                            _ => debug!(?state, "Realization {iens} terminated after kill"),
                        }
                        return self.end_attempt(iens, runtime, state);
                    }
                    None => {
                        error!("Event route of realization {iens} closed unexpectedly");
                        return self.end_attempt(iens, runtime, JobState::Failed);
                    }
                },
                _ = wait_until(deadline), if deadline.is_some() => {
                    deadline = None;
                    let max_runtime = realization.max_runtime.unwrap_or_default().as_secs();
                    warn!("Realization {iens} stopped due to MAX_RUNTIME={max_runtime} seconds");
                    runtime.state = JobState::TimedOut;
                    self.request_kill(iens, runtime, KillReason::Timeout);
                }
                changed = halt.changed(), if !halt_closed => {
                    if changed.is_err() {
                        halt_closed = true;
                        continue;
                    }
                    let current = *halt.borrow_and_update();
                    match current {
                        Halt::Continue => {}
                        Halt::StopLongRunning => {
                            self.request_kill(iens, runtime, KillReason::StopLongRunning)
                        }
                        Halt::Cancel => self.request_kill(iens, runtime, KillReason::Cancel),
                    }
                }
            }
        }
    }

    /// tag the kill and, if it is the first one, hand it to the driver without waiting
    fn request_kill(&self, iens: usize, runtime: &mut JobRuntime, reason: KillReason) {
        if runtime.request_kill(reason) {
            info!(?reason, "Killing realization {iens}");
            let driver = Arc::clone(&self.driver);
            tokio::spawn(async move { driver.kill(iens).await });
        } else {
            debug!(?reason, kill_reason = ?runtime.kill_reason, "Kill of realization {iens} already requested");
        }
        self.update_runtime(iens, runtime);
    }

    fn end_attempt(&self, iens: usize, runtime: &mut JobRuntime, state: JobState) -> JobState {
        runtime.state = state;
        runtime.finished_at = Some(Instant::now());
        self.update_runtime(iens, runtime);
        state
    }
}
