#![allow(dead_code)]

use async_trait::async_trait;
use ensemble_scheduler::{
    drivers::{Driver, DriverError, SubmitRequest},
    event::{Event, EventQueue, RealizationEvent},
    realization::Realization,
    scheduler::JobState,
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{self, Duration, Instant},
};

type WaitFn = Arc<dyn Fn(usize) -> BoxFuture<'static, i32> + Send + Sync>;
type KillFn = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-memory driver whose jobs "run" a configurable future returning the returncode
pub struct MockDriver {
    events: EventQueue<Event>,
    wait: WaitFn,
    on_kill: KillFn,
    rejections: Mutex<HashMap<usize, u32>>,
    jobs: Arc<Mutex<HashMap<usize, JoinHandle<()>>>>,
    submissions: Mutex<Vec<(usize, Instant)>>,
    kills: Mutex<Vec<usize>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDriver")
            .field("submissions", &self.submissions.lock().len())
            .finish()
    }
}

impl MockDriver {
    /// every job succeeds right away
    pub fn new() -> Self {
        Self {
            events: EventQueue::new(),
            wait: Arc::new(|_: usize| async { 0 }.boxed()),
            on_kill: Arc::new(|_: usize| async {}.boxed()),
            rejections: Mutex::default(),
            jobs: Arc::default(),
            submissions: Mutex::default(),
            kills: Mutex::default(),
            running: Arc::default(),
            max_running: Arc::default(),
        }
    }

    pub fn with_wait<F, Fut>(mut self, wait: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        self.wait = Arc::new(move |iens| wait(iens).boxed());
        self
    }

    /// runs before the job is torn down, e.g. to simulate a slow backend
    pub fn with_kill<F, Fut>(mut self, on_kill: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_kill = Arc::new(move |iens| on_kill(iens).boxed());
        self
    }

    /// reject the first `count` submissions of a realization
    pub fn rejecting(self, iens: usize, count: u32) -> Self {
        self.rejections.lock().insert(iens, count);
        self
    }

    pub fn submissions_of(&self, iens: usize) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|(submitted, _)| *submitted == iens)
            .count()
    }

    pub fn submission_times(&self) -> Vec<Instant> {
        self.submissions.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn kills(&self) -> Vec<usize> {
        self.kills.lock().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn event_queue(&self) -> &EventQueue<Event> {
        &self.events
    }

    async fn submit(&self, request: SubmitRequest) -> Result<(), DriverError> {
        let iens = request.iens;
        self.submissions.lock().push((iens, Instant::now()));

        if let Some(remaining) = self.rejections.lock().get_mut(&iens) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::Submission {
                    iens,
                    reason: "rejected by mock".to_owned(),
                });
            }
        }

        let wait = Arc::clone(&self.wait);
        let sender = self.events.sender();
        let jobs = Arc::clone(&self.jobs);
        let running = Arc::clone(&self.running);
        let max_running = Arc::clone(&self.max_running);

        let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
        max_running.fetch_max(now_running, Ordering::SeqCst);

        {
            let mut guard = self.jobs.lock();
            let handle = tokio::spawn(async move {
                let _ = sender.send(Event::Started { iens });
                let returncode = wait(iens).await;

                // whoever removes the job reports its end
                if jobs.lock().remove(&iens).is_some() {
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = sender.send(Event::Finished {
                        iens,
                        returncode,
                        aborted: false,
                    });
                }
            });
            guard.insert(iens, handle);
        }

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        self.kills.lock().push(iens);
        (self.on_kill)(iens).await;

        let handle = self.jobs.lock().remove(&iens);
        if let Some(handle) = handle {
            handle.abort();
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.events.put(Event::Finished {
                iens,
                returncode: 1,
                aborted: true,
            });
        }
    }

    async fn poll(&self) {
        futures::future::pending::<()>().await
    }

    async fn finish(&self) {}
}

pub fn realizations(count: usize) -> Vec<Realization> {
    (0..count)
        .map(|iens| Realization::new(iens, PathBuf::from(format!("runs/realization-{iens}")), "job_dispatch"))
        .collect()
}

pub fn drain(receiver: &mut UnboundedReceiver<RealizationEvent>) -> Vec<RealizationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// wait for a realization to reach a state in the status stream
pub async fn wait_for_state(
    receiver: &mut UnboundedReceiver<RealizationEvent>,
    iens: usize,
    state: JobState,
) -> Vec<RealizationEvent> {
    let mut seen = Vec::new();
    loop {
        let event = time::timeout(Duration::from_secs(3600), receiver.recv())
            .await
            .expect("state reached in time")
            .expect("status stream open");
        let reached = event.iens == iens && event.state == state;
        seen.push(event);
        if reached {
            return seen;
        }
    }
}
