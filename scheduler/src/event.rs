use crate::scheduler::JobState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// Lifecycle transitions reported by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Started {
        iens: usize,
    },
    Finished {
        iens: usize,
        returncode: i32,
        /// the job was killed or errored, as opposed to a plain nonzero exit
        aborted: bool,
    },
}

impl Event {
    pub fn iens(&self) -> usize {
        match self {
            Self::Started { iens } | Self::Finished { iens, .. } => *iens,
        }
    }
}

/// State change of a single realization as seen by the scheduler, meant for
/// progress reporters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble_id: Option<String>,
    pub iens: usize,
    pub state: JobState,
    pub attempt: u32,
}

/// Unbounded FIFO with any number of producers and a single consumer.
///
/// The consumer side is handed out with [`EventQueue::take_receiver`] and can be
/// put back with [`EventQueue::restore_receiver`] once the consumer is done, so
/// the same queue can serve consecutive runs.
#[derive(Debug)]
pub struct EventQueue<T> {
    sender: UnboundedSender<T>,
    receiver: Mutex<Option<UnboundedReceiver<T>>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();

        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// producer handle, e.g. for tasks spawned by a driver
    pub fn sender(&self) -> UnboundedSender<T> {
        self.sender.clone()
    }

    pub fn put(&self, item: T) {
        if self.sender.send(item).is_err() {
            warn!("Event queue has no consumer anymore, dropping event");
        }
    }

    /// None if another consumer currently holds the receiver
    pub fn take_receiver(&self) -> Option<UnboundedReceiver<T>> {
        self.receiver.lock().take()
    }

    pub fn restore_receiver(&self, receiver: UnboundedReceiver<T>) {
        *self.receiver.lock() = Some(receiver);
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
