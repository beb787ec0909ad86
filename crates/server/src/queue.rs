use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use reservo_core::message::QueueItem;

use crate::orchestrator::Orchestrator;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message queue is closed")]
    Closed,
}

/// Producer half of the bounded in-process message queue.
#[derive(Clone)]
pub struct QueueSender {
    sender: mpsc::Sender<QueueItem>,
}

impl QueueSender {
    pub async fn push(&self, item: QueueItem) -> Result<(), QueueError> {
        self.sender.send(item).await.map_err(|_| QueueError::Closed)
    }
}

pub fn channel(capacity: usize) -> (QueueSender, mpsc::Receiver<QueueItem>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (QueueSender { sender }, receiver)
}

/// Consumer loop. Items are processed concurrently; ordering per user is
/// restored inside the orchestrator by its session locks.
pub struct QueueWorker {
    orchestrator: Arc<Orchestrator>,
}

impl QueueWorker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Runs until the sender side is dropped, then drains in-flight tasks.
    pub async fn run(self, mut receiver: mpsc::Receiver<QueueItem>) {
        let mut in_flight = JoinSet::new();

        while let Some(item) = receiver.recv().await {
            let orchestrator = self.orchestrator.clone();
            in_flight.spawn(async move {
                let platform = item.platform.clone();
                if let Err(process_error) = orchestrator.process(item).await {
                    error!(
                        event_name = "queue.item_failed",
                        platform = %platform,
                        error = %process_error,
                        "queue item processing failed"
                    );
                }
            });
            // Reap finished tasks so the set does not grow unboundedly.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        info!(event_name = "queue.drained", "message queue closed and drained");
    }
}
