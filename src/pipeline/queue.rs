use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::Envelope;
use crate::config::QueueConfig;
use crate::error::{HarvestError, Result};

pub(crate) enum Message {
    /// The permit, when present, holds a slot under the depth ceiling until
    /// the worker has taken the item.
    Item(Envelope, Option<OwnedSemaphorePermit>),
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) accepting: AtomicBool,
    pub(crate) worker_alive: AtomicBool,
    queued: AtomicUsize,
    total: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub total_enqueued: usize,
    pub worker_alive: bool,
}

/// Producer handle. Cloning is cheap; every clone feeds the same worker.
#[derive(Clone)]
pub struct CollectionQueue {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    ceiling: Option<Arc<Semaphore>>,
}

pub(crate) struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

pub(crate) fn channel(config: &QueueConfig) -> (CollectionQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accepting: AtomicBool::new(true),
        worker_alive: AtomicBool::new(true),
        queued: AtomicUsize::new(0),
        total: AtomicUsize::new(0),
    });
    let ceiling = config.max_depth.map(|depth| Arc::new(Semaphore::new(depth.max(1))));
    (
        CollectionQueue {
            tx,
            shared: Arc::clone(&shared),
            ceiling,
        },
        QueueReceiver { rx, shared },
    )
}

impl CollectionQueue {
    /// Hand a record to the worker. Returns immediately unless a depth
    /// ceiling is configured and reached.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(HarvestError::QueueClosed);
        }
        let permit = match &self.ceiling {
            Some(ceiling) => Some(
                Arc::clone(ceiling)
                    .acquire_owned()
                    .await
                    .map_err(|_| HarvestError::QueueClosed)?,
            ),
            None => None,
        };
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Message::Item(envelope, permit)).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(HarvestError::QueueClosed);
        }
        self.shared.total.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.shared.queued.load(Ordering::Acquire),
            total_enqueued: self.shared.total.load(Ordering::Acquire),
            worker_alive: self.shared.worker_alive.load(Ordering::Acquire),
        }
    }

    /// Stop taking records and tell the worker to drain.
    pub(crate) fn close(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        if let Some(ceiling) = &self.ceiling {
            ceiling.close();
        }
        let _ = self.tx.send(Message::Shutdown);
    }
}

impl QueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;
        self.taken(&msg);
        msg
    }

    /// Remaining messages after shutdown, without waiting.
    pub(crate) fn try_recv(&mut self) -> Option<Message> {
        let msg = self.rx.try_recv().ok();
        self.taken(&msg);
        msg
    }

    pub(crate) fn close(&mut self) {
        self.rx.close();
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    fn taken(&self, msg: &Option<Message>) {
        if let Some(Message::Item(..)) = msg {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
