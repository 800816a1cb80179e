use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::queue::{channel, Message, QueueReceiver};
use super::{CollectionQueue, Envelope, RecordSink, WriteMode};
use crate::checkpoint::CheckpointStore;
use crate::config::{BatchConfig, QueueConfig};
use crate::record::Record;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Checkpoint files written.
    pub batches: usize,
    pub records: usize,
    /// Records left out of a checkpoint because they could not be encoded.
    pub skipped_records: usize,
    pub dropped_batches: usize,
    pub dropped_records: usize,
    /// Merged records forwarded to secondary sinks.
    pub updates: usize,
    /// The worker did not finish within the shutdown timeout.
    pub timed_out: bool,
}

/// Owner of the background task that turns queued records into checkpoints.
pub struct PersistenceWorker {
    queue: CollectionQueue,
    handle: JoinHandle<WorkerReport>,
    shutdown_timeout: Duration,
}

impl PersistenceWorker {
    pub fn spawn(
        store: Arc<CheckpointStore>,
        sinks: Vec<Box<dyn RecordSink>>,
        batch: &BatchConfig,
        queue: &QueueConfig,
    ) -> (CollectionQueue, PersistenceWorker) {
        let (tx, rx) = channel(queue);
        let batcher = Batcher {
            store,
            sinks,
            size: batch.size.max(1),
            interval: batch.flush_interval(),
            max_attempts: batch.max_attempts.max(1),
            current: Vec::new(),
            started: None,
            parked: None,
            report: WorkerReport::default(),
        };
        let handle = tokio::spawn(batcher.run(rx));
        let worker = PersistenceWorker {
            queue: tx.clone(),
            handle,
            shutdown_timeout: batch.shutdown_timeout(),
        };
        (tx, worker)
    }

    /// Stop accepting records, persist everything still queued and wait for
    /// the task, up to the configured shutdown timeout.
    pub async fn flush(self) -> WorkerReport {
        let pending = self.queue.stats().queued;
        info!("flushing persistence worker ({} queued)", pending);
        self.queue.close();

        match timeout(self.shutdown_timeout, self.handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                error!("persistence worker failed: {}", e);
                WorkerReport::default()
            }
            Err(_) => {
                error!(
                    "persistence worker did not finish within {:?}; unflushed records may be lost",
                    self.shutdown_timeout
                );
                WorkerReport {
                    timed_out: true,
                    ..WorkerReport::default()
                }
            }
        }
    }
}

struct Parked {
    records: Vec<Record>,
    attempts: u32,
    retry_at: Instant,
}

struct Batcher {
    store: Arc<CheckpointStore>,
    sinks: Vec<Box<dyn RecordSink>>,
    size: usize,
    interval: Duration,
    max_attempts: u32,
    current: Vec<Record>,
    /// When the first record of `current` arrived.
    started: Option<Instant>,
    /// A batch whose checkpoint write failed and awaits another attempt.
    parked: Option<Parked>,
    report: WorkerReport,
}

impl Batcher {
    async fn run(mut self, mut rx: QueueReceiver) -> WorkerReport {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(Message::Item(envelope, _permit)) => self.push(envelope),
                    Some(Message::Shutdown) | None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick(false);
                }
            }
        }

        rx.close();
        while let Some(msg) = rx.try_recv() {
            if let Message::Item(envelope, _permit) = msg {
                self.push(envelope);
            }
        }
        self.drain();

        rx.shared().worker_alive.store(false, Ordering::Release);
        debug!("persistence worker stopped: {:?}", self.report);
        self.report
    }

    /// The current batch cannot flush while one is parked, so only the
    /// retry time counts then.
    fn next_deadline(&self) -> Option<Instant> {
        match &self.parked {
            Some(parked) => Some(parked.retry_at),
            None => self.started.map(|t| t + self.interval),
        }
    }

    fn push(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Accepted(record) => {
                if self.current.is_empty() {
                    self.started = Some(Instant::now());
                }
                self.current.push(record);
                if self.current.len() >= self.size {
                    self.tick(true);
                }
            }
            Envelope::Merged(record) => {
                self.report.updates += 1;
                self.feed_sinks(std::slice::from_ref(&record), WriteMode::Update);
            }
        }
    }

    /// A parked batch always goes first, and not before its retry time; the
    /// current batch waits behind it so checkpoints stay in arrival order.
    fn tick(&mut self, force: bool) {
        if self.parked.as_ref().is_some_and(|p| p.retry_at > Instant::now()) {
            return;
        }
        if let Some(parked) = self.parked.take() {
            self.attempt(parked.records, parked.attempts);
            if self.parked.is_some() {
                return;
            }
        }
        let due = self
            .started
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(false);
        if !self.current.is_empty() && (force || due || self.current.len() >= self.size) {
            let batch = std::mem::take(&mut self.current);
            self.started = None;
            self.attempt(batch, 0);
        }
    }

    fn drain(&mut self) {
        loop {
            if let Some(parked) = self.parked.take() {
                self.attempt(parked.records, parked.attempts);
            } else if !self.current.is_empty() {
                let batch = std::mem::take(&mut self.current);
                self.started = None;
                self.attempt(batch, 0);
            } else {
                break;
            }
        }
    }

    fn attempt(&mut self, records: Vec<Record>, previous_attempts: u32) {
        let attempts = previous_attempts + 1;
        match self.store.append(&records) {
            Ok(handle) => {
                if handle.path.is_some() {
                    self.report.batches += 1;
                }
                self.report.records += handle.written;
                self.report.skipped_records += handle.skipped;
                self.feed_sinks(&records, WriteMode::Insert);
            }
            Err(e) if attempts >= self.max_attempts => {
                error!(
                    "dropping batch of {} records after {} attempts: {}",
                    records.len(),
                    attempts,
                    e
                );
                self.report.dropped_batches += 1;
                self.report.dropped_records += records.len();
            }
            Err(e) => {
                warn!(
                    "checkpoint write failed (attempt {}/{}), retrying: {}",
                    attempts, self.max_attempts, e
                );
                self.parked = Some(Parked {
                    records,
                    attempts,
                    retry_at: Instant::now() + self.interval,
                });
            }
        }
    }

    fn feed_sinks(&mut self, records: &[Record], mode: WriteMode) {
        for sink in &mut self.sinks {
            match sink.write(records, mode) {
                Ok(report) if report.failed > 0 => {
                    warn!("{} sink: {} of {} records failed", sink.name(), report.failed, records.len());
                }
                Ok(_) => {}
                Err(e) => warn!("{} sink failed: {}", sink.name(), e),
            }
        }
    }
}
