//! Hand-off between the collection loop and durable storage.
//!
//! The producer pushes [`Envelope`]s into a [`CollectionQueue`]; a single
//! [`PersistenceWorker`] task drains it, batches accepted records into
//! checkpoints and mirrors them into any secondary [`RecordSink`]s.

pub mod queue;
pub mod worker;

pub use queue::{CollectionQueue, QueueStats};
pub use worker::{PersistenceWorker, WorkerReport};

use crate::error::Result;
use crate::record::Record;

/// What travels through the queue.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// A new entity, destined for the next checkpoint.
    Accepted(Record),
    /// A merged view of an entity that is already persisted; only
    /// secondary sinks see it.
    Merged(Record),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    Update,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkReport {
    pub written: usize,
    pub failed: usize,
}

/// Secondary output fed after each successful checkpoint.
///
/// Per-record failures are reported in [`SinkReport::failed`]; an `Err`
/// means the whole call failed. Neither affects the checkpoint.
pub trait RecordSink: Send {
    fn name(&self) -> &str;

    fn write(&mut self, records: &[Record], mode: WriteMode) -> Result<SinkReport>;
}
