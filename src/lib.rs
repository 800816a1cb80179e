//! Resilient record collection: dedup, durable checkpoints with resume,
//! adaptive pacing and a two-stage interrupt.

pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod db;
pub mod dedup;
pub mod error;
pub mod interrupt;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limit;
pub mod record;
pub mod source;

pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use orchestrator::{Orchestrator, RunOutcome, RunSummary};
pub use record::{Fingerprint, Record};
