use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::HarvestConfig;
use crate::convert::{Converter, FileConverter};
use crate::db::SqliteSink;
use crate::dedup::{Deduplicator, ProcessedSet};
use crate::error::Result;
use crate::interrupt::InterruptController;
use crate::pipeline::{Envelope, PersistenceWorker, RecordSink, WorkerReport};
use crate::rate_limit::RateLimiter;
use crate::source::{Candidate, CandidateSource, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A second interrupt arrived inside the grace window.
    ForcedShutdown,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Fingerprints recovered from earlier checkpoints of the run.
    pub resumed: usize,
    pub corrupt_lines: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub merged: usize,
    /// Items abandoned on operator request.
    pub skipped: usize,
    pub source_failures: usize,
    /// Set when the source failed for good; the run still flushes.
    pub fatal: Option<String>,
    pub worker: WorkerReport,
    pub outputs: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Drives one run: resume, pull candidates, dedup, enqueue, then flush and
/// convert however the loop ended.
pub struct Orchestrator {
    config: HarvestConfig,
    limiter: RateLimiter,
    interrupts: InterruptController,
    converter: Box<dyn Converter>,
    sinks: Vec<Box<dyn RecordSink>>,
}

impl Orchestrator {
    pub fn new(config: HarvestConfig, interrupts: InterruptController) -> Self {
        let converter = Box::new(FileConverter::new(config.final_dir(), &config.convert));
        Orchestrator {
            limiter: RateLimiter::new(config.rate.clone()),
            interrupts,
            converter,
            sinks: Vec::new(),
            config,
        }
    }

    pub fn with_converter(mut self, converter: Box<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    /// Extra secondary sink, on top of any enabled in the configuration.
    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn run(&mut self, source: &mut dyn CandidateSource) -> Result<RunSummary> {
        let started = Instant::now();
        let config = &self.config;

        let store = CheckpointStore::open(&config.checkpoint_root(), &config.run_name, ProcessedSet::new())?;
        let scan = store.load_processed_set()?;
        let resumed = scan.fingerprints.len();
        store.processed().extend(scan.fingerprints);
        if resumed > 0 {
            info!("resuming run '{}': {} records already collected", config.run_name, resumed);
        }
        let store = Arc::new(store);

        let mut sinks = std::mem::take(&mut self.sinks);
        if config.sinks.sqlite {
            sinks.push(Box::new(SqliteSink::open(&config.sqlite_path())?));
        }

        let (queue, worker) =
            PersistenceWorker::spawn(Arc::clone(&store), sinks, &config.batch, &config.queue);
        let mut dedup = Deduplicator::new(store.processed().clone(), &config.dedup);

        let pb = if config.show_progress {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut skipped = 0usize;
        let mut source_failures = 0usize;
        let mut fatal = None;

        let outcome = loop {
            if self.interrupts.is_forced() {
                break RunOutcome::ForcedShutdown;
            }
            if let Some(max) = config.max_records {
                if dedup.stats().accepted >= max {
                    info!("reached max_records ({})", max);
                    break RunOutcome::Completed;
                }
            }

            tokio::select! {
                biased;
                _ = self.interrupts.cancelled() => break RunOutcome::ForcedShutdown,
                _ = self.limiter.wait_if_needed() => {}
            }
            let next = tokio::select! {
                biased;
                _ = self.interrupts.cancelled() => break RunOutcome::ForcedShutdown,
                next = source.next_candidate() => next,
            };

            let record = match next {
                Ok(Candidate::Record(record)) => {
                    self.limiter.record_success();
                    record
                }
                Ok(Candidate::EndOfStream) => break RunOutcome::Completed,
                Err(SourceError::Transient(msg)) => {
                    self.limiter.record_failure();
                    source_failures += 1;
                    warn!("candidate failed: {}", msg);
                    continue;
                }
                Err(SourceError::Fatal(msg)) => {
                    error!("source failed, stopping collection: {}", msg);
                    fatal = Some(msg);
                    break RunOutcome::Completed;
                }
            };

            if self.interrupts.take_skip() {
                skipped += 1;
                info!("skipped current item on interrupt");
                continue;
            }

            let accepted = dedup.accept(record);
            let envelope = if accepted.is_new {
                Some(Envelope::Accepted(accepted.merged))
            } else if config.dedup.reemit_merged {
                Some(Envelope::Merged(accepted.merged))
            } else {
                None
            };
            if let Some(envelope) = envelope {
                if let Err(e) = queue.enqueue(envelope).await {
                    error!("cannot hand record to the persistence worker: {}", e);
                    break RunOutcome::Completed;
                }
            }

            let stats = dedup.stats();
            pb.set_message(format!(
                "{} new | {} duplicates | {} queued",
                stats.accepted,
                stats.duplicates,
                queue.stats().queued
            ));
        };
        pb.finish_and_clear();

        if outcome == RunOutcome::ForcedShutdown {
            warn!("forced shutdown: flushing {} queued records", queue.stats().queued);
        }
        let worker_report = worker.flush().await;
        debug!("rate limiter at exit: {:?}", self.limiter.stats());

        let outputs = self.convert(&store);
        let stats = dedup.stats();
        Ok(RunSummary {
            outcome,
            resumed,
            corrupt_lines: scan.corrupt_lines,
            accepted: stats.accepted,
            duplicates: stats.duplicates,
            merged: stats.merged,
            skipped,
            source_failures,
            fatal,
            worker: worker_report,
            outputs,
            elapsed: started.elapsed(),
        })
    }

    /// Best effort: a failed conversion is logged and the checkpoints stay
    /// the source of truth.
    fn convert(&self, store: &CheckpointStore) -> Vec<PathBuf> {
        let records = match store.latest_snapshot() {
            Ok(records) => records,
            Err(e) => {
                error!("cannot read checkpoint snapshot: {}", e);
                return Vec::new();
            }
        };
        if records.is_empty() {
            info!("nothing collected, skipping conversion");
            return Vec::new();
        }
        match self.converter.convert(&records, store.run_name()) {
            Ok(paths) => paths,
            Err(e) => {
                error!("conversion failed: {:#}", e);
                Vec::new()
            }
        }
    }
}
