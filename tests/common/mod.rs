#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest::config::RateConfig;
use harvest::convert::Converter;
use harvest::interrupt::InterruptController;
use harvest::record::keys;
use harvest::source::{Candidate, CandidateSource, SourceError};
use harvest::{HarvestConfig, Record};

/// Config rooted in `dir` with pacing effectively disabled.
pub fn config(dir: &Path, run: &str) -> HarvestConfig {
    HarvestConfig {
        output_dir: dir.to_path_buf(),
        run_name: run.to_string(),
        show_progress: false,
        rate: RateConfig {
            requests_per_minute: 10_000.0,
            max_rate: 10_000.0,
            min_delay_secs: 0.0,
            max_delay_secs: 0.0,
            jitter: false,
            ..RateConfig::default()
        },
        ..HarvestConfig::default()
    }
}

pub fn shop(i: usize) -> Record {
    Record::new()
        .with(keys::PLACE_ID, format!("p{i}"))
        .with(keys::NAME, format!("Shop {i}"))
}

/// What a scripted source does on one call.
pub enum Step {
    Yield(Record),
    Fail(SourceError),
    /// Deliver an interrupt, then yield the record.
    InterruptThen(Record),
    /// Deliver two interrupts, then never return.
    ForceAndHang,
    /// Sleep, letting the persistence worker catch up.
    Pause(Duration),
    /// Run a side effect, then carry on with the next step.
    Then(Box<dyn FnOnce() + Send>),
}

pub struct ScriptedSource {
    steps: VecDeque<Step>,
    interrupts: Option<InterruptController>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        ScriptedSource {
            steps: steps.into_iter().collect(),
            interrupts: None,
        }
    }

    pub fn records(records: impl IntoIterator<Item = Record>) -> Self {
        Self::new(records.into_iter().map(Step::Yield))
    }

    pub fn with_interrupts(mut self, interrupts: InterruptController) -> Self {
        self.interrupts = Some(interrupts);
        self
    }
}

#[async_trait]
impl CandidateSource for ScriptedSource {
    async fn next_candidate(&mut self) -> Result<Candidate, SourceError> {
        loop {
            return match self.steps.pop_front() {
                None => Ok(Candidate::EndOfStream),
                Some(Step::Yield(record)) => Ok(Candidate::Record(record)),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::InterruptThen(record)) => {
                    if let Some(interrupts) = &self.interrupts {
                        interrupts.signal();
                    }
                    Ok(Candidate::Record(record))
                }
                Some(Step::ForceAndHang) => {
                    if let Some(interrupts) = &self.interrupts {
                        interrupts.signal();
                        interrupts.signal();
                    }
                    std::future::pending::<()>().await;
                    Ok(Candidate::EndOfStream)
                }
                Some(Step::Pause(duration)) => {
                    tokio::time::sleep(duration).await;
                    continue;
                }
                Some(Step::Then(action)) => {
                    action();
                    continue;
                }
            };
        }
    }
}

/// Converter that only remembers how many records it was handed.
#[derive(Clone, Default)]
pub struct CountingConverter {
    pub calls: Arc<Mutex<Vec<usize>>>,
}

impl Converter for CountingConverter {
    fn convert(&self, records: &[Record], _run_name: &str) -> anyhow::Result<Vec<std::path::PathBuf>> {
        self.calls.lock().unwrap().push(records.len());
        Ok(Vec::new())
    }
}
