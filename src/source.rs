use std::io;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;

use crate::record::Record;

#[derive(Debug)]
pub enum Candidate {
    Record(Record),
    EndOfStream,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The current candidate is lost but the source can keep going.
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("source failed: {0}")]
    Fatal(String),
}

/// Where the collection loop pulls candidate records from.
///
/// `next_candidate` may be dropped mid-call when a forced shutdown races it,
/// so implementations should not lose state across an await point.
#[async_trait]
pub trait CandidateSource: Send {
    async fn next_candidate(&mut self) -> Result<Candidate, SourceError>;
}

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

/// Newline-delimited JSON objects, one candidate per line.
pub struct JsonlSource {
    label: String,
    lines: LineReader,
    line_no: usize,
}

impl JsonlSource {
    pub async fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)
            .await
            .map_err(|e| SourceError::Fatal(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_reader(path.display().to_string(), Box::new(file)))
    }

    pub fn stdin() -> Self {
        Self::from_reader("<stdin>".to_string(), Box::new(tokio::io::stdin()))
    }

    /// `-` reads standard input.
    pub async fn from_arg(input: &Path) -> Result<Self, SourceError> {
        if input.as_os_str() == "-" {
            Ok(Self::stdin())
        } else {
            Self::open(input).await
        }
    }

    pub fn from_reader(label: String, reader: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        JsonlSource {
            label,
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl CandidateSource for JsonlSource {
    async fn next_candidate(&mut self) -> Result<Candidate, SourceError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(line) => line,
                // The undecodable line is consumed; reading resumes after it.
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.line_no += 1;
                    return Err(SourceError::Transient(format!(
                        "{} line {}: {}",
                        self.label, self.line_no, e
                    )));
                }
                Err(e) => return Err(SourceError::Fatal(format!("{}: {}", self.label, e))),
            };
            let Some(line) = line else {
                debug!("{}: end of input after {} lines", self.label, self.line_no);
                return Ok(Candidate::EndOfStream);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str::<Record>(&line)
                .map(Candidate::Record)
                .map_err(|e| SourceError::Transient(format!("{} line {}: {}", self.label, self.line_no, e)));
        }
    }
}
