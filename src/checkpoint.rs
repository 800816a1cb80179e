use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use chrono::Local;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::dedup::{fingerprint, ProcessedSet};
use crate::error::{HarvestError, Result};
use crate::record::{Fingerprint, Record};

/// Result of one successful `append`.
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    /// `None` when every record of the batch failed to serialize.
    pub path: Option<PathBuf>,
    pub sequence: u64,
    pub written: usize,
    pub skipped: usize,
}

/// Everything a resume scan learned about a run directory.
#[derive(Debug, Default, Clone)]
pub struct CheckpointScan {
    pub fingerprints: HashSet<Fingerprint>,
    pub records: usize,
    pub files: usize,
    pub corrupt_lines: usize,
}

impl CheckpointScan {
    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            files: self.files,
            records: self.records,
            unique: self.fingerprints.len(),
            corrupt_lines: self.corrupt_lines,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub files: usize,
    pub records: usize,
    pub unique: usize,
    pub corrupt_lines: usize,
}

/// Append-only JSONL checkpoints for one run.
///
/// Each batch becomes its own immutable file
/// `checkpoint_<seq>_<timestamp>.jsonl`; the sequence number, not the file
/// system clock, orders them.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_name: String,
    processed: ProcessedSet,
    next_sequence: Mutex<u64>,
}

impl CheckpointStore {
    /// Create (or reopen) the run directory under `root`.
    pub fn open(root: &Path, run_name: &str, processed: ProcessedSet) -> Result<Self> {
        let dir = root.join(run_name);
        fs::create_dir_all(&dir).map_err(|source| HarvestError::FatalStartup {
            path: dir.clone(),
            source,
        })?;
        let last = checkpoint_files(&dir)
            .map_err(|source| HarvestError::FatalStartup {
                path: dir.clone(),
                source,
            })?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(0);
        debug!("checkpoint dir {} opened, next sequence {}", dir.display(), last + 1);
        Ok(CheckpointStore {
            dir,
            run_name: run_name.to_string(),
            processed,
            next_sequence: Mutex::new(last + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    fn take_sequence(&self) -> u64 {
        let mut next = self
            .next_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = *next;
        *next += 1;
        seq
    }

    /// Write `batch` as a new checkpoint file and fsync it. The file is the
    /// unit of durability: an I/O failure is returned as `Durability` and
    /// nothing is marked processed. Encoding a `Record` does not fail in
    /// practice, so `skipped` stays zero; per-record failures are a sink
    /// concern (see [`crate::pipeline::SinkReport`]).
    pub fn append(&self, batch: &[Record]) -> Result<CheckpointHandle> {
        let mut buf = String::new();
        let mut fingerprints = Vec::with_capacity(batch.len());
        let mut skipped = 0;

        for record in batch {
            let fp = record.fingerprint.clone().unwrap_or_else(|| fingerprint(record));
            match encode_line(record, &fp) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                    fingerprints.push(fp);
                }
                Err(e) => {
                    skipped += 1;
                    warn!("{}", HarvestError::TransientIo(format!("{fp}: {e}")));
                }
            }
        }

        let sequence = self.take_sequence();
        if fingerprints.is_empty() {
            return Ok(CheckpointHandle {
                path: None,
                sequence,
                written: 0,
                skipped,
            });
        }

        let name = format!(
            "checkpoint_{:06}_{}.jsonl",
            sequence,
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(name);
        if let Err(source) = write_durably(&path, buf.as_bytes()) {
            // A torn file would resurrect part of a batch that is about to be retried.
            let _ = fs::remove_file(&path);
            return Err(HarvestError::Durability { path, source });
        }
        sync_dir(&self.dir);

        let written = fingerprints.len();
        self.processed.extend(fingerprints);
        debug!("checkpoint {} written: {} records", path.display(), written);
        Ok(CheckpointHandle {
            path: Some(path),
            sequence,
            written,
            skipped,
        })
    }

    /// Fingerprints of every record in this run, tolerating torn lines.
    pub fn load_processed_set(&self) -> Result<CheckpointScan> {
        scan_dir(&self.dir)
    }

    /// Every record of the run in checkpoint order.
    pub fn latest_snapshot(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for (_, path) in checkpoint_files(&self.dir)? {
            read_file(&path, |record| records.push(record))?;
        }
        Ok(records)
    }

    /// Highest-numbered checkpoint file, if any.
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(checkpoint_files(&self.dir)?.pop().map(|(_, path)| path))
    }

    pub fn stats(&self) -> Result<CheckpointStats> {
        Ok(scan_dir(&self.dir)?.stats())
    }
}

fn encode_line(record: &Record, fp: &Fingerprint) -> serde_json::Result<String> {
    if record.fingerprint.is_some() {
        return serde_json::to_string(record);
    }
    let mut stamped = record.clone();
    stamped.fingerprint = Some(fp.clone());
    serde_json::to_string(&stamped)
}

fn write_durably(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create_new(true).append(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("could not sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^checkpoint_(\d+)_\d{8}_\d{6}\.jsonl$").unwrap());

/// Checkpoint files in `dir`, ordered by sequence number.
pub fn checkpoint_files(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(seq) = FILE_RE
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        else {
            continue;
        };
        files.push((seq, entry.path()));
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// Parse every line of one checkpoint file. Unparseable lines are logged
/// and counted, never fatal.
fn read_file(path: &Path, mut visit: impl FnMut(Record)) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut corrupt = 0;
    for (idx, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        let parsed = std::str::from_utf8(&line)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                if text.trim().is_empty() {
                    Ok(None)
                } else {
                    serde_json::from_str::<Record>(text)
                        .map(Some)
                        .map_err(|e| e.to_string())
                }
            });
        match parsed {
            Ok(Some(record)) => visit(record),
            Ok(None) => {}
            Err(reason) => {
                corrupt += 1;
                warn!(
                    "{}",
                    HarvestError::CorruptCheckpointLine {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        reason,
                    }
                );
            }
        }
    }
    Ok(corrupt)
}

/// Rebuild dedup state from every checkpoint in `dir`; files are parsed in
/// parallel.
pub fn scan_dir(dir: &Path) -> Result<CheckpointScan> {
    let files = checkpoint_files(dir)?;
    let partials: Vec<Result<CheckpointScan>> = files
        .par_iter()
        .map(|(_, path)| {
            let mut scan = CheckpointScan {
                files: 1,
                ..CheckpointScan::default()
            };
            let corrupt = read_file(path, |record| {
                scan.records += 1;
                let fp = record.fingerprint.clone().unwrap_or_else(|| fingerprint(&record));
                scan.fingerprints.insert(fp);
            })?;
            scan.corrupt_lines = corrupt;
            Ok(scan)
        })
        .collect();

    let mut total = CheckpointScan::default();
    for partial in partials {
        let partial = partial?;
        total.files += partial.files;
        total.records += partial.records;
        total.corrupt_lines += partial.corrupt_lines;
        total.fingerprints.extend(partial.fingerprints);
    }
    if total.files > 0 {
        info!(
            "scanned {} checkpoint files: {} records, {} unique, {} corrupt lines",
            total.files,
            total.records,
            total.fingerprints.len(),
            total.corrupt_lines
        );
    }
    Ok(total)
}

/// Run names that have a checkpoint directory under `root`.
pub fn list_runs(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                runs.push(name.to_string());
            }
        }
    }
    runs.sort();
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::keys;

    fn store(root: &Path) -> CheckpointStore {
        CheckpointStore::open(root, "cafes", ProcessedSet::new()).unwrap()
    }

    fn rec(i: usize) -> Record {
        Record::new().with(keys::PLACE_ID, format!("p{i}")).with(keys::NAME, format!("Cafe {i}"))
    }

    #[test]
    fn append_assigns_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let handle = store.append(&[rec(1), rec(2)]).unwrap();
        assert_eq!(handle.written, 2);
        assert_eq!(handle.sequence, 1);
        assert!(store.processed().contains(&Fingerprint::new("id:p1")));

        let snapshot = store.latest_snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].fingerprint.as_ref().unwrap().as_str(), "id:p1");
    }

    #[test]
    fn sequence_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).append(&[rec(1)]).unwrap();
        store(dir.path()).append(&[rec(2)]).unwrap();
        let reopened = store(dir.path());
        let files = checkpoint_files(reopened.dir()).unwrap();
        assert_eq!(files.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(reopened.latest_checkpoint().unwrap(), Some(files[1].1.clone()));
    }

    #[test]
    fn one_garbled_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let batch: Vec<Record> = (0..99).map(rec).collect();
        let handle = store.append(&batch).unwrap();

        let path = handle.path.unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"_id\":\"id:torn\",\"name\":\"Caf").unwrap();

        let scan = store.load_processed_set().unwrap();
        assert_eq!(scan.fingerprints.len(), 99);
        assert_eq!(scan.corrupt_lines, 1);
        assert_eq!(scan.records, 99);
        assert_eq!(
            store.stats().unwrap(),
            CheckpointStats { files: 1, records: 99, unique: 99, corrupt_lines: 1 }
        );
    }

    #[test]
    fn garbage_bytes_do_not_abort_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.append(&[rec(1)]).unwrap();
        let path = store.dir().join("checkpoint_000002_20240101_000000.jsonl");
        fs::write(&path, b"\xff\xfe\n{\"place_id\":\"p2\"}\n\n").unwrap();

        let scan = store.load_processed_set().unwrap();
        assert_eq!(scan.files, 2);
        assert_eq!(scan.corrupt_lines, 1);
        assert!(scan.fingerprints.contains(&Fingerprint::new("id:p2")));
    }

    #[test]
    fn unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.dir().join("notes.txt"), "hello").unwrap();
        assert_eq!(store.load_processed_set().unwrap().files, 0);
    }

    #[test]
    fn runs_listed() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path());
        CheckpointStore::open(dir.path(), "bakeries", ProcessedSet::new()).unwrap();
        assert_eq!(list_runs(dir.path()).unwrap(), vec!["bakeries", "cafes"]);
    }

    #[test]
    fn unwritable_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let err = CheckpointStore::open(&blocker, "run", ProcessedSet::new()).unwrap_err();
        assert!(matches!(err, HarvestError::FatalStartup { .. }));
    }
}
