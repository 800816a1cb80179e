use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use indexmap::IndexSet;
use serde_json::Value;
use tracing::info;

use crate::config::{ConvertConfig, OutputFormat};
use crate::record::{keys, Record};

/// Turns a run snapshot into its final deliverables.
pub trait Converter: Send + Sync {
    fn convert(&self, records: &[Record], run_name: &str) -> anyhow::Result<Vec<PathBuf>>;
}

/// Writes `<final_dir>/{json,csv,summary}/` outputs.
pub struct FileConverter {
    final_dir: PathBuf,
    formats: Vec<OutputFormat>,
}

impl FileConverter {
    pub fn new(final_dir: impl Into<PathBuf>, config: &ConvertConfig) -> Self {
        FileConverter {
            final_dir: final_dir.into(),
            formats: config.formats.clone(),
        }
    }

    fn target(&self, sub: &str, file: String) -> anyhow::Result<PathBuf> {
        let dir = self.final_dir.join(sub);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir.join(file))
    }
}

impl Converter for FileConverter {
    fn convert(&self, records: &[Record], run_name: &str) -> anyhow::Result<Vec<PathBuf>> {
        let name = format!("{}_{}", run_name, Local::now().format("%Y%m%d_%H%M%S"));
        let mut written = Vec::new();
        for format in &self.formats {
            let path = match format {
                OutputFormat::Json => {
                    let path = self.target("json", format!("{name}.json"))?;
                    write_json(&path, records)?;
                    path
                }
                OutputFormat::Csv => {
                    let path = self.target("csv", format!("{name}.csv"))?;
                    write_csv(&path, records)?;
                    path
                }
                OutputFormat::Summary => {
                    let path = self.target("summary", format!("summary_{name}.txt"))?;
                    fs::write(&path, summary(records))
                        .with_context(|| format!("writing {}", path.display()))?;
                    path
                }
            };
            info!("wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn write_json(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(records)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn write_csv(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    let mut columns: IndexSet<&str> = IndexSet::new();
    columns.insert(keys::ID);
    for record in records {
        columns.extend(record.fields.keys().map(String::as_str));
    }

    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(columns.iter())?;
    for record in records {
        let row = columns.iter().map(|&column| {
            if column == keys::ID {
                record
                    .fingerprint
                    .as_ref()
                    .map(|fp| fp.as_str().to_string())
                    .unwrap_or_default()
            } else {
                record.get(column).map(cell).unwrap_or_default()
            }
        });
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn has_phone(record: &Record) -> bool {
    record.has(keys::PHONE_NUMBERS) || record.has(keys::PHONE)
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

pub fn summary(records: &[Record]) -> String {
    let total = records.len();
    let with_phone = records.iter().filter(|r| has_phone(r)).count();
    let with_website = records.iter().filter(|r| r.has(keys::WEBSITE)).count();
    let rule = "=".repeat(60);

    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "COLLECTION SUMMARY");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Total records: {total}");
    let _ = writeln!(out, "With phone: {} ({:.1}%)", with_phone, percent(with_phone, total));
    let _ = writeln!(out, "With website: {} ({:.1}%)", with_website, percent(with_website, total));
    let _ = writeln!(out, "{rule}");
    for (i, record) in records.iter().take(10).enumerate() {
        let _ = writeln!(out, "{:>3}. {}", i + 1, record.text(keys::NAME).unwrap_or("N/A"));
    }
    out
}
