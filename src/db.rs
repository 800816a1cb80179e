use std::fs;
use std::path::Path;

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dedup::fingerprint;
use crate::error::{HarvestError, Result};
use crate::pipeline::{RecordSink, SinkReport, WriteMode};
use crate::record::{keys, Record};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| HarvestError::FatalStartup {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            fingerprint TEXT PRIMARY KEY,
            name        TEXT,
            phone       TEXT,
            website     TEXT,
            payload     TEXT NOT NULL,
            first_seen  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_records_name ON records(name);
        ",
    )?;
    Ok(())
}

pub fn count_records(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(n as usize)
}

pub fn fetch_payload(conn: &Connection, fingerprint: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT payload FROM records WHERE fingerprint = ?1")?;
    let mut rows = stmt.query(rusqlite::params![fingerprint])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Relational mirror of the checkpoints, one row per fingerprint.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        debug!("sqlite sink at {}", path.display());
        Ok(SqliteSink { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

const INSERT_SQL: &str = "INSERT OR IGNORE INTO records (fingerprint, name, phone, website, payload)
     VALUES (?1, ?2, ?3, ?4, ?5)";

const UPSERT_SQL: &str = "INSERT INTO records (fingerprint, name, phone, website, payload)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(fingerprint) DO UPDATE SET
         name = excluded.name,
         phone = excluded.phone,
         website = excluded.website,
         payload = excluded.payload,
         updated_at = datetime('now')";

impl RecordSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn write(&mut self, records: &[Record], mode: WriteMode) -> Result<SinkReport> {
        let sql = match mode {
            WriteMode::Insert => INSERT_SQL,
            WriteMode::Update => UPSERT_SQL,
        };
        let mut report = SinkReport::default();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(sql)?;
            for record in records {
                let fp = record.fingerprint.clone().unwrap_or_else(|| fingerprint(record));
                let payload = match serde_json::to_string(record) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("sqlite: cannot encode {}: {}", fp, e);
                        report.failed += 1;
                        continue;
                    }
                };
                let result = stmt.execute(rusqlite::params![
                    fp.as_str(),
                    record.text(keys::NAME),
                    primary_phone(record),
                    record.text(keys::WEBSITE),
                    payload,
                ]);
                match result {
                    Ok(_) => report.written += 1,
                    Err(e) => {
                        warn!("sqlite: row {} failed: {}", fp, e);
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }
}

fn primary_phone(record: &Record) -> Option<String> {
    match record.get(keys::PHONE_NUMBERS) {
        Some(Value::Array(items)) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        Some(Value::String(s)) => Some(s.clone()),
        _ => record.text(keys::PHONE).map(str::to_string),
    }
}
