use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HarvestError, Result};

/// Top-level configuration, passed explicitly to every component.
///
/// Every section has defaults, so an empty file (or none at all) is valid.
/// Environment overrides use the `HARVEST` prefix with `__` between
/// levels, e.g. `HARVEST__BATCH__SIZE=25`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Root for checkpoints, final outputs and the sqlite sink.
    pub output_dir: PathBuf,
    /// Run scope; checkpoints of the same run are resumed.
    pub run_name: String,
    /// Stop after this many newly accepted records.
    pub max_records: Option<usize>,
    /// Draw a progress spinner on stderr.
    pub show_progress: bool,
    pub batch: BatchConfig,
    pub queue: QueueConfig,
    pub rate: RateConfig,
    pub dedup: DedupConfig,
    pub interrupt: InterruptConfig,
    pub sinks: SinkConfig,
    pub convert: ConvertConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            run_name: "businesses".to_string(),
            max_records: None,
            show_progress: true,
            batch: BatchConfig::default(),
            queue: QueueConfig::default(),
            rate: RateConfig::default(),
            dedup: DedupConfig::default(),
            interrupt: InterruptConfig::default(),
            sinks: SinkConfig::default(),
            convert: ConvertConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Defaults, then the optional TOML file, then `HARVEST__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("harvest").required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("HARVEST").separator("__"))
            .build()
            .map_err(|e| HarvestError::Configuration(e.to_string()))?;
        let config: HarvestConfig = settings
            .try_deserialize()
            .map_err(|e| HarvestError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_name.trim().is_empty() {
            return Err(HarvestError::Configuration("run_name must not be empty".into()));
        }
        if self.run_name.contains(['/', '\\']) {
            return Err(HarvestError::Configuration(format!(
                "run_name '{}' must not contain path separators",
                self.run_name
            )));
        }
        if self.batch.size == 0 {
            return Err(HarvestError::Configuration("batch.size must be at least 1".into()));
        }
        if self.rate.min_rate <= 0.0 || self.rate.min_rate > self.rate.max_rate {
            return Err(HarvestError::Configuration(format!(
                "rate bounds invalid: min_rate {} max_rate {}",
                self.rate.min_rate, self.rate.max_rate
            )));
        }
        if self.rate.min_delay_secs > self.rate.max_delay_secs {
            return Err(HarvestError::Configuration(format!(
                "delay bounds invalid: min_delay_secs {} max_delay_secs {}",
                self.rate.min_delay_secs, self.rate.max_delay_secs
            )));
        }
        Ok(())
    }

    pub fn checkpoint_root(&self) -> PathBuf {
        self.output_dir.join("checkpoints")
    }

    pub fn final_dir(&self) -> PathBuf {
        self.output_dir.join("final")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.output_dir.join("sqlite").join(format!("{}.sqlite", self.run_name))
    }
}

/// Flush policy of the persistence worker.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per checkpoint before a size-triggered flush.
    pub size: usize,
    /// Max age of the oldest unflushed record.
    pub flush_interval_ms: u64,
    /// Attempts for one batch before it is dropped.
    pub max_attempts: u32,
    /// Upper bound on how long `flush()` waits for the worker.
    pub shutdown_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 10,
            flush_interval_ms: 5_000,
            max_attempts: 2,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard ceiling on queued records; `enqueue` waits when reached.
    pub max_depth: Option<usize>,
}

/// Adaptive pacing of outbound activity.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Starting allowance, requests per window.
    pub requests_per_minute: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub window_secs: u64,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter: bool,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30.0,
            min_rate: 5.0,
            max_rate: 30.0,
            window_secs: 60,
            min_delay_secs: 1.0,
            max_delay_secs: 5.0,
            jitter: true,
        }
    }
}

impl RateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Entities whose merged record is kept for later merges.
    pub merge_cache_capacity: usize,
    /// Max entries kept in a merged list field.
    pub list_cap: usize,
    /// Send merged duplicates to the secondary sinks as updates.
    pub reemit_merged: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            merge_cache_capacity: 1024,
            list_cap: 10,
            reemit_merged: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Window after a first interrupt in which a second one forces shutdown.
    pub grace_window_ms: u64,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: 2_000,
        }
    }
}

impl InterruptConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Mirror persisted records into `<output_dir>/sqlite/<run>.sqlite`.
    pub sqlite: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
    Summary,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    pub formats: Vec<OutputFormat>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Json, OutputFormat::Csv, OutputFormat::Summary],
        }
    }
}
