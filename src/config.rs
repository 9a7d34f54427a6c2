//! Profiler configuration: defaults, optional JSON file, environment overrides.
//!
//! - `ENERGY_PROFILER_CONFIG=/path/to/config.json` loads a file (missing file is ignored).
//! - `ENERGY_PROFILER_DB`, `ENERGY_PROFILER_INTERVAL_MS`, `ENERGY_PROFILER_DEPTH` override single fields.

use crate::errors::ProfilerError;
use crate::instrument::{OperationStrategy, ProfilingDepth};
use crate::power::RecordFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by the power monitor, instrumentation and store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Power sampling period in milliseconds.
    pub sample_interval_ms: u64,
    /// Power samples the monitor holds between session polls; oldest are evicted
    /// beyond this.
    pub sample_buffer_capacity: usize,
    pub depth: ProfilingDepth,
    pub operation_strategy: OperationStrategy,
    /// Compute activation statistics on component outputs.
    pub capture_activations: bool,
    /// Magnitude below which an activation counts as zero.
    pub sparsity_threshold: f32,
    /// Bounded capacity of channel-backed event sinks.
    pub event_channel_capacity: usize,
    /// Idle power measured before the run starts (none = skip).
    pub idle_baseline_ms: Option<u64>,
    pub database_path: PathBuf,
    /// Program used to launch the sampler (`sudo` for powermetrics).
    pub power_command: String,
    pub power_format: RecordFormat,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            sample_buffer_capacity: 36_000,
            depth: ProfilingDepth::Module,
            operation_strategy: OperationStrategy::Interception,
            capture_activations: true,
            sparsity_threshold: 1e-4,
            event_channel_capacity: 1024,
            idle_baseline_ms: None,
            database_path: PathBuf::from("energy_profiles.db"),
            power_command: "sudo".to_string(),
            power_format: RecordFormat::Plist,
        }
    }
}

impl ProfilerConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    /// Load a config file. Fields absent from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProfilerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ProfilerConfig = serde_json::from_str(&content).map_err(|e| {
            ProfilerError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `ENERGY_PROFILER_CONFIG` if the file exists, then single-field overrides.
    pub fn load() -> Result<Self, ProfilerError> {
        let mut config = match std::env::var("ENERGY_PROFILER_CONFIG") {
            Ok(path) if Path::new(&path).exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `ENERGY_PROFILER_*` single-field overrides.
    pub fn apply_env(&mut self) -> Result<(), ProfilerError> {
        if let Ok(db) = std::env::var("ENERGY_PROFILER_DB") {
            if !db.is_empty() {
                self.database_path = PathBuf::from(db);
            }
        }
        if let Ok(ms) = std::env::var("ENERGY_PROFILER_INTERVAL_MS") {
            self.sample_interval_ms = ms
                .trim()
                .parse()
                .map_err(|_| ProfilerError::Config(format!("bad ENERGY_PROFILER_INTERVAL_MS: {ms}")))?;
        }
        if let Ok(depth) = std::env::var("ENERGY_PROFILER_DEPTH") {
            self.depth = ProfilingDepth::from_str(&depth).map_err(ProfilerError::Config)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ProfilerError> {
        if self.sample_interval_ms == 0 {
            return Err(ProfilerError::Config(
                "sample_interval_ms must be positive".to_string(),
            ));
        }
        if self.sample_buffer_capacity == 0 {
            return Err(ProfilerError::Config(
                "sample_buffer_capacity must be positive".to_string(),
            ));
        }
        if !(self.sparsity_threshold >= 0.0) {
            return Err(ProfilerError::Config(
                "sparsity_threshold must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = ProfilerConfig::default();
        assert_eq!(c.sample_interval_ms, 100);
        assert_eq!(c.depth, ProfilingDepth::Module);
        c.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sample_interval_ms": 250, "depth": "operation"}"#).unwrap();
        let c = ProfilerConfig::from_file(&path).unwrap();
        assert_eq!(c.sample_interval_ms, 250);
        assert_eq!(c.depth, ProfilingDepth::Operation);
        assert_eq!(c.sample_buffer_capacity, 36_000);
    }

    #[test]
    fn zero_interval_rejected() {
        let c = ProfilerConfig {
            sample_interval_ms: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ProfilerConfig::from_file(&path).is_err());
    }
}
