//! Configuration types for a recording session

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracefold_capture::{CaptureCondition, CaptureCursor, CaptureReader, FrameBody, FrameKind};

/// Metadata frame id under which the session configuration is recorded
pub const METADATA_ID: &str = "recorder";

const PAGE_SIZE: usize = 4096;

/// A child process to launch and profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Program followed by its arguments
    pub argv: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Working directory (None = inherit)
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Start from the recorder's own environment
    #[serde(default = "default_true")]
    pub inherit_environ: bool,
}

fn default_true() -> bool {
    true
}

impl SpawnConfig {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: None,
            inherit_environ: true,
        }
    }

    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
    }
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Profile every process; pids are not handed to sources
    pub whole_system: bool,

    /// Target process IDs
    pub pids: Vec<i32>,

    /// Optional child process to launch when recording starts
    pub spawn: Option<SpawnConfig>,

    /// In-memory buffer of the capture writer created on demand
    pub writer_buffer_size: usize,

    /// Period of elapsed-time notifications while running
    pub elapsed_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            whole_system: false,
            pids: Vec::new(),
            spawn: None,
            writer_buffer_size: tracefold_capture::writer::DEFAULT_BUFFER_SIZE,
            elapsed_interval_ms: 1000,
        }
    }
}

impl RecorderConfig {
    pub fn elapsed_interval(&self) -> Duration {
        Duration::from_millis(self.elapsed_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(pid) = self.pids.iter().find(|p| **p < 0) {
            anyhow::bail!("Invalid pid {}", pid);
        }

        if let Some(spawn) = &self.spawn {
            if spawn.argv.is_empty() || spawn.argv[0].is_empty() {
                anyhow::bail!("Spawn command must name a program");
            }
        }

        if self.elapsed_interval_ms == 0 {
            anyhow::bail!("Elapsed interval must be greater than 0");
        }

        if self.writer_buffer_size < PAGE_SIZE {
            anyhow::bail!("Writer buffer must be at least one page ({} bytes)", PAGE_SIZE);
        }

        Ok(())
    }

    /// Load from an optional TOML file, then apply `TRACEFOLD_*` environment
    /// overrides (e.g. `TRACEFOLD_WHOLE_SYSTEM=true`).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("whole_system", defaults.whole_system)?
            .set_default("writer_buffer_size", defaults.writer_buffer_size as i64)?
            .set_default("elapsed_interval_ms", defaults.elapsed_interval_ms as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix("TRACEFOLD").try_parsing(true))
            .build()
            .context("Failed to read recorder configuration")?
            .try_deserialize()
            .context("Failed to parse recorder configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// JSON form written into the capture's metadata
    pub fn to_metadata(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("Failed to encode recorder metadata")
    }

    /// Recover the configuration a capture was recorded with, if any
    pub fn from_capture(reader: &mut CaptureReader) -> anyhow::Result<Option<Self>> {
        reader.reset();
        let mut found: Option<String> = None;
        {
            let mut cursor = CaptureCursor::new(reader);
            cursor.add_condition(CaptureCondition::KindIn(vec![FrameKind::Metadata]));
            cursor.for_each(|frame| match &frame.body {
                FrameBody::Metadata(meta) if meta.id == METADATA_ID => {
                    found = Some(meta.metadata.clone());
                    false
                }
                _ => true,
            })?;
        }
        reader.reset();

        found
            .map(|json| serde_json::from_str(&json).context("Invalid recorder metadata"))
            .transpose()
    }
}
