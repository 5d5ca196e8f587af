//! Configuration for the server-side protocol processor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Session I/O settings.
    pub session: SessionConfig,
    /// Output tuning.
    pub output: OutputConfig,
}

/// Session I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline in seconds for every blocked read or write; 0 waits forever.
    pub io_timeout_secs: u64,
}

/// Output tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Coalescing buffer for block writes, in bytes. Consecutive writes to
    /// the same block are batched into one BLOCK_DATA frame up to this size.
    pub buffer_size: usize,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: 180,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { buffer_size: 8192 }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ProcessorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.session.io_timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────
