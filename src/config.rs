//! Configuration file support
//!
//! Settings are read from an optional TOML file. Every field has a default,
//! and command-line flags override whatever the file provides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dbgscope_agent::AGENT_PORT;

/// Default ring capacity for buffered lines (1 MiB)
const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Host running the DebugView agent
    pub host: Option<String>,

    /// Agent TCP port
    pub port: u16,

    /// Requested line buffer size in bytes
    pub buffer_size: usize,

    /// How long the reader waits for the printer before dropping a line
    pub producer_timeout_ms: u64,

    /// Printer wake-up interval when no lines arrive
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: AGENT_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            producer_timeout_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
