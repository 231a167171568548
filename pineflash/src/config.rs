use crate::Error;
use serde::Deserialize;
use std::{fs::read_to_string, path::Path, time::Duration};

pub const DEFAULT_BAUD_RATE: usize = 115200;
pub const DEFAULT_RW_RETRY: usize = 3;
pub const DEFAULT_CMD_RETRY: usize = 5;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 200;

/// Session settings, applied once when the connection is created.
///
/// ```toml
/// baud_rate = 115200
/// rw_retry = 3
/// cmd_retry = 5
/// read_buffer_size = 256
/// read_timeout_ms = 200
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub baud_rate: usize,
    /// Attempts per raw write or read.
    pub rw_retry: usize,
    /// Attempts per write-read-validate exchange.
    pub cmd_retry: usize,
    /// Read buffer capacity. Only ever grows past the default.
    pub read_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            baud_rate: DEFAULT_BAUD_RATE,
            rw_retry: DEFAULT_RW_RETRY,
            cmd_retry: DEFAULT_CMD_RETRY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(content)?;
        Ok(config.normalized())
    }

    /// Clamps the retry budgets to at least one attempt and never lets the
    /// read buffer shrink below the default capacity.
    pub fn normalized(mut self) -> Self {
        self.rw_retry = self.rw_retry.max(1);
        self.cmd_retry = self.cmd_retry.max(1);
        self.read_buffer_size = self.read_buffer_size.max(DEFAULT_READ_BUFFER_SIZE);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
