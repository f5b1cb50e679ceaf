//! Per-call fetch configuration.

use crate::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default overall deadline for one attempt.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default connection deadline.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default cap on the returned width and height.
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

/// Default number of attempts made by the retrying fetcher.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Parameters governing one band read.
///
/// Every call receives its own configuration; nothing is read from the
/// process environment, so concurrent fetches with different deadlines do not
/// interfere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Connection plus read deadline for one attempt, in seconds.
    pub timeout_seconds: u64,
    /// Connection deadline, in seconds.
    pub connect_timeout_seconds: u64,
    /// Inclusive upper bound on both output width and height.
    pub max_dimension: u32,
    /// Number of attempts made by the retrying fetcher.
    pub max_retries: u32,
    /// 1-based index of the band to read.
    pub band: u16,
    /// Low-level transport settings.
    pub transport: TransportConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_retries: DEFAULT_MAX_RETRIES,
            band: 1,
            transport: TransportConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Overall deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Connection deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Return a copy with a different dimension cap.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Return a copy with a different attempt budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check that every field is within range.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("timeout_seconds", self.timeout_seconds),
            ("connect_timeout_seconds", self.connect_timeout_seconds),
            ("max_dimension", u64::from(self.max_dimension)),
            ("max_retries", u64::from(self.max_retries)),
            ("band", u64::from(self.band)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(FetchError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        self.transport.validate()
    }
}

/// Settings for the connection layer beneath a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Retries of an individual range request (0 disables them).
    pub max_retries: u32,
    /// Pause between transport retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// File extensions the locator may carry, compared case-insensitively.
    pub allowed_extensions: Vec<String>,
    /// Minimum bytes fetched per range request.
    pub read_ahead_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            allowed_extensions: vec![".tif".to_string(), ".tiff".to_string()],
            read_ahead_bytes: 64 * 1024,
        }
    }
}

impl TransportConfig {
    /// Pause between transport retries as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.retry_delay_ms == 0 {
            return Err(FetchError::InvalidConfig("transport.retry_delay_ms must be positive".into()));
        }
        if self.read_ahead_bytes == 0 {
            return Err(FetchError::InvalidConfig("transport.read_ahead_bytes must be positive".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(FetchError::InvalidConfig("transport.allowed_extensions must not be empty".into()));
        }
        Ok(())
    }
}
