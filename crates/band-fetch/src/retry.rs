//! Attempt-level retries with exponential backoff.
//!
//! Every failure kind is retried the same way: a malformed URL consumes an
//! attempt just like a dropped connection. Backoff depends only on the
//! attempt index.

use crate::band::RasterBand;
use crate::reader::{BandRead, RemoteBandReader};
use crate::{FetchConfig, FetchError, RasterSource, Result};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Delay after failed attempt `attempt` (1-based): `2^attempt` seconds.
///
/// Saturates rather than overflowing for very large indices.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
}

/// Pauses the calling thread between attempts.
pub trait Sleep {
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Parks the current thread with [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A failed attempt, kept only inside the retry loop.
#[derive(Debug)]
struct AttemptFailure {
    attempt: u32,
    elapsed: Duration,
    error: FetchError,
}

type AttemptOutcome = std::result::Result<RasterBand, AttemptFailure>;

/// Runs a [`BandRead`] up to `max_retries` times.
#[derive(Debug, Clone, Default)]
pub struct RetryingFetcher<R = RemoteBandReader, S = ThreadSleep> {
    reader: R,
    sleeper: S,
}

impl RetryingFetcher {
    /// Fetcher over the remote band reader, sleeping the current thread.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: BandRead, S: Sleep> RetryingFetcher<R, S> {
    /// Fetcher over a custom reader and sleeper.
    pub fn with_parts(reader: R, sleeper: S) -> Self {
        Self { reader, sleeper }
    }

    /// The wrapped reader.
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Read a band, retrying failed attempts with exponential backoff.
    ///
    /// Attempts run strictly one after another. The first success is
    /// returned immediately. After `config.max_retries` failures the last
    /// error is returned wrapped in [`FetchError::RetriesExhausted`]. An
    /// invalid configuration is rejected before any attempt.
    pub fn read_band_with_retry(&self, source: &RasterSource, config: &FetchConfig) -> Result<RasterBand> {
        config.validate()?;
        let max_retries = config.max_retries;

        let mut attempt = 1;
        loop {
            let failure = match self.attempt(source, config, attempt) {
                Ok(band) => {
                    if attempt > 1 {
                        info!(url = %source, attempt, "Fetch succeeded after retry");
                    }
                    return Ok(band);
                }
                Err(failure) => failure,
            };

            if failure.attempt >= max_retries {
                error!(
                    url = %source,
                    attempts = failure.attempt,
                    error = %failure.error,
                    "All fetch attempts failed"
                );
                return Err(FetchError::RetriesExhausted {
                    attempts: failure.attempt,
                    last: Box::new(failure.error),
                });
            }

            let delay = backoff_delay(failure.attempt);
            warn!(
                url = %source,
                attempt = failure.attempt,
                max_retries,
                elapsed_secs = failure.elapsed.as_secs_f64(),
                delay_secs = delay.as_secs(),
                error = %failure.error,
                "Fetch attempt failed, retrying"
            );
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }

    fn attempt(&self, source: &RasterSource, config: &FetchConfig, attempt: u32) -> AttemptOutcome {
        let started = Instant::now();
        self.reader.read_band(source, config).map_err(|error| AttemptFailure {
            attempt,
            elapsed: started.elapsed(),
            error,
        })
    }
}

/// Read one band of `source`, retrying up to `config.max_retries` attempts.
pub fn read_band_with_retry(source: &RasterSource, config: &FetchConfig) -> Result<RasterBand> {
    RetryingFetcher::new().read_band_with_retry(source, config)
}
