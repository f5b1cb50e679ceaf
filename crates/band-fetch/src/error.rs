//! Error types for band acquisition.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching a raster band.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The resource was unreachable or the connection was refused.
    #[error("Connection to {url} failed: {reason}")]
    Connection {
        /// Redacted locator.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// The attempt ran past its overall deadline.
    #[error("Reading {url} timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        /// Redacted locator.
        url: String,
        /// Time spent before the deadline tripped.
        elapsed: Duration,
        /// Configured deadline.
        limit: Duration,
    },

    /// The payload is not a readable raster.
    #[error("Raster decode error: {0}")]
    Decode(String),

    /// TIFF decoding error.
    #[error("TIFF decode error: {0}")]
    Tiff(#[source] tiff::TiffError),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Http {
        /// Redacted locator.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The body transfer failed after the connection was established.
    #[error("Transfer from {url} failed: {reason}")]
    Transfer {
        /// Redacted locator.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// The server ignored a byte-range request.
    #[error("Server for {url} does not honour byte-range requests")]
    RangeNotSupported {
        /// Redacted locator.
        url: String,
    },

    /// I/O error reading a local file.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// The locator cannot be used.
    #[error("Invalid raster source: {0}")]
    InvalidSource(String),

    /// The fetch configuration violates an invariant.
    #[error("Invalid fetch configuration: {0}")]
    InvalidConfig(String),

    /// Every attempt failed.
    #[error("All {attempts} attempts failed: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// True for [`FetchError::Connection`], looking through exhausted retries.
    pub fn is_connection(&self) -> bool {
        matches!(self.root_cause(), FetchError::Connection { .. })
    }

    /// True for [`FetchError::Timeout`], looking through exhausted retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), FetchError::Timeout { .. })
    }

    /// True when the payload was reachable but not a valid raster.
    pub fn is_decode(&self) -> bool {
        matches!(self.root_cause(), FetchError::Decode(_) | FetchError::Tiff(_))
    }

    /// True for any failure to open, read or decode the resource.
    ///
    /// Timeouts, configuration errors and exhausted retries are not raster I/O
    /// errors themselves, though the latter may wrap one.
    pub fn is_raster_io(&self) -> bool {
        !matches!(
            self,
            FetchError::Timeout { .. } | FetchError::InvalidConfig(_) | FetchError::RetriesExhausted { .. }
        )
    }

    /// The error that ended the final attempt.
    pub fn root_cause(&self) -> &FetchError {
        match self {
            FetchError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

/// Unwraps a `FetchError` that was tunnelled through `std::io::Error` by the
/// range cursor, so deadline and connection failures keep their identity
/// after passing through the TIFF decoder.
impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<FetchError>()) {
            return FetchError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<FetchError>()) {
            Some(Ok(fetch)) => *fetch,
            Some(Err(other)) => FetchError::Io(io::Error::new(kind, other)),
            None => FetchError::Io(io::Error::from(kind)),
        }
    }
}

impl From<tiff::TiffError> for FetchError {
    fn from(err: tiff::TiffError) -> Self {
        match err {
            tiff::TiffError::IoError(io) => FetchError::from(io),
            other => FetchError::Tiff(other),
        }
    }
}

impl From<FetchError> for io::Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Io(io) => io,
            other => io::Error::other(other),
        }
    }
}
