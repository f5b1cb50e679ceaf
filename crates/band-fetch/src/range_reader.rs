//! Byte-range access to raster resources.
//!
//! GeoTIFFs are laid out so a reader can parse the header and fetch only the
//! strips or tiles it needs. This module provides that access for local files
//! and for HTTP(S) servers that honour `Range` requests.

use crate::source::Location;
use crate::{FetchConfig, FetchError, RasterSource, Result, TransportConfig};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Statuses worth repeating a single request for.
const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Reads byte ranges from a raster resource.
pub trait RangeReader: Send {
    /// Read `length` bytes starting at `offset`.
    fn read_range(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Human-readable identifier for logs and errors.
    fn identifier(&self) -> &str;
}

/// Overall time budget of one attempt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    /// Start the clock now.
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Time since the attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    /// Fail with [`FetchError::Timeout`] once the budget is spent.
    pub fn check(&self, url: &str) -> Result<()> {
        let elapsed = self.elapsed();
        if elapsed >= self.limit {
            return Err(self.timeout_error(url, elapsed));
        }
        Ok(())
    }

    fn timeout_error(&self, url: &str, elapsed: Duration) -> FetchError {
        FetchError::Timeout {
            url: url.to_string(),
            elapsed,
            limit: self.limit,
        }
    }
}

/// Local file range reader.
pub struct LocalRangeReader {
    path: PathBuf,
    identifier: String,
    file: File,
    size: u64,
}

impl LocalRangeReader {
    /// Open a local file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            identifier: path.display().to_string(),
            path,
            file,
            size,
        })
    }

    /// Path of the opened file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl RangeReader for LocalRangeReader {
    fn read_range(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// HTTP range reader for remote rasters.
///
/// Every request carries the time remaining on the attempt's [`Deadline`] as
/// its timeout. Connection failures, broken transfers and 429/5xx responses
/// are repeated up to `transport.max_retries` times before surfacing.
pub struct HttpRangeReader {
    url: url::Url,
    identifier: String,
    client: Client,
    transport: TransportConfig,
    deadline: Deadline,
    size: u64,
}

impl HttpRangeReader {
    /// Connect to `url` and discover the resource size.
    pub fn open(url: url::Url, identifier: String, config: &FetchConfig, deadline: Deadline) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.timeout())
            .user_agent(concat!("band-fetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Connection {
                url: identifier.clone(),
                reason: e.to_string(),
            })?;

        let mut reader = Self {
            url,
            identifier,
            client,
            transport: config.transport.clone(),
            deadline,
            size: 0,
        };
        reader.size = reader.discover_size()?;
        debug!(url = %reader.identifier, size = reader.size, "Connected to remote raster");
        Ok(reader)
    }

    /// Size from `Content-Length` of a HEAD, or the total in the
    /// `Content-Range` of a one-byte GET when HEAD does not report it.
    fn discover_size(&self) -> Result<u64> {
        let head = self.with_transport_retry(|| {
            let response = self.send(self.client.head(self.url.clone()))?;
            Ok(header_u64(&response, CONTENT_LENGTH))
        });
        match head {
            Ok(Some(size)) => return Ok(size),
            // Some object stores refuse HEAD on signed URLs; fall back to GET.
            Ok(None) | Err(FetchError::Http { .. }) => {}
            Err(err) => return Err(err),
        }

        let total = self.with_transport_retry(|| {
            let response = self.send(self.client.get(self.url.clone()).header(RANGE, "bytes=0-0"))?;
            Ok(response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse().ok()))
        })?;
        total.ok_or_else(|| FetchError::RangeNotSupported {
            url: self.identifier.clone(),
        })
    }

    /// Send a request with the remaining deadline and check its status.
    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Response> {
        self.deadline.check(&self.identifier)?;
        let response = request
            .timeout(self.deadline.remaining())
            .send()
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: self.identifier.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_connect() {
            FetchError::Connection {
                url: self.identifier.clone(),
                reason: err.to_string(),
            }
        } else if err.is_timeout() {
            self.deadline.timeout_error(&self.identifier, self.deadline.elapsed())
        } else if err.is_body() || err.is_decode() {
            FetchError::Transfer {
                url: self.identifier.clone(),
                reason: err.to_string(),
            }
        } else {
            FetchError::Connection {
                url: self.identifier.clone(),
                reason: err.to_string(),
            }
        }
    }

    fn with_transport_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if retries < self.transport.max_retries && is_transient(&err) => {
                    retries += 1;
                    debug!(
                        url = %self.identifier,
                        retry = retries,
                        max_retries = self.transport.max_retries,
                        error = %err,
                        "Transport error, repeating request"
                    );
                    std::thread::sleep(self.transport.retry_delay().min(self.deadline.remaining()));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl RangeReader for HttpRangeReader {
    fn read_range(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let range = format!("bytes={}-{}", offset, offset + length as u64 - 1);
        debug!(url = %self.identifier, %range, "Range request");

        self.with_transport_retry(|| {
            let response = self.send(self.client.get(self.url.clone()).header(RANGE, range.as_str()))?;
            // A 200 is only acceptable when it declares exactly the range;
            // anything else is rejected before the body is downloaded.
            if response.status() != StatusCode::PARTIAL_CONTENT && response.content_length() != Some(length as u64) {
                warn!(
                    url = %self.identifier,
                    status = response.status().as_u16(),
                    content_length = ?response.content_length(),
                    "Server ignored range request"
                );
                return Err(FetchError::RangeNotSupported {
                    url: self.identifier.clone(),
                });
            }

            let body = response.bytes().map_err(|e| self.classify(e))?;
            if body.len() != length {
                return Err(FetchError::Transfer {
                    url: self.identifier.clone(),
                    reason: format!("expected {} bytes, received {}", length, body.len()),
                });
            }
            Ok(body.to_vec())
        })
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_transient(err: &FetchError) -> bool {
    match err {
        FetchError::Connection { .. } | FetchError::Transfer { .. } => true,
        FetchError::Http { status, .. } => TRANSIENT_STATUSES.contains(status),
        _ => false,
    }
}

/// Open a range reader for `source`.
///
/// Only the exact locator is ever touched: its extension must be one of
/// `transport.allowed_extensions`, and no sidecar or directory probing
/// happens.
pub fn create_range_reader(
    source: &RasterSource,
    config: &FetchConfig,
    deadline: Deadline,
) -> Result<Box<dyn RangeReader>> {
    source.check_extension(&config.transport.allowed_extensions)?;
    match source.location() {
        Location::Http(url) => Ok(Box::new(HttpRangeReader::open(
            url.clone(),
            source.redacted(),
            config,
            deadline,
        )?)),
        Location::File(path) => Ok(Box::new(LocalRangeReader::open(path.clone())?)),
    }
}
