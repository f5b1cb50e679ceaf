//! `Read + Seek` view over a [`RangeReader`].
//!
//! The TIFF decoder expects a seekable stream. The cursor turns each read into
//! a ranged fetch, keeping one read-ahead window so the many small reads of
//! header parsing collapse into a handful of requests.

use crate::range_reader::{Deadline, RangeReader};
use crate::{FetchError, Result};
use std::io::{self, Read, Seek, SeekFrom};
use tracing::debug;

/// Totals reported when a cursor is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes received from the underlying reader.
    pub bytes_transferred: u64,
    /// Range requests issued.
    pub requests: u64,
}

/// Seekable stream over a range reader.
pub struct RangeCursor {
    reader: Box<dyn RangeReader>,
    deadline: Deadline,
    read_ahead: usize,
    position: u64,
    window_start: u64,
    window: Vec<u8>,
    stats: TransferStats,
}

impl RangeCursor {
    /// Wrap `reader`, fetching at least `read_ahead` bytes per request.
    pub fn new(reader: Box<dyn RangeReader>, deadline: Deadline, read_ahead: usize) -> Self {
        Self {
            reader,
            deadline,
            read_ahead: read_ahead.max(1),
            position: 0,
            window_start: 0,
            window: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// Total size of the underlying resource.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Identifier of the underlying resource.
    pub fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    /// Transfer totals so far.
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Release the connection and report what was transferred.
    pub fn close(self) -> TransferStats {
        debug!(
            url = %self.reader.identifier(),
            bytes = self.stats.bytes_transferred,
            requests = self.stats.requests,
            "Closed raster session"
        );
        self.stats
    }

    /// Read exactly `length` bytes at `offset`.
    ///
    /// Served from the read-ahead window when it already holds the whole
    /// range, otherwise fetched in one request that leaves the window alone.
    pub fn read_exact_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= self.size())
            .ok_or_else(|| {
                FetchError::Decode(format!(
                    "range {offset}+{length} runs past the end of {} ({} bytes)",
                    self.identifier(),
                    self.size()
                ))
            })?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let window_end = self.window_start + self.window.len() as u64;
        let bytes = if self.window_contains(offset) && end <= window_end {
            let start = (offset - self.window_start) as usize;
            self.window[start..start + length].to_vec()
        } else {
            self.position = offset;
            self.fetch(length)?
        };
        if bytes.len() != length {
            return Err(FetchError::Decode(format!(
                "expected {length} bytes at offset {offset}, got {}",
                bytes.len()
            )));
        }
        self.position = end;
        Ok(bytes)
    }

    fn window_contains(&self, position: u64) -> bool {
        position >= self.window_start && position < self.window_start + self.window.len() as u64
    }

    fn fetch(&mut self, length: usize) -> Result<Vec<u8>> {
        self.deadline.check(self.reader.identifier())?;
        let bytes = self.reader.read_range(self.position, length)?;
        self.stats.bytes_transferred += bytes.len() as u64;
        self.stats.requests += 1;
        Ok(bytes)
    }
}

impl Read for RangeCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size();
        if buf.is_empty() || self.position >= size {
            return Ok(0);
        }
        let remaining = (size - self.position).min(usize::MAX as u64) as usize;

        if !self.window_contains(self.position) {
            // Large reads (whole strips or tiles) bypass the window.
            if buf.len() >= self.read_ahead {
                let length = buf.len().min(remaining);
                let bytes = self.fetch(length)?;
                buf[..bytes.len()].copy_from_slice(&bytes);
                self.position += bytes.len() as u64;
                return Ok(bytes.len());
            }

            let length = self.read_ahead.min(remaining);
            self.window = self.fetch(length)?;
            self.window_start = self.position;
        }

        let offset = (self.position - self.window_start) as usize;
        let available = &self.window[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RangeCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
