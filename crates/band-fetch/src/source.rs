//! Raster resource locators.

use crate::{FetchError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Where the bytes of a raster live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    /// Remote resource read with HTTP range requests.
    Http(Url),
    /// Local file read with seek + read.
    File(PathBuf),
}

/// A raster resource identified by its locator.
///
/// Accepts `http://`, `https://` and `file://` URLs as well as bare
/// filesystem paths. Native dimensions are unknown until the resource is
/// opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterSource {
    url: String,
    location: Location,
}

impl RasterSource {
    /// Parse a locator.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let location = if url.starts_with("http://") || url.starts_with("https://") {
            let parsed = Url::parse(&url)
                .map_err(|e| FetchError::InvalidSource(format!("{}: {e}", redact(&url))))?;
            if parsed.host_str().is_none() {
                return Err(FetchError::InvalidSource(format!("missing host in {}", redact(&url))));
            }
            Location::Http(parsed)
        } else if url.starts_with("file://") {
            let path = Url::parse(&url)
                .ok()
                .and_then(|parsed| parsed.to_file_path().ok())
                .ok_or_else(|| FetchError::InvalidSource(format!("bad file URL: {url}")))?;
            Location::File(path)
        } else if url.contains("://") {
            return Err(FetchError::InvalidSource(format!("unsupported scheme: {}", redact(&url))));
        } else if url.is_empty() {
            return Err(FetchError::InvalidSource("empty locator".into()));
        } else {
            Location::File(PathBuf::from(&url))
        };

        Ok(Self { url, location })
    }

    /// Build a source from a local path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            url: path.display().to_string(),
            location: Location::File(path),
        }
    }

    /// The locator exactly as supplied.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// True when the resource is fetched over HTTP(S).
    pub fn is_remote(&self) -> bool {
        matches!(self.location, Location::Http(_))
    }

    /// The locator with any query string removed, safe to log.
    ///
    /// Signed URLs carry their access token in the query string.
    pub fn redacted(&self) -> String {
        redact(&self.url)
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }

    /// Check the resource path against the allowed extensions.
    ///
    /// Comparison is case-insensitive and ignores the query string.
    pub fn check_extension(&self, allowed: &[String]) -> Result<()> {
        let path = match &self.location {
            Location::Http(url) => url.path().to_ascii_lowercase(),
            Location::File(path) => path.to_string_lossy().to_ascii_lowercase(),
        };
        let matches = allowed.iter().any(|ext| {
            let ext = ext.to_ascii_lowercase();
            let ext = if ext.starts_with('.') { ext } else { format!(".{ext}") };
            path.ends_with(&ext)
        });
        if matches {
            Ok(())
        } else {
            Err(FetchError::InvalidSource(format!(
                "{} does not have an allowed extension ({})",
                self.redacted(),
                allowed.join(",")
            )))
        }
    }
}

impl fmt::Display for RasterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn redact(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_string()
}
