//! # band-fetch
//!
//! Single-band raster acquisition from remote GeoTIFF / Cloud-Optimized
//! GeoTIFF sources.
//!
//! This crate reads one band of a raster over HTTP(S) range requests (or from
//! a local file) and hands it back as an in-memory array together with its
//! georeferencing:
//! - Connections are bounded by a connect timeout and an overall deadline
//! - Only TIFF resources are fetched; other extensions are rejected up front
//! - Rasters larger than a configured dimension cap are downsampled with a
//!   bilinear kernel, reading from a reduced-resolution level when the file
//!   carries one
//! - The geotransform is rescaled so a downsampled band still covers the
//!   original geographic extent
//!
//! ## Overview
//!
//! ### Band reads
//!
//! [`read_band`] performs one attempt. Transient transport failures (dropped
//! connections, HTTP 5xx, 429) are retried inside the attempt with a fixed
//! delay, configured by [`TransportConfig`].
//!
//! ### Attempt-level retries
//!
//! [`read_band_with_retry`] wraps whole attempts. After failed attempt `i` it
//! waits `2^i` seconds; once `max_retries` attempts have failed the last error
//! is returned inside [`FetchError::RetriesExhausted`].
//!
//! ## Examples
//!
//! ```no_run
//! use band_fetch::{read_band_with_retry, FetchConfig, RasterSource};
//!
//! let source = RasterSource::new("https://example.com/scenes/T10TET_B04.tif")?;
//! let config = FetchConfig::default().with_max_dimension(1024);
//!
//! let band = read_band_with_retry(&source, &config)?;
//! println!("{}x{} pixels", band.width(), band.height());
//! println!("Origin: ({}, {})", band.geo_transform.origin_x, band.geo_transform.origin_y);
//! # Ok::<(), band_fetch::FetchError>(())
//! ```
//!
//! ### Probing metadata
//!
//! ```no_run
//! use band_fetch::{probe, FetchConfig, RasterSource};
//!
//! let info = probe(&RasterSource::from_path("scene.tif"), &FetchConfig::default())?;
//! println!("{}x{}, {} band(s), {} overview(s)", info.width, info.height, info.band_count, info.overviews.len());
//! # Ok::<(), band_fetch::FetchError>(())
//! ```

mod band;
mod chunk;
mod config;
mod cursor;
mod error;
mod geotransform;
mod pixels;
mod range_reader;
mod reader;
mod resample;
mod retry;
mod source;

pub use band::{RasterBand, RasterInfo};
pub use config::{
    FetchConfig, TransportConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_DIMENSION, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT_SECS,
};
pub use cursor::{RangeCursor, TransferStats};
pub use error::FetchError;
pub use geotransform::GeoTransform;
pub use pixels::{BandPixels, Sample, SampleType};
pub use range_reader::{create_range_reader, Deadline, HttpRangeReader, LocalRangeReader, RangeReader};
pub use reader::{probe, read_band, BandRead, RemoteBandReader};
pub use resample::{plan_downsample, resample_bilinear, DownsamplePlan};
pub use retry::{backoff_delay, read_band_with_retry, RetryingFetcher, Sleep, ThreadSleep};
pub use source::RasterSource;

/// Result type for raster fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
