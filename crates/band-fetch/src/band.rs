//! Results returned to callers.

use crate::geotransform::GeoTransform;
use crate::pixels::{BandPixels, SampleType};
use std::time::Duration;

/// One band read from a raster, owned by the caller.
///
/// When the native raster exceeded the dimension cap, `pixels` is the
/// downsampled array and `geo_transform` has been rescaled so the band still
/// covers the full geographic extent.
#[derive(Debug, Clone)]
pub struct RasterBand {
    /// Pixel array, `height x width`.
    pub pixels: BandPixels,
    /// Affine transform for `pixels`.
    pub geo_transform: GeoTransform,
    /// Native raster width before any downsampling.
    pub native_width: u32,
    /// Native raster height before any downsampling.
    pub native_height: u32,
    /// Number of bands in the source.
    pub band_count: u16,
    /// No-data value declared by the source, if any.
    pub no_data: Option<f64>,
    /// Size of the pixel payload in bytes.
    pub size_bytes: usize,
    /// Bytes read from the resource, headers included.
    pub bytes_transferred: u64,
    /// Reduced-resolution level the pixels came from (`None` for full resolution).
    pub overview_level: Option<usize>,
    /// Wall-clock time of the read.
    pub elapsed: Duration,
}

impl RasterBand {
    /// Output width in pixels.
    pub fn width(&self) -> usize {
        self.pixels.width()
    }

    /// Output height in pixels.
    pub fn height(&self) -> usize {
        self.pixels.height()
    }

    /// True when the output is smaller than the native raster.
    pub fn was_downsampled(&self) -> bool {
        self.width() != self.native_width as usize || self.height() != self.native_height as usize
    }
}

/// Metadata discovered without reading pixel payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    /// Native width in pixels.
    pub width: u32,
    /// Native height in pixels.
    pub height: u32,
    /// Samples per pixel.
    pub band_count: u16,
    /// Sample type of the first level.
    pub sample_type: SampleType,
    /// Dimensions of each reduced-resolution level, finest first.
    pub overviews: Vec<(u32, u32)>,
    /// Size of the resource in bytes.
    pub content_length: u64,
    /// Native transform.
    pub geo_transform: GeoTransform,
    /// Declared no-data value.
    pub no_data: Option<f64>,
}
