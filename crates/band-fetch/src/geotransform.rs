//! Affine pixel-to-geographic transform.

use serde::{Deserialize, Serialize};

/// GeoTIFF `ModelPixelScaleTag`.
pub const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
/// GeoTIFF `ModelTiepointTag`.
pub const TAG_MODEL_TIEPOINT: u16 = 33922;
/// GeoTIFF `ModelTransformationTag`.
pub const TAG_MODEL_TRANSFORMATION: u16 = 34264;

/// Six-coefficient affine transform in GDAL order.
///
/// A pixel at `(col, row)` maps to
/// `x = origin_x + col * pixel_width + row * rotation_x` and
/// `y = origin_y + col * rotation_y + row * pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X coordinate of the top-left corner of the top-left pixel.
    pub origin_x: f64,
    /// Pixel size along X.
    pub pixel_width: f64,
    /// Row contribution to X.
    pub rotation_x: f64,
    /// Y coordinate of the top-left corner of the top-left pixel.
    pub origin_y: f64,
    /// Column contribution to Y.
    pub rotation_y: f64,
    /// Pixel size along Y (negative for north-up rasters).
    pub pixel_height: f64,
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl GeoTransform {
    /// Pixel coordinates used directly as geographic coordinates.
    pub const IDENTITY: GeoTransform = GeoTransform {
        origin_x: 0.0,
        pixel_width: 1.0,
        rotation_x: 0.0,
        origin_y: 0.0,
        rotation_y: 0.0,
        pixel_height: 1.0,
    };

    /// Build from GDAL-ordered coefficients.
    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            rotation_x: c[2],
            origin_y: c[3],
            rotation_y: c[4],
            pixel_height: c[5],
        }
    }

    /// Coefficients in GDAL order.
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.rotation_x,
            self.origin_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Build from a 4x4 row-major `ModelTransformationTag` matrix.
    pub fn from_model_transformation(m: &[f64]) -> Option<Self> {
        if m.len() < 16 {
            return None;
        }
        Some(Self::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]))
    }

    /// Build from `ModelTiepointTag` and `ModelPixelScaleTag`.
    ///
    /// The tiepoint `(i, j, k, x, y, z)` pins raster position `(i, j)` to
    /// model position `(x, y)`; the scale is positive downwards in raster
    /// space, so the Y step is negated.
    pub fn from_tiepoint(tiepoint: &[f64], pixel_scale: &[f64]) -> Option<Self> {
        if tiepoint.len() < 6 || pixel_scale.len() < 2 {
            return None;
        }
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        let (sx, sy) = (pixel_scale[0], pixel_scale[1]);
        Some(Self {
            origin_x: x - i * sx,
            pixel_width: sx,
            rotation_x: 0.0,
            origin_y: y + j * sy,
            rotation_y: 0.0,
            pixel_height: -sy,
        })
    }

    /// Map a pixel position to geographic coordinates.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.rotation_x,
            self.origin_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Geographic coordinates of the four outer corners of a
    /// `width x height` raster: top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self, width: u32, height: u32) -> [(f64, f64); 4] {
        let (w, h) = (f64::from(width), f64::from(height));
        [self.apply(0.0, 0.0), self.apply(w, 0.0), self.apply(w, h), self.apply(0.0, h)]
    }

    /// Transform for the same extent covered by pixels that are
    /// `col_factor` times wider and `row_factor` times taller.
    ///
    /// The origin is unchanged. Each column term is multiplied by
    /// `col_factor` and each row term by `row_factor`, so rotation terms,
    /// which are zero for north-up rasters, keep the corners fixed too.
    pub fn scaled(&self, col_factor: f64, row_factor: f64) -> Self {
        Self {
            origin_x: self.origin_x,
            pixel_width: self.pixel_width * col_factor,
            rotation_x: self.rotation_x * row_factor,
            origin_y: self.origin_y,
            rotation_y: self.rotation_y * col_factor,
            pixel_height: self.pixel_height * row_factor,
        }
    }
}
