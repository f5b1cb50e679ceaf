//! Typed single-band pixel arrays.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A numeric sample that can pass through bilinear resampling.
pub trait Sample: Copy + Send + Sync + 'static {
    /// Size of one encoded sample in bytes.
    const SIZE: usize;

    /// Widen to `f64`.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`, rounding and saturating for integer types.
    fn from_f64(value: f64) -> Self;

    /// Decode one sample from the first `SIZE` bytes of `bytes`.
    fn from_bytes(bytes: &[u8], little_endian: bool) -> Self;
}

macro_rules! impl_sample {
    ($($t:ty => |$v:ident| $narrow:expr),* $(,)?) => {
        $(
            impl Sample for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64($v: f64) -> Self {
                    $narrow
                }

                fn from_bytes(bytes: &[u8], little_endian: bool) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    if little_endian {
                        <$t>::from_le_bytes(raw)
                    } else {
                        <$t>::from_be_bytes(raw)
                    }
                }
            }
        )*
    };
}

// `as` saturates at the type bounds and maps NaN to zero.
impl_sample!(
    u8 => |v| v.round() as u8,
    i8 => |v| v.round() as i8,
    u16 => |v| v.round() as u16,
    i16 => |v| v.round() as i16,
    u32 => |v| v.round() as u32,
    i32 => |v| v.round() as i32,
    u64 => |v| v.round() as u64,
    i64 => |v| v.round() as i64,
    f32 => |v| v as f32,
    f64 => |v| v,
);

/// Sample type of a band, matching the source encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl SampleType {
    /// Size of one sample in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 4,
            SampleType::U64 | SampleType::I64 | SampleType::F64 => 8,
        }
    }

    /// True for floating-point samples.
    pub fn is_float(self) -> bool {
        matches!(self, SampleType::F32 | SampleType::F64)
    }
}

/// Pixels of one band as a `height x width` array.
#[derive(Debug, Clone, PartialEq)]
pub enum BandPixels {
    U8(Array2<u8>),
    I8(Array2<i8>),
    U16(Array2<u16>),
    I16(Array2<i16>),
    U32(Array2<u32>),
    I32(Array2<i32>),
    U64(Array2<u64>),
    I64(Array2<i64>),
    F32(Array2<f32>),
    F64(Array2<f64>),
}

/// Apply `$body` to the array inside any variant.
macro_rules! with_array {
    ($pixels:expr, $array:ident => $body:expr) => {
        match $pixels {
            BandPixels::U8($array) => $body,
            BandPixels::I8($array) => $body,
            BandPixels::U16($array) => $body,
            BandPixels::I16($array) => $body,
            BandPixels::U32($array) => $body,
            BandPixels::I32($array) => $body,
            BandPixels::U64($array) => $body,
            BandPixels::I64($array) => $body,
            BandPixels::F32($array) => $body,
            BandPixels::F64($array) => $body,
        }
    };
}

impl BandPixels {
    /// Width in pixels.
    pub fn width(&self) -> usize {
        with_array!(self, a => a.ncols())
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        with_array!(self, a => a.nrows())
    }

    /// Sample type of the array.
    pub fn sample_type(&self) -> SampleType {
        match self {
            BandPixels::U8(_) => SampleType::U8,
            BandPixels::I8(_) => SampleType::I8,
            BandPixels::U16(_) => SampleType::U16,
            BandPixels::I16(_) => SampleType::I16,
            BandPixels::U32(_) => SampleType::U32,
            BandPixels::I32(_) => SampleType::I32,
            BandPixels::U64(_) => SampleType::U64,
            BandPixels::I64(_) => SampleType::I64,
            BandPixels::F32(_) => SampleType::F32,
            BandPixels::F64(_) => SampleType::F64,
        }
    }

    /// In-memory payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.width() * self.height() * self.sample_type().size_bytes()
    }

    /// Sample at `(row, col)` widened to `f64`.
    pub fn get_f64(&self, row: usize, col: usize) -> Option<f64> {
        with_array!(self, a => a.get((row, col)).map(|v| v.to_f64()))
    }

    /// Copy of the band widened to `f64`, for index arithmetic downstream.
    pub fn to_f64(&self) -> Array2<f64> {
        with_array!(self, a => a.mapv(Sample::to_f64))
    }
}
