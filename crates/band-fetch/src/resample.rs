//! Downsampling decision and bilinear resampling.

use crate::pixels::Sample;
use crate::{FetchError, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1};

/// Output size chosen for a raster that exceeds the dimension cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownsamplePlan {
    /// Uniform scale applied to both axes (`< 1`).
    pub scale: f64,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
}

impl DownsamplePlan {
    /// Column and row growth factors for the geotransform
    /// (`native / output` on each axis).
    pub fn transform_factors(&self, native_width: u32, native_height: u32) -> (f64, f64) {
        (
            f64::from(native_width) / f64::from(self.width),
            f64::from(native_height) / f64::from(self.height),
        )
    }
}

/// Decide whether a `width x height` raster must shrink to fit within
/// `max_dimension` on both axes.
///
/// Returns `None` when the raster already fits, or when flooring leaves both
/// dimensions unchanged. Otherwise `scale = max_dimension / max(width,
/// height)` and each axis is `floor(axis * scale)`, computed in integers so
/// the limiting axis lands exactly on `max_dimension`. No axis goes below one
/// pixel.
pub fn plan_downsample(width: u32, height: u32, max_dimension: u32) -> Option<DownsamplePlan> {
    if width <= max_dimension && height <= max_dimension {
        return None;
    }
    let limiting = u64::from(width.max(height));
    let cap = u64::from(max_dimension);
    let floor_scaled = |axis: u32| ((u64::from(axis) * cap / limiting) as u32).max(1);

    let plan = DownsamplePlan {
        scale: cap as f64 / limiting as f64,
        width: floor_scaled(width),
        height: floor_scaled(height),
    };
    if plan.width == width && plan.height == height {
        return None;
    }
    Some(plan)
}

/// Resample `src` to `out_height x out_width` with a bilinear kernel.
///
/// Output pixel centres are mapped onto the source grid with
/// `src = (dst + 0.5) * ratio - 0.5` and clamped at the edges. Neighbours
/// equal to `no_data` are left out of the weighted sum; when all four are
/// excluded the output pixel is `no_data`.
pub fn resample_bilinear<T: Sample>(
    src: ArrayView2<'_, T>,
    out_height: usize,
    out_width: usize,
    no_data: Option<f64>,
) -> Array2<T> {
    let (src_height, src_width) = src.dim();
    if src_height == 0 || src_width == 0 {
        return Array2::from_shape_fn((0, 0), |_| T::from_f64(0.0));
    }

    let row_taps = taps(src_height, out_height);
    let col_taps = taps(src_width, out_width);

    let mut out = Array2::from_elem((out_height, out_width), T::from_f64(0.0));
    for (row, &(y0, y1, fy)) in row_taps.iter().enumerate() {
        blend_row(src.row(y0), src.row(y1), fy, &col_taps, no_data, out.row_mut(row));
    }
    out
}

/// Source indices `(lo, hi)` and interpolation weight for one output position.
pub(crate) type Tap = (usize, usize, f64);

/// Taps for each of `out_len` output positions over `src_len` source positions.
pub(crate) fn taps(src_len: usize, out_len: usize) -> Vec<Tap> {
    let ratio = src_len as f64 / out_len.max(1) as f64;
    let last = (src_len - 1) as f64;
    (0..out_len)
        .map(|i| {
            let pos = ((i as f64 + 0.5) * ratio - 0.5).clamp(0.0, last);
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(src_len - 1);
            (lo, hi, pos - lo as f64)
        })
        .collect()
}

/// Fill one output row from the two source rows it sits between.
fn blend_row<T: Sample>(
    upper: ArrayView1<'_, T>,
    lower: ArrayView1<'_, T>,
    fy: f64,
    col_taps: &[Tap],
    no_data: Option<f64>,
    out: ArrayViewMut1<'_, T>,
) {
    let is_no_data = |v: f64| match no_data {
        Some(nd) if nd.is_nan() => v.is_nan(),
        Some(nd) => v == nd,
        None => false,
    };

    for (value, &(x0, x1, fx)) in out.into_iter().zip(col_taps) {
        let neighbours = [
            (upper[x0], (1.0 - fx) * (1.0 - fy)),
            (upper[x1], fx * (1.0 - fy)),
            (lower[x0], (1.0 - fx) * fy),
            (lower[x1], fx * fy),
        ];

        let mut sum = 0.0;
        let mut weight = 0.0;
        for (sample, w) in neighbours {
            let sample = sample.to_f64();
            if w > 0.0 && !is_no_data(sample) {
                sum += sample * w;
                weight += w;
            }
        }
        *value = match no_data {
            Some(nd) if weight == 0.0 => T::from_f64(nd),
            _ if weight == 0.0 => upper[x0],
            _ => T::from_f64(sum / weight),
        };
    }
}

/// Bilinear resampler fed with full-width source rows from top to bottom.
///
/// Only the rows and columns named by the taps are ever read, so callers can
/// skip fetching blocks that [`RowResampler::rows_needed`] leaves unmarked.
/// At most one source row is held between pushes.
pub(crate) struct RowResampler<T> {
    src_height: usize,
    src_width: usize,
    row_taps: Vec<Tap>,
    col_taps: Vec<Tap>,
    no_data: Option<f64>,
    next_row: usize,
    carry: Option<(usize, Vec<T>)>,
    out: Array2<T>,
}

impl<T: Sample> RowResampler<T> {
    /// Resampler from a `src_height x src_width` grid to `out_height x out_width`.
    pub(crate) fn new(
        src_height: usize,
        src_width: usize,
        out_height: usize,
        out_width: usize,
        no_data: Option<f64>,
    ) -> Self {
        Self {
            src_height,
            src_width,
            row_taps: taps(src_height, out_height),
            col_taps: taps(src_width, out_width),
            no_data,
            next_row: 0,
            carry: None,
            out: Array2::from_elem((out_height, out_width), T::from_f64(0.0)),
        }
    }

    /// Source rows that contribute to some output row.
    pub(crate) fn rows_needed(&self) -> Vec<bool> {
        mark(self.src_height, &self.row_taps)
    }

    /// Source columns that contribute to some output column.
    pub(crate) fn cols_needed(&self) -> Vec<bool> {
        mark(self.src_width, &self.col_taps)
    }

    /// Feed the rows `first_row..` held row-major in `block`.
    ///
    /// Blocks must arrive in ascending order. Blocks holding no needed row may
    /// be skipped; any other gap is an error.
    pub(crate) fn push(&mut self, first_row: usize, block: &[T]) -> Result<()> {
        let width = self.src_width;
        let rows = block.len() / width.max(1);
        if rows == 0 {
            return Ok(());
        }
        let end_row = first_row + rows;

        let Self { row_taps, col_taps, no_data, next_row, carry, out, .. } = self;
        let source_row = |y: usize| {
            if (first_row..end_row).contains(&y) {
                let start = (y - first_row) * width;
                Some(ArrayView1::from(&block[start..start + width]))
            } else {
                carry
                    .as_ref()
                    .filter(|(row, _)| *row == y)
                    .map(|(_, values)| ArrayView1::from(&values[..]))
            }
        };

        while let Some(&(y0, y1, fy)) = row_taps.get(*next_row) {
            if y1 >= end_row {
                break;
            }
            let (Some(upper), Some(lower)) = (source_row(y0), source_row(y1)) else {
                return Err(FetchError::Decode(format!(
                    "source rows {y0} and {y1} were not supplied before row {first_row}"
                )));
            };
            blend_row(upper, lower, fy, col_taps, *no_data, out.row_mut(*next_row));
            *next_row += 1;
        }

        let last = end_row - 1;
        *carry = Some((last, block[(rows - 1) * width..rows * width].to_vec()));
        Ok(())
    }

    /// The resampled array, once every output row has been produced.
    pub(crate) fn finish(self) -> Result<Array2<T>> {
        if self.next_row < self.row_taps.len() {
            return Err(FetchError::Decode(format!(
                "resampled {} of {} rows before the source ran out",
                self.next_row,
                self.row_taps.len()
            )));
        }
        Ok(self.out)
    }
}

fn mark(len: usize, taps: &[Tap]) -> Vec<bool> {
    let mut needed = vec![false; len];
    for &(lo, hi, _) in taps {
        needed[lo] = true;
        needed[hi] = true;
    }
    needed
}
