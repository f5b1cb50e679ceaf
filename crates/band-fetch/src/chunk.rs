//! Strip and tile decoding for one image of a TIFF.
//!
//! The TIFF decoder is only used for the IFD; pixel data is fetched here one
//! chunk at a time so that just the requested band, and just the chunks that
//! feed the output grid, are ever held in memory.

use crate::cursor::RangeCursor;
use crate::pixels::{Sample, SampleType};
use crate::{FetchError, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;
use tracing::trace;

/// Chunk compression schemes this reader can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Lzw,
    Deflate,
    PackBits,
}

impl Compression {
    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Compression::None),
            5 => Ok(Compression::Lzw),
            8 | 32946 => Ok(Compression::Deflate),
            32773 => Ok(Compression::PackBits),
            other => Err(FetchError::Decode(format!("unsupported compression scheme {other}"))),
        }
    }
}

/// Differencing applied before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Predictor {
    None,
    Horizontal,
    FloatingPoint,
}

impl Predictor {
    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Predictor::None),
            2 => Ok(Predictor::Horizontal),
            3 => Ok(Predictor::FloatingPoint),
            other => Err(FetchError::Decode(format!("unsupported predictor {other}"))),
        }
    }
}

/// Where the pixel data of one image lives and how it is encoded.
///
/// Strips are treated as full-width chunks whose last row of chunks may be
/// short; tiles are always `chunk_width x chunk_height` with padding.
#[derive(Debug, Clone)]
pub(crate) struct ChunkLayout {
    pub width: usize,
    pub height: usize,
    pub chunk_width: usize,
    pub chunk_height: usize,
    pub tiled: bool,
    pub offsets: Vec<u64>,
    pub byte_counts: Vec<u64>,
    pub compression: Compression,
    pub predictor: Predictor,
    pub samples_per_pixel: usize,
    pub planar_separate: bool,
    pub sample_type: SampleType,
}

impl ChunkLayout {
    pub(crate) fn chunks_across(&self) -> usize {
        self.width.div_ceil(self.chunk_width)
    }

    pub(crate) fn chunks_down(&self) -> usize {
        self.height.div_ceil(self.chunk_height)
    }

    fn chunks_per_plane(&self) -> usize {
        self.chunks_across() * self.chunks_down()
    }

    /// Number of chunk offsets the image must declare.
    pub(crate) fn expected_chunks(&self) -> usize {
        let planes = if self.planar_separate { self.samples_per_pixel } else { 1 };
        self.chunks_per_plane() * planes
    }

    /// First image row covered by chunk row `chunk_row`.
    pub(crate) fn first_row(&self, chunk_row: usize) -> usize {
        chunk_row * self.chunk_height
    }

    /// Image rows covered by chunk row `chunk_row`.
    pub(crate) fn rows_in(&self, chunk_row: usize) -> usize {
        self.chunk_height.min(self.height - self.first_row(chunk_row))
    }

    /// Samples interleaved in each pixel of a chunk.
    fn samples_in_chunk(&self) -> usize {
        if self.planar_separate {
            1
        } else {
            self.samples_per_pixel
        }
    }

    /// Rows stored in a decoded chunk of chunk row `chunk_row`.
    fn stored_rows(&self, chunk_row: usize) -> usize {
        if self.tiled {
            self.chunk_height
        } else {
            self.rows_in(chunk_row)
        }
    }

    /// Decompress one chunk and undo its predictor.
    fn decode_chunk(&self, raw: Vec<u8>, chunk_row: usize, little_endian: bool) -> Result<Vec<u8>> {
        let row_len = self.chunk_width * self.samples_in_chunk() * self.sample_type.size_bytes();
        let expected = row_len * self.stored_rows(chunk_row);

        let mut bytes = match self.compression {
            Compression::None => raw,
            Compression::Lzw => weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
                .decode(&raw)
                .map_err(|e| FetchError::Decode(format!("LZW: {e}")))?,
            Compression::Deflate => {
                let mut out = Vec::with_capacity(expected);
                ZlibDecoder::new(raw.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| FetchError::Decode(format!("deflate: {e}")))?;
                out
            }
            Compression::PackBits => unpack_bits(&raw, expected),
        };

        if bytes.len() < expected {
            return Err(FetchError::Decode(format!(
                "chunk decoded to {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        bytes.truncate(expected);

        let stride = self.samples_in_chunk();
        let size = self.sample_type.size_bytes();
        match self.predictor {
            Predictor::None => {}
            Predictor::Horizontal => {
                for row in bytes.chunks_exact_mut(row_len) {
                    undo_horizontal(row, stride, size, little_endian);
                }
            }
            Predictor::FloatingPoint => {
                for row in bytes.chunks_exact_mut(row_len) {
                    undo_floating_point(row, stride, size, little_endian);
                }
            }
        }
        Ok(bytes)
    }
}

/// Reads one band of an image a chunk row at a time.
pub(crate) struct BandBlocks<'a> {
    cursor: &'a mut RangeCursor,
    layout: &'a ChunkLayout,
    band: usize,
    little_endian: bool,
}

impl<'a> BandBlocks<'a> {
    /// `band` is zero-based.
    pub(crate) fn new(cursor: &'a mut RangeCursor, layout: &'a ChunkLayout, band: usize, little_endian: bool) -> Self {
        Self {
            cursor,
            layout,
            band,
            little_endian,
        }
    }

    /// Decode chunk row `chunk_row` into a row-major `rows_in(chunk_row) x
    /// width` block of the band.
    ///
    /// Chunks whose columns are all unmarked in `cols_needed` are not fetched,
    /// nor are sparse chunks; their pixels keep `fill`.
    pub(crate) fn read<T: Sample>(&mut self, chunk_row: usize, fill: T, cols_needed: Option<&[bool]>) -> Result<Vec<T>> {
        let layout = self.layout;
        let width = layout.width;
        let rows = layout.rows_in(chunk_row);
        let mut block = vec![fill; rows * width];

        let (plane, sample_offset) = if layout.planar_separate {
            (self.band, 0)
        } else {
            (0, self.band)
        };
        let spp = layout.samples_in_chunk();
        let size = T::SIZE;

        for chunk_col in 0..layout.chunks_across() {
            let col0 = chunk_col * layout.chunk_width;
            let cols = layout.chunk_width.min(width - col0);
            if let Some(needed) = cols_needed {
                if !needed[col0..col0 + cols].iter().any(|&n| n) {
                    continue;
                }
            }

            let index = plane * layout.chunks_per_plane() + chunk_row * layout.chunks_across() + chunk_col;
            let (Some(&offset), Some(&count)) = (layout.offsets.get(index), layout.byte_counts.get(index)) else {
                return Err(FetchError::Decode(format!("chunk {index} has no offset")));
            };
            if count == 0 {
                continue;
            }
            let count = usize::try_from(count)
                .map_err(|_| FetchError::Decode(format!("chunk {index} is {count} bytes")))?;

            trace!(index, offset, count, "Reading chunk");
            let raw = self.cursor.read_exact_at(offset, count)?;
            let bytes = layout.decode_chunk(raw, chunk_row, self.little_endian)?;

            for r in 0..rows {
                let dest = &mut block[r * width + col0..r * width + col0 + cols];
                for (c, value) in dest.iter_mut().enumerate() {
                    let at = ((r * layout.chunk_width + c) * spp + sample_offset) * size;
                    *value = T::from_bytes(&bytes[at..at + size], self.little_endian);
                }
            }
        }
        Ok(block)
    }
}

/// Undo PackBits run-length encoding, stopping once `expected` bytes exist.
fn unpack_bits(data: &[u8], expected: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < data.len() && out.len() < expected {
        let header = data[i] as i8;
        i += 1;
        if header >= 0 {
            let end = (i + header as usize + 1).min(data.len());
            out.extend_from_slice(&data[i..end]);
            i = end;
        } else if header != -128 {
            let count = (1 - i16::from(header)) as usize;
            if let Some(&byte) = data.get(i) {
                out.extend(std::iter::repeat(byte).take(count));
                i += 1;
            }
        }
    }
    out
}

fn read_uint(bytes: &[u8], little_endian: bool) -> u64 {
    if little_endian {
        bytes.iter().rev().fold(0, |acc, &b| (acc << 8) | u64::from(b))
    } else {
        bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b))
    }
}

fn write_uint(bytes: &mut [u8], value: u64, little_endian: bool) {
    let n = bytes.len();
    for (i, byte) in bytes.iter_mut().enumerate() {
        let shift = if little_endian { i } else { n - 1 - i };
        *byte = (value >> (8 * shift)) as u8;
    }
}

/// Horizontal differencing: each sample is stored as the difference from
/// the same sample of the previous pixel, modulo the sample width.
fn undo_horizontal(row: &mut [u8], stride: usize, size: usize, little_endian: bool) {
    let samples = row.len() / size;
    for i in stride..samples {
        let prev = read_uint(&row[(i - stride) * size..(i - stride + 1) * size], little_endian);
        let current = &mut row[i * size..(i + 1) * size];
        let value = read_uint(current, little_endian).wrapping_add(prev);
        write_uint(current, value, little_endian);
    }
}

/// Floating-point differencing: bytes of each row are split into planes,
/// most significant first, then differenced byte-wise.
fn undo_floating_point(row: &mut [u8], stride: usize, size: usize, little_endian: bool) {
    for i in stride..row.len() {
        row[i] = row[i].wrapping_add(row[i - stride]);
    }
    let shuffled = row.to_vec();
    let samples = row.len() / size;
    for s in 0..samples {
        for b in 0..size {
            let byte = if little_endian { size - 1 - b } else { b };
            row[s * size + byte] = shuffled[b * samples + s];
        }
    }
}
