//! Band reader: open a raster, decide on downsampling, read one band.

use crate::band::{RasterBand, RasterInfo};
use crate::chunk::{BandBlocks, ChunkLayout, Compression, Predictor};
use crate::cursor::{RangeCursor, TransferStats};
use crate::geotransform::{GeoTransform, TAG_MODEL_PIXEL_SCALE, TAG_MODEL_TIEPOINT, TAG_MODEL_TRANSFORMATION};
use crate::pixels::{BandPixels, Sample, SampleType};
use crate::range_reader::{create_range_reader, Deadline};
use crate::resample::{plan_downsample, RowResampler};
use crate::{FetchConfig, FetchError, RasterSource, Result};
use ndarray::Array2;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Instant;
use tiff::decoder::{Decoder, Limits};
use tiff::tags::Tag;
use tracing::{debug, info, warn};

/// `NewSubfileType` tag.
const TAG_NEW_SUBFILE_TYPE: u16 = 254;
/// GDAL no-data tag, stored as ASCII.
const TAG_GDAL_NODATA: u16 = 42113;
/// `NewSubfileType` bit marking a reduced-resolution image.
const SUBFILE_REDUCED: u32 = 1;
/// `NewSubfileType` bit marking a transparency mask.
const SUBFILE_MASK: u32 = 4;

/// Reads one band of a raster.
///
/// The retrying fetcher is generic over this trait so tests and callers can
/// substitute their own reader.
pub trait BandRead {
    /// Perform one attempt at reading the configured band of `source`.
    fn read_band(&self, source: &RasterSource, config: &FetchConfig) -> Result<RasterBand>;
}

impl<F> BandRead for F
where
    F: Fn(&RasterSource, &FetchConfig) -> Result<RasterBand>,
{
    fn read_band(&self, source: &RasterSource, config: &FetchConfig) -> Result<RasterBand> {
        self(source, config)
    }
}

/// Band reader over HTTP range requests or local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteBandReader;

impl BandRead for RemoteBandReader {
    fn read_band(&self, source: &RasterSource, config: &FetchConfig) -> Result<RasterBand> {
        config.validate()?;
        let started = Instant::now();
        let deadline = Deadline::start(config.timeout());
        info!(url = %source, "Opening raster");

        let (band, stats) = with_session(source, config, deadline, |cursor| read_from(cursor, config))?;
        let band = RasterBand {
            bytes_transferred: stats.bytes_transferred,
            elapsed: started.elapsed(),
            ..band
        };

        info!(
            url = %source,
            width = band.width(),
            height = band.height(),
            elapsed_secs = band.elapsed.as_secs_f64(),
            size_mb = band.size_bytes as f64 / (1024.0 * 1024.0),
            transferred_mb = band.bytes_transferred as f64 / (1024.0 * 1024.0),
            "Band read complete"
        );
        Ok(band)
    }
}

/// Read one band of `source` in a single attempt.
pub fn read_band(source: &RasterSource, config: &FetchConfig) -> Result<RasterBand> {
    RemoteBandReader.read_band(source, config)
}

/// Read only the metadata of `source`: dimensions, band count, sample type,
/// reduced-resolution levels and georeferencing. No pixel payload is fetched.
pub fn probe(source: &RasterSource, config: &FetchConfig) -> Result<RasterInfo> {
    config.validate()?;
    let deadline = Deadline::start(config.timeout());
    let (info, _) = with_session(source, config, deadline, |cursor| {
        let content_length = cursor.size();
        let mut decoder = open_decoder(&mut *cursor)?;
        let header = read_header(&mut decoder)?;
        let levels = scan_overviews(&mut decoder, &header)?;
        Ok(RasterInfo {
            width: header.width,
            height: header.height,
            band_count: header.band_count,
            sample_type: header.sample_type,
            overviews: levels.iter().map(|l| (l.width, l.height)).collect(),
            content_length,
            geo_transform: header.geo_transform,
            no_data: header.no_data,
        })
    })?;
    debug!(url = %source, ?info, "Probed raster");
    Ok(info)
}

/// Open a session on `source`, run `f` against it, and close the session on
/// every exit path before returning.
fn with_session<T>(
    source: &RasterSource,
    config: &FetchConfig,
    deadline: Deadline,
    f: impl FnOnce(&mut RangeCursor) -> Result<T>,
) -> Result<(T, TransferStats)> {
    let reader = create_range_reader(source, config, deadline)?;
    let mut cursor = RangeCursor::new(reader, deadline, config.transport.read_ahead_bytes);

    let result = if cursor.size() == 0 {
        Err(FetchError::Decode(format!("{source} is empty")))
    } else {
        f(&mut cursor).map_err(truncation_as_decode)
    };

    let stats = cursor.close();
    result.map(|value| (value, stats))
}

/// A file that ends early is malformed, not an I/O fault.
fn truncation_as_decode(err: FetchError) -> FetchError {
    match err {
        FetchError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            FetchError::Decode(format!("truncated raster: {io}"))
        }
        other => other,
    }
}

/// Full-resolution image properties.
#[derive(Debug)]
struct Header {
    width: u32,
    height: u32,
    band_count: u16,
    sample_type: SampleType,
    geo_transform: GeoTransform,
    no_data: Option<f64>,
}

/// A reduced-resolution image in the IFD chain.
#[derive(Debug, Clone, Copy)]
struct Level {
    ifd: usize,
    width: u32,
    height: u32,
}

fn read_from(cursor: &mut RangeCursor, config: &FetchConfig) -> Result<RasterBand> {
    let little_endian = byte_order(cursor)?;

    let (header, plan, level, layout) = {
        let mut decoder = open_decoder(&mut *cursor)?;
        let header = read_header(&mut decoder)?;
        let overviews = scan_overviews(&mut decoder, &header)?;
        debug!(
            width = header.width,
            height = header.height,
            bands = header.band_count,
            sample_type = ?header.sample_type,
            overviews = overviews.len(),
            "File info"
        );

        if config.band > header.band_count {
            return Err(FetchError::Decode(format!(
                "band {} requested but raster has {} band(s)",
                config.band, header.band_count
            )));
        }

        let plan = plan_downsample(header.width, header.height, config.max_dimension);
        let level = plan.and_then(|p| choose_level(&overviews, p.width, p.height));
        decoder.seek_to_image(level.map_or(0, |l| l.ifd))?;
        let layout = read_layout(&mut decoder)?;
        (header, plan, level, layout)
    };

    if usize::from(config.band) > layout.samples_per_pixel {
        return Err(FetchError::Decode(format!(
            "band {} requested but image has {} sample(s) per pixel",
            config.band, layout.samples_per_pixel
        )));
    }

    let geo_transform = match plan {
        Some(plan) => {
            info!(
                from_width = header.width,
                from_height = header.height,
                to_width = plan.width,
                to_height = plan.height,
                overview = ?level.map(|l| l.ifd),
                "Downsampling"
            );
            let (col_factor, row_factor) = plan.transform_factors(header.width, header.height);
            header.geo_transform.scaled(col_factor, row_factor)
        }
        None => {
            debug!("Reading full resolution data");
            header.geo_transform
        }
    };
    debug!(
        tiled = layout.tiled,
        chunk_width = layout.chunk_width,
        chunk_height = layout.chunk_height,
        compression = ?layout.compression,
        predictor = ?layout.predictor,
        planar = layout.planar_separate,
        "Chunk layout"
    );

    let target = plan.map(|p| (p.width as usize, p.height as usize));
    let mut blocks = BandBlocks::new(cursor, &layout, usize::from(config.band - 1), little_endian);
    macro_rules! read_typed {
        ($($variant:ident => $t:ty),+ $(,)?) => {
            match layout.sample_type {
                $(SampleType::$variant => {
                    BandPixels::$variant(read_pixels::<$t>(&mut blocks, &layout, target, header.no_data)?)
                })+
            }
        };
    }
    let pixels = read_typed!(
        U8 => u8,
        I8 => i8,
        U16 => u16,
        I16 => i16,
        U32 => u32,
        I32 => i32,
        U64 => u64,
        I64 => i64,
        F32 => f32,
        F64 => f64,
    );

    Ok(RasterBand {
        size_bytes: pixels.size_bytes(),
        pixels,
        geo_transform,
        native_width: header.width,
        native_height: header.height,
        band_count: header.band_count,
        no_data: header.no_data,
        bytes_transferred: 0,
        overview_level: level.map(|l| l.ifd),
        elapsed: Default::default(),
    })
}

/// Assemble the band at native size, or stream it through the resampler
/// when `target` differs from the image size.
///
/// While resampling, chunk rows holding no sampled row and chunks holding no
/// sampled column are never fetched.
fn read_pixels<T: Sample>(
    blocks: &mut BandBlocks<'_>,
    layout: &ChunkLayout,
    target: Option<(usize, usize)>,
    no_data: Option<f64>,
) -> Result<Array2<T>> {
    let fill = T::from_f64(no_data.unwrap_or(0.0));
    let (width, height) = (layout.width, layout.height);

    let Some((out_width, out_height)) = target.filter(|&t| t != (width, height)) else {
        let mut values = Vec::with_capacity(width * height);
        for chunk_row in 0..layout.chunks_down() {
            values.extend(blocks.read::<T>(chunk_row, fill, None)?);
        }
        return Array2::from_shape_vec((height, width), values).map_err(|e| FetchError::Decode(e.to_string()));
    };

    let mut resampler = RowResampler::new(height, width, out_height, out_width, no_data);
    let rows_needed = resampler.rows_needed();
    let cols_needed = resampler.cols_needed();
    let mut skipped = 0;
    for chunk_row in 0..layout.chunks_down() {
        let first = layout.first_row(chunk_row);
        if !rows_needed[first..first + layout.rows_in(chunk_row)].iter().any(|&n| n) {
            skipped += 1;
            continue;
        }
        let block = blocks.read::<T>(chunk_row, fill, Some(&cols_needed))?;
        resampler.push(first, &block)?;
    }
    debug!(skipped, chunk_rows = layout.chunks_down(), "Streamed resample");
    resampler.finish()
}

/// Smallest reduced-resolution level that still covers the target size.
fn choose_level(overviews: &[Level], target_width: u32, target_height: u32) -> Option<Level> {
    overviews
        .iter()
        .filter(|l| l.width >= target_width && l.height >= target_height)
        .min_by_key(|l| u64::from(l.width) * u64::from(l.height))
        .copied()
}

/// `true` for little-endian files.
fn byte_order(cursor: &mut RangeCursor) -> Result<bool> {
    let mut signature = [0u8; 2];
    cursor.seek(SeekFrom::Start(0))?;
    cursor.read_exact(&mut signature)?;
    match &signature {
        b"II" => Ok(true),
        b"MM" => Ok(false),
        _ => Err(FetchError::Decode(format!("{} is not a TIFF file", cursor.identifier()))),
    }
}

/// Open a decoder on the first IFD, whatever the reader's current position.
fn open_decoder<R: Read + Seek>(mut reader: R) -> Result<Decoder<R>> {
    reader.seek(SeekFrom::Start(0))?;
    // Offset tables of large tiled scenes outgrow the default limit.
    let mut limits = Limits::default();
    limits.ifd_value_size = 1024 * 1024 * 1024;
    Ok(Decoder::new(reader)?.with_limits(limits))
}

fn read_header<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Header> {
    let (width, height) = decoder.dimensions()?;
    if width == 0 || height == 0 {
        return Err(FetchError::Decode(format!("raster reports {width}x{height} pixels")));
    }

    let band_count = tag_u32(decoder, Tag::SamplesPerPixel)?.unwrap_or(1);
    let band_count = u16::try_from(band_count)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| FetchError::Decode(format!("invalid samples per pixel: {band_count}")))?;

    let sample_type = read_sample_type(decoder)?;
    let geo_transform = match read_geo_transform(decoder)? {
        Some(gt) => gt,
        None => {
            warn!("Raster has no georeferencing tags, using identity transform");
            GeoTransform::IDENTITY
        }
    };
    let no_data = read_no_data(decoder)?;

    Ok(Header {
        width,
        height,
        band_count,
        sample_type,
        geo_transform,
        no_data,
    })
}

/// Where and how the pixel data of the current IFD is stored.
fn read_layout<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<ChunkLayout> {
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    let samples_per_pixel = tag_u32(decoder, Tag::SamplesPerPixel)?.unwrap_or(1) as usize;
    let planar_separate = tag_u32(decoder, Tag::PlanarConfiguration)? == Some(2);
    let compression = Compression::from_code(tag_u32(decoder, Tag::Compression)?.unwrap_or(1))?;
    let predictor = Predictor::from_code(tag_u32(decoder, Tag::Predictor)?.unwrap_or(1))?;

    let (tiled, chunk_width, chunk_height, offsets, byte_counts) = match tag_u32(decoder, Tag::TileWidth)? {
        Some(tile_width) => {
            let tile_length = tag_u32(decoder, Tag::TileLength)?
                .ok_or_else(|| FetchError::Decode("tiled image has no tile length".to_string()))?;
            (
                true,
                tile_width as usize,
                tile_length as usize,
                tag_u64s(decoder, Tag::TileOffsets)?,
                tag_u64s(decoder, Tag::TileByteCounts)?,
            )
        }
        None => {
            let rows_per_strip = tag_u32(decoder, Tag::RowsPerStrip)?.map_or(height, |r| r as usize);
            (
                false,
                width,
                rows_per_strip.min(height),
                tag_u64s(decoder, Tag::StripOffsets)?,
                tag_u64s(decoder, Tag::StripByteCounts)?,
            )
        }
    };
    if width == 0 || height == 0 || chunk_width == 0 || chunk_height == 0 {
        return Err(FetchError::Decode(format!(
            "invalid image geometry: {width}x{height} in {chunk_width}x{chunk_height} chunks"
        )));
    }
    let (Some(offsets), Some(byte_counts)) = (offsets, byte_counts) else {
        return Err(FetchError::Decode("image has no pixel data offsets".to_string()));
    };

    let layout = ChunkLayout {
        width,
        height,
        chunk_width,
        chunk_height,
        tiled,
        offsets,
        byte_counts,
        compression,
        predictor,
        samples_per_pixel,
        planar_separate,
        sample_type: read_sample_type(decoder)?,
    };
    let expected = layout.expected_chunks();
    if layout.offsets.len() < expected || layout.byte_counts.len() < expected {
        return Err(FetchError::Decode(format!(
            "image declares {} chunk offsets and {} byte counts, needs {expected}",
            layout.offsets.len(),
            layout.byte_counts.len()
        )));
    }
    Ok(layout)
}

fn read_sample_type<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<SampleType> {
    let bits = tag_u32(decoder, Tag::BitsPerSample)?.unwrap_or(1);
    let format = tag_u32(decoder, Tag::SampleFormat)?.unwrap_or(1);

    let sample_type = match (bits, format) {
        (8, 1) => SampleType::U8,
        (8, 2) => SampleType::I8,
        (16, 1) => SampleType::U16,
        (16, 2) => SampleType::I16,
        (32, 1) => SampleType::U32,
        (32, 2) => SampleType::I32,
        (32, 3) => SampleType::F32,
        (64, 1) => SampleType::U64,
        (64, 2) => SampleType::I64,
        (64, 3) => SampleType::F64,
        _ => {
            return Err(FetchError::Decode(format!(
                "unsupported sample layout: {bits} bits, format {format}"
            )))
        }
    };
    Ok(sample_type)
}

fn read_geo_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<GeoTransform>> {
    if let Some(matrix) = tag_f64s(decoder, TAG_MODEL_TRANSFORMATION)? {
        if let Some(gt) = GeoTransform::from_model_transformation(&matrix) {
            return Ok(Some(gt));
        }
    }
    let tiepoint = tag_f64s(decoder, TAG_MODEL_TIEPOINT)?;
    let pixel_scale = tag_f64s(decoder, TAG_MODEL_PIXEL_SCALE)?;
    Ok(match (tiepoint, pixel_scale) {
        (Some(tiepoint), Some(scale)) => GeoTransform::from_tiepoint(&tiepoint, &scale),
        _ => None,
    })
}

/// The GDAL no-data value. Transfer failures propagate; a tag that is
/// absent or not a number means no no-data value.
fn read_no_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<f64>> {
    let Some(value) = decoder.find_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = match value.into_string() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Ignoring no-data tag that is not ASCII");
            return Ok(None);
        }
    };
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match text.parse() {
        Ok(value) => Ok(Some(value)),
        Err(_) => {
            warn!(value = text, "Ignoring no-data tag that is not a number");
            Ok(None)
        }
    }
}

/// Walk the remaining IFDs and collect reduced-resolution levels that share
/// the full-resolution sample layout. Only IFD headers are read.
fn scan_overviews<R: Read + Seek>(decoder: &mut Decoder<R>, header: &Header) -> Result<Vec<Level>> {
    let mut levels = Vec::new();
    let mut ifd = 0;
    while decoder.more_images() {
        decoder.next_image()?;
        ifd += 1;

        let subfile = tag_u32(decoder, Tag::from_u16_exhaustive(TAG_NEW_SUBFILE_TYPE))?.unwrap_or(0);
        if subfile & SUBFILE_REDUCED == 0 || subfile & SUBFILE_MASK != 0 {
            continue;
        }
        if read_sample_type(decoder)? != header.sample_type {
            continue;
        }
        let (width, height) = decoder.dimensions()?;
        if width > 0 && height > 0 {
            levels.push(Level { ifd, width, height });
        }
    }
    Ok(levels)
}

fn tag_u32<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<u32>> {
    match decoder.find_tag(tag)? {
        Some(value) => Ok(value.into_u32_vec()?.first().copied()),
        None => Ok(None),
    }
}

fn tag_u64s<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<u64>>> {
    match decoder.find_tag(tag)? {
        Some(value) => Ok(Some(value.into_u64_vec()?)),
        None => Ok(None),
    }
}

fn tag_f64s<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Result<Option<Vec<f64>>> {
    match decoder.find_tag(Tag::from_u16_exhaustive(code))? {
        Some(value) => Ok(Some(value.into_f64_vec()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_reader::RangeReader;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tiff::encoder::{colortype, TiffEncoder};

    fn gray8_tiff(no_data: Option<&str>) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer).unwrap();
            let mut image = encoder.new_image::<colortype::Gray8>(4, 4).unwrap();
            if let Some(no_data) = no_data {
                image.encoder().write_tag(Tag::Unknown(TAG_GDAL_NODATA), no_data).unwrap();
            }
            image.write_data(&[7u8; 16]).unwrap();
        }
        buffer.into_inner()
    }

    struct MemoryReader(Vec<u8>);

    impl RangeReader for MemoryReader {
        fn read_range(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
            let start = offset as usize;
            Ok(self.0[start..start + length].to_vec())
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }

        fn identifier(&self) -> &str {
            "memory"
        }
    }

    /// Fails every read once `failing` is set, the way a cursor does after
    /// its deadline passes.
    struct ExpiringReader {
        inner: Cursor<Vec<u8>>,
        failing: Arc<AtomicBool>,
    }

    impl Read for ExpiringReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(io::Error::other(FetchError::Timeout {
                    url: "memory".to_string(),
                    elapsed: Duration::from_secs(2),
                    limit: Duration::from_secs(1),
                }));
            }
            self.inner.read(buf)
        }
    }

    impl Seek for ExpiringReader {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_choose_level_smallest_covering() {
        let overviews = [
            Level { ifd: 1, width: 5490, height: 5490 },
            Level { ifd: 2, width: 2745, height: 2745 },
            Level { ifd: 3, width: 1373, height: 1373 },
        ];
        assert_eq!(choose_level(&overviews, 2048, 2048).map(|l| l.ifd), Some(2));
        assert_eq!(choose_level(&overviews, 1024, 1024).map(|l| l.ifd), Some(3));
        assert!(choose_level(&overviews, 6000, 6000).is_none());
        assert!(choose_level(&[], 10, 10).is_none());
    }

    #[test]
    fn test_decoder_reopens_after_cursor_moved() {
        let bytes = gray8_tiff(None);
        let mut cursor = RangeCursor::new(
            Box::new(MemoryReader(bytes)),
            Deadline::start(Duration::from_secs(60)),
            16,
        );
        assert_eq!(open_decoder(&mut cursor).unwrap().dimensions().unwrap(), (4, 4));

        cursor.seek(SeekFrom::End(-3)).unwrap();
        let mut tail = [0u8; 1];
        cursor.read_exact(&mut tail).unwrap();

        assert_eq!(open_decoder(&mut cursor).unwrap().dimensions().unwrap(), (4, 4));
        assert!(byte_order(&mut cursor).unwrap());
    }

    #[test]
    fn test_layout_of_single_strip() {
        let mut decoder = open_decoder(Cursor::new(gray8_tiff(None))).unwrap();
        let layout = read_layout(&mut decoder).unwrap();
        assert_eq!((layout.width, layout.height), (4, 4));
        assert!(!layout.tiled);
        assert_eq!(layout.chunk_width, 4);
        assert_eq!(layout.samples_per_pixel, 1);
        assert_eq!(layout.compression, Compression::None);
        assert_eq!(layout.sample_type, SampleType::U8);
        assert!(!layout.offsets.is_empty());
    }

    #[test]
    fn test_no_data_parsed_and_garbage_ignored() {
        let mut decoder = open_decoder(Cursor::new(gray8_tiff(Some("-9999")))).unwrap();
        assert_eq!(read_no_data(&mut decoder).unwrap(), Some(-9999.0));

        let mut decoder = open_decoder(Cursor::new(gray8_tiff(Some("none")))).unwrap();
        assert_eq!(read_no_data(&mut decoder).unwrap(), None);

        let mut decoder = open_decoder(Cursor::new(gray8_tiff(None))).unwrap();
        assert_eq!(read_no_data(&mut decoder).unwrap(), None);
    }

    #[test]
    fn test_no_data_read_failure_propagates() {
        // "-9999\0" is six bytes, so the value lives outside the IFD entry
        // and is only fetched when the tag is looked up.
        let failing = Arc::new(AtomicBool::new(false));
        let reader = ExpiringReader {
            inner: Cursor::new(gray8_tiff(Some("-9999"))),
            failing: failing.clone(),
        };
        let mut decoder = open_decoder(reader).unwrap();
        failing.store(true, Ordering::SeqCst);

        let err = read_no_data(&mut decoder).unwrap_err();
        assert!(err.is_timeout(), "unexpected {err:?}");
    }

    #[test]
    fn test_truncation_maps_to_decode() {
        let err = truncation_as_decode(FetchError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")));
        assert!(err.is_decode());
    }
}
