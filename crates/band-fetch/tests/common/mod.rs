//! Shared fixtures: GeoTIFFs encoded in memory and a minimal HTTP server
//! that honours `Range` requests.

#![allow(dead_code)]

use flate2::write::ZlibEncoder;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

// GeoTIFF tag IDs
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GDAL_NODATA: u16 = 42113;

/// 10 m pixels, upper-left corner at (500000, 4200000).
pub const PIXEL_SCALE: [f64; 3] = [10.0, 10.0, 0.0];
pub const TIEPOINT: [f64; 6] = [0.0, 0.0, 0.0, 500_000.0, 4_200_000.0, 0.0];

/// Single-band `f32` GeoTIFF, optionally with reduced-resolution levels.
pub struct GeoTiff {
    width: u32,
    height: u32,
    data: Vec<f32>,
    georeferenced: bool,
    no_data: Option<String>,
    overviews: Vec<(u32, u32, Vec<f32>)>,
}

impl GeoTiff {
    /// `value = row * 1000 + col`.
    pub fn ramp(width: u32, height: u32) -> Self {
        let data = (0..height)
            .flat_map(|row| (0..width).map(move |col| (row * 1000 + col) as f32))
            .collect();
        Self::from_data(width, height, data)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self::from_data(width, height, vec![value; (width * height) as usize])
    }

    pub fn from_data(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self {
            width,
            height,
            data,
            georeferenced: true,
            no_data: None,
            overviews: Vec::new(),
        }
    }

    pub fn without_georeferencing(mut self) -> Self {
        self.georeferenced = false;
        self
    }

    pub fn with_no_data(mut self, no_data: &str) -> Self {
        self.no_data = Some(no_data.to_string());
        self
    }

    pub fn with_overview(mut self, width: u32, height: u32, value: f32) -> Self {
        self.overviews.push((width, height, vec![value; (width * height) as usize]));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer).unwrap();
            let mut image = encoder
                .new_image::<colortype::Gray32Float>(self.width, self.height)
                .unwrap();
            if self.georeferenced {
                let dir = image.encoder();
                dir.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &PIXEL_SCALE[..]).unwrap();
                dir.write_tag(Tag::Unknown(MODEL_TIEPOINT), &TIEPOINT[..]).unwrap();
            }
            if let Some(no_data) = &self.no_data {
                image.encoder().write_tag(Tag::Unknown(GDAL_NODATA), no_data.as_str()).unwrap();
            }
            image.write_data(&self.data).unwrap();

            for (width, height, data) in &self.overviews {
                let mut image = encoder.new_image::<colortype::Gray32Float>(*width, *height).unwrap();
                // Reduced-resolution version of the first image.
                image.encoder().write_tag(Tag::NewSubfileType, 1u32).unwrap();
                image.write_data(data).unwrap();
            }
        }
        buffer.into_inner()
    }
}

/// Three-band interleaved RGB8 image with constant channels.
pub fn rgb8(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let data: Vec<u8> = (0..width * height).flat_map(|_| rgb).collect();
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buffer).unwrap();
        let mut image = encoder.new_image::<colortype::RGB8>(width, height).unwrap();
        image.encoder().write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &PIXEL_SCALE[..]).unwrap();
        image.encoder().write_tag(Tag::Unknown(MODEL_TIEPOINT), &TIEPOINT[..]).unwrap();
        image.write_data(&data).unwrap();
    }
    buffer.into_inner()
}

/// Single-band 16-bit image, `value = col`.
pub fn gray16(width: u32, height: u32) -> Vec<u8> {
    let data: Vec<u16> = (0..height).flat_map(|_| (0..width).map(|c| c as u16)).collect();
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buffer).unwrap();
        let image = encoder.new_image::<colortype::Gray16>(width, height).unwrap();
        image.write_data(&data).unwrap();
    }
    buffer.into_inner()
}

/// Hand-assembled little-endian 8-bit TIFF, for layouts the encoder does not
/// write: separate planes, tiles, extra grey samples and compressed chunks.
pub struct RawTiff {
    width: u32,
    height: u32,
    planes: Vec<Vec<u8>>,
    planar: bool,
    photometric: u16,
    rows_per_strip: u32,
    tile: Option<u32>,
    compression: u16,
    predictor: bool,
}

enum Field {
    Short(Vec<u16>),
    Long(Vec<u32>),
}

impl Field {
    /// Type code, count and little-endian payload.
    fn encode(&self) -> (u16, u32, Vec<u8>) {
        match self {
            Field::Short(values) => (3, values.len() as u32, values.iter().flat_map(|v| v.to_le_bytes()).collect()),
            Field::Long(values) => (4, values.len() as u32, values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }
}

impl RawTiff {
    /// One `width * height` plane per band; interleaved, grey, single strip.
    pub fn new(width: u32, height: u32, planes: Vec<Vec<u8>>) -> Self {
        Self {
            width,
            height,
            planes,
            planar: false,
            photometric: 1,
            rows_per_strip: height,
            tile: None,
            compression: 1,
            predictor: false,
        }
    }

    /// Band `b` filled by `value(b, row, col)`.
    pub fn from_fn(width: u32, height: u32, bands: usize, value: impl Fn(usize, usize, usize) -> u8) -> Self {
        let planes = (0..bands)
            .map(|b| {
                (0..height as usize)
                    .flat_map(|r| (0..width as usize).map(move |c| (r, c)))
                    .map(|(r, c)| value(b, r, c))
                    .collect()
            })
            .collect();
        Self::new(width, height, planes)
    }

    pub fn planar(mut self) -> Self {
        self.planar = true;
        self
    }

    pub fn rgb(mut self) -> Self {
        self.photometric = 2;
        self
    }

    pub fn rows_per_strip(mut self, rows: u32) -> Self {
        self.rows_per_strip = rows;
        self
    }

    pub fn tiled(mut self, size: u32) -> Self {
        self.tile = Some(size);
        self
    }

    pub fn deflate(mut self) -> Self {
        self.compression = 8;
        self
    }

    pub fn lzw(mut self) -> Self {
        self.compression = 5;
        self
    }

    pub fn horizontal_predictor(mut self) -> Self {
        self.predictor = true;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let mut offsets = Vec::new();
        let mut counts = Vec::new();
        for chunk in self.chunks() {
            offsets.push(out.len() as u32);
            counts.push(chunk.len() as u32);
            out.extend_from_slice(&chunk);
        }
        if out.len() % 2 == 1 {
            out.push(0);
        }
        let ifd_offset = out.len();
        out[4..8].copy_from_slice(&(ifd_offset as u32).to_le_bytes());

        let spp = self.planes.len();
        let mut entries = vec![
            (256u16, Field::Long(vec![self.width])),
            (257, Field::Long(vec![self.height])),
            (258, Field::Short(vec![8; spp])),
            (259, Field::Short(vec![self.compression])),
            (262, Field::Short(vec![self.photometric])),
            (277, Field::Short(vec![spp as u16])),
            (284, Field::Short(vec![if self.planar { 2 } else { 1 }])),
        ];
        if self.predictor {
            entries.push((317, Field::Short(vec![2])));
        }
        match self.tile {
            Some(size) => {
                entries.push((322, Field::Long(vec![size])));
                entries.push((323, Field::Long(vec![size])));
                entries.push((324, Field::Long(offsets)));
                entries.push((325, Field::Long(counts)));
            }
            None => {
                entries.push((273, Field::Long(offsets)));
                entries.push((278, Field::Long(vec![self.rows_per_strip])));
                entries.push((279, Field::Long(counts)));
            }
        }
        entries.sort_by_key(|(tag, _)| *tag);

        let values_start = ifd_offset + 2 + entries.len() * 12 + 4;
        let mut ifd = Vec::new();
        let mut values = Vec::new();
        ifd.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (tag, field) in &entries {
            let (kind, count, mut payload) = field.encode();
            ifd.extend_from_slice(&tag.to_le_bytes());
            ifd.extend_from_slice(&kind.to_le_bytes());
            ifd.extend_from_slice(&count.to_le_bytes());
            if payload.len() <= 4 {
                payload.resize(4, 0);
                ifd.extend_from_slice(&payload);
            } else {
                ifd.extend_from_slice(&((values_start + values.len()) as u32).to_le_bytes());
                values.extend_from_slice(&payload);
            }
        }
        ifd.extend_from_slice(&0u32.to_le_bytes());

        out.extend_from_slice(&ifd);
        out.extend_from_slice(&values);
        out
    }

    /// Encoded chunks in offset-table order.
    fn chunks(&self) -> Vec<Vec<u8>> {
        let (width, height) = (self.width as usize, self.height as usize);
        let (chunk_width, chunk_height) = match self.tile {
            Some(size) => (size as usize, size as usize),
            None => (width, self.rows_per_strip as usize),
        };
        let bands = self.planes.len();
        let plane_sets: Vec<Vec<usize>> = if self.planar {
            (0..bands).map(|b| vec![b]).collect()
        } else {
            vec![(0..bands).collect()]
        };

        let mut chunks = Vec::new();
        for set in &plane_sets {
            for chunk_row in 0..height.div_ceil(chunk_height) {
                for chunk_col in 0..width.div_ceil(chunk_width) {
                    let rows = match self.tile {
                        Some(_) => chunk_height,
                        None => chunk_height.min(height - chunk_row * chunk_height),
                    };
                    let mut raw = Vec::new();
                    for r in 0..rows {
                        let y = chunk_row * chunk_height + r;
                        let mut row = Vec::new();
                        for c in 0..chunk_width {
                            let x = chunk_col * chunk_width + c;
                            for &b in set {
                                row.push(if y < height && x < width { self.planes[b][y * width + x] } else { 0 });
                            }
                        }
                        if self.predictor {
                            for i in (set.len()..row.len()).rev() {
                                row[i] = row[i].wrapping_sub(row[i - set.len()]);
                            }
                        }
                        raw.extend_from_slice(&row);
                    }
                    chunks.push(self.compress(raw));
                }
            }
        }
        chunks
    }

    fn compress(&self, raw: Vec<u8>) -> Vec<u8> {
        match self.compression {
            5 => weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
                .encode(&raw)
                .unwrap(),
            8 => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&raw).unwrap();
                encoder.finish().unwrap()
            }
            _ => raw,
        }
    }
}

/// Write `bytes` to `name` inside `dir`.
pub fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Honour,
    Stall,
    IgnoreRange,
}

/// Blocking HTTP/1.1 server on a loopback port, one thread per connection.
pub struct RangeServer {
    addr: SocketAddr,
    requests: Arc<AtomicU32>,
}

impl RangeServer {
    /// Serve `body` at every path.
    pub fn serve(body: Vec<u8>) -> Self {
        Self::start(body, 0, Mode::Honour)
    }

    /// Answer the first `failures` requests with 503.
    pub fn flaky(body: Vec<u8>, failures: u32) -> Self {
        Self::start(body, failures, Mode::Honour)
    }

    /// Accept connections but never answer.
    pub fn stalled() -> Self {
        Self::start(Vec::new(), 0, Mode::Stall)
    }

    /// Answer ranged GETs with `200` and the full length, then hold back the
    /// body.
    pub fn ignoring_ranges(body: Vec<u8>) -> Self {
        Self::start(body, 0, Mode::IgnoreRange)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    /// Requests received so far.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    fn start(body: Vec<u8>, failures: u32, mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(failures));
        let body = Arc::new(body);

        let counter = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let body = Arc::clone(&body);
                let failures = Arc::clone(&failures);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    if mode == Mode::Stall {
                        thread::sleep(Duration::from_secs(30));
                        drop(stream);
                        return;
                    }
                    let _ = respond(stream, &body, &failures, &counter, mode);
                });
            }
        });

        Self { addr, requests }
    }
}

fn respond(
    mut stream: TcpStream,
    body: &[u8],
    failures: &AtomicU32,
    counter: &AtomicU32,
    mode: Mode,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = parse_range(value.trim(), body.len());
            }
        }
    }
    counter.fetch_add(1, Ordering::SeqCst);

    if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
        stream.write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
        return stream.flush();
    }

    if mode == Mode::IgnoreRange && !request_line.starts_with("HEAD") {
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )?;
        stream.flush()?;
        thread::sleep(Duration::from_secs(30));
        return Ok(());
    }

    let (status, payload, content_range) = match range {
        Some((start, end)) => (
            "206 Partial Content",
            &body[start..=end],
            format!("Content-Range: bytes {start}-{end}/{}\r\n", body.len()),
        ),
        None => ("200 OK", body, String::new()),
    };
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n{content_range}Connection: close\r\n\r\n",
        payload.len()
    )?;
    if !request_line.starts_with("HEAD") {
        stream.write_all(payload)?;
    }
    stream.flush()
}

/// Parse `bytes=start-end`, clamping the end to the body.
fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse::<usize>().ok()?.min(len.checked_sub(1)?);
    (start <= end).then_some((start, end))
}
