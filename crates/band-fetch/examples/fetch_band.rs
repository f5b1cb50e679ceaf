//! Example: Fetch one band of a remote or local GeoTIFF.
//!
//! Usage: cargo run --example fetch_band -- <url> [max_dimension] [band]
//!
//! Set `RUST_LOG=band_fetch=debug` to see range requests and retries.

use band_fetch::{read_band_with_retry, FetchConfig, RasterSource, DEFAULT_MAX_DIMENSION};
use std::env;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("band_fetch=info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <url> [max_dimension] [band]", args[0]);
        eprintln!(
            "Example: {} https://example.com/scenes/T10TET_B04.tif 1024",
            args[0]
        );
        std::process::exit(1);
    }

    let max_dimension: u32 = args
        .get(2)
        .map(|s| s.parse().expect("Invalid max_dimension"))
        .unwrap_or(DEFAULT_MAX_DIMENSION);
    let band: u16 = args.get(3).map(|s| s.parse().expect("Invalid band")).unwrap_or(1);

    let source = match RasterSource::new(args[1].as_str()) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let config = FetchConfig {
        band,
        ..FetchConfig::default().with_max_dimension(max_dimension)
    };

    println!("Fetching band {} of {}...", band, source);

    match read_band_with_retry(&source, &config) {
        Ok(result) => {
            println!(
                "Read {}x{} {:?} pixels (native {}x{}) in {:.2}s",
                result.width(),
                result.height(),
                result.pixels.sample_type(),
                result.native_width,
                result.native_height,
                result.elapsed.as_secs_f64()
            );
            if let Some(level) = result.overview_level {
                println!("Source level: overview {}", level);
            }
            println!(
                "Transferred {:.2} MB for a {:.2} MB band",
                result.bytes_transferred as f64 / (1024.0 * 1024.0),
                result.size_bytes as f64 / (1024.0 * 1024.0)
            );

            let gt = result.geo_transform;
            println!("Geotransform: {:?}", gt.to_gdal());
            let [top_left, _, bottom_right, _] = gt.corners(result.width() as u32, result.height() as u32);
            println!(
                "Extent: ({:.3}, {:.3}) to ({:.3}, {:.3})",
                top_left.0, top_left.1, bottom_right.0, bottom_right.1
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
