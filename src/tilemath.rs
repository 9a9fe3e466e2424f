//! Projection math between WGS84 degrees, the Web Mercator unit square,
//! tile indices and pixels. All functions are pure over f64.

use std::f64::consts::PI;

/// The engine renders on a 512px grid; configured tile sizes are clipped or
/// resampled out of it.
pub const INTERNAL_TILE_SIZE: u32 = 512;

pub const MAX_ZOOM: u8 = 22;

pub const EARTH_CIRCUMFERENCE: f64 = 40_075_016.685_578_5;
pub const EARTH_RADIUS: f64 = EARTH_CIRCUMFERENCE / 2.0 / PI;

/// Longitude to [0,1] on the mercator unit square.
pub fn lon_to_x(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

/// Latitude to [0,1] on the mercator unit square.
pub fn lat_to_y(lat: f64) -> f64 {
    let rad = lat.to_radians();
    (1.0 - (rad.tan() + 1.0 / rad.cos()).ln() / PI) / 2.0
}

pub fn x_to_lon(x: f64) -> f64 {
    x * 360.0 - 180.0
}

pub fn y_to_lat(y: f64) -> f64 {
    let n = PI - 2.0 * PI * y;
    n.sinh().atan().to_degrees()
}

/// Tile column for a longitude, clamped into [0, 2^z - 1].
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> u32 {
    let n = 1u32 << zoom;
    let x = (lon_to_x(lon) * f64::from(n)).floor();
    x.clamp(0.0, f64::from(n - 1)) as u32
}

/// Tile row for a latitude, clamped into [0, 2^z - 1].
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> u32 {
    let n = 1u32 << zoom;
    let y = (lat_to_y(lat) * f64::from(n)).floor();
    y.clamp(0.0, f64::from(n - 1)) as u32
}

pub fn lon_to_pixel(lon: f64, zoom: f64, tile_size: u32) -> f64 {
    lon_to_x(lon) * zoom.exp2() * f64::from(tile_size)
}

pub fn lat_to_pixel(lat: f64, zoom: f64, tile_size: u32) -> f64 {
    lat_to_y(lat) * zoom.exp2() * f64::from(tile_size)
}

/// Geographic center of a tile as (lon, lat).
pub fn tile_center(z: u8, x: u32, y: u32) -> (f64, f64) {
    let n = f64::from(1u32 << z);
    (
        x_to_lon((f64::from(x) + 0.5) / n),
        y_to_lat((f64::from(y) + 0.5) / n),
    )
}

/// Zoom at which the bbox fits a width x height viewport with the given
/// fractional padding on every edge. The more constraining dimension wins;
/// never negative. Degenerate (zero-area) boxes yield +inf and are expected
/// to be clamped by the caller's maxzoom.
pub fn zoom_for_bbox(
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    width: u32,
    height: u32,
    padding: f64,
) -> f64 {
    let box_w = (lon_to_x(max_lon) - lon_to_x(min_lon)).abs();
    let box_h = (lat_to_y(min_lat) - lat_to_y(max_lat)).abs();
    let pad = 1.0 + 2.0 * padding;
    let internal = f64::from(INTERNAL_TILE_SIZE);
    let fit_w = f64::from(width) / pad / box_w / internal;
    let fit_h = f64::from(height) / pad / box_h / internal;
    fit_w.min(fit_h).log2().max(0.0)
}

/// EPSG:3857 meters to WGS84 degrees.
pub fn webmercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = f64::atan(f64::sinh(y / EARTH_RADIUS)).to_degrees();
    (lon, lat)
}

/// WGS84 degrees to EPSG:3857 meters.
pub fn wgs84_to_webmercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = ((90.0 + lat) * PI / 360.0).tan().ln() * EARTH_RADIUS;
    (x, y)
}
