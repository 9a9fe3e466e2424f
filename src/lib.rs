//! Map tile server over MBTiles archives with headless MapLibre rendering.
//!
//! The crate serves raster tiles rendered per (style, z, x, y, scale),
//! vector/raster data tiles straight out of MBTiles (with on-the-fly
//! MVT to GeoJSON transcoding), composited static maps, and the client
//! resources web maps need: TileJSON, style JSON, sprites, glyphs and WMTS
//! capabilities.

pub mod config;
pub mod error;
pub mod mbtiles;
pub mod polyline;
pub mod pool;
pub mod render;
pub mod server;
pub mod staticmap;
pub mod style;
pub mod tilemath;
pub mod vector;
pub mod worker;
