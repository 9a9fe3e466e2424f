//! Headless renderer workers. Every (style, scale) pair owns an elastic
//! pool; each worker thread holds one `ImageRenderer` built from the
//! style's renderer-form document. The frontend is sized at construction,
//! so a worker re-materializes its renderer when a request needs a
//! different logical size; tile requests always use the same padded size.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::num::NonZeroU32;
use std::sync::Arc;

use image::{imageops, RgbaImage};
use maplibre_native::{ImageRenderer, ImageRendererBuilder, Static};
use tempfile::NamedTempFile;

use crate::config::Options;
use crate::error::ServiceError;
use crate::pool::{Pool, DEFAULT_IDLE_TIMEOUT};
use crate::style::{self, DataEntry, StyleEntry};
use crate::tilemath::INTERNAL_TILE_SIZE;
use crate::worker::Worker;

pub struct RenderResource {
    style_file: Arc<NamedTempFile>,
    scale: u8,
    renderer: Option<SizedRenderer>,
}

struct SizedRenderer {
    width: u32,
    height: u32,
    map: ImageRenderer<Static>,
}

impl RenderResource {
    fn new(style_file: Arc<NamedTempFile>, scale: u8) -> Self {
        Self {
            style_file,
            scale,
            renderer: None,
        }
    }

    fn map_for(&mut self, width: u32, height: u32) -> Result<&mut ImageRenderer<Static>, ServiceError> {
        let reusable = matches!(
            &self.renderer,
            Some(current) if current.width == width && current.height == height
        );
        if !reusable {
            // Tear the old frontend down before building the next one.
            self.renderer = None;
            let w = NonZeroU32::new(width)
                .ok_or_else(|| ServiceError::BadRequest("Invalid size".to_string()))?;
            let h = NonZeroU32::new(height)
                .ok_or_else(|| ServiceError::BadRequest("Invalid size".to_string()))?;
            let mut map = ImageRendererBuilder::new()
                .with_size(w, h)
                .with_pixel_ratio(f32::from(self.scale))
                .build_static_renderer();
            map.load_style_from_path(self.style_file.path().to_path_buf())
                .map_err(|err| ServiceError::Render(format!("cannot load style: {err:?}")))?;
            self.renderer = Some(SizedRenderer {
                width,
                height,
                map,
            });
        }
        Ok(&mut self.renderer.as_mut().expect("built above").map)
    }

    /// Renders a still at the given logical size and camera; the returned
    /// bitmap is `width*scale x height*scale` physical pixels.
    pub fn render(
        &mut self,
        width: u32,
        height: u32,
        lat: f64,
        lon: f64,
        zoom: f64,
        bearing: f64,
        pitch: f64,
    ) -> Result<RgbaImage, ServiceError> {
        let map = self.map_for(width, height)?;
        let image = map
            .render_static(lat, lon, zoom, bearing, pitch)
            .map_err(|err| ServiceError::Render(err.to_string()))?;
        Ok(image.as_image().clone())
    }
}

/// Engine zoom at which one tile of the configured size spans exactly
/// `tile_size` pixels. Negative when the tile size is below the 512 grid.
pub fn internal_zoom(z: u8, tile_size: u32) -> f64 {
    f64::from(z) + (f64::from(tile_size) / f64::from(INTERNAL_TILE_SIZE)).log2()
}

/// Cuts the delivered tile out of a margin-padded render. For non-negative
/// internal zooms that is a plain margin crop; below zoom zero the engine
/// rendered at zoom 0, so a larger centered square is extracted and
/// down-sampled.
pub fn clip_tile(
    raw: RgbaImage,
    tile_size: u32,
    margin: u32,
    scale: u8,
    internal_zoom: f64,
) -> RgbaImage {
    if margin == 0 {
        return raw;
    }
    let scale = u32::from(scale);
    let out = tile_size * scale;
    if internal_zoom >= 0.0 {
        imageops::crop_imm(&raw, margin * scale, margin * scale, out, out).to_image()
    } else {
        let factor = 1u32 << ((-internal_zoom.floor()) as u32);
        let side = (tile_size * factor * scale).min(raw.width()).min(raw.height());
        let offset_x = (raw.width() - side) / 2;
        let offset_y = (raw.height() - side) / 2;
        let subset = imageops::crop_imm(&raw, offset_x, offset_y, side, side).to_image();
        imageops::resize(&subset, out, out, imageops::FilterType::CatmullRom)
    }
}

/// All renderer pools, keyed by (style id, scale factor).
pub struct RenderPools {
    pools: HashMap<(String, u8), Pool<RenderResource>>,
}

impl RenderPools {
    pub async fn build(
        styles: &BTreeMap<String, StyleEntry>,
        data: &BTreeMap<String, DataEntry>,
        options: &Options,
    ) -> Result<Self, ServiceError> {
        let mut pools = HashMap::new();
        for entry in styles.values().filter(|entry| entry.serve_rendered) {
            let document = style::renderer_style(entry, data, options);
            let serialized = serde_json::to_vec(&document)
                .map_err(|err| ServiceError::Internal(anyhow::Error::from(err)))?;
            let mut file = NamedTempFile::new()
                .map_err(|err| ServiceError::Internal(anyhow::Error::from(err)))?;
            file.write_all(&serialized)
                .map_err(|err| ServiceError::Internal(anyhow::Error::from(err)))?;
            let file = Arc::new(file);

            for scale in 1..=options.max_scale_factor {
                let id = entry.id.clone();
                let file = Arc::clone(&file);
                let pool = Pool::new(
                    options.pool_min(scale),
                    options.pool_max(scale),
                    DEFAULT_IDLE_TIMEOUT,
                    move |ordinal| {
                        let file = Arc::clone(&file);
                        Worker::spawn(format!("render-{id}-{scale}x-{ordinal}"), move || {
                            Ok(RenderResource::new(file, scale))
                        })
                    },
                )
                .await?;
                pools.insert((entry.id.clone(), scale), pool);
            }
        }
        Ok(Self { pools })
    }

    pub fn get(&self, id: &str, scale: u8) -> Option<&Pool<RenderResource>> {
        self.pools.get(&(id.to_string(), scale))
    }

    pub fn dispose(&self) {
        for pool in self.pools.values() {
            pool.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    fn checker(size: u32, cell: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    #[test]
    fn internal_zoom_tracks_tile_size() {
        assert_eq!(internal_zoom(4, 512), 4.0);
        assert_eq!(internal_zoom(4, 256), 3.0);
        assert_eq!(internal_zoom(0, 256), -1.0);
        assert_eq!(internal_zoom(2, 1024), 3.0);
    }

    #[test]
    fn clip_extracts_the_margin_window() {
        // 256px tile, 64px margin, scale 1: raw render is 384x384 and the
        // tile is the centered 256x256 window.
        let mut raw = RgbaImage::from_pixel(384, 384, Rgba([0, 0, 0, 255]));
        raw.put_pixel(64, 64, Rgba([255, 0, 0, 255]));
        let tile = clip_tile(raw, 256, 64, 1, 2.0);
        assert_eq!(tile.dimensions(), (256, 256));
        assert_eq!(tile.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn clip_respects_scale_factor() {
        let raw = RgbaImage::from_pixel(768, 768, Rgba([9, 9, 9, 255]));
        let tile = clip_tile(raw, 256, 64, 2, 2.0);
        assert_eq!(tile.dimensions(), (512, 512));
    }

    #[test]
    fn negative_internal_zoom_downsamples() {
        // tile_size 256 at z0: internal zoom -1, raw render 512x512; the
        // full frame shrinks to 256x256.
        let raw = checker(512, 64);
        let tile = clip_tile(raw, 256, 128, 1, -1.0);
        assert_eq!(tile.dimensions(), (256, 256));
    }

    #[test]
    fn zero_margin_passes_through() {
        let raw = checker(512, 64);
        let tile = clip_tile(raw.clone(), 512, 0, 1, 3.0);
        assert_eq!(tile, raw);
    }
}
