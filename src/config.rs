//! JSON configuration: `{options, styles, data}`. Keys are accepted in
//! camelCase or all-lowercase. Everything is immutable after startup; a
//! configured directory that does not exist aborts the process.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tilemath::INTERNAL_TILE_SIZE;

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub options: Options,
    pub styles: BTreeMap<String, StyleConfig>,
    pub data: BTreeMap<String, DataConfig>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    pub paths: Paths,
    #[serde(alias = "tilesize")]
    pub tile_size: u32,
    #[serde(alias = "tilemargin")]
    pub tile_margin: u32,
    #[serde(alias = "minrendererpoolsizes")]
    pub min_renderer_pool_sizes: Vec<usize>,
    #[serde(alias = "maxrendererpoolsizes")]
    pub max_renderer_pool_sizes: Vec<usize>,
    /// [min_lon, min_lat, max_lon, max_lat]; normalized so min <= max.
    #[serde(alias = "servebounds")]
    pub serve_bounds: [f64; 4],
    #[serde(alias = "maxscalefactor")]
    pub max_scale_factor: u8,
    /// Largest accepted static image dimension.
    #[serde(alias = "maxsize")]
    pub max_size: u32,
    #[serde(alias = "formatquality")]
    pub format_quality: FormatQuality,
    #[serde(alias = "allowremotemarkericons")]
    pub allow_remote_marker_icons: bool,
    #[serde(alias = "servestaticmaps")]
    pub serve_static_maps: bool,
    pub threads: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            tile_size: 256,
            tile_margin: 0,
            min_renderer_pool_sizes: vec![8, 4, 2],
            max_renderer_pool_sizes: vec![16, 8, 4],
            serve_bounds: [-180.0, -85.0511, 180.0, 85.0511],
            max_scale_factor: 3,
            max_size: 2048,
            format_quality: FormatQuality::default(),
            allow_remote_marker_icons: false,
            serve_static_maps: true,
            threads: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Paths {
    pub root: PathBuf,
    pub styles: PathBuf,
    pub fonts: PathBuf,
    pub sprites: PathBuf,
    pub icons: PathBuf,
    pub mbtiles: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            styles: PathBuf::from("styles"),
            fonts: PathBuf::from("fonts"),
            sprites: PathBuf::from("sprites"),
            icons: PathBuf::from("icons"),
            mbtiles: PathBuf::from("mbtiles"),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct FormatQuality {
    pub png: u8,
    pub jpeg: u8,
    pub webp: u8,
}

impl Default for FormatQuality {
    fn default() -> Self {
        Self {
            png: 90,
            jpeg: 80,
            webp: 90,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StyleConfig {
    /// Style JSON location: absolute path, path relative to the styles
    /// directory, or an HTTP URL.
    pub style: String,
    #[serde(default)]
    pub tilejson: serde_json::Value,
    #[serde(default = "default_true", alias = "serverendered")]
    pub serve_rendered: bool,
    #[serde(default = "default_true", alias = "servedata")]
    pub serve_data: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DataConfig {
    /// MBTiles filename relative to the mbtiles directory.
    pub mbtiles: String,
    #[serde(default)]
    pub tilejson: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        config.options.normalize();
        config.options.validate()?;
        Ok(config)
    }
}

impl Options {
    pub fn normalize(&mut self) {
        self.max_scale_factor = self.max_scale_factor.clamp(1, 9);
        if self.serve_bounds[0] > self.serve_bounds[2] {
            self.serve_bounds.swap(0, 2);
        }
        if self.serve_bounds[1] > self.serve_bounds[3] {
            self.serve_bounds.swap(1, 3);
        }
        let root = self.paths.root.clone();
        for dir in [
            &mut self.paths.styles,
            &mut self.paths.fonts,
            &mut self.paths.sprites,
            &mut self.paths.icons,
            &mut self.paths.mbtiles,
        ] {
            if dir.is_relative() {
                *dir = root.join(&*dir);
            }
        }
    }

    /// Missing directories are fatal.
    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("root", &self.paths.root),
            ("styles", &self.paths.styles),
            ("fonts", &self.paths.fonts),
            ("sprites", &self.paths.sprites),
            ("icons", &self.paths.icons),
            ("mbtiles", &self.paths.mbtiles),
        ] {
            if !dir.is_dir() {
                bail!("{name} directory {} does not exist", dir.display());
            }
        }
        Ok(())
    }

    /// Margin actually rendered around each tile: at least enough to pad
    /// the configured tile size up to the engine's 512 grid.
    pub fn effective_tile_margin(&self) -> u32 {
        let needed = INTERNAL_TILE_SIZE.saturating_sub(self.tile_size) / 2;
        self.tile_margin.max(needed)
    }

    pub fn pool_min(&self, scale: u8) -> usize {
        indexed_size(&self.min_renderer_pool_sizes, scale, 1)
    }

    pub fn pool_max(&self, scale: u8) -> usize {
        indexed_size(&self.max_renderer_pool_sizes, scale, 2)
    }
}

/// Pool sizes are indexed by scale-1; requests past the end of the list use
/// its last element.
fn indexed_size(sizes: &[usize], scale: u8, fallback: usize) -> usize {
    let index = usize::from(scale.saturating_sub(1));
    sizes
        .get(index)
        .or_else(|| sizes.last())
        .copied()
        .unwrap_or(fallback)
}
