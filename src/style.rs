//! Style and data-source loading. A style document is kept in one canonical
//! form with `local://` placeholder URLs and rewritten on the way out: to
//! concrete `mbtiles://`/`file://` URLs for renderers, to the public URL for
//! clients. Entries that fail to load are removed, not fatal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{Config, Options, StyleConfig};
use crate::error::ServiceError;
use crate::mbtiles::FileSources;
use crate::tilemath;

#[derive(Debug, Clone)]
pub struct DataEntry {
    pub id: String,
    /// Absolute path of the MBTiles archive.
    pub path: PathBuf,
    pub tilejson: Value,
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct StyleEntry {
    pub id: String,
    /// The style document in its `local://` form.
    pub style_json: Value,
    /// TileJSON for the rendered raster set.
    pub tilejson: Value,
    /// Sprite sheet base path relative to the sprites directory.
    pub sprite_path: Option<String>,
    pub serve_rendered: bool,
    pub serve_data: bool,
}

fn mbtiles_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^mbtiles://\{([^}]+)\}$").expect("valid pattern"))
}

/// Loads every configured data entry through the file-source pool. Failing
/// entries are dropped with a warning.
pub async fn load_data(config: &Config, sources: &FileSources) -> BTreeMap<String, DataEntry> {
    let mut entries = BTreeMap::new();
    for (id, entry) in &config.data {
        match load_data_entry(&config.options, sources, id, &entry.mbtiles, &entry.tilejson).await
        {
            Ok(entry) => {
                entries.insert(id.clone(), entry);
            }
            Err(err) => warn!("removing data source {id}: {err}"),
        }
    }
    entries
}

async fn load_data_entry(
    options: &Options,
    sources: &FileSources,
    id: &str,
    mbtiles: &str,
    user_tilejson: &Value,
) -> Result<DataEntry, ServiceError> {
    let path = options.paths.mbtiles.join(mbtiles);
    let response = sources.fetch_source(&path).await?;
    if let Some(message) = response.error {
        return Err(ServiceError::Upstream(message));
    }
    let data = response
        .data
        .ok_or_else(|| ServiceError::Upstream("empty metadata response".to_string()))?;
    let mut tilejson: Value = serde_json::from_slice(&data)
        .map_err(|err| ServiceError::Upstream(format!("invalid metadata: {err}")))?;

    // Legacy archives carry center as a bare string; drop it.
    if tilejson.get("center").is_some_and(Value::is_string) {
        tilejson
            .as_object_mut()
            .and_then(|object| object.remove("center"));
    }
    merge_tilejson(&mut tilejson, user_tilejson);

    let filesize = std::fs::metadata(&path)
        .map_err(|err| ServiceError::Upstream(format!("cannot stat {}: {err}", path.display())))?
        .len();
    tilejson["tilejson"] = json!("2.0.0");
    tilejson["name"] = json!(id);
    tilejson["filesize"] = json!(filesize);
    if tilejson.get("format").is_none() {
        tilejson["format"] = json!("pbf");
    }
    let format = tilejson["format"]
        .as_str()
        .unwrap_or("pbf")
        .to_string();

    Ok(DataEntry {
        id: id.to_string(),
        path,
        tilejson,
        format,
    })
}

/// Loads every configured style. Data entries must already be loaded so
/// `mbtiles://{id}` references can be validated.
pub async fn load_styles(
    config: &Config,
    data: &BTreeMap<String, DataEntry>,
    http: &reqwest::Client,
) -> BTreeMap<String, StyleEntry> {
    let mut entries = BTreeMap::new();
    for (id, entry) in &config.styles {
        match load_style_entry(&config.options, id, entry, data, http).await {
            Ok(entry) => {
                entries.insert(id.clone(), entry);
            }
            Err(err) => warn!("removing style {id}: {err}"),
        }
    }
    entries
}

async fn load_style_entry(
    options: &Options,
    id: &str,
    config: &StyleConfig,
    data: &BTreeMap<String, DataEntry>,
    http: &reqwest::Client,
) -> Result<StyleEntry, ServiceError> {
    let mut style_json = read_style_document(options, &config.style, http).await?;
    let sprite_path = localize_style(&mut style_json, id, data)?;
    let tilejson = style_tilejson(id, &style_json, &config.tilejson, options.tile_size);
    Ok(StyleEntry {
        id: id.to_string(),
        style_json,
        tilejson,
        sprite_path,
        serve_rendered: config.serve_rendered,
        serve_data: config.serve_data,
    })
}

async fn read_style_document(
    options: &Options,
    location: &str,
    http: &reqwest::Client,
) -> Result<Value, ServiceError> {
    let remote = url::Url::parse(location)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https"));
    if remote {
        let response = http
            .get(location)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| ServiceError::Upstream(format!("cannot fetch style: {err}")))?;
        response
            .json()
            .await
            .map_err(|err| ServiceError::Upstream(format!("invalid style JSON: {err}")))
    } else {
        let path = Path::new(location);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            options.paths.styles.join(path)
        };
        let content = std::fs::read_to_string(&path).map_err(|err| {
            ServiceError::Upstream(format!("cannot read style {}: {err}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|err| ServiceError::Upstream(format!("invalid style JSON: {err}")))
    }
}

/// First rewrite pass: internal URLs become stable `local://` placeholders.
/// Returns the resolved sprite path, if the style carries a local sprite.
fn localize_style(
    style_json: &mut Value,
    style_id: &str,
    data: &BTreeMap<String, DataEntry>,
) -> Result<Option<String>, ServiceError> {
    if let Some(sources) = style_json
        .get_mut("sources")
        .and_then(Value::as_object_mut)
    {
        for (name, source) in sources.iter_mut() {
            let Some(url) = source.get("url").and_then(Value::as_str) else {
                continue;
            };
            if let Some(captures) = mbtiles_url_pattern().captures(url) {
                let data_id = captures[1].to_string();
                if !data.contains_key(&data_id) {
                    return Err(ServiceError::Upstream(format!(
                        "source {name} references unknown data {data_id}"
                    )));
                }
                source["url"] = json!(format!("local://data/{data_id}.json"));
            }
        }
    }

    let mut sprite_path = None;
    if let Some(sprite) = style_json.get("sprite").and_then(Value::as_str) {
        if !sprite.starts_with("http://") && !sprite.starts_with("https://") {
            sprite_path = Some(sprite.trim_start_matches('/').to_string());
            style_json["sprite"] = json!(format!("local://styles/{style_id}/sprite"));
        }
    }

    if let Some(glyphs) = style_json.get("glyphs").and_then(Value::as_str) {
        if !glyphs.starts_with("http://") && !glyphs.starts_with("https://") {
            style_json["glyphs"] = json!("local://fonts/{fontstack}/{range}.pbf");
        }
    }

    Ok(sprite_path)
}

/// Second rewrite pass: the document a renderer loads, with every
/// `local://` placeholder replaced by a concrete location.
pub fn renderer_style(
    entry: &StyleEntry,
    data: &BTreeMap<String, DataEntry>,
    options: &Options,
) -> Value {
    let mut document = entry.style_json.clone();
    let sprites_dir = options.paths.sprites.clone();
    let fonts_dir = options.paths.fonts.clone();
    let sprite_path = entry.sprite_path.clone();
    rewrite_strings(&mut document, &|text| {
        if let Some(rest) = text.strip_prefix("local://data/") {
            let id = rest.strip_suffix(".json")?;
            let entry = data.get(id)?;
            return Some(format!("mbtiles://{}", entry.path.display()));
        }
        if text.starts_with("local://styles/") && text.ends_with("/sprite") {
            let sprite = sprite_path.as_deref()?;
            return Some(format!("file://{}", sprites_dir.join(sprite).display()));
        }
        if let Some(rest) = text.strip_prefix("local://fonts/") {
            return Some(format!("file://{}", fonts_dir.join(rest).display()));
        }
        None
    });
    document
}

/// The client-facing document: `local://` swapped for the public URL.
pub fn public_style(entry: &StyleEntry, public_url: &str) -> Value {
    let mut document = entry.style_json.clone();
    rewrite_strings(&mut document, &|text| {
        text.strip_prefix("local://")
            .map(|rest| format!("{public_url}{rest}"))
    });
    document
}

fn rewrite_strings(value: &mut Value, rewrite: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(text) => {
            if let Some(replacement) = rewrite(text) {
                *text = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_strings(item, rewrite);
            }
        }
        Value::Object(object) => {
            for item in object.values_mut() {
                rewrite_strings(item, rewrite);
            }
        }
        _ => {}
    }
}

/// Default raster TileJSON for a style, overlaid with user-supplied fields
/// and a derived center.
fn style_tilejson(id: &str, style_json: &Value, user: &Value, tile_size: u32) -> Value {
    let name = style_json
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(id);
    let mut tilejson = json!({
        "tilejson": "2.0.0",
        "name": name,
        "attribution": "",
        "minzoom": 0,
        "maxzoom": 20,
        "bounds": [-180.0, -85.0511, 180.0, 85.0511],
        "format": "png",
        "type": "baselayer"
    });
    merge_tilejson(&mut tilejson, user);

    let style_center = style_json.get("center").and_then(Value::as_array);
    let style_zoom = style_json.get("zoom").and_then(Value::as_f64);
    if let (Some(center), Some(zoom)) = (style_center, style_zoom) {
        if center.len() >= 2 {
            tilejson["center"] = json!([center[0], center[1], zoom.round()]);
        }
    } else if tilejson.get("center").is_none() {
        if let Some(bounds) = bounds_array(&tilejson) {
            let zoom = tilemath::zoom_for_bbox(
                bounds[0], bounds[1], bounds[2], bounds[3], tile_size, tile_size, 0.1,
            )
            .round();
            tilejson["center"] = json!([
                (bounds[0] + bounds[2]) / 2.0,
                (bounds[1] + bounds[3]) / 2.0,
                zoom
            ]);
        }
    }
    tilejson
}

fn bounds_array(tilejson: &Value) -> Option<[f64; 4]> {
    let bounds = tilejson.get("bounds")?.as_array()?;
    if bounds.len() != 4 {
        return None;
    }
    let mut out = [0.0; 4];
    for (slot, value) in out.iter_mut().zip(bounds) {
        *slot = value.as_f64()?;
    }
    Some(out)
}

/// Shallow overlay: user keys win.
pub fn merge_tilejson(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base), Value::Object(overlay)) = (base, overlay) {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }
}
