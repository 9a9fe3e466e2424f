//! Routes and the HTTP edge: parameter parsing, serve-bounds gating,
//! format gating and transcoding, response headers. Handlers translate
//! component errors into status codes and never hold more than one worker
//! of a pool at a time.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png;
use image::codecs::webp::WebPEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, RgbaImage};
use regex::Regex;
use serde_json::{json, Value};
use tera::Tera;
use tracing::info;

use crate::config::{FormatQuality, Options};
use crate::error::ServiceError;
use crate::mbtiles::FileSources;
use crate::render::{self, RenderPools, RenderResource};
use crate::staticmap::{self, OverlayDefaults, Overlays, ScreenProjection, ViewportSpec};
use crate::style::{self, DataEntry, StyleEntry};
use crate::tilemath;
use crate::vector;

const TILE_CACHE: &str = "public, max-age=3600";
const ASSET_CACHE: &str = "public, max-age=86400";

pub struct AppState {
    pub options: Options,
    pub styles: BTreeMap<String, StyleEntry>,
    pub data: BTreeMap<String, DataEntry>,
    pub sources: FileSources,
    pub renderers: RenderPools,
    pub http: reqwest::Client,
    pub templates: Tera,
}

pub fn templates() -> anyhow::Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_template("index.html", include_str!("templates/index.html"))?;
    tera.add_raw_template("wmts.xml", include_str!("templates/wmts.xml"))?;
    Ok(tera)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/styles/{file}", get(style_tilejson))
        .route("/styles/{id}/style.json", get(style_document))
        .route("/styles/{id}/wmts.xml", get(wmts_capabilities))
        .route("/styles/{id}/{file}", get(sprite_file))
        .route("/styles/{id}/static/{*rest}", get(static_map))
        .route("/styles/{id}/{z}/{x}/{file}", get(rendered_tile))
        .route("/data/{file}", get(data_tilejson))
        .route("/data/{id}/{z}/{x}/{file}", get(data_tile))
        .route("/fonts/{fontstack}/{file}", get(glyph_range))
        .layer(axum::middleware::from_fn(log_request_response))
        .with_state(state)
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!("{} {} -> {}", method, path, response.status());
    response
}

// --- Path grammar ---

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\- ]+$").expect("valid pattern"))
}

fn tile_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)(?:@(\d+)x)?\.([a-zA-Z]+)$").expect("valid pattern"))
}

fn sprite_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^sprite(@\d+x)?\.(json|png)$").expect("valid pattern"))
}

fn glyph_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+-\d+\.pbf$").expect("valid pattern"))
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\d+)x(\d+)(?:@(\d+)x)?\.([a-zA-Z]+)$").expect("valid pattern"))
}

fn center_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(-?\d*\.?\d+),(-?\d*\.?\d+),(\d*\.?\d+)(?:@(-?\d*\.?\d+)(?:,(-?\d*\.?\d+))?)?$",
        )
        .expect("valid pattern")
    })
}

fn bbox_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(-?\d*\.?\d+),(-?\d*\.?\d+),(-?\d*\.?\d+),(-?\d*\.?\d+)$")
            .expect("valid pattern")
    })
}

fn require_valid_id(id: &str) -> Result<(), ServiceError> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(ServiceError::NotFound("Not found".to_string()))
    }
}

/// The serve-bounds gate: tile indices outside the configured rectangle are
/// rejected before any worker is touched.
fn require_in_serve_bounds(
    bounds: [f64; 4],
    z: u8,
    x: u32,
    y: u32,
) -> Result<(), ServiceError> {
    if z > tilemath::MAX_ZOOM {
        return Err(ServiceError::BadRequest("Out of bounds".to_string()));
    }
    let min_x = tilemath::lon_to_tile_x(bounds[0], z);
    let max_x = tilemath::lon_to_tile_x(bounds[2], z);
    let min_y = tilemath::lat_to_tile_y(bounds[3], z);
    let max_y = tilemath::lat_to_tile_y(bounds[1], z);
    if x < min_x || x > max_x || y < min_y || y > max_y {
        return Err(ServiceError::BadRequest("Out of bounds".to_string()));
    }
    Ok(())
}

fn require_scale(options: &Options, scale: u8) -> Result<(), ServiceError> {
    if (1..=options.max_scale_factor).contains(&scale) {
        Ok(())
    } else {
        Err(ServiceError::BadRequest("Invalid scale".to_string()))
    }
}

/// jpg and jpeg address the same stored format.
fn normalize_format(format: &str) -> &str {
    if format == "jpeg" {
        "jpg"
    } else {
        format
    }
}

fn public_url(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}/")
}

// --- Response builders ---

fn body_response(
    body: Vec<u8>,
    content_type: &'static str,
    encoding: Option<&'static str>,
    cache: Option<&'static str>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(encoding) = encoding {
        builder = builder.header(header::CONTENT_ENCODING, encoding);
    }
    if let Some(cache) = cache {
        builder = builder.header(header::CACHE_CONTROL, cache);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(value: &Value) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}

fn encode_raster(
    image: &RgbaImage,
    format: &str,
    quality: FormatQuality,
) -> Result<(Vec<u8>, &'static str), ServiceError> {
    let (width, height) = image.dimensions();
    let mut cursor = Cursor::new(Vec::new());
    let content_type = match normalize_format(format) {
        "png" => {
            let compression = if quality.png >= 90 {
                png::CompressionType::Best
            } else if quality.png <= 30 {
                png::CompressionType::Fast
            } else {
                png::CompressionType::Default
            };
            png::PngEncoder::new_with_quality(&mut cursor, compression, png::FilterType::Adaptive)
                .write_image(image.as_raw(), width, height, ColorType::Rgba8.into())
                .map_err(|err| ServiceError::Render(err.to_string()))?;
            "image/png"
        }
        "jpg" => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut cursor, quality.jpeg)
                .write_image(rgb.as_raw(), width, height, ColorType::Rgb8.into())
                .map_err(|err| ServiceError::Render(err.to_string()))?;
            "image/jpeg"
        }
        "webp" => {
            WebPEncoder::new_lossless(&mut cursor)
                .write_image(image.as_raw(), width, height, ColorType::Rgba8.into())
                .map_err(|err| ServiceError::Render(err.to_string()))?;
            "image/webp"
        }
        other => {
            return Err(ServiceError::BadRequest(format!("Invalid format: {other}")));
        }
    };
    Ok((cursor.into_inner(), content_type))
}

// --- Handlers ---

async fn landing(State(state): State<Arc<AppState>>) -> Result<Response, ServiceError> {
    let styles: Vec<Value> = state
        .styles
        .values()
        .map(|entry| {
            json!({
                "id": entry.id,
                "name": entry.tilejson.get("name").and_then(Value::as_str).unwrap_or(&entry.id),
                "rendered": entry.serve_rendered,
                "data": entry.serve_data,
            })
        })
        .collect();
    let data: Vec<Value> = state
        .data
        .values()
        .map(|entry| json!({"id": entry.id, "format": entry.format}))
        .collect();
    let mut context = tera::Context::new();
    context.insert("styles", &styles);
    context.insert("data", &data);
    let html = state
        .templates
        .render("index.html", &context)
        .map_err(|err| ServiceError::Internal(anyhow::anyhow!("template error: {err}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}

async fn style_tilejson(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let id = file
        .strip_suffix(".json")
        .ok_or_else(|| ServiceError::NotFound("Not found".to_string()))?;
    require_valid_id(id)?;
    let entry = state
        .styles
        .get(id)
        .filter(|entry| entry.serve_rendered)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let mut tilejson = entry.tilejson.clone();
    tilejson["tiles"] = json!([format!(
        "{}styles/{}/{{z}}/{{x}}/{{y}}.png",
        public_url(&headers),
        entry.id
    )]);
    Ok(json_response(&tilejson))
}

async fn style_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    require_valid_id(&id)?;
    let entry = state
        .styles
        .get(&id)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let document = style::public_style(entry, &public_url(&headers));
    Ok(json_response(&document))
}

async fn wmts_capabilities(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    require_valid_id(&id)?;
    let entry = state
        .styles
        .get(&id)
        .filter(|entry| entry.serve_rendered)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let maxzoom = entry
        .tilejson
        .get("maxzoom")
        .and_then(Value::as_u64)
        .unwrap_or(20)
        .min(u64::from(tilemath::MAX_ZOOM));
    let matrices: Vec<Value> = (0..=maxzoom)
        .map(|z| {
            json!({
                "id": z,
                // 2^z tiles across the 559M top-level WMTS scale.
                "scale_denominator": 559_082_264.028_717_2 / (z as f64).exp2(),
                "matrix_size": 1u64 << z,
            })
        })
        .collect();
    let bounds = entry
        .tilejson
        .get("bounds")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| vec![json!(-180.0), json!(-85.0511), json!(180.0), json!(85.0511)]);
    let mut context = tera::Context::new();
    context.insert("id", &entry.id);
    context.insert(
        "name",
        entry
            .tilejson
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&entry.id),
    );
    context.insert("public_url", &public_url(&headers));
    context.insert("bounds", &bounds);
    context.insert("matrices", &matrices);
    let xml = state
        .templates
        .render("wmts.xml", &context)
        .map_err(|err| ServiceError::Internal(anyhow::anyhow!("template error: {err}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/xml"),
            (header::CACHE_CONTROL, ASSET_CACHE),
        ],
        xml,
    )
        .into_response())
}

async fn sprite_file(
    State(state): State<Arc<AppState>>,
    Path((id, file)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    require_valid_id(&id)?;
    let captures = sprite_pattern()
        .captures(&file)
        .ok_or_else(|| ServiceError::NotFound("Not found".to_string()))?;
    let entry = state
        .styles
        .get(&id)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let sprite_path = entry
        .sprite_path
        .as_ref()
        .ok_or_else(|| ServiceError::NotFound("Sprite not configured".to_string()))?;
    let suffix = captures.get(1).map_or("", |m| m.as_str());
    let extension = &captures[2];
    let path = state
        .options
        .paths
        .sprites
        .join(format!("{sprite_path}{suffix}.{extension}"));
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ServiceError::NotFound("Sprite not found".to_string()))?;
    let content_type = if extension == "json" {
        "application/json"
    } else {
        "image/png"
    };
    Ok(body_response(bytes, content_type, None, Some(ASSET_CACHE)))
}

async fn glyph_range(
    State(state): State<Arc<AppState>>,
    Path((fontstack, file)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    require_valid_id(&fontstack)?;
    if !glyph_pattern().is_match(&file) {
        return Err(ServiceError::NotFound("Not found".to_string()));
    }
    let path = state.options.paths.fonts.join(&fontstack).join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ServiceError::NotFound("Font not found".to_string()))?;
    Ok(body_response(
        bytes,
        "application/x-protobuf",
        None,
        Some(ASSET_CACHE),
    ))
}

async fn data_tilejson(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let id = file
        .strip_suffix(".json")
        .ok_or_else(|| ServiceError::NotFound("Not found".to_string()))?;
    require_valid_id(id)?;
    let entry = state
        .data
        .get(id)
        .ok_or_else(|| ServiceError::NotFound("Data not found".to_string()))?;
    let mut tilejson = entry.tilejson.clone();
    tilejson["tiles"] = json!([format!(
        "{}data/{}/{{z}}/{{x}}/{{y}}.{}",
        public_url(&headers),
        entry.id,
        entry.format
    )]);
    Ok(json_response(&tilejson))
}

async fn data_tile(
    State(state): State<Arc<AppState>>,
    Path((id, z, x, file)): Path<(String, u8, u32, String)>,
) -> Result<Response, ServiceError> {
    require_valid_id(&id)?;
    let captures = tile_file_pattern()
        .captures(&file)
        .ok_or_else(|| ServiceError::BadRequest("Invalid tile path".to_string()))?;
    if captures.get(2).is_some() {
        // Data tiles have no scale dimension.
        return Err(ServiceError::BadRequest("Invalid tile path".to_string()));
    }
    let y: u32 = captures[1]
        .parse()
        .map_err(|_| ServiceError::BadRequest("Invalid tile path".to_string()))?;
    let format = captures[3].to_string();
    if !matches!(
        normalize_format(&format),
        "pbf" | "png" | "jpg" | "webp" | "geojson"
    ) {
        return Err(ServiceError::BadRequest("Invalid format".to_string()));
    }
    require_in_serve_bounds(state.options.serve_bounds, z, x, y)?;
    let entry = state
        .data
        .get(&id)
        .ok_or_else(|| ServiceError::NotFound("Data not found".to_string()))?;

    let requested = normalize_format(&format);
    let stored = normalize_format(&entry.format);
    if requested != stored && !(requested == "geojson" && stored == "pbf") {
        return Err(ServiceError::BadRequest("Invalid format".to_string()));
    }

    let response = state.sources.fetch_tile(&entry.path, z, x, y).await?;
    if let Some(message) = response.error {
        return Err(ServiceError::Upstream(message));
    }
    if response.no_content {
        return Err(ServiceError::NoContent);
    }
    let data = response
        .data
        .ok_or_else(|| ServiceError::Upstream("empty tile response".to_string()))?;

    match requested {
        "geojson" => {
            let body = vector::tile_to_geojson(&data, z, x, y)?;
            let body = vector::gzip(&body)?;
            Ok(body_response(
                body,
                "application/json",
                Some("gzip"),
                Some(TILE_CACHE),
            ))
        }
        "pbf" => {
            let body = vector::ensure_gzipped(data)?;
            Ok(body_response(
                body,
                "application/x-protobuf",
                Some("gzip"),
                Some(TILE_CACHE),
            ))
        }
        "png" => Ok(body_response(data, "image/png", None, Some(TILE_CACHE))),
        "jpg" => Ok(body_response(data, "image/jpeg", None, Some(TILE_CACHE))),
        _ => Ok(body_response(data, "image/webp", None, Some(TILE_CACHE))),
    }
}

async fn rendered_tile(
    State(state): State<Arc<AppState>>,
    Path((id, z, x, file)): Path<(String, u8, u32, String)>,
) -> Result<Response, ServiceError> {
    require_valid_id(&id)?;
    let captures = tile_file_pattern()
        .captures(&file)
        .ok_or_else(|| ServiceError::BadRequest("Invalid tile path".to_string()))?;
    let y: u32 = captures[1]
        .parse()
        .map_err(|_| ServiceError::BadRequest("Invalid tile path".to_string()))?;
    // A missing @Nx is a 1x request.
    let scale: u8 = captures
        .get(2)
        .map_or(Ok(1), |m| m.as_str().parse())
        .map_err(|_| ServiceError::BadRequest("Invalid scale".to_string()))?;
    let format = captures[3].to_string();
    if !matches!(normalize_format(&format), "png" | "jpg" | "webp") {
        return Err(ServiceError::BadRequest("Invalid format".to_string()));
    }
    require_scale(&state.options, scale)?;
    require_in_serve_bounds(state.options.serve_bounds, z, x, y)?;
    let entry = state
        .styles
        .get(&id)
        .filter(|entry| entry.serve_rendered)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let pool = state
        .renderers
        .get(&entry.id, scale)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;

    let tile_size = state.options.tile_size;
    let margin = state.options.effective_tile_margin();
    let map_size = tile_size + 2 * margin;
    let internal_zoom = render::internal_zoom(z, tile_size);
    let (lon, lat) = tilemath::tile_center(z, x, y);

    let worker = pool.acquire().await?;
    let raw = worker
        .submit(move |renderer: &mut RenderResource| {
            renderer.render(
                map_size,
                map_size,
                lat,
                lon,
                internal_zoom.max(0.0),
                0.0,
                0.0,
            )
        })
        .await?;
    drop(worker);

    let tile = render::clip_tile(raw, tile_size, margin, scale, internal_zoom);
    let (body, content_type) = encode_raster(&tile, &format, state.options.format_quality)?;
    Ok(body_response(body, content_type, None, Some(TILE_CACHE)))
}

async fn static_map(
    State(state): State<Arc<AppState>>,
    Path((id, rest)): Path<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ServiceError> {
    if !state.options.serve_static_maps {
        return Err(ServiceError::NotFound("Not found".to_string()));
    }
    require_valid_id(&id)?;
    let entry = state
        .styles
        .get(&id)
        .filter(|entry| entry.serve_rendered)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;

    let (raw_mode, rest) = match rest.strip_prefix("raw/") {
        Some(rest) => (true, rest),
        None => (false, rest.as_str()),
    };
    let (view_part, size_part) = rest
        .split_once('/')
        .ok_or_else(|| ServiceError::BadRequest("Invalid static map path".to_string()))?;

    let size = size_pattern()
        .captures(size_part)
        .ok_or_else(|| ServiceError::BadRequest("Invalid static map path".to_string()))?;
    let width: u32 = size[1]
        .parse()
        .map_err(|_| ServiceError::BadRequest("Invalid size".to_string()))?;
    let height: u32 = size[2]
        .parse()
        .map_err(|_| ServiceError::BadRequest("Invalid size".to_string()))?;
    let scale: u8 = size
        .get(3)
        .map_or(Ok(1), |m| m.as_str().parse())
        .map_err(|_| ServiceError::BadRequest("Invalid scale".to_string()))?;
    let format = size[4].to_string();
    if !matches!(normalize_format(&format), "png" | "jpg" | "webp") {
        return Err(ServiceError::BadRequest("Invalid format".to_string()));
    }
    require_scale(&state.options, scale)?;
    if width == 0
        || height == 0
        || width > state.options.max_size
        || height > state.options.max_size
    {
        return Err(ServiceError::BadRequest("Invalid size".to_string()));
    }

    let defaults = OverlayDefaults::from_query(&params)?;
    let mut overlays = Overlays::default();
    for (key, value) in &params {
        match key.as_str() {
            "path" => overlays.paths.push(staticmap::parse_path(value)?),
            "marker" => overlays.markers.push(staticmap::parse_marker(value)?),
            _ => {}
        }
    }
    if raw_mode {
        overlays.reproject_from_mercator();
    }

    let spec = parse_viewport_spec(view_part, raw_mode)?;
    let viewport = staticmap::resolve_viewport(
        &spec,
        &overlays,
        width,
        height,
        &defaults,
        &state.options,
    )?;

    let icons = staticmap::fetch_icons(&overlays.markers, &state.options, &state.http).await;

    let pool = state
        .renderers
        .get(&entry.id, scale)
        .ok_or_else(|| ServiceError::NotFound("Style not found".to_string()))?;
    let worker = pool.acquire().await?;
    let camera = viewport;
    let mut image = worker
        .submit(move |renderer: &mut RenderResource| {
            renderer.render(
                camera.width,
                camera.height,
                camera.lat,
                camera.lon,
                camera.zoom,
                camera.bearing,
                camera.pitch,
            )
        })
        .await?;
    drop(worker);

    if !overlays.is_empty() {
        let projection = ScreenProjection::new(&viewport, scale);
        staticmap::composite(&mut image, &overlays, &projection, &icons, &defaults, scale);
    }

    let (body, content_type) = encode_raster(&image, &format, state.options.format_quality)?;
    Ok(body_response(body, content_type, None, Some(TILE_CACHE)))
}

fn parse_viewport_spec(view: &str, raw_mode: bool) -> Result<ViewportSpec, ServiceError> {
    if view == "auto" {
        return Ok(ViewportSpec::Auto);
    }
    if let Some(captures) = center_pattern().captures(view) {
        let mut lon: f64 = parse_capture(&captures[1])?;
        let mut lat: f64 = parse_capture(&captures[2])?;
        let zoom: f64 = parse_capture(&captures[3])?;
        let bearing = captures
            .get(4)
            .map_or(Ok(0.0), |m| parse_capture(m.as_str()))?;
        let pitch = captures
            .get(5)
            .map_or(Ok(0.0), |m| parse_capture(m.as_str()))?;
        if raw_mode {
            (lon, lat) = tilemath::webmercator_to_wgs84(lon, lat);
        }
        if !(0.0..=f64::from(tilemath::MAX_ZOOM)).contains(&zoom) {
            return Err(ServiceError::BadRequest("Invalid zoom".to_string()));
        }
        return Ok(ViewportSpec::Center {
            lon,
            lat,
            zoom,
            bearing,
            pitch,
        });
    }
    if let Some(captures) = bbox_pattern().captures(view) {
        let mut bbox = [
            parse_capture(&captures[1])?,
            parse_capture(&captures[2])?,
            parse_capture(&captures[3])?,
            parse_capture(&captures[4])?,
        ];
        if raw_mode {
            let (min_lon, min_lat) = tilemath::webmercator_to_wgs84(bbox[0], bbox[1]);
            let (max_lon, max_lat) = tilemath::webmercator_to_wgs84(bbox[2], bbox[3]);
            bbox = [min_lon, min_lat, max_lon, max_lat];
        }
        return Ok(ViewportSpec::BBox(bbox));
    }
    Err(ServiceError::BadRequest(
        "Invalid static map path".to_string(),
    ))
}

fn parse_capture(text: &str) -> Result<f64, ServiceError> {
    text.parse()
        .map_err(|_| ServiceError::BadRequest(format!("Invalid number: {text}")))
}
