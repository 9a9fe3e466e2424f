//! Static map composition: the `path=`/`marker=` query grammars, viewport
//! selection (center+zoom, bbox, or auto), post-render projection of
//! geographic coordinates to screen space, and overlay compositing onto the
//! rendered bitmap.

use std::collections::HashMap;

use image::{imageops, RgbaImage};
use tiny_skia::{
    FillRule, LineCap, LineJoin, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform,
};
use tracing::warn;

use crate::config::Options;
use crate::error::ServiceError;
use crate::polyline;
use crate::tilemath::{self, INTERNAL_TILE_SIZE};

const DEFAULT_FILL: Rgba = Rgba::new(0xff, 0xff, 0xff, 0x66);
const DEFAULT_STROKE: Rgba = Rgba::new(0x00, 0x40, 0xff, 0xb2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Accepts #rgb, #rrggbb, #rrggbbaa, rgb(r,g,b) and rgba(r,g,b,a).
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix('#') {
            return match hex.len() {
                3 => {
                    let value = u32::from_str_radix(hex, 16).ok()?;
                    let expand = |nibble: u32| ((nibble << 4) | nibble) as u8;
                    Some(Self::new(
                        expand((value >> 8) & 0xf),
                        expand((value >> 4) & 0xf),
                        expand(value & 0xf),
                        0xff,
                    ))
                }
                6 => {
                    let value = u32::from_str_radix(hex, 16).ok()?;
                    Some(Self::new(
                        (value >> 16) as u8,
                        (value >> 8) as u8,
                        value as u8,
                        0xff,
                    ))
                }
                8 => {
                    let value = u32::from_str_radix(hex, 16).ok()?;
                    Some(Self::new(
                        (value >> 24) as u8,
                        (value >> 16) as u8,
                        (value >> 8) as u8,
                        value as u8,
                    ))
                }
                _ => None,
            };
        }
        let body = text
            .strip_prefix("rgba(")
            .or_else(|| text.strip_prefix("rgb("))?
            .strip_suffix(')')?;
        let parts: Vec<&str> = body.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [r, g, b] => Some(Self::new(r.parse().ok()?, g.parse().ok()?, b.parse().ok()?, 0xff)),
            [r, g, b, a] => {
                let alpha: f64 = a.parse().ok()?;
                Some(Self::new(
                    r.parse().ok()?,
                    g.parse().ok()?,
                    b.parse().ok()?,
                    (alpha.clamp(0.0, 1.0) * 255.0).round() as u8,
                ))
            }
            _ => None,
        }
    }

    fn to_color(self) -> tiny_skia::Color {
        tiny_skia::Color::from_rgba8(self.r, self.g, self.b, self.a)
    }
}

#[derive(Clone, Debug, Default)]
pub struct PathStyle {
    pub fill: Option<Rgba>,
    pub stroke: Option<Rgba>,
    pub width: Option<f32>,
    pub linecap: Option<LineCap>,
    pub linejoin: Option<LineJoin>,
    pub border: Option<Rgba>,
    pub border_width: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct PathOverlay {
    /// (lon, lat) vertices.
    pub points: Vec<(f64, f64)>,
    pub style: PathStyle,
}

#[derive(Clone, Debug)]
pub struct MarkerOverlay {
    pub lon: f64,
    pub lat: f64,
    pub icon: String,
    pub icon_scale: f64,
    pub offset: (f64, f64),
}

#[derive(Clone, Debug, Default)]
pub struct Overlays {
    pub paths: Vec<PathOverlay>,
    pub markers: Vec<MarkerOverlay>,
}

impl Overlays {
    /// Every vertex of every overlay, for the auto viewport.
    pub fn vertices(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.paths
            .iter()
            .flat_map(|path| path.points.iter().copied())
            .chain(self.markers.iter().map(|marker| (marker.lon, marker.lat)))
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.markers.is_empty()
    }

    /// Reinterprets every coordinate as EPSG:3857 meters (the `raw` path
    /// families) and reprojects to degrees.
    pub fn reproject_from_mercator(&mut self) {
        for path in &mut self.paths {
            for point in &mut path.points {
                *point = tilemath::webmercator_to_wgs84(point.0, point.1);
            }
        }
        for marker in &mut self.markers {
            let (lon, lat) = tilemath::webmercator_to_wgs84(marker.lon, marker.lat);
            marker.lon = lon;
            marker.lat = lat;
        }
    }
}

/// Global overlay defaults from top-level query parameters.
#[derive(Clone, Debug)]
pub struct OverlayDefaults {
    pub fill: Option<Rgba>,
    pub stroke: Option<Rgba>,
    pub width: Option<f32>,
    pub linecap: Option<LineCap>,
    pub linejoin: Option<LineJoin>,
    pub border: Option<Rgba>,
    pub border_width: Option<f32>,
    pub padding: f64,
    pub maxzoom: f64,
}

impl Default for OverlayDefaults {
    fn default() -> Self {
        Self {
            fill: None,
            stroke: None,
            width: None,
            linecap: None,
            linejoin: None,
            border: None,
            border_width: None,
            padding: 0.1,
            maxzoom: 22.0,
        }
    }
}

impl OverlayDefaults {
    pub fn from_query(params: &[(String, String)]) -> Result<Self, ServiceError> {
        let mut defaults = Self::default();
        for (key, value) in params {
            match key.as_str() {
                "fill" => defaults.fill = Some(parse_color(value)?),
                "stroke" => defaults.stroke = Some(parse_color(value)?),
                "width" => defaults.width = Some(parse_width(value)?),
                "linecap" => defaults.linecap = Some(parse_linecap(value)?),
                "linejoin" => defaults.linejoin = Some(parse_linejoin(value)?),
                "border" => defaults.border = Some(parse_color(value)?),
                "borderwidth" | "borderWidth" => defaults.border_width = Some(parse_width(value)?),
                "padding" => {
                    defaults.padding = value.parse().map_err(|_| {
                        ServiceError::BadRequest(format!("Invalid padding: {value}"))
                    })?;
                }
                "maxzoom" => {
                    defaults.maxzoom = value.parse().map_err(|_| {
                        ServiceError::BadRequest(format!("Invalid maxzoom: {value}"))
                    })?;
                }
                _ => {}
            }
        }
        Ok(defaults)
    }
}

fn parse_color(value: &str) -> Result<Rgba, ServiceError> {
    Rgba::parse(value).ok_or_else(|| ServiceError::BadRequest(format!("Invalid color: {value}")))
}

fn parse_width(value: &str) -> Result<f32, ServiceError> {
    value
        .parse::<f32>()
        .ok()
        .filter(|width| width.is_finite() && *width >= 0.0)
        .ok_or_else(|| ServiceError::BadRequest(format!("Invalid width: {value}")))
}

fn parse_linecap(value: &str) -> Result<LineCap, ServiceError> {
    match value {
        "butt" => Ok(LineCap::Butt),
        "round" => Ok(LineCap::Round),
        "square" => Ok(LineCap::Square),
        _ => Err(ServiceError::BadRequest(format!("Invalid linecap: {value}"))),
    }
}

fn parse_linejoin(value: &str) -> Result<LineJoin, ServiceError> {
    match value {
        "miter" => Ok(LineJoin::Miter),
        "round" => Ok(LineJoin::Round),
        "bevel" => Ok(LineJoin::Bevel),
        _ => Err(ServiceError::BadRequest(format!(
            "Invalid linejoin: {value}"
        ))),
    }
}

fn parse_lonlat(text: &str) -> Result<(f64, f64), ServiceError> {
    let (a, b) = text
        .split_once(',')
        .ok_or_else(|| ServiceError::BadRequest(format!("Invalid coordinate: {text}")))?;
    let lon = a
        .trim()
        .parse()
        .map_err(|_| ServiceError::BadRequest(format!("Invalid coordinate: {text}")))?;
    let lat = b
        .trim()
        .parse()
        .map_err(|_| ServiceError::BadRequest(format!("Invalid coordinate: {text}")))?;
    Ok((lon, lat))
}

/// Parses one `path=` value: up to eight `name:value` properties followed by
/// either `enc:<polyline>` or a `|`-separated list of `lon,lat` pairs.
pub fn parse_path(value: &str) -> Result<PathOverlay, ServiceError> {
    let mut style = PathStyle::default();
    let mut latlng = false;
    let mut points = Vec::new();

    // Everything after `enc:` is polyline data; its alphabet may contain
    // the separator character, so it is split off before tokenizing.
    let (head, encoded) = match value.find("enc:") {
        Some(index) => (&value[..index], Some(&value[index + 4..])),
        None => (value, None),
    };

    for segment in head.split('|').filter(|segment| !segment.is_empty()) {
        if segment == "latlng" {
            latlng = true;
            continue;
        }
        if let Some((key, val)) = segment.split_once(':') {
            match key {
                "latlng" => latlng = !matches!(val, "false" | "0"),
                "fill" => style.fill = Some(parse_color(val)?),
                "stroke" => style.stroke = Some(parse_color(val)?),
                "width" => style.width = Some(parse_width(val)?),
                "linecap" => style.linecap = Some(parse_linecap(val)?),
                "linejoin" => style.linejoin = Some(parse_linejoin(val)?),
                "border" => style.border = Some(parse_color(val)?),
                "borderwidth" | "borderWidth" => style.border_width = Some(parse_width(val)?),
                _ => {
                    return Err(ServiceError::BadRequest(format!(
                        "Invalid path property: {key}"
                    )))
                }
            }
        } else {
            let (a, b) = parse_lonlat(segment)?;
            points.push(if latlng { (b, a) } else { (a, b) });
        }
    }

    if let Some(encoded) = encoded {
        points = polyline::decode(encoded)
            .ok_or_else(|| ServiceError::BadRequest("Invalid encoded polyline".to_string()))?;
    }

    if points.is_empty() {
        return Err(ServiceError::BadRequest("Empty path".to_string()));
    }
    Ok(PathOverlay { points, style })
}

/// Parses one `marker=` value:
/// `lon,lat|iconPath[|scale:<f>][|offset:<dx>,<dy>]`.
pub fn parse_marker(value: &str) -> Result<MarkerOverlay, ServiceError> {
    let mut parts = value.split('|');
    let position = parts
        .next()
        .ok_or_else(|| ServiceError::BadRequest("Empty marker".to_string()))?;
    let (lon, lat) = parse_lonlat(position)?;
    let icon = parts
        .next()
        .filter(|icon| !icon.is_empty())
        .ok_or_else(|| ServiceError::BadRequest("Marker without icon".to_string()))?
        .to_string();

    let mut marker = MarkerOverlay {
        lon,
        lat,
        icon,
        icon_scale: 1.0,
        offset: (0.0, 0.0),
    };
    for extra in parts {
        if let Some(scale) = extra.strip_prefix("scale:") {
            marker.icon_scale = scale
                .parse::<f64>()
                .ok()
                .filter(|scale| scale.is_finite() && *scale > 0.0)
                .ok_or_else(|| {
                    ServiceError::BadRequest(format!("Invalid marker scale: {scale}"))
                })?;
        } else if let Some(offset) = extra.strip_prefix("offset:") {
            marker.offset = parse_lonlat(offset)?;
        } else {
            return Err(ServiceError::BadRequest(format!(
                "Invalid marker option: {extra}"
            )));
        }
    }
    Ok(marker)
}

/// The camera the request resolved to, in logical pixels.
#[derive(Clone, Copy, Debug)]
pub struct Viewport {
    pub lon: f64,
    pub lat: f64,
    pub zoom: f64,
    pub bearing: f64,
    pub pitch: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub enum ViewportSpec {
    Center {
        lon: f64,
        lat: f64,
        zoom: f64,
        bearing: f64,
        pitch: f64,
    },
    BBox([f64; 4]),
    Auto,
}

pub fn resolve_viewport(
    spec: &ViewportSpec,
    overlays: &Overlays,
    width: u32,
    height: u32,
    defaults: &OverlayDefaults,
    options: &Options,
) -> Result<Viewport, ServiceError> {
    let serve = options.serve_bounds;
    match spec {
        ViewportSpec::Center {
            lon,
            lat,
            zoom,
            bearing,
            pitch,
        } => {
            if *lon < serve[0] || *lon > serve[2] || *lat < serve[1] || *lat > serve[3] {
                return Err(ServiceError::BadRequest("Out of bounds".to_string()));
            }
            Ok(Viewport {
                lon: *lon,
                lat: *lat,
                zoom: *zoom,
                bearing: *bearing,
                pitch: *pitch,
                width,
                height,
            })
        }
        ViewportSpec::BBox(bbox) => {
            viewport_for_bbox(*bbox, width, height, defaults, options)
        }
        ViewportSpec::Auto => {
            let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
            let mut any = false;
            for (lon, lat) in overlays.vertices() {
                bbox[0] = bbox[0].min(lon);
                bbox[1] = bbox[1].min(lat);
                bbox[2] = bbox[2].max(lon);
                bbox[3] = bbox[3].max(lat);
                any = true;
            }
            if !any {
                return Err(ServiceError::BadRequest(
                    "Auto viewport needs overlay data".to_string(),
                ));
            }
            viewport_for_bbox(bbox, width, height, defaults, options)
        }
    }
}

fn viewport_for_bbox(
    bbox: [f64; 4],
    width: u32,
    height: u32,
    defaults: &OverlayDefaults,
    options: &Options,
) -> Result<Viewport, ServiceError> {
    let serve = options.serve_bounds;
    let clamped = [
        bbox[0].max(serve[0]),
        bbox[1].max(serve[1]),
        bbox[2].min(serve[2]),
        bbox[3].min(serve[3]),
    ];
    if clamped[0] > clamped[2] || clamped[1] > clamped[3] {
        return Err(ServiceError::BadRequest("Out of bounds".to_string()));
    }
    let zoom = tilemath::zoom_for_bbox(
        clamped[0],
        clamped[1],
        clamped[2],
        clamped[3],
        width,
        height,
        defaults.padding,
    )
    .min(defaults.maxzoom);
    Ok(Viewport {
        lon: (clamped[0] + clamped[2]) / 2.0,
        lat: (clamped[1] + clamped[3]) / 2.0,
        zoom,
        bearing: 0.0,
        pitch: 0.0,
        width,
        height,
    })
}

/// Maps lon/lat to physical-pixel screen coordinates for the rendered
/// viewport. Valid once the render completed: it mirrors the camera the
/// renderer was given (bearing rotates about the screen center; pitch does
/// not tilt overlay projection).
pub struct ScreenProjection {
    zoom: f64,
    scale: f64,
    center_x: f64,
    center_y: f64,
    half_width: f64,
    half_height: f64,
    sin_bearing: f64,
    cos_bearing: f64,
}

impl ScreenProjection {
    pub fn new(viewport: &Viewport, scale: u8) -> Self {
        let scale = f64::from(scale);
        let bearing = viewport.bearing.to_radians();
        Self {
            zoom: viewport.zoom,
            scale,
            center_x: tilemath::lon_to_pixel(viewport.lon, viewport.zoom, INTERNAL_TILE_SIZE)
                * scale,
            center_y: tilemath::lat_to_pixel(viewport.lat, viewport.zoom, INTERNAL_TILE_SIZE)
                * scale,
            half_width: f64::from(viewport.width) * scale / 2.0,
            half_height: f64::from(viewport.height) * scale / 2.0,
            sin_bearing: bearing.sin(),
            cos_bearing: bearing.cos(),
        }
    }

    pub fn project(&self, lon: f64, lat: f64) -> (f32, f32) {
        let dx =
            tilemath::lon_to_pixel(lon, self.zoom, INTERNAL_TILE_SIZE) * self.scale - self.center_x;
        let dy =
            tilemath::lat_to_pixel(lat, self.zoom, INTERNAL_TILE_SIZE) * self.scale - self.center_y;
        let x = dx * self.cos_bearing + dy * self.sin_bearing + self.half_width;
        let y = -dx * self.sin_bearing + dy * self.cos_bearing + self.half_height;
        (x as f32, y as f32)
    }
}

/// Fetches marker icons up front: local names resolve inside the icons
/// directory, remote URLs require `allow_remote_marker_icons`. Failures and
/// denials drop the icon (the marker is skipped), never the request.
pub async fn fetch_icons(
    markers: &[MarkerOverlay],
    options: &Options,
    http: &reqwest::Client,
) -> HashMap<String, RgbaImage> {
    let mut icons = HashMap::new();
    for marker in markers {
        if icons.contains_key(&marker.icon) {
            continue;
        }
        let loaded = if marker.icon.starts_with("http://") || marker.icon.starts_with("https://")
        {
            if !options.allow_remote_marker_icons {
                warn!("remote marker icon denied: {}", marker.icon);
                continue;
            }
            fetch_remote_icon(&marker.icon, http).await
        } else {
            load_local_icon(&marker.icon, options)
        };
        match loaded {
            Ok(icon) => {
                icons.insert(marker.icon.clone(), icon);
            }
            Err(err) => warn!("failed to load marker icon {}: {err}", marker.icon),
        }
    }
    icons
}

async fn fetch_remote_icon(
    url: &str,
    http: &reqwest::Client,
) -> Result<RgbaImage, ServiceError> {
    let bytes = http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| ServiceError::Upstream(err.to_string()))?
        .bytes()
        .await
        .map_err(|err| ServiceError::Upstream(err.to_string()))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|err| ServiceError::Upstream(err.to_string()))?;
    Ok(image.to_rgba8())
}

fn load_local_icon(name: &str, options: &Options) -> Result<RgbaImage, ServiceError> {
    let relative = std::path::Path::new(name);
    let traversal = relative.components().any(|component| {
        !matches!(component, std::path::Component::Normal(_))
    });
    if traversal {
        return Err(ServiceError::BadRequest(format!("Invalid icon path: {name}")));
    }
    let path = options.paths.icons.join(relative);
    let bytes = std::fs::read(&path)
        .map_err(|err| ServiceError::NotFound(format!("icon {name}: {err}")))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|err| ServiceError::Upstream(err.to_string()))?;
    Ok(image.to_rgba8())
}

/// Draws paths and markers onto the rendered bitmap. Coordinates are
/// physical pixels out of [`ScreenProjection::project`].
pub fn composite(
    image: &mut RgbaImage,
    overlays: &Overlays,
    projection: &ScreenProjection,
    icons: &HashMap<String, RgbaImage>,
    defaults: &OverlayDefaults,
    scale: u8,
) {
    let Some(mut canvas) = pixmap_from_rgba(image) else {
        return;
    };
    let scale_factor = f32::from(scale);

    for path in &overlays.paths {
        draw_path(&mut canvas, path, projection, defaults, scale_factor);
    }
    for marker in &overlays.markers {
        let Some(icon) = icons.get(&marker.icon) else {
            continue;
        };
        draw_marker(&mut canvas, marker, icon, projection, f64::from(scale));
    }

    rgba_from_pixmap(&canvas, image);
}

fn draw_path(
    canvas: &mut Pixmap,
    path: &PathOverlay,
    projection: &ScreenProjection,
    defaults: &OverlayDefaults,
    scale: f32,
) {
    if path.points.len() < 2 {
        return;
    }
    let mut builder = PathBuilder::new();
    let (x, y) = projection.project(path.points[0].0, path.points[0].1);
    builder.move_to(x, y);
    for &(lon, lat) in &path.points[1..] {
        let (x, y) = projection.project(lon, lat);
        builder.line_to(x, y);
    }
    let closed = path.points.first() == path.points.last();
    if closed {
        builder.close();
    }
    let Some(outline) = builder.finish() else {
        return;
    };

    let mut paint = Paint::default();
    paint.anti_alias = true;

    let draw_fill = defaults.fill.is_some() || path.style.fill.is_some();
    if draw_fill {
        let fill = path.style.fill.or(defaults.fill).unwrap_or(DEFAULT_FILL);
        paint.set_color(fill.to_color());
        canvas.fill_path(&outline, &paint, FillRule::Winding, Transform::identity(), None);
    }

    let mut width = path.style.width.or(defaults.width).unwrap_or(0.0);
    if !draw_fill && width <= 0.0 {
        width = 1.0;
    }
    if width <= 0.0 {
        return;
    }

    let stroke_color = path.style.stroke.or(defaults.stroke).unwrap_or(DEFAULT_STROKE);
    let line_cap = path.style.linecap.or(defaults.linecap).unwrap_or(LineCap::Butt);
    let line_join = path
        .style
        .linejoin
        .or(defaults.linejoin)
        .unwrap_or(LineJoin::Miter);

    if let Some(border_color) = path.style.border.or(defaults.border) {
        let border_width = path
            .style
            .border_width
            .or(defaults.border_width)
            .unwrap_or(width * 0.1);
        if border_width > 0.0 {
            paint.set_color(border_color.to_color());
            let stroke = Stroke {
                width: (width + 2.0 * border_width) * scale,
                line_cap,
                line_join,
                ..Stroke::default()
            };
            canvas.stroke_path(&outline, &paint, &stroke, Transform::identity(), None);
        }
    }

    paint.set_color(stroke_color.to_color());
    let stroke = Stroke {
        width: width * scale,
        line_cap,
        line_join,
        ..Stroke::default()
    };
    canvas.stroke_path(&outline, &paint, &stroke, Transform::identity(), None);
}

/// Anchor is bottom-center, shifted by the (scaled) pixel offset.
fn draw_marker(
    canvas: &mut Pixmap,
    marker: &MarkerOverlay,
    icon: &RgbaImage,
    projection: &ScreenProjection,
    scale: f64,
) {
    let (px, py) = projection.project(marker.lon, marker.lat);
    let drawn_width = (f64::from(icon.width()) * marker.icon_scale * scale).round();
    let drawn_height = (f64::from(icon.height()) * marker.icon_scale * scale).round();
    if drawn_width < 1.0 || drawn_height < 1.0 {
        return;
    }
    let resized = imageops::resize(
        icon,
        drawn_width as u32,
        drawn_height as u32,
        imageops::FilterType::CatmullRom,
    );
    let Some(stamp) = pixmap_from_rgba(&resized) else {
        return;
    };
    let x = f64::from(px) - drawn_width / 2.0 + marker.offset.0 * scale;
    let y = f64::from(py) - drawn_height + marker.offset.1 * scale;
    canvas.draw_pixmap(
        x.round() as i32,
        y.round() as i32,
        stamp.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );
}

fn pixmap_from_rgba(image: &RgbaImage) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(image.width(), image.height())?;
    for (source, target) in image.pixels().zip(pixmap.pixels_mut()) {
        let [r, g, b, a] = source.0;
        *target = tiny_skia::ColorU8::from_rgba(r, g, b, a).premultiply();
    }
    Some(pixmap)
}

fn rgba_from_pixmap(pixmap: &Pixmap, image: &mut RgbaImage) {
    for (source, target) in pixmap.pixels().iter().zip(image.pixels_mut()) {
        let color = source.demultiply();
        target.0 = [color.red(), color.green(), color.blue(), color.alpha()];
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba as ImagePixel;

    use super::*;

    #[test]
    fn parses_colors() {
        assert_eq!(Rgba::parse("#fff"), Some(Rgba::new(255, 255, 255, 255)));
        assert_eq!(Rgba::parse("#0040ff"), Some(Rgba::new(0, 0x40, 0xff, 255)));
        assert_eq!(
            Rgba::parse("#0040ffb2"),
            Some(Rgba::new(0, 0x40, 0xff, 0xb2))
        );
        assert_eq!(
            Rgba::parse("rgb(1, 2, 3)"),
            Some(Rgba::new(1, 2, 3, 255))
        );
        assert_eq!(
            Rgba::parse("rgba(1,2,3,0.5)"),
            Some(Rgba::new(1, 2, 3, 128))
        );
        assert_eq!(Rgba::parse("magenta-ish"), None);
    }

    #[test]
    fn parses_plain_coordinate_path() {
        let path = parse_path("stroke:#ff0000|width:3|-0.5,-0.5|0.5,0.5").unwrap();
        assert_eq!(path.points, vec![(-0.5, -0.5), (0.5, 0.5)]);
        assert_eq!(path.style.stroke, Some(Rgba::new(255, 0, 0, 255)));
        assert_eq!(path.style.width, Some(3.0));
    }

    #[test]
    fn latlng_swaps_coordinate_order() {
        let path = parse_path("latlng|48.2,16.37").unwrap();
        assert_eq!(path.points, vec![(16.37, 48.2)]);
    }

    #[test]
    fn parses_encoded_polyline_path() {
        let encoded = polyline::encode(&[(-120.2, 38.5), (-120.95, 40.7)]);
        let path = parse_path(&format!("width:2|enc:{encoded}")).unwrap();
        assert_eq!(path.points.len(), 2);
        assert!((path.points[0].0 + 120.2).abs() < 1e-5);
        assert!((path.points[0].1 - 38.5).abs() < 1e-5);
    }

    #[test]
    fn rejects_unknown_path_property() {
        assert!(parse_path("glow:red|0,0|1,1").is_err());
        assert!(parse_path("").is_err());
    }

    #[test]
    fn parses_marker_with_options() {
        let marker = parse_marker("16.37,48.2|pin.png|scale:2|offset:4,-8").unwrap();
        assert_eq!(marker.lon, 16.37);
        assert_eq!(marker.lat, 48.2);
        assert_eq!(marker.icon, "pin.png");
        assert_eq!(marker.icon_scale, 2.0);
        assert_eq!(marker.offset, (4.0, -8.0));
        assert!(parse_marker("0,0").is_err());
        assert!(parse_marker("0,0|pin.png|spin:1").is_err());
    }

    fn world_options() -> Options {
        Options::default()
    }

    #[test]
    fn center_viewport_respects_serve_bounds() {
        let mut options = world_options();
        options.serve_bounds = [0.0, 0.0, 10.0, 10.0];
        let spec = ViewportSpec::Center {
            lon: 20.0,
            lat: 5.0,
            zoom: 4.0,
            bearing: 0.0,
            pitch: 0.0,
        };
        let err = resolve_viewport(
            &spec,
            &Overlays::default(),
            256,
            256,
            &OverlayDefaults::default(),
            &options,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Out of bounds"));
    }

    #[test]
    fn bbox_viewport_centers_and_fits() {
        let options = world_options();
        let spec = ViewportSpec::BBox([-1.0, -1.0, 1.0, 1.0]);
        let viewport = resolve_viewport(
            &spec,
            &Overlays::default(),
            256,
            256,
            &OverlayDefaults::default(),
            &options,
        )
        .unwrap();
        assert_eq!(viewport.lon, 0.0);
        assert_eq!(viewport.lat, 0.0);
        assert!(viewport.zoom > 0.0);
        assert!(viewport.zoom <= 22.0);
    }

    #[test]
    fn disjoint_bbox_is_rejected() {
        let mut options = world_options();
        options.serve_bounds = [0.0, 0.0, 10.0, 10.0];
        let spec = ViewportSpec::BBox([-30.0, -30.0, -20.0, -20.0]);
        assert!(resolve_viewport(
            &spec,
            &Overlays::default(),
            256,
            256,
            &OverlayDefaults::default(),
            &options,
        )
        .is_err());
    }

    #[test]
    fn auto_viewport_covers_every_overlay_vertex() {
        let options = world_options();
        let overlays = Overlays {
            paths: vec![PathOverlay {
                points: vec![(-10.0, -5.0), (10.0, 5.0)],
                style: PathStyle::default(),
            }],
            markers: vec![MarkerOverlay {
                lon: 30.0,
                lat: 0.0,
                icon: "pin.png".to_string(),
                icon_scale: 1.0,
                offset: (0.0, 0.0),
            }],
        };
        let viewport = resolve_viewport(
            &ViewportSpec::Auto,
            &overlays,
            512,
            512,
            &OverlayDefaults::default(),
            &options,
        )
        .unwrap();
        // Center is the midpoint of the combined bbox: lon [-10, 30].
        assert!((viewport.lon - 10.0).abs() < 1e-9);

        let empty = resolve_viewport(
            &ViewportSpec::Auto,
            &Overlays::default(),
            512,
            512,
            &OverlayDefaults::default(),
            &options,
        );
        assert!(empty.is_err());
    }

    #[test]
    fn projection_centers_the_viewport() {
        let viewport = Viewport {
            lon: 16.37,
            lat: 48.2,
            zoom: 10.0,
            bearing: 0.0,
            pitch: 0.0,
            width: 400,
            height: 300,
        };
        let projection = ScreenProjection::new(&viewport, 2);
        let (x, y) = projection.project(16.37, 48.2);
        assert!((x - 400.0).abs() < 1e-3);
        assert!((y - 300.0).abs() < 1e-3);
        // East of center lands right of center.
        let (x_east, _) = projection.project(16.5, 48.2);
        assert!(x_east > x);
        // North of center lands above center.
        let (_, y_north) = projection.project(16.37, 48.4);
        assert!(y_north < y);
    }

    #[test]
    fn projection_honors_bearing() {
        let viewport = Viewport {
            lon: 0.0,
            lat: 0.0,
            zoom: 4.0,
            bearing: 90.0,
            pitch: 0.0,
            width: 200,
            height: 200,
        };
        let projection = ScreenProjection::new(&viewport, 1);
        // Facing east: a point east of center appears above the center.
        let (x, y) = projection.project(10.0, 0.0);
        assert!((x - 100.0).abs() < 1e-6);
        assert!(y < 100.0);
    }

    #[test]
    fn compositing_a_path_changes_pixels() {
        let mut image = RgbaImage::from_pixel(256, 256, ImagePixel([10, 10, 10, 255]));
        let before = image.clone();
        let viewport = Viewport {
            lon: 0.0,
            lat: 0.0,
            zoom: 2.0,
            bearing: 0.0,
            pitch: 0.0,
            width: 256,
            height: 256,
        };
        let projection = ScreenProjection::new(&viewport, 1);
        let overlays = Overlays {
            paths: vec![PathOverlay {
                points: vec![(-0.5, -0.5), (0.5, 0.5)],
                style: PathStyle::default(),
            }],
            markers: Vec::new(),
        };
        composite(
            &mut image,
            &overlays,
            &projection,
            &HashMap::new(),
            &OverlayDefaults::default(),
            1,
        );
        assert_ne!(image, before, "the diagonal must change pixels");
    }

    #[test]
    fn marker_without_icon_is_skipped() {
        let mut image = RgbaImage::from_pixel(64, 64, ImagePixel([0, 0, 0, 255]));
        let before = image.clone();
        let viewport = Viewport {
            lon: 0.0,
            lat: 0.0,
            zoom: 1.0,
            bearing: 0.0,
            pitch: 0.0,
            width: 64,
            height: 64,
        };
        let projection = ScreenProjection::new(&viewport, 1);
        let overlays = Overlays {
            paths: Vec::new(),
            markers: vec![MarkerOverlay {
                lon: 0.0,
                lat: 0.0,
                icon: "https://example/icon.png".to_string(),
                icon_scale: 1.0,
                offset: (0.0, 0.0),
            }],
        };
        composite(
            &mut image,
            &overlays,
            &projection,
            &HashMap::new(),
            &OverlayDefaults::default(),
            1,
        );
        assert_eq!(image, before, "denied icon leaves the bitmap untouched");
    }

    #[test]
    fn marker_compositing_stamps_the_icon() {
        let mut image = RgbaImage::from_pixel(64, 64, ImagePixel([0, 0, 0, 255]));
        let viewport = Viewport {
            lon: 0.0,
            lat: 0.0,
            zoom: 1.0,
            bearing: 0.0,
            pitch: 0.0,
            width: 64,
            height: 64,
        };
        let projection = ScreenProjection::new(&viewport, 1);
        let mut icons = HashMap::new();
        icons.insert(
            "pin.png".to_string(),
            RgbaImage::from_pixel(8, 8, ImagePixel([255, 0, 0, 255])),
        );
        let overlays = Overlays {
            paths: Vec::new(),
            markers: vec![MarkerOverlay {
                lon: 0.0,
                lat: 0.0,
                icon: "pin.png".to_string(),
                icon_scale: 1.0,
                offset: (0.0, 0.0),
            }],
        };
        composite(
            &mut image,
            &overlays,
            &projection,
            &icons,
            &OverlayDefaults::default(),
            1,
        );
        // Bottom-center anchor: the icon sits just above the projected point.
        assert_eq!(image.get_pixel(32, 28), &ImagePixel([255, 0, 0, 255]));
    }

    #[test]
    fn mercator_reprojection_for_raw_requests() {
        let mut overlays = Overlays {
            paths: vec![PathOverlay {
                points: vec![(0.0, 0.0)],
                style: PathStyle::default(),
            }],
            markers: Vec::new(),
        };
        overlays.reproject_from_mercator();
        assert!((overlays.paths[0].points[0].0).abs() < 1e-9);
        assert!((overlays.paths[0].points[0].1).abs() < 1e-9);
    }
}
