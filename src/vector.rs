//! The gzip state machine for stored tiles and the MVT to GeoJSON
//! conversion. Payloads are treated as (bytes, is-gzipped) with idempotent
//! transitions: gunzip only when the magic is present, gzip only when it is
//! not.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};
use serde_json::Value;

use crate::error::ServiceError;
use crate::tilemath;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzipped(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let mut decoder = GzDecoder::new(data);
    let mut plain = Vec::new();
    decoder
        .read_to_end(&mut plain)
        .map_err(|err| ServiceError::Upstream(format!("gunzip failed: {err}")))?;
    Ok(plain)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|err| ServiceError::Upstream(format!("gzip failed: {err}")))
}

/// Gzips unless the payload already is.
pub fn ensure_gzipped(data: Vec<u8>) -> Result<Vec<u8>, ServiceError> {
    if is_gzipped(&data) {
        Ok(data)
    } else {
        gzip(&data)
    }
}

/// Gunzips only when the payload is gzipped.
pub fn ensure_plain(data: Vec<u8>) -> Result<Vec<u8>, ServiceError> {
    if is_gzipped(&data) {
        gunzip(&data)
    } else {
        Ok(data)
    }
}

/// Decodes a (possibly gzipped) vector tile into a GeoJSON
/// `FeatureCollection`. Every feature gets its originating layer name under
/// the `layer` property; property keys are lowercased. Coordinates are
/// projected from tile-local space to degrees using the layer extent.
pub fn tile_to_geojson(data: &[u8], z: u8, x: u32, y: u32) -> Result<Vec<u8>, ServiceError> {
    let plain = ensure_plain(data.to_vec())?;
    let reader = mvt_reader::Reader::new(plain)
        .map_err(|err| ServiceError::Upstream(format!("decode vector tile: {err}")))?;
    let layers = reader
        .get_layer_metadata()
        .map_err(|err| ServiceError::Upstream(format!("read layer metadata: {err}")))?;

    let mut features = Vec::new();
    for layer in &layers {
        let extent = f64::from(layer.extent.max(1));
        let decoded = reader
            .get_features(layer.layer_index)
            .map_err(|err| ServiceError::Upstream(format!("read layer features: {err}")))?;
        for feature in decoded {
            let Some(geometry) = convert_geometry(&feature.geometry, z, x, y, extent) else {
                continue;
            };
            let mut properties = JsonObject::new();
            if let Some(tags) = feature.properties {
                for (key, value) in tags {
                    properties.insert(key.to_lowercase(), property_value(&value));
                }
            }
            properties.insert("layer".to_string(), Value::String(layer.name.clone()));
            features.push(Feature {
                bbox: None,
                geometry: Some(Geometry::new(geometry)),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            });
        }
    }

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    serde_json::to_vec(&collection).map_err(|err| ServiceError::Upstream(err.to_string()))
}

fn convert_geometry(
    geometry: &geo_types::Geometry<f32>,
    z: u8,
    x: u32,
    y: u32,
    extent: f64,
) -> Option<geojson::Value> {
    use geo_types::Geometry as Geom;

    let position = |cx: f32, cy: f32| project(cx, cy, z, x, y, extent);
    let line = |ls: &geo_types::LineString<f32>| -> Vec<Vec<f64>> {
        ls.coords().map(|c| position(c.x, c.y)).collect()
    };
    let rings = |poly: &geo_types::Polygon<f32>| -> Vec<Vec<Vec<f64>>> {
        std::iter::once(line(poly.exterior()))
            .chain(poly.interiors().iter().map(line))
            .collect()
    };

    Some(match geometry {
        Geom::Point(point) => geojson::Value::Point(position(point.x(), point.y())),
        Geom::MultiPoint(points) => geojson::Value::MultiPoint(
            points.iter().map(|p| position(p.x(), p.y())).collect(),
        ),
        Geom::LineString(ls) => geojson::Value::LineString(line(ls)),
        Geom::MultiLineString(mls) => {
            geojson::Value::MultiLineString(mls.iter().map(line).collect())
        }
        Geom::Polygon(poly) => geojson::Value::Polygon(rings(poly)),
        Geom::MultiPolygon(mp) => geojson::Value::MultiPolygon(mp.iter().map(rings).collect()),
        Geom::GeometryCollection(gc) => geojson::Value::GeometryCollection(
            gc.iter()
                .filter_map(|g| convert_geometry(g, z, x, y, extent))
                .map(Geometry::new)
                .collect(),
        ),
        _ => return None,
    })
}

/// Tile-local coordinates to [lon, lat], rounded to 6 decimals so repeated
/// conversions are byte-identical.
fn project(px: f32, py: f32, z: u8, x: u32, y: u32, extent: f64) -> Vec<f64> {
    let tiles = f64::from(1u32 << z);
    let wx = (f64::from(x) + f64::from(px) / extent) / tiles;
    let wy = (f64::from(y) + f64::from(py) / extent) / tiles;
    vec![round6(tilemath::x_to_lon(wx)), round6(tilemath::y_to_lat(wy))]
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

fn property_value(value: &mvt_reader::feature::Value) -> Value {
    use mvt_reader::feature::Value as Tag;
    match value {
        Tag::String(text) => Value::String(text.clone()),
        Tag::Float(v) => number(f64::from(*v)),
        Tag::Double(v) => number(*v),
        Tag::Int(v) => Value::from(*v),
        Tag::UInt(v) => Value::from(*v),
        Tag::SInt(v) => Value::from(*v),
        Tag::Bool(v) => Value::Bool(*v),
        Tag::Null => Value::Null,
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use mvt::{GeomEncoder, GeomType, Tile};

    use super::*;

    /// One layer, one point at the tile center, one upper-cased tag.
    fn fixture_tile() -> Vec<u8> {
        let mut tile = Tile::new(4096);
        let layer = tile.create_layer("water");
        let geometry = GeomEncoder::new(GeomType::Point)
            .point(2048.0, 2048.0)
            .unwrap()
            .encode()
            .unwrap();
        let mut feature = layer.into_feature(geometry);
        feature.add_tag_string("NAME", "atlantic");
        feature.add_tag_double("Depth", 3646.0);
        let layer = feature.into_layer();
        tile.add_layer(layer).unwrap();
        tile.to_bytes().unwrap()
    }

    #[test]
    fn gzip_transitions_are_idempotent() {
        let raw = b"not gzipped".to_vec();
        let packed = ensure_gzipped(raw.clone()).unwrap();
        assert!(is_gzipped(&packed));
        // Already-gzipped payloads pass through untouched.
        let again = ensure_gzipped(packed.clone()).unwrap();
        assert_eq!(again, packed);
        let unpacked = ensure_plain(packed).unwrap();
        assert_eq!(unpacked, raw);
        let still = ensure_plain(raw.clone()).unwrap();
        assert_eq!(still, raw);
    }

    #[test]
    fn converts_layers_to_feature_collection() {
        let packed = gzip(&fixture_tile()).unwrap();
        let body = tile_to_geojson(&packed, 0, 0, 0).unwrap();
        let document: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(document["type"], "FeatureCollection");
        let feature = &document["features"][0];
        assert_eq!(feature["properties"]["layer"], "water");
        // Keys arrive lowercased.
        assert_eq!(feature["properties"]["name"], "atlantic");
        assert_eq!(feature["properties"]["depth"], 3646.0);
        // Tile center of 0/0/0 is (0, 0).
        let coords = feature["geometry"]["coordinates"].as_array().unwrap();
        assert!(coords[0].as_f64().unwrap().abs() < 1e-6);
        assert!(coords[1].as_f64().unwrap().abs() < 1e-6);
    }

    #[test]
    fn conversion_is_deterministic() {
        let tile = fixture_tile();
        let first = tile_to_geojson(&tile, 3, 4, 2).unwrap();
        let second = tile_to_geojson(&tile, 3, 4, 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn plain_and_gzipped_inputs_convert_identically() {
        let tile = fixture_tile();
        let packed = gzip(&tile).unwrap();
        assert_eq!(
            tile_to_geojson(&tile, 1, 0, 0).unwrap(),
            tile_to_geojson(&packed, 1, 0, 0).unwrap()
        );
    }
}
