//! Google encoded-polyline (v5) codec. The wire format stores lat before
//! lng; the API surface speaks (lon, lat) pairs like the rest of the crate.

const PRECISION: f64 = 1e5;

/// Decodes into (lon, lat) pairs. Returns `None` on malformed input
/// (truncated varint chunk, byte below the printable offset, dangling
/// latitude without a longitude).
pub fn decode(encoded: &str) -> Option<Vec<(f64, f64)>> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat = 0i64;
    let mut lon = 0i64;
    while index < bytes.len() {
        let (delta, next) = decode_value(bytes, index)?;
        lat += delta;
        let (delta, next) = decode_value(bytes, next)?;
        lon += delta;
        index = next;
        points.push((lon as f64 / PRECISION, lat as f64 / PRECISION));
    }
    Some(points)
}

/// Encodes (lon, lat) pairs; latitudes are written first per the format.
pub fn encode(points: &[(f64, f64)]) -> String {
    let mut out = String::new();
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;
    for &(lon, lat) in points {
        let lat = (lat * PRECISION).round() as i64;
        let lon = (lon * PRECISION).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lon - prev_lon, &mut out);
        prev_lat = lat;
        prev_lon = lon;
    }
    out
}

fn decode_value(bytes: &[u8], mut index: usize) -> Option<(i64, usize)> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        if index >= bytes.len() || shift > 60 {
            return None;
        }
        let chunk = i64::from(bytes[index]).checked_sub(63)?;
        if chunk < 0 {
            return None;
        }
        index += 1;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }
    let value = if result & 1 != 0 {
        !(result >> 1)
    } else {
        result >> 1
    };
    Some((value, index))
}

fn encode_value(value: i64, out: &mut String) {
    let mut value = if value < 0 { !(value << 1) } else { value << 1 };
    while value >= 0x20 {
        out.push((((0x20 | (value & 0x1f)) + 63) as u8) as char);
        value >>= 5;
    }
    out.push(((value + 63) as u8) as char);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vector from the published format description, lat/lng
    // (38.5, -120.2), (40.7, -120.95), (43.252, -126.453).
    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    #[test]
    fn decodes_reference_vector() {
        let points = decode(REFERENCE).unwrap();
        assert_eq!(points.len(), 3);
        let expected = [(-120.2, 38.5), (-120.95, 40.7), (-126.453, 43.252)];
        for ((lon, lat), (elon, elat)) in points.iter().zip(expected) {
            assert!((lon - elon).abs() < 1e-5);
            assert!((lat - elat).abs() < 1e-5);
        }
    }

    #[test]
    fn encodes_reference_vector() {
        let points = [(-120.2, 38.5), (-120.95, 40.7), (-126.453, 43.252)];
        assert_eq!(encode(&points), REFERENCE);
    }

    #[test]
    fn round_trip_within_tolerance() {
        let mut points = Vec::new();
        for i in 0..1000 {
            let t = f64::from(i);
            points.push((
                -180.0 + (t * 0.36721) % 360.0,
                -90.0 + (t * 0.18311) % 180.0,
            ));
        }
        let decoded = decode(&encode(&points)).unwrap();
        assert_eq!(decoded.len(), points.len());
        for ((lon, lat), (elon, elat)) in decoded.iter().zip(&points) {
            assert!((lon - elon).abs() < 1e-5, "{lon} vs {elon}");
            assert!((lat - elat).abs() < 1e-5, "{lat} vs {elat}");
        }
    }

    #[test]
    fn rejects_malformed_input() {
        // Truncated continuation chunk.
        assert!(decode("_p~iF~ps|").is_none());
        // Byte below the printable offset.
        assert!(decode("\u{1}\u{1}").is_none());
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(decode("").unwrap(), Vec::new());
        assert_eq!(encode(&[]), "");
    }
}
