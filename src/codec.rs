//! Stateless protocol codec: Base64, NMEA GGA, `Position:` headers, Haversine
//! distance, and the GGA synthesis helper.

use base64::{engine::general_purpose, Engine as _};

use crate::error::CasterError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Encode raw bytes with the standard Base64 alphabet, right-padded with `=`.
pub fn base64_encode(raw: &[u8]) -> String {
    general_purpose::STANDARD.encode(raw)
}

/// Decode a Base64 string. `=` is accepted only in the last one or two
/// positions; any other non-alphabet byte, or a length that is not a
/// non-zero multiple of four, is rejected.
pub fn base64_decode(raw: &str) -> Result<Vec<u8>, CasterError> {
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(CasterError::Parse("base64: invalid length".to_string()));
    }
    general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| CasterError::Parse(format!("base64: {e}")))
}

/// Verify the XOR checksum of a `$...*HH` NMEA sentence.
pub fn gga_checksum_valid(sentence: &str) -> Result<bool, CasterError> {
    let start = sentence
        .find('$')
        .ok_or_else(|| CasterError::Parse("gga: missing '$'".to_string()))?;
    let star = sentence
        .find('*')
        .ok_or_else(|| CasterError::Parse("gga: missing '*'".to_string()))?;
    if star <= start + 1 || star + 3 > sentence.len() {
        return Err(CasterError::Parse("gga: malformed checksum field".to_string()));
    }

    let body = &sentence.as_bytes()[start + 1..star];
    let checksum = body.iter().fold(0u8, |acc, &b| acc ^ b);

    let hex = &sentence[star + 1..star + 3];
    let parsed = u8::from_str_radix(hex, 16)
        .map_err(|_| CasterError::Parse("gga: invalid checksum hex".to_string()))?;

    Ok(checksum == parsed)
}

fn ddmm_to_decimal(raw: f64) -> f64 {
    let deg = (raw / 100.0).floor();
    let min = raw - deg * 100.0;
    deg + min / 60.0
}

fn decimal_to_ddmm(decimal: f64) -> f64 {
    let deg = decimal.floor();
    let min = (decimal - deg) * 60.0;
    deg * 100.0 + min
}

/// Extract `(latitude_deg, longitude_deg)` from a `$GPGGA`/`$GNGGA` sentence.
pub fn gga_position(sentence: &str) -> Result<(f64, f64), CasterError> {
    let fields: Vec<&str> = sentence.split(',').collect();
    if fields.len() < 15 {
        return Err(CasterError::Parse("gga: too few fields".to_string()));
    }

    let (lat_raw, lat_dir) = (fields[2], fields[3]);
    let (lon_raw, lon_dir) = (fields[4], fields[5]);
    if lat_raw.is_empty() || lat_dir.is_empty() || lon_raw.is_empty() || lon_dir.is_empty() {
        return Err(CasterError::Parse("gga: empty position field".to_string()));
    }

    let lat: f64 = lat_raw
        .parse()
        .map_err(|_| CasterError::Parse("gga: invalid latitude".to_string()))?;
    let lon: f64 = lon_raw
        .parse()
        .map_err(|_| CasterError::Parse("gga: invalid longitude".to_string()))?;

    let mut lat_dec = ddmm_to_decimal(lat);
    if lat_dir.starts_with('S') {
        lat_dec = -lat_dec;
    }
    let mut lon_dec = ddmm_to_decimal(lon);
    if lon_dir.starts_with('W') {
        lon_dec = -lon_dec;
    }

    Ok((lat_dec, lon_dec))
}

/// Parse a `Position:` header value, either `lat=<f>,lon=<f>` or the bare
/// `<lat>,<lon>` form.
pub fn parse_position_header(value: &str) -> Result<(f64, f64), CasterError> {
    let value = value.trim();

    let (lat_part, lon_part) = if let Some(lat_pos) = value.find("lat=") {
        let rest = &value[lat_pos + 4..];
        let comma = rest
            .find(',')
            .ok_or_else(|| CasterError::Parse("position: missing ','".to_string()))?;
        let lat_part = &rest[..comma];
        let tail = &rest[comma + 1..];
        let lon_part = tail.strip_prefix("lon=").unwrap_or(tail);
        (lat_part, lon_part)
    } else {
        let comma = value
            .find(',')
            .ok_or_else(|| CasterError::Parse("position: missing ','".to_string()))?;
        (&value[..comma], &value[comma + 1..])
    };

    let lat: f64 = lat_part
        .trim()
        .parse()
        .map_err(|_| CasterError::Parse("position: invalid latitude".to_string()))?;
    let lon: f64 = lon_part
        .trim()
        .parse()
        .map_err(|_| CasterError::Parse("position: invalid longitude".to_string()))?;

    Ok((lat, lon))
}

/// Great-circle distance between two WGS-84 points, in meters.
pub fn haversine_meters(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = a;
    let (lat2, lon2) = b;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lon = (delta_lon / 2.0).sin();

    let h = sin_lat * sin_lat + lat1_rad.cos() * lat2_rad.cos() * sin_lon * sin_lon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Synthesize a `$GPGGA` sentence with a valid XOR checksum, for test
/// tooling and external clients. Not used by the caster's own reactor.
pub fn generate_gga(lat: f64, lon: f64, alt: f64, hour: u32, minute: u32, second: f64) -> String {
    let lat_dir = if lat >= 0.0 { "N" } else { "S" };
    let lon_dir = if lon >= 0.0 { "E" } else { "W" };

    let body = format!(
        "GPGGA,{hour:02}{minute:02}{second:05.2},{:09.4},{lat_dir},{:010.4},{lon_dir},1,08,1.0,{alt:.1},M,0.0,M,,",
        decimal_to_ddmm(lat.abs()),
        decimal_to_ddmm(lon.abs()),
    );

    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip() {
        for raw in ["user1:pass1", "a", "ab", "abc", "", "NTRIP caster!!"] {
            let encoded = base64_encode(raw.as_bytes());
            if raw.is_empty() {
                assert_eq!(encoded, "");
                continue;
            }
            assert_eq!(encoded.len() % 4, 0);
            let decoded = base64_decode(&encoded).unwrap();
            assert_eq!(decoded, raw.as_bytes());
        }
    }

    #[test]
    fn test_base64_known_vector() {
        assert_eq!(base64_encode(b"user1:pass1"), "dXNlcjE6cGFzczE=");
        assert_eq!(base64_decode("dXNlcjE6cGFzczE=").unwrap(), b"user1:pass1");
    }

    #[test]
    fn test_base64_rejects_bad_length() {
        assert!(base64_decode("abc").is_err());
        assert!(base64_decode("").is_err());
    }

    #[test]
    fn test_base64_rejects_bad_character() {
        assert!(base64_decode("ab!=").is_err());
    }

    #[test]
    fn test_base64_rejects_padding_in_non_final_chunk() {
        // Length 8, a non-zero multiple of 4, but '=' appears in the first
        // chunk rather than only trailing the whole string.
        assert!(base64_decode("QQ==QQ==").is_err());
    }

    #[test]
    fn test_gga_checksum_valid() {
        let sentence = "$GPGGA,123456.00,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*63";
        assert!(gga_checksum_valid(sentence).unwrap());
    }

    #[test]
    fn test_gga_checksum_mismatch() {
        let sentence = "$GPGGA,123456.00,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00";
        assert!(!gga_checksum_valid(sentence).unwrap());
    }

    #[test]
    fn test_gga_position_extraction() {
        let sentence = "$GPGGA,123456.00,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*63";
        let (lat, lon) = gga_position(sentence).unwrap();
        assert!((lat - 48.1173).abs() < 1e-3);
        assert!((lon - 11.5167).abs() < 1e-3);
    }

    #[test]
    fn test_gga_position_south_west() {
        let sentence = "$GPGGA,123456.00,4807.038,S,01131.000,W,1,08,0.9,545.4,M,46.9,M,,*6C";
        let (lat, lon) = gga_position(sentence).unwrap();
        assert!(lat < 0.0);
        assert!(lon < 0.0);
    }

    #[test]
    fn test_gga_position_requires_enough_fields() {
        assert!(gga_position("$GPGGA,123456.00,4807.038,N*00").is_err());
    }

    #[test]
    fn test_position_header_lat_lon_form() {
        let (lat, lon) = parse_position_header("lat=37.78,lon=-122.40").unwrap();
        assert_eq!(lat, 37.78);
        assert_eq!(lon, -122.40);
    }

    #[test]
    fn test_position_header_bare_form() {
        let (lat, lon) = parse_position_header("37.78,-122.40").unwrap();
        assert_eq!(lat, 37.78);
        assert_eq!(lon, -122.40);
    }

    #[test]
    fn test_position_header_rejects_garbage() {
        assert!(parse_position_header("not-a-position").is_err());
        assert!(parse_position_header("lat=abc,lon=def").is_err());
    }

    #[test]
    fn test_haversine_symmetry_and_identity() {
        let a = (37.80, -122.40);
        let b = (37.60, -122.40);
        assert_eq!(haversine_meters(a, b), haversine_meters(b, a));
        assert_eq!(haversine_meters(a, a), 0.0);
        assert!(haversine_meters(a, b) > 0.0);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Roughly 22.2 km apart (0.2 degrees of latitude).
        let d = haversine_meters((37.80, -122.40), (37.60, -122.40));
        assert!((d - 22_244.0).abs() < 200.0);
    }

    #[test]
    fn test_generate_gga_round_trips_checksum() {
        let sentence = generate_gga(48.1173, 11.5167, 545.4, 12, 34, 56.0);
        assert!(gga_checksum_valid(sentence.trim_end()).unwrap());
    }

    #[test]
    fn test_decimal_degrees_round_trip() {
        for (deg, min) in [(37.0, 48.0), (0.0, 0.0), (179.0, 59.999)] {
            let decimal = deg + min / 60.0;
            let ddmm = decimal_to_ddmm(decimal);
            let back = ddmm_to_decimal(ddmm);
            assert!((back - decimal).abs() < 1e-6);
        }
    }
}
