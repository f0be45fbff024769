use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

const WKT_POINT_TAG: &str = "POINT";

/// A parsed (latitude, longitude) pair.
///
/// Equality and hashing are exact on the two values. Two strings that differ
/// only in the last digit of a coordinate are different cache keys.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ParseError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(ParseError::Malformed(format!("{latitude},{longitude}")));
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ParseError::OutOfRange {
                latitude,
                longitude,
            });
        }
        // `-0.0 + 0.0` is `0.0`, so both zeros share one key.
        Ok(Self {
            latitude: latitude + 0.0,
            longitude: longitude + 0.0,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.latitude.to_bits() == other.latitude.to_bits()
            && self.longitude.to_bits() == other.longitude.to_bits()
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.latitude.to_bits().hash(state);
        self.longitude.to_bits().hash(state);
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("coordinate is empty")]
    Empty,
    #[error("unrecognized coordinate format: {0}")]
    Unrecognized(String),
    #[error("malformed coordinate: {0}")]
    Malformed(String),
    #[error("coordinate out of range: lat={latitude}, lon={longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

/// Accepts `POINT(<lon> <lat>)` or `<lat>,<lon>`.
///
/// The two notations list the axes in opposite order.
impl FromStr for Coordinate {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some((longitude, latitude)) = parse_wkt_point(value)? {
            return Coordinate::new(latitude, longitude);
        }

        if value.contains(',') {
            let mut parts = value.split(',');
            let (Some(lat), Some(lon), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ParseError::Malformed(value.to_string()));
            };
            let latitude = parse_number(lat, value)?;
            let longitude = parse_number(lon, value)?;
            return Coordinate::new(latitude, longitude);
        }

        Err(ParseError::Unrecognized(value.to_string()))
    }
}

/// Lenient entry point used by the enricher: blank input is silently
/// unparseable, every other failure is logged and swallowed.
pub fn parse_point(raw: Option<&str>) -> Option<Coordinate> {
    match raw?.parse::<Coordinate>() {
        Ok(point) => Some(point),
        Err(ParseError::Empty) => None,
        Err(err) => {
            warn!(raw = raw.unwrap_or_default(), error = %err, "coordinate not parseable");
            None
        }
    }
}

/// Returns `Ok(None)` when the value is not WKT at all, so the caller can try
/// the comma form.
fn parse_wkt_point(value: &str) -> Result<Option<(f64, f64)>, ParseError> {
    let Some(rest) = value.strip_prefix(WKT_POINT_TAG) else {
        return Ok(None);
    };
    let Some(body) = rest.trim_start().strip_prefix('(') else {
        return Ok(None);
    };
    let Some((inner, _)) = body.split_once(')') else {
        return Err(ParseError::Malformed(value.to_string()));
    };

    let mut fields = inner.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(lon), Some(lat), None) => {
            let longitude = parse_number(lon, value)?;
            let latitude = parse_number(lat, value)?;
            Ok(Some((longitude, latitude)))
        }
        _ => Err(ParseError::Malformed(value.to_string())),
    }
}

fn parse_number(field: &str, whole: &str) -> Result<f64, ParseError> {
    let field = field.trim();
    let plain = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '.'));
    if !plain {
        return Err(ParseError::Malformed(whole.to_string()));
    }
    field
        .parse::<f64>()
        .map_err(|_| ParseError::Malformed(whole.to_string()))
}
