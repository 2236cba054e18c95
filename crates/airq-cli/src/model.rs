use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AIRQ_MAX_LIMIT;
use crate::pollutant::canonical_id;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, ValidationError> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_coordinates(self.south, self.west)?;
        validate_coordinates(self.north, self.east)?;
        if self.west >= self.east || self.south >= self.north {
            return Err(ValidationError::InvertedBoundingBox);
        }
        Ok(())
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }
}

/// Canonical measurement produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub location: GeoPoint,
    pub pollutant: String,
    pub value: Option<f64>,
    pub unit: String,
    #[serde(default)]
    pub observed_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationQuery {
    Area(BoundingBox),
    Point(GeoPoint),
    Place(String),
}

impl LocationQuery {
    /// Point-style input: either a place name or both coordinates.
    pub fn from_point_inputs(
        place: Option<&str>,
        lat: Option<f64>,
        lon: Option<f64>,
    ) -> Result<Self, ValidationError> {
        match (place, lat, lon) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                Err(ValidationError::ConflictingLocationInput)
            }
            (Some(place), None, None) => Ok(Self::Place(normalize_place(place)?)),
            (None, Some(lat), Some(lon)) => {
                validate_coordinates(lat, lon)?;
                Ok(Self::Point(GeoPoint::new(lat, lon)))
            }
            (None, Some(_), None) | (None, None, Some(_)) => {
                Err(ValidationError::PartialCoordinates)
            }
            (None, None, None) => Err(ValidationError::MissingLocationInput),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRequest {
    pub location: LocationQuery,
    pub pollutant: String,
    pub limit: usize,
}

impl MeasurementRequest {
    pub fn new(
        location: LocationQuery,
        pollutant: &str,
        limit: usize,
    ) -> Result<Self, ValidationError> {
        let location = match location {
            LocationQuery::Area(bbox) => {
                bbox.validate()?;
                LocationQuery::Area(bbox)
            }
            LocationQuery::Point(point) => {
                validate_coordinates(point.latitude, point.longitude)?;
                LocationQuery::Point(point)
            }
            LocationQuery::Place(name) => LocationQuery::Place(normalize_place(&name)?),
        };

        Ok(Self {
            location,
            pollutant: validate_filters(pollutant, limit)?,
            limit,
        })
    }
}

/// Canonical pollutant id once the pollutant and limit are known to be usable.
pub fn validate_filters(pollutant: &str, limit: usize) -> Result<String, ValidationError> {
    let pollutant = canonical_id(pollutant);
    if pollutant.is_empty() {
        return Err(ValidationError::EmptyPollutant);
    }
    if limit == 0 || limit > AIRQ_MAX_LIMIT {
        return Err(ValidationError::InvalidLimit(limit));
    }
    Ok(pollutant)
}

/// Viewport query: a bounding box plus pollutant and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaRequest {
    pub bbox: BoundingBox,
    pub pollutant: String,
    pub limit: usize,
}

impl AreaRequest {
    pub fn new(bbox: BoundingBox, pollutant: &str, limit: usize) -> Result<Self, ValidationError> {
        let request = MeasurementRequest::new(LocationQuery::Area(bbox), pollutant, limit)?;
        Ok(Self {
            bbox,
            pollutant: request.pollutant,
            limit: request.limit,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStatus {
    Live,
    CacheFresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub status: FreshnessStatus,
    pub key: String,
    pub ttl_secs: u64,
    pub age_secs: u64,
}

/// Center and radius actually sent upstream for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuery {
    pub center: GeoPoint,
    pub radius_m: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    /// IANA timezone of a geocoded place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementsOutput {
    pub pollutant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ResolvedQuery>,
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_trace: Vec<String>,
    pub measurements: Vec<Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<CacheMetadata>,
}

impl MeasurementsOutput {
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

pub fn normalize_place(raw: &str) -> Result<String, ValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ValidationError::EmptyPlace);
    }
    Ok(value.to_string())
}

pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), ValidationError> {
    if !lat.is_finite() || !((-90.0)..=90.0).contains(&lat) {
        return Err(ValidationError::InvalidLatitude(lat));
    }
    if !lon.is_finite() || !((-180.0)..=180.0).contains(&lon) {
        return Err(ValidationError::InvalidLongitude(lon));
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing location input: use --bbox, --lat/--lon or --place")]
    MissingLocationInput,
    #[error("partial coordinates: provide both --lat and --lon")]
    PartialCoordinates,
    #[error("conflicting location input: use either --place or --lat/--lon")]
    ConflictingLocationInput,
    #[error("bbox must contain exactly four numbers: west,south,east,north")]
    MalformedBoundingBox,
    #[error("bbox coordinates are not valid (west < east and south < north required)")]
    InvertedBoundingBox,
    #[error("place must not be empty")]
    EmptyPlace,
    #[error("pollutant must not be empty")]
    EmptyPollutant,
    #[error("invalid limit: {0} (expected 1..=500)")]
    InvalidLimit(usize),
    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),
    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),
}
