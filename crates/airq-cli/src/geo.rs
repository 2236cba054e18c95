use crate::model::{BoundingBox, GeoPoint, Measurement, ValidationError};

const EARTH_RADIUS_M: f64 = 6_371_008.8;
/// Half-width in degrees of the window used when a point query has to be
/// sent to an upstream that only accepts boxes.
pub const POINT_WINDOW_DEGREES: f64 = 0.2;

/// A place name resolved through geocoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlace {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
}

impl ResolvedPlace {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Parses `west,south,east,north`.
pub fn parse_bbox(raw: &str) -> Result<BoundingBox, ValidationError> {
    let parts = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ValidationError::MalformedBoundingBox)?;

    let [west, south, east, north] = parts.as_slice() else {
        return Err(ValidationError::MalformedBoundingBox);
    };
    BoundingBox::new(*west, *south, *east, *north)
}

pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Converts a box to its center and the center-to-corner distance, capped at
/// `max_radius_m`.
pub fn bbox_to_center_radius(bbox: &BoundingBox, max_radius_m: u32) -> (GeoPoint, u32) {
    let center = bbox.center();
    let corner = GeoPoint::new(bbox.north, bbox.east);
    (center, cap_radius(haversine_m(center, corner), max_radius_m))
}

pub fn cap_radius(radius_m: f64, max_radius_m: u32) -> u32 {
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return 1;
    }
    let capped = radius_m.ceil().min(f64::from(max_radius_m));
    (capped as u32).max(1)
}

pub fn point_window(point: GeoPoint) -> BoundingBox {
    BoundingBox {
        west: (point.longitude - POINT_WINDOW_DEGREES).max(-180.0),
        south: (point.latitude - POINT_WINDOW_DEGREES).max(-90.0),
        east: (point.longitude + POINT_WINDOW_DEGREES).min(180.0),
        north: (point.latitude + POINT_WINDOW_DEGREES).min(90.0),
    }
}

pub fn coordinate_label(lat: f64, lon: f64) -> String {
    format!("{:.4},{:.4}", round_to(lat, 4), round_to(lon, 4))
}

/// Fixed 3-decimal rendering used in cache keys so small viewport nudges
/// collapse onto the same key.
pub fn key_coordinate(value: f64) -> String {
    let rounded = round_to(value, 3);
    // Avoid "-0.000" and "0.000" producing different keys.
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{rounded:.3}")
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Picks the measurement closest to `point`, preferring ones with a value.
pub fn nearest_measurement(point: GeoPoint, measurements: &[Measurement]) -> Option<&Measurement> {
    fn closest<'m>(
        point: GeoPoint,
        items: impl Iterator<Item = &'m Measurement>,
    ) -> Option<&'m Measurement> {
        items.min_by(|a, b| {
            haversine_m(point, a.location).total_cmp(&haversine_m(point, b.location))
        })
    }

    closest(point, measurements.iter().filter(|item| item.value.is_some()))
        .or_else(|| closest(point, measurements.iter()))
}
