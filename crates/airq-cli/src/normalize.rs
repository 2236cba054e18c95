//! Turns heterogeneous upstream payloads into canonical [`Measurement`]s.
//!
//! A payload is classified once into a [`RawBatch`] variant and every item of
//! the batch goes through that variant's parser. Items whose coordinates do
//! not resolve to two finite numbers are dropped.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::model::{GeoPoint, Measurement};
use crate::pollutant::canonical_id;
use crate::units;

const CONTAINER_KEYS: [&str; 5] = ["results", "data", "features", "observations", "items"];
const LATITUDE_KEYS: [&str; 3] = ["lat", "latitude", "y"];
const LONGITUDE_KEYS: [&str; 4] = ["lon", "lng", "longitude", "x"];
const PARAMETER_KEYS: [&str; 4] = ["parameter", "pollutant", "param", "parameter_name"];
const VALUE_KEYS: [&str; 5] = ["value", "measurement", "average", "mean", "concentration"];
const UNIT_KEYS: [&str; 2] = ["unit", "units"];
const TIME_KEYS: [&str; 8] = [
    "datetime",
    "date",
    "time",
    "timestamp",
    "observed_at",
    "observedAt",
    "start_time",
    "start_datetime",
];
const HOURLY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Shape of one upstream batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawBatch<'a> {
    /// `[lat, lon, parameter, value, unit, datetime]` rows.
    Tuples(&'a [Value]),
    /// Loosely typed flat objects.
    Records(&'a [Value]),
    /// GeoJSON features.
    Features(&'a [Value]),
    /// Parallel hourly arrays keyed by pollutant plus a shared `time` array.
    Hourly(&'a Map<String, Value>),
}

pub fn detect(payload: &Value) -> Option<RawBatch<'_>> {
    match payload {
        Value::Array(items) => Some(classify_items(items)),
        Value::Object(object) => {
            if object.get("hourly").is_some_and(Value::is_object) {
                return Some(RawBatch::Hourly(object));
            }

            for key in CONTAINER_KEYS {
                if let Some(Value::Array(items)) = object.get(key) {
                    return Some(classify_items(items));
                }
            }

            if let Some(Value::Array(items)) = object
                .get("properties")
                .and_then(|properties| properties.get("observations"))
            {
                return Some(classify_items(items));
            }

            match object.get("data") {
                Some(inner @ Value::Object(_)) => detect(inner),
                _ => None,
            }
        }
        _ => None,
    }
}

fn classify_items(items: &[Value]) -> RawBatch<'_> {
    match items.iter().find(|item| !item.is_null()) {
        Some(Value::Array(_)) => RawBatch::Tuples(items),
        Some(Value::Object(object)) if object.contains_key("geometry") => {
            RawBatch::Features(items)
        }
        _ => RawBatch::Records(items),
    }
}

/// Provisional record before coordinate validation and unit conversion.
#[derive(Debug, Default)]
struct RawRecord {
    latitude: Option<f64>,
    longitude: Option<f64>,
    parameter: Option<String>,
    value: Option<f64>,
    unit: String,
    observed_at: String,
}

#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    fallback_pollutant: &'a str,
    reference_time: Option<DateTime<Utc>>,
    extra_aliases: Vec<(&'a str, &'a str)>,
}

impl<'a> Normalizer<'a> {
    /// `fallback_pollutant` is used for records that do not name one.
    pub fn new(fallback_pollutant: &'a str) -> Self {
        Self {
            fallback_pollutant,
            reference_time: None,
            extra_aliases: Vec::new(),
        }
    }

    /// Treats `upstream` as another name for `canonical`, on top of the
    /// built-in alias table. Used for configured TEMPO variable names.
    pub fn with_alias(mut self, upstream: &'a str, canonical: &'a str) -> Self {
        self.extra_aliases.push((upstream, canonical));
        self
    }

    /// Hourly series ignore entries after `reference_time` when an earlier
    /// non-null entry exists.
    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = Some(reference_time);
        self
    }

    pub fn normalize(&self, payload: &Value) -> Vec<Measurement> {
        detect(payload)
            .map(|batch| self.normalize_batch(batch))
            .unwrap_or_default()
    }

    pub fn normalize_batch(&self, batch: RawBatch<'_>) -> Vec<Measurement> {
        match batch {
            RawBatch::Tuples(items) => items
                .iter()
                .filter_map(|item| self.finish(parse_tuple(item)?))
                .collect(),
            RawBatch::Records(items) => items
                .iter()
                .filter_map(|item| self.finish(parse_record(item.as_object()?)))
                .collect(),
            RawBatch::Features(items) => items
                .iter()
                .filter_map(|item| self.finish(parse_feature(item.as_object()?)))
                .collect(),
            RawBatch::Hourly(object) => parse_hourly(object, self.reference_time)
                .into_iter()
                .filter_map(|record| self.finish(record))
                .collect(),
        }
    }

    fn finish(&self, record: RawRecord) -> Option<Measurement> {
        let location = GeoPoint::new(record.latitude?, record.longitude?);
        if !location.is_finite() {
            return None;
        }

        let pollutant = record
            .parameter
            .as_deref()
            .map(|parameter| self.resolve_pollutant(parameter))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| canonical_id(self.fallback_pollutant));
        let (value, unit) = units::convert(&pollutant, record.value, &record.unit);

        Some(Measurement {
            location,
            pollutant,
            value,
            unit,
            observed_at: record.observed_at,
        })
    }
}

impl Normalizer<'_> {
    fn resolve_pollutant(&self, parameter: &str) -> String {
        let parameter = parameter.trim();
        self.extra_aliases
            .iter()
            .find(|(upstream, _)| upstream.trim().eq_ignore_ascii_case(parameter))
            .map(|(_, canonical)| canonical_id(canonical))
            .unwrap_or_else(|| canonical_id(parameter))
    }
}

fn parse_tuple(item: &Value) -> Option<RawRecord> {
    let row = item.as_array()?;
    let field = |index: usize| row.get(index).unwrap_or(&Value::Null);

    Some(RawRecord {
        latitude: parse_number(field(0)),
        longitude: parse_number(field(1)),
        parameter: text(field(2)),
        value: parse_number(field(3)),
        unit: text(field(4)).unwrap_or_default(),
        observed_at: timestamp_text(field(5)).unwrap_or_default(),
    })
}

fn parse_record(object: &Map<String, Value>) -> RawRecord {
    let sources = [object];
    let (latitude, longitude) = match resolve_flat_coordinates(&sources) {
        Some((lat, lon)) => (Some(lat), Some(lon)),
        None => nested_coordinates(object).unzip(),
    };
    fill_fields(&sources, latitude, longitude)
}

fn parse_feature(feature: &Map<String, Value>) -> RawRecord {
    let empty = Map::new();
    let properties = feature
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let sources = [properties, feature];

    let (latitude, longitude) = match resolve_flat_coordinates(&sources) {
        Some((lat, lon)) => (Some(lat), Some(lon)),
        None => feature
            .get("geometry")
            .and_then(|geometry| geometry.get("coordinates"))
            .and_then(lon_lat_pair)
            .unzip(),
    };
    fill_fields(&sources, latitude, longitude)
}

fn fill_fields(
    sources: &[&Map<String, Value>],
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> RawRecord {
    let parameter_value = lookup(sources, &PARAMETER_KEYS);
    let parameter = parameter_value.and_then(|value| match value {
        Value::Object(inner) => inner.get("name").and_then(text),
        other => text(other),
    });
    let unit = lookup(sources, &UNIT_KEYS)
        .and_then(text)
        .or_else(|| {
            parameter_value
                .and_then(|value| value.get("units"))
                .and_then(text)
        })
        .unwrap_or_default();

    RawRecord {
        latitude,
        longitude,
        parameter,
        value: lookup(sources, &VALUE_KEYS).and_then(parse_number),
        unit,
        observed_at: lookup(sources, &TIME_KEYS)
            .and_then(timestamp_text)
            .unwrap_or_default(),
    }
}

fn parse_hourly(object: &Map<String, Value>, reference: Option<DateTime<Utc>>) -> Vec<RawRecord> {
    let Some(hourly) = object.get("hourly").and_then(Value::as_object) else {
        return Vec::new();
    };
    let times: Vec<&Value> = hourly
        .get("time")
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_default();
    let units = object.get("hourly_units").and_then(Value::as_object);
    let latitude = object.get("latitude").and_then(parse_number);
    let longitude = object.get("longitude").and_then(parse_number);

    hourly
        .iter()
        .filter(|(key, _)| key.as_str() != "time")
        .filter_map(|(key, series)| {
            let series = series.as_array()?;
            let (index, value) = latest_entry(series, &times, reference)?;
            Some(RawRecord {
                latitude,
                longitude,
                parameter: Some(key.clone()),
                value: Some(value),
                unit: units
                    .and_then(|units| units.get(key))
                    .and_then(text)
                    .unwrap_or_default(),
                observed_at: times
                    .get(index)
                    .and_then(|time| time.as_str())
                    .map(hourly_timestamp)
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Latest non-null entry not after `reference`, or the latest non-null entry
/// when every non-null entry lies after it.
fn latest_entry(
    series: &[Value],
    times: &[&Value],
    reference: Option<DateTime<Utc>>,
) -> Option<(usize, f64)> {
    let mut latest_any = None;

    for (index, raw) in series.iter().enumerate().rev() {
        let Some(value) = parse_number(raw) else {
            continue;
        };
        latest_any.get_or_insert((index, value));

        let entry_time = times
            .get(index)
            .and_then(|time| time.as_str())
            .and_then(parse_hourly_time);
        match (reference, entry_time) {
            (Some(reference), Some(entry_time)) if entry_time > reference => continue,
            _ => return Some((index, value)),
        }
    }

    latest_any
}

fn parse_hourly_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), HOURLY_TIME_FORMAT)
        .ok()
        .map(|value| value.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|value| value.with_timezone(&Utc))
        })
}

fn hourly_timestamp(raw: &str) -> String {
    parse_hourly_time(raw)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| raw.trim().to_string())
}

fn resolve_flat_coordinates(sources: &[&Map<String, Value>]) -> Option<(f64, f64)> {
    let latitude = lookup(sources, &LATITUDE_KEYS).and_then(parse_number)?;
    let longitude = lookup(sources, &LONGITUDE_KEYS).and_then(parse_number)?;
    Some((latitude, longitude))
}

fn nested_coordinates(object: &Map<String, Value>) -> Option<(f64, f64)> {
    match object.get("coordinates") {
        Some(Value::Object(inner)) => resolve_flat_coordinates(&[inner]),
        Some(pair @ Value::Array(_)) => lon_lat_pair(pair),
        _ => object
            .get("geometry")
            .and_then(|geometry| geometry.get("coordinates"))
            .and_then(lon_lat_pair),
    }
}

/// GeoJSON order: `[lon, lat]`. Returns `(lat, lon)`.
fn lon_lat_pair(value: &Value) -> Option<(f64, f64)> {
    let pair = value.as_array()?;
    let longitude = parse_number(pair.first()?)?;
    let latitude = parse_number(pair.get(1)?)?;
    Some((latitude, longitude))
}

fn lookup<'v>(sources: &[&'v Map<String, Value>], keys: &[&str]) -> Option<&'v Value> {
    sources.iter().copied().find_map(|source| {
        keys.iter()
            .find_map(|key| source.get(*key).filter(|value| !value.is_null()))
    })
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|raw| !raw.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn timestamp_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(inner) => ["utc", "local"]
            .iter()
            .find_map(|key| inner.get(*key).and_then(text)),
        other => text(other),
    }
}

/// Numeric parse that accepts numbers and numeric strings, including a
/// decimal comma (`"15,5"`).
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|value| value.is_finite()),
        Value::String(raw) => parse_decimal(raw),
        _ => None,
    }
}

pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let cleaned = match (trimmed.rfind(','), trimmed.rfind('.')) {
        // "1.234,5": comma is the decimal separator.
        (Some(comma), Some(dot)) if comma > dot => trimmed.replace('.', "").replace(',', "."),
        // "1,234.5": comma groups thousands.
        (Some(_), Some(_)) => trimmed.replace(',', ""),
        (Some(_), None) if trimmed.matches(',').count() == 1 => trimmed.replace(',', "."),
        (Some(_), None) => trimmed.replace(',', ""),
        _ => trimmed.to_string(),
    };

    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}
