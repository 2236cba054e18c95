use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::key_coordinate;
use crate::model::{BoundingBox, GeoPoint, Measurement};

/// Cached outcome of one successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub source: String,
    pub measurements: Vec<Measurement>,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<V> {
    pub value: V,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub age_secs: u64,
    pub is_fresh: bool,
}

/// In-memory memo with lazy expiry on read. Entries are only removed when a
/// read finds them stale.
#[derive(Debug)]
pub struct ResultCache<V> {
    ttl_secs: u64,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Utc::now()).map(|hit| hit.value)
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_at(key, value, Utc::now());
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheHit<V>> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;

        let freshness = evaluate_freshness(entry.stored_at, now, self.ttl_secs);
        if !freshness.is_fresh {
            entries.remove(key);
            return None;
        }

        Some(CacheHit {
            value: entry.value.clone(),
            age_secs: freshness.age_secs,
        })
    }

    pub fn set_at(&self, key: impl Into<String>, value: V, now: DateTime<Utc>) {
        self.lock().insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn evaluate_freshness(
    stored_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl_secs: u64,
) -> Freshness {
    let age_secs = now
        .signed_duration_since(stored_at)
        .num_seconds()
        .max(0)
        .try_into()
        .unwrap_or(u64::MAX);

    Freshness {
        age_secs,
        is_fresh: age_secs < ttl_secs,
    }
}

pub fn area_cache_key(pollutant: &str, bbox: &BoundingBox, limit: usize) -> String {
    format!(
        "{pollutant}:bbox:{},{},{},{}:l{limit}",
        key_coordinate(bbox.west),
        key_coordinate(bbox.south),
        key_coordinate(bbox.east),
        key_coordinate(bbox.north)
    )
}

pub fn point_cache_key(pollutant: &str, point: GeoPoint, radius_m: u32, limit: usize) -> String {
    format!(
        "{pollutant}:point:{},{}:r{radius_m}:l{limit}",
        key_coordinate(point.latitude),
        key_coordinate(point.longitude)
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 12, minute, second)
            .single()
            .expect("time")
    }

    fn fixture_result() -> CachedResult {
        CachedResult {
            source: "openaq".to_string(),
            measurements: vec![Measurement {
                location: GeoPoint::new(-31.42, -64.19),
                pollutant: "pm25".to_string(),
                value: Some(17.5),
                unit: "µg/m³".to_string(),
                observed_at: "2026-02-10T11:00:00Z".to_string(),
            }],
        }
    }

    #[test]
    fn cache_key_contains_pollutant_and_rounded_bbox() {
        let bbox = BoundingBox::new(-64.20, -31.43, -64.18, -31.41).expect("bbox");
        assert_eq!(
            area_cache_key("no2", &bbox, 200),
            "no2:bbox:-64.200,-31.430,-64.180,-31.410:l200"
        );
        assert_eq!(
            point_cache_key("o3", GeoPoint::new(-31.42, -64.19), 25_000, 1),
            "o3:point:-31.420,-64.190:r25000:l1"
        );
    }

    #[test]
    fn cache_key_absorbs_small_viewport_nudges() {
        let a = BoundingBox::new(-64.2001, -31.4302, -64.1799, -31.4098).expect("bbox");
        let b = BoundingBox::new(-64.1998, -31.4299, -64.1802, -31.4101).expect("bbox");
        assert_eq!(area_cache_key("no2", &a, 50), area_cache_key("no2", &b, 50));
    }

    #[test]
    fn cache_round_trip_before_ttl_returns_value() {
        let cache = ResultCache::new(60);
        cache.set_at("k", fixture_result(), at(0, 0));

        let hit = cache.get_at("k", at(0, 30)).expect("hit");
        assert_eq!(hit.value, fixture_result());
        assert_eq!(hit.age_secs, 30);
    }

    #[test]
    fn cache_expired_entry_is_a_miss_and_is_not_resurrected() {
        let cache = ResultCache::new(60);
        cache.set_at("k", fixture_result(), at(0, 0));

        assert_eq!(cache.get_at("k", at(1, 0)), None);
        assert!(cache.is_empty());
        assert_eq!(cache.get_at("k", at(0, 10)), None);
    }

    #[test]
    fn cache_entry_expires_exactly_at_ttl() {
        let cache = ResultCache::new(60);
        cache.set_at("k", 7_u32, at(0, 0));

        assert_eq!(cache.get_at("k", at(0, 59)).map(|hit| hit.age_secs), Some(59));
        assert_eq!(cache.get_at("k", at(1, 0)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_set_overwrites_existing_entry() {
        let cache = ResultCache::new(60);
        cache.set_at("k", 1_u32, at(0, 0));
        cache.set_at("k", 2_u32, at(0, 50));

        let hit = cache.get_at("k", at(1, 30)).expect("hit");
        assert_eq!(hit.value, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_instances_are_independent() {
        let first = ResultCache::new(60);
        let second = ResultCache::<u32>::new(60);
        first.set_at("k", 1_u32, at(0, 0));

        assert!(first.get_at("k", at(0, 1)).is_some());
        assert!(second.get_at("k", at(0, 1)).is_none());
    }

    #[test]
    fn cache_wall_clock_round_trip() {
        let cache = ResultCache::new(300);
        cache.set("k", fixture_result());
        assert_eq!(cache.get("k"), Some(fixture_result()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn cache_freshness_marks_record_as_stale_after_ttl() {
        let result = evaluate_freshness(at(0, 0), at(6, 0), 300);
        assert_eq!(result.age_secs, 360);
        assert!(!result.is_fresh);

        let result = evaluate_freshness(at(0, 0), at(4, 0), 300);
        assert_eq!(result.age_secs, 240);
        assert!(result.is_fresh);
    }
}
