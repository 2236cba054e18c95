use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CachedResult, ResultCache, area_cache_key, point_cache_key};
use crate::config::RuntimeConfig;
use crate::error::FetchError;
use crate::geo::{ResolvedPlace, bbox_to_center_radius, nearest_measurement};
use crate::model::{
    AreaRequest, CacheMetadata, FreshnessStatus, GeoPoint, LocationQuery, Measurement,
    MeasurementRequest, MeasurementsOutput, ResolvedQuery, normalize_place,
};
use crate::normalize::Normalizer;
use crate::providers::{ProviderApi, ProviderError, SOURCE_PRIORITY, Source, SourceRequest};

const OBSERVATION_WINDOW_HOURS: i64 = 24;
const PRIMARY_SOURCE: Source = SOURCE_PRIORITY[0];

/// Fetches measurements through the source fallback chain, memoizing
/// non-empty results in an owned [`ResultCache`].
pub struct MeasurementService<P, N = fn() -> DateTime<Utc>> {
    providers: P,
    config: RuntimeConfig,
    cache: ResultCache<CachedResult>,
    now_fn: N,
}

impl<P: ProviderApi> MeasurementService<P> {
    pub fn new(providers: P, config: RuntimeConfig) -> Self {
        Self::with_clock(providers, config, Utc::now)
    }
}

impl<P, N> MeasurementService<P, N>
where
    P: ProviderApi,
    N: Fn() -> DateTime<Utc>,
{
    pub fn with_clock(providers: P, config: RuntimeConfig, now_fn: N) -> Self {
        let cache = ResultCache::new(config.cache_ttl_secs);
        Self {
            providers,
            config,
            cache,
            now_fn,
        }
    }

    pub fn providers(&self) -> &P {
        &self.providers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache<CachedResult> {
        &self.cache
    }

    pub async fn fetch(
        &self,
        request: &MeasurementRequest,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        match &request.location {
            LocationQuery::Area(bbox) => {
                let area = AreaRequest::new(*bbox, &request.pollutant, request.limit)?;
                self.fetch_measurements(&area, token).await
            }
            LocationQuery::Point(point) => {
                self.fetch_point_output(*point, &request.pollutant, request.limit, token)
                    .await
            }
            LocationQuery::Place(name) => {
                self.fetch_place_output(name, &request.pollutant, request.limit, token)
                    .await
            }
        }
    }

    pub async fn fetch_measurements(
        &self,
        request: &AreaRequest,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        request.bbox.validate()?;
        let (center, radius_m) = bbox_to_center_radius(&request.bbox, self.config.max_radius_m);
        let query = ResolvedQuery {
            center,
            radius_m,
            bbox: Some(request.bbox),
            place: None,
            timezone: None,
        };
        let key = area_cache_key(&request.pollutant, &request.bbox, request.limit);

        self.fetch_resolved(&request.pollutant, request.limit, query, key, token)
            .await
    }

    pub async fn fetch_point_output(
        &self,
        point: GeoPoint,
        pollutant: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        let request = MeasurementRequest::new(LocationQuery::Point(point), pollutant, limit)?;
        self.fetch_point(point, &request.pollutant, request.limit, None, token)
            .await
    }

    /// Resolves `name` through geocoding first. An unknown place yields an
    /// empty result rather than an error.
    pub async fn fetch_place_output(
        &self,
        name: &str,
        pollutant: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        let name = normalize_place(name)?;
        let request = MeasurementRequest::new(LocationQuery::Place(name.clone()), pollutant, limit)?;

        let geocoded = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled("geocode")),
            result = self.providers.geocode_place(&name) => result,
        };

        match geocoded {
            Ok(place) => {
                debug!(place = %place.name, lat = place.latitude, lon = place.longitude, "place resolved");
                self.fetch_point(
                    place.point(),
                    &request.pollutant,
                    request.limit,
                    Some(place),
                    token,
                )
                .await
            }
            Err(error) => {
                if error.is_no_match() {
                    info!(place = %name, "place not found");
                } else {
                    warn!(place = %name, %error, "geocoding failed");
                }
                Ok(MeasurementsOutput {
                    pollutant: request.pollutant,
                    query: None,
                    source: None,
                    source_trace: vec![format!("geocode: {error}")],
                    measurements: Vec::new(),
                    freshness: None,
                })
            }
        }
    }

    /// Nearest measurement with a value around the point, falling back to the
    /// nearest one without a value. `None` when no source had data.
    pub async fn fetch_at_point(
        &self,
        latitude: f64,
        longitude: f64,
        pollutant: &str,
        token: &CancellationToken,
    ) -> Result<Option<Measurement>, FetchError> {
        let point = GeoPoint::new(latitude, longitude);
        let output = self
            .fetch_point_output(point, pollutant, self.config.default_limit, token)
            .await?;
        Ok(nearest_measurement(point, &output.measurements).cloned())
    }

    async fn fetch_point(
        &self,
        point: GeoPoint,
        pollutant: &str,
        limit: usize,
        place: Option<ResolvedPlace>,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        let radius_m = self.config.point_radius_m.min(self.config.max_radius_m);
        let query = ResolvedQuery {
            center: point,
            radius_m,
            bbox: None,
            place: place.as_ref().map(|place| place.name.clone()),
            timezone: place.map(|place| place.timezone),
        };
        let key = point_cache_key(pollutant, point, radius_m, limit);

        self.fetch_resolved(pollutant, limit, query, key, token).await
    }

    async fn fetch_resolved(
        &self,
        pollutant: &str,
        limit: usize,
        query: ResolvedQuery,
        key: String,
        token: &CancellationToken,
    ) -> Result<MeasurementsOutput, FetchError> {
        if token.is_cancelled() {
            return Err(cancelled("start"));
        }

        let now = (self.now_fn)();
        if let Some(hit) = self.cache.get_at(&key, now) {
            debug!(%key, age_secs = hit.age_secs, "cache hit");
            return Ok(MeasurementsOutput {
                pollutant: pollutant.to_string(),
                query: Some(query),
                source: Some(hit.value.source),
                source_trace: Vec::new(),
                measurements: hit.value.measurements,
                freshness: Some(self.cache_metadata(
                    FreshnessStatus::CacheFresh,
                    key,
                    hit.age_secs,
                )),
            });
        }

        let source_request = SourceRequest {
            pollutant: pollutant.to_string(),
            center: query.center,
            radius_m: query.radius_m,
            bbox: query.bbox,
            limit,
            window_start: now - chrono::Duration::hours(OBSERVATION_WINDOW_HOURS),
            window_end: now,
        };
        let mut trace = Vec::new();

        for source in SOURCE_PRIORITY {
            debug!(source = source.as_str(), %key, "querying source");
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled(source.as_str())),
                result = self.providers.fetch_source(source, &source_request) => result,
            };

            let payload = match outcome {
                Ok(payload) => payload,
                Err(error) => {
                    self.record_failure(source, error, &mut trace)?;
                    continue;
                }
            };

            let alias = match source {
                Source::Tempo => self
                    .config
                    .tempo_product(pollutant)
                    .map(|product| product.variable.as_str()),
                Source::OpenAq | Source::OpenMeteo => None,
            };
            let measurements = normalize_for(pollutant, limit, &payload, now, alias);
            if measurements.is_empty() {
                debug!(source = source.as_str(), "source returned no measurements");
                trace.push(format!("{}: no measurements", source.as_str()));
                continue;
            }

            // A superseded request must not overwrite what its successor caches.
            if token.is_cancelled() {
                return Err(cancelled(source.as_str()));
            }

            info!(
                source = source.as_str(),
                count = measurements.len(),
                "measurements fetched"
            );
            self.cache.set_at(
                key.clone(),
                CachedResult {
                    source: source.as_str().to_string(),
                    measurements: measurements.clone(),
                },
                now,
            );
            return Ok(MeasurementsOutput {
                pollutant: pollutant.to_string(),
                query: Some(query),
                source: Some(source.as_str().to_string()),
                source_trace: trace,
                measurements,
                freshness: Some(self.cache_metadata(FreshnessStatus::Live, key, 0)),
            });
        }

        info!(%key, "no source returned measurements");
        Ok(MeasurementsOutput {
            pollutant: pollutant.to_string(),
            query: Some(query),
            source: None,
            source_trace: trace,
            measurements: Vec::new(),
            freshness: Some(self.cache_metadata(FreshnessStatus::Live, key, 0)),
        })
    }

    fn record_failure(
        &self,
        source: Source,
        error: ProviderError,
        trace: &mut Vec<String>,
    ) -> Result<(), FetchError> {
        trace.push(format!("{}: {error}", source.as_str()));

        if error.is_no_match() {
            debug!(source = source.as_str(), %error, "source has no match");
            return Ok(());
        }

        warn!(source = source.as_str(), %error, "source failed");
        if source == PRIMARY_SOURCE && self.config.abort_on_primary_transport {
            return Err(FetchError::Upstream {
                source: error,
                trace: trace.clone(),
            });
        }
        Ok(())
    }

    fn cache_metadata(&self, status: FreshnessStatus, key: String, age_secs: u64) -> CacheMetadata {
        CacheMetadata {
            status,
            key,
            ttl_secs: self.cache.ttl_secs(),
            age_secs,
        }
    }
}

/// `upstream_alias` is the source's own name for the requested pollutant when
/// it is configurable and may be missing from the alias table.
fn normalize_for(
    pollutant: &str,
    limit: usize,
    payload: &Value,
    now: DateTime<Utc>,
    upstream_alias: Option<&str>,
) -> Vec<Measurement> {
    let mut normalizer = Normalizer::new(pollutant).with_reference_time(now);
    if let Some(alias) = upstream_alias {
        normalizer = normalizer.with_alias(alias, pollutant);
    }
    let mut measurements: Vec<Measurement> = normalizer
        .normalize(payload)
        .into_iter()
        .filter(|measurement| measurement.pollutant == pollutant)
        .collect();
    measurements.truncate(limit);
    measurements
}

fn cancelled(stage: &str) -> FetchError {
    debug!(stage, "request cancelled");
    FetchError::Cancelled
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::model::BoundingBox;

    struct FakeProviders {
        geocode_result: Result<ResolvedPlace, ProviderError>,
        openaq_result: Result<Value, ProviderError>,
        tempo_result: Result<Value, ProviderError>,
        open_meteo_result: Result<Value, ProviderError>,
        calls: RefCell<Vec<(&'static str, SourceRequest)>>,
        hang_openaq: bool,
        cancel_on_call: Option<CancellationToken>,
    }

    impl FakeProviders {
        fn empty() -> Self {
            Self {
                geocode_result: Ok(ResolvedPlace {
                    name: "Córdoba".to_string(),
                    latitude: -31.4135,
                    longitude: -64.18105,
                    timezone: "America/Argentina/Cordoba".to_string(),
                }),
                openaq_result: Ok(json!({"results": []})),
                tempo_result: Ok(json!({"type": "FeatureCollection", "features": []})),
                open_meteo_result: Ok(json!({"hourly": {"time": []}})),
                calls: RefCell::new(Vec::new()),
                hang_openaq: false,
                cancel_on_call: None,
            }
        }

        fn not_found() -> Self {
            let missing = |status: u16| {
                Err(ProviderError::Http {
                    status,
                    message: "no data".to_string(),
                })
            };
            Self {
                openaq_result: missing(404),
                tempo_result: Err(ProviderError::NotFound("no granules".to_string())),
                open_meteo_result: missing(400),
                ..Self::empty()
            }
        }

        fn call_names(&self) -> Vec<&'static str> {
            self.calls.borrow().iter().map(|(name, _)| *name).collect()
        }

        fn record(&self, name: &'static str, request: &SourceRequest) {
            self.calls.borrow_mut().push((name, request.clone()));
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
        }
    }

    impl ProviderApi for FakeProviders {
        async fn geocode_place(&self, _name: &str) -> Result<ResolvedPlace, ProviderError> {
            self.geocode_result.clone()
        }

        async fn fetch_openaq(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
            self.record("openaq", request);
            if self.hang_openaq {
                std::future::pending::<()>().await;
            }
            self.openaq_result.clone()
        }

        async fn fetch_tempo(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
            self.record("nasa_tempo", request);
            self.tempo_result.clone()
        }

        async fn fetch_open_meteo(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
            self.record("open_meteo", request);
            self.open_meteo_result.clone()
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0)
            .single()
            .expect("time")
    }

    fn service(providers: FakeProviders) -> MeasurementService<FakeProviders, fn() -> DateTime<Utc>> {
        MeasurementService::with_clock(
            providers,
            RuntimeConfig::default(),
            fixed_now as fn() -> DateTime<Utc>,
        )
    }

    fn cordoba_request(pollutant: &str) -> AreaRequest {
        let bbox = BoundingBox::new(-64.20, -31.43, -64.18, -31.41).expect("bbox");
        AreaRequest::new(bbox, pollutant, 200).expect("request")
    }

    fn openaq_payload() -> Value {
        json!({
            "results": [
                {
                    "parameter": {"name": "no2", "units": "µg/m³"},
                    "value": 21.4,
                    "coordinates": {"latitude": -31.42, "longitude": -64.19},
                    "date": {"utc": "2026-02-10T11:00:00Z"}
                },
                {
                    "parameter": {"name": "pm25", "units": "µg/m³"},
                    "value": 9.0,
                    "coordinates": {"latitude": -31.42, "longitude": -64.19},
                    "date": {"utc": "2026-02-10T11:00:00Z"}
                }
            ]
        })
    }

    fn tempo_payload() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [-64.19, -31.42]},
                    "properties": {
                        "parameter": "nitrogendioxide_tropospheric_column",
                        "value": 4.2e15,
                        "unit": "molecules/cm^2",
                        "time": "2026-02-10T10:30:00Z"
                    }
                }
            ]
        })
    }

    fn open_meteo_payload() -> Value {
        json!({
            "latitude": -31.4,
            "longitude": -64.2,
            "hourly_units": {"time": "iso8601", "nitrogen_dioxide": "μg/m³"},
            "hourly": {
                "time": ["2026-02-10T10:00", "2026-02-10T11:00", "2026-02-10T13:00"],
                "nitrogen_dioxide": [12.0, 14.5, 30.0]
            }
        })
    }

    #[tokio::test]
    async fn service_returns_first_source_with_measurements() {
        let providers = FakeProviders {
            openaq_result: Ok(openaq_payload()),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.source.as_deref(), Some("openaq"));
        assert_eq!(output.measurements.len(), 1);
        assert_eq!(output.measurements[0].pollutant, "no2");
        assert_eq!(output.measurements[0].value, Some(21.4));
        assert_eq!(service.providers.call_names(), vec!["openaq"]);
        let freshness = output.freshness.expect("freshness");
        assert_eq!(freshness.status, FreshnessStatus::Live);
        assert_eq!(freshness.key, "no2:bbox:-64.200,-31.430,-64.180,-31.410:l200");
    }

    #[tokio::test]
    async fn service_falls_back_in_priority_order_when_primary_is_empty() {
        let providers = FakeProviders {
            tempo_result: Ok(tempo_payload()),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.source.as_deref(), Some("nasa_tempo"));
        assert_eq!(service.providers.call_names(), vec!["openaq", "nasa_tempo"]);
        assert_eq!(output.source_trace, vec!["openaq: no measurements".to_string()]);
        let measurement = &output.measurements[0];
        assert_eq!(measurement.unit, "mol/m²");
        assert_eq!(measurement.location, GeoPoint::new(-31.42, -64.19));
    }

    #[tokio::test]
    async fn service_keeps_tempo_records_named_by_configured_variable() {
        let mut payload = tempo_payload();
        payload["features"][0]["properties"]["parameter"] = json!("custom_no2_column");
        let providers = FakeProviders {
            tempo_result: Ok(payload),
            ..FakeProviders::empty()
        };
        let config = RuntimeConfig::from_pairs([("TEMPO_VAR_NO2", "custom_no2_column")]);
        let service = MeasurementService::with_clock(providers, config, fixed_now);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.source.as_deref(), Some("nasa_tempo"));
        assert_eq!(output.measurements.len(), 1);
        let measurement = &output.measurements[0];
        assert_eq!(measurement.pollutant, "no2");
        assert_eq!(measurement.unit, "mol/m²");
        let expected = 4.2e15 * crate::units::MOLECULES_PER_CM2_TO_MOL_PER_M2;
        let value = measurement.value.expect("value");
        assert!(((value - expected) / expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn service_uses_modeled_source_last() {
        let providers = FakeProviders {
            open_meteo_result: Ok(open_meteo_payload()),
            ..FakeProviders::not_found()
        };
        let service = service(providers);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.source.as_deref(), Some("open_meteo"));
        assert_eq!(output.measurements.len(), 1);
        assert_eq!(output.measurements[0].value, Some(14.5));
        assert_eq!(output.measurements[0].observed_at, "2026-02-10T11:00:00Z");
        assert_eq!(output.source_trace.len(), 2);
    }

    #[tokio::test]
    async fn service_cordoba_bbox_queries_each_source_once_with_capped_radius() {
        let service = service(FakeProviders::empty());

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert!(output.is_empty());
        assert_eq!(output.source, None);
        assert_eq!(
            service.providers.call_names(),
            vec!["openaq", "nasa_tempo", "open_meteo"]
        );

        for (_, request) in service.providers.calls.borrow().iter() {
            assert!((request.center.latitude - (-31.42)).abs() < 1e-9);
            assert!((request.center.longitude - (-64.19)).abs() < 1e-9);
            assert!(request.radius_m <= 30_000);
            assert_eq!(request.window_end, fixed_now());
        }
    }

    #[tokio::test]
    async fn service_empty_results_are_not_cached() {
        let service = service(FakeProviders::empty());
        let token = CancellationToken::new();

        service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect("output");
        service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect("output");

        assert!(service.cache().is_empty());
        assert_eq!(service.providers.call_names().len(), 6);
    }

    #[tokio::test]
    async fn service_second_call_is_served_from_cache() {
        let providers = FakeProviders {
            openaq_result: Ok(openaq_payload()),
            ..FakeProviders::empty()
        };
        let service = service(providers);
        let token = CancellationToken::new();

        let first = service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect("first");
        let second = service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect("second");

        assert_eq!(service.providers.call_names(), vec!["openaq"]);
        assert_eq!(first.measurements, second.measurements);
        let freshness = second.freshness.expect("freshness");
        assert_eq!(freshness.status, FreshnessStatus::CacheFresh);
        assert_eq!(freshness.ttl_secs, 60);
        assert_eq!(second.source.as_deref(), Some("openaq"));
    }

    #[tokio::test]
    async fn service_transport_failure_falls_through_to_next_source() {
        let providers = FakeProviders {
            openaq_result: Err(ProviderError::Transport("openaq: connection reset".to_string())),
            tempo_result: Err(ProviderError::Http {
                status: 503,
                message: "nasa_tempo: unavailable".to_string(),
            }),
            open_meteo_result: Ok(open_meteo_payload()),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.source.as_deref(), Some("open_meteo"));
        assert!(output.source_trace[0].contains("connection reset"));
        assert!(output.source_trace[1].contains("503"));
    }

    #[tokio::test]
    async fn service_aborts_on_primary_failure_when_configured() {
        let providers = FakeProviders {
            openaq_result: Err(ProviderError::Transport("openaq: connection reset".to_string())),
            open_meteo_result: Ok(open_meteo_payload()),
            ..FakeProviders::empty()
        };
        let config = RuntimeConfig {
            abort_on_primary_transport: true,
            ..RuntimeConfig::default()
        };
        let service = MeasurementService::with_clock(providers, config, fixed_now);

        let error = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect_err("must fail");

        assert!(matches!(error, FetchError::Upstream { .. }));
        assert_eq!(service.providers.call_names(), vec!["openaq"]);
    }

    #[tokio::test]
    async fn service_abort_flag_ignores_no_match_on_primary() {
        let providers = FakeProviders {
            open_meteo_result: Ok(open_meteo_payload()),
            ..FakeProviders::not_found()
        };
        let config = RuntimeConfig {
            abort_on_primary_transport: true,
            ..RuntimeConfig::default()
        };
        let service = MeasurementService::with_clock(providers, config, fixed_now);

        let output = service
            .fetch_measurements(&cordoba_request("no2"), &CancellationToken::new())
            .await
            .expect("output");
        assert_eq!(output.source.as_deref(), Some("open_meteo"));
    }

    #[tokio::test]
    async fn service_point_query_with_no_data_anywhere_is_none() {
        let service = service(FakeProviders::not_found());

        let result = service
            .fetch_at_point(-31.42, -64.19, "no2", &CancellationToken::new())
            .await
            .expect("result");

        assert_eq!(result, None);
        assert_eq!(
            service.providers.call_names(),
            vec!["openaq", "nasa_tempo", "open_meteo"]
        );
    }

    #[tokio::test]
    async fn service_point_query_returns_nearest_measurement() {
        let providers = FakeProviders {
            openaq_result: Ok(json!({
                "results": [
                    {"parameter": "no2", "value": 40.0, "latitude": -31.60, "longitude": -64.40},
                    {"parameter": "no2", "value": 18.0, "latitude": -31.43, "longitude": -64.20},
                    {"parameter": "no2", "value": "n/a", "latitude": -31.42, "longitude": -64.19}
                ]
            })),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let nearest = service
            .fetch_at_point(-31.42, -64.19, "no2", &CancellationToken::new())
            .await
            .expect("result")
            .expect("measurement");

        assert_eq!(nearest.value, Some(18.0));
        let calls = service.providers.calls.borrow();
        assert_eq!(calls[0].1.radius_m, 25_000);
        assert_eq!(calls[0].1.bbox, None);
    }

    #[tokio::test]
    async fn service_unknown_place_is_empty_not_error() {
        let providers = FakeProviders {
            geocode_result: Err(ProviderError::NotFound("Atlantis".to_string())),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let output = service
            .fetch_place_output("Atlantis", "o3", 10, &CancellationToken::new())
            .await
            .expect("output");

        assert!(output.is_empty());
        assert!(service.providers.call_names().is_empty());
        assert_eq!(output.source_trace, vec!["geocode: not found: Atlantis".to_string()]);
    }

    #[tokio::test]
    async fn service_place_query_reports_resolved_place() {
        let providers = FakeProviders {
            openaq_result: Ok(openaq_payload()),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let output = service
            .fetch_place_output(" Córdoba ", "pm2.5", 10, &CancellationToken::new())
            .await
            .expect("output");

        let query = output.query.expect("query");
        assert_eq!(query.place.as_deref(), Some("Córdoba"));
        assert_eq!(query.timezone.as_deref(), Some("America/Argentina/Cordoba"));
        assert_eq!(query.center, GeoPoint::new(-31.4135, -64.18105));
        assert_eq!(output.pollutant, "pm25");
        assert_eq!(output.measurements.len(), 1);
    }

    #[tokio::test]
    async fn service_cancelled_token_short_circuits_before_any_call() {
        let service = service(FakeProviders::empty());
        let token = CancellationToken::new();
        token.cancel();

        let error = service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect_err("must fail");

        assert_eq!(error, FetchError::Cancelled);
        assert!(service.providers.call_names().is_empty());
    }

    #[tokio::test]
    async fn service_cancellation_during_fetch_never_writes_cache() {
        let token = CancellationToken::new();
        let providers = FakeProviders {
            openaq_result: Ok(openaq_payload()),
            cancel_on_call: Some(token.clone()),
            ..FakeProviders::empty()
        };
        let service = service(providers);

        let error = service
            .fetch_measurements(&cordoba_request("no2"), &token)
            .await
            .expect_err("must fail");

        assert!(error.is_cancelled());
        assert!(service.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn service_superseded_in_flight_fetch_resolves_cancelled() {
        let providers = FakeProviders {
            hang_openaq: true,
            ..FakeProviders::empty()
        };
        let service = service(providers);
        let token = CancellationToken::new();
        let area = cordoba_request("no2");

        let (result, ()) = tokio::join!(
            service.fetch_measurements(&area, &token),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                token.cancel();
            }
        );

        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(service.providers.call_names(), vec!["openaq"]);
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn service_truncates_to_limit_and_filters_other_pollutants() {
        let rows: Vec<Value> = (0..5_i32)
            .map(|index| {
                json!([-31.42 + f64::from(index) * 0.001, -64.19, "no2", 10 + index, "µg/m³", ""])
            })
            .chain(std::iter::once(json!([-31.42, -64.19, "o3", 5, "µg/m³", ""])))
            .collect();
        let providers = FakeProviders {
            openaq_result: Ok(Value::Array(rows)),
            ..FakeProviders::empty()
        };
        let service = service(providers);
        let bbox = BoundingBox::new(-64.20, -31.43, -64.18, -31.41).expect("bbox");
        let request = AreaRequest::new(bbox, "no2", 3).expect("request");

        let output = service
            .fetch_measurements(&request, &CancellationToken::new())
            .await
            .expect("output");

        assert_eq!(output.measurements.len(), 3);
        assert!(output.measurements.iter().all(|item| item.pollutant == "no2"));
    }
}
