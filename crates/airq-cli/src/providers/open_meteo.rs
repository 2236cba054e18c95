use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::geo::ResolvedPlace;
use crate::pollutant::{Vocabulary, upstream_id};

use super::{ProviderError, SourceRequest, execute_json_request, execute_with_retry};

const PROVIDER_NAME: &str = "open_meteo";
const DEFAULT_TIMEZONE: &str = "GMT";

#[derive(Debug, Serialize)]
struct GeocodeQuery<'a> {
    name: &'a str,
    count: u8,
    language: &'a str,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    name: String,
    latitude: f64,
    longitude: f64,
    timezone: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct AirQualityQuery<'a> {
    latitude: f64,
    longitude: f64,
    hourly: String,
    past_days: u8,
    forecast_days: u8,
    timezone: &'a str,
}

pub async fn fetch_geocode(
    client: &Client,
    endpoint: &str,
    place: &str,
    retry_policy: RetryPolicy,
) -> Result<ResolvedPlace, ProviderError> {
    let query = GeocodeQuery {
        name: place,
        count: 1,
        language: "en",
        format: "json",
    };

    let body = execute_with_retry(
        PROVIDER_NAME,
        retry_policy,
        || execute_json_request(client.get(endpoint).query(&query)),
        tokio::time::sleep,
    )
    .await?;
    parse_geocode_response(body, place).map_err(|error| error.with_provider(PROVIDER_NAME))
}

pub async fn fetch_air_quality(
    client: &Client,
    endpoint: &str,
    request: &SourceRequest,
    retry_policy: RetryPolicy,
) -> Result<Value, ProviderError> {
    let query = build_air_quality_query(request).map_err(|error| error.with_provider(PROVIDER_NAME))?;

    execute_with_retry(
        PROVIDER_NAME,
        retry_policy,
        || execute_json_request(client.get(endpoint).query(&query)),
        tokio::time::sleep,
    )
    .await
}

fn build_air_quality_query(request: &SourceRequest) -> Result<AirQualityQuery<'static>, ProviderError> {
    let hourly = upstream_id(&request.pollutant, Vocabulary::OpenMeteo).ok_or_else(|| {
        ProviderError::NotFound(format!("no hourly variable for pollutant {}", request.pollutant))
    })?;

    Ok(AirQualityQuery {
        latitude: request.center.latitude,
        longitude: request.center.longitude,
        hourly,
        past_days: 1,
        forecast_days: 1,
        timezone: DEFAULT_TIMEZONE,
    })
}

fn parse_geocode_response(body: Value, place: &str) -> Result<ResolvedPlace, ProviderError> {
    let payload: GeocodeResponse = serde_json::from_value(body)
        .map_err(|error| ProviderError::InvalidResponse(format!("geocode payload: {error}")))?;

    let Some(result) = payload.results.into_iter().next() else {
        return Err(ProviderError::NotFound(place.to_string()));
    };

    if result.name.trim().is_empty() {
        return Err(ProviderError::InvalidResponse(
            "geocode payload: empty location name".to_string(),
        ));
    }
    if !result.latitude.is_finite() || !result.longitude.is_finite() {
        return Err(ProviderError::InvalidResponse(
            "geocode payload: non-finite coordinates".to_string(),
        ));
    }

    let timezone = result
        .timezone
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());

    Ok(ResolvedPlace {
        name: result.name,
        latitude: result.latitude,
        longitude: result.longitude,
        timezone,
    })
}
