use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::pollutant::{Vocabulary, upstream_id};

use super::{ProviderError, SourceRequest, execute_json_request, execute_with_retry};

const PROVIDER_NAME: &str = "openaq";
const MEASUREMENTS_PATH: &str = "/v3/measurements";
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Serialize, PartialEq)]
struct MeasurementsQuery {
    parameter: String,
    coordinates: String,
    radius: u32,
    limit: usize,
}

fn build_query(request: &SourceRequest) -> Result<MeasurementsQuery, ProviderError> {
    let parameter = upstream_id(&request.pollutant, Vocabulary::OpenAq).ok_or_else(|| {
        ProviderError::NotFound(format!("no parameter for pollutant {}", request.pollutant))
    })?;

    Ok(MeasurementsQuery {
        parameter,
        coordinates: format!(
            "{},{}",
            request.center.latitude, request.center.longitude
        ),
        radius: request.radius_m,
        limit: request.limit,
    })
}

pub async fn fetch_measurements(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    request: &SourceRequest,
    retry_policy: RetryPolicy,
) -> Result<Value, ProviderError> {
    let query = build_query(request).map_err(|error| error.with_provider(PROVIDER_NAME))?;
    let url = format!("{base_url}{MEASUREMENTS_PATH}");

    execute_with_retry(
        PROVIDER_NAME,
        retry_policy,
        || {
            let mut builder = client.get(&url).query(&query);
            if let Some(key) = api_key {
                builder = builder.header(API_KEY_HEADER, key);
            }
            execute_json_request(builder)
        },
        tokio::time::sleep,
    )
    .await
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::GeoPoint;

    fn request(pollutant: &str) -> SourceRequest {
        let now = Utc
            .with_ymd_and_hms(2026, 2, 10, 12, 0, 0)
            .single()
            .expect("time");
        SourceRequest {
            pollutant: pollutant.to_string(),
            center: GeoPoint::new(-31.42, -64.19),
            radius_m: 1_500,
            bbox: None,
            limit: 200,
            window_start: now - chrono::Duration::hours(24),
            window_end: now,
        }
    }

    #[test]
    fn openaq_query_uses_center_radius_and_parameter() {
        let query = build_query(&request("pm25")).expect("query");
        assert_eq!(
            query,
            MeasurementsQuery {
                parameter: "pm25".to_string(),
                coordinates: "-31.42,-64.19".to_string(),
                radius: 1_500,
                limit: 200,
            }
        );
    }

    #[test]
    fn openaq_query_serializes_as_url_parameters() {
        let client = Client::new();
        let query = build_query(&request("no2")).expect("query");
        let built = client
            .get("https://api.openaq.test/v3/measurements")
            .query(&query)
            .build()
            .expect("request");

        assert_eq!(
            built.url().query(),
            Some("parameter=no2&coordinates=-31.42%2C-64.19&radius=1500&limit=200")
        );
    }
}
