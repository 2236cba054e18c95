//! NASA TEMPO observations through the Harmony OGC coverages API.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::Value;

use crate::config::{RetryPolicy, TempoProduct};
use crate::geo::point_window;
use crate::model::BoundingBox;

use super::{ProviderError, SourceRequest, execute_json_request, execute_with_retry};

const PROVIDER_NAME: &str = "nasa_tempo";
const GEOJSON_MEDIA_TYPE: &str = "application/geo+json";
const OUTPUT_CRS: &str = "EPSG:4326";

pub fn rangeset_url(harmony_root: &str, collection: &str) -> String {
    format!("{harmony_root}/ogc-api-coverages/collections/{collection}/coverage/rangeset")
}

fn build_query(product: &TempoProduct, request: &SourceRequest) -> Vec<(&'static str, String)> {
    let window = request
        .bbox
        .unwrap_or_else(|| point_window(request.center));

    vec![
        ("accept", GEOJSON_MEDIA_TYPE.to_string()),
        (
            "datetime",
            format!(
                "{}/{}",
                rfc3339(request.window_start),
                rfc3339(request.window_end)
            ),
        ),
        ("outputCrs", OUTPUT_CRS.to_string()),
        ("count", request.limit.to_string()),
        ("subset", lon_subset(&window)),
        ("subset", lat_subset(&window)),
        ("rangeSubset", product.variable.clone()),
    ]
}

fn rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn lon_subset(bbox: &BoundingBox) -> String {
    format!("lon({}:{})", bbox.west, bbox.east)
}

fn lat_subset(bbox: &BoundingBox) -> String {
    format!("lat({}:{})", bbox.south, bbox.north)
}

pub async fn fetch_coverage(
    client: &Client,
    harmony_root: &str,
    token: Option<&str>,
    product: Option<&TempoProduct>,
    request: &SourceRequest,
    retry_policy: RetryPolicy,
) -> Result<Value, ProviderError> {
    let Some(product) = product else {
        return Err(ProviderError::NotFound(format!(
            "{PROVIDER_NAME}: no product for pollutant {}",
            request.pollutant
        )));
    };
    let url = rangeset_url(harmony_root, &product.collection);
    let query = build_query(product, request);

    execute_with_retry(
        PROVIDER_NAME,
        retry_policy,
        || {
            let mut builder = client
                .get(&url)
                .header(reqwest::header::ACCEPT, GEOJSON_MEDIA_TYPE)
                .query(&query);
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            execute_json_request(builder)
        },
        tokio::time::sleep,
    )
    .await
}
