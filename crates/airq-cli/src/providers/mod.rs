use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{RetryPolicy, RuntimeConfig, USER_AGENT};
use crate::geo::ResolvedPlace;
use crate::model::{BoundingBox, GeoPoint};

pub mod open_meteo;
pub mod openaq;
pub mod tempo;

/// Upstream measurement sources in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    OpenAq,
    Tempo,
    OpenMeteo,
}

pub const SOURCE_PRIORITY: [Source; 3] = [Source::OpenAq, Source::Tempo, Source::OpenMeteo];

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::OpenAq => "openaq",
            Source::Tempo => "nasa_tempo",
            Source::OpenMeteo => "open_meteo",
        }
    }
}

/// Query handed to every source adapter for one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub pollutant: String,
    pub center: GeoPoint,
    pub radius_m: u32,
    /// Present for area queries; point queries derive a window when needed.
    pub bbox: Option<BoundingBox>,
    pub limit: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[allow(async_fn_in_trait)]
pub trait ProviderApi {
    async fn geocode_place(&self, name: &str) -> Result<ResolvedPlace, ProviderError>;
    async fn fetch_openaq(&self, request: &SourceRequest) -> Result<Value, ProviderError>;
    async fn fetch_tempo(&self, request: &SourceRequest) -> Result<Value, ProviderError>;
    async fn fetch_open_meteo(&self, request: &SourceRequest) -> Result<Value, ProviderError>;

    async fn fetch_source(
        &self,
        source: Source,
        request: &SourceRequest,
    ) -> Result<Value, ProviderError> {
        match source {
            Source::OpenAq => self.fetch_openaq(request).await,
            Source::Tempo => self.fetch_tempo(request).await,
            Source::OpenMeteo => self.fetch_open_meteo(request).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpProviders {
    client: Client,
    config: RuntimeConfig,
    retry_policy: RetryPolicy,
}

impl HttpProviders {
    pub fn new(config: &RuntimeConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.provider_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            retry_policy: RetryPolicy::default(),
        })
    }
}

impl ProviderApi for HttpProviders {
    async fn geocode_place(&self, name: &str) -> Result<ResolvedPlace, ProviderError> {
        open_meteo::fetch_geocode(
            &self.client,
            &self.config.endpoints.open_meteo_geocode_url,
            name,
            self.retry_policy,
        )
        .await
    }

    async fn fetch_openaq(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
        openaq::fetch_measurements(
            &self.client,
            &self.config.endpoints.openaq_base_url,
            self.config.credentials.openaq_api_key.as_deref(),
            request,
            self.retry_policy,
        )
        .await
    }

    async fn fetch_tempo(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
        tempo::fetch_coverage(
            &self.client,
            &self.config.endpoints.harmony_root,
            self.config.credentials.earthdata_token.as_deref(),
            self.config.tempo_product(&request.pollutant),
            request,
            self.retry_policy,
        )
        .await
    }

    async fn fetch_open_meteo(&self, request: &SourceRequest) -> Result<Value, ProviderError> {
        open_meteo::fetch_air_quality(
            &self.client,
            &self.config.endpoints.open_meteo_air_quality_url,
            request,
            self.retry_policy,
        )
        .await
    }
}

pub async fn execute_with_retry<T, F, Fut, S, SFut>(
    provider_name: &'static str,
    policy: RetryPolicy,
    mut operation: F,
    mut sleep_fn: S,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.retryable() || attempt == max_attempts {
                    return Err(error.with_provider(provider_name));
                }

                let delay = policy.backoff_for_attempt(attempt + 1);
                debug!(provider = provider_name, attempt, delay_ms = delay, %error, "retrying");
                sleep_fn(Duration::from_millis(delay)).await;
            }
        }
    }

    Err(ProviderError::InvalidResponse(format!(
        "{provider_name}: exhausted retry attempts"
    )))
}

/// Sends the request and decodes a JSON body, mapping non-2xx statuses to
/// [`ProviderError::Http`].
pub async fn execute_json_request(request: RequestBuilder) -> Result<Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|error| ProviderError::Transport(error.without_url().to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|error| ProviderError::Transport(error.without_url().to_string()))?;

    if !status.is_success() {
        let message = extract_error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        return Err(ProviderError::Http {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&body)
        .map_err(|error| ProviderError::InvalidResponse(format!("json payload: {error}")))
}

pub fn extract_error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let from_json = serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|json| {
            ["reason", "message", "error", "detail", "description"]
                .into_iter()
                .filter_map(|key| json.get(key).and_then(Value::as_str))
                .map(str::trim)
                .find(|message| !message.is_empty())
                .map(str::to_string)
        });

    from_json.or_else(|| Some(trimmed.to_string()))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            ProviderError::InvalidResponse(_) => false,
            ProviderError::NotFound(_) => false,
        }
    }

    /// The source has nothing for this query; the next source should be tried
    /// without logging a failure.
    pub fn is_no_match(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => matches!(status, 400 | 404 | 410 | 422),
            ProviderError::NotFound(_) => true,
            ProviderError::Transport(_) | ProviderError::InvalidResponse(_) => false,
        }
    }

    pub fn with_provider(self, provider: &'static str) -> Self {
        match self {
            ProviderError::Transport(message) => {
                ProviderError::Transport(format!("{provider}: {message}"))
            }
            ProviderError::Http { status, message } => ProviderError::Http {
                status,
                message: format!("{provider}: {message}"),
            },
            ProviderError::InvalidResponse(message) => {
                ProviderError::InvalidResponse(format!("{provider}: {message}"))
            }
            ProviderError::NotFound(message) => {
                ProviderError::NotFound(format!("{provider}: {message}"))
            }
        }
    }
}
