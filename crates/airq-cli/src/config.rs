use std::collections::HashMap;

pub const AIRQ_CACHE_TTL_SECS: u64 = 60;
pub const AIRQ_MAX_RADIUS_M: u32 = 30_000;
pub const AIRQ_POINT_RADIUS_M: u32 = 25_000;
pub const AIRQ_DEFAULT_LIMIT: usize = 200;
pub const AIRQ_MAX_LIMIT: usize = 500;
pub const AIRQ_DEBOUNCE_MS: u64 = 350;

pub const AIRQ_CACHE_TTL_SECS_ENV: &str = "AIRQ_CACHE_TTL_SECS";
pub const AIRQ_MAX_RADIUS_M_ENV: &str = "AIRQ_MAX_RADIUS_M";
pub const AIRQ_POINT_RADIUS_M_ENV: &str = "AIRQ_POINT_RADIUS_M";
pub const AIRQ_DEFAULT_LIMIT_ENV: &str = "AIRQ_DEFAULT_LIMIT";
pub const AIRQ_DEBOUNCE_MS_ENV: &str = "AIRQ_DEBOUNCE_MS";
pub const AIRQ_ABORT_ON_PRIMARY_TRANSPORT_ENV: &str = "AIRQ_ABORT_ON_PRIMARY_TRANSPORT";
pub const AIRQ_PROVIDER_TIMEOUT_SECS_ENV: &str = "AIRQ_PROVIDER_TIMEOUT_SECS";
pub const AIRQ_LOG_ENV: &str = "AIRQ_LOG";

const OPENAQ_BASE_URL_ENV: &str = "OPENAQ_BASE_URL";
const OPENAQ_API_KEY_ENV: &str = "OPENAQ_API_KEY";
const HARMONY_ROOT_ENV: &str = "HARMONY_ROOT";
const EARTHDATA_TOKEN_ENVS: [&str; 3] =
    ["EARTHDATA_TOKEN", "NASA_EARTHDATA_TOKEN", "HARMONY_AUTH_TOKEN"];
const OPEN_METEO_AIR_QUALITY_URL_ENV: &str = "OPEN_METEO_AIR_QUALITY_URL";
const OPEN_METEO_GEOCODE_URL_ENV: &str = "OPEN_METEO_GEOCODE_URL";

pub const DEFAULT_OPENAQ_BASE_URL: &str = "https://api.openaq.org";
pub const DEFAULT_HARMONY_ROOT: &str = "https://harmony.earthdata.nasa.gov";
pub const DEFAULT_OPEN_METEO_AIR_QUALITY_URL: &str =
    "https://air-quality-api.open-meteo.com/v1/air-quality";
pub const DEFAULT_OPEN_METEO_GEOCODE_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";

pub const PROVIDER_TIMEOUT_SECS: u64 = 20;
pub const PROVIDER_RETRY_MAX_ATTEMPTS: usize = 2;
pub const PROVIDER_RETRY_BASE_BACKOFF_MS: u64 = 200;
pub const USER_AGENT: &str = "constelar-airq-cli/1.0";

/// TEMPO collection and variable used for one pollutant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempoProduct {
    pub collection: String,
    pub variable: String,
}

// (pollutant, collection env, default collection, variable env, default variable)
const TEMPO_PRODUCT_DEFAULTS: [(&str, &str, &str, &str, &str); 4] = [
    (
        "no2",
        "TEMPO_COLLECTION_NO2",
        "C2930725014-LARC_CLOUD",
        "TEMPO_VAR_NO2",
        "nitrogendioxide_tropospheric_column",
    ),
    (
        "so2",
        "TEMPO_COLLECTION_SO2",
        "C2930725337-LARC_CLOUD",
        "TEMPO_VAR_SO2",
        "sulfurdioxide_total_column",
    ),
    (
        "o3",
        "TEMPO_COLLECTION_O3",
        "C2930725020-LARC_CLOUD",
        "TEMPO_VAR_O3",
        "ozone_total_column",
    ),
    (
        "hcho",
        "TEMPO_COLLECTION_HCHO",
        "C2930725347-LARC_CLOUD",
        "TEMPO_VAR_HCHO",
        "formaldehyde_tropospheric_column",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub openaq_base_url: String,
    pub harmony_root: String,
    pub open_meteo_air_quality_url: String,
    pub open_meteo_geocode_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openaq_base_url: DEFAULT_OPENAQ_BASE_URL.to_string(),
            harmony_root: DEFAULT_HARMONY_ROOT.to_string(),
            open_meteo_air_quality_url: DEFAULT_OPEN_METEO_AIR_QUALITY_URL.to_string(),
            open_meteo_geocode_url: DEFAULT_OPEN_METEO_GEOCODE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub openaq_api_key: Option<String>,
    pub earthdata_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub cache_ttl_secs: u64,
    pub max_radius_m: u32,
    pub point_radius_m: u32,
    pub default_limit: usize,
    pub debounce_ms: u64,
    pub abort_on_primary_transport: bool,
    pub provider_timeout_secs: u64,
    pub endpoints: Endpoints,
    pub credentials: Credentials,
    pub tempo_products: HashMap<String, TempoProduct>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_pairs(Vec::<(String, String)>::new())
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let max_radius_m =
            resolve_positive(&map, AIRQ_MAX_RADIUS_M_ENV).unwrap_or(AIRQ_MAX_RADIUS_M);
        let point_radius_m = resolve_positive(&map, AIRQ_POINT_RADIUS_M_ENV)
            .unwrap_or(AIRQ_POINT_RADIUS_M)
            .min(max_radius_m);

        Self {
            cache_ttl_secs: resolve_positive(&map, AIRQ_CACHE_TTL_SECS_ENV)
                .unwrap_or(AIRQ_CACHE_TTL_SECS),
            max_radius_m,
            point_radius_m,
            default_limit: resolve_positive(&map, AIRQ_DEFAULT_LIMIT_ENV)
                .unwrap_or(AIRQ_DEFAULT_LIMIT)
                .min(AIRQ_MAX_LIMIT),
            debounce_ms: resolve_positive(&map, AIRQ_DEBOUNCE_MS_ENV).unwrap_or(AIRQ_DEBOUNCE_MS),
            abort_on_primary_transport: resolve_flag(&map, AIRQ_ABORT_ON_PRIMARY_TRANSPORT_ENV),
            provider_timeout_secs: resolve_positive(&map, AIRQ_PROVIDER_TIMEOUT_SECS_ENV)
                .unwrap_or(PROVIDER_TIMEOUT_SECS),
            endpoints: resolve_endpoints(&map),
            credentials: Credentials {
                openaq_api_key: resolve_string(&map, OPENAQ_API_KEY_ENV),
                earthdata_token: EARTHDATA_TOKEN_ENVS
                    .iter()
                    .find_map(|key| resolve_string(&map, key)),
            },
            tempo_products: resolve_tempo_products(&map),
        }
    }

    pub fn tempo_product(&self, pollutant: &str) -> Option<&TempoProduct> {
        self.tempo_products.get(pollutant)
    }
}

fn resolve_string(env_map: &HashMap<String, String>, key: &str) -> Option<String> {
    env_map
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn resolve_url(env_map: &HashMap<String, String>, key: &str, default: &str) -> String {
    resolve_string(env_map, key)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn resolve_positive<T>(env_map: &HashMap<String, String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    resolve_string(env_map, key)
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn resolve_flag(env_map: &HashMap<String, String>, key: &str) -> bool {
    resolve_string(env_map, key)
        .map(|value| value.to_ascii_lowercase())
        .is_some_and(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
}

fn resolve_endpoints(env_map: &HashMap<String, String>) -> Endpoints {
    Endpoints {
        openaq_base_url: resolve_url(env_map, OPENAQ_BASE_URL_ENV, DEFAULT_OPENAQ_BASE_URL),
        harmony_root: resolve_url(env_map, HARMONY_ROOT_ENV, DEFAULT_HARMONY_ROOT),
        open_meteo_air_quality_url: resolve_url(
            env_map,
            OPEN_METEO_AIR_QUALITY_URL_ENV,
            DEFAULT_OPEN_METEO_AIR_QUALITY_URL,
        ),
        open_meteo_geocode_url: resolve_url(
            env_map,
            OPEN_METEO_GEOCODE_URL_ENV,
            DEFAULT_OPEN_METEO_GEOCODE_URL,
        ),
    }
}

fn resolve_tempo_products(env_map: &HashMap<String, String>) -> HashMap<String, TempoProduct> {
    TEMPO_PRODUCT_DEFAULTS
        .iter()
        .map(
            |(pollutant, collection_env, collection, variable_env, variable)| {
                let product = TempoProduct {
                    collection: resolve_string(env_map, collection_env)
                        .unwrap_or_else(|| collection.to_string()),
                    variable: resolve_string(env_map, variable_env)
                        .unwrap_or_else(|| variable.to_string()),
                };
                (pollutant.to_string(), product)
            },
        )
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: PROVIDER_RETRY_MAX_ATTEMPTS,
            base_backoff_ms: PROVIDER_RETRY_BASE_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(self, attempt: usize) -> u64 {
        if attempt <= 1 {
            return 0;
        }

        let shift = (attempt - 2).min(8);
        self.base_backoff_ms.saturating_mul(1_u64 << shift)
    }
}
