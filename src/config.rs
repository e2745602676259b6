use std::{env, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide settings, read once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub http: HttpTimeouts,
    pub shop: ShopConfig,
    pub mockup: MockupConfig,
    pub catalog: CatalogConfig,
    pub store: StoreConfig,
    pub jobs: JobsConfig,
    pub cors_origins: Vec<String>,
    /// When set, `/metrics` requires a matching `X-Metrics-Key` header.
    pub metrics_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShopConfig {
    /// Admin API root, e.g. `https://745b68-a1.myshopify.com/admin/api/2024-10`.
    pub admin_url: String,
    pub access_token: String,
    pub storefront_base_url: String,
}

#[derive(Debug, Clone)]
pub struct MockupConfig {
    pub base_url: String,
    pub webp_enabled: bool,
    pub webp_quality: f32,
}

impl Default for MockupConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dtchdesign.nl/create-product".into(),
            webp_enabled: true,
            webp_quality: 90.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub client_id: String,
    pub client_secret: String,
    pub accounts_url: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub enabled: bool,
    pub sweep_interval: Duration,
    pub sweep_batch: usize,
    pub extend_hour_utc: u32,
    pub order_window_days: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(120),
            sweep_batch: 80,
            extend_hour_utc: 1,
            order_window_days: 30,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let shop_url = required("SHOPIFY_SHOP_URL")?;
        let access_token = required("SHOPIFY_ACCESS_TOKEN")?;
        let api_version = env_or("SHOPIFY_API_VERSION", "2024-10");
        let shop = ShopConfig {
            admin_url: admin_url(&shop_url, &api_version),
            access_token,
            storefront_base_url: env_or("STOREFRONT_BASE_URL", "https://www.albumtagz.com")
                .trim_end_matches('/')
                .to_string(),
        };

        let mockup_defaults = MockupConfig::default();
        let webp_quality = env_parse::<f32>("MOCKUP_WEBP_QUALITY")?
            .unwrap_or(mockup_defaults.webp_quality);
        if !(0.0..=100.0).contains(&webp_quality) {
            return Err(ConfigError::Invalid {
                key: "MOCKUP_WEBP_QUALITY",
                value: webp_quality.to_string(),
            });
        }
        let mockup = MockupConfig {
            base_url: env_or("MOCKUP_BASE_URL", &mockup_defaults.base_url)
                .trim_end_matches('/')
                .to_string(),
            webp_enabled: env_bool("MOCKUP_WEBP").unwrap_or(true),
            webp_quality,
        };

        let catalog = CatalogConfig {
            client_id: env::var("SPOTIFY_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default(),
            accounts_url: env_or("SPOTIFY_ACCOUNTS_URL", "https://accounts.spotify.com"),
            api_url: env_or("SPOTIFY_API_URL", "https://api.spotify.com"),
        };

        let store = StoreConfig {
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            key_prefix: env_or("REDIS_KEY_PREFIX", "musictags"),
        };

        let job_defaults = JobsConfig::default();
        let extend_hour_utc =
            env_parse::<u32>("ORDER_EXTEND_HOUR_UTC")?.unwrap_or(job_defaults.extend_hour_utc);
        if extend_hour_utc > 23 {
            return Err(ConfigError::Invalid {
                key: "ORDER_EXTEND_HOUR_UTC",
                value: extend_hour_utc.to_string(),
            });
        }
        let jobs = JobsConfig {
            enabled: env_bool("SCHEDULER_ENABLED").unwrap_or(true),
            sweep_interval: env_parse::<u64>("SWEEP_INTERVAL_SECS")?
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(job_defaults.sweep_interval),
            sweep_batch: env_parse::<usize>("SWEEP_BATCH_SIZE")?
                .filter(|v| *v > 0)
                .unwrap_or(job_defaults.sweep_batch),
            extend_hour_utc,
            order_window_days: env_parse::<i64>("ORDER_WINDOW_DAYS")?
                .filter(|v| *v > 0)
                .unwrap_or(job_defaults.order_window_days),
        };

        let http_defaults = HttpTimeouts::default();
        let http = HttpTimeouts {
            request: env_parse::<u64>("HTTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.request),
            connect: env_parse::<u64>("HTTP_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.connect),
        };

        Ok(Self {
            port: env_parse::<u16>("PORT")?.unwrap_or(8000),
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES")?
                .filter(|v| *v > 0)
                .unwrap_or(16 * 1024 * 1024),
            http,
            shop,
            mockup,
            catalog,
            store,
            jobs,
            cors_origins: env_list("CORS_ALLOWED_ORIGINS"),
            metrics_key: env::var("METRICS_KEY").ok().filter(|v| !v.trim().is_empty()),
        })
    }
}

/// Accepts a bare shop domain or a full URL and yields the versioned admin root.
pub fn admin_url(shop_url: &str, api_version: &str) -> String {
    let trimmed = shop_url.trim().trim_end_matches('/');
    let base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    format!("{base}/admin/api/{api_version}")
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
