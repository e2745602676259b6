use super::CatalogError;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Refresh this long before the catalog says the token dies.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

/// Client-credentials token holder; one request per token lifetime.
pub struct TokenCache {
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(accounts_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            token_url: format!("{}/api/token", accounts_url.trim_end_matches('/')),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self, http: &Client) -> Result<String, CatalogError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.refresh_at > Utc::now()
        {
            return Ok(token.value.clone());
        }

        let fresh = self.request_token(http).await?;
        let value = fresh.access_token.clone();
        let lifetime = (fresh.expires_in - EXPIRY_MARGIN_SECS).max(0);
        *cached = Some(CachedToken {
            value: fresh.access_token,
            refresh_at: Utc::now() + Duration::seconds(lifetime),
        });
        debug!(target = "bridge.catalog", lifetime_secs = lifetime, "token_refreshed");
        Ok(value)
    }

    async fn request_token(&self, http: &Client) -> Result<TokenResponse, CatalogError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CatalogError::MissingCredentials);
        }
        let response = http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|err| CatalogError::Auth(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Auth(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|err| CatalogError::Auth(err.to_string()))
    }
}
