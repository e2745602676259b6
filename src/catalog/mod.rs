//! Read-only proxy to the music catalog search used by the storefront picker.

pub mod auth;

use crate::config::{CatalogConfig, HttpTimeouts};
use crate::http::build_client;
use auth::TokenCache;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("missing catalog client credentials in env")]
    MissingCredentials,
    #[error("catalog token request failed: {0}")]
    Auth(String),
    #[error("catalog search failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    #[default]
    Album,
    Track,
}

impl SearchKind {
    /// Anything that is not `album` searches tracks.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("album") => SearchKind::Album,
            Some(_) => SearchKind::Track,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::Album => "album",
            SearchKind::Track => "track",
        }
    }
}

pub struct CatalogClient {
    http: Client,
    api_url: String,
    tokens: TokenCache,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig, timeouts: HttpTimeouts) -> Self {
        Self {
            http: build_client(timeouts),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            tokens: TokenCache::new(&config.accounts_url, &config.client_id, &config.client_secret),
        }
    }

    /// Returns the catalog's JSON untouched.
    pub async fn search(&self, query: &str, kind: SearchKind) -> Result<Value, CatalogError> {
        let token = self.tokens.token(&self.http).await?;
        let response = self
            .http
            .get(format!("{}/v1/search", self.api_url))
            .bearer_auth(token)
            .query(&[("q", query), ("type", kind.as_str())])
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        info!(target = "bridge.catalog", kind = kind.as_str(), "search_proxied");
        Ok(body)
    }
}
