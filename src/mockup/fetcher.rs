use super::MockupError;
use crate::config::{HttpTimeouts, MockupConfig};
use crate::http::build_client;
use crate::models::ProductType;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Smallest body the renderer returns for a real image.
pub const MIN_MOCKUP_BYTES: usize = 64;

const KEYCHAIN_SLOTS: [&str; 5] = ["front", "inner_left", "inner_right", "disc", "back"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockupMode {
    Albumtag,
    Airvinyl,
    Keychain,
    CoupleKeychain,
}

impl MockupMode {
    pub fn for_product(product_type: ProductType) -> Self {
        match product_type {
            ProductType::Albumtag => MockupMode::Albumtag,
            ProductType::Airvinyl => MockupMode::Airvinyl,
            ProductType::Keychain => MockupMode::Keychain,
            ProductType::CoupleKeychain => MockupMode::CoupleKeychain,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            MockupMode::Albumtag | MockupMode::Airvinyl => Duration::from_secs(8),
            MockupMode::Keychain | MockupMode::CoupleKeychain => Duration::from_secs(10),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MockupMode::Albumtag => "albumtag",
            MockupMode::Airvinyl => "airvinyl",
            MockupMode::Keychain => "keychain",
            MockupMode::CoupleKeychain => "couple_keychain",
        }
    }
}

/// First non-empty of request id and catalog URL, else a fresh UUID.
pub fn cache_key(request_id: Option<&str>, catalog_url: Option<&str>) -> String {
    [request_id, catalog_url]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Builds the renderer URL for `sources` in `mode`.
pub fn render_url(
    base_url: &str,
    mode: MockupMode,
    sources: &[String],
    cache_key: &str,
) -> Result<String, MockupError> {
    let base = base_url.trim_end_matches('/');
    let version = urlencoding::encode(cache_key);
    match mode {
        MockupMode::Albumtag | MockupMode::Airvinyl => {
            let image = sources
                .iter()
                .find(|source| !source.trim().is_empty())
                .ok_or(MockupError::NoSources)?;
            let script = if mode == MockupMode::Airvinyl {
                "imgair.php"
            } else {
                "img.php"
            };
            Ok(format!(
                "{base}/{script}?albumImg={}&v={version}",
                urlencoding::encode(image.trim())
            ))
        }
        MockupMode::Keychain | MockupMode::CoupleKeychain => {
            let mut url = format!("{base}/img.php?mode={}", mode.as_str());
            let mut filled = 0;
            for (slot, source) in KEYCHAIN_SLOTS.iter().zip(sources) {
                if source.trim().is_empty() {
                    continue;
                }
                url.push_str(&format!(
                    "&{slot}={}",
                    urlencoding::encode(&slot_value(source))
                ));
                filled += 1;
            }
            if filled == 0 {
                return Err(MockupError::NoSources);
            }
            url.push_str(&format!("&v={version}"));
            Ok(url)
        }
    }
}

/// Remote-src URL for one refill bundle image; the shop fetches it itself.
pub fn refill_url(base_url: &str, image: &str) -> String {
    format!(
        "{}/imgrefill.php?albumImg={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(image.trim())
    )
}

/// URLs and data URIs pass through; bare base64 gets a data URI prefix.
/// Form encoding may have turned `+` into spaces on the way in.
fn slot_value(source: &str) -> String {
    let source = source.trim();
    if source.starts_with("http://") || source.starts_with("https://") {
        return source.to_string();
    }
    let repaired = source.replace(' ', "+");
    if repaired.starts_with("data:") {
        repaired
    } else {
        format!("data:image/jpeg;base64,{repaired}")
    }
}

#[async_trait]
pub trait MockupSource: Send + Sync {
    async fn build_mockup(
        &self,
        sources: &[String],
        mode: MockupMode,
        cache_key: &str,
    ) -> Result<Vec<u8>, MockupError>;

    /// The render URL, kept on records as the image reference.
    fn describe(&self, sources: &[String], mode: MockupMode, cache_key: &str) -> Option<String>;

    /// Remote-src URL for a refill bundle image.
    fn refill_image_url(&self, image: &str) -> String;
}

pub struct MockupFetcher {
    http: Client,
    base_url: String,
}

impl MockupFetcher {
    pub fn new(config: &MockupConfig, timeouts: HttpTimeouts) -> Self {
        Self {
            http: build_client(timeouts),
            base_url: config.base_url.clone(),
        }
    }
}

#[async_trait]
impl MockupSource for MockupFetcher {
    async fn build_mockup(
        &self,
        sources: &[String],
        mode: MockupMode,
        cache_key: &str,
    ) -> Result<Vec<u8>, MockupError> {
        let url = render_url(&self.base_url, mode, sources, cache_key)?;
        let response = self
            .http
            .get(&url)
            .timeout(mode.timeout())
            .send()
            .await
            .map_err(|err| MockupError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                target = "bridge.mockup",
                mode = mode.as_str(),
                status = status.as_u16(),
                "mockup_render_refused"
            );
            return Err(MockupError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| MockupError::Request(err.to_string()))?;
        if bytes.len() < MIN_MOCKUP_BYTES {
            return Err(MockupError::Undersized(bytes.len()));
        }
        debug!(
            target = "bridge.mockup",
            mode = mode.as_str(),
            bytes = bytes.len(),
            "mockup_fetched"
        );
        Ok(bytes.to_vec())
    }

    fn describe(&self, sources: &[String], mode: MockupMode, cache_key: &str) -> Option<String> {
        render_url(&self.base_url, mode, sources, cache_key).ok()
    }

    fn refill_image_url(&self, image: &str) -> String {
        refill_url(&self.base_url, image)
    }
}
