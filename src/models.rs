use crate::provision::ProvisionError;
use crate::store::ProductRecord;
use serde::{Deserialize, Serialize};

const MAX_TEXT_LEN: usize = 255;
pub const MAX_KEYCHAIN_IMAGES: usize = 5;
pub const MAX_BUNDLE_ENTRIES: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    #[default]
    Albumtag,
    Keychain,
    CoupleKeychain,
    Airvinyl,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Albumtag => "albumtag",
            ProductType::Keychain => "keychain",
            ProductType::CoupleKeychain => "couple_keychain",
            ProductType::Airvinyl => "airvinyl",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "albumtag" | "albumtagz" => Some(ProductType::Albumtag),
            "keychain" => Some(ProductType::Keychain),
            "couple_keychain" => Some(ProductType::CoupleKeychain),
            "airvinyl" | "airvinyls" => Some(ProductType::Airvinyl),
            _ => None,
        }
    }
}

/// Song/album product request as sent by the storefront.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRequest {
    pub title: String,
    pub artist: String,
    #[serde(rename = "image", alias = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "spotifyUrl", alias = "catalogUrl")]
    pub catalog_url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub product_type: Option<ProductType>,
}

impl ProductRequest {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require_text("title", &self.title)?;
        require_text("artist", &self.artist)?;
        require_http_url("image", &self.image_ref)?;
        require_http_url("spotifyUrl", &self.catalog_url)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepRequest {
    #[serde(rename = "spotifyUrl", alias = "catalogUrl")]
    pub catalog_url: String,
    #[serde(default)]
    pub product_type: Option<ProductType>,
}

impl KeepRequest {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require_http_url("spotifyUrl", &self.catalog_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeychainAlbum {
    pub title: String,
    pub artist: String,
    #[serde(default, rename = "spotifyUrl", alias = "catalogUrl")]
    pub catalog_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeychainRequest {
    pub album: KeychainAlbum,
    /// Data URIs, bare base64 payloads, or http(s) image URLs.
    pub uploaded_images: Vec<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

impl KeychainRequest {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require_text("album.title", &self.album.title)?;
        require_text("album.artist", &self.album.artist)?;
        if let Some(url) = &self.album.catalog_url
            && url.chars().count() > MAX_TEXT_LEN
        {
            return Err(ProvisionError::invalid_input(
                "validate",
                "album.spotifyUrl_too_long",
            ));
        }
        if self.uploaded_images.is_empty() {
            return Err(ProvisionError::invalid_input(
                "validate",
                "uploadedImages_required",
            ));
        }
        if self.uploaded_images.len() > MAX_KEYCHAIN_IMAGES {
            return Err(ProvisionError::invalid_input(
                "validate",
                "too_many_uploaded_images",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    pub title: String,
    #[serde(alias = "catalogUrls")]
    pub spotify_urls: Vec<String>,
    pub images: Vec<String>,
    pub artists: Vec<String>,
}

impl BundleRequest {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require_text("title", &self.title)?;
        for (field, len) in [
            ("spotifyUrls", self.spotify_urls.len()),
            ("images", self.images.len()),
            ("artists", self.artists.len()),
        ] {
            if len == 0 || len > MAX_BUNDLE_ENTRIES {
                return Err(ProvisionError::invalid_input(
                    "validate",
                    format!("{field}_must_have_1_to_{MAX_BUNDLE_ENTRIES}_entries"),
                ));
            }
        }
        for url in self.spotify_urls.iter().chain(self.images.iter()) {
            require_http_url("bundle_url", url)?;
        }
        for artist in &self.artists {
            require_text("artists", artist)?;
        }
        Ok(())
    }
}

/// Serialized record shape; field names follow what the storefront already reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecordView {
    pub id: u64,
    pub title: String,
    pub artist: String,
    #[serde(rename = "image")]
    pub image_ref: Option<String>,
    #[serde(rename = "spotify_url")]
    pub catalog_url: Option<String>,
    #[serde(rename = "shopify_url")]
    pub storefront_url: String,
    pub variant_id: Option<u64>,
}

impl From<&ProductRecord> for ProductRecordView {
    fn from(record: &ProductRecord) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            artist: record.artist.clone(),
            image_ref: record.source_image_ref.clone(),
            catalog_url: record.catalog_url.clone(),
            storefront_url: record.storefront_url.clone(),
            variant_id: record.variant_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeychainResponse {
    pub success: bool,
    pub product_id: u64,
    pub product_url: String,
    pub local_record: ProductRecordView,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepResponse {
    pub success: bool,
    pub message: String,
    pub kept: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleResponse {
    pub success: bool,
    pub shopify_url: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            detail,
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<(), ProvisionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProvisionError::invalid_input(
            "validate",
            format!("{field}_required"),
        ));
    }
    if trimmed.chars().count() > MAX_TEXT_LEN {
        return Err(ProvisionError::invalid_input(
            "validate",
            format!("{field}_too_long"),
        ));
    }
    Ok(())
}

fn require_http_url(field: &str, value: &str) -> Result<(), ProvisionError> {
    match reqwest::Url::parse(value.trim()) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(ProvisionError::invalid_input(
            "validate",
            format!("invalid_url: {field}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::ProvisionErrorKind;
    use serde_json::json;

    fn sample_request() -> ProductRequest {
        ProductRequest {
            title: "Echoes".into(),
            artist: "Band X".into(),
            image_ref: "https://img/ex.png".into(),
            catalog_url: "https://catalog/track/123".into(),
            id: None,
            product_type: None,
        }
    }

    #[test]
    fn product_request_accepts_storefront_and_neutral_names() {
        let storefront: ProductRequest = serde_json::from_value(json!({
            "title": "Echoes",
            "artist": "Band X",
            "image": "https://img/ex.png",
            "spotifyUrl": "https://catalog/track/123",
        }))
        .expect("storefront payload");
        let neutral: ProductRequest = serde_json::from_value(json!({
            "title": "Echoes",
            "artist": "Band X",
            "imageRef": "https://img/ex.png",
            "catalogUrl": "https://catalog/track/123",
            "productType": "airvinyl",
        }))
        .expect("neutral payload");
        assert_eq!(storefront.catalog_url, neutral.catalog_url);
        assert_eq!(storefront.product_type, None);
        assert_eq!(neutral.product_type, Some(ProductType::Airvinyl));
    }

    #[test]
    fn validation_rejects_blank_title_and_bad_urls() {
        assert!(sample_request().validate().is_ok());

        let blank = ProductRequest {
            title: "  ".into(),
            ..sample_request()
        };
        let err = blank.validate().expect_err("blank title");
        assert_eq!(err.kind(), ProvisionErrorKind::InvalidInput);
        assert_eq!(err.detail(), "title_required");

        let ftp = ProductRequest {
            image_ref: "ftp://img/ex.png".into(),
            ..sample_request()
        };
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn keychain_validation_bounds_image_count() {
        let mut req = KeychainRequest {
            album: KeychainAlbum {
                title: "Echoes".into(),
                artist: "Band X".into(),
                catalog_url: None,
            },
            uploaded_images: vec![],
            customer_id: None,
        };
        assert!(req.validate().is_err());
        req.uploaded_images = vec!["aGVsbG8=".into(); 5];
        assert!(req.validate().is_ok());
        req.uploaded_images.push("aGVsbG8=".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn product_type_round_trips_wire_names() {
        for kind in [
            ProductType::Albumtag,
            ProductType::Keychain,
            ProductType::CoupleKeychain,
            ProductType::Airvinyl,
        ] {
            assert_eq!(ProductType::from_str(kind.as_str()), Some(kind));
            assert_eq!(json!(kind), json!(kind.as_str()));
        }
        assert_eq!(ProductType::from_str("vinyl"), None);
    }

    #[test]
    fn record_view_uses_storefront_field_names() {
        let view = ProductRecordView {
            id: 7,
            title: "Echoes".into(),
            artist: "Band X".into(),
            image_ref: Some("https://img/ex.png".into()),
            catalog_url: Some("https://catalog/track/123".into()),
            storefront_url: "https://www.albumtagz.com/products/echoes-band-x".into(),
            variant_id: None,
        };
        let value = json!(view);
        assert_eq!(value["spotify_url"], json!("https://catalog/track/123"));
        assert_eq!(
            value["shopify_url"],
            json!("https://www.albumtagz.com/products/echoes-band-x")
        );
        assert!(value.get("variant_id").is_some());
    }
}
