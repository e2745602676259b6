use crate::store::ExternalId;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Active,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewProduct {
    pub title: String,
    pub vendor: String,
    pub product_type: String,
    pub status: ProductStatus,
    pub handle: String,
    pub body_html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_suffix: Option<String>,
    pub variants: Vec<NewVariant>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<NewImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewVariant {
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_at_price: Option<String>,
    pub requires_shipping: bool,
    /// Always sent, `null` disables inventory tracking.
    pub inventory_management: Option<String>,
}

impl NewVariant {
    pub fn untracked(price: &str, compare_at_price: &str) -> Self {
        Self {
            price: price.to_string(),
            compare_at_price: Some(compare_at_price.to_string()),
            requires_shipping: true,
            inventory_management: None,
        }
    }
}

/// Either bytes uploaded inline or a URL the shop fetches itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum ImageSource {
    #[serde(rename = "attachment")]
    Attachment(String),
    #[serde(rename = "src")]
    Remote(String),
}

impl ImageSource {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        ImageSource::Attachment(BASE64.encode(bytes))
    }

    /// For payloads that already arrive base64 encoded.
    pub fn from_base64(encoded: impl Into<String>) -> Self {
        ImageSource::Attachment(encoded.into())
    }

    pub fn remote(url: impl Into<String>) -> Self {
        ImageSource::Remote(url.into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewImage {
    #[serde(flatten)]
    pub source: ImageSource,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalProduct {
    pub id: ExternalId,
    pub handle: String,
    #[serde(default)]
    pub variants: Vec<ExternalVariant>,
}

impl ExternalProduct {
    pub fn first_variant_id(&self) -> Option<u64> {
        self.variants.first().map(|variant| variant.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalVariant {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRef {
    pub id: u64,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub src: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProductEnvelope<'a> {
    pub product: &'a NewProduct,
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageEnvelope<'a> {
    pub image: &'a NewImage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProductResponse {
    pub product: ExternalProduct,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageResponse {
    pub image: ImageRef,
}
