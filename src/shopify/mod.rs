pub mod client;
pub mod orders;
pub mod products;

pub use client::ShopifyGateway;
pub use orders::{LineItem, Order, OrderFilter};
pub use products::{ExternalProduct, ImageRef, ImageSource, NewImage, NewProduct, NewVariant};

use crate::store::ExternalId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("remote entity not found")]
    NotFound,
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store rejected request: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {status}: {}", truncate(body, 300));
        if status == reqwest::StatusCode::NOT_FOUND {
            GatewayError::NotFound
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            GatewayError::Transient(detail)
        } else {
            GatewayError::Fatal(detail)
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            GatewayError::Fatal(err.to_string())
        } else {
            GatewayError::Transient(err.to_string())
        }
    }
}

/// The remote shop operations the lifecycle depends on.
///
/// Writes never roll back: a product created before a failed image attach
/// stays on the shop and the caller decides what to do with it.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn create_product(&self, product: &NewProduct) -> Result<ExternalProduct, GatewayError>;

    async fn attach_image(
        &self,
        product_id: ExternalId,
        image: &NewImage,
    ) -> Result<ImageRef, GatewayError>;

    /// `Err(GatewayError::NotFound)` when the product is already gone.
    async fn delete_product(&self, product_id: ExternalId) -> Result<(), GatewayError>;

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, GatewayError>;
}

fn truncate(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
