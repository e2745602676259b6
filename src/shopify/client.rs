use super::orders::{OrdersResponse, next_page_url};
use super::products::{ImageEnvelope, ImageResponse, ProductEnvelope, ProductResponse};
use super::{
    ExternalProduct, GatewayError, ImageRef, NewImage, NewProduct, Order, OrderFilter,
    StoreGateway,
};
use crate::config::{HttpTimeouts, ShopConfig};
use crate::http::build_client;
use crate::store::ExternalId;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, header::LINK};
use tracing::{debug, info, warn};

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const MAX_ORDER_PAGES: usize = 40;

/// Admin REST client for one shop.
#[derive(Clone)]
pub struct ShopifyGateway {
    http: Client,
    admin_url: String,
    access_token: String,
}

impl ShopifyGateway {
    pub fn new(shop: &ShopConfig, timeouts: HttpTimeouts) -> Self {
        Self {
            http: build_client(timeouts),
            admin_url: shop.admin_url.trim_end_matches('/').to_string(),
            access_token: shop.access_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.admin_url, path.trim_start_matches('/'))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(ACCESS_TOKEN_HEADER, &self.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_status(status, &body))
    }
}

#[async_trait]
impl StoreGateway for ShopifyGateway {
    async fn create_product(&self, product: &NewProduct) -> Result<ExternalProduct, GatewayError> {
        let request = self
            .http
            .post(self.url("products.json"))
            .json(&ProductEnvelope { product });
        let response = self.send(request).await?;
        let payload: ProductResponse = response
            .json()
            .await
            .map_err(GatewayError::from_transport)?;
        info!(
            target = "bridge.shopify",
            product_id = payload.product.id,
            handle = %payload.product.handle,
            "product_created"
        );
        Ok(payload.product)
    }

    async fn attach_image(
        &self,
        product_id: ExternalId,
        image: &NewImage,
    ) -> Result<ImageRef, GatewayError> {
        let request = self
            .http
            .post(self.url(&format!("products/{product_id}/images.json")))
            .json(&ImageEnvelope { image });
        let response = self.send(request).await?;
        let payload: ImageResponse = response
            .json()
            .await
            .map_err(GatewayError::from_transport)?;
        debug!(
            target = "bridge.shopify",
            product_id,
            image_id = payload.image.id,
            position = ?payload.image.position,
            "image_attached"
        );
        Ok(payload.image)
    }

    async fn delete_product(&self, product_id: ExternalId) -> Result<(), GatewayError> {
        let request = self
            .http
            .delete(self.url(&format!("products/{product_id}.json")));
        self.send(request).await?;
        info!(target = "bridge.shopify", product_id, "product_deleted");
        Ok(())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, GatewayError> {
        let mut orders = Vec::new();
        let mut request = self
            .http
            .get(self.url("orders.json"))
            .query(&filter.query());

        for page in 1..=MAX_ORDER_PAGES {
            let response = self.send(request).await?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_url);
            let payload: OrdersResponse = response
                .json()
                .await
                .map_err(GatewayError::from_transport)?;
            debug!(
                target = "bridge.shopify",
                page,
                count = payload.orders.len(),
                "orders_page"
            );
            orders.extend(payload.orders);

            match next {
                // page_info cursors carry the original filter.
                Some(url) => request = self.http.get(url),
                None => return Ok(orders),
            }
        }

        warn!(
            target = "bridge.shopify",
            pages = MAX_ORDER_PAGES,
            count = orders.len(),
            "orders_page_limit_reached"
        );
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopify::{ImageSource, NewVariant, products::ProductStatus};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> ShopifyGateway {
        let shop = ShopConfig {
            admin_url: format!("{}/admin/api/2024-10", server.uri()),
            access_token: "shpat_test".into(),
            storefront_base_url: "https://shop.test".into(),
        };
        ShopifyGateway::new(&shop, HttpTimeouts::default())
    }

    fn product() -> NewProduct {
        NewProduct {
            title: "Echoes Albumtag".into(),
            vendor: "Band X".into(),
            product_type: "Music".into(),
            status: ProductStatus::Active,
            handle: "echoes-band-x".into(),
            body_html: "<p>Artist: Band X</p>".into(),
            published_scope: None,
            tags: None,
            template_suffix: None,
            variants: vec![NewVariant::untracked("14.95", "19.95")],
            images: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_product_posts_envelope_and_reads_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-10/products.json"))
            .and(header(ACCESS_TOKEN_HEADER, "shpat_test"))
            .and(body_partial_json(json!({
                "product": {"handle": "echoes-band-x", "status": "active"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "product": {"id": 901, "handle": "echoes-band-x", "variants": [{"id": 77}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = gateway(&server).create_product(&product()).await.unwrap();
        assert_eq!(created.id, 901);
        assert_eq!(created.first_variant_id(), Some(77));
    }

    #[tokio::test]
    async fn attach_image_targets_product_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-10/products/901/images.json"))
            .and(body_partial_json(json!({"image": {"position": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "image": {"id": 5, "position": 1, "src": "https://cdn.test/5.webp"}
            })))
            .mount(&server)
            .await;

        let image = NewImage {
            source: ImageSource::from_bytes(b"webp-bytes"),
            filename: "mockup_echoes-band-x.webp".into(),
            position: Some(1),
        };
        let attached = gateway(&server).attach_image(901, &image).await.unwrap();
        assert_eq!(attached.id, 5);
        assert_eq!(attached.position, Some(1));
    }

    #[tokio::test]
    async fn status_codes_map_to_gateway_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/admin/api/2024-10/products/1.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/admin/api/2024-10/products/2.json"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/admin/api/2024-10/products/3.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-10/products.json"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"errors": {"handle": ["taken"]}})),
            )
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        assert!(matches!(
            gateway.delete_product(1).await,
            Err(GatewayError::NotFound)
        ));
        assert!(matches!(
            gateway.delete_product(2).await,
            Err(GatewayError::Transient(_))
        ));
        assert!(gateway.delete_product(3).await.is_ok());
        assert!(matches!(
            gateway.create_product(&product()).await,
            Err(GatewayError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn list_orders_follows_link_pagination() {
        let server = MockServer::start().await;
        let next = format!(
            "<{}/admin/api/2024-10/orders.json?page_info=def&limit=250>; rel=\"next\"",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/admin/api/2024-10/orders.json"))
            .and(query_param("fulfillment_status", "unfulfilled"))
            .and(query_param("status", "any"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", next.as_str())
                    .set_body_json(json!({
                        "orders": [{"id": 1, "line_items": [{"product_id": 901}]}]
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/api/2024-10/orders.json"))
            .and(query_param("page_info", "def"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orders": [{"id": 2, "line_items": [{"product_id": 902}, {"product_id": null}]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let filter = OrderFilter::unfulfilled_since(Utc::now() - chrono::Duration::days(30));
        let orders = gateway(&server).list_orders(&filter).await.unwrap();
        let ids: Vec<_> = orders.iter().flat_map(Order::product_ids).collect();
        assert_eq!(ids, vec![901, 902]);
    }
}
