mod catalog;
mod config;
mod http;
mod jobs;
mod metrics;
mod mockup;
mod models;
mod provision;
mod shopify;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{FromRequest, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{CatalogClient, CatalogError, SearchKind};
use clap::{Parser, Subcommand};
use config::AppConfig;
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use mockup::{MockupFetcher, Transcoder};
use models::{
    ApiError, BundleRequest, BundleResponse, KeepRequest, KeepResponse, KeychainRequest,
    KeychainResponse, ProductRecordView, ProductRequest, ProductType,
};
use provision::{ProvisionError, ProvisionErrorKind, Provisioner};
use serde::Deserialize;
use serde_json::json;
use shopify::{ShopifyGateway, StoreGateway};
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, RecordStore, RedisStore};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "musictags-bridge", version, about = "Storefront product provisioning bridge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and, unless disabled, the background jobs.
    Serve,
    /// Delete one batch of expired products and exit.
    Sweep {
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Extend records referenced by unfulfilled orders and exit.
    ExtendOrders,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli.command.unwrap_or(Command::Serve)).await {
        error!(target = "bridge.api", "fatal: {err:?}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> eyre::Result<()> {
    let config = AppConfig::from_env().wrap_err("loading configuration")?;
    let store = connect_store(&config).await?;
    let gateway: Arc<dyn StoreGateway> = Arc::new(ShopifyGateway::new(&config.shop, config.http));

    match command {
        Command::Serve => serve(config, store, gateway).await,
        Command::Sweep { batch } => {
            let batch = batch.unwrap_or(config.jobs.sweep_batch);
            match jobs::sweep_now(store, gateway, batch).await? {
                Some(report) => info!(target = "bridge.jobs", ?report, "sweep_command_done"),
                None => warn!(target = "bridge.jobs", "sweep_command_skipped_lock_held"),
            }
            Ok(())
        }
        Command::ExtendOrders => {
            match jobs::extend_now(store, gateway, config.jobs.order_window_days).await? {
                Some(report) => info!(target = "bridge.jobs", ?report, "extend_command_done"),
                None => warn!(target = "bridge.jobs", "extend_command_skipped_lock_held"),
            }
            Ok(())
        }
    }
}

async fn connect_store(config: &AppConfig) -> eyre::Result<Arc<dyn RecordStore>> {
    match &config.store.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, &config.store.key_prefix)
                .await
                .wrap_err("connecting to redis")?;
            info!(target = "bridge.store", prefix = %config.store.key_prefix, "redis_store_ready");
            Ok(Arc::new(store))
        }
        None => {
            warn!(
                target = "bridge.store",
                "REDIS_URL not set, records live in process memory only"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn serve(
    config: AppConfig,
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
) -> eyre::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let transcoder = Transcoder::detect(config.mockup.webp_enabled, config.mockup.webp_quality);
    let provisioner = Provisioner::new(
        store.clone(),
        gateway.clone(),
        Arc::new(MockupFetcher::new(&config.mockup, config.http)),
        transcoder,
        &config.shop.storefront_base_url,
    );
    let state = AppState {
        provisioner: Arc::new(provisioner),
        catalog: Arc::new(CatalogClient::new(&config.catalog, config.http)),
        openapi: Arc::new(load_openapi()),
        prometheus,
        metrics_key: config.metrics_key.clone().map(Arc::from),
    };

    if config.jobs.enabled {
        jobs::Scheduler::new(store, gateway, config.jobs.clone()).spawn();
    } else {
        info!(target = "bridge.jobs", "scheduler_disabled");
    }

    let app = router(state)
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(config.body_limit));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "bridge.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target = "bridge.api", error = %err, "ctrl_c_handler_failed");
        std::future::pending::<()>().await;
    }
    info!(target = "bridge.api", "shutdown_requested");
}

#[derive(Clone)]
struct AppState {
    provisioner: Arc<Provisioner>,
    catalog: Arc<CatalogClient>,
    openapi: Arc<serde_json::Value>,
    prometheus: PrometheusHandle,
    metrics_key: Option<Arc<str>>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/products", post(create_product))
        .route("/products/albumtagz", post(create_albumtag))
        .route("/products/airvinyls", post(create_airvinyl))
        .route("/products/keep", post(keep_product))
        .route("/products/airvinylbundle", post(create_bundle))
        .route("/products/keychains", post(create_keychain))
        .route("/api/products/keychains", post(create_keychain))
        .route("/api/products/keychains/couple", post(create_couple_keychain))
        .route("/api/search", get(search))
        .with_state(state)
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Configured origins, `*.example.com` entries matching any subdomain.
/// No configuration allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed = origins.to_vec();
    layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _parts: &Parts| {
            origin
                .to_str()
                .map(|origin| origin_allowed(origin, &allowed))
                .unwrap_or(false)
        },
    ))
}

fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    let host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .split(':')
        .next()
        .unwrap_or_default();
    allowed.iter().any(|entry| match entry.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
        None => entry.trim_end_matches('/') == origin,
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "musictags-bridge",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Musictags Bridge API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = state.metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

/// Albumtag or airvinyl depending on `productType` (default albumtag).
async fn create_product(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ProductRequest>,
) -> Result<Json<ProductRecordView>, AppError> {
    crate::metrics::inc_requests("/products");
    let product_type = payload.product_type.unwrap_or_default();
    submit(&state, &payload, product_type).await
}

async fn create_albumtag(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ProductRequest>,
) -> Result<Json<ProductRecordView>, AppError> {
    crate::metrics::inc_requests("/products/albumtagz");
    submit(&state, &payload, ProductType::Albumtag).await
}

async fn create_airvinyl(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ProductRequest>,
) -> Result<Json<ProductRecordView>, AppError> {
    crate::metrics::inc_requests("/products/airvinyls");
    submit(&state, &payload, ProductType::Airvinyl).await
}

async fn submit(
    state: &AppState,
    payload: &ProductRequest,
    product_type: ProductType,
) -> Result<Json<ProductRecordView>, AppError> {
    let record = state.provisioner.submit(payload, product_type).await?;
    Ok(Json(ProductRecordView::from(&record)))
}

async fn keep_product(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<KeepRequest>,
) -> Result<Json<KeepResponse>, AppError> {
    crate::metrics::inc_requests("/products/keep");
    let kept = state.provisioner.keep(&payload).await?;
    Ok(Json(KeepResponse {
        success: true,
        message: "Album kept longer!".into(),
        kept: kept.len(),
    }))
}

async fn create_keychain(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<KeychainRequest>,
) -> Result<Json<KeychainResponse>, AppError> {
    crate::metrics::inc_requests("/api/products/keychains");
    keychain(&state, &payload, ProductType::Keychain).await
}

async fn create_couple_keychain(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<KeychainRequest>,
) -> Result<Json<KeychainResponse>, AppError> {
    crate::metrics::inc_requests("/api/products/keychains/couple");
    keychain(&state, &payload, ProductType::CoupleKeychain).await
}

async fn keychain(
    state: &AppState,
    payload: &KeychainRequest,
    product_type: ProductType,
) -> Result<Json<KeychainResponse>, AppError> {
    let record = state
        .provisioner
        .submit_keychain(payload, product_type)
        .await?;
    Ok(Json(KeychainResponse {
        success: true,
        product_id: record.external_product_id,
        product_url: record.storefront_url.clone(),
        local_record: ProductRecordView::from(&record),
    }))
}

async fn create_bundle(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<BundleRequest>,
) -> Result<Json<BundleResponse>, AppError> {
    crate::metrics::inc_requests("/products/airvinylbundle");
    let shopify_url = state.provisioner.create_bundle(&payload).await?;
    Ok(Json(BundleResponse {
        success: true,
        shopify_url,
    }))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/search");
    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or(AppError::MissingQuery)?;
    let results = state
        .catalog
        .search(query, SearchKind::parse(params.kind.as_deref()))
        .await?;
    Ok(Json(results))
}

/// `Json` extractor whose rejections use the same `ApiError` body as every
/// other failure.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

#[derive(Debug)]
enum AppError {
    Provision(ProvisionError),
    Catalog(CatalogError),
    Body(JsonRejection),
    MissingQuery,
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::Body(value)
    }
}

impl From<ProvisionError> for AppError {
    fn from(value: ProvisionError) -> Self {
        Self::Provision(value)
    }
}

impl From<CatalogError> for AppError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

fn status_for(kind: ProvisionErrorKind) -> StatusCode {
    match kind {
        ProvisionErrorKind::InvalidInput | ProvisionErrorKind::AssetFetchFailed => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ProvisionErrorKind::NotFound => StatusCode::NOT_FOUND,
        ProvisionErrorKind::RemoteTransient => StatusCode::SERVICE_UNAVAILABLE,
        ProvisionErrorKind::RemoteFatal => StatusCode::BAD_GATEWAY,
        ProvisionErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Provision(err) => {
                let status = status_for(err.kind());
                if status.is_server_error() {
                    error!(
                        target = "bridge.api",
                        step = err.step(),
                        kind = err.kind().as_str(),
                        detail = err.detail(),
                        "request_failed"
                    );
                }
                (
                    status,
                    ApiError::new(err.kind().as_str(), Some(err.detail().to_string())),
                )
            }
            AppError::Catalog(err) => {
                warn!(target = "bridge.api", error = %err, "catalog_search_failed");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError::new("catalog_search_failed", Some(err.to_string())),
                )
            }
            AppError::Body(rejection) => {
                let detail = rejection.body_text();
                warn!(target = "bridge.api", detail = %detail, "request_body_rejected");
                (
                    rejection.status(),
                    ApiError::new(ProvisionErrorKind::InvalidInput.as_str(), Some(detail)),
                )
            }
            AppError::MissingQuery => (
                StatusCode::BAD_REQUEST,
                ApiError::new("Query parameter is required", None),
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
