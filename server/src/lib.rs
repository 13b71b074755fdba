use anyhow::{Context, Result};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use search_core::analytics::{AnalyticsRecorder, ClientMeta};
use search_core::catalog::MemoryCatalog;
use search_core::config::SearchConfig;
use search_core::error::{AnalyticsError, IndexError, SearchError, SyncError};
use search_core::filter::{AppliedFilters, SortMode};
use search_core::planner::{QueryPlanner, SearchRequest};
use search_core::store::{Index, IndexStore};
use search_core::sync::{CatalogChange, SyncEngine, SyncHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub planner: Arc<QueryPlanner>,
    pub index: Arc<IndexStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub analytics: Option<Arc<AnalyticsRecorder>>,
    pub sync_engine: Arc<SyncEngine>,
    pub sync: SyncHandle,
    pub config: Arc<SearchConfig>,
    pub admin_token: Option<String>,
}

impl AppState {
    /// Wire the core together and start the sync dispatcher. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: SearchConfig,
        index: Arc<IndexStore>,
        catalog: Arc<MemoryCatalog>,
        analytics: Option<Arc<AnalyticsRecorder>>,
        admin_token: Option<String>,
    ) -> Self {
        let sync_engine = Arc::new(SyncEngine::new(index.clone(), catalog.clone(), config.sync.clone()));
        let (sync, _dispatcher) = sync_engine.clone().spawn();
        let planner = Arc::new(QueryPlanner::new(index.clone(), catalog.clone(), analytics.clone(), config.clone()));
        Self { planner, index, catalog, analytics, sync_engine, sync, config: Arc::new(config), admin_token }
    }
}

/// Open the index and query log under the configured paths and reconcile
/// the index against the catalog.
pub async fn bootstrap(config: SearchConfig, catalog: MemoryCatalog, admin_token: Option<String>) -> Result<AppState> {
    let index = IndexStore::open(&config.index, config.ranking.clone(), config.highlight.clone())
        .with_context(|| format!("open search index at {}", config.index.path.display()))?;
    let analytics_path = config.analytics_path();
    let analytics = match AnalyticsRecorder::open(&analytics_path, config.analytics.clone(), config.query.max_length) {
        Ok(a) => Some(Arc::new(a)),
        Err(e) => {
            warn!(error = %e, path = %analytics_path.display(), "query analytics disabled");
            None
        }
    };
    let state = AppState::new(config, Arc::new(index), Arc::new(catalog), analytics, admin_token);
    let report = state.sync_engine.reconcile().await.context("startup reconciliation")?;
    info!(rebuilt = report.rebuilt, scanned = report.scanned, indexed = report.indexed, "index ready");
    Ok(state)
}

/// Prune the query log once per `every`.
pub fn spawn_retention_task(analytics: Arc<AnalyticsRecorder>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let recorder = analytics.clone();
            let retention = recorder.config().retention();
            match tokio::task::spawn_blocking(move || recorder.prune(retention)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "query log pruning failed"),
                Err(e) => warn!(error = %e, "query log pruning task failed"),
            }
        }
    })
}

pub fn build_app(state: AppState) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/search", get(quick_search_handler))
        .route("/search/products", get(product_search_handler))
        .route("/search/autocomplete", get(autocomplete_handler))
        .route("/search/trending", get(trending_handler))
        .route("/search/analytics/popular", get(popular_handler))
        .route("/search/analytics/zero-results", get(zero_results_handler))
        .route("/search/click", post(click_handler))
        .route("/catalog/events", post(catalog_event_handler))
        .route("/index/rebuild", post(rebuild_handler))
        .route("/index/optimize", post(optimize_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// --- Errors ---

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: ErrorDetail { code: self.code, message: self.message } };
        (self.status, Json(body)).into_response()
    }
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Validation(m) => ApiError::bad_request(m),
            SearchError::Timeout(_) => ApiError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", e.to_string()),
            SearchError::Index(_) | SearchError::Catalog(_) => ApiError::unavailable(e.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Fault { .. } => ApiError::internal(e.to_string()),
            SyncError::Catalog(_) | SyncError::QueueClosed => ApiError::unavailable(e.to_string()),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(e: IndexError) -> Self {
        if e.is_retryable() {
            ApiError::unavailable(e.to_string())
        } else {
            ApiError::internal(e.to_string())
        }
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(e: AnalyticsError) -> Self {
        ApiError::unavailable(e.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::bad_request(e.body_text())
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid admin token"))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let ip_address = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header(headers, "x-real-ip"))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    ClientMeta { ip_address, user_agent: header(headers, "user-agent").map(str::to_string) }
}

fn analytics(state: &AppState) -> Result<Arc<AnalyticsRecorder>, ApiError> {
    state.analytics.clone().ok_or_else(|| ApiError::unavailable("query analytics disabled"))
}

// --- Search ---

fn default_limit() -> usize {
    10
}

fn default_report_limit() -> usize {
    20
}

#[derive(Deserialize)]
pub struct QuickSearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Deserialize)]
pub struct ProductSearchParams {
    pub q: Option<String>,
    pub category: Option<String>,
    pub vendor: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub rating: Option<f64>,
    pub in_stock: Option<bool>,
    pub on_sale: Option<bool>,
    pub sort: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl From<ProductSearchParams> for SearchRequest {
    fn from(p: ProductSearchParams) -> Self {
        SearchRequest {
            q: p.q,
            filters: AppliedFilters {
                category: p.category,
                vendor: p.vendor,
                min_price: p.min_price,
                max_price: p.max_price,
                min_rating: p.rating,
                in_stock: p.in_stock.unwrap_or(false),
                on_sale: p.on_sale.unwrap_or(false),
            },
            sort: SortMode::parse(p.sort.as_deref()),
            page: p.page,
            page_size: p.page_size,
            offset: p.offset,
            limit: p.limit,
        }
    }
}

#[derive(Deserialize)]
pub struct LimitParams {
    #[serde(default = "default_report_limit")]
    pub limit: usize,
}

async fn health_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.index.stats()?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "engine": state.planner.active_engine(),
        "index": stats,
    })))
}

async fn quick_search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<QuickSearchParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let response = state.planner.quick_search(&params.q, params.limit, client_meta(&headers)).await?;
    Ok(Json(response))
}

async fn product_search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ProductSearchParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let response = state.planner.search_products(params.into(), client_meta(&headers)).await?;
    Ok(Json(response))
}

async fn autocomplete_handler(
    State(state): State<AppState>,
    params: Result<Query<QuickSearchParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.planner.autocomplete(&params.q, params.limit).await?))
}

async fn trending_handler(
    State(state): State<AppState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.planner.trending(params.limit).await?))
}

async fn popular_handler(
    State(state): State<AppState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(params) = params?;
    let recorder = analytics(&state)?;
    let window = recorder.config().popular_window();
    let popular = recorder.popular(window, params.limit)?;
    Ok(Json(serde_json::json!({ "popular_searches": popular })))
}

async fn zero_results_handler(
    State(state): State<AppState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(params) = params?;
    let recorder = analytics(&state)?;
    let window = recorder.config().zero_results_window();
    let zero = recorder.zero_results(window, params.limit)?;
    Ok(Json(serde_json::json!({ "zero_result_queries": zero })))
}

#[derive(Deserialize)]
pub struct ClickParams {
    pub query_id: u64,
}

async fn click_handler(
    State(state): State<AppState>,
    params: Result<Query<ClickParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(params) = params?;
    let clicked = analytics(&state)?.mark_clicked(params.query_id)?;
    Ok(Json(serde_json::json!({ "query_id": params.query_id, "clicked": clicked })))
}

// --- Admin endpoints ---

async fn catalog_event_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(change): Json<CatalogChange>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    state.catalog.apply(&change);
    let outcome = state.sync.notify_catalog_change(change).await?;
    Ok(Json(serde_json::json!({ "ok": true, "result": outcome })))
}

#[derive(Deserialize)]
pub struct RebuildParams {
    #[serde(default)]
    pub from_catalog: bool,
}

async fn rebuild_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<RebuildParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let Query(params) = params?;
    let documents = if params.from_catalog {
        state.sync_engine.rebuild_from_catalog().await?.indexed
    } else {
        let index = state.index.clone();
        tokio::task::spawn_blocking(move || index.rebuild())
            .await
            .map_err(|e| ApiError::internal(e.to_string()))??
    };
    Ok(Json(serde_json::json!({ "ok": true, "documents": documents })))
}

async fn optimize_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let index = state.index.clone();
    let stats = tokio::task::spawn_blocking(move || {
        index.optimize()?;
        index.stats()
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(serde_json::json!({ "ok": true, "index": stats })))
}
