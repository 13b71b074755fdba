use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use search_core::analytics::AnalyticsRecorder;
use search_core::catalog::MemoryCatalog;
use search_core::config::SearchConfig;
use search_core::models::{Category, Product, Vendor};
use search_core::store::IndexStore;
use search_server::{build_app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "secret";

fn product(id: &str, name: &str, extra: Value) -> Product {
    let mut row = json!({
        "id": id,
        "vendor_id": "v1",
        "category_id": "audio",
        "name": name,
        "price": 10.0,
        "quantity": 5
    });
    if let (Some(row), Some(extra)) = (row.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            row.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(row).unwrap()
}

async fn setup() -> (Router, AppState) {
    let config = SearchConfig::default();
    let catalog = MemoryCatalog::new();
    catalog.upsert_category(Category {
        id: "audio".into(),
        name: "TV & Audio".into(),
        slug: "tv-audio".into(),
        parent_id: None,
        is_active: true,
    });
    catalog.upsert_vendor(Vendor { id: "v1".into(), name: "Sonic Labs".into(), slug: "sonic".into(), is_active: true });
    catalog.upsert_product(product(
        "A",
        "Wireless Bluetooth Headphones",
        json!({"description": "noise cancelling", "tags": ["audio"], "rating": 4.0, "sales_count": 10}),
    ));
    catalog.upsert_product(product("B", "Studio Headphones", json!({"rating": 4.8, "sales_count": 3})));

    let index = IndexStore::temporary(&config.index, config.ranking.clone(), config.highlight.clone()).unwrap();
    let analytics = AnalyticsRecorder::temporary(config.analytics.clone(), config.query.max_length).unwrap();
    let state = AppState::new(
        config,
        Arc::new(index),
        Arc::new(catalog),
        Some(Arc::new(analytics)),
        Some(TOKEN.to_string()),
    );
    state.sync_engine.reconcile().await.unwrap();
    (build_app(state.clone()), state)
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    call(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_event(app: &Router, event: Value) -> (StatusCode, Value) {
    let req = Request::post("/catalog/events")
        .header("content-type", "application/json")
        .header("X-ADMIN-TOKEN", TOKEN)
        .body(Body::from(event.to_string()))
        .unwrap();
    call(app, req).await
}

fn ids(body: &Value) -> Vec<String> {
    body["products"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn health_reports_index_stats() {
    let (app, _) = setup().await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["engine"], "primary");
    assert_eq!(body["index"]["documents"], 2);
}

#[tokio::test]
async fn product_search_highlights_matches() {
    let (app, _) = setup().await;
    let (status, body) = get(&app, "/search/products?q=bluetooth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body), vec!["A"]);
    assert_eq!(body["total"], 1);
    assert_eq!(body["total_pages"], 1);
    assert_eq!(body["engine"], "primary");
    let highlight = body["products"][0]["name_highlight"].as_str().unwrap();
    assert!(highlight.contains("<mark>Bluetooth</mark>"));
    assert!(body["query_id"].is_u64());
}

#[tokio::test]
async fn catalog_events_flow_into_search() {
    let (app, state) = setup().await;
    let updated = product("A", "Wired USB Headphones", json!({}));
    let (status, body) = post_event(&app, json!({"kind": "updated", "snapshot": updated})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "indexed");

    let (_, body) = get(&app, "/search/products?q=bluetooth").await;
    assert!(ids(&body).is_empty());
    let (_, body) = get(&app, "/search/products?q=usb").await;
    assert_eq!(ids(&body), vec!["A"]);

    let (status, _) = post_event(&app, json!({"kind": "deleted", "product_id": "A"})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&app, "/search/products?q=headphones").await;
    assert_eq!(ids(&body), vec!["B"]);
    assert_eq!(search_core::Index::stats(state.index.as_ref()).unwrap().documents, 1);
}

#[tokio::test]
async fn admin_routes_require_token() {
    let (app, _) = setup().await;
    let req = Request::post("/index/optimize").body(Body::empty()).unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let req = Request::post("/index/rebuild").header("X-ADMIN-TOKEN", TOKEN).body(Body::empty()).unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documents"], 2);
}

#[tokio::test]
async fn invalid_filters_are_bad_requests() {
    let (app, _) = setup().await;
    let (status, body) = get(&app, "/search/products?q=headphones&min_price=-5").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = get(&app, "/search/products?q=headphones&page=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_category_slug_is_empty_not_an_error() {
    let (app, _) = setup().await;
    let (status, body) = get(&app, "/search/products?q=headphones&category=nope").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn autocomplete_suggests_and_corrects() {
    let (app, _) = setup().await;
    let (_, body) = get(&app, "/search/autocomplete?q=head").await;
    let suggestions: Vec<&str> = body["suggestions"].as_array().unwrap().iter().map(|s| s.as_str().unwrap()).collect();
    assert_eq!(suggestions, vec!["Wireless Bluetooth Headphones", "Studio Headphones"]);
    assert!(body.get("did_you_mean").is_none());

    let (_, body) = get(&app, "/search/autocomplete?q=headphonez").await;
    assert!(body["suggestions"].as_array().unwrap().is_empty());
    assert_eq!(body["did_you_mean"], "headphones");
}

#[tokio::test]
async fn fallback_keeps_the_envelope() {
    let (app, state) = setup().await;
    let (_, primary) = get(&app, "/search/products?q=headphones").await;
    state.index.set_available(false);
    let (status, fallback) = get(&app, "/search/products?q=headphones").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fallback["engine"], "fallback");
    // rating desc: B (4.8) before A (4.0)
    assert_eq!(ids(&fallback), vec!["B", "A"]);

    let keys = |v: &Value| {
        let mut k: Vec<String> = v.as_object().unwrap().keys().cloned().collect();
        k.sort();
        k
    };
    assert_eq!(keys(&primary), keys(&fallback));
    assert_eq!(keys(&primary["products"][0]), keys(&fallback["products"][0]));

    let (_, health) = get(&app, "/health").await;
    assert_eq!(health["engine"], "fallback");
}

#[tokio::test]
async fn quick_search_and_trending_shapes() {
    let (app, _) = setup().await;
    let (status, body) = get(&app, "/search?q=audio&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "audio");
    assert_eq!(body["categories"][0]["slug"], "tv-audio");
    assert!(body["vendors"].as_array().unwrap().is_empty());
    assert_eq!(body["total_results"], 3);

    let (status, body) = get(&app, "/search/trending?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trending"][0]["id"], "A");
    assert_eq!(body["popular_categories"][0]["product_count"], 2);
    assert!(body["popular_searches"].is_array());
}

#[tokio::test]
async fn searches_feed_analytics_and_clicks() {
    let (app, state) = setup().await;
    let (_, body) = get(&app, "/search/products?q=headphones").await;
    let query_id = body["query_id"].as_u64().unwrap();
    get(&app, "/search/products?q=laptp").await;

    let recorder = state.analytics.clone().unwrap();
    for _ in 0..50 {
        if recorder.len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let req = Request::post(format!("/search/click?query_id={query_id}")).body(Body::empty()).unwrap();
    let (_, click) = call(&app, req).await;
    assert_eq!(click["clicked"], true);

    let (_, popular) = get(&app, "/search/analytics/popular").await;
    assert_eq!(popular["popular_searches"][0]["query"], "headphones");
    assert_eq!(popular["popular_searches"][0]["click_rate"], 1.0);

    let (_, zero) = get(&app, "/search/analytics/zero-results").await;
    assert_eq!(zero["zero_result_queries"][0]["query"], "laptp");
}
