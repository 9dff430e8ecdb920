//! Fetch handling through an active worker.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{get, page, url, Harness};
use http::{Method, StatusCode};
use pwakit_net::Request;
use pwakit_sw::{CacheKey, ResponseSource};

const STATIC: &str = "idea-static-v1";
const DYNAMIC: &str = "idea-dynamic-v1";

async fn active() -> Harness {
    let harness = Harness::new();
    harness.deploy("v1").await;
    harness.fetcher.reset_calls();
    harness
}

#[tokio::test(start_paused = true)]
async fn test_warm_static_is_served_without_waiting_on_network() {
    let harness = active().await;
    harness.fetcher.set_delay(Some(Duration::from_secs(3600)));

    let start = tokio::time::Instant::now();
    let served = harness.container.fetch(get("/index.html")).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text().unwrap(), "<h1>home</h1>");

    // The background refresh still goes out.
    harness.container.settle().await;
    assert_eq!(harness.fetcher.calls_to("/index.html"), 1);
}

#[tokio::test]
async fn test_static_refresh_overwrites_cache() {
    let harness = active().await;
    harness.fetcher.serve("/index.html", "text/html", "<h1>v1.1</h1>");

    let served = harness.container.fetch(get("/index.html")).await.unwrap();
    assert_eq!(served.response.text().unwrap(), "<h1>home</h1>");
    harness.container.settle().await;

    let entry = harness
        .caches
        .match_in(STATIC, &CacheKey::get(&url("/index.html")))
        .await
        .unwrap();
    assert_eq!(&entry.body[..], b"<h1>v1.1</h1>");
}

#[tokio::test]
async fn test_dynamic_page_prefers_network_and_updates_cache() {
    let harness = active().await;
    harness
        .fetcher
        .serve("/dashboard.html", "text/html", "<h1>dashboard</h1>");

    let served = harness.container.fetch(page("/dashboard.html")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.text().unwrap(), "<h1>dashboard</h1>");

    let entry = harness
        .caches
        .match_in(DYNAMIC, &CacheKey::get(&url("/dashboard.html")))
        .await
        .unwrap();
    assert_eq!(&entry.body[..], b"<h1>dashboard</h1>");
}

#[tokio::test]
async fn test_dynamic_page_falls_back_to_cached_copy() {
    let harness = active().await;
    harness
        .fetcher
        .serve("/portfolio.html", "text/html", "<h1>portfolio</h1>");
    harness.container.fetch(page("/portfolio.html")).await.unwrap();

    harness.fetcher.set_offline(true);
    let served = harness.container.fetch(page("/portfolio.html")).await.unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text().unwrap(), "<h1>portfolio</h1>");
}

#[tokio::test]
async fn test_asset_miss_comes_from_network_then_is_cached() {
    let harness = active().await;
    harness
        .fetcher
        .serve("/assets/css/print.css", "text/css", "@media print{}");
    let key = CacheKey::get(&url("/assets/css/print.css"));
    assert!(harness.caches.match_request(&key).await.is_none());

    let served = harness
        .container
        .fetch(get("/assets/css/print.css"))
        .await
        .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.text().unwrap(), "@media print{}");

    assert!(harness.caches.match_in(DYNAMIC, &key).await.is_some());
    assert!(harness.caches.match_in(STATIC, &key).await.is_none());
}

#[tokio::test]
async fn test_asset_hit_is_stale_then_revalidated() {
    let harness = active().await;
    harness.fetcher.serve("/assets/js/app.js", "text/javascript", "v1");
    harness.container.fetch(get("/assets/js/app.js")).await.unwrap();

    harness.fetcher.serve("/assets/js/app.js", "text/javascript", "v2");
    let served = harness.container.fetch(get("/assets/js/app.js")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text().unwrap(), "v1");

    harness.container.settle().await;
    let served = harness.container.fetch(get("/assets/js/app.js")).await.unwrap();
    assert_eq!(served.response.text().unwrap(), "v2");
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
    let harness = active().await;
    harness.fetcher.respond(
        "/dashboard/broken",
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/html",
        "boom",
    );

    let served = harness.container.fetch(page("/dashboard/broken")).await.unwrap();
    assert_eq!(served.response.status, StatusCode::INTERNAL_SERVER_ERROR);

    let served = harness.container.fetch(get("/assets/missing.png")).await.unwrap();
    assert_eq!(served.response.status, StatusCode::NOT_FOUND);

    assert!(harness
        .caches
        .match_request(&CacheKey::get(&url("/dashboard/broken")))
        .await
        .is_none());
    assert!(harness
        .caches
        .match_request(&CacheKey::get(&url("/assets/missing.png")))
        .await
        .is_none());
}

#[tokio::test]
async fn test_cross_origin_bypasses_worker() {
    let harness = active().await;
    harness.fetcher.set_offline(true);

    let request = Request::parse("https://cdn.example.net/lib.js").unwrap();
    let err = harness.container.fetch(request).await.unwrap_err();
    assert!(matches!(err, pwakit_net::NetError::Offline(_)));
}

#[tokio::test]
async fn test_post_is_network_only() {
    let harness = active().await;
    harness.fetcher.serve("/api/contact", "application/json", "{\"ok\":true}");

    let request = Request::post(url("/api/contact"), Bytes::from_static(b"{\"name\":\"a\"}"));
    let served = harness.container.fetch(request).await.unwrap();

    assert_eq!(served.source, ResponseSource::Network);
    let mut key = CacheKey::get(&url("/api/contact"));
    key.method = Method::POST.to_string();
    assert!(harness.caches.match_request(&key).await.is_none());
    assert!(harness
        .caches
        .match_request(&CacheKey::get(&url("/api/contact")))
        .await
        .is_none());
}

#[tokio::test]
async fn test_offline_dashboard_gets_offline_page() {
    let harness = active().await;
    harness.fetcher.set_offline(true);

    let served = harness.container.fetch(page("/dashboard.html")).await.unwrap();

    assert_eq!(served.source, ResponseSource::OfflinePage);
    assert_eq!(served.response.status, StatusCode::OK);
    assert_eq!(served.response.text().unwrap(), "<h1>offline</h1>");
}

#[tokio::test]
async fn test_offline_api_gets_json_503() {
    let harness = active().await;
    harness.fetcher.set_offline(true);

    let request = get("/api/data.json").accept("application/json");
    let served = harness.container.fetch(request).await.unwrap();

    assert_eq!(served.source, ResponseSource::Synthesized);
    assert_eq!(served.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        served.response.header("content-type"),
        Some("application/json; charset=utf-8")
    );
    let body: serde_json::Value = served.response.json().unwrap();
    assert!(body["error"].is_string());
    assert!(body["message"].is_string());
    assert!(harness
        .caches
        .match_request(&CacheKey::get(&url("/api/data.json")))
        .await
        .is_none());
}

#[tokio::test]
async fn test_no_active_worker_goes_to_network() {
    let harness = Harness::new();

    let served = harness.container.fetch(get("/index.html")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(harness.caches.keys().await.is_empty());
}
