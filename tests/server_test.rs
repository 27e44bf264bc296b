//! End-to-end tests for the proxy router.

#![cfg(feature = "server")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muninn::ManualClock;
use muninn::server::{HEALTH_PATH, router};
use muninn::worker::{
    CACHE_STATUS_HEADER, CacheStorage, Interceptor, InterceptorConfig, ReqwestUpstream,
};

/// Start the proxy in front of `origin` and return its base URL.
async fn start_proxy(origin: &str, activate: bool) -> String {
    let storage = Arc::new(CacheStorage::in_memory(Arc::new(ManualClock::new(1_000))));
    let client = Arc::new(ReqwestUpstream::new(Duration::from_secs(5)).unwrap());
    let config = InterceptorConfig::for_endpoint(&format!("{origin}/graphql"))
        .skip_waiting(activate);
    let interceptor = Arc::new(Interceptor::new(config, storage, client));
    interceptor.on_install();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(interceptor, origin);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"landpads": [{"id": "LZ-4"}]}
        })))
        .expect(1)
        .mount(&upstream)
        .await;
    let proxy = start_proxy(&upstream.uri(), true).await;
    let http = reqwest::Client::new();
    let body = json!({
        "query": "query Landpads($limit: Int) { landpads(limit: $limit) { id } }",
        "variables": {"limit": 1}
    });

    let first = http
        .post(format!("{proxy}/graphql"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()[CACHE_STATUS_HEADER], "miss");

    let second = http
        .post(format!("{proxy}/graphql"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers()[CACHE_STATUS_HEADER], "hit");
    let via = second.headers()["via"].to_str().unwrap().to_string();
    assert!(via.contains("muninn"), "via header was {via}");
    let payload: Value = second.json().await.unwrap();
    assert_eq!(payload, json!({"data": {"landpads": [{"id": "LZ-4"}]}}));
}

#[tokio::test]
async fn path_and_query_are_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;
    let proxy = start_proxy(&upstream.uri(), true).await;

    let response = reqwest::get(format!("{proxy}/status?verbose=1")).await.unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "passthrough");
}

#[tokio::test]
async fn health_reports_phase() {
    let upstream = MockServer::start().await;

    let active = start_proxy(&upstream.uri(), true).await;
    let health: Value = reqwest::get(format!("{active}{HEALTH_PATH}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["phase"], "active");
    assert_eq!(health["cache_version"], "v1");

    let waiting = start_proxy(&upstream.uri(), false).await;
    let health: Value = reqwest::get(format!("{waiting}{HEALTH_PATH}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["phase"], "installed");
}

#[tokio::test]
async fn unreachable_origin_returns_offline_envelope() {
    let proxy = start_proxy("http://127.0.0.1:9", true).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/graphql"))
        .json(&json!({"query": "{ launches { id } }"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "offline");
    let payload: Value = response.json().await.unwrap();
    assert_eq!(
        payload["errors"][0]["message"],
        muninn::error::OFFLINE_NO_DATA_MESSAGE
    );
    assert!(payload["data"].is_null());
}
