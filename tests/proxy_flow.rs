//! End-to-end proxy behaviour: router → allocator → forwarder → mock upstream.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

#[tokio::test]
async fn test_relays_to_least_used_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shodan/host/8.8.8.8"))
        .and(query_param("key", "key-b"))
        .and(query_param("minify", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"ip_str":"8.8.8.8"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let a = credential("key-a", 10, 10);
    let b = credential("key-b", 10, 0);
    let h = Harness::new(test_config(&server.uri()), &[a.clone(), b.clone()]);

    let resp = h.send(get("/api/shodan/host/8.8.8.8?minify=true")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
    assert_eq!(body_string(resp).await, r#"{"ip_str":"8.8.8.8"}"#);

    assert_eq!(h.row(a.id).await.quota_used, 10);
    assert_eq!(h.row(b.id).await.quota_used, 1);
}

#[tokio::test]
async fn test_client_key_param_is_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dns/resolve"))
        .and(query_param("key", "pooled"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(test_config(&server.uri()), &[credential("pooled", 0, 0)]);
    let resp = h.send(get("/api/dns/resolve?key=client-supplied")).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/shodan/scan"))
        .and(wiremock::matchers::body_string("ips=1.1.1.1"))
        .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id":"x"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(test_config(&server.uri()), &[credential("k", 10, 0)]);
    let req = Request::builder()
        .method("POST")
        .uri("/api/shodan/scan")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("ips=1.1.1.1"))
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_compressed_encoding_is_not_requested_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .and(header("accept-encoding", "identity"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"echo":"enc-secret"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(test_config(&server.uri()), &[credential("enc-secret", 10, 0)]);
    let req = Request::builder()
        .uri("/api/x")
        .header("accept-encoding", "gzip, br")
        .body(Body::empty())
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("content-encoding").is_none());
    assert_eq!(body_string(resp).await, r#"{"echo":"****"}"#);
}

#[tokio::test]
async fn test_negative_cost_is_refused_at_startup() {
    let mut cfg = test_config("http://127.0.0.1:1");
    cfg.quota.cost_per_request = -1;
    let ledger = std::sync::Arc::new(keypool::store::memory::MemoryLedger::new());
    assert!(keypool::AppState::new(ledger, cfg).is_err());
}

#[tokio::test]
async fn test_unreachable_upstream_rolls_back() {
    let a = credential("key-a", 10, 10);
    let b = credential("key-b", 10, 0);
    let h = Harness::new(test_config("http://127.0.0.1:1"), &[a, b.clone()]);

    let resp = h.send(get("/api/shodan/host/8.8.8.8")).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "upstream_unreachable");
    assert!(!json.to_string().contains("key-b"));

    let row = h.row(b.id).await;
    assert_eq!(row.quota_used, 0);
    assert!(row.is_active);
}

#[tokio::test]
async fn test_forbidden_key_is_retired_and_response_relayed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("key", "revoked"))
        .respond_with(ResponseTemplate::new(403).set_body_string(r#"{"error":"Access denied"}"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("key", "healthy"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    // "revoked" is less utilized so it is tried first
    let revoked = credential("revoked", 100, 0);
    let healthy = credential("healthy", 100, 50);
    let h = Harness::new(test_config(&server.uri()), &[revoked.clone(), healthy.clone()]);

    let resp = h.send(get("/api/shodan/host/1.1.1.1")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(resp).await, r#"{"error":"Access denied"}"#);

    let row = h.row(revoked.id).await;
    assert_eq!(row.quota_used, 1);
    assert!(!row.is_active);
    assert_eq!(row.error_count, 1);

    let resp = h.send(get("/api/shodan/host/1.1.1.1")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.row(healthy.id).await.quota_used, 51);
}

#[tokio::test]
async fn test_secret_never_echoed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-debug-url", "https://upstream/x?key=very-secret-key")
                .set_body_string(r#"{"request":"/x?key=very-secret-key"}"#),
        )
        .mount(&server)
        .await;

    let h = Harness::new(test_config(&server.uri()), &[credential("very-secret-key", 10, 0)]);
    let resp = h.send(get("/api/x")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-debug-url").is_none());
    let body = body_string(resp).await;
    assert!(!body.contains("very-secret-key"));
    assert_eq!(body, r#"{"request":"/x?key=****"}"#);
}

#[tokio::test]
async fn test_empty_pool_is_service_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = Harness::new(
        test_config(&server.uri()),
        &[credential("spent", 5, 5)],
    );
    let resp = h.send(get("/api/shodan/host/8.8.8.8")).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "pool_exhausted");
}

#[tokio::test]
async fn test_request_is_logged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let cred = credential("k", 10, 0);
    let h = Harness::new(test_config(&server.uri()), &[cred.clone()]);
    let resp = h.send(get("/api/shodan/host/0.0.0.0")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let mut log = Vec::new();
    for _ in 0..100 {
        log = h.ledger.request_log().await;
        if !log.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].path, "/shodan/host/0.0.0.0");
    assert_eq!(log[0].status_code, Some(404));
    assert_eq!(log[0].credential_id, cred.id);
}

#[tokio::test]
async fn test_concurrent_requests_respect_quota() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(10)))
        .mount(&server)
        .await;

    let a = credential("a", 4, 0);
    let b = credential("b", 3, 0);
    let h = std::sync::Arc::new(Harness::new(
        test_config(&server.uri()),
        &[a.clone(), b.clone()],
    ));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move { h.send(get("/api/ping")).await.status() })
        })
        .collect();

    let mut ok = 0;
    let mut unavailable = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::SERVICE_UNAVAILABLE => unavailable += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(ok, 7);
    assert_eq!(unavailable, 5);
    assert_eq!(h.row(a.id).await.quota_used, 4);
    assert_eq!(h.row(b.id).await.quota_used, 3);
}
