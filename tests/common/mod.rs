//! Shared fixtures: in-memory ledger, config pointed at a mock upstream, and
//! helpers for driving the router without a socket.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use keypool::config::{Config, LedgerBackend, QuotaConfig, UpstreamConfig};
use keypool::models::credential::Credential;
use keypool::store::memory::MemoryLedger;
use keypool::store::Ledger;
use keypool::{build_router, AppState};

pub fn test_config(upstream: &str) -> Config {
    let mut up = UpstreamConfig::new(Url::parse(upstream).unwrap());
    up.timeout = Duration::from_secs(2);
    up.connect_timeout = Duration::from_millis(500);
    Config {
        port: 8080,
        database_url: String::new(),
        ledger: LedgerBackend::Memory,
        admin_key: None,
        upstream: up,
        quota: QuotaConfig {
            default_quota_limit: 100,
            cost_per_request: 1,
        },
        refresh_interval_secs: 0,
        log_json: false,
    }
}

pub fn credential(secret: &str, limit: i64, used: i64) -> Credential {
    Credential {
        id: Uuid::new_v4(),
        secret: secret.into(),
        quota_limit: limit,
        quota_used: used,
        is_active: true,
        error_count: 0,
        last_used_at: None,
        last_checked_at: None,
        created_at: Utc::now(),
        refreshes_at: None,
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub state: Arc<AppState>,
    pub app: Router,
}

impl Harness {
    pub fn new(cfg: Config, creds: &[Credential]) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        for c in creds {
            ledger.seed(c.clone());
        }
        let state = Arc::new(AppState::new(ledger.clone(), cfg).unwrap());
        let app = build_router(state.clone());
        Self { ledger, state, app }
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    pub async fn row(&self, id: Uuid) -> Credential {
        self.ledger.get(id).await.unwrap().unwrap()
    }
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(resp: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(resp).await).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
