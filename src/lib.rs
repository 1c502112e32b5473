//! keypool: spreads proxied API calls across a pool of upstream keys,
//! each with its own quota.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! in `tests/` drive [`build_router`] directly.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;

pub mod api;
pub mod config;
pub mod errors;
pub mod health;
pub mod jobs;
pub mod models;
pub mod proxy;
pub mod store;

use config::Config;
use health::HealthChecker;
use proxy::allocator::Allocator;
use proxy::forwarder::Forwarder;
use proxy::handler::{proxy_handler, PROXY_PREFIX};
use proxy::upstream::UpstreamClient;
use store::Ledger;

pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub allocator: Arc<Allocator>,
    pub forwarder: Forwarder,
    pub health: HealthChecker,
    pub upstream: Arc<UpstreamClient>,
    pub config: Config,
}

impl AppState {
    pub fn new(ledger: Arc<dyn Ledger>, config: Config) -> anyhow::Result<Self> {
        config.quota.validate()?;
        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let allocator = Arc::new(Allocator::new(ledger.clone()));
        let forwarder = Forwarder::new(
            allocator.clone(),
            upstream.clone(),
            config.quota.cost_per_request,
        );
        let health = HealthChecker::new(ledger.clone(), upstream.clone());

        Ok(Self {
            ledger,
            allocator,
            forwarder,
            health,
            upstream,
            config,
        })
    }
}

/// Full HTTP surface: health, admin API and the proxy under `/api`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::handlers::health))
        .merge(api::api_router(state.clone()))
        .route(PROXY_PREFIX, any(proxy_handler))
        .route(&format!("{}/*path", PROXY_PREFIX), any(proxy_handler))
        .fallback(|| async { axum::http::StatusCode::NOT_FOUND })
        .with_state(state)
        // admin JSON payloads only; proxied bodies are streamed
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
