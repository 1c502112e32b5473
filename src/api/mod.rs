use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::AppState;

pub mod handlers;

/// Build the admin router: config and credential management.
/// `/health` is registered by the caller outside of admin auth.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(handlers::get_config))
        .route(
            "/config/upstream",
            axum::routing::put(handlers::update_upstream),
        )
        .route("/keys", get(handlers::list_keys).post(handlers::create_key))
        .route(
            "/keys/refresh",
            get(handlers::refresh_all_keys).post(handlers::refresh_all_keys),
        )
        .route(
            "/keys/:id",
            get(handlers::get_key)
                .put(handlers::update_key)
                .delete(handlers::delete_key),
        )
        .route(
            "/keys/:id/refresh",
            axum::routing::post(handlers::refresh_key),
        )
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

/// Middleware: when an admin key is configured, requires it in `X-Admin-Key`.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(_) => {
            // never log the expected or provided key
            tracing::warn!(path = %req.uri().path(), "admin API: invalid key");
            Err(AppError::Unauthorized)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "admin API: missing X-Admin-Key header");
            Err(AppError::Unauthorized)
        }
    }
}
