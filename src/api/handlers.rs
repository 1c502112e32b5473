use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::parse_upstream_url;
use crate::errors::AppError;
use crate::health::{RefreshOutcome, RefreshSummary};
use crate::models::credential::{CredentialPatch, CredentialView, NewCredential};
use crate::store::DuplicateSecret;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    #[serde(alias = "key")]
    pub secret: String,
    pub quota_limit: Option<i64>,
    pub refreshes_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct UpstreamUpdateRequest {
    pub upstream_url: String,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub upstream_url: String,
    pub port: u16,
    pub default_quota_limit: i64,
    pub cost_per_request: i64,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /config
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        upstream_url: state.upstream.base_url().await.to_string(),
        port: state.config.port,
        default_quota_limit: state.config.quota.default_quota_limit,
        cost_per_request: state.config.quota.cost_per_request,
    })
}

/// PUT /config/upstream: swap the upstream base URL until restart
pub async fn update_upstream(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UpstreamUpdateRequest>,
) -> Result<Json<ConfigResponse>, AppError> {
    let url = parse_upstream_url(&payload.upstream_url)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.upstream.set_base_url(url).await;
    Ok(get_config(State(state)).await)
}

/// GET /keys
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CredentialView>>, AppError> {
    let creds = state.ledger.list_credentials().await.map_err(|e| {
        tracing::error!("list_keys failed: {}", e);
        AppError::Persistence(e)
    })?;
    Ok(Json(creds.iter().map(|c| c.view()).collect()))
}

/// POST /keys
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CredentialView>), AppError> {
    let secret = payload.secret.trim().to_string();
    if secret.is_empty() {
        return Err(AppError::BadRequest("secret must not be empty".into()));
    }

    let new = NewCredential {
        secret,
        quota_limit: resolve_quota_limit(payload.quota_limit, state.config.quota.default_quota_limit),
        refreshes_at: Some(resolve_refreshes_at(payload.refreshes_at, Utc::now())),
    };

    let cred = state.ledger.insert(&new).await.map_err(|e| {
        if e.is::<DuplicateSecret>() {
            return AppError::BadRequest(e.to_string());
        }
        tracing::error!("create_key failed: {}", e);
        AppError::Persistence(e)
    })?;

    tracing::info!(credential_id = %cred.id, quota_limit = cred.quota_limit, "credential added");
    Ok((StatusCode::CREATED, Json(cred.view())))
}

/// GET /keys/:id
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CredentialView>, AppError> {
    let cred = state
        .ledger
        .get(id)
        .await
        .map_err(AppError::Persistence)?
        .ok_or(AppError::CredentialNotFound)?;
    Ok(Json(cred.view()))
}

/// PUT /keys/:id: toggle `is_active` and/or change `quota_limit`
pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<CredentialPatch>,
) -> Result<Json<CredentialView>, AppError> {
    if matches!(patch.quota_limit, Some(l) if l < 0) {
        return Err(AppError::BadRequest("quota_limit must be >= 0".into()));
    }

    let cred = state
        .ledger
        .update(id, &patch)
        .await
        .map_err(|e| {
            tracing::error!("update_key failed: {}", e);
            AppError::Persistence(e)
        })?
        .ok_or(AppError::CredentialNotFound)?;

    tracing::info!(
        credential_id = %id,
        is_active = cred.is_active,
        quota_limit = cred.quota_limit,
        "credential updated"
    );
    Ok(Json(cred.view()))
}

/// DELETE /keys/:id
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let deleted = state.ledger.delete(id).await.map_err(|e| {
        tracing::error!("delete_key failed: {}", e);
        AppError::Persistence(e)
    })?;
    if !deleted {
        return Err(AppError::CredentialNotFound);
    }
    tracing::info!(credential_id = %id, "credential deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /keys/:id/refresh
pub async fn refresh_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RefreshOutcome>, AppError> {
    Ok(Json(state.health.refresh(id).await?))
}

/// GET|POST /keys/refresh
pub async fn refresh_all_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshSummary>, AppError> {
    Ok(Json(state.health.refresh_all().await?))
}

// ── Helpers ──────────────────────────────────────────────────

/// Missing or non-positive limits fall back to the configured default.
pub fn resolve_quota_limit(requested: Option<i64>, default: i64) -> i64 {
    match requested {
        Some(l) if l > 0 => l,
        _ => default,
    }
}

/// Missing refresh boundary means one month from `now`.
pub fn resolve_refreshes_at(requested: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    requested.unwrap_or_else(|| now.checked_add_months(Months::new(1)).unwrap_or(now))
}
