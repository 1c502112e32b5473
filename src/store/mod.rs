pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::credential::{Credential, CredentialPatch, NewCredential, RequestLogEntry};

/// Returned (inside `anyhow::Error`) by [`Ledger::insert`] when the secret is
/// already pooled. Callers detect it with `err.is::<DuplicateSecret>()`.
#[derive(Debug, thiserror::Error)]
#[error("credential already exists")]
pub struct DuplicateSecret;

/// Result of a conditional reservation against a single credential.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// The increment was applied; carries the post-increment row.
    Reserved(Credential),
    /// The row was missing, inactive or out of quota by the time the update ran.
    Conflict,
}

/// Durable record of every credential and its quota/status fields.
///
/// Single-row updates (`reserve`, `rollback`, `record_rejection`, ...) must be
/// atomic with respect to each other. Pool-wide serialization of
/// scan + reserve is the allocator's job, not the ledger's.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Every credential, oldest first.
    async fn list_credentials(&self) -> anyhow::Result<Vec<Credential>>;

    /// Credentials with `is_active = true`. Quota eligibility is decided by
    /// the caller after applying any pending rollover.
    async fn list_active(&self) -> anyhow::Result<Vec<Credential>>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Credential>>;

    /// Fails with [`DuplicateSecret`] if the secret is already stored.
    async fn insert(&self, cred: &NewCredential) -> anyhow::Result<Credential>;

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn update(&self, id: Uuid, patch: &CredentialPatch) -> anyhow::Result<Option<Credential>>;

    /// `quota_used += cost`, `last_used_at = now`, only while the credential
    /// is still active with quota left.
    async fn reserve(&self, id: Uuid, cost: i64, now: DateTime<Utc>) -> anyhow::Result<ReserveOutcome>;

    /// `quota_used -= cost`, floored at 0.
    async fn rollback(&self, id: Uuid, cost: i64) -> anyhow::Result<()>;

    /// `is_active = false`, `error_count += 1`, `last_checked_at = now`.
    async fn record_rejection(&self, id: Uuid) -> anyhow::Result<()>;

    /// Overwrites status fields and stamps `last_checked_at`.
    async fn set_status(&self, id: Uuid, is_active: bool, error_count: i32) -> anyhow::Result<bool>;

    /// Resets `quota_used` to 0 and moves `refreshes_at` to `next_refresh`,
    /// only if the period is still expired at `now`.
    async fn rollover(
        &self,
        id: Uuid,
        next_refresh: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Authoritative overwrite of `quota_used` from a health probe.
    async fn overwrite_usage(&self, id: Uuid, quota_used: i64) -> anyhow::Result<()>;

    async fn touch_checked(&self, id: Uuid) -> anyhow::Result<()>;

    async fn log_request(&self, entry: &RequestLogEntry) -> anyhow::Result<()>;
}
