use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An upstream API key plus its quota and status bookkeeping.
///
/// The secret is never serialized; admin responses go through
/// [`CredentialView`], which only carries a masked prefix.
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub secret: String,
    /// 0 = unlimited.
    pub quota_limit: i64,
    pub quota_used: i64,
    pub is_active: bool,
    pub error_count: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub refreshes_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &mask_secret(&self.secret))
            .field("quota_limit", &self.quota_limit)
            .field("quota_used", &self.quota_used)
            .field("is_active", &self.is_active)
            .field("error_count", &self.error_count)
            .field("last_used_at", &self.last_used_at)
            .field("refreshes_at", &self.refreshes_at)
            .finish()
    }
}

impl Credential {
    /// `is_active && (quota_limit == 0 || quota_used < quota_limit)`.
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.has_quota()
    }

    pub fn has_quota(&self) -> bool {
        self.quota_limit == 0 || self.quota_used < self.quota_limit
    }

    /// True when the quota period ended at or before `now`.
    /// Credentials without a refresh boundary never roll over.
    pub fn needs_rollover(&self, now: DateTime<Utc>) -> bool {
        matches!(self.refreshes_at, Some(at) if at <= now)
    }

    pub fn view(&self) -> CredentialView {
        CredentialView {
            id: self.id,
            key: mask_secret(&self.secret),
            quota_limit: self.quota_limit,
            quota_used: self.quota_used,
            is_active: self.is_active,
            error_count: self.error_count,
            last_used_at: self.last_used_at,
            last_checked_at: self.last_checked_at,
            created_at: self.created_at,
            refreshes_at: self.refreshes_at,
        }
    }
}

/// Admin-facing projection of a [`Credential`] with the secret masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialView {
    pub id: Uuid,
    pub key: String,
    pub quota_limit: i64,
    pub quota_used: i64,
    pub is_active: bool,
    pub error_count: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub refreshes_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub secret: String,
    pub quota_limit: i64,
    pub refreshes_at: Option<DateTime<Utc>>,
}

/// Partial admin update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialPatch {
    pub is_active: Option<bool>,
    pub quota_limit: Option<i64>,
}

/// One row of the proxied-request log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub path: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub credential_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Shows the first four characters of a secret, e.g. `abcd****`.
pub fn mask_secret(secret: &str) -> String {
    match secret.char_indices().nth(4) {
        Some((idx, _)) => format!("{}****", &secret[..idx]),
        None if secret.chars().count() == 4 => format!("{}****", secret),
        None => "****".to_string(),
    }
}

/// First instant of the calendar month after `now`, in UTC.
pub fn next_rollover(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
