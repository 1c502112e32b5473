use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DuplicateSecret, Ledger, ReserveOutcome};
use crate::models::credential::{Credential, CredentialPatch, NewCredential, RequestLogEntry};

/// In-process ledger backed by a `DashMap`.
///
/// Each single-row update runs under the entry's shard lock, which gives the
/// same per-row atomicity as an `UPDATE ... SET x = x + n` in PostgreSQL.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryLedger {
    rows: DashMap<Uuid, Credential>,
    /// secret → id; claiming an entry here is what makes insert atomic.
    secrets: DashMap<String, Uuid>,
    requests: Mutex<Vec<RequestLogEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully-formed row, bypassing the defaults applied by `insert`.
    pub fn seed(&self, cred: Credential) {
        self.secrets.insert(cred.secret.clone(), cred.id);
        self.rows.insert(cred.id, cred);
    }

    pub async fn request_log(&self) -> Vec<RequestLogEntry> {
        self.requests.lock().await.clone()
    }

    fn sorted(&self, filter: impl Fn(&Credential) -> bool) -> Vec<Credential> {
        let mut out: Vec<Credential> = self
            .rows
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn list_credentials(&self) -> anyhow::Result<Vec<Credential>> {
        Ok(self.sorted(|_| true))
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Credential>> {
        Ok(self.sorted(|c| c.is_active))
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Credential>> {
        Ok(self.rows.get(&id).map(|e| e.value().clone()))
    }

    async fn insert(&self, cred: &NewCredential) -> anyhow::Result<Credential> {
        let id = Uuid::new_v4();
        match self.secrets.entry(cred.secret.clone()) {
            Entry::Occupied(_) => return Err(DuplicateSecret.into()),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        let row = Credential {
            id,
            secret: cred.secret.clone(),
            quota_limit: cred.quota_limit,
            quota_used: 0,
            is_active: true,
            error_count: 0,
            last_used_at: None,
            last_checked_at: None,
            created_at: Utc::now(),
            refreshes_at: cred.refreshes_at,
        };
        self.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        match self.rows.remove(&id) {
            Some((_, row)) => {
                self.secrets.remove(&row.secret);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update(&self, id: Uuid, patch: &CredentialPatch) -> anyhow::Result<Option<Credential>> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(active) = patch.is_active {
            row.is_active = active;
        }
        if let Some(limit) = patch.quota_limit {
            row.quota_limit = limit;
        }
        Ok(Some(row.clone()))
    }

    async fn reserve(&self, id: Uuid, cost: i64, now: DateTime<Utc>) -> anyhow::Result<ReserveOutcome> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(ReserveOutcome::Conflict);
        };
        if !row.is_eligible() {
            return Ok(ReserveOutcome::Conflict);
        }
        row.quota_used += cost;
        row.last_used_at = Some(now);
        Ok(ReserveOutcome::Reserved(row.clone()))
    }

    async fn rollback(&self, id: Uuid, cost: i64) -> anyhow::Result<()> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.quota_used = (row.quota_used - cost).max(0);
        }
        Ok(())
    }

    async fn record_rejection(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.is_active = false;
            row.error_count += 1;
            row.last_checked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, is_active: bool, error_count: i32) -> anyhow::Result<bool> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        row.is_active = is_active;
        row.error_count = error_count;
        row.last_checked_at = Some(Utc::now());
        Ok(true)
    }

    async fn rollover(
        &self,
        id: Uuid,
        next_refresh: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            if row.needs_rollover(now) {
                row.quota_used = 0;
                row.refreshes_at = Some(next_refresh);
            }
        }
        Ok(())
    }

    async fn overwrite_usage(&self, id: Uuid, quota_used: i64) -> anyhow::Result<()> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.quota_used = quota_used;
        }
        Ok(())
    }

    async fn touch_checked(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.last_checked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn log_request(&self, entry: &RequestLogEntry) -> anyhow::Result<()> {
        self.requests.lock().await.push(entry.clone());
        Ok(())
    }
}
