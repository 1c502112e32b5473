use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::models::credential::{next_rollover, Credential};
use crate::store::{Ledger, ReserveOutcome};

/// Quota reserved against one credential for one upstream call.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Post-increment snapshot of the credential.
    pub credential: Credential,
    pub cost: i64,
}

/// Picks the least-utilized eligible credential and reserves quota on it.
///
/// Scan, rollover and reserve run under one pool-wide gate so two concurrent
/// selections never observe the same pre-increment usage. The gate never
/// covers upstream I/O; it is held only for ledger reads and writes.
pub struct Allocator {
    ledger: Arc<dyn Ledger>,
    gate: Mutex<()>,
}

impl Allocator {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            gate: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Reserve `cost` units on the best eligible credential.
    ///
    /// Fails with [`AppError::PoolExhausted`] when no active credential has
    /// quota left after pending rollovers are applied.
    pub async fn select(&self, cost: i64) -> Result<Reservation, AppError> {
        let _gate = self.gate.lock().await;
        let now = Utc::now();

        let mut candidates = self
            .ledger
            .list_active()
            .await
            .map_err(AppError::Persistence)?;

        for cred in candidates.iter_mut().filter(|c| c.needs_rollover(now)) {
            let next = next_rollover(now);
            self.ledger
                .rollover(cred.id, next, now)
                .await
                .map_err(AppError::Persistence)?;
            tracing::info!(credential_id = %cred.id, next_refresh = %next, "quota reset");
            cred.quota_used = 0;
            cred.refreshes_at = Some(next);
        }

        candidates.retain(Credential::is_eligible);
        candidates.sort_by(selection_order);

        for cand in candidates {
            match self
                .ledger
                .reserve(cand.id, cost, now)
                .await
                .map_err(AppError::Persistence)?
            {
                ReserveOutcome::Reserved(credential) => {
                    tracing::debug!(
                        credential_id = %credential.id,
                        quota_used = credential.quota_used,
                        quota_limit = credential.quota_limit,
                        cost,
                        "reserved quota"
                    );
                    return Ok(Reservation { credential, cost });
                }
                ReserveOutcome::Conflict => {
                    tracing::warn!(
                        credential_id = %cand.id,
                        "credential changed between scan and reserve, trying next"
                    );
                }
            }
        }

        tracing::warn!("credential pool exhausted");
        Err(AppError::PoolExhausted)
    }
}

/// Total order used to rank eligible credentials.
///
/// 1. utilization `quota_used / max(quota_limit, 1)`, ascending, compared by
///    cross-multiplication so no precision is lost;
/// 2. `last_used_at`, ascending, never-used first;
/// 3. `created_at`, then `id`, so equal candidates still have a fixed order.
pub fn selection_order(a: &Credential, b: &Credential) -> Ordering {
    let lhs = i128::from(a.quota_used) * i128::from(b.quota_limit.max(1));
    let rhs = i128::from(b.quota_used) * i128::from(a.quota_limit.max(1));
    lhs.cmp(&rhs)
        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
