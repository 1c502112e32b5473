use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::credential::{Credential, CredentialView};
use crate::proxy::upstream::Transport;
use crate::store::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Valid,
    Invalid,
    /// The probe itself failed; the credential was left untouched.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub id: Uuid,
    pub status: ProbeStatus,
    /// Remaining quota reported by the upstream, when the probe completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Credential state after the refresh was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub total: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Reconciles ledger state with what the upstream reports for each secret.
///
/// Runs outside the allocator gate: a usage overwrite can land between a
/// concurrent reservation's scan and its write, in which case the overwrite
/// wins until the next reservation.
#[derive(Clone)]
pub struct HealthChecker {
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn Transport>,
}

impl HealthChecker {
    pub fn new(ledger: Arc<dyn Ledger>, transport: Arc<dyn Transport>) -> Self {
        Self { ledger, transport }
    }

    pub async fn refresh(&self, id: Uuid) -> Result<RefreshOutcome, AppError> {
        let cred = self
            .ledger
            .get(id)
            .await
            .map_err(AppError::Persistence)?
            .ok_or(AppError::CredentialNotFound)?;
        self.refresh_credential(&cred).await
    }

    /// Probe every credential, active or not. Probe failures are counted and
    /// skipped; ledger failures abort the sweep.
    pub async fn refresh_all(&self) -> Result<RefreshSummary, AppError> {
        let creds = self
            .ledger
            .list_credentials()
            .await
            .map_err(AppError::Persistence)?;

        let mut summary = RefreshSummary {
            total: creds.len(),
            ..Default::default()
        };
        for cred in &creds {
            match self.refresh_credential(cred).await?.status {
                ProbeStatus::Failed => summary.failed += 1,
                _ => summary.updated += 1,
            }
        }

        tracing::info!(
            total = summary.total,
            updated = summary.updated,
            failed = summary.failed,
            "credential refresh complete"
        );
        Ok(summary)
    }

    async fn refresh_credential(&self, cred: &Credential) -> Result<RefreshOutcome, AppError> {
        let report = match self.transport.probe(&cred.secret).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(credential_id = %cred.id, "health probe failed: {}", e);
                return Ok(RefreshOutcome {
                    id: cred.id,
                    status: ProbeStatus::Failed,
                    remaining: None,
                    error: Some(e.to_string()),
                    credential: Some(cred.view()),
                });
            }
        };

        if report.valid && cred.quota_limit > 0 {
            let used = (cred.quota_limit - report.remaining).max(0);
            self.ledger
                .overwrite_usage(cred.id, used)
                .await
                .map_err(AppError::Persistence)?;
        }

        match (report.valid, cred.is_active) {
            (false, true) => {
                self.ledger
                    .record_rejection(cred.id)
                    .await
                    .map_err(AppError::Persistence)?;
                tracing::warn!(credential_id = %cred.id, "credential failed health check, deactivated");
            }
            (true, false) => {
                self.ledger
                    .set_status(cred.id, true, 0)
                    .await
                    .map_err(AppError::Persistence)?;
                tracing::info!(credential_id = %cred.id, "credential passed health check, reactivated");
            }
            _ => {
                self.ledger
                    .touch_checked(cred.id)
                    .await
                    .map_err(AppError::Persistence)?;
            }
        }

        let after = self
            .ledger
            .get(cred.id)
            .await
            .map_err(AppError::Persistence)?;

        tracing::debug!(
            credential_id = %cred.id,
            valid = report.valid,
            remaining = report.remaining,
            "credential refreshed"
        );

        Ok(RefreshOutcome {
            id: cred.id,
            status: if report.valid {
                ProbeStatus::Valid
            } else {
                ProbeStatus::Invalid
            },
            remaining: Some(report.remaining),
            error: None,
            credential: after.as_ref().map(Credential::view),
        })
    }
}
