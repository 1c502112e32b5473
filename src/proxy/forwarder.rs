use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::allocator::{Allocator, Reservation};
use super::stream::{scrub_body, scrub_headers};
use super::upstream::{ProxyRequest, Transport, UpstreamResponse};
use crate::errors::AppError;
use crate::models::credential::RequestLogEntry;
use crate::store::Ledger;

/// How a forwarded call settled against its reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream answered; the reserved cost stays spent.
    Committed,
    /// Upstream answered 401/403; the credential was retired, the response
    /// is still relayed.
    AuthRejected,
}

/// Runs one upstream call on a reserved credential and settles the
/// reservation: commit, roll back on transport failure, or retire the
/// credential on rejection.
pub struct Forwarder {
    allocator: Arc<Allocator>,
    transport: Arc<dyn Transport>,
    cost: i64,
}

impl Forwarder {
    pub fn new(allocator: Arc<Allocator>, transport: Arc<dyn Transport>, cost: i64) -> Self {
        Self {
            allocator,
            transport,
            cost,
        }
    }

    fn ledger(&self) -> &Arc<dyn Ledger> {
        self.allocator.ledger()
    }

    /// Reserve, forward and record one proxied request.
    pub async fn handle(&self, req: ProxyRequest) -> Result<(UpstreamResponse, Outcome), AppError> {
        let method = req.method.to_string();
        let path = req.path.clone();

        let reservation = self.allocator.select(self.cost).await?;
        let credential_id = reservation.credential.id;

        let result = self.forward(reservation, req).await;

        log_async(
            self.ledger().clone(),
            RequestLogEntry {
                path,
                method,
                status_code: result.as_ref().ok().map(|(r, _)| r.status.as_u16()),
                credential_id,
                created_at: Utc::now(),
            },
        );

        result
    }

    /// Call upstream with the reserved credential and reconcile the ledger.
    ///
    /// If this future is dropped before the upstream answers (client went
    /// away), the reservation is rolled back in the background exactly as
    /// for a transport failure.
    pub async fn forward(
        &self,
        reservation: Reservation,
        req: ProxyRequest,
    ) -> Result<(UpstreamResponse, Outcome), AppError> {
        let Reservation { credential, cost } = reservation;
        let id = credential.id;
        let secret = Zeroizing::new(credential.secret);

        let mut guard = RollbackGuard::new(self.ledger().clone(), id, cost);
        let result = self.transport.call(req, &secret).await;
        guard.disarm();

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.ledger()
                    .rollback(id, cost)
                    .await
                    .map_err(AppError::Persistence)?;
                tracing::warn!(credential_id = %id, cost, "upstream unreachable, reservation rolled back: {}", e);
                return Err(AppError::UpstreamUnreachable(e.to_string()));
            }
        };

        let outcome = match resp.status.as_u16() {
            401 | 403 => {
                self.ledger()
                    .record_rejection(id)
                    .await
                    .map_err(AppError::Persistence)?;
                tracing::warn!(
                    credential_id = %id,
                    status = resp.status.as_u16(),
                    "upstream rejected credential, deactivated"
                );
                Outcome::AuthRejected
            }
            _ => Outcome::Committed,
        };

        Ok((
            UpstreamResponse {
                status: resp.status,
                headers: scrub_headers(&resp.headers, &secret),
                body: scrub_body(resp.body, &secret),
            },
            outcome,
        ))
    }
}

/// Rolls a reservation back if dropped while still armed.
struct RollbackGuard {
    ledger: Arc<dyn Ledger>,
    id: Uuid,
    cost: i64,
    armed: bool,
}

impl RollbackGuard {
    fn new(ledger: Arc<dyn Ledger>, id: Uuid, cost: i64) -> Self {
        Self {
            ledger,
            id,
            cost,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (ledger, id, cost) = (self.ledger.clone(), self.id, self.cost);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match ledger.rollback(id, cost).await {
                        Ok(()) => tracing::info!(credential_id = %id, cost, "request cancelled, reservation rolled back"),
                        Err(e) => tracing::error!(credential_id = %id, "failed to roll back cancelled reservation: {}", e),
                    }
                });
            }
            Err(_) => {
                tracing::error!(credential_id = %id, "no runtime to roll back cancelled reservation");
            }
        }
    }
}

/// Writes the request log entry off the response path.
fn log_async(ledger: Arc<dyn Ledger>, entry: RequestLogEntry) {
    tokio::spawn(async move {
        if let Err(e) = ledger.log_request(&entry).await {
            tracing::error!(credential_id = %entry.credential_id, "failed to write request log: {}", e);
        }
    });
}
