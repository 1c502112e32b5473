//! Background job: periodic health refresh of every credential.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::health::HealthChecker;

/// Spawn the refresh loop. Call this once at startup; a zero interval
/// disables the job.
pub fn spawn(checker: HealthChecker, every: Duration) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        tracing::info!("periodic credential refresh disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately; skip it so startup isn't a probe storm
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = checker.refresh_all().await {
                tracing::error!("credential refresh job failed: {}", e);
            }
        }
    }))
}
