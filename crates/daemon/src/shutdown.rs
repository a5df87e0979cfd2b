//! Graceful shutdown with a bounded drain.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::AdmissionController;

/// Grace period for forcibly terminated workers to unwind and free their slot.
const FORCE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Every worker finished before the deadline.
    Clean,
    /// Workers were still active at the deadline and were terminated.
    Forced,
}

/// Two-stage stop signal shared by the accept loops and every worker.
///
/// `request` stops accepting and tells idle workers to close; `drain` waits
/// for active ones and escalates to `killed` at the deadline.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    stop: CancellationToken,
    kill: CancellationToken,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.stop.is_cancelled() {
            info!("shutdown requested");
        }
        self.stop.cancel();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.stop.cancelled().await;
    }

    /// Resolves once the drain deadline has passed.
    pub async fn killed(&self) {
        self.kill.cancelled().await;
    }

    /// Request shutdown, wait up to `timeout` for active workers, then force
    /// the rest closed.
    pub async fn drain(&self, admission: &AdmissionController, timeout: Duration) -> DrainStatus {
        self.request();
        let active = admission.active();
        if active > 0 {
            info!(active, ?timeout, "draining active connections");
        }

        let status = if tokio::time::timeout(timeout, admission.wait_idle())
            .await
            .is_ok()
        {
            DrainStatus::Clean
        } else {
            warn!(
                active = admission.active(),
                "drain timeout reached, terminating remaining connections"
            );
            self.kill.cancel();
            if tokio::time::timeout(FORCE_GRACE, admission.wait_idle())
                .await
                .is_err()
            {
                warn!(active = admission.active(), "workers still unwinding after forced close");
            }
            DrainStatus::Forced
        };

        admission.close();
        status
    }
}
