//! Engine publication and hot reload.
//!
//! The published engine lives in a `watch` channel. Workers clone the `Arc`
//! once at connection start and keep it until they close, so a reload only
//! affects connections accepted after the swap. Superseded engines are
//! tracked weakly until their last worker lets go.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bulwark_core::{signature, BuildError, Engine, EngineOptions};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Published {
        build_id: String,
        signature_count: usize,
    },
    /// Another reload was already running; this request was folded into it.
    InProgress,
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("engine build task failed: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct ReloadCoordinator {
    dbdir: PathBuf,
    options: EngineOptions,
    current: watch::Sender<Arc<Engine>>,
    retired: Mutex<Vec<Weak<Engine>>>,
    reloading: tokio::sync::Mutex<()>,
}

impl ReloadCoordinator {
    #[must_use]
    pub fn new(dbdir: PathBuf, options: EngineOptions, engine: Engine) -> Self {
        let (current, _) = watch::channel(Arc::new(engine));
        Self {
            dbdir,
            options,
            current,
            retired: Mutex::new(Vec::new()),
            reloading: tokio::sync::Mutex::new(()),
        }
    }

    /// The engine new connections bind to.
    #[must_use]
    pub fn current(&self) -> Arc<Engine> {
        Arc::clone(&self.current.borrow())
    }

    /// Rebuild the database and publish it. On failure the current engine
    /// stays authoritative.
    ///
    /// # Errors
    ///
    /// Returns the build error, or `Panicked` if the build task died.
    #[instrument(skip(self), fields(dir = %self.dbdir.display()))]
    pub async fn reload(&self) -> Result<ReloadOutcome, ReloadError> {
        let Ok(_guard) = self.reloading.try_lock() else {
            debug!("reload already in progress");
            return Ok(ReloadOutcome::InProgress);
        };

        info!("reloading signature database");
        let dir = self.dbdir.clone();
        let options = self.options;
        let built = tokio::task::spawn_blocking(move || bulwark_core::build(&dir, &options))
            .await
            .map_err(|e| ReloadError::Panicked(e.to_string()))?;

        match built {
            Ok(engine) => {
                let outcome = ReloadOutcome::Published {
                    build_id: engine.build_id().to_string(),
                    signature_count: engine.signature_count(),
                };
                self.publish(engine);
                Ok(outcome)
            }
            Err(e) => {
                error!(%e, "database reload failed, keeping current engine");
                Err(e.into())
            }
        }
    }

    /// Atomically replace the published engine. Connections already holding
    /// the previous one keep it.
    pub fn publish(&self, engine: Engine) {
        let engine = Arc::new(engine);
        info!(
            build_id = %engine.build_id(),
            signatures = engine.signature_count(),
            "database reloaded"
        );
        let previous = self.current.send_replace(engine);

        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        retired.retain(|w| w.strong_count() > 0);
        retired.push(Arc::downgrade(&previous));
        drop(retired);

        if Arc::strong_count(&previous) > 1 {
            debug!(build_id = %previous.build_id(), "previous engine retained by active connections");
        }
    }

    /// Start a reload in the background and return immediately.
    pub fn trigger(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.reload().await {
                warn!(%e, "triggered reload failed");
            }
        });
    }

    /// Engines still alive: the published one plus retired ones some worker
    /// still holds.
    #[must_use]
    pub fn live_engines(&self) -> usize {
        let retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        1 + retired.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Poll the database directory and reload when it changes. Ends when
    /// shutdown is requested.
    pub async fn self_check(self: Arc<Self>, interval: Duration, shutdown: ShutdownCoordinator) {
        debug!(?interval, "database self-check started");
        loop {
            tokio::select! {
                () = shutdown.requested() => break,
                () = tokio::time::sleep(interval) => {}
            }

            let dir = self.dbdir.clone();
            let on_disk = match tokio::task::spawn_blocking(move || signature::fingerprint(&dir)).await {
                Ok(Ok(fp)) => fp,
                Ok(Err(e)) => {
                    warn!(%e, "database self-check failed");
                    continue;
                }
                Err(e) => {
                    warn!(%e, "database self-check task failed");
                    continue;
                }
            };

            if on_disk == *self.current().fingerprint() {
                debug!("database unchanged");
                continue;
            }
            info!("database changed on disk");
            if let Err(e) = self.reload().await {
                warn!(%e, "self-check reload failed");
            }
        }
        debug!("database self-check stopped");
    }
}
