//! Daemon assembly: engine, listeners, accept loops, lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{BuildError, Config, Engine};
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::admission::{AdmissionController, Rejected};
use crate::protocol::{Reply, ScanCodec};
use crate::reload::{ReloadCoordinator, ReloadError, ReloadOutcome};
use crate::shutdown::{DrainStatus, ShutdownCoordinator};
use crate::transport::{Connection, Listener, ListenerSet, Peer};
use crate::worker;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Conditions that keep the daemon from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load signature database: {0}")]
    Database(#[from] BuildError),
    #[error("no listeners configured")]
    NoListenersConfigured,
    #[error("no listener could be bound")]
    NoListenerBound,
    #[error("engine build task failed: {0}")]
    Join(String),
}

/// State every accept loop and worker shares.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Arc<Config>,
    pub(crate) engines: Arc<ReloadCoordinator>,
    pub(crate) admission: AdmissionController,
    pub(crate) shutdown: ShutdownCoordinator,
}

pub struct Daemon {
    shared: Arc<Shared>,
    accept_loops: Vec<JoinHandle<()>>,
    self_check: Option<JoinHandle<()>>,
    tcp_addrs: Vec<SocketAddr>,
}

impl Daemon {
    /// Build the engine, bind listeners and start accepting.
    ///
    /// # Errors
    ///
    /// Returns a `StartupError` if the database cannot be built or no
    /// listener binds. Nothing keeps running in that case.
    #[instrument(skip_all, fields(dir = %config.database_directory.display()))]
    pub async fn start(config: Arc<Config>) -> Result<Self, StartupError> {
        let dir = config.database_directory.clone();
        let options = config.engine_options();
        let engine = tokio::task::spawn_blocking(move || bulwark_core::build(&dir, &options))
            .await
            .map_err(|e| StartupError::Join(e.to_string()))??;
        info!(
            build_id = %engine.build_id(),
            "protecting against {} signatures",
            engine.signature_count()
        );

        let listeners = ListenerSet::bind(&config.listeners).await?;
        let tcp_addrs = listeners.tcp_addrs();

        let engines = Arc::new(ReloadCoordinator::new(
            config.database_directory.clone(),
            options,
            engine,
        ));
        let shared = Arc::new(Shared {
            admission: AdmissionController::new(config.max_threads(), config.max_queue),
            shutdown: ShutdownCoordinator::new(),
            engines,
            config,
        });

        let listener_count = listeners.len();
        let accept_loops = listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(listener, Arc::clone(&shared))))
            .collect();

        let self_check = shared.config.self_check_interval().map(|interval| {
            tokio::spawn(
                Arc::clone(&shared.engines).self_check(interval, shared.shutdown.clone()),
            )
        });

        info!(
            listeners = listener_count,
            max_threads = shared.admission.max_threads(),
            max_queue = shared.config.max_queue,
            "daemon started"
        );

        Ok(Self {
            shared,
            accept_loops,
            self_check,
            tcp_addrs,
        })
    }

    #[must_use]
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bound TCP addresses, with ephemeral ports resolved.
    #[must_use]
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    /// Serve until shutdown is requested, then drain with the configured timeout.
    pub async fn run(self) -> DrainStatus {
        self.shared.shutdown.requested().await;
        let drain_timeout = self.shared.config.drain_timeout();
        self.shutdown(drain_timeout).await
    }

    /// Stop listening, let active connections finish their current request
    /// for up to `drain_timeout`, then force the rest closed.
    #[instrument(skip(self))]
    pub async fn shutdown(self, drain_timeout: Duration) -> DrainStatus {
        self.shared.shutdown.request();
        for accept_loop in self.accept_loops {
            if let Err(e) = accept_loop.await {
                warn!(%e, "accept loop failed");
            }
        }
        if let Some(self_check) = self.self_check {
            let _ = self_check.await;
        }

        let status = self
            .shared
            .shutdown
            .drain(&self.shared.admission, drain_timeout)
            .await;
        match status {
            DrainStatus::Clean => info!("daemon stopped"),
            DrainStatus::Forced => warn!("daemon stopped after forced drain"),
        }
        status
    }
}

/// Cloneable control surface for signal handlers and tests.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
}

impl DaemonHandle {
    /// Rebuild and publish the database, waiting for the result.
    ///
    /// # Errors
    ///
    /// Returns the reload failure. The previous engine stays in service.
    pub async fn reload(&self) -> Result<ReloadOutcome, ReloadError> {
        self.shared.engines.reload().await
    }

    /// Start a reload without waiting for it.
    pub fn trigger_reload(&self) {
        self.shared.engines.trigger();
    }

    /// Ask the daemon to stop. `Daemon::run` returns once drained.
    pub fn shutdown(&self) {
        self.shared.shutdown.request();
    }

    #[must_use]
    pub fn current_engine(&self) -> Arc<Engine> {
        self.shared.engines.current()
    }

    #[must_use]
    pub fn live_engines(&self) -> usize {
        self.shared.engines.live_engines()
    }

    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared.admission.active()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.admission.queued()
    }
}

async fn accept_loop(listener: Listener, shared: Arc<Shared>) {
    let label = listener.to_string();
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.requested() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((connection, peer)) => {
                debug!(%peer, listener = %label, "accepted connection");
                let shared = Arc::clone(&shared);
                match connection {
                    Connection::Tcp(stream) => tokio::spawn(admit(stream, peer, shared)),
                    Connection::Local(stream) => tokio::spawn(admit(stream, peer, shared)),
                };
            }
            Err(e) => {
                warn!(%e, listener = %label, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    listener.close();
    info!(listener = %label, "stopped listening");
}

async fn admit<S>(stream: S, peer: Peer, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let slot = tokio::select! {
        biased;
        () = shared.shutdown.requested() => Err(Rejected::Closed),
        slot = shared.admission.acquire(shared.config.queue_timeout()) => slot,
    };

    match slot {
        Ok(slot) => worker::run(stream, peer, shared, slot).await,
        Err(rejected) => {
            warn!(%peer, %rejected, "connection rejected");
            let reply = match rejected {
                Rejected::Closed => Reply::Error("Server is shutting down".into()),
                Rejected::QueueFull | Rejected::TimedOut => Reply::Busy,
            };
            let mut framed = Framed::new(stream, ScanCodec::new(shared.config.stream_max_length));
            if let Err(e) = framed.send(reply).await {
                debug!(%peer, %e, "failed to send rejection");
            }
            let _ = framed.close().await;
        }
    }
}
