//! Per-connection protocol state machine.
//!
//! A worker binds to the engine published when it starts and keeps it for
//! the whole connection, whatever reloads happen meanwhile.

use std::path::PathBuf;
use std::sync::Arc;

use bulwark_core::{Engine, Verdict};
use bytes::BytesMut;
use futures_util::{stream, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::admission::WorkerSlot;
use crate::protocol::{Command, Frame, ProtocolError, Reply, ScanCodec, Stats};
use crate::server::Shared;
use crate::target::{self, Target};
use crate::transport::Peer;

const STREAM_TARGET: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    StopAtFirst,
    All,
}

struct Worker<S> {
    framed: Framed<S, ScanCodec>,
    peer: Peer,
    engine: Arc<Engine>,
    shared: Arc<Shared>,
    session: bool,
}

/// Serve one admitted connection until it closes. The slot is released on
/// return, including when the connection is cut short by a forced shutdown.
pub(crate) async fn run<S>(stream: S, peer: Peer, shared: Arc<Shared>, slot: WorkerSlot)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let shutdown = shared.shutdown.clone();
    let engine = shared.engines.current();
    debug!(%peer, build_id = %engine.build_id(), "connection started");

    let mut worker = Worker {
        framed: Framed::new(stream, ScanCodec::new(shared.config.stream_max_length)),
        peer,
        engine,
        shared,
        session: false,
    };

    tokio::select! {
        () = shutdown.killed() => warn!(%peer, "connection terminated by forced shutdown"),
        result = worker.serve() => match result {
            Ok(()) => debug!(%peer, "connection closed"),
            Err(e) => debug!(%peer, %e, "connection closed with error"),
        },
    }
    drop(slot);
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn serve(&mut self) -> Result<(), ProtocolError> {
        let idle = self.shared.config.idle_timeout();
        loop {
            let shutdown = self.shared.shutdown.clone();
            let next = tokio::select! {
                biased;
                () = shutdown.requested() => {
                    debug!(peer = %self.peer, "closing idle connection for shutdown");
                    return Ok(());
                }
                next = timeout(idle, self.framed.next()) => next,
            };

            let command = match next {
                Err(_) => {
                    debug!(peer = %self.peer, "idle timeout");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return self.fail(e).await,
                Ok(Some(Ok(Frame::Command(command)))) => command,
                Ok(Some(Ok(_))) => return self.fail(ProtocolError::UnexpectedFrame).await,
            };

            debug!(peer = %self.peer, command = command.keyword(), "command received");
            if self.handle(command).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<Flow, ProtocolError> {
        let single_shot = command.is_single_shot();
        match command {
            Command::Ping => self.framed.send(Reply::Pong).await?,
            Command::Version => {
                let reply = Reply::Version {
                    build_id: self.engine.build_id().to_string(),
                    signature_count: self.engine.signature_count(),
                };
                self.framed.send(reply).await?;
            }
            Command::Stats => {
                let stats = self.stats();
                self.framed.send(Reply::Stats(stats)).await?;
            }
            Command::Reload => {
                info!(peer = %self.peer, "reload requested by client");
                self.shared.engines.trigger();
                self.framed.send(Reply::Reload).await?;
            }
            Command::Shutdown => {
                info!(peer = %self.peer, "shutdown requested by client");
                self.shared.shutdown.request();
                return Ok(Flow::Close);
            }
            Command::Session => self.session = true,
            Command::End => return Ok(Flow::Close),
            Command::Instream => self.instream().await?,
            Command::Scan(path) => self.scan_path(path, WalkMode::StopAtFirst).await?,
            Command::ContScan(path) => self.scan_path(path, WalkMode::All).await?,
            Command::MultiScan(path) => self.multiscan(path).await?,
            Command::Unknown(line) => {
                debug!(peer = %self.peer, command = %line, "unknown command");
                self.framed.send(Reply::UnknownCommand).await?;
                return Ok(Flow::Close);
            }
        }

        if single_shot && !self.session {
            Ok(Flow::Close)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// Tell the client what went wrong, if it can still hear it.
    async fn fail(&mut self, e: ProtocolError) -> Result<(), ProtocolError> {
        if let Some(message) = e.client_message() {
            warn!(peer = %self.peer, %e, "protocol error");
            let _ = self.framed.send(Reply::Error(message)).await;
        }
        Err(e)
    }

    async fn instream(&mut self) -> Result<(), ProtocolError> {
        let read_timeout = self.shared.config.read_timeout();
        self.framed.codec_mut().begin_stream();

        let mut data = BytesMut::new();
        loop {
            let frame = match timeout(read_timeout, self.framed.next()).await {
                Err(_) => return self.fail(ProtocolError::ReadTimeout).await,
                Ok(None) => return Err(ProtocolError::Disconnected),
                Ok(Some(Err(e))) => return self.fail(e).await,
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Frame::Chunk(chunk) => data.extend_from_slice(&chunk),
                Frame::StreamEnd => break,
                Frame::Command(_) => return self.fail(ProtocolError::UnexpectedFrame).await,
            }
        }

        debug!(peer = %self.peer, bytes = data.len(), "stream received");
        let engine = Arc::clone(&self.engine);
        let data = data.freeze();
        let verdict = tokio::task::spawn_blocking(move || engine.scan_bytes(&data))
            .await
            .unwrap_or_else(|e| Verdict::Error(format!("Scan task failed: {e}")));
        self.send_verdict(STREAM_TARGET.to_string(), verdict).await
    }

    async fn scan_path(&mut self, path: PathBuf, mode: WalkMode) -> Result<(), ProtocolError> {
        let Some(targets) = self.expand(path).await? else {
            return Ok(());
        };

        for target in targets {
            let (path, verdict) = target::evaluate(Arc::clone(&self.engine), target).await;
            let stop = mode == WalkMode::StopAtFirst && verdict.is_infected();
            self.send_verdict(path.display().to_string(), verdict).await?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    async fn multiscan(&mut self, path: PathBuf) -> Result<(), ProtocolError> {
        let Some(targets) = self.expand(path).await? else {
            return Ok(());
        };

        let engine = Arc::clone(&self.engine);
        let fanout = self.shared.config.multiscan_fanout();
        let mut results = stream::iter(targets)
            .map(|target| target::evaluate(Arc::clone(&engine), target))
            .buffered(fanout);
        while let Some((path, verdict)) = results.next().await {
            self.send_verdict(path.display().to_string(), verdict).await?;
        }
        Ok(())
    }

    /// Resolve a path argument into targets. `None` when a reply has already
    /// been sent instead: a relative path, or an empty directory.
    async fn expand(&mut self, path: PathBuf) -> Result<Option<Vec<Target>>, ProtocolError> {
        let shown = path.display().to_string();
        if !path.is_absolute() {
            let verdict = Verdict::Error("Path must be absolute".into());
            self.send_verdict(shown, verdict).await?;
            return Ok(None);
        }

        let targets = tokio::task::spawn_blocking(move || target::expand(&path))
            .await
            .unwrap_or_default();
        if targets.is_empty() {
            self.send_verdict(shown, Verdict::Clean).await?;
            return Ok(None);
        }
        Ok(Some(targets))
    }

    async fn send_verdict(&mut self, target: String, verdict: Verdict) -> Result<(), ProtocolError> {
        let peer = self.peer;
        match &verdict {
            Verdict::Infected(signature) => {
                warn!(%peer, target = %target, %signature, "infected");
            }
            Verdict::Error(reason) => info!(%peer, target = %target, %reason, "scan error"),
            Verdict::Clean if self.shared.config.log_clean => info!(%peer, target = %target, "clean"),
            Verdict::Clean => debug!(%peer, target = %target, "clean"),
        }
        self.framed.send(Reply::Verdict { target, verdict }).await
    }

    fn stats(&self) -> Stats {
        let admission = &self.shared.admission;
        let published = self.shared.engines.current();
        Stats {
            threads_live: admission.active(),
            threads_max: admission.max_threads(),
            queued: admission.queued(),
            engines_live: self.shared.engines.live_engines(),
            build_id: published.build_id().to_string(),
            signature_count: published.signature_count(),
        }
    }
}
