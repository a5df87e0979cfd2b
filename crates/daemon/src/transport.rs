//! Listening endpoints: TCP and local sockets.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bulwark_core::{ListenerConfig, Transport};
use interprocess::local_socket::traits::tokio::Listener as _;
use interprocess::local_socket::{prelude::*, GenericFilePath, ListenerOptions};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::server::StartupError;

/// Identity of the remote end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Tcp(SocketAddr),
    Local,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// An accepted, not yet admitted connection.
pub enum Connection {
    Tcp(TcpStream),
    Local(interprocess::local_socket::tokio::Stream),
}

fn socket_name(path: &Path) -> io::Result<interprocess::local_socket::Name<'_>> {
    path.to_fs_name::<GenericFilePath>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub enum Listener {
    Tcp(TcpListener),
    Local {
        listener: interprocess::local_socket::tokio::Listener,
        path: PathBuf,
    },
}

impl Listener {
    /// Bind one endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved or bound, or a live
    /// server already owns the socket path.
    pub async fn bind(config: &ListenerConfig) -> io::Result<Self> {
        match &config.transport {
            Transport::Tcp { address } => bind_tcp(address, config.backlog).await,
            Transport::Local { path, mode } => bind_local(path, *mode),
        }
    }

    /// # Errors
    ///
    /// Returns an error if accepting fails. The listener stays usable.
    pub async fn accept(&self) -> io::Result<(Connection, Peer)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Connection::Tcp(stream), Peer::Tcp(addr)))
            }
            Self::Local { listener, .. } => {
                let stream = listener.accept().await?;
                Ok((Connection::Local(stream), Peer::Local))
            }
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Local { .. } => None,
        }
    }

    /// Stop listening and remove the socket file of a local listener.
    pub fn close(self) {
        if let Self::Local { listener, path } = self {
            drop(listener);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(%e, path = %path.display(), "failed to remove socket file"),
            }
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp:{addr}"),
                Err(_) => f.write_str("tcp:?"),
            },
            Self::Local { path, .. } => write!(f, "local:{}", path.display()),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener")
            .field(&format_args!("{self}"))
            .finish()
    }
}

async fn bind_tcp(address: &str, backlog: u32) -> io::Result<Listener> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        match socket.bind(addr).and_then(|()| socket.listen(backlog)) {
            Ok(listener) => return Ok(Listener::Tcp(listener)),
            Err(e) => {
                debug!(%e, %addr, "bind attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve to any address"),
        )
    }))
}

fn bind_local(path: &Path, mode: u32) -> io::Result<Listener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        // a socket that still accepts belongs to a running server
        if interprocess::local_socket::Stream::connect(socket_name(path)?).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is in use by a running server", path.display()),
            ));
        }
        info!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path)?;
    }

    let listener = ListenerOptions::new()
        .name(socket_name(path)?)
        .create_tokio()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(Listener::Local {
        listener,
        path: path.to_path_buf(),
    })
}

/// Every endpoint that bound successfully. Never empty.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// Bind each configured endpoint. Individual failures are logged and
    /// skipped as long as one endpoint binds.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::NoListenersConfigured` for an empty list and
    /// `StartupError::NoListenerBound` if every bind failed.
    pub async fn bind(configs: &[ListenerConfig]) -> Result<Self, StartupError> {
        if configs.is_empty() {
            return Err(StartupError::NoListenersConfigured);
        }

        let mut listeners = Vec::with_capacity(configs.len());
        for config in configs {
            match Listener::bind(config).await {
                Ok(listener) => {
                    info!(listener = %listener, backlog = config.backlog, "listening");
                    listeners.push(listener);
                }
                Err(e) => warn!(%e, transport = ?config.transport, "failed to bind listener"),
            }
        }

        if listeners.is_empty() {
            return Err(StartupError::NoListenerBound);
        }
        Ok(Self { listeners })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Bound TCP addresses, with any ephemeral ports resolved.
    #[must_use]
    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::local_addr).collect()
    }
}

impl IntoIterator for ListenerSet {
    type Item = Listener;
    type IntoIter = std::vec::IntoIter<Listener>;

    fn into_iter(self) -> Self::IntoIter {
        self.listeners.into_iter()
    }
}
