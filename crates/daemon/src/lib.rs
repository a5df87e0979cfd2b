//! Concurrent scan daemon.
//!
//! Accepts connections on TCP and local sockets, bounds concurrent workers,
//! speaks the line/chunk scan protocol, and hot-swaps the signature engine
//! without disturbing connections that already hold the previous one.

pub mod admission;
pub mod client;
pub mod protocol;
pub mod reload;
pub mod server;
pub mod shutdown;
pub mod target;
pub mod transport;
mod worker;

pub use admission::{AdmissionController, Rejected, WorkerSlot};
pub use client::{Client, Endpoint, ScanReply};
pub use protocol::{Command, Reply};
pub use reload::{ReloadCoordinator, ReloadError, ReloadOutcome};
pub use server::{Daemon, DaemonHandle, StartupError};
pub use shutdown::{DrainStatus, ShutdownCoordinator};
pub use transport::{ListenerSet, Peer};
