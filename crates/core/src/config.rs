//! Runtime configuration for the bulwark daemon.
//!
//! Built once at startup (TOML file plus command-line overrides) and shared
//! read-only by every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{DbOptions, EngineOptions, Limits};
use crate::error::ConfigError;

const DEFAULT_DATABASE_DIR: &str = "/var/lib/bulwark";
const DEFAULT_MAX_THREADS: usize = 10;
const DEFAULT_BACKLOG: u32 = 200;
const DEFAULT_SOCKET_MODE: u32 = 0o660;
const MIB: u64 = 1024 * 1024;

/// Endpoint kind and bind target of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Transport {
    /// `host:port`, resolved at bind time.
    Tcp { address: String },
    /// Filesystem socket path with the permission bits applied after bind.
    Local {
        path: PathBuf,
        #[serde(default = "default_socket_mode")]
        mode: u32,
    },
}

/// One listening endpoint. Fixed for the daemon's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl ListenerConfig {
    #[must_use]
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Tcp {
                address: address.into(),
            },
            backlog: DEFAULT_BACKLOG,
        }
    }

    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            transport: Transport::Local {
                path: path.into(),
                mode: DEFAULT_SOCKET_MODE,
            },
            backlog: DEFAULT_BACKLOG,
        }
    }
}

const fn default_socket_mode() -> u32 {
    DEFAULT_SOCKET_MODE
}

const fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_directory: PathBuf,
    /// Load `*.pdb` phishing signatures.
    pub detect_phishing: bool,
    pub listeners: Vec<ListenerConfig>,
    /// Maximum concurrently active workers. 0 selects the default.
    pub max_threads: usize,
    /// Maximum connections waiting for a worker slot.
    pub max_queue: usize,
    pub queue_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub stream_max_length: u64,
    pub max_file_size: u64,
    /// MULTISCAN parallelism. 0 selects the available parallelism.
    pub multiscan_fanout: usize,
    pub drain_timeout_secs: u64,
    /// Database change polling interval. 0 disables it.
    pub self_check_secs: u64,
    pub log_clean: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_directory: PathBuf::from(DEFAULT_DATABASE_DIR),
            detect_phishing: true,
            listeners: Vec::new(),
            max_threads: 0,
            max_queue: 100,
            queue_timeout_secs: 5,
            idle_timeout_secs: 30,
            read_timeout_secs: 120,
            stream_max_length: 25 * MIB,
            max_file_size: 25 * MIB,
            multiscan_fanout: 0,
            drain_timeout_secs: 10,
            self_check_secs: 600,
            log_clean: false,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject settings the daemon cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.database_directory.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "database_directory must be an absolute path, got {}",
                self.database_directory.display()
            )));
        }
        if self.stream_max_length == 0 {
            return Err(ConfigError::Invalid(
                "stream_max_length must be greater than zero".into(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "read_timeout_secs must be greater than zero".into(),
            ));
        }
        for listener in &self.listeners {
            match &listener.transport {
                Transport::Local { path, .. } if path.as_os_str().is_empty() => {
                    return Err(ConfigError::Invalid("local listener path is empty".into()));
                }
                Transport::Tcp { address } if address.is_empty() => {
                    return Err(ConfigError::Invalid("tcp listener address is empty".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn max_threads(&self) -> usize {
        if self.max_threads == 0 {
            DEFAULT_MAX_THREADS
        } else {
            self.max_threads
        }
    }

    #[must_use]
    pub fn multiscan_fanout(&self) -> usize {
        if self.multiscan_fanout > 0 {
            return self.multiscan_fanout;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    #[must_use]
    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// `None` when the self-check is disabled.
    #[must_use]
    pub const fn self_check_interval(&self) -> Option<Duration> {
        if self.self_check_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.self_check_secs))
        }
    }

    #[must_use]
    pub const fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            db: DbOptions {
                phishing: self.detect_phishing,
            },
            limits: Limits {
                max_file_size: self.max_file_size,
            },
        }
    }
}
