//! Core scanning types - configuration, signature database, engine.
//! No async dependencies.

pub mod config;
pub mod engine;
pub mod error;
pub mod signature;

pub use config::{Config, ListenerConfig, Transport};
pub use engine::{build, io_reason, DbOptions, Engine, EngineOptions, Limits};
pub use error::{BuildError, ConfigError, Result};

/// Outcome of evaluating one target against an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    /// Carries the matched signature name.
    Infected(String),
    /// Carries a short reason, e.g. `Size limit exceeded`.
    Error(String),
}

impl Verdict {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    #[must_use]
    pub const fn is_infected(&self) -> bool {
        matches!(self, Self::Infected(_))
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Matched signature name, if infected.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Infected(name) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_predicates() {
        assert!(Verdict::Clean.is_clean());
        assert!(Verdict::Infected("X".into()).is_infected());
        assert!(Verdict::Error("boom".into()).is_error());
        assert!(!Verdict::Error("boom".into()).is_clean());
    }

    #[test]
    fn signature_only_for_infected() {
        assert_eq!(Verdict::Infected("Eicar".into()).signature(), Some("Eicar"));
        assert_eq!(Verdict::Clean.signature(), None);
    }
}
