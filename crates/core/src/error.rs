use std::path::PathBuf;

pub type Result<T> = eyre::Result<T>;

/// Failure to load or compile a signature database.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("database directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),
    #[error("can't read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {reason}", .file.display())]
    Malformed {
        file: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("no signatures found in {}", .0.display())]
    NoSignatures(PathBuf),
    #[error("failed to compile signatures: {0}")]
    Compile(#[from] aho_corasick::BuildError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
