//! Signature database staging: read and parse the database directory.
//!
//! Supported files (non-recursive, everything else is ignored):
//! - `*.ndb` body signatures: `Name:TargetType:Offset:HexBytes`
//! - `*.pdb` phishing body signatures, same format, optional category
//! - `*.hsb` hash signatures: `Sha256Hex:Size:Name`
//!
//! Blank lines and lines starting with `#` are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::engine::DbOptions;
use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbKind {
    Body,
    Phishing,
    Hash,
}

impl DbKind {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "ndb" => Some(Self::Body),
            "pdb" => Some(Self::Phishing),
            "hsb" => Some(Self::Hash),
            _ => None,
        }
    }
}

/// Where a body signature must start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Any,
    Absolute(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodySignature {
    pub name: String,
    pub offset: Offset,
    pub pattern: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSignature {
    pub name: String,
    pub digest: [u8; 32],
    pub size: Option<u64>,
}

/// Identity of the database files on disk, used to detect changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint(BTreeMap<String, (u64, Option<SystemTime>)>);

/// Parsed but not yet compiled database.
#[derive(Debug, Clone)]
pub struct StagedDatabase {
    pub bodies: Vec<BodySignature>,
    pub hashes: Vec<HashSignature>,
    /// Short content digest over every loaded file.
    pub digest: String,
    pub fingerprint: Fingerprint,
}

impl StagedDatabase {
    #[must_use]
    pub fn signature_count(&self) -> usize {
        self.bodies.len() + self.hashes.len()
    }
}

fn database_files(dir: &Path) -> Result<Vec<(PathBuf, DbKind)>, BuildError> {
    if !dir.is_dir() {
        return Err(BuildError::MissingDirectory(dir.to_path_buf()));
    }

    let io_err = |source| BuildError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(kind) = DbKind::of(&path) {
            files.push((path, kind));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Fingerprint every database file in `dir` by name, size and mtime.
///
/// # Errors
///
/// Returns an error if the directory is missing or unreadable.
pub fn fingerprint(dir: &Path) -> Result<Fingerprint, BuildError> {
    let mut map = BTreeMap::new();
    for (path, _) in database_files(dir)? {
        let meta = std::fs::metadata(&path).map_err(|source| BuildError::Io {
            path: path.clone(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        map.insert(name, (meta.len(), meta.modified().ok()));
    }
    Ok(Fingerprint(map))
}

/// Parse every database file in `dir`.
///
/// # Errors
///
/// Returns an error if the directory is missing, a file cannot be read, a
/// line is malformed, or no signature was found.
pub fn stage(dir: &Path, options: &DbOptions) -> Result<StagedDatabase, BuildError> {
    let fingerprint = fingerprint(dir)?;
    let mut bodies = Vec::new();
    let mut hashes = Vec::new();
    let mut hasher = Sha256::new();

    for (path, kind) in database_files(dir)? {
        if kind == DbKind::Phishing && !options.phishing {
            debug!(file = %path.display(), "skipping phishing signatures");
            continue;
        }

        let content = std::fs::read_to_string(&path).map_err(|source| BuildError::Io {
            path: path.clone(),
            source,
        })?;
        hasher.update(path.file_name().map(|n| n.as_encoded_bytes()).unwrap_or_default());
        hasher.update(content.as_bytes());

        let before = bodies.len() + hashes.len();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = match kind {
                DbKind::Body | DbKind::Phishing => parse_body(line).map(|s| bodies.push(s)),
                DbKind::Hash => parse_hash(line).map(|s| hashes.push(s)),
            };
            parsed.map_err(|reason| BuildError::Malformed {
                file: path.clone(),
                line: idx + 1,
                reason,
            })?;
        }
        trace!(
            file = %path.display(),
            signatures = bodies.len() + hashes.len() - before,
            "staged database file"
        );
    }

    if bodies.is_empty() && hashes.is_empty() {
        return Err(BuildError::NoSignatures(dir.to_path_buf()));
    }

    let digest = hex::encode(&hasher.finalize()[..4]);
    Ok(StagedDatabase {
        bodies,
        hashes,
        digest,
        fingerprint,
    })
}

fn parse_body(line: &str) -> Result<BodySignature, String> {
    let fields: Vec<&str> = line.splitn(4, ':').collect();
    let [name, target, offset, body] = fields[..] else {
        return Err("expected Name:TargetType:Offset:HexBytes".into());
    };

    if name.is_empty() {
        return Err("empty signature name".into());
    }
    target
        .parse::<u32>()
        .map_err(|_| format!("invalid target type {target:?}"))?;
    let offset = match offset {
        "*" => Offset::Any,
        n => Offset::Absolute(n.parse().map_err(|_| format!("invalid offset {n:?}"))?),
    };
    let pattern = hex::decode(body).map_err(|e| format!("invalid hex body: {e}"))?;
    if pattern.is_empty() {
        return Err("empty signature body".into());
    }

    Ok(BodySignature {
        name: name.to_string(),
        offset,
        pattern,
    })
}

fn parse_hash(line: &str) -> Result<HashSignature, String> {
    let fields: Vec<&str> = line.splitn(3, ':').collect();
    let [digest_hex, size, name] = fields[..] else {
        return Err("expected Sha256Hex:Size:Name".into());
    };

    let mut digest = [0u8; 32];
    hex::decode_to_slice(digest_hex, &mut digest)
        .map_err(|e| format!("invalid sha256 digest: {e}"))?;
    let size = match size {
        "*" => None,
        n => Some(n.parse().map_err(|_| format!("invalid size {n:?}"))?),
    };
    if name.is_empty() {
        return Err("empty signature name".into());
    }

    Ok(HashSignature {
        name: name.to_string(),
        digest,
        size,
    })
}
