//! Compiled signature engine.
//!
//! An `Engine` is an immutable snapshot of the signature database. It is
//! built once, shared behind `Arc` by every worker that captured it, and
//! dropped when the last of them lets go.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use aho_corasick::AhoCorasick;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::error::BuildError;
use crate::signature::{self, Fingerprint, Offset, StagedDatabase};
use crate::Verdict;

const SIZE_LIMIT_REASON: &str = "Size limit exceeded";

/// Optional signature categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbOptions {
    pub phishing: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self { phishing: true }
    }
}

/// Bounds applied to every scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_file_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub db: DbOptions,
    pub limits: Limits,
}

#[derive(Debug)]
struct HashEntry {
    size: Option<u64>,
    name: String,
}

pub struct Engine {
    build_id: String,
    signature_count: usize,
    bodies: AhoCorasick,
    body_meta: Vec<(String, Offset)>,
    hashes: HashMap<[u8; 32], Vec<HashEntry>>,
    limits: Limits,
    fingerprint: Fingerprint,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("build_id", &self.build_id)
            .field("signature_count", &self.signature_count)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Load and compile the database in `dir`.
///
/// # Errors
///
/// Returns a `BuildError` if staging or compilation fails.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn build(dir: &Path, options: &EngineOptions) -> Result<Engine, BuildError> {
    let staged = signature::stage(dir, &options.db)?;
    debug!(signatures = staged.signature_count(), "database staged");
    let engine = Engine::compile(staged, options.limits)?;
    info!(
        build_id = %engine.build_id,
        signatures = engine.signature_count,
        "engine compiled"
    );
    Ok(engine)
}

impl Engine {
    /// Compile a staged database into a query-ready engine.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Compile` if the pattern automaton cannot be built.
    pub fn compile(staged: StagedDatabase, limits: Limits) -> Result<Self, BuildError> {
        let signature_count = staged.signature_count();
        let bodies = AhoCorasick::new(staged.bodies.iter().map(|s| &s.pattern))?;
        let body_meta = staged
            .bodies
            .into_iter()
            .map(|s| (s.name, s.offset))
            .collect();

        let mut hashes: HashMap<[u8; 32], Vec<HashEntry>> = HashMap::new();
        for sig in staged.hashes {
            hashes.entry(sig.digest).or_default().push(HashEntry {
                size: sig.size,
                name: sig.name,
            });
        }

        Ok(Self {
            build_id: format!("bulwark-{}/{}", env!("CARGO_PKG_VERSION"), staged.digest),
            signature_count,
            bodies,
            body_meta,
            hashes,
            limits,
            fingerprint: staged.fingerprint,
        })
    }

    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    #[must_use]
    pub const fn signature_count(&self) -> usize {
        self.signature_count
    }

    #[must_use]
    pub const fn limits(&self) -> Limits {
        self.limits
    }

    /// Fingerprint of the database files this engine was built from.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Evaluate an in-memory target.
    #[must_use]
    pub fn scan_bytes(&self, data: &[u8]) -> Verdict {
        if data.len() as u64 > self.limits.max_file_size {
            return Verdict::Error(SIZE_LIMIT_REASON.into());
        }
        if let Some(name) = self.match_body(data) {
            return Verdict::Infected(name.to_string());
        }
        if let Some(name) = self.match_hash(data) {
            return Verdict::Infected(name.to_string());
        }
        Verdict::Clean
    }

    /// Read and evaluate a file. Read failures become `Verdict::Error`.
    #[must_use]
    pub fn scan_file(&self, path: &Path) -> Verdict {
        match self.read_bounded(path) {
            Ok(Some(data)) => self.scan_bytes(&data),
            Ok(None) => Verdict::Error(SIZE_LIMIT_REASON.into()),
            Err(e) => Verdict::Error(io_reason(&e)),
        }
    }

    /// `Ok(None)` when the file is larger than the size limit.
    fn read_bounded(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Not a regular file",
            ));
        }
        let max = self.limits.max_file_size;
        if meta.len() > max {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(usize::try_from(meta.len()).unwrap_or(0));
        // the file may grow between stat and read
        File::open(path)?
            .take(max.saturating_add(1))
            .read_to_end(&mut data)?;
        if data.len() as u64 > max {
            return Ok(None);
        }
        Ok(Some(data))
    }

    fn match_body(&self, data: &[u8]) -> Option<&str> {
        self.bodies.find_overlapping_iter(data).find_map(|m| {
            let (name, offset) = &self.body_meta[m.pattern().as_usize()];
            match offset {
                Offset::Any => Some(name.as_str()),
                Offset::Absolute(at) if *at == m.start() => Some(name.as_str()),
                Offset::Absolute(_) => None,
            }
        })
    }

    fn match_hash(&self, data: &[u8]) -> Option<&str> {
        if self.hashes.is_empty() {
            return None;
        }
        let digest: [u8; 32] = Sha256::digest(data).into();
        let size = data.len() as u64;
        self.hashes
            .get(&digest)?
            .iter()
            .find(|e| e.size.is_none_or(|s| s == size))
            .map(|e| e.name.as_str())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        debug!(build_id = %self.build_id, "engine released");
    }
}

/// Short client-facing description of an I/O failure.
#[must_use]
pub fn io_reason(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => "No such file or directory".into(),
        io::ErrorKind::PermissionDenied => "Access denied".into(),
        _ => e.to_string(),
    }
}
