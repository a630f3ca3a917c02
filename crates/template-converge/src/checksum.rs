//! Content digests and the run-wide digest cache.
//!
//! File digests are cached by a fingerprint of the file's identity and
//! metadata (path, device/inode, length, modification time). Entries are never
//! invalidated during a run; a rewrite produces a new inode and mtime, so it
//! lands on a fresh key. The engine also records the digest of bytes it writes
//! so the following resource on the same path hits the cache.
//!
//! The cache is shared by reference between worker threads. Two threads that
//! hash the same file concurrently both insert; the values are identical, so
//! the last writer winning is harmless.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use filetime::FileTime;
use sha2::Sha256;

use crate::error::{Error, ErrorKind, Result};

/// SHA-256 of a byte stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        use sha2::Digest as _;
        Self(Sha256::digest(bytes).into())
    }

    pub fn of_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        use sha2::Digest as _;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileFingerprint {
    path: PathBuf,
    dev: u64,
    ino: u64,
    len: u64,
    mtime_secs: i64,
    mtime_nanos: u32,
}

impl FileFingerprint {
    fn from_metadata(path: &Path, meta: &fs::Metadata) -> Self {
        let (dev, ino) = file_identity(meta);
        let mtime = FileTime::from_last_modification_time(meta);
        Self {
            path: path.to_path_buf(),
            dev,
            ino,
            len: meta.len(),
            mtime_secs: mtime.unix_seconds(),
            mtime_nanos: mtime.nanoseconds(),
        }
    }
}

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &fs::Metadata) -> (u64, u64) {
    (0, 0)
}

#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: RwLock<HashMap<FileFingerprint, Digest>>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of the file at `path`, or `None` if it does not exist.
    pub fn digest_of_file(&self, path: &Path) -> Result<Option<Digest>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::IoFailure,
                    format!("failed to stat {}: {e}", path.display()),
                ));
            }
        };
        if !meta.is_file() {
            return Err(Error::new(
                ErrorKind::IoFailure,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let key = FileFingerprint::from_metadata(path, &meta);
        if let Some(hit) = self.lookup(&key) {
            tracing::trace!(path = %path.display(), "checksum cache hit");
            return Ok(Some(hit));
        }

        let file = fs::File::open(path).map_err(|e| {
            Error::new(
                ErrorKind::IoFailure,
                format!("failed to open {}: {e}", path.display()),
            )
        })?;
        let digest = Digest::of_reader(file).map_err(|e| {
            Error::new(
                ErrorKind::IoFailure,
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        self.insert(key, digest);
        Ok(Some(digest))
    }

    /// Remember that the file now at `path` hashes to `digest`.
    pub fn record(&self, path: &Path, digest: Digest) -> Result<()> {
        let meta = fs::metadata(path).map_err(|e| {
            Error::new(
                ErrorKind::IoFailure,
                format!("failed to stat {}: {e}", path.display()),
            )
        })?;
        self.insert(FileFingerprint::from_metadata(path, &meta), digest);
        Ok(())
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.entries.write() {
            g.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &FileFingerprint) -> Option<Digest> {
        self.entries.read().ok()?.get(key).copied()
    }

    fn insert(&self, key: FileFingerprint, digest: Digest) {
        if let Ok(mut g) = self.entries.write() {
            g.insert(key, digest);
        }
    }
}
