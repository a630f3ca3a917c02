//! Pre-overwrite backups with bounded retention.
//!
//! A backup of `/etc/foo.conf` is named `foo.conf.bak-<stamp>` where the stamp
//! is `YYYYmmddHHMMSS` followed by six digits of microseconds (UTC). Stamps are
//! fixed width, so lexical order is chronological order. Backups live beside
//! the target, or under `backup_dir` mirroring the target's absolute path.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use filetime::FileTime;

use crate::error::{Error, ErrorKind, Result};

const BACKUP_MARKER: &str = ".bak-";
const STAMP_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    pub path: PathBuf,
    pub pruned: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct BackupManager {
    backup_dir: Option<PathBuf>,
    // One mutex per target path; stamping and pruning for a path never interleave.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl BackupManager {
    pub fn new(backup_dir: Option<PathBuf>) -> Self {
        Self {
            backup_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Copy the current bytes of `path` aside, then prune to `retention` copies.
    /// Returns `None` without touching anything when `retention == 0`.
    pub fn backup(&self, path: &Path, retention: usize) -> Result<Option<BackupResult>> {
        if retention == 0 {
            tracing::debug!(path = %path.display(), "backup retention is 0; skipping backup");
            return Ok(None);
        }

        let lock = self.path_lock(path);
        let _guard = lock
            .lock()
            .map_err(|_| backup_failed(path, "backup lock poisoned"))?;

        let src_meta = fs::metadata(path)
            .map_err(|e| backup_failed(path, &format!("cannot stat source: {e}")))?;
        if !src_meta.is_file() {
            return Err(backup_failed(path, "source is not a regular file"));
        }

        let (dir, prefix) = self.location(path)?;
        fs::create_dir_all(&dir).map_err(|e| {
            backup_failed(path, &format!("cannot create {}: {e}", dir.display()))
        })?;

        let existing = list_in(&dir, &prefix)?;
        let stamp = next_stamp(Utc::now(), existing.last().map(|(s, _)| s.as_str()));
        let dst = dir.join(format!("{prefix}{stamp}"));

        if let Err(e) = fs::copy(path, &dst) {
            let _ = fs::remove_file(&dst);
            return Err(backup_failed(
                path,
                &format!("cannot copy to {}: {e}", dst.display()),
            ));
        }
        let mtime = FileTime::from_last_modification_time(&src_meta);
        if let Err(e) = filetime::set_file_mtime(&dst, mtime) {
            tracing::warn!(backup = %dst.display(), "failed to preserve mtime on backup: {e}");
        }
        tracing::info!(path = %path.display(), backup = %dst.display(), "backed up file");

        let mut all: Vec<PathBuf> = existing.into_iter().map(|(_, p)| p).collect();
        all.push(dst.clone());
        let pruned = prune(&mut all, retention);
        Ok(Some(BackupResult { path: dst, pruned }))
    }

    /// Existing backups of `path`, oldest first.
    pub fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let (dir, prefix) = self.location(path)?;
        Ok(list_in(&dir, &prefix)?
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    fn location(&self, path: &Path) -> Result<(PathBuf, String)> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| backup_failed(path, "target has no usable file name"))?;
        let prefix = format!("{name}{BACKUP_MARKER}");

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let dir = match &self.backup_dir {
            None => parent.to_path_buf(),
            Some(root) => {
                let mirrored: PathBuf = parent
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect();
                root.join(mirrored)
            }
        };
        Ok((dir, prefix))
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut g = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(g.entry(path.to_path_buf()).or_default())
    }
}

fn backup_failed(path: &Path, why: &str) -> Error {
    Error::new(
        ErrorKind::BackupFailed,
        format!("failed to back up {}: {why}", path.display()),
    )
}

// (stamp, path) pairs sorted oldest first.
fn list_in(dir: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            Error::new(
                ErrorKind::BackupFailed,
                format!("failed to list backups in {}: {e}", dir.display()),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(stamp) = name.strip_prefix(prefix) else {
            continue;
        };
        if parse_stamp(stamp).is_none() {
            continue;
        }
        out.push((stamp.to_string(), entry.path().to_path_buf()));
    }
    out.sort();
    Ok(out)
}

// Deletes the oldest entries of `all` (sorted oldest first) beyond `retention`.
fn prune(all: &mut Vec<PathBuf>, retention: usize) -> Vec<PathBuf> {
    let excess = all.len().saturating_sub(retention);
    let mut removed = Vec::with_capacity(excess);
    for old in all.drain(..excess) {
        match fs::remove_file(&old) {
            Ok(()) => {
                tracing::debug!(backup = %old.display(), "pruned old backup");
                removed.push(old);
            }
            Err(e) => tracing::warn!(backup = %old.display(), "failed to prune backup: {e}"),
        }
    }
    removed
}

fn format_stamp(micros: i64) -> Option<String> {
    let at = DateTime::<Utc>::from_timestamp_micros(micros)?;
    Some(format!(
        "{}{:06}",
        at.format("%Y%m%d%H%M%S"),
        micros.rem_euclid(1_000_000)
    ))
}

fn parse_stamp(stamp: &str) -> Option<i64> {
    if stamp.len() != STAMP_LEN || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(field(0..4)? as i32, field(4..6)?, field(6..8)?)?;
    let at = date.and_hms_opt(field(8..10)?, field(10..12)?, field(12..14)?)?;
    let micros: i64 = stamp[14..].parse().ok()?;
    Some(at.and_utc().timestamp_micros() + micros)
}

// Stamp for `now`, bumped past `latest` so names stay strictly increasing even
// when the clock is coarse or steps backwards.
fn next_stamp(now: DateTime<Utc>, latest: Option<&str>) -> String {
    let mut micros = now.timestamp_micros();
    if let Some(prev) = latest.and_then(parse_stamp) {
        micros = micros.max(prev + 1);
    }
    format_stamp(micros).unwrap_or_else(|| format!("{:0width$}", micros, width = STAMP_LEN))
}
