//! The convergence engine: one resource, one pass.
//!
//! resolve → render → compare → (backup) → write → ACL. Every step either
//! completes or fails the resource; nothing past a failed step runs. The
//! observed state is captured once up front and never refreshed mid-attempt.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::acl::{self, AccessControl, DesiredAcl, SystemAccessControl};
use crate::backup::BackupManager;
use crate::checksum::{ChecksumCache, Digest};
use crate::error::{Error, ErrorKind, Result};
use crate::locator::{self, Repository};
use crate::render::{PlaceholderRenderer, RenderContext, Renderer};
use crate::resource::{Action, ConvergenceResult, DesiredState, ObservedState};

/// Mode a freshly created file starts from, before the umask.
#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o666;

pub struct Converger {
    repo: Arc<dyn Repository>,
    renderer: Arc<dyn Renderer>,
    checksums: Arc<ChecksumCache>,
    backups: Arc<BackupManager>,
    access: Arc<dyn AccessControl>,
    node: toml::Table,
    dry_run: bool,
}

impl Converger {
    /// Engine with the built-in renderer, a fresh cache, backups beside their
    /// targets and the host's ownership/permission calls.
    pub fn new(repo: Arc<dyn Repository>, node: toml::Table) -> Self {
        Self {
            repo,
            renderer: Arc::new(PlaceholderRenderer),
            checksums: Arc::new(ChecksumCache::new()),
            backups: Arc::new(BackupManager::new(None)),
            access: Arc::new(SystemAccessControl),
            node,
            dry_run: false,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_checksums(mut self, checksums: Arc<ChecksumCache>) -> Self {
        self.checksums = checksums;
        self
    }

    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = backups;
        self
    }

    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Snapshot of `path` as it is right now.
    pub fn observe(&self, path: &Path) -> Result<ObservedState> {
        let Some(digest) = self.checksums.digest_of_file(path)? else {
            return Ok(ObservedState::absent());
        };
        let st = self.access.stat(path)?;
        Ok(ObservedState {
            exists: true,
            content_digest: Some(digest),
            owner: Some(st.uid),
            group: Some(st.gid),
            mode: Some(st.mode),
        })
    }

    pub fn converge(&self, desired: &DesiredState) -> Result<ConvergenceResult> {
        let path = desired.target_path.as_path();
        let span = tracing::info_span!("converge", path = %path.display());
        let _enter = span.enter();

        if desired.action == Action::Nothing {
            tracing::debug!("action is nothing; skipping");
            return Ok(ConvergenceResult::skipped());
        }

        // Existence alone decides create_if_missing; the file is never read.
        if desired.action == Action::CreateIfMissing && target_exists(path)? {
            tracing::debug!("file exists and action is create_if_missing; skipping");
            return Ok(ConvergenceResult::skipped());
        }
        let observed = self.observe(path)?;

        let source = locator::locate(desired, self.repo.as_ref())?;
        tracing::debug!(source = %source.display(), "resolved template");
        let ctx = RenderContext::new(&self.node, &desired.variables);
        let content = self.renderer.render(&source, &ctx)?;
        let wanted = Digest::of(&content);

        // Unknown users/groups fail here, before anything is touched.
        let desired_acl = DesiredAcl::resolve(
            self.access.as_ref(),
            desired.owner.as_ref(),
            desired.group.as_ref(),
            desired.mode,
        )?;

        let mut result = ConvergenceResult::default();
        if observed.content_digest == Some(wanted) {
            tracing::debug!(digest = %wanted, "content up to date");
        } else {
            if observed.exists {
                self.backup_before_overwrite(desired, &mut result)?;
            }
            if self.dry_run {
                tracing::info!(digest = %wanted, "would write content");
            } else {
                write_atomic(path, &content, &observed)?;
                tracing::info!(bytes = content.len(), digest = %wanted, "wrote content");
                if let Err(e) = self.checksums.record(path, wanted) {
                    tracing::warn!("failed to record digest: {e}");
                }
            }
            result.content_written = true;
        }

        result.acl = if self.dry_run && !observed.exists {
            desired_acl.all_managed()
        } else {
            acl::reconcile(self.access.as_ref(), path, &desired_acl, !self.dry_run)?
        };
        result.changed = result.content_written || result.acl.any();
        Ok(result)
    }

    fn backup_before_overwrite(
        &self,
        desired: &DesiredState,
        result: &mut ConvergenceResult,
    ) -> Result<()> {
        if desired.backup_retention == 0 {
            return Ok(());
        }
        if self.dry_run {
            tracing::info!(retention = desired.backup_retention, "would back up");
            result.backed_up = true;
            return Ok(());
        }
        if let Some(b) = self
            .backups
            .backup(&desired.target_path, desired.backup_retention)?
        {
            result.backed_up = true;
            result.backup_path = Some(b.path);
        }
        Ok(())
    }
}

fn target_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(true),
        Ok(_) => Err(Error::new(
            ErrorKind::IoFailure,
            format!("{} is not a regular file", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::new(
            ErrorKind::IoFailure,
            format!("failed to stat {}: {e}", path.display()),
        )),
    }
}

/// Replace `path` with `bytes` through a sibling temp file and a rename, so a
/// reader sees either the old bytes or the new ones. An existing file's mode
/// and ownership carry over to the replacement.
fn write_atomic(path: &Path, bytes: &[u8], observed: &ObservedState) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(write_failed(
            path,
            format!("enclosing directory {} does not exist", parent.display()),
        ));
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| write_failed(path, "invalid file name".into()))?;

    let mut tmp = temp_builder(&format!(".{file_name}."))
        .tempfile_in(parent)
        .map_err(|e| write_failed(path, format!("cannot create temp file: {e}")))?;
    carry_over_metadata(tmp.as_file(), observed)
        .map_err(|e| write_failed(path, format!("cannot prepare temp file: {e}")))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| write_failed(path, format!("cannot write temp file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| write_failed(path, format!("cannot rename into place: {}", e.error)))?;
    Ok(())
}

fn write_failed(path: &Path, why: String) -> Error {
    Error::new(
        ErrorKind::WriteFailed,
        format!("failed to write {}: {why}", path.display()),
    )
}

#[cfg(unix)]
fn temp_builder(prefix: &str) -> tempfile::Builder<'_, 'static> {
    use std::os::unix::fs::PermissionsExt;
    let mut b = tempfile::Builder::new();
    b.prefix(prefix)
        .suffix(".tmp")
        .permissions(fs::Permissions::from_mode(NEW_FILE_MODE));
    b
}

#[cfg(not(unix))]
fn temp_builder(prefix: &str) -> tempfile::Builder<'_, 'static> {
    let mut b = tempfile::Builder::new();
    b.prefix(prefix).suffix(".tmp");
    b
}

#[cfg(unix)]
fn carry_over_metadata(file: &fs::File, observed: &ObservedState) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    if !observed.exists {
        return Ok(());
    }
    let meta = file.metadata()?;
    let uid = observed.owner.filter(|u| *u != meta.uid());
    let gid = observed.group.filter(|g| *g != meta.gid());
    if (uid.is_some() || gid.is_some())
        && let Err(e) = std::os::unix::fs::fchown(file, uid, gid)
    {
        // Only root can hand a file to someone else; managed fields are fixed afterwards.
        tracing::debug!("cannot carry ownership over to the new file: {e}");
    }
    if let Some(mode) = observed.mode {
        file.set_permissions(fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn carry_over_metadata(_file: &fs::File, _observed: &ObservedState) -> io::Result<()> {
    Ok(())
}
