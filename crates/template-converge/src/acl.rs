//! Owner, group and permission-bit convergence for a single file.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result, acl_error_kind};
use crate::resource::{FileMode, Principal};

/// Which ACL fields were (or, in a dry run, would be) changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AclChanges {
    pub owner: bool,
    pub group: bool,
    pub mode: bool,
}

impl AclChanges {
    pub fn any(&self) -> bool {
        self.owner || self.group || self.mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclState {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only (`& 0o7777`).
    pub mode: u32,
}

/// OS primitives the enforcer needs.
pub trait AccessControl: Send + Sync {
    fn stat(&self, path: &Path) -> Result<AclState>;
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;
    fn user_id(&self, name: &str) -> Result<u32>;
    fn group_id(&self, name: &str) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccessControl;

#[cfg(unix)]
impl AccessControl for SystemAccessControl {
    fn stat(&self, path: &Path) -> Result<AclState> {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::metadata(path).map_err(|e| {
            Error::new(
                ErrorKind::IoFailure,
                format!("failed to stat {}: {e}", path.display()),
            )
        })?;
        Ok(AclState {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & FileMode::MASK,
        })
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::chown(path, uid, gid).map_err(|e| {
            Error::new(
                acl_error_kind(&e),
                format!("failed to change ownership of {}: {e}", path.display()),
            )
        })
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            Error::new(
                acl_error_kind(&e),
                format!("failed to set mode on {}: {e}", path.display()),
            )
        })
    }

    fn user_id(&self, name: &str) -> Result<u32> {
        passwd::user_id(name)
    }

    fn group_id(&self, name: &str) -> Result<u32> {
        passwd::group_id(name)
    }
}

#[cfg(not(unix))]
impl AccessControl for SystemAccessControl {
    fn stat(&self, path: &Path) -> Result<AclState> {
        let meta = fs::metadata(path).map_err(|e| {
            Error::new(
                ErrorKind::IoFailure,
                format!("failed to stat {}: {e}", path.display()),
            )
        })?;
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        Ok(AclState { uid: 0, gid: 0, mode })
    }

    fn chown(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        Err(Error::new(
            ErrorKind::PermissionDenied,
            format!("ownership changes are only supported on unix ({})", path.display()),
        ))
    }

    fn chmod(&self, path: &Path, _mode: u32) -> Result<()> {
        Err(Error::new(
            ErrorKind::PermissionDenied,
            format!("mode changes are only supported on unix ({})", path.display()),
        ))
    }

    fn user_id(&self, name: &str) -> Result<u32> {
        Err(Error::msg(format!("cannot resolve user '{}' on this platform", name)))
    }

    fn group_id(&self, name: &str) -> Result<u32> {
        Err(Error::msg(format!("cannot resolve group '{}' on this platform", name)))
    }
}

#[cfg(unix)]
mod passwd {
    use nix::unistd::{Group, User};

    use crate::error::{Error, ErrorKind, Result};

    pub(super) fn user_id(name: &str) -> Result<u32> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(Error::msg(format!("unknown user '{}'", name))),
            Err(e) => Err(Error::new(
                ErrorKind::IoFailure,
                format!("failed to look up user '{}': {e}", name),
            )),
        }
    }

    pub(super) fn group_id(name: &str) -> Result<u32> {
        match Group::from_name(name) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(Error::msg(format!("unknown group '{}'", name))),
            Err(e) => Err(Error::new(
                ErrorKind::IoFailure,
                format!("failed to look up group '{}': {e}", name),
            )),
        }
    }
}

/// Desired ACL with names already resolved to ids. `None` means unmanaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DesiredAcl {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

impl DesiredAcl {
    pub fn resolve(
        ac: &dyn AccessControl,
        owner: Option<&Principal>,
        group: Option<&Principal>,
        mode: Option<FileMode>,
    ) -> Result<Self> {
        let uid = owner
            .map(|p| principal_id(p, |n| ac.user_id(n)))
            .transpose()?;
        let gid = group
            .map(|p| principal_id(p, |n| ac.group_id(n)))
            .transpose()?;
        Ok(Self {
            uid,
            gid,
            mode: mode.map(FileMode::bits),
        })
    }

    /// Every managed field, as if the file did not exist yet.
    pub fn all_managed(&self) -> AclChanges {
        AclChanges {
            owner: self.uid.is_some(),
            group: self.gid.is_some(),
            mode: self.mode.is_some(),
        }
    }

    /// Fields whose desired value differs from `actual`.
    pub fn divergence(&self, actual: &AclState) -> AclChanges {
        AclChanges {
            owner: self.uid.is_some_and(|u| u != actual.uid),
            group: self.gid.is_some_and(|g| g != actual.gid),
            mode: self.mode.is_some_and(|m| m != actual.mode),
        }
    }
}

fn principal_id(p: &Principal, lookup: impl Fn(&str) -> Result<u32>) -> Result<u32> {
    match p {
        Principal::Id(id) => Ok(*id),
        Principal::Name(name) => match name.trim().parse::<u32>() {
            Ok(id) => Ok(id),
            Err(_) => lookup(name.trim()),
        },
    }
}

/// Bring owner, group and mode of `path` in line with `desired`, touching only
/// managed fields that diverge. With `apply == false` nothing is changed and
/// the divergence is reported as-is.
pub fn reconcile(
    ac: &dyn AccessControl,
    path: &Path,
    desired: &DesiredAcl,
    apply: bool,
) -> Result<AclChanges> {
    if *desired == DesiredAcl::default() {
        return Ok(AclChanges::default());
    }

    let actual = ac.stat(path)?;
    let diff = desired.divergence(&actual);
    if !diff.any() || !apply {
        return Ok(diff);
    }

    // chown first: it may clear setuid/setgid bits that the mode below restores.
    if diff.owner || diff.group {
        let uid = desired.uid.filter(|_| diff.owner);
        let gid = desired.gid.filter(|_| diff.group);
        ac.chown(path, uid, gid)?;
        tracing::info!(
            path = %path.display(),
            uid = ?uid,
            gid = ?gid,
            "changed ownership"
        );
    }
    if diff.mode
        && let Some(mode) = desired.mode
    {
        ac.chmod(path, mode)?;
        tracing::info!(
            path = %path.display(),
            from = %format!("{:04o}", actual.mode),
            to = %format!("{:04o}", mode),
            "changed mode"
        );
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeAcl {
        state: Mutex<AclState>,
        calls: Mutex<Vec<String>>,
        deny_chown: bool,
    }

    impl FakeAcl {
        fn new(uid: u32, gid: u32, mode: u32) -> Self {
            Self {
                state: Mutex::new(AclState { uid, gid, mode }),
                calls: Mutex::new(Vec::new()),
                deny_chown: false,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AccessControl for FakeAcl {
        fn stat(&self, _path: &Path) -> Result<AclState> {
            Ok(*self.state.lock().unwrap())
        }

        fn chown(&self, _path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
            if self.deny_chown {
                return Err(Error::new(ErrorKind::PermissionDenied, "operation not permitted"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("chown {:?} {:?}", uid, gid));
            let mut s = self.state.lock().unwrap();
            if let Some(u) = uid {
                s.uid = u;
            }
            if let Some(g) = gid {
                s.gid = g;
            }
            Ok(())
        }

        fn chmod(&self, _path: &Path, mode: u32) -> Result<()> {
            self.calls.lock().unwrap().push(format!("chmod {:o}", mode));
            self.state.lock().unwrap().mode = mode;
            Ok(())
        }

        fn user_id(&self, name: &str) -> Result<u32> {
            match name {
                "adam" => Ok(1001),
                _ => Err(Error::msg(format!("unknown user '{}'", name))),
            }
        }

        fn group_id(&self, name: &str) -> Result<u32> {
            match name {
                "wheel" => Ok(10),
                _ => Err(Error::msg(format!("unknown group '{}'", name))),
            }
        }
    }

    fn desired(ac: &FakeAcl, owner: Option<&str>, group: Option<&str>, mode: Option<u32>) -> DesiredAcl {
        let owner = owner.map(|s| Principal::Name(s.into()));
        let group = group.map(|s| Principal::Name(s.into()));
        let mode = mode.map(|m| FileMode::new(m).unwrap());
        DesiredAcl::resolve(ac, owner.as_ref(), group.as_ref(), mode).unwrap()
    }

    #[test]
    fn applies_only_diverging_fields() {
        let ac = FakeAcl::new(1001, 0, 0o600);
        let want = desired(&ac, Some("adam"), Some("wheel"), Some(0o644));
        let changes = reconcile(&ac, Path::new("/x"), &want, true).unwrap();
        assert_eq!(
            changes,
            AclChanges {
                owner: false,
                group: true,
                mode: true
            }
        );
        assert_eq!(ac.calls(), vec!["chown None Some(10)", "chmod 644"]);

        let again = reconcile(&ac, Path::new("/x"), &want, true).unwrap();
        assert!(!again.any());
        assert_eq!(ac.calls().len(), 2);
    }

    #[test]
    fn unmanaged_fields_are_never_touched() {
        let ac = FakeAcl::new(0, 0, 0o600);
        let want = desired(&ac, None, None, Some(0o600));
        assert!(!reconcile(&ac, Path::new("/x"), &want, true).unwrap().any());
        assert!(ac.calls().is_empty());

        let nothing = DesiredAcl::default();
        assert!(!reconcile(&ac, Path::new("/x"), &nothing, true).unwrap().any());
    }

    #[test]
    fn dry_run_reports_without_applying() {
        let ac = FakeAcl::new(0, 0, 0o600);
        let want = desired(&ac, None, None, Some(0o644));
        let changes = reconcile(&ac, Path::new("/x"), &want, false).unwrap();
        assert!(changes.mode);
        assert!(ac.calls().is_empty());
    }

    #[test]
    fn refused_chown_is_permission_denied() {
        let mut ac = FakeAcl::new(0, 0, 0o644);
        ac.deny_chown = true;
        let want = desired(&ac, Some("adam"), None, None);
        let err = reconcile(&ac, Path::new("/x"), &want, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn numeric_names_skip_lookup() {
        let ac = FakeAcl::new(0, 0, 0o644);
        let want = desired(&ac, Some("4242"), None, None);
        assert_eq!(want.uid, Some(4242));
        let owner = Principal::Name("nobody-here".into());
        assert!(DesiredAcl::resolve(&ac, Some(&owner), None, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn system_lookup_resolves_root_and_rejects_unknown_names() {
        let ac = SystemAccessControl;
        assert_eq!(ac.user_id("root").unwrap(), 0);
        let err = ac.user_id("no-such-user-for-converge").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = ac.group_id("no-such-group-for-converge").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[cfg(unix)]
    #[test]
    fn system_chmod_round_trips_mode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("f");
        fs::write(&p, "x").unwrap();
        let ac = SystemAccessControl;
        let want = DesiredAcl {
            mode: Some(0o640),
            ..DesiredAcl::default()
        };
        assert!(reconcile(&ac, &p, &want, true).unwrap().mode);
        assert_eq!(ac.stat(&p).unwrap().mode, 0o640);
        assert!(!reconcile(&ac, &p, &want, true).unwrap().any());
    }
}
