use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use template_converge::backup::BackupManager;
use template_converge::locator::{CookbookRepository, NodeScope};
use template_converge::resource::FileMode;
use template_converge::{Action, Converger, DesiredState};

const RENDERED: &str = "slappiness is a warm gun";

struct Node {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    target: PathBuf,
}

fn setup() -> Node {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let tpl = root.join("cookbooks/openldap/templates/default/openldap_stuff.conf.erb");
    fs::create_dir_all(tpl.parent().unwrap()).unwrap();
    fs::write(&tpl, "slappiness is {{ slappiness }}").unwrap();
    fs::create_dir_all(root.join("etc")).unwrap();
    let target = root.join("etc/openldap_stuff.conf");
    Node {
        _tmp: tmp,
        root,
        target,
    }
}

fn engine(node: &Node) -> Converger {
    let attrs: toml::Table = toml::from_str("slappiness = \"a warm gun\"").unwrap();
    Converger::new(
        Arc::new(CookbookRepository::new(
            node.root.join("cookbooks"),
            NodeScope::default(),
        )),
        attrs,
    )
}

fn desired(node: &Node) -> DesiredState {
    DesiredState::new(&node.target, "openldap")
}

fn read(p: &Path) -> String {
    fs::read_to_string(p).unwrap()
}

#[test]
fn create_writes_absent_file_without_backup() {
    let node = setup();
    let conv = engine(&node);
    let r = conv.converge(&desired(&node)).unwrap();
    assert!(r.changed);
    assert!(!r.backed_up);
    assert_eq!(read(&node.target), RENDERED);
    assert!(conv.backups().list(&node.target).unwrap().is_empty());
}

#[test]
fn create_backs_up_differing_content_before_overwrite() {
    let node = setup();
    fs::write(&node.target, "blargh").unwrap();
    let conv = engine(&node);
    let r = conv.converge(&desired(&node)).unwrap();
    assert!(r.changed && r.backed_up);
    assert_eq!(read(&node.target), RENDERED);

    let backup = r.backup_path.expect("backup path");
    assert_eq!(read(&backup), "blargh");
    assert_eq!(conv.backups().list(&node.target).unwrap(), vec![backup]);
}

#[test]
fn create_if_missing_leaves_existing_file_alone() {
    let node = setup();
    fs::write(&node.target, "blargh").unwrap();
    let mut d = desired(&node);
    d.action = Action::CreateIfMissing;
    d.mode = Some(FileMode::new(0o600).unwrap());
    let conv = engine(&node);
    let r = conv.converge(&d).unwrap();
    assert!(!r.changed && !r.backed_up);
    assert_eq!(read(&node.target), "blargh");
    assert!(conv.backups().list(&node.target).unwrap().is_empty());
}

#[test]
fn create_is_idempotent() {
    let node = setup();
    let conv = engine(&node);
    assert!(conv.converge(&desired(&node)).unwrap().changed);
    let second = conv.converge(&desired(&node)).unwrap();
    assert!(!second.changed && !second.content_written);
}

#[test]
fn fresh_engine_sees_matching_content_as_unchanged() {
    let node = setup();
    fs::write(&node.target, RENDERED).unwrap();
    let r = engine(&node).converge(&desired(&node)).unwrap();
    assert!(!r.changed);
}

#[test]
fn retention_keeps_only_the_most_recent_backups() {
    let node = setup();
    let conv = engine(&node);
    let mut d = desired(&node);
    d.backup_retention = 3;

    let mut originals = Vec::new();
    for i in 0..5 {
        let before = format!("generation {i}");
        fs::write(&node.target, &before).unwrap();
        originals.push(before);
        let r = conv.converge(&d).unwrap();
        assert!(r.backed_up);
    }

    let kept: Vec<String> = conv
        .backups()
        .list(&node.target)
        .unwrap()
        .iter()
        .map(|p| read(p))
        .collect();
    assert_eq!(kept, originals[2..].to_vec());
}

#[test]
fn central_backup_dir_mirrors_the_target_path() {
    let node = setup();
    fs::write(&node.target, "blargh").unwrap();
    let store = node.root.join("backups");
    let conv = engine(&node).with_backups(Arc::new(BackupManager::new(Some(store.clone()))));
    let r = conv.converge(&desired(&node)).unwrap();
    let backup = r.backup_path.expect("backup path");
    assert!(backup.starts_with(&store));
    let rel: PathBuf = node
        .target
        .parent()
        .unwrap()
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    assert_eq!(backup.parent().unwrap(), store.join(rel));
}

#[test]
fn local_template_is_rendered_from_disk() {
    let node = setup();
    let local = node.root.join("its_on_disk.erb");
    fs::write(&local, "local {{ slappiness }}").unwrap();
    let mut d = desired(&node);
    d.is_local = true;
    d.template_source = local.display().to_string();
    engine(&node).converge(&d).unwrap();
    assert_eq!(read(&node.target), "local a warm gun");
}

#[test]
fn per_resource_variables_override_node_attributes() {
    let node = setup();
    let mut d = desired(&node);
    d.variables = toml::from_str("slappiness = \"a cold shower\"").unwrap();
    engine(&node).converge(&d).unwrap();
    assert_eq!(read(&node.target), "slappiness is a cold shower");
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode_of(p: &Path) -> u32 {
        fs::metadata(p).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn mode_divergence_alone_is_a_change_without_rewrite() {
        let node = setup();
        fs::write(&node.target, RENDERED).unwrap();
        fs::set_permissions(&node.target, fs::Permissions::from_mode(0o600)).unwrap();
        let inode_before = {
            use std::os::unix::fs::MetadataExt;
            fs::metadata(&node.target).unwrap().ino()
        };

        let mut d = desired(&node);
        d.mode = Some(FileMode::new(0o644).unwrap());
        let conv = engine(&node);
        let r = conv.converge(&d).unwrap();

        assert!(r.changed);
        assert!(!r.content_written && !r.backed_up);
        assert!(r.acl.mode && !r.acl.owner && !r.acl.group);
        assert_eq!(mode_of(&node.target), 0o644);
        assert_eq!(read(&node.target), RENDERED);
        let inode_after = {
            use std::os::unix::fs::MetadataExt;
            fs::metadata(&node.target).unwrap().ino()
        };
        assert_eq!(inode_before, inode_after);
        assert!(conv.backups().list(&node.target).unwrap().is_empty());

        assert!(!conv.converge(&d).unwrap().changed);
    }

    #[test]
    fn backup_keeps_original_permission_bits() {
        let node = setup();
        fs::write(&node.target, "blargh").unwrap();
        fs::set_permissions(&node.target, fs::Permissions::from_mode(0o640)).unwrap();
        let r = engine(&node).converge(&desired(&node)).unwrap();
        assert_eq!(mode_of(&r.backup_path.unwrap()), 0o640);
    }
}
