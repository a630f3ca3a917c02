use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use template_converge::executor::{self, NullSink, Status};
use template_converge::runfile::RunFile;

fn write(p: &Path, body: &str) {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(p, body).unwrap();
}

// A cookbook tree, an output dir and a run file that extends a shared base.
fn setup_site() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let out = root.join("out");
    fs::create_dir_all(&out).unwrap();

    write(
        &root.join("cookbooks/openldap/templates/default/slapd.conf.erb"),
        "suffix {{ ldap.suffix }}\nslappiness is {{ slappiness }}\n",
    );
    write(
        &root.join("cookbooks/openldap/templates/host-web1/ldap.conf.erb"),
        "URI ldap://{{ hostname }}\n",
    );
    write(
        &root.join("cookbooks/openldap/templates/default/ldap.conf.erb"),
        "URI ldap://localhost\n",
    );
    write(&root.join("local/motd.erb"), "welcome to {{ fqdn }}\n");

    write(
        &root.join("base.toml"),
        r#"
[node]
hostname = "web1"
fqdn = "web1.example.com"
slappiness = "a warm gun"

[node.ldap]
suffix = "dc=example,dc=com"
"#,
    );
    let out_s = out.display().to_string();
    let run = root.join("site.toml");
    write(
        &run,
        &format!(
            r#"
extends = "base.toml"

[run]
backup_dir = "@root/backups"

[[template]]
path = "{out_s}/slapd.conf"
cookbook_name = "openldap"

[[template]]
path = "{out_s}/ldap.conf"
cookbook_name = "openldap"
mode = "0640"

[[template]]
path = "{out_s}/motd"
local = true
source = "local/motd.erb"

[[template]]
path = "{out_s}/keep.conf"
local = true
source = "local/motd.erb"
action = "create_if_missing"

[[template]]
path = "{out_s}/ignored.conf"
cookbook_name = "openldap"
action = "nothing"
"#
        ),
    );
    (tmp, root, run)
}

#[test]
fn run_file_converges_every_resource() {
    let (_tmp, root, run) = setup_site();
    let out = root.join("out");
    write(&out.join("keep.conf"), "hands off\n");
    write(&out.join("slapd.conf"), "old\n");

    let rf = RunFile::load(&run).unwrap();
    assert_eq!(rf.resources.len(), 5);
    let report = executor::execute_run(&rf.converger(false), &rf.resources, &NullSink);
    assert!(report.ok(), "{report:?}");

    let statuses: Vec<Status> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            Status::Changed,
            Status::Changed,
            Status::Changed,
            Status::Skipped,
            Status::Skipped
        ]
    );
    assert_eq!(
        fs::read_to_string(out.join("slapd.conf")).unwrap(),
        "suffix dc=example,dc=com\nslappiness is a warm gun\n"
    );
    assert_eq!(
        fs::read_to_string(out.join("ldap.conf")).unwrap(),
        "URI ldap://web1\n"
    );
    assert_eq!(
        fs::read_to_string(out.join("motd")).unwrap(),
        "welcome to web1.example.com\n"
    );
    assert_eq!(fs::read_to_string(out.join("keep.conf")).unwrap(), "hands off\n");
    assert!(!out.join("ignored.conf").exists());

    // The overwritten slapd.conf was backed up under the central store.
    let backup = report.outcomes[0]
        .result
        .as_ref()
        .and_then(|r| r.backup_path.clone())
        .expect("backup");
    assert!(backup.starts_with(root.join("backups")));
    assert_eq!(fs::read_to_string(backup).unwrap(), "old\n");

    // Second pass over the same run file changes nothing.
    let again = executor::execute_run(&rf.converger(false), &rf.resources, &NullSink);
    assert_eq!(again.changed(), 0);
    assert!(again.ok());
}

#[test]
fn parallel_and_sequential_runs_agree() {
    let (_tmp, root, run) = setup_site();
    let rf = RunFile::load(&run).unwrap();
    let report = executor::execute_run_parallel(&rf.converger(false), &rf.resources, &NullSink, 4);
    assert!(report.ok());
    assert_eq!(report.changed(), 4);
    assert_eq!(report.count(Status::Skipped), 1);
    assert!(root.join("out/keep.conf").exists());
}

#[test]
fn dry_run_leaves_the_tree_untouched() {
    let (_tmp, root, run) = setup_site();
    let rf = RunFile::load(&run).unwrap();
    let report = executor::execute_run(&rf.converger(true), &rf.resources, &NullSink);
    assert!(report.dry_run && report.ok());
    assert_eq!(report.changed(), 4);
    let left: Vec<_> = fs::read_dir(root.join("out")).unwrap().collect();
    assert!(left.is_empty());
}

#[test]
fn cli_run_prints_summary_and_fails_on_bad_resource() {
    let (_tmp, root, run) = setup_site();
    let bin = env!("CARGO_BIN_EXE_converge");

    let ok = Command::new(bin).arg("run").arg(&run).output().expect("spawn");
    assert!(ok.status.success());
    let stdout = String::from_utf8_lossy(&ok.stdout);
    assert!(stdout.contains("SUMMARY:"), "{stdout}");
    assert!(stdout.contains("changed=4"), "{stdout}");

    let broken = root.join("broken.toml");
    write(
        &broken,
        &format!(
            "extends = \"site.toml\"\n\n[[template]]\npath = \"{}/x.conf\"\ncookbook_name = \"nope\"\n",
            root.join("out").display()
        ),
    );
    let failed = Command::new(bin)
        .args(["run", "--json"])
        .arg(&broken)
        .output()
        .expect("spawn");
    assert!(!failed.status.success());
    let json: serde_json::Value = serde_json::from_slice(&failed.stdout).expect("json report");
    let outcomes = json["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes[5]["status"], "failed");
    assert_eq!(outcomes[5]["error"]["kind"], "source-not-found");
}

#[test]
fn cli_locate_lists_resolved_sources() {
    let (_tmp, root, run) = setup_site();
    let out = Command::new(env!("CARGO_BIN_EXE_converge"))
        .arg("locate")
        .arg(&run)
        .output()
        .expect("spawn");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("templates/host-web1/ldap.conf.erb"), "{stdout}");
    assert!(
        stdout.contains(&root.join("local/motd.erb").display().to_string()),
        "{stdout}"
    );
}

#[test]
fn cli_resolve_prints_the_merged_run_file() {
    let (_tmp, _root, run) = setup_site();
    let out = Command::new(env!("CARGO_BIN_EXE_converge"))
        .arg("resolve")
        .arg(&run)
        .output()
        .expect("spawn");
    assert!(out.status.success());
    let merged: toml::Table = toml::from_str(&String::from_utf8_lossy(&out.stdout)).expect("toml");
    assert_eq!(merged["node"]["hostname"].as_str(), Some("web1"));
    assert_eq!(merged["template"].as_array().map(Vec::len), Some(5));
}
