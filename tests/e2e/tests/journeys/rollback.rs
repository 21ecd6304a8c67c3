//! Backup/rollback journeys
//!
//! Manifest migrations with a `backup` section, executed through bash
//! against real directory trees.

use serde_json::json;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use stepwise_core::{BackupTransaction, MigrationError, MigrationState, Outcome, RunRequest};
use stepwise_e2e_tests::{FakeServices, TestEnv, snapshot_tree};

/// A small config tree with nested dirs, modes and a symlink
fn populate(root: &Path) {
    fs::create_dir_all(root.join("schema").join("cn=config")).unwrap();
    fs::write(root.join("slapd.conf"), "include /etc/ldap/schema/core.schema\n").unwrap();
    fs::set_permissions(root.join("slapd.conf"), fs::Permissions::from_mode(0o640)).unwrap();
    fs::write(root.join("schema").join("cn=config").join("olcDatabase.ldif"), vec![7u8; 4096]).unwrap();
    fs::write(root.join("schema").join("empty"), b"").unwrap();
    symlink("slapd.conf", root.join("current.conf")).unwrap();
    fs::set_permissions(root.join("schema"), fs::Permissions::from_mode(0o750)).unwrap();
}

#[test]
fn test_failed_body_restores_tree_byte_for_byte() {
    let env = TestEnv::new();
    let live = env.live_dir("ldap");
    populate(&live);
    let before = snapshot_tree(&live);

    let l = live.display();
    env.write_manifest(
        "0019_ldap_permissions",
        json!({
            "description": "Rework LDAP permissions",
            "steps": [
                format!("echo corrupted > {l}/slapd.conf"),
                format!("rm -r {l}/schema/cn=config"),
                format!("mkdir -p {l}/new/deep && touch {l}/new/deep/file"),
                format!("chmod 600 {l}/schema/empty"),
                "exit 4"
            ],
            "backup": {
                "service": "slapd",
                "targets": [{ "label": "ldap_config", "path": live }]
            }
        }),
    );

    let mut engine = env.shell_engine(vec![]);
    let report = engine.run(&RunRequest::pending()).unwrap();

    // Original error, unchanged
    assert!(matches!(
        report.outcome("0019_ldap_permissions"),
        Some(Outcome::Failed { error }) if error.contains("exit 4") && !error.contains("Rollback")
    ));
    assert_eq!(snapshot_tree(&live), before);
    assert!(!env.state().contains_key("0019_ldap_permissions"));
    assert_eq!(env.leftover_backups(), 0);
    assert_eq!(
        env.services.events(),
        ["stop slapd", "start slapd", "stop slapd", "start slapd"]
    );
}

#[test]
fn test_successful_body_keeps_changes_and_drops_backup() {
    let env = TestEnv::new();
    let live = env.live_dir("conf");
    populate(&live);
    let out = env.live_dir("out");

    env.write_manifest(
        "0020_copy_from_backup",
        json!({
            "description": "Rewrite config from the saved copy",
            "steps": [
                format!("echo rewritten > {}/slapd.conf", live.display()),
                format!("cp {{backup_dir}}/conf/slapd.conf {}/old.conf", out.display())
            ],
            "backup": {
                "service": "slapd",
                "targets": [{ "label": "conf", "path": live }]
            }
        }),
    );

    let mut engine = env.shell_engine(vec![]);
    let report = engine.run(&RunRequest::pending()).unwrap();

    assert_eq!(report.outcome("0020_copy_from_backup"), Some(&Outcome::Done));
    assert_eq!(fs::read_to_string(live.join("slapd.conf")).unwrap(), "rewritten\n");
    assert_eq!(
        fs::read_to_string(out.join("old.conf")).unwrap(),
        "include /etc/ldap/schema/core.schema\n"
    );
    assert_eq!(env.leftover_backups(), 0);
    assert_eq!(env.services.events(), ["stop slapd", "start slapd"]);
    assert_eq!(env.state()["0020_copy_from_backup"], MigrationState::Done);
}

#[test]
fn test_target_created_by_body_is_removed_on_rollback() {
    let env = TestEnv::new();
    let existing = env.live_dir("db");
    populate(&existing);
    let absent = env.path().join("live").join("not-yet");

    env.write_manifest(
        "0021_new_tree",
        json!({
            "description": "Create a new tree then fail",
            "steps": [
                format!("mkdir -p {}/sub && echo x > {}/sub/f", absent.display(), absent.display()),
                format!("echo y >> {}/slapd.conf", existing.display()),
                "false"
            ],
            "backup": {
                "targets": [
                    { "label": "db", "path": existing },
                    { "label": "new", "path": absent }
                ]
            }
        }),
    );
    let before = snapshot_tree(&existing);

    let mut engine = env.shell_engine(vec![]);
    let report = engine.run(&RunRequest::pending()).unwrap();

    assert!(matches!(report.outcome("0021_new_tree"), Some(Outcome::Failed { .. })));
    assert!(!absent.exists());
    assert_eq!(snapshot_tree(&existing), before);
    // No service configured
    assert!(env.services.events().is_empty());
}

#[test]
fn test_backup_failure_aborts_before_mutation() {
    let env = TestEnv::new().with_services(FakeServices::failing_stop());
    let live = env.live_dir("mail");
    populate(&live);
    let before = snapshot_tree(&live);

    env.write_manifest(
        "0022_mail",
        json!({
            "description": "Never reaches its steps",
            "steps": [format!("rm -rf {}", live.display())],
            "backup": {
                "service": "dovecot",
                "targets": [{ "label": "mail", "path": live }]
            }
        }),
    );

    let mut engine = env.shell_engine(vec![]);
    let report = engine.run(&RunRequest::pending()).unwrap();

    assert!(matches!(
        report.outcome("0022_mail"),
        Some(Outcome::Failed { error }) if error.contains("Could not back up")
    ));
    assert_eq!(snapshot_tree(&live), before);
    assert_eq!(env.leftover_backups(), 0);
    // Start still follows the failed stop
    assert_eq!(env.services.events(), ["stop dovecot", "start dovecot"]);
}

#[test]
fn test_transaction_used_directly_by_a_migration_body() {
    let env = TestEnv::new();
    let live = env.live_dir("pg");
    populate(&live);
    let before = snapshot_tree(&live);

    let txn = BackupTransaction::new(&env.config.backup_root)
        .service("postgresql")
        .target("pg", &live);

    let result: Result<(), MigrationError> = txn.run(env.services.as_ref(), |backup| {
        assert!(backup.join("pg").join("slapd.conf").exists());
        fs::remove_dir_all(live.join("schema")).unwrap();
        Err(MigrationError::Precondition("pg_upgradecluster failed".into()))
    });

    assert!(matches!(result, Err(MigrationError::Precondition(msg)) if msg == "pg_upgradecluster failed"));
    assert_eq!(snapshot_tree(&live), before);
    assert_eq!(
        env.services.events(),
        ["stop postgresql", "start postgresql", "stop postgresql", "start postgresql"]
    );
}
