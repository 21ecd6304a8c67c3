//! Self-upgrade journeys
//!
//! The invocation that schedules the upgrade still holds the tool lock; the
//! job must wait for it and report only through its marker file.

use std::fs;
use std::time::Duration;
use stepwise_core::SelfUpgrade;
use stepwise_e2e_tests::TestEnv;

#[tokio::test]
async fn test_upgrade_waits_for_caller_to_release_lock() {
    let env = TestEnv::new();
    fs::write(&env.config.lock_path, "pid 4242").unwrap();

    let out = env.live_dir("upgrade");
    let upgrade = SelfUpgrade::new(format!("echo upgraded > {}/done", out.display()), &env.config)
        .with_poll_interval(Duration::from_millis(25));
    let marker_path = upgrade.marker_path.clone();

    let handle = upgrade.spawn();

    // Caller keeps working while holding the lock
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!out.join("done").exists());
    assert!(SelfUpgrade::read_marker(&marker_path).unwrap().is_none());

    fs::remove_file(&env.config.lock_path).unwrap();
    let marker = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("self-upgrade did not finish")
        .unwrap();

    assert!(marker.success);
    assert_eq!(fs::read_to_string(out.join("done")).unwrap(), "upgraded\n");
    assert_eq!(SelfUpgrade::read_marker(&marker_path).unwrap(), Some(marker));
}

#[tokio::test]
async fn test_failed_upgrade_is_visible_in_marker_and_log() {
    let env = TestEnv::new();
    let upgrade = SelfUpgrade::new("echo 'E: Unable to locate package' >&2; exit 100", &env.config)
        .with_poll_interval(Duration::from_millis(10));
    let log_path = upgrade.log_path.clone();
    let marker_path = upgrade.marker_path.clone();

    // The handle is dropped; completion is observed through the marker only
    drop(upgrade.spawn());

    let marker = loop {
        if let Some(marker) = SelfUpgrade::read_marker(&marker_path).unwrap() {
            break marker;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert!(!marker.success);
    assert_eq!(marker.exit_code, Some(100));
    assert!(fs::read_to_string(log_path).unwrap().contains("Unable to locate package"));
}

#[tokio::test]
async fn test_consecutive_upgrades_append_to_log() {
    let env = TestEnv::new();
    for word in ["first", "second"] {
        SelfUpgrade::new(format!("echo {word}"), &env.config)
            .spawn()
            .wait()
            .await
            .unwrap();
    }

    let log = fs::read_to_string(env.config.self_upgrade_dir.join("self-upgrade.log")).unwrap();
    let first = log.find("first").unwrap();
    let second = log.find("second").unwrap();
    assert!(first < second);
}
