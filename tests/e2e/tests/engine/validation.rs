//! Request validation
//!
//! Invalid requests are rejected before any migration runs and leave the
//! state file byte-for-byte untouched.

use stepwise_core::{EngineError, ListFilter, MigrationState, RunRequest, ValidationError};
use stepwise_e2e_tests::TestEnv;

fn seeded() -> TestEnv {
    let env = TestEnv::new();
    env.seed_state("0001_a", MigrationState::Done);
    env.seed_state("0002_b", MigrationState::Skipped);
    env
}

fn expect_rejected(request: RunRequest, expected: ValidationError) {
    let env = seeded();
    let mut engine = env.engine(vec![
        env.migration("0001_a"),
        env.migration("0002_b"),
        env.migration("0003_c"),
    ]);
    let before = env.state_file_bytes();

    match engine.run(&request) {
        Err(EngineError::Validation(actual)) => assert_eq!(actual, expected),
        other => panic!("expected {expected:?}, got {other:?}"),
    }

    assert!(env.runs().is_empty());
    assert!(env.journal().is_empty());
    assert_eq!(env.state_file_bytes(), before);
}

#[test]
fn test_skip_and_auto_are_exclusive() {
    let request = RunRequest {
        targets: vec!["0003_c".into()],
        skip: true,
        auto: true,
        ..RunRequest::default()
    };
    expect_rejected(request, ValidationError::ExclusiveOptions);
}

#[test]
fn test_auto_and_force_rerun_are_exclusive() {
    let request = RunRequest {
        auto: true,
        force_rerun: true,
        ..RunRequest::default()
    };
    expect_rejected(request, ValidationError::ExclusiveOptions);
}

#[test]
fn test_skip_without_targets() {
    let request = RunRequest {
        skip: true,
        ..RunRequest::default()
    };
    expect_rejected(request, ValidationError::ExplicitTargetsRequired("skip"));
}

#[test]
fn test_force_rerun_without_targets() {
    let request = RunRequest {
        force_rerun: true,
        ..RunRequest::default()
    };
    expect_rejected(request, ValidationError::ExplicitTargetsRequired("force-rerun"));
}

#[test]
fn test_unknown_target_rejects_whole_request() {
    expect_rejected(
        RunRequest::targets(["0003_c", "0042_unknown"]),
        ValidationError::NoSuchMigration("0042_unknown".into()),
    );
}

#[test]
fn test_cannot_skip_decided_migration() {
    let mut request = RunRequest::targets(["0003_c", "0002_b"]);
    request.skip = true;
    expect_rejected(request, ValidationError::NotPendingCantSkip(vec!["0002_b".into()]));
}

#[test]
fn test_cannot_rerun_pending_migration() {
    let mut request = RunRequest::targets(["0001_a", "c"]);
    request.force_rerun = true;
    expect_rejected(request, ValidationError::PendingCantRerun(vec!["0003_c".into()]));
}

#[test]
fn test_rerun_requires_force() {
    expect_rejected(
        RunRequest::targets(["a"]),
        ValidationError::AlreadyRan(vec!["0001_a".into()]),
    );
}

#[test]
fn test_ambiguous_reference_is_no_such_migration() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![env.migration("0005_a"), env.migration("0006_a")]);
    assert!(matches!(
        engine.run(&RunRequest::targets(["a"])),
        Err(EngineError::Validation(ValidationError::NoSuchMigration(target))) if target == "a"
    ));
    assert!(env.runs().is_empty());
}

#[test]
fn test_list_rejects_both_filters() {
    let env = seeded();
    let engine = env.engine(vec![env.migration("0001_a")]);
    assert!(matches!(
        engine.list(ListFilter {
            pending: true,
            done: true
        }),
        Err(EngineError::Validation(ValidationError::ListConflict))
    ));
}
