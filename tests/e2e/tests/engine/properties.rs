//! Engine properties
//!
//! Invariants that hold whatever the registry looks like.

use stepwise_core::{MigrationState, Outcome, RunRequest};
use stepwise_e2e_tests::TestEnv;

/// A depends on B, B pending: A never runs and keeps its state
#[test]
fn test_dependent_never_runs_while_dependency_pending() {
    // Each case: how A names B, and whether A was already decided
    let cases = [
        ("0001_b", None),
        ("b", None),
        ("0001", None),
        ("1", None),
        ("0001_b", Some(MigrationState::Skipped)),
    ];

    for (reference, a_state) in cases {
        let env = TestEnv::new();
        if let Some(state) = a_state {
            env.seed_state("0002_a", state);
        }
        let mut engine = env.engine(vec![
            env.migration("0001_b").manual(),
            env.migration("0002_a").depends_on(reference),
        ]);

        let mut request = RunRequest::targets(["0002_a"]);
        request.force_rerun = a_state.is_some();
        let report = engine.run(&request).unwrap();

        assert!(
            matches!(report.outcome("0002_a"), Some(Outcome::BlockedByDependencies { .. })),
            "reference {reference}"
        );
        assert!(env.runs().is_empty(), "reference {reference}");
        assert_eq!(
            env.state().get("0002_a").copied(),
            a_state,
            "reference {reference}"
        );
    }
}

#[test]
fn test_second_run_is_a_noop() {
    let env = TestEnv::new();
    let build = || {
        vec![
            env.migration("0001_a"),
            env.migration("0002_b").depends_on("0001_a"),
            env.migration("0003_c").manual(),
        ]
    };

    let mut engine = env.engine(build());
    let first = engine.run(&RunRequest::pending()).unwrap();
    assert!(first.all_succeeded());
    let state_after_first = env.state_file_bytes();
    let journal_after_first = env.journal().len();

    // Fresh process: registry rebuilt from disk
    let mut engine = env.engine(build());
    let second = engine.run(&RunRequest::pending()).unwrap();
    assert!(second.nothing_to_do);
    assert!(second.outcomes.is_empty());
    assert_eq!(env.runs().len(), 3);
    assert_eq!(env.state_file_bytes(), state_after_first);
    assert_eq!(env.journal().len(), journal_after_first);
}

#[test]
fn test_disclaimer_acceptance_applies_to_first_only() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![
        env.migration("0001_a").disclaimer("Mail will be down"),
        env.migration("0002_b"),
        env.migration("0003_c").disclaimer("LDAP will be down"),
    ]);

    let mut request = RunRequest::targets(["0001_a", "0002_b", "0003_c"]);
    request.accept_disclaimer = true;
    let report = engine.run(&request).unwrap();

    assert_eq!(report.outcome("0001_a"), Some(&Outcome::Done));
    assert_eq!(report.outcome("0002_b"), Some(&Outcome::Done));
    assert_eq!(
        report.outcome("0003_c"),
        Some(&Outcome::DisclaimerRequired {
            disclaimer: "LDAP will be down".into()
        })
    );
    assert!(!env.state().contains_key("0003_c"));

    // A second invocation accepts the next one
    let mut request = RunRequest::targets(["0003_c"]);
    request.accept_disclaimer = true;
    assert_eq!(engine.run(&request).unwrap().outcome("0003_c"), Some(&Outcome::Done));
}

#[test]
fn test_disclaimer_without_acceptance_is_not_run() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![env.migration("0001_a").disclaimer("Irreversible")]);

    let report = engine.run(&RunRequest::pending()).unwrap();
    assert!(matches!(report.outcome("0001_a"), Some(Outcome::DisclaimerRequired { .. })));
    assert!(env.runs().is_empty());
    assert!(env.journal().is_empty());
}

#[test]
fn test_empty_disclaimer_runs_without_acceptance() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![env.migration("0001_a").disclaimer("")]);

    let report = engine.run(&RunRequest::pending()).unwrap();
    assert_eq!(report.outcome("0001_a"), Some(&Outcome::Done));
    assert_eq!(env.runs(), ["0001_a"]);
    assert_eq!(env.state()["0001_a"], MigrationState::Done);
}

#[test]
fn test_failure_propagates_through_dependencies_only() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![
        env.migration("0001_a").failing("pg_upgradecluster failed"),
        env.migration("0002_b").depends_on("0001_a"),
        env.migration("0003_c").depends_on("0002_b"),
        env.migration("0004_d"),
    ]);

    let report = engine.run(&RunRequest::pending()).unwrap();

    assert!(matches!(report.outcome("0001_a"), Some(Outcome::Failed { error }) if error.contains("pg_upgradecluster")));
    assert!(matches!(report.outcome("0002_b"), Some(Outcome::BlockedByDependencies { .. })));
    assert!(matches!(report.outcome("0003_c"), Some(Outcome::BlockedByDependencies { .. })));
    assert_eq!(report.outcome("0004_d"), Some(&Outcome::Done));
    assert_eq!(env.runs(), ["0001_a", "0004_d"]);
    assert_eq!(env.state().len(), 1);
}

#[test]
fn test_skipped_dependency_unblocks_dependent() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![
        env.migration("0001_a"),
        env.migration("0002_b").depends_on("0001_a"),
    ]);

    let mut skip = RunRequest::targets(["0001_a"]);
    skip.skip = true;
    engine.run(&skip).unwrap();

    let report = engine.run(&RunRequest::pending()).unwrap();
    assert_eq!(report.outcome("0002_b"), Some(&Outcome::Done));
    assert_eq!(env.runs(), ["0002_b"]);
}

#[test]
fn test_unknown_dependency_blocks_until_skipped() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![env.migration("0002_b").depends_on("migrate_to_buster")]);

    let report = engine.run(&RunRequest::pending()).unwrap();
    assert_eq!(
        report.outcome("0002_b"),
        Some(&Outcome::BlockedByDependencies {
            unmet: vec!["migrate_to_buster".into()]
        })
    );

    let mut skip = RunRequest::targets(["0002_b"]);
    skip.skip = true;
    assert_eq!(engine.run(&skip).unwrap().outcome("0002_b"), Some(&Outcome::Skipped));
}

#[test]
fn test_every_unit_of_work_is_journaled() {
    let env = TestEnv::new();
    let mut engine = env.engine(vec![
        env.migration("0001_a"),
        env.migration("0002_b").failing("nope"),
        env.migration("0003_c"),
    ]);

    let mut skip = RunRequest::targets(["0003_c"]);
    skip.skip = true;
    engine.run(&skip).unwrap();
    engine.run(&RunRequest::pending()).unwrap();

    let journal = env.journal();
    assert_eq!(journal.len(), 3);
    assert!(journal.iter().all(|r| r.ended_at.is_some()));

    let by_id = |id: &str| journal.iter().find(|r| r.migration_id.as_deref() == Some(id)).unwrap();
    assert_eq!(by_id("0001_a").success, Some(true));
    assert_eq!(by_id("0002_b").success, Some(false));
    assert_eq!(by_id("0003_c").success, Some(true));
}
