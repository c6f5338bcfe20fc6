//! Quick checks of the building blocks through the public API.

mod common;

use common::{open_db, orchestrator, MockActivities, Plan};
use loan_origination::case::{CaseRecord, TimeStamp};
use loan_origination::decision::Decision;
use loan_origination::retry::RetryPolicy;
use loan_origination::store::CaseStore;
use loan_origination::{Applicant, Case, CaseStatus, OrchestratorConfig, OrchestratorError, utils};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn generated_case_ids_are_bech32_with_case_prefix() -> anyhow::Result<()> {
    let applicant = Applicant {
        user_id: utils::new_uuid_to_bech32("user_")?,
        full_name: "Katherine Johnson".into(),
        email: "kj@example.com".into(),
        annual_income: 6_000_000,
        monthly_debt: 50_000,
    };
    let first = Case::new(applicant.clone(), 100_000, vec![])?;
    let second = Case::new(applicant, 100_000, vec![])?;

    assert!(first.case_id.starts_with("case_1"));
    assert_ne!(first.case_id, second.case_id);
    assert_eq!(first.created_at, first.updated_at);

    Ok(())
}

#[test]
fn config_loads_from_toml_with_defaults() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_toml_str(
        r#"
        approval_timeout_secs = 3600

        [retries.disbursement]
        initial_interval_ms = 2000
        backoff_coefficient = 3.0
        max_interval_ms = 20000
        maximum_attempts = 4

        [follow_up]
        offsets_days = [7, 14]
        max_cycles = 1
        "#,
    )?;

    assert_eq!(config.approval_timeout(), Duration::from_secs(3600));
    assert_eq!(config.retries.disbursement.maximum_attempts, 4);
    assert_eq!(
        config.retries.validation,
        OrchestratorConfig::default().retries.validation
    );
    assert_eq!(config.follow_up.offset(1), Some(Duration::from_secs(14 * 86_400)));
    assert_eq!(config.follow_up.max_cycles, Some(1));

    Ok(())
}

#[test]
fn config_file_round_trip_and_bad_values() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("orchestrator.toml");
    std::fs::write(&path, "approval_timeout_secs = 60\n")?;
    assert_eq!(OrchestratorConfig::from_file(&path)?.approval_timeout_secs, 60);

    let err = OrchestratorConfig::from_toml_str("[follow_up]\noffsets_days = []\n").unwrap_err();
    assert!(matches!(err, OrchestratorError::Config(_)));

    let missing = OrchestratorConfig::from_file(temp_dir.path().join("missing.toml"));
    assert!(matches!(missing, Err(OrchestratorError::Config(_))));

    Ok(())
}

#[test]
fn retry_policy_backoff_is_bounded() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 2.0, Duration::from_secs(60), 2);

    assert_eq!(policy.backoff(1), Duration::from_secs(5));
    assert_eq!(policy.backoff(2), Duration::from_secs(10));
    assert_eq!(policy.backoff(30), Duration::from_secs(60));
    assert!(policy.has_attempts_left(1));
    assert!(!policy.has_attempts_left(2));
    assert!(!RetryPolicy::no_retry().has_attempts_left(1));
}

#[test]
fn inbox_and_case_records_survive_reopen() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("reopen.db");
    let record = CaseRecord::new(common::case("case_persist"));

    {
        let store = CaseStore::new(Arc::new(sled::open(&path)?));
        store.save_case(&record)?;
        store.append_signal(
            "case_persist",
            &Decision::Approve {
                by: "officer_1".into(),
                notes: None,
            },
            TimeStamp::new(),
        )?;
        store.flush()?;
    }

    let store = CaseStore::new(Arc::new(sled::open(&path)?));
    assert_eq!(store.load_case("case_persist")?, Some(record));
    let signals = store.signals_after("case_persist", None)?;
    assert_eq!(signals.len(), 1);
    assert!(signals[0].decision.is_terminal());

    Ok(())
}

#[test]
fn case_record_refuses_going_backwards() {
    let mut record = CaseRecord::new(common::case("case_dag"));
    let step = |status: CaseStatus| loan_origination::HistoryEntry {
        timestamp: TimeStamp::new(),
        message: format!("to {status}"),
        status: Some(status),
    };

    record.apply(&step(CaseStatus::DocumentValidation)).unwrap();
    record.apply(&step(CaseStatus::RiskScoring)).unwrap();
    let err = record.apply(&step(CaseStatus::DocumentValidation)).unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    assert_eq!(record.status, CaseStatus::RiskScoring);
    assert_eq!(record.history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn signals_for_unknown_cases_are_accepted() -> anyhow::Result<()> {
    let (_dir, db) = open_db("unknown_signal.db")?;
    let activities = MockActivities::new(Plan::default());
    let orchestrator = orchestrator(db, activities, OrchestratorConfig::default())?;

    orchestrator
        .request_more_info("case_nobody".into(), "anything".into())
        .await?;
    let pending = orchestrator.store().signals_after("case_nobody", None)?;
    assert_eq!(pending.len(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_refused_at_construction() -> anyhow::Result<()> {
    let (_dir, db) = open_db("bad_config.db")?;
    let mut config = OrchestratorConfig::default();
    config.retries.notification.maximum_attempts = 0;

    let result = orchestrator(db, MockActivities::new(Plan::default()), config);
    assert!(result.is_err());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn approval_window_beyond_timestamp_range_is_refused() -> anyhow::Result<()> {
    let (_dir, db) = open_db("long_window.db")?;
    let mut config = OrchestratorConfig::default();
    config.approval_timeout_secs = 300 * 365 * 24 * 60 * 60;

    let result = orchestrator(db, MockActivities::new(Plan::default()), config);
    let err = result.err().expect("window refused");
    assert!(matches!(
        err.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::Config(_))
    ));

    let parsed = OrchestratorConfig::from_toml_str("approval_timeout_secs = 9460800000\n");
    assert!(matches!(parsed, Err(OrchestratorError::Config(_))));

    Ok(())
}
