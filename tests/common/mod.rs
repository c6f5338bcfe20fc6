#![allow(dead_code)]

use async_trait::async_trait;
use loan_origination::{
    ActivityError, Applicant, Case, CaseQuery, CaseStatus, Disbursement, DisbursementStatus,
    Document, DocumentKind, DocumentValidation, HistoryEntry, LoanActivities, Notification,
    NotificationKind, Orchestrator, OrchestratorConfig, RiskAssessment, RiskLevel, TokioClock,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

/// What the payment rail does with a disbursement request.
#[derive(Debug, Clone)]
pub enum DisbursementPlan {
    Complete,
    EndsWith(DisbursementStatus),
    Error(ActivityError),
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub documents_valid: bool,
    pub validation_transient_failures: u32,
    pub validation_always_fails: bool,
    pub scoring_always_fails: bool,
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub disbursement: DisbursementPlan,
    pub compensation_fails: bool,
    pub notifications_fail: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            documents_valid: true,
            validation_transient_failures: 0,
            validation_always_fails: false,
            scoring_always_fails: false,
            risk_level: RiskLevel::Low,
            risk_score: 720,
            disbursement: DisbursementPlan::Complete,
            compensation_fails: false,
            notifications_fail: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Calls {
    pub validate: AtomicU32,
    pub score: AtomicU32,
    pub disburse: AtomicU32,
    pub compensate: AtomicU32,
    pub notify: AtomicU32,
}

/// Scripted external systems that count every call they receive.
#[derive(Debug, Default)]
pub struct MockActivities {
    pub plan: Plan,
    pub calls: Calls,
    notifications: Mutex<Vec<Notification>>,
    keys: Mutex<Vec<String>>,
}

impl MockActivities {
    pub fn new(plan: Plan) -> Arc<Self> {
        Arc::new(Self {
            plan,
            ..Default::default()
        })
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<NotificationKind> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.kind.clone())
            .collect()
    }

    /// Idempotency keys seen by disbursement and compensation, in call order.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl LoanActivities for MockActivities {
    async fn validate_documents(&self, _case: &Case) -> Result<DocumentValidation, ActivityError> {
        let attempt = self.calls.validate.fetch_add(1, Ordering::SeqCst) + 1;
        if self.plan.validation_always_fails
            || attempt <= self.plan.validation_transient_failures
        {
            return Err(ActivityError::Transient("document store unavailable".into()));
        }
        if self.plan.documents_valid {
            Ok(DocumentValidation::accepted())
        } else {
            Ok(DocumentValidation::refused("proof of income is unreadable"))
        }
    }

    async fn score_risk(&self, case: &Case) -> Result<RiskAssessment, ActivityError> {
        self.calls.score.fetch_add(1, Ordering::SeqCst);
        if self.plan.scoring_always_fails {
            return Err(ActivityError::Transient("credit bureau unavailable".into()));
        }
        Ok(RiskAssessment {
            case_id: case.case_id.clone(),
            score: self.plan.risk_score,
            risk_level: self.plan.risk_level,
            debt_to_income_ratio: 0.18,
            risk_factors: vec![],
        })
    }

    async fn disburse_funds(
        &self,
        case: &Case,
        idempotency_key: &str,
    ) -> Result<Disbursement, ActivityError> {
        self.calls.disburse.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(idempotency_key.to_string());
        let status = match &self.plan.disbursement {
            DisbursementPlan::Complete => DisbursementStatus::Completed,
            DisbursementPlan::EndsWith(status) => *status,
            DisbursementPlan::Error(err) => return Err(err.clone()),
        };
        Ok(Disbursement {
            transaction_id: format!("txn_{}", case.case_id),
            amount: case.requested_amount,
            status,
            failure_reason: (status != DisbursementStatus::Completed)
                .then(|| "beneficiary bank declined".to_string()),
        })
    }

    async fn compensate_disbursement(
        &self,
        _case_id: &str,
        idempotency_key: &str,
    ) -> Result<(), ActivityError> {
        self.calls.compensate.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(idempotency_key.to_string());
        if self.plan.compensation_fails {
            return Err(ActivityError::NonRetryable("ledger locked".into()));
        }
        Ok(())
    }

    async fn send_notification(&self, notification: &Notification) -> Result<(), ActivityError> {
        self.calls.notify.fetch_add(1, Ordering::SeqCst);
        if self.plan.notifications_fail {
            return Err(ActivityError::Transient("smtp relay down".into()));
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn open_db(name: &str) -> anyhow::Result<(TempDir, Arc<sled::Db>)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    Ok((temp_dir, Arc::new(db)))
}

pub fn orchestrator(
    db: Arc<sled::Db>,
    activities: Arc<MockActivities>,
    config: OrchestratorConfig,
) -> anyhow::Result<Orchestrator> {
    orchestrator_with_clock(db, activities, config, Arc::new(TokioClock::new()))
}

/// Same as [`orchestrator`], reading time from `clock`. Share one clock across
/// a simulated restart so the time that passed while down is kept.
pub fn orchestrator_with_clock(
    db: Arc<sled::Db>,
    activities: Arc<MockActivities>,
    config: OrchestratorConfig,
    clock: Arc<TokioClock>,
) -> anyhow::Result<Orchestrator> {
    Orchestrator::new(db, activities, clock, config)
}

pub fn case(case_id: &str) -> Case {
    Case::with_id(
        case_id.to_string(),
        Applicant {
            user_id: format!("user_{case_id}"),
            full_name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
            annual_income: 9_500_000,
            monthly_debt: 120_000,
        },
        2_500_000,
        vec![
            Document {
                document_id: "doc_id".into(),
                kind: DocumentKind::Identity,
                reference: "s3://docs/id.pdf".into(),
            },
            Document {
                document_id: "doc_income".into(),
                kind: DocumentKind::ProofOfIncome,
                reference: "s3://docs/payslip.pdf".into(),
            },
        ],
    )
}

/// Query handle of a case once it is known to the orchestrator.
pub async fn query_when_known(orchestrator: &Orchestrator, case_id: &str) -> CaseQuery {
    loop {
        if let Ok(query) = orchestrator.query(case_id).await {
            return query;
        }
        tokio::task::yield_now().await;
    }
}

pub fn statuses(history: &[HistoryEntry]) -> Vec<CaseStatus> {
    history.iter().filter_map(|entry| entry.status).collect()
}
