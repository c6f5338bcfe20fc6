//! Read-only views of a case.
//!
//! The driving execution publishes a fresh [`CaseSnapshot`] after every step.
//! Readers only borrow the latest one, so a query never waits on the case,
//! never touches storage and never changes what it reads.
use super::case::{Case, CaseRecord, CaseStatus, Disbursement, HistoryEntry, Outcome, RiskAssessment};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CaseSnapshot {
    pub case: Arc<Case>,
    pub status: CaseStatus,
    pub risk_assessment: Option<RiskAssessment>,
    pub disbursement: Option<Disbursement>,
    pub history: Arc<[HistoryEntry]>,
    pub outcome: Option<Outcome>,
}

impl From<&CaseRecord> for CaseSnapshot {
    fn from(record: &CaseRecord) -> Self {
        Self {
            case: Arc::new(record.case.clone()),
            status: record.status,
            risk_assessment: record.risk_assessment.clone(),
            disbursement: record.disbursement.clone(),
            history: record.history.clone().into(),
            outcome: record.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseQuery {
    snapshot: watch::Receiver<CaseSnapshot>,
}

impl CaseQuery {
    pub fn new(snapshot: watch::Receiver<CaseSnapshot>) -> Self {
        Self { snapshot }
    }

    /// A view of a case nobody is driving anymore.
    pub fn from_record(record: &CaseRecord) -> Self {
        let (_, snapshot) = watch::channel(CaseSnapshot::from(record));
        Self { snapshot }
    }

    pub fn current_state(&self) -> CaseStatus {
        self.snapshot.borrow().status
    }

    pub fn application_details(&self) -> Arc<Case> {
        self.snapshot.borrow().case.clone()
    }

    /// `None` until risk scoring has finished.
    pub fn risk_assessment(&self) -> Option<RiskAssessment> {
        self.snapshot.borrow().risk_assessment.clone()
    }

    pub fn processing_history(&self) -> Arc<[HistoryEntry]> {
        self.snapshot.borrow().history.clone()
    }

    pub fn disbursement(&self) -> Option<Disbursement> {
        self.snapshot.borrow().disbursement.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.snapshot.borrow().outcome.clone()
    }

    /// Wait until the case reaches `status`. Returns false if the case stopped
    /// being driven without reaching it.
    pub async fn wait_for_status(&mut self, status: CaseStatus) -> bool {
        self.snapshot.wait_for(|s| s.status == status).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{Applicant, TimeStamp};

    fn record() -> CaseRecord {
        let mut record = CaseRecord::new(Case::with_id(
            "case_q".into(),
            Applicant {
                user_id: "user_q".into(),
                full_name: "Alan Turing".into(),
                email: "alan@example.com".into(),
                annual_income: 7_000_000,
                monthly_debt: 90_000,
            },
            500_000,
            vec![],
        ));
        record
            .apply(&HistoryEntry {
                timestamp: TimeStamp::new(),
                message: "validating".into(),
                status: Some(CaseStatus::DocumentValidation),
            })
            .unwrap();
        record
    }

    #[test]
    fn queries_do_not_change_what_they_read() {
        let query = CaseQuery::from_record(&record());

        for _ in 0..10 {
            let _ = query.current_state();
            let _ = query.application_details();
            let _ = query.risk_assessment();
            let _ = query.processing_history();
        }

        assert_eq!(query.current_state(), CaseStatus::DocumentValidation);
        assert_eq!(query.processing_history().len(), 1);
        assert!(query.risk_assessment().is_none());
    }

    #[test]
    fn history_copy_is_detached_from_later_updates() {
        let mut record = record();
        let (tx, rx) = watch::channel(CaseSnapshot::from(&record));
        let query = CaseQuery::new(rx);
        let before = query.processing_history();

        record
            .apply(&HistoryEntry {
                timestamp: TimeStamp::new(),
                message: "scoring".into(),
                status: Some(CaseStatus::RiskScoring),
            })
            .unwrap();
        tx.send_replace(CaseSnapshot::from(&record));

        assert_eq!(before.len(), 1);
        assert_eq!(query.processing_history().len(), 2);
        assert_eq!(query.current_state(), CaseStatus::RiskScoring);
    }
}
