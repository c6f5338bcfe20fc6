//! External operations the orchestrator drives.
//!
//! Implementations talk to the document store, the credit bureau, the payment
//! rail and the notification senders. The orchestrator retries them per step,
//! so every method must be safe to call more than once for the same case.
use super::case::{Case, Disbursement, RiskAssessment};
use super::error::ActivityError;
use async_trait::async_trait;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    #[n(0)]
    ValidateDocuments,
    #[n(1)]
    ScoreRisk,
    #[n(2)]
    DisburseFunds,
    #[n(3)]
    CompensateDisbursement,
    #[n(4)]
    SendNotification,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ValidateDocuments => "validate_documents",
            ActivityKind::ScoreRisk => "score_risk",
            ActivityKind::DisburseFunds => "disburse_funds",
            ActivityKind::CompensateDisbursement => "compensate_disbursement",
            ActivityKind::SendNotification => "send_notification",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DocumentValidation {
    #[n(0)]
    pub valid: bool,
    #[n(1)]
    pub reason: Option<String>, // why the documents were refused
}

impl DocumentValidation {
    pub fn accepted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    #[n(0)]
    ApplicationReceived,
    #[n(1)]
    Rejected {
        #[n(0)]
        reason: String,
    },
    #[n(2)]
    Expired,
    #[n(3)]
    Disbursed {
        #[n(0)]
        transaction_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(4)]
    DisbursementFailed {
        #[n(0)]
        reversed: bool,
    },
    #[n(5)]
    FollowUp {
        #[n(0)]
        cycle: u32,
        #[n(1)]
        day: u32,
    },
    #[n(6)]
    ProcessingFailed {
        #[n(0)]
        reason: String,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub kind: NotificationKind,
}

#[async_trait]
pub trait LoanActivities: Send + Sync {
    async fn validate_documents(&self, case: &Case) -> Result<DocumentValidation, ActivityError>;

    async fn score_risk(&self, case: &Case) -> Result<RiskAssessment, ActivityError>;

    /// Must move funds at most once per `idempotency_key`.
    async fn disburse_funds(
        &self,
        case: &Case,
        idempotency_key: &str,
    ) -> Result<Disbursement, ActivityError>;

    /// Reverse whatever `disburse_funds` did under `idempotency_key`. Reversing
    /// nothing is a success.
    async fn compensate_disbursement(
        &self,
        case_id: &str,
        idempotency_key: &str,
    ) -> Result<(), ActivityError>;

    async fn send_notification(&self, notification: &Notification) -> Result<(), ActivityError>;
}
