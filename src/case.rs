//! Case aggregate, its status graph and the records produced along the way
use super::error::OrchestratorError;
use super::utils;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Applicant {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub full_name: String,
    #[n(2)]
    pub email: String,
    #[n(3)]
    pub annual_income: u64, // minor units
    #[n(4)]
    pub monthly_debt: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    #[n(0)]
    Identity,
    #[n(1)]
    ProofOfIncome,
    #[n(2)]
    BankStatement,
    #[n(3)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Document {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub kind: DocumentKind,
    #[n(2)]
    pub reference: String, // location in the external document store
}

/// One loan application. The id never changes; everything else is owned by the
/// execution driving the case.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Case {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub applicant: Applicant,
    #[n(2)]
    pub requested_amount: u64, // minor units
    #[n(3)]
    pub documents: Vec<Document>,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub updated_at: TimeStamp<Utc>,
}

impl Case {
    pub fn new(
        applicant: Applicant,
        requested_amount: u64,
        documents: Vec<Document>,
    ) -> anyhow::Result<Self> {
        let case_id = utils::new_uuid_to_bech32("case_")?;
        Ok(Self::with_id(case_id, applicant, requested_amount, documents))
    }

    pub fn with_id(
        case_id: String,
        applicant: Applicant,
        requested_amount: u64,
        documents: Vec<Document>,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            case_id,
            applicant,
            requested_amount,
            documents,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaseStatus {
    #[n(0)]
    Submitted,
    #[n(1)]
    DocumentValidation,
    #[n(2)]
    RiskScoring,
    #[n(3)]
    AwaitingApproval,
    #[n(4)]
    Approved,
    #[n(5)]
    Disbursing,
    #[n(6)]
    Disbursed,
    #[n(7)]
    Rejected,
    #[n(8)]
    Expired,
    #[n(9)]
    Failed,
}

impl CaseStatus {
    pub const ALL: [CaseStatus; 10] = [
        CaseStatus::Submitted,
        CaseStatus::DocumentValidation,
        CaseStatus::RiskScoring,
        CaseStatus::AwaitingApproval,
        CaseStatus::Approved,
        CaseStatus::Disbursing,
        CaseStatus::Disbursed,
        CaseStatus::Rejected,
        CaseStatus::Expired,
        CaseStatus::Failed,
    ];

    /// Edges of the status graph. Every edge moves strictly forward.
    pub fn can_transition_to(self, next: CaseStatus) -> bool {
        use CaseStatus::*;

        matches!(
            (self, next),
            (Submitted, DocumentValidation)
                | (DocumentValidation, RiskScoring | Rejected | Failed)
                | (RiskScoring, AwaitingApproval | Rejected | Failed)
                | (AwaitingApproval, Approved | Rejected | Expired)
                | (Approved, Disbursing)
                | (Disbursing, Disbursed | Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaseStatus::Disbursed | CaseStatus::Rejected | CaseStatus::Expired | CaseStatus::Failed
        )
    }

    /// Position in a topological order of the status graph.
    pub fn rank(self) -> u8 {
        match self {
            CaseStatus::Submitted => 0,
            CaseStatus::DocumentValidation => 1,
            CaseStatus::RiskScoring => 2,
            CaseStatus::AwaitingApproval => 3,
            CaseStatus::Approved => 4,
            CaseStatus::Disbursing => 5,
            CaseStatus::Disbursed
            | CaseStatus::Rejected
            | CaseStatus::Expired
            | CaseStatus::Failed => 6,
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Submitted => "SUBMITTED",
            CaseStatus::DocumentValidation => "DOCUMENT_VALIDATION",
            CaseStatus::RiskScoring => "RISK_SCORING",
            CaseStatus::AwaitingApproval => "AWAITING_APPROVAL",
            CaseStatus::Approved => "APPROVED",
            CaseStatus::Disbursing => "DISBURSING",
            CaseStatus::Disbursed => "DISBURSED",
            CaseStatus::Rejected => "REJECTED",
            CaseStatus::Expired => "EXPIRED",
            CaseStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    #[n(0)]
    Low,
    #[n(1)]
    Medium,
    #[n(2)]
    High,
    #[n(3)]
    VeryHigh,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::VeryHigh => "VERY_HIGH",
        };
        write!(f, "{s}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub score: u32,
    #[n(2)]
    pub risk_level: RiskLevel,
    #[n(3)]
    pub debt_to_income_ratio: f64,
    #[n(4)]
    pub risk_factors: Vec<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisbursementStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Processing,
    #[n(2)]
    Completed,
    #[n(3)]
    Failed,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Refunded,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub amount: u64,
    #[n(2)]
    pub status: DisbursementStatus,
    #[n(3)]
    pub failure_reason: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    #[n(0)]
    pub timestamp: TimeStamp<Utc>,
    #[n(1)]
    pub message: String,
    #[n(2)]
    pub status: Option<CaseStatus>, // set when the entry records a transition
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    #[n(0)]
    Disbursed {
        #[n(0)]
        transaction_id: String,
    },
    #[n(1)]
    Rejected {
        #[n(0)]
        reason: String,
    },
    #[n(2)]
    Expired,
    #[n(3)]
    Failed {
        #[n(0)]
        reason: String,
    },
}

/// Everything known about a case at the last completed step. Persisted after
/// every history append so queries and recovery can read it without replay.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct CaseRecord {
    #[n(0)]
    pub case: Case,
    #[n(1)]
    pub status: CaseStatus,
    #[n(2)]
    pub risk_assessment: Option<RiskAssessment>,
    #[n(3)]
    pub disbursement: Option<Disbursement>,
    #[n(4)]
    pub history: Vec<HistoryEntry>,
    #[n(5)]
    pub outcome: Option<Outcome>,
}

impl CaseRecord {
    pub fn new(case: Case) -> Self {
        Self {
            case,
            status: CaseStatus::Submitted,
            risk_assessment: None,
            disbursement: None,
            history: vec![],
            outcome: None,
        }
    }

    /// Append a history entry, moving the status along if the entry carries one.
    pub fn apply(&mut self, entry: &HistoryEntry) -> Result<(), OrchestratorError> {
        if let Some(next) = entry.status {
            if !self.status.can_transition_to(next) {
                return Err(OrchestratorError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        self.case.updated_at = entry.timestamp.clone();
        self.history.push(entry.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case() -> Case {
        Case::with_id(
            "case_test".into(),
            Applicant {
                user_id: "user_1".into(),
                full_name: "Ada Lovelace".into(),
                email: "ada@example.com".into(),
                annual_income: 9_000_000,
                monthly_debt: 120_000,
            },
            2_500_000,
            vec![],
        )
    }

    fn entry(status: Option<CaseStatus>) -> HistoryEntry {
        HistoryEntry {
            timestamp: TimeStamp::new(),
            message: "step".into(),
            status,
        }
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn every_edge_moves_forward() {
        for from in CaseStatus::ALL {
            for to in CaseStatus::ALL {
                if from.can_transition_to(to) {
                    assert!(from.rank() < to.rank(), "{from} -> {to} goes backwards");
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in CaseStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(CaseStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn record_rejects_backwards_transition() {
        let mut record = CaseRecord::new(case());
        record
            .apply(&entry(Some(CaseStatus::DocumentValidation)))
            .unwrap();
        record.apply(&entry(Some(CaseStatus::RiskScoring))).unwrap();

        let err = record
            .apply(&entry(Some(CaseStatus::DocumentValidation)))
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(record.status, CaseStatus::RiskScoring);
        assert_eq!(record.history.len(), 2);
    }

    #[test]
    fn plain_entries_keep_status() {
        let mut record = CaseRecord::new(case());
        record.apply(&entry(None)).unwrap();

        assert_eq!(record.status, CaseStatus::Submitted);
        assert_eq!(record.history.len(), 1);
    }
}
