pub mod activity;
pub mod case;
pub mod clock;
pub mod compensation;
pub mod config;
pub mod continuation;
pub mod decision;
pub mod error;
pub mod journal;
pub mod query;
pub mod retry;
pub mod service;
pub mod signal;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use activity::{DocumentValidation, LoanActivities, Notification, NotificationKind};
pub use case::{
    Applicant, Case, CaseStatus, Disbursement, DisbursementStatus, Document, DocumentKind,
    HistoryEntry, Outcome, RiskAssessment, RiskLevel,
};
pub use clock::{Clock, TokioClock};
pub use config::OrchestratorConfig;
pub use error::{ActivityError, OrchestratorError};
pub use query::CaseQuery;
pub use service::Orchestrator;
