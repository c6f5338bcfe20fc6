//! Undo of side effects after a failed disbursement.
//!
//! Steps that move money push a [`CompensationStep`] before they run. When a
//! later step fails the stack is unwound newest first. A compensation that
//! itself fails is logged as critical and kept in the case history for an
//! operator; it never hides the failure that triggered it.
use super::activity::{ActivityKind, LoanActivities, NotificationKind};
use super::error::OrchestratorError;
use super::retry::RetryPolicy;
use super::state_machine::CaseRun;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationStep {
    /// Reverse the payment made under `idempotency_key`.
    ReverseDisbursement { idempotency_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Reversed,
    Failed { reason: String },
}

pub struct CompensationManager {
    activities: Arc<dyn LoanActivities>,
    policy: RetryPolicy,
}

impl CompensationManager {
    pub fn new(activities: Arc<dyn LoanActivities>, policy: RetryPolicy) -> Self {
        Self { activities, policy }
    }

    /// Unwind every pending step of `run`, notify the applicant and record
    /// the result.
    pub(crate) async fn compensate(
        &self,
        run: &mut CaseRun,
        failure: &str,
    ) -> Result<(), OrchestratorError> {
        let case_id = run.case_id().to_string();
        let mut outcomes = vec![];

        while let Some(step) = run.pop_compensation() {
            let outcome = self.undo(run, &case_id, &step).await?;
            match &outcome {
                CompensationOutcome::Reversed => {
                    info!(case_id = %case_id, ?step, "compensation applied");
                    run.cancel_disbursement();
                }
                CompensationOutcome::Failed { reason } => {
                    error!(
                        case_id = %case_id,
                        ?step,
                        %reason,
                        critical = true,
                        "compensation failed, manual intervention required"
                    );
                }
            }
            outcomes.push(outcome);
        }

        let reversed = outcomes
            .iter()
            .all(|outcome| *outcome == CompensationOutcome::Reversed);
        run.notify(NotificationKind::DisbursementFailed { reversed })
            .await?;

        for outcome in outcomes {
            let message = match outcome {
                CompensationOutcome::Reversed => {
                    format!("Disbursement reversed after failure: {failure}")
                }
                CompensationOutcome::Failed { reason } => format!(
                    "Disbursement reversal failed, manual intervention required: {reason}"
                ),
            };
            run.record(None, message)?;
        }
        Ok(())
    }

    async fn undo(
        &self,
        run: &mut CaseRun,
        case_id: &str,
        step: &CompensationStep,
    ) -> Result<CompensationOutcome, OrchestratorError> {
        match step {
            CompensationStep::ReverseDisbursement { idempotency_key } => {
                let activities = self.activities.clone();
                let result = run
                    .exec
                    .activity(ActivityKind::CompensateDisbursement, &self.policy, || {
                        activities.compensate_disbursement(case_id, idempotency_key)
                    })
                    .await?;
                Ok(match result {
                    Ok(()) => CompensationOutcome::Reversed,
                    Err(failure) => CompensationOutcome::Failed {
                        reason: failure.to_string(),
                    },
                })
            }
        }
    }
}
