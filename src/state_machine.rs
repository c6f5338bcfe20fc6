//! The loan origination workflow.
//!
//! DOCUMENT_VALIDATION -> RISK_SCORING -> AWAITING_APPROVAL -> APPROVED ->
//! DISBURSING -> DISBURSED, with exits to REJECTED, EXPIRED and FAILED.
//! Every step goes through the case [`Execution`], so a restarted process
//! replays the finished steps from the journal and carries on where the case
//! stopped.
use super::activity::{ActivityKind, LoanActivities, Notification, NotificationKind};
use super::case::{
    Case, CaseRecord, CaseStatus, Disbursement, DisbursementStatus, HistoryEntry, Outcome,
    RiskAssessment, RiskLevel,
};
use super::clock::Clock;
use super::compensation::{CompensationManager, CompensationStep};
use super::config::OrchestratorConfig;
use super::continuation::ContinuationScheduler;
use super::decision::{Decision, Resolution};
use super::error::OrchestratorError;
use super::journal::{Execution, ExecutionId, JournalEntry};
use super::query::{CaseQuery, CaseSnapshot};
use super::retry::RetryPolicy;
use super::signal::SignalChannel;
use super::store::CaseStore;
use super::utils::idempotency_key;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything one case needs while it is being driven.
pub(crate) struct CaseRun {
    pub(crate) exec: Execution,
    state: CaseRecord,
    publisher: watch::Sender<CaseSnapshot>,
    activities: Arc<dyn LoanActivities>,
    notification_policy: RetryPolicy,
    compensations: Vec<CompensationStep>,
    inbox_cursor: Option<u64>,
}

impl CaseRun {
    pub(crate) fn case(&self) -> &Case {
        &self.state.case
    }

    pub(crate) fn case_id(&self) -> &str {
        &self.state.case.case_id
    }

    fn publish(&self) {
        self.publisher.send_replace(CaseSnapshot::from(&self.state));
    }

    /// Append a history entry, moving the case to `status` when given.
    ///
    /// The entry and the resulting case snapshot are committed together. On
    /// replay the journaled entry is applied instead, original timestamp
    /// included.
    pub(crate) fn record(
        &mut self,
        status: Option<CaseStatus>,
        message: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let entry = HistoryEntry {
            timestamp: self.exec.now().into(),
            message: message.into(),
            status,
        };

        let entry = if self.exec.is_replaying() {
            match self.exec.remember(JournalEntry::Recorded { entry })? {
                JournalEntry::Recorded { entry } => {
                    self.state.apply(&entry)?;
                    entry
                }
                other => {
                    return Err(self.exec.diverged("recorded", &other));
                }
            }
        } else {
            self.state.apply(&entry)?;
            let state = &self.state;
            self.exec
                .remember_with(JournalEntry::Recorded { entry: entry.clone() }, |batch| {
                    CaseStore::stage_case(batch, state)
                })?;
            entry
        };

        match entry.status {
            Some(status) => info!(case_id = self.case_id(), %status, message = %entry.message, "case transitioned"),
            None => debug!(case_id = self.case_id(), message = %entry.message, "history recorded"),
        }
        self.publish();
        Ok(())
    }

    pub(crate) fn set_risk_assessment(&mut self, assessment: RiskAssessment) {
        self.state.risk_assessment = Some(assessment);
    }

    pub(crate) fn set_disbursement(&mut self, disbursement: Disbursement) {
        self.state.disbursement = Some(disbursement);
    }

    pub(crate) fn cancel_disbursement(&mut self) {
        if let Some(disbursement) = self.state.disbursement.as_mut() {
            disbursement.status = DisbursementStatus::Cancelled;
        }
    }

    pub(crate) fn push_compensation(&mut self, step: CompensationStep) {
        self.compensations.push(step);
    }

    pub(crate) fn pop_compensation(&mut self) -> Option<CompensationStep> {
        self.compensations.pop()
    }

    /// Send a notification. Delivery failures are logged and otherwise ignored.
    pub(crate) async fn notify(&mut self, kind: NotificationKind) -> Result<(), OrchestratorError> {
        let notification = Notification {
            case_id: self.state.case.case_id.clone(),
            user_id: self.state.case.applicant.user_id.clone(),
            kind,
        };
        let activities = self.activities.clone();
        let sent = self
            .exec
            .activity(
                ActivityKind::SendNotification,
                &self.notification_policy,
                || activities.send_notification(&notification),
            )
            .await?;
        if let Err(failure) = sent {
            warn!(case_id = %notification.case_id, kind = ?notification.kind, %failure, "notification not delivered");
        }
        Ok(())
    }

    fn complete(&mut self, outcome: Outcome, store: &CaseStore) -> Result<(), OrchestratorError> {
        self.state.outcome = Some(outcome);
        store.finish_case(&self.state)?;
        self.publish();
        Ok(())
    }
}

pub struct LoanOriginationStateMachine {
    store: CaseStore,
    activities: Arc<dyn LoanActivities>,
    clock: Arc<dyn Clock>,
    config: Arc<OrchestratorConfig>,
    signals: SignalChannel,
    compensation: CompensationManager,
    follow_ups: ContinuationScheduler,
}

impl LoanOriginationStateMachine {
    pub fn new(
        store: CaseStore,
        activities: Arc<dyn LoanActivities>,
        clock: Arc<dyn Clock>,
        config: Arc<OrchestratorConfig>,
        signals: SignalChannel,
        follow_ups: ContinuationScheduler,
    ) -> Self {
        let compensation = CompensationManager::new(
            activities.clone(),
            config.retries.compensation.clone(),
        );
        Self {
            store,
            activities,
            clock,
            config,
            signals,
            compensation,
            follow_ups,
        }
    }

    /// Open the execution of `case`, resuming its journal if it has one.
    pub(crate) fn start(&self, case: Case) -> Result<(CaseRun, CaseQuery), OrchestratorError> {
        let exec = Execution::resume(
            ExecutionId::Case(case.case_id.clone()),
            self.store.clone(),
            self.clock.clone(),
        )?;

        let state = CaseRecord::new(case);
        if self.store.load_case(&state.case.case_id)?.is_none() {
            self.store.save_case(&state)?;
        }

        let (publisher, snapshot) = watch::channel(CaseSnapshot::from(&state));
        let run = CaseRun {
            exec,
            state,
            publisher,
            activities: self.activities.clone(),
            notification_policy: self.config.retries.notification.clone(),
            compensations: vec![],
            inbox_cursor: None,
        };
        Ok((run, CaseQuery::new(snapshot)))
    }

    /// Run a case from its first step to a terminal outcome.
    pub async fn process_case(&self, case: Case) -> Result<Outcome, OrchestratorError> {
        let (run, _) = self.start(case)?;
        self.drive(run).await
    }

    pub(crate) async fn drive(&self, mut run: CaseRun) -> Result<Outcome, OrchestratorError> {
        let outcome = self.run_steps(&mut run).await;
        self.signals.release(run.case_id()).await;
        let outcome = outcome?;

        self.drain_signals(&mut run)?;
        run.complete(outcome.clone(), &self.store)?;
        info!(case_id = run.case_id(), ?outcome, "case finished");
        Ok(outcome)
    }

    #[tracing::instrument(skip_all, fields(case_id = %run.case_id()))]
    async fn run_steps(&self, run: &mut CaseRun) -> Result<Outcome, OrchestratorError> {
        let retries = &self.config.retries;
        let case = run.case().clone();
        let activities = self.activities.clone();

        // documents
        run.record(
            Some(CaseStatus::DocumentValidation),
            format!("Validating {} document(s)", case.documents.len()),
        )?;
        let validation = run
            .exec
            .activity(ActivityKind::ValidateDocuments, &retries.validation, || {
                activities.validate_documents(&case)
            })
            .await?;
        let validation = match validation {
            Ok(validation) => validation,
            Err(failure) => return self.fail(run, failure.to_string()).await,
        };
        if !validation.valid {
            let reason = validation
                .reason
                .unwrap_or_else(|| "documents could not be verified".to_string());
            return self
                .reject(run, format!("Document validation failed: {reason}"), reason)
                .await;
        }

        // risk
        run.record(
            Some(CaseStatus::RiskScoring),
            "Documents validated, scoring risk",
        )?;
        let assessment = run
            .exec
            .activity(ActivityKind::ScoreRisk, &retries.risk_scoring, || {
                activities.score_risk(&case)
            })
            .await?;
        let assessment = match assessment {
            Ok(assessment) => assessment,
            Err(failure) => return self.fail(run, failure.to_string()).await,
        };
        run.set_risk_assessment(assessment.clone());
        if assessment.risk_level == RiskLevel::VeryHigh {
            let reason = format!(
                "risk level {} (score {})",
                assessment.risk_level, assessment.score
            );
            return self
                .reject(run, format!("Automatically rejected: {reason}"), reason)
                .await;
        }

        // approval
        run.record(
            Some(CaseStatus::AwaitingApproval),
            format!(
                "Risk assessed as {} (score {}), awaiting approval",
                assessment.risk_level, assessment.score
            ),
        )?;
        run.notify(NotificationKind::ApplicationReceived).await?;
        let deadline = run.exec.schedule_timer(self.config.approval_timeout())?;

        match self.await_decision(run, deadline).await? {
            Resolution::TimedOut => {
                run.record(
                    Some(CaseStatus::Expired),
                    "No decision before the approval deadline, application expired",
                )?;
                self.drain_signals(run)?;
                run.notify(NotificationKind::Expired).await?;
                return Ok(Outcome::Expired);
            }
            Resolution::Rejected { by, reason, notes } => {
                let message = match notes {
                    Some(notes) => format!("Rejected by {by}: {reason} ({notes})"),
                    None => format!("Rejected by {by}: {reason}"),
                };
                return self.reject(run, message, reason).await;
            }
            Resolution::Approved { by, notes } => {
                let message = match notes {
                    Some(notes) => format!("Approved by {by} ({notes})"),
                    None => format!("Approved by {by}"),
                };
                run.record(Some(CaseStatus::Approved), message)?;
                self.drain_signals(run)?;
            }
        }

        // disbursement
        run.record(
            Some(CaseStatus::Disbursing),
            format!("Disbursing {}", case.requested_amount),
        )?;
        let key = idempotency_key(&case.case_id, ActivityKind::DisburseFunds.as_str());
        run.push_compensation(CompensationStep::ReverseDisbursement {
            idempotency_key: key.clone(),
        });
        let disbursed = run
            .exec
            .activity(ActivityKind::DisburseFunds, &retries.disbursement, || {
                activities.disburse_funds(&case, &key)
            })
            .await?;

        match disbursed {
            Ok(disbursement) if disbursement.status == DisbursementStatus::Completed => {
                let transaction_id = disbursement.transaction_id.clone();
                let amount = disbursement.amount;
                run.set_disbursement(disbursement);
                run.pop_compensation();
                run.record(
                    Some(CaseStatus::Disbursed),
                    format!("Disbursed {amount}, transaction {transaction_id}"),
                )?;
                run.notify(NotificationKind::Disbursed {
                    transaction_id: transaction_id.clone(),
                    amount,
                })
                .await?;
                self.hand_off(run).await?;
                Ok(Outcome::Disbursed { transaction_id })
            }
            Ok(disbursement) => {
                let reason = disbursement.failure_reason.clone().unwrap_or_else(|| {
                    format!("payment rail reported {:?}", disbursement.status)
                });
                run.set_disbursement(disbursement);
                self.compensate_and_fail(run, reason).await
            }
            Err(failure) => self.compensate_and_fail(run, failure.to_string()).await,
        }
    }

    /// Wait for the first terminal decision or the deadline, whichever
    /// comes first.
    async fn await_decision(
        &self,
        run: &mut CaseRun,
        deadline: DateTime<Utc>,
    ) -> Result<Resolution, OrchestratorError> {
        let waker = self.signals.waker(run.case_id()).await;
        let clock = run.exec.clock().clone();

        loop {
            if let Some(resolution) = Self::replayed_resolution(run) {
                return Ok(resolution);
            }

            for signal in self.store.signals_after(run.case_id(), run.inbox_cursor)? {
                if let Some(resolution) = Self::replayed_resolution(run) {
                    return Ok(resolution);
                }
                // decided after the window closed; left for the drain
                if signal.delivered_at.to_datetime_utc() > deadline {
                    break;
                }
                run.inbox_cursor = Some(signal.seq);
                if let Decision::RequestMoreInfo { message } = &signal.decision {
                    run.record(None, format!("More information requested: {message}"))?;
                    continue;
                }
                if let Some(resolution) = Resolution::from_decision(signal.decision) {
                    return Self::resolve(run, resolution);
                }
            }

            if run.exec.now() >= deadline {
                return Self::resolve(run, Resolution::TimedOut);
            }

            tokio::select! {
                _ = waker.notified() => {}
                _ = clock.sleep_until(deadline) => {}
            }
        }
    }

    fn replayed_resolution(run: &mut CaseRun) -> Option<Resolution> {
        let (resolution, cursor) = run.exec.replayed_resolution()?;
        run.inbox_cursor = cursor;
        Some(resolution)
    }

    fn resolve(run: &mut CaseRun, resolution: Resolution) -> Result<Resolution, OrchestratorError> {
        let entry = JournalEntry::DecisionResolved {
            resolution,
            cursor: run.inbox_cursor,
        };
        match run.exec.remember(entry)? {
            JournalEntry::DecisionResolved { resolution, cursor } => {
                run.inbox_cursor = cursor;
                debug!(case_id = run.case_id(), ?resolution, "approval wait resolved");
                Ok(resolution)
            }
            other => Err(run.exec.diverged("decision_resolved", &other)),
        }
    }

    /// Record every decision still in the inbox. None of them has an effect
    /// on the case anymore.
    fn drain_signals(&self, run: &mut CaseRun) -> Result<(), OrchestratorError> {
        let pending = self.store.signals_after(run.case_id(), run.inbox_cursor)?;
        let upto = pending.last().map(|signal| signal.seq).or(run.inbox_cursor);
        let upto = match run.exec.remember(JournalEntry::SignalsDrained { upto })? {
            JournalEntry::SignalsDrained { upto } => upto,
            other => {
                return Err(run.exec.diverged("signals_drained", &other));
            }
        };

        for signal in pending
            .into_iter()
            .take_while(|signal| upto.is_some_and(|upto| signal.seq <= upto))
        {
            run.inbox_cursor = Some(signal.seq);
            let message = match &signal.decision {
                Decision::RequestMoreInfo { .. } => {
                    format!("Ignored, case no longer awaiting approval: {}", signal.decision.describe())
                }
                decision => format!("Ignored, case already decided: {}", decision.describe()),
            };
            run.record(None, message)?;
        }
        Ok(())
    }

    async fn reject(
        &self,
        run: &mut CaseRun,
        message: String,
        reason: String,
    ) -> Result<Outcome, OrchestratorError> {
        run.record(Some(CaseStatus::Rejected), message)?;
        self.drain_signals(run)?;
        run.notify(NotificationKind::Rejected {
            reason: reason.clone(),
        })
        .await?;
        Ok(Outcome::Rejected { reason })
    }

    /// A step gave up before any money moved: nothing to undo.
    async fn fail(&self, run: &mut CaseRun, reason: String) -> Result<Outcome, OrchestratorError> {
        warn!(case_id = run.case_id(), %reason, "case failed");
        run.record(Some(CaseStatus::Failed), format!("Processing failed: {reason}"))?;
        run.notify(NotificationKind::ProcessingFailed {
            reason: reason.clone(),
        })
        .await?;
        Ok(Outcome::Failed { reason })
    }

    async fn compensate_and_fail(
        &self,
        run: &mut CaseRun,
        reason: String,
    ) -> Result<Outcome, OrchestratorError> {
        warn!(case_id = run.case_id(), %reason, "disbursement failed, compensating");
        self.compensation.compensate(run, &reason).await?;
        run.record(
            Some(CaseStatus::Failed),
            format!("Disbursement failed: {reason}"),
        )?;
        Ok(Outcome::Failed { reason })
    }

    /// Start the follow-up schedule exactly once per case.
    async fn hand_off(&self, run: &mut CaseRun) -> Result<(), OrchestratorError> {
        let case_id = run.case_id().to_string();
        let user_id = run.case().applicant.user_id.clone();

        let replaying = run.exec.is_replaying();
        if !replaying {
            self.follow_ups.prepare(&case_id, &user_id)?;
        }
        run.exec.remember(JournalEntry::HandedOff)?;
        if !replaying {
            self.follow_ups.spawn(&case_id, &user_id).await;
        }
        Ok(())
    }
}
