//! Service layer API for loan origination
use super::activity::LoanActivities;
use super::case::{Case, Outcome};
use super::clock::Clock;
use super::config::OrchestratorConfig;
use super::continuation::ContinuationScheduler;
use super::decision::Decision;
use super::error::OrchestratorError;
use super::query::CaseQuery;
use super::signal::SignalChannel;
use super::state_machine::{CaseRun, LoanOriginationStateMachine};
use super::store::CaseStore;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Work picked up again by [`Orchestrator::recover`].
pub struct Recovery {
    pub cases: Vec<(String, JoinHandle<anyhow::Result<Outcome>>)>,
    pub follow_ups: Vec<(String, JoinHandle<Result<(), OrchestratorError>>)>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: CaseStore,
    machine: LoanOriginationStateMachine,
    signals: SignalChannel,
    follow_ups: ContinuationScheduler,
    // query side of every case driven by this process
    live: Mutex<HashMap<String, CaseQuery>>,
}

impl Orchestrator {
    pub fn new(
        instance: Arc<sled::Db>,
        activities: Arc<dyn LoanActivities>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store = CaseStore::new(instance);
        let signals = SignalChannel::new(store.clone(), clock.clone());
        let follow_ups = ContinuationScheduler::new(
            store.clone(),
            activities.clone(),
            clock.clone(),
            config.follow_up.clone(),
            config.retries.notification.clone(),
        );
        let machine = LoanOriginationStateMachine::new(
            store.clone(),
            activities,
            clock,
            config,
            signals.clone(),
            follow_ups.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                machine,
                signals,
                follow_ups,
                live: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &CaseStore {
        &self.inner.store
    }

    pub fn follow_ups(&self) -> &ContinuationScheduler {
        &self.inner.follow_ups
    }

    /// Drive a case to its outcome. A case that already finished returns its
    /// stored outcome; a case left unfinished by a crash resumes where it
    /// stopped.
    pub async fn process_case(&self, case: Case) -> anyhow::Result<Outcome> {
        let case_id = case.case_id.clone();

        // Finished cases are never run twice
        if let Some(outcome) = self
            .inner
            .store
            .load_case(&case_id)?
            .and_then(|record| record.outcome)
        {
            return Ok(outcome);
        }

        let run = self.register(case).await?;
        self.drive(case_id, run).await
    }

    async fn register(&self, case: Case) -> anyhow::Result<CaseRun> {
        let mut live = self.inner.live.lock().await;
        if live.contains_key(&case.case_id) {
            return Err(OrchestratorError::AlreadyRunning(case.case_id).into());
        }

        let case_id = case.case_id.clone();
        let (run, query) = self
            .inner
            .machine
            .start(case)
            .with_context(|| format!("failed to open case {case_id}"))?;
        live.insert(case_id, query);
        Ok(run)
    }

    async fn drive(&self, case_id: String, run: CaseRun) -> anyhow::Result<Outcome> {
        let outcome = self.inner.machine.drive(run).await;
        self.inner.live.lock().await.remove(&case_id);
        outcome.with_context(|| format!("case {case_id} stopped before reaching an outcome"))
    }

    /// Approve a case awaiting approval
    pub async fn approve(
        &self,
        case_id: String,
        approved_by: String,
        notes: Option<String>,
    ) -> anyhow::Result<()> {
        self.signal(
            &case_id,
            Decision::Approve {
                by: approved_by,
                notes,
            },
        )
        .await
    }

    /// Reject a case awaiting approval
    pub async fn reject(
        &self,
        case_id: String,
        rejected_by: String,
        reason: String,
        notes: Option<String>,
    ) -> anyhow::Result<()> {
        self.signal(
            &case_id,
            Decision::Reject {
                by: rejected_by,
                reason,
                notes,
            },
        )
        .await
    }

    /// Ask the applicant for more information. Recorded, never decides the case.
    pub async fn request_more_info(&self, case_id: String, message: String) -> anyhow::Result<()> {
        self.signal(&case_id, Decision::RequestMoreInfo { message })
            .await
    }

    async fn signal(&self, case_id: &str, decision: Decision) -> anyhow::Result<()> {
        self.inner
            .signals
            .deliver(case_id, decision)
            .await
            .with_context(|| format!("failed to deliver decision to case {case_id}"))
    }

    /// Read-only view of a case, live while it runs and from storage after.
    pub async fn query(&self, case_id: &str) -> anyhow::Result<CaseQuery> {
        if let Some(query) = self.inner.live.lock().await.get(case_id) {
            return Ok(query.clone());
        }
        match self.inner.store.load_case(case_id)? {
            Some(record) => Ok(CaseQuery::from_record(&record)),
            None => Err(OrchestratorError::UnknownCase(case_id.to_string()).into()),
        }
    }

    /// Resume every unfinished case and every follow-up schedule found in
    /// storage. Call once after opening the database. Work this process is
    /// already driving is left alone.
    pub async fn recover(&self) -> anyhow::Result<Recovery> {
        let mut recovery = Recovery {
            cases: vec![],
            follow_ups: vec![],
        };

        for record in self.inner.store.cases()? {
            if record.outcome.is_some() {
                continue;
            }
            let case_id = record.case.case_id.clone();
            let run = match self.register(record.case).await {
                Ok(run) => run,
                Err(err)
                    if matches!(
                        err.downcast_ref::<OrchestratorError>(),
                        Some(OrchestratorError::AlreadyRunning(_))
                    ) =>
                {
                    debug!(case_id = %case_id, "case already running, not recovered");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let orchestrator = self.clone();
            let task_case_id = case_id.clone();
            let handle = tokio::spawn(async move { orchestrator.drive(task_case_id, run).await });
            recovery.cases.push((case_id, handle));
        }

        for cursor in self.inner.store.cursors()? {
            if let Some(handle) = self
                .inner
                .follow_ups
                .spawn(&cursor.case_id, &cursor.user_id)
                .await
            {
                recovery.follow_ups.push((cursor.case_id, handle));
            }
        }

        info!(
            cases = recovery.cases.len(),
            follow_ups = recovery.follow_ups.len(),
            "recovered in-flight work"
        );
        Ok(recovery)
    }
}
