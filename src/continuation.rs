//! Post-disbursement follow-up schedule.
//!
//! One cycle sends a follow-up at each configured day offset, then restarts
//! itself as a fresh execution with the cycle number bumped. The finished
//! cycle's journal is deleted in the same write that stores the next cursor,
//! so storage per case stays constant however long the schedule runs.
use super::activity::{ActivityKind, LoanActivities, Notification, NotificationKind};
use super::clock::Clock;
use super::config::FollowUpConfig;
use super::error::OrchestratorError;
use super::journal::{Execution, ExecutionId, offset_from};
use super::retry::RetryPolicy;
use super::store::CaseStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a case's follow-up schedule stands. The only thing carried from one
/// cycle into the next.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FollowUpCursor {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub cycle_number: u32,
}

impl FollowUpCursor {
    pub fn first(case_id: &str, user_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            user_id: user_id.to_string(),
            cycle_number: 1,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            cycle_number: self.cycle_number.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        ExecutionId::FollowUp {
            case_id: self.case_id.clone(),
            cycle: self.cycle_number,
        }
    }
}

#[derive(Clone)]
pub struct ContinuationScheduler {
    store: CaseStore,
    activities: Arc<dyn LoanActivities>,
    clock: Arc<dyn Clock>,
    config: FollowUpConfig,
    notification_policy: RetryPolicy,
    running: Arc<Mutex<HashSet<String>>>,
}

impl ContinuationScheduler {
    pub fn new(
        store: CaseStore,
        activities: Arc<dyn LoanActivities>,
        clock: Arc<dyn Clock>,
        config: FollowUpConfig,
        notification_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            activities,
            clock,
            config,
            notification_policy,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Store the first cursor for a case unless one exists already, and
    /// return whichever cursor is current.
    pub fn prepare(&self, case_id: &str, user_id: &str) -> Result<FollowUpCursor, OrchestratorError> {
        let first = FollowUpCursor::first(case_id, user_id);
        if self.store.insert_cursor_if_absent(&first)? {
            return Ok(first);
        }
        Ok(self.store.load_cursor(case_id)?.unwrap_or(first))
    }

    /// Run the schedule of a case in the background. `None` when this
    /// process already runs it.
    pub async fn spawn(
        &self,
        case_id: &str,
        user_id: &str,
    ) -> Option<JoinHandle<Result<(), OrchestratorError>>> {
        if !self.running.lock().await.insert(case_id.to_string()) {
            debug!(case_id, "follow-up schedule already running");
            return None;
        }

        let scheduler = self.clone();
        let case_id = case_id.to_string();
        let user_id = user_id.to_string();
        Some(tokio::spawn(async move {
            let result = scheduler.run_follow_up_cycle(&case_id, &user_id).await;
            scheduler.running.lock().await.remove(&case_id);
            if let Err(err) = &result {
                error!(case_id = %case_id, error = %err, "follow-up schedule stopped");
            }
            result
        }))
    }

    /// Drive the schedule from its stored cursor until `max_cycles` is reached.
    /// Without a limit this never returns on its own.
    #[tracing::instrument(skip(self))]
    pub async fn run_follow_up_cycle(
        &self,
        case_id: &str,
        user_id: &str,
    ) -> Result<(), OrchestratorError> {
        let mut cursor = self.prepare(case_id, user_id)?;
        loop {
            if self
                .config
                .max_cycles
                .is_some_and(|max| cursor.cycle_number > max)
            {
                self.store.finish_follow_up(&cursor.execution_id(), case_id)?;
                info!(cycles = cursor.cycle_number - 1, "follow-up schedule complete");
                return Ok(());
            }
            cursor = self.run_cycle(cursor).await?;
        }
    }

    async fn run_cycle(&self, cursor: FollowUpCursor) -> Result<FollowUpCursor, OrchestratorError> {
        let mut exec = Execution::resume(
            cursor.execution_id(),
            self.store.clone(),
            self.clock.clone(),
        )?;
        let anchor = exec.schedule_timer(Duration::ZERO)?;
        debug!(cycle = cursor.cycle_number, %anchor, "follow-up cycle started");

        for (index, day) in self.config.offsets_days.iter().enumerate() {
            let after = self.config.offset(index).unwrap_or_default();
            exec.sleep_until(offset_from(anchor, after)).await?;

            let notification = Notification {
                case_id: cursor.case_id.clone(),
                user_id: cursor.user_id.clone(),
                kind: NotificationKind::FollowUp {
                    cycle: cursor.cycle_number,
                    day: *day,
                },
            };
            let activities = self.activities.clone();
            let sent = exec
                .activity(
                    ActivityKind::SendNotification,
                    &self.notification_policy,
                    || activities.send_notification(&notification),
                )
                .await?;
            match sent {
                Ok(()) => debug!(cycle = cursor.cycle_number, day, "follow-up sent"),
                Err(failure) => {
                    warn!(cycle = cursor.cycle_number, day, %failure, "follow-up not delivered")
                }
            }
        }

        let next = cursor.next();
        self.store.continue_as_new(exec.id(), &next)?;
        info!(next_cycle = next.cycle_number, "follow-up cycle continued as new");
        Ok(next)
    }
}
