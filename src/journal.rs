//! Step journal and the replaying execution context.
//!
//! Each execution (a case, or one follow-up cycle) appends a [`JournalEntry`]
//! for every step whose result must not change across a restart. When an
//! execution is resumed the code runs again from the top; every step first
//! consumes the next journaled entry and only does real work once the journal
//! is exhausted.
use super::activity::ActivityKind;
use super::case::{HistoryEntry, TimeStamp};
use super::clock::Clock;
use super::decision::Resolution;
use super::error::{ActivityError, ActivityFailure, OrchestratorError};
use super::retry::RetryPolicy;
use super::store::{CaseStore, encode};
use chrono::{DateTime, Utc};
use sled::Batch;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// `at + after`, saturating at the far end of the calendar.
pub fn offset_from(at: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|offset| at.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionId {
    Case(String),
    FollowUp { case_id: String, cycle: u32 },
}

impl ExecutionId {
    pub fn journal_prefix(&self) -> String {
        match self {
            ExecutionId::Case(case_id) => format!("journal/case/{case_id}/"),
            ExecutionId::FollowUp { case_id, cycle } => {
                format!("journal/followup/{case_id}/{cycle:010}/")
            }
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionId::Case(case_id) => write!(f, "{case_id}"),
            ExecutionId::FollowUp { case_id, cycle } => write!(f, "{case_id}#follow-up-{cycle}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum JournalEntry {
    #[n(0)]
    ActivityCompleted {
        #[n(0)]
        activity: ActivityKind,
        #[n(1)]
        #[cbor(with = "minicbor::bytes")]
        output: Vec<u8>, // cbor of the activity result
    },
    #[n(1)]
    ActivityFailed {
        #[n(0)]
        activity: ActivityKind,
        #[n(1)]
        attempts: u32,
        #[n(2)]
        reason: String,
    },
    #[n(2)]
    TimerScheduled {
        #[n(0)]
        deadline: TimeStamp<Utc>,
    },
    #[n(3)]
    TimerFired,
    #[n(4)]
    Recorded {
        #[n(0)]
        entry: HistoryEntry,
    },
    #[n(5)]
    DecisionResolved {
        #[n(0)]
        resolution: Resolution,
        #[n(1)]
        cursor: Option<u64>, // last inbox signal consumed by the wait
    },
    #[n(6)]
    SignalsDrained {
        #[n(0)]
        upto: Option<u64>,
    },
    #[n(7)]
    HandedOff,
}

impl JournalEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            JournalEntry::ActivityCompleted { .. } | JournalEntry::ActivityFailed { .. } => {
                "activity"
            }
            JournalEntry::TimerScheduled { .. } => "timer_scheduled",
            JournalEntry::TimerFired => "timer_fired",
            JournalEntry::Recorded { .. } => "recorded",
            JournalEntry::DecisionResolved { .. } => "decision_resolved",
            JournalEntry::SignalsDrained { .. } => "signals_drained",
            JournalEntry::HandedOff => "handed_off",
        }
    }
}

pub struct Execution {
    id: ExecutionId,
    store: CaseStore,
    clock: Arc<dyn Clock>,
    seq: u64,
    pending: VecDeque<JournalEntry>,
}

impl Execution {
    /// Open an execution, loading whatever it journaled before.
    pub fn resume(
        id: ExecutionId,
        store: CaseStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OrchestratorError> {
        let pending: VecDeque<JournalEntry> = store.load_journal(&id)?.into();
        if !pending.is_empty() {
            debug!(execution = %id, steps = pending.len(), "replaying journal");
        }

        Ok(Self {
            id,
            store,
            clock,
            seq: 0,
            pending,
        })
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn is_replaying(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn diverged(&self, expected: &'static str, found: &JournalEntry) -> OrchestratorError {
        OrchestratorError::NonDeterministicReplay {
            execution: self.id.to_string(),
            seq: self.seq,
            expected,
            found: found.kind(),
        }
    }

    fn take_replayed(
        &mut self,
        expected: &'static str,
    ) -> Result<Option<JournalEntry>, OrchestratorError> {
        match self.pending.front() {
            None => Ok(None),
            Some(found) if found.kind() != expected => Err(self.diverged(expected, found)),
            Some(_) => {
                self.seq += 1;
                Ok(self.pending.pop_front())
            }
        }
    }

    fn append<F>(&mut self, entry: &JournalEntry, stage: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut Batch) -> Result<(), OrchestratorError>,
    {
        let mut batch = Batch::default();
        CaseStore::stage_journal(&mut batch, &self.id, self.seq, entry)?;
        stage(&mut batch)?;
        self.store.apply(batch)?;
        self.seq += 1;
        Ok(())
    }

    /// Journal `entry`, or hand back the entry journaled at this step.
    pub fn remember(&mut self, entry: JournalEntry) -> Result<JournalEntry, OrchestratorError> {
        self.remember_with(entry, |_| Ok(()))
    }

    /// Like [`Execution::remember`], staging extra writes into the same batch.
    /// The extra writes are skipped on replay; they were committed with the entry.
    pub fn remember_with<F>(
        &mut self,
        entry: JournalEntry,
        stage: F,
    ) -> Result<JournalEntry, OrchestratorError>
    where
        F: FnOnce(&mut Batch) -> Result<(), OrchestratorError>,
    {
        if let Some(recorded) = self.take_replayed(entry.kind())? {
            return Ok(recorded);
        }
        self.append(&entry, stage)?;
        Ok(entry)
    }

    /// Consume a journaled approval resolution if it is the next step.
    pub fn replayed_resolution(&mut self) -> Option<(Resolution, Option<u64>)> {
        if !matches!(
            self.pending.front(),
            Some(JournalEntry::DecisionResolved { .. })
        ) {
            return None;
        }
        self.seq += 1;
        match self.pending.pop_front() {
            Some(JournalEntry::DecisionResolved { resolution, cursor }) => {
                Some((resolution, cursor))
            }
            _ => None,
        }
    }

    /// Fix a deadline `after` from now. The deadline survives restarts.
    pub fn schedule_timer(&mut self, after: Duration) -> Result<DateTime<Utc>, OrchestratorError> {
        let deadline = offset_from(self.clock.now(), after);
        match self.remember(JournalEntry::TimerScheduled {
            deadline: deadline.into(),
        })? {
            JournalEntry::TimerScheduled { deadline } => Ok(deadline.to_datetime_utc()),
            other => Err(self.diverged("timer_scheduled", &other)),
        }
    }

    pub async fn sleep_until(&mut self, deadline: DateTime<Utc>) -> Result<(), OrchestratorError> {
        if self.take_replayed("timer_fired")?.is_some() {
            return Ok(());
        }
        self.clock.sleep_until(deadline).await;
        self.append(&JournalEntry::TimerFired, |_| Ok(()))
    }

    /// Run an activity with `policy`, or return the result it journaled.
    ///
    /// The outer error is an infrastructure failure. The inner one is the
    /// activity giving up, which is journaled like a success.
    pub async fn activity<T, F, Fut>(
        &mut self,
        kind: ActivityKind,
        policy: &RetryPolicy,
        mut attempt: F,
    ) -> Result<Result<T, ActivityFailure>, OrchestratorError>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        if let Some(recorded) = self.take_replayed("activity")? {
            return match recorded {
                JournalEntry::ActivityCompleted { activity, output } if activity == kind => {
                    Ok(Ok(minicbor::decode(&output)?))
                }
                JournalEntry::ActivityFailed {
                    activity,
                    attempts,
                    reason,
                } if activity == kind => Ok(Err(ActivityFailure {
                    activity,
                    attempts,
                    reason,
                })),
                other => Err(OrchestratorError::NonDeterministicReplay {
                    execution: self.id.to_string(),
                    seq: self.seq - 1,
                    expected: kind.as_str(),
                    found: match &other {
                        JournalEntry::ActivityCompleted { activity, .. }
                        | JournalEntry::ActivityFailed { activity, .. } => activity.as_str(),
                        _ => other.kind(),
                    },
                }),
            };
        }

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_retryable() && policy.has_attempts_left(attempts) => {
                    let delay = policy.backoff(attempts);
                    debug!(
                        execution = %self.id,
                        activity = %kind,
                        attempts,
                        ?delay,
                        error = %err,
                        "retrying activity"
                    );
                    let wake = offset_from(self.clock.now(), delay);
                    self.clock.sleep_until(wake).await;
                }
                Err(err) => {
                    break Err(ActivityFailure {
                        activity: kind,
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
        };

        let entry = match &result {
            Ok(value) => JournalEntry::ActivityCompleted {
                activity: kind,
                output: encode("activity output", value)?,
            },
            Err(failure) => JournalEntry::ActivityFailed {
                activity: kind,
                attempts: failure.attempts,
                reason: failure.reason.clone(),
            },
        };
        self.append(&entry, |_| Ok(()))?;

        Ok(result)
    }
}
