//! Durable storage for cases, step journals, signal inboxes and follow-up cursors.
//!
//! Everything lives in one sled tree under string prefixes:
//!
//! | key                                   | value             |
//! |---------------------------------------|-------------------|
//! | `case/<case>`                         | [`CaseRecord`]    |
//! | `journal/case/<case>/<seq>`           | [`JournalEntry`]  |
//! | `journal/followup/<case>/<cycle>/<seq>` | [`JournalEntry`] |
//! | `inbox/<case>/<seq>`                  | [`SignalRecord`]  |
//! | `followup/<case>`                     | [`FollowUpCursor`] |
//!
//! Sequence numbers are zero padded so key order is numeric order.
use super::case::{CaseRecord, TimeStamp};
use super::continuation::FollowUpCursor;
use super::decision::Decision;
use super::error::OrchestratorError;
use super::journal::{ExecutionId, JournalEntry};
use chrono::Utc;
use sled::Batch;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SignalRecord {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub decision: Decision,
    #[n(2)]
    pub delivered_at: TimeStamp<Utc>,
}

#[derive(Clone)]
pub struct CaseStore {
    instance: Arc<sled::Db>,
}

pub(crate) fn encode<T: minicbor::Encode<()>>(
    what: &str,
    value: &T,
) -> Result<Vec<u8>, OrchestratorError> {
    minicbor::to_vec(value).map_err(|e| OrchestratorError::Encode(format!("{what}: {e}")))
}

fn case_key(case_id: &str) -> String {
    format!("case/{case_id}")
}

fn inbox_prefix(case_id: &str) -> String {
    format!("inbox/{case_id}/")
}

fn cursor_key(case_id: &str) -> String {
    format!("followup/{case_id}")
}

fn journal_key(execution: &ExecutionId, seq: u64) -> String {
    format!("{}{seq:020}", execution.journal_prefix())
}

impl CaseStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn apply(&self, batch: Batch) -> Result<(), OrchestratorError> {
        self.instance.apply_batch(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), OrchestratorError> {
        self.instance.flush()?;
        Ok(())
    }

    // cases

    pub fn load_case(&self, case_id: &str) -> Result<Option<CaseRecord>, OrchestratorError> {
        match self.instance.get(case_key(case_id))? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_case(&self, record: &CaseRecord) -> Result<(), OrchestratorError> {
        let mut batch = Batch::default();
        Self::stage_case(&mut batch, record)?;
        self.apply(batch)
    }

    pub fn stage_case(batch: &mut Batch, record: &CaseRecord) -> Result<(), OrchestratorError> {
        batch.insert(
            case_key(&record.case.case_id).as_bytes(),
            encode("case record", record)?,
        );
        Ok(())
    }

    /// Store the finished record and drop the case journal and inbox with it.
    /// A case with an outcome is never replayed, so neither is read again.
    pub fn finish_case(&self, record: &CaseRecord) -> Result<(), OrchestratorError> {
        let case_id = &record.case.case_id;
        let mut batch = Batch::default();
        Self::stage_case(&mut batch, record)?;
        self.stage_journal_removal(&mut batch, &ExecutionId::Case(case_id.clone()))?;
        for item in self.instance.scan_prefix(inbox_prefix(case_id)) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.apply(batch)
    }

    pub fn cases(&self) -> Result<Vec<CaseRecord>, OrchestratorError> {
        self.instance
            .scan_prefix("case/")
            .map(|item| {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    // journals

    pub fn load_journal(
        &self,
        execution: &ExecutionId,
    ) -> Result<Vec<JournalEntry>, OrchestratorError> {
        self.instance
            .scan_prefix(execution.journal_prefix())
            .map(|item| {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    pub fn stage_journal(
        batch: &mut Batch,
        execution: &ExecutionId,
        seq: u64,
        entry: &JournalEntry,
    ) -> Result<(), OrchestratorError> {
        batch.insert(
            journal_key(execution, seq).as_bytes(),
            encode("journal entry", entry)?,
        );
        Ok(())
    }

    fn stage_journal_removal(
        &self,
        batch: &mut Batch,
        execution: &ExecutionId,
    ) -> Result<(), OrchestratorError> {
        for item in self.instance.scan_prefix(execution.journal_prefix()) {
            let (key, _) = item?;
            batch.remove(key);
        }
        Ok(())
    }

    pub fn journal_len(&self, execution: &ExecutionId) -> usize {
        self.instance
            .scan_prefix(execution.journal_prefix())
            .keys()
            .count()
    }

    // signal inbox

    /// Append a decision to the case inbox. Order of delivery is kept.
    pub fn append_signal(
        &self,
        case_id: &str,
        decision: &Decision,
        delivered_at: TimeStamp<Utc>,
    ) -> Result<u64, OrchestratorError> {
        let seq = self.instance.generate_id()?;
        let record = SignalRecord {
            seq,
            decision: decision.clone(),
            delivered_at,
        };
        self.instance.insert(
            format!("{}{seq:020}", inbox_prefix(case_id)),
            encode("signal", &record)?,
        )?;
        Ok(seq)
    }

    /// Signals delivered after `cursor`, oldest first.
    pub fn signals_after(
        &self,
        case_id: &str,
        cursor: Option<u64>,
    ) -> Result<Vec<SignalRecord>, OrchestratorError> {
        let mut signals = vec![];
        for item in self.instance.scan_prefix(inbox_prefix(case_id)) {
            let (_, bytes) = item?;
            let record: SignalRecord = minicbor::decode(&bytes)?;
            if cursor.is_none_or(|c| record.seq > c) {
                signals.push(record);
            }
        }
        Ok(signals)
    }

    // follow-up cursors

    pub fn load_cursor(&self, case_id: &str) -> Result<Option<FollowUpCursor>, OrchestratorError> {
        match self.instance.get(cursor_key(case_id))? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns false when a cursor for the case already exists.
    pub fn insert_cursor_if_absent(
        &self,
        cursor: &FollowUpCursor,
    ) -> Result<bool, OrchestratorError> {
        let swapped = self.instance.compare_and_swap(
            cursor_key(&cursor.case_id),
            None as Option<&[u8]>,
            Some(encode("follow-up cursor", cursor)?),
        )?;
        Ok(swapped.is_ok())
    }

    pub fn cursors(&self) -> Result<Vec<FollowUpCursor>, OrchestratorError> {
        self.instance
            .scan_prefix("followup/")
            .map(|item| {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    /// Drop everything the finished cycle accumulated and hand over to `next`
    /// in one atomic write.
    pub fn continue_as_new(
        &self,
        finished: &ExecutionId,
        next: &FollowUpCursor,
    ) -> Result<(), OrchestratorError> {
        let mut batch = Batch::default();
        self.stage_journal_removal(&mut batch, finished)?;
        batch.insert(
            cursor_key(&next.case_id).as_bytes(),
            encode("follow-up cursor", next)?,
        );
        self.apply(batch)
    }

    pub fn finish_follow_up(
        &self,
        finished: &ExecutionId,
        case_id: &str,
    ) -> Result<(), OrchestratorError> {
        let mut batch = Batch::default();
        self.stage_journal_removal(&mut batch, finished)?;
        batch.remove(cursor_key(case_id).as_bytes());
        self.apply(batch)
    }

    /// Number of keys the follow-up schedule of a case currently occupies.
    pub fn follow_up_footprint(&self, case_id: &str) -> Result<usize, OrchestratorError> {
        let journal = self
            .instance
            .scan_prefix(format!("journal/followup/{case_id}/"))
            .keys()
            .count();
        let cursor = usize::from(self.instance.contains_key(cursor_key(case_id))?);
        Ok(journal + cursor)
    }
}
