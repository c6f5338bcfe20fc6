//! Delivery of external decisions into running cases.
//!
//! A delivered decision is written to the case inbox first and only then is
//! the case woken. The inbox is durable and ordered, so a decision sent before
//! the case starts waiting, or while the process is down, is still seen.
//! Only the execution driving the case reads the inbox and applies decisions.
use super::clock::Clock;
use super::decision::Decision;
use super::error::OrchestratorError;
use super::store::CaseStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Clone)]
pub struct SignalChannel {
    store: CaseStore,
    clock: Arc<dyn Clock>,
    wakers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl SignalChannel {
    pub fn new(store: CaseStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            wakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Never fails because of the decision itself: duplicates and late
    /// decisions are accepted and later ignored by the case. Decisions for a
    /// case that already has an outcome are dropped without being stored.
    pub async fn deliver(&self, case_id: &str, decision: Decision) -> Result<(), OrchestratorError> {
        if self
            .store
            .load_case(case_id)?
            .is_some_and(|record| record.outcome.is_some())
        {
            debug!(case_id, ?decision, "case already finished, decision dropped");
            return Ok(());
        }
        let seq = self
            .store
            .append_signal(case_id, &decision, self.clock.now().into())?;
        debug!(case_id, seq, ?decision, "decision delivered");
        // a case registers before reading its inbox, so an unregistered case
        // will find this decision on its own
        if let Some(waker) = self.wakers.lock().await.get(case_id) {
            waker.notify_one();
        }
        Ok(())
    }

    /// Handle the case waits on. A wake-up sent before anyone waits is kept.
    pub async fn waker(&self, case_id: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().await;
        wakers
            .entry(case_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub async fn release(&self, case_id: &str) {
        self.wakers.lock().await.remove(case_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn wake_up_before_wait_is_not_lost() {
        let temp_dir = tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("signals.db")).unwrap();
        let store = CaseStore::new(Arc::new(db));
        let channel = SignalChannel::new(store.clone(), Arc::new(TokioClock::new()));
        let waker = channel.waker("case_s").await;

        channel
            .deliver(
                "case_s",
                Decision::Approve {
                    by: "officer".into(),
                    notes: None,
                },
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .expect("stored permit wakes the waiter");

        assert_eq!(store.signals_after("case_s", None).unwrap().len(), 1);
    }
}
