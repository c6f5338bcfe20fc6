//! Wall-clock time and durable timers
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `deadline` has passed. Returns at once for past deadlines.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Wall-clock anchored on the tokio timer.
///
/// `now()` advances with `tokio::time`, so a paused runtime moves it along
/// with the timers it drives.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor_instant.elapsed())
            .unwrap_or(chrono::Duration::MAX);
        self.anchor_wall + elapsed
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - self.now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}
