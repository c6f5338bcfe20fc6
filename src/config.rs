//! Orchestrator configuration, passed in at construction
use super::error::OrchestratorError;
use super::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Longest approval window accepted. Deadlines are journaled as nanosecond
/// timestamps, which run out in 2262.
pub const MAX_APPROVAL_TIMEOUT_SECS: u64 = 10 * 365 * DAY_SECS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long a case waits for an approve or reject decision.
    pub approval_timeout_secs: u64,
    pub retries: RetryPolicies,
    pub follow_up: FollowUpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub validation: RetryPolicy,
    pub risk_scoring: RetryPolicy,
    // kept short: a blind retry risks paying twice
    pub disbursement: RetryPolicy,
    pub compensation: RetryPolicy,
    pub notification: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    /// Cumulative offsets from the start of a cycle. The last one ends the cycle.
    pub offsets_days: Vec<u32>,
    /// Stop after this many cycles. Unset means the schedule never ends.
    pub max_cycles: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 7 * DAY_SECS,
            retries: RetryPolicies::default(),
            follow_up: FollowUpConfig::default(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            validation: RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(10), 3),
            risk_scoring: RetryPolicy::new(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(30),
                5,
            ),
            disbursement: RetryPolicy::new(
                Duration::from_secs(5),
                2.0,
                Duration::from_secs(60),
                2,
            ),
            compensation: RetryPolicy::new(
                Duration::from_secs(5),
                2.0,
                Duration::from_secs(300),
                10,
            ),
            notification: RetryPolicy::new(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(10),
                3,
            ),
        }
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            offsets_days: vec![30, 90, 180, 270, 365],
            max_cycles: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, OrchestratorError> {
        let config: OrchestratorConfig =
            toml::from_str(content).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.approval_timeout_secs > MAX_APPROVAL_TIMEOUT_SECS {
            return Err(OrchestratorError::Config(format!(
                "approval_timeout_secs must be at most {MAX_APPROVAL_TIMEOUT_SECS}, got {}",
                self.approval_timeout_secs
            )));
        }

        let policies = [
            ("validation", &self.retries.validation),
            ("risk_scoring", &self.retries.risk_scoring),
            ("disbursement", &self.retries.disbursement),
            ("compensation", &self.retries.compensation),
            ("notification", &self.retries.notification),
        ];
        for (name, policy) in policies {
            policy
                .validate()
                .map_err(|e| OrchestratorError::Config(format!("retries.{name}: {e}")))?;
        }

        let offsets = &self.follow_up.offsets_days;
        if offsets.is_empty() {
            return Err(OrchestratorError::Config(
                "follow_up.offsets_days must not be empty".into(),
            ));
        }
        if offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OrchestratorError::Config(
                "follow_up.offsets_days must be strictly increasing".into(),
            ));
        }
        Ok(())
    }
}

impl FollowUpConfig {
    pub fn offset(&self, index: usize) -> Option<Duration> {
        self.offsets_days
            .get(index)
            .map(|days| Duration::from_secs(u64::from(*days) * DAY_SECS))
    }
}
