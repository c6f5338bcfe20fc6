//! Externally originated decisions and how the approval wait resolved

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    #[n(0)]
    Approve {
        #[n(0)]
        by: String,
        #[n(1)]
        notes: Option<String>,
    },
    #[n(1)]
    Reject {
        #[n(0)]
        by: String,
        #[n(1)]
        reason: String,
        #[n(2)]
        notes: Option<String>,
    },
    #[n(2)]
    RequestMoreInfo {
        #[n(0)]
        message: String,
    },
}

impl Decision {
    /// Approve and Reject settle the case; only the first one delivered counts.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::RequestMoreInfo { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Decision::Approve { by, notes } => match notes {
                Some(notes) => format!("approved by {by} ({notes})"),
                None => format!("approved by {by}"),
            },
            Decision::Reject { by, reason, .. } => format!("rejected by {by}: {reason}"),
            Decision::RequestMoreInfo { message } => {
                format!("more information requested: {message}")
            }
        }
    }
}

/// How the wait for a decision ended. Exactly one of these per case.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    #[n(0)]
    Approved {
        #[n(0)]
        by: String,
        #[n(1)]
        notes: Option<String>,
    },
    #[n(1)]
    Rejected {
        #[n(0)]
        by: String,
        #[n(1)]
        reason: String,
        #[n(2)]
        notes: Option<String>,
    },
    #[n(2)]
    TimedOut,
}

impl Resolution {
    /// `None` for decisions that do not settle the case.
    pub fn from_decision(decision: Decision) -> Option<Self> {
        match decision {
            Decision::Approve { by, notes } => Some(Resolution::Approved { by, notes }),
            Decision::Reject { by, reason, notes } => {
                Some(Resolution::Rejected { by, reason, notes })
            }
            Decision::RequestMoreInfo { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_approve_and_reject_are_terminal() {
        let approve = Decision::Approve {
            by: "officer".into(),
            notes: None,
        };
        let reject = Decision::Reject {
            by: "officer".into(),
            reason: "income".into(),
            notes: None,
        };
        let info = Decision::RequestMoreInfo {
            message: "payslips".into(),
        };

        assert!(approve.is_terminal());
        assert!(reject.is_terminal());
        assert!(!info.is_terminal());
    }

    #[test]
    fn more_info_never_resolves_the_wait() {
        let info = Decision::RequestMoreInfo {
            message: "bank statement".into(),
        };
        let approve = Decision::Approve {
            by: "officer".into(),
            notes: Some("ok".into()),
        };

        assert_eq!(Resolution::from_decision(info), None);
        assert_eq!(
            Resolution::from_decision(approve),
            Some(Resolution::Approved {
                by: "officer".into(),
                notes: Some("ok".into()),
            })
        );
    }

    #[test]
    fn describe_includes_actor_and_reason() {
        let reject = Decision::Reject {
            by: "officer_7".into(),
            reason: "insufficient income".into(),
            notes: Some("see file".into()),
        };

        assert_eq!(
            reject.describe(),
            "rejected by officer_7: insufficient income"
        );
    }
}
