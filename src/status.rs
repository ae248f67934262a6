//! Requisition status and the legal transitions between them
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequisitionStatus {
    #[n(0)]
    PendingApproval,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Process,
    #[n(4)]
    Closed,
    #[n(5)]
    Canceled,
}

impl RequisitionStatus {
    pub const ALL: [RequisitionStatus; 6] = [
        RequisitionStatus::PendingApproval,
        RequisitionStatus::Approved,
        RequisitionStatus::Rejected,
        RequisitionStatus::Process,
        RequisitionStatus::Closed,
        RequisitionStatus::Canceled,
    ];

    /// Token embedded in relation strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequisitionStatus::PendingApproval => "PENDING_APPROVAL",
            RequisitionStatus::Approved => "APPROVED",
            RequisitionStatus::Rejected => "REJECTED",
            RequisitionStatus::Process => "PROCESS",
            RequisitionStatus::Closed => "CLOSED",
            RequisitionStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequisitionStatus::Closed | RequisitionStatus::Canceled)
    }

    /// The transition table. Cancellation is open to every non-terminal state.
    pub fn can_transition_to(&self, next: RequisitionStatus) -> bool {
        use RequisitionStatus::*;

        match (self, next) {
            (PendingApproval, Approved | Rejected) => true,
            (Rejected, PendingApproval) => true,
            (Approved, Process) => true,
            (Process, Closed) => true,
            (current, Canceled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RequisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown requisition status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for RequisitionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequisitionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::RequisitionStatus::*;
    use super::*;

    #[test]
    fn approval_only_from_pending() {
        for status in RequisitionStatus::ALL {
            assert_eq!(status.can_transition_to(Approved), status == PendingApproval);
            assert_eq!(status.can_transition_to(Rejected), status == PendingApproval);
        }
    }

    #[test]
    fn process_only_from_approved() {
        for status in RequisitionStatus::ALL {
            assert_eq!(status.can_transition_to(Process), status == Approved);
        }
    }

    #[test]
    fn terminal_states_cannot_be_canceled() {
        assert!(!Closed.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Canceled));
        assert!(Process.can_transition_to(Canceled));
        assert!(PendingApproval.can_transition_to(Canceled));
    }

    #[test]
    fn tokens_parse_back() {
        for status in RequisitionStatus::ALL {
            assert_eq!(status.as_str().parse::<RequisitionStatus>(), Ok(status));
        }
        assert!("PROCCESS".parse::<RequisitionStatus>().is_err());
    }

    #[test]
    fn serde_uses_tokens() {
        let json = serde_json::to_string(&PendingApproval).unwrap();
        assert_eq!(json, "\"PENDING_APPROVAL\"");
    }
}
