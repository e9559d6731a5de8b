//! Error taxonomy for the escrow core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Amount, BountyId, BountyStatus, Principal};

/// Broad classes callers use to decide how to react to a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any state change. Safe to retry after correction.
    Validation,
    /// Wrong principal for the operation. Never retried automatically.
    Authorization,
    /// Bounty not in the required status. The caller should re-read state.
    StateConflict,
    /// Settlement submission failed. Retry with backoff after re-checking the rail.
    Rail,
    /// Should be unreachable. Fatal for the operation.
    InvariantViolation,
}

/// Failure causes surfaced by a settlement rail
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RailError {
    #[error("insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: Amount, available: Amount },

    #[error("insufficient allowance: needed {needed}, approved {approved}")]
    InsufficientAllowance { needed: Amount, approved: Amount },

    #[error("insufficient network fee budget: needed {needed}, available {available}")]
    InsufficientFeeBudget { needed: Amount, available: Amount },

    #[error("rail congested, submission not accepted")]
    Congested,

    #[error("confirmation timed out for submission {submission_ref}")]
    Timeout { submission_ref: String },

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RailError {
    /// Congestion, timeouts and transport failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RailError::Congested | RailError::Timeout { .. } | RailError::Transport(_)
        )
    }

    /// The rail may have accepted the submission even though the call failed.
    /// Every other cause is a rejection before anything was accepted.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RailError::Timeout { .. } | RailError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("bounty {0} not found")]
    NotFound(BountyId),

    #[error("bounty {id} is {status}, not active")]
    NotActive { id: BountyId, status: BountyStatus },

    #[error("{principal} is not authorized to {action}")]
    Unauthorized {
        principal: Principal,
        action: &'static str,
        bounty_id: Option<BountyId>,
    },

    #[error("work item {repository}#{issue_id} already has active bounty {existing}")]
    DuplicateWorkItem {
        repository: String,
        issue_id: u64,
        existing: BountyId,
    },

    #[error("amount {amount} out of range [{min}, {max}]")]
    AmountOutOfRange { amount: Amount, min: Amount, max: Amount },

    #[error("escalating bounty {id} by {additional} would exceed its cap of {max}")]
    CapExceeded {
        id: BountyId,
        additional: Amount,
        max: Amount,
    },

    #[error("expiry {expires_at} is not in the future (now {now})")]
    InvalidExpiry { expires_at: u64, now: u64 },

    #[error("bounty {id} expires at {expires_at}, now {now}")]
    NotYetExpired { id: BountyId, expires_at: u64, now: u64 },

    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("system is paused")]
    SystemPaused,

    #[error("bounty {id} has a settlement in flight")]
    SettlementInFlight { id: BountyId },

    #[error("rail error: {source}")]
    Rail {
        bounty_id: Option<BountyId>,
        #[source]
        source: RailError,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Ledger state could not be made durable; the operation was not submitted
    #[error("failed to persist ledger state: {0}")]
    Persistence(String),
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::AmountOutOfRange { .. }
            | EscrowError::CapExceeded { .. }
            | EscrowError::InvalidExpiry { .. }
            | EscrowError::InvalidRecipient(_)
            | EscrowError::InvalidAmount(_)
            | EscrowError::InvalidConfig(_) => ErrorKind::Validation,
            EscrowError::Unauthorized { .. } => ErrorKind::Authorization,
            EscrowError::NotFound(_)
            | EscrowError::NotActive { .. }
            | EscrowError::DuplicateWorkItem { .. }
            | EscrowError::NotYetExpired { .. }
            | EscrowError::SystemPaused
            | EscrowError::SettlementInFlight { .. } => ErrorKind::StateConflict,
            EscrowError::Rail { .. } => ErrorKind::Rail,
            EscrowError::InvariantViolation(_) | EscrowError::Persistence(_) => {
                ErrorKind::InvariantViolation
            }
        }
    }

    pub fn bounty_id(&self) -> Option<BountyId> {
        match self {
            EscrowError::NotFound(id)
            | EscrowError::NotActive { id, .. }
            | EscrowError::CapExceeded { id, .. }
            | EscrowError::NotYetExpired { id, .. }
            | EscrowError::SettlementInFlight { id } => Some(*id),
            EscrowError::DuplicateWorkItem { existing, .. } => Some(*existing),
            EscrowError::Unauthorized { bounty_id, .. } | EscrowError::Rail { bounty_id, .. } => {
                *bounty_id
            }
            _ => None,
        }
    }

    /// Whether an automated caller may retry (after re-verifying rail state)
    pub fn is_retryable(&self) -> bool {
        match self {
            EscrowError::Rail { source, .. } => source.is_transient(),
            EscrowError::SettlementInFlight { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn rail(bounty_id: Option<BountyId>, source: RailError) -> Self {
        EscrowError::Rail { bounty_id, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EscrowError::NotFound(1).kind(), ErrorKind::StateConflict);
        assert_eq!(
            EscrowError::InvalidRecipient("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EscrowError::Unauthorized {
                principal: Principal::from("0xabc"),
                action: "cancel",
                bounty_id: Some(4),
            }
            .kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            EscrowError::rail(Some(2), RailError::Congested).kind(),
            ErrorKind::Rail
        );
    }

    #[test]
    fn test_error_carries_bounty_id() {
        let err = EscrowError::NotActive {
            id: 9,
            status: BountyStatus::Claimed,
        };
        assert_eq!(err.bounty_id(), Some(9));
        assert_eq!(err.to_string(), "bounty 9 is claimed, not active");

        let err = EscrowError::rail(Some(3), RailError::Congested);
        assert_eq!(err.bounty_id(), Some(3));
        assert_eq!(err.to_string(), "rail error: rail congested, submission not accepted");
    }

    #[test]
    fn test_retryable() {
        assert!(EscrowError::rail(None, RailError::Congested).is_retryable());
        assert!(!EscrowError::rail(
            None,
            RailError::InsufficientBalance {
                needed: 10,
                available: 1
            }
        )
        .is_retryable());
        assert!(!EscrowError::SystemPaused.is_retryable());
    }

    #[test]
    fn test_ambiguous_rail_errors() {
        assert!(RailError::Transport("connection reset".into()).is_ambiguous());
        assert!(RailError::Timeout {
            submission_ref: "7".into()
        }
        .is_ambiguous());
        assert!(!RailError::Congested.is_ambiguous());
        assert!(!RailError::Rejected("bad".into()).is_ambiguous());
    }
}
