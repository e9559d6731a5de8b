//! Reconciliation projection
//!
//! A denormalized, rebuildable copy of ledger state annotated with the sync
//! status of the last rail submission for each bounty. Used for querying and
//! auditing only; the ledger stays authoritative.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rail::Confirmation;
use crate::types::{Bounty, BountyId, BountyStatus, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Confirmed,
    Failed,
    /// Replaced by a newer submission for the same work item
    Superseded,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Confirmed => "confirmed",
            SyncState::Failed => "failed",
            SyncState::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncState::Pending),
            "confirmed" => Some(SyncState::Confirmed),
            "failed" => Some(SyncState::Failed),
            "superseded" => Some(SyncState::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    #[serde(flatten)]
    pub bounty: Bounty,
    pub sync_state: SyncState,
    pub submission_ref: Option<String>,
    pub settlement_ref: Option<String>,
    pub confirmation_height: Option<u64>,
    pub confirmation_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Upsert the projected bounty as pending. Older unconfirmed records for the
    /// same dedupe key are marked superseded.
    async fn record_pending(&self, bounty: &Bounty, submission_ref: &str) -> Result<()>;

    async fn confirm(
        &self,
        bounty_id: BountyId,
        settlement_ref: &str,
        confirmation: &Confirmation,
    ) -> Result<()>;

    /// Mark the last submission failed. When `committed` is given the row's
    /// bounty fields are reset to it.
    async fn mark_failed(
        &self,
        bounty_id: BountyId,
        reason: &str,
        committed: Option<&Bounty>,
    ) -> Result<()>;

    async fn get(&self, bounty_id: BountyId) -> Result<Option<ReconciliationRecord>>;

    /// Newest first
    async fn by_work_item(
        &self,
        repository: &str,
        issue_id: u64,
    ) -> Result<Vec<ReconciliationRecord>>;

    async fn by_creator(
        &self,
        creator: &Principal,
        status: Option<BountyStatus>,
    ) -> Result<Vec<ReconciliationRecord>>;

    async fn by_solver(&self, solver: &Principal) -> Result<Vec<ReconciliationRecord>>;

    /// Replace the projection with confirmed rows for `bounties`. Returns the row count.
    async fn rebuild(&self, bounties: &[Bounty]) -> Result<usize>;

    /// Largest bounty id with a row, pending and failed included
    async fn highest_bounty_id(&self) -> Result<Option<BountyId>>;
}

/// Split a confirmation into its (height, time) columns
pub(crate) fn confirmation_columns(
    confirmation: &Confirmation,
) -> (Option<u64>, Option<DateTime<Utc>>) {
    match confirmation {
        Confirmation::Height(h) => (Some(*h), None),
        Confirmation::Time(t) => (None, Some(*t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_roundtrip_names() {
        for state in [
            SyncState::Pending,
            SyncState::Confirmed,
            SyncState::Failed,
            SyncState::Superseded,
        ] {
            assert_eq!(SyncState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SyncState::parse("done"), None);
    }

    #[test]
    fn test_confirmation_columns() {
        assert_eq!(
            confirmation_columns(&Confirmation::Height(7)),
            (Some(7), None)
        );
        let now = Utc::now();
        assert_eq!(
            confirmation_columns(&Confirmation::Time(now)),
            (None, Some(now))
        );
    }
}
