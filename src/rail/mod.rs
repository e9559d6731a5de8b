//! Settlement rails
//!
//! A rail moves value in and out of escrow custody. Two mutually exclusive
//! rails exist and one is selected at startup:
//!
//! - [`CustodialRail`]: value sits in a vault account on a token ledger the
//!   escrow itself drives (allowance + transfer-from semantics, gas budget).
//! - [`ServiceRail`]: value sits in an escrow account held by an external
//!   balance-transfer service.
//!
//! Every movement is a two-step `submit` / `await_confirmation`. Dropping the
//! await never retracts a submission; callers re-query with `lookup`.
//! Submissions carry a caller-chosen key. Resubmitting under the same key never
//! moves value twice, and `find_submission` recovers the submission reference
//! when the reply to `submit` was lost.

pub mod custodial;
pub mod service;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RailError;
use crate::types::{Amount, BountyId};

pub use custodial::{ChainParams, ChainSnapshot, CustodialRail, TokenChain};
pub use service::{HttpTransferService, InMemoryTransferService, ServiceRail, TransferService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailKind {
    Custodial,
    Service,
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RailKind::Custodial => f.write_str("custodial"),
            RailKind::Service => f.write_str("service"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub to: String,
    pub amount: Amount,
}

/// A value movement requested from a rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Movement {
    /// Pull `amount` from `from` into escrow custody
    Lock { from: String, amount: Amount },
    /// Pay out of custody; all transfers settle together or none do
    Release { transfers: Vec<Transfer> },
    /// Pay from the operator treasury, outside escrow custody
    Direct { to: String, amount: Amount },
}

impl Movement {
    pub fn total(&self) -> Amount {
        match self {
            Movement::Lock { amount, .. } | Movement::Direct { amount, .. } => *amount,
            Movement::Release { transfers } => transfers.iter().map(|t| t.amount).sum(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Movement::Lock { .. } => "lock",
            Movement::Release { .. } => "release",
            Movement::Direct { .. } => "direct",
        }
    }
}

/// Returned by `submit`; identifies the submission for awaiting or re-querying
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHandle {
    pub submission_ref: String,
    pub rail: RailKind,
    pub bounty_id: Option<BountyId>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Confirmation {
    /// Block height on the custodial chain
    Height(u64),
    /// Settlement time reported by the transfer service
    Time(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedReceipt {
    pub submission_ref: String,
    pub settlement_ref: String,
    pub confirmation: Confirmation,
}

/// Rail-side view of a past submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionState {
    Pending,
    Confirmed(ConfirmedReceipt),
    Failed(RailError),
    /// The rail has no record of the submission
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Existing authorization already covers the amount
    Sufficient,
    /// An approval was submitted and confirmed
    Approved(ConfirmedReceipt),
    /// The rail has no authorization step (balance was checked)
    NotRequired,
}

/// Network-fee budget available to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeHeadroom {
    pub available: Amount,
    pub per_submission: Amount,
}

impl FeeHeadroom {
    pub fn covers(&self, submissions: u64) -> bool {
        self.per_submission
            .checked_mul(submissions as Amount)
            .map(|needed| needed <= self.available)
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait SettlementRail: Send + Sync {
    fn kind(&self) -> RailKind;

    /// Decimal places of one token in atomic units
    fn decimals(&self) -> u32;

    /// Account holding escrowed value
    fn custody_account(&self) -> &str;

    /// Account paying network fees and funding direct payments
    fn operator_account(&self) -> &str;

    /// Rail-specific syntax check. Never panics on malformed input.
    fn validate_address(&self, address: &str) -> bool;

    /// Make sure `owner` can fund a lock of `amount` into custody.
    async fn ensure_authorization(
        &self,
        owner: &str,
        amount: Amount,
    ) -> Result<Authorization, RailError>;

    async fn balance_of(&self, account: &str) -> Result<Amount, RailError>;

    async fn fee_headroom(&self) -> Result<FeeHeadroom, RailError>;

    /// Submit under an idempotency key. A repeated key returns the original
    /// submission instead of moving value again.
    async fn submit_keyed(
        &self,
        movement: Movement,
        bounty_id: Option<BountyId>,
        key: Uuid,
    ) -> Result<PendingHandle, RailError>;

    /// Reference of the submission accepted under `key`, if the rail has one
    async fn find_submission(&self, key: Uuid) -> Result<Option<String>, RailError>;

    async fn submit(
        &self,
        movement: Movement,
        bounty_id: Option<BountyId>,
    ) -> Result<PendingHandle, RailError> {
        self.submit_keyed(movement, bounty_id, Uuid::new_v4()).await
    }

    /// Suspends until the submission settles or fails.
    async fn await_confirmation(
        &self,
        handle: &PendingHandle,
    ) -> Result<ConfirmedReceipt, RailError>;

    async fn lookup(&self, submission_ref: &str) -> Result<SubmissionState, RailError>;

    async fn custody_balance(&self) -> Result<Amount, RailError> {
        self.balance_of(self.custody_account()).await
    }
}

/// The configured rail, fixed for the life of the process
pub enum Rail {
    Custodial(CustodialRail),
    ServiceBacked(ServiceRail),
}

impl Rail {
    fn inner(&self) -> &dyn SettlementRail {
        match self {
            Rail::Custodial(rail) => rail,
            Rail::ServiceBacked(rail) => rail,
        }
    }

    pub fn as_custodial(&self) -> Option<&CustodialRail> {
        match self {
            Rail::Custodial(rail) => Some(rail),
            Rail::ServiceBacked(_) => None,
        }
    }
}

#[async_trait]
impl SettlementRail for Rail {
    fn kind(&self) -> RailKind {
        self.inner().kind()
    }

    fn decimals(&self) -> u32 {
        self.inner().decimals()
    }

    fn custody_account(&self) -> &str {
        self.inner().custody_account()
    }

    fn operator_account(&self) -> &str {
        self.inner().operator_account()
    }

    fn validate_address(&self, address: &str) -> bool {
        self.inner().validate_address(address)
    }

    async fn ensure_authorization(
        &self,
        owner: &str,
        amount: Amount,
    ) -> Result<Authorization, RailError> {
        self.inner().ensure_authorization(owner, amount).await
    }

    async fn balance_of(&self, account: &str) -> Result<Amount, RailError> {
        self.inner().balance_of(account).await
    }

    async fn fee_headroom(&self) -> Result<FeeHeadroom, RailError> {
        self.inner().fee_headroom().await
    }

    async fn submit_keyed(
        &self,
        movement: Movement,
        bounty_id: Option<BountyId>,
        key: Uuid,
    ) -> Result<PendingHandle, RailError> {
        self.inner().submit_keyed(movement, bounty_id, key).await
    }

    async fn find_submission(&self, key: Uuid) -> Result<Option<String>, RailError> {
        self.inner().find_submission(key).await
    }

    async fn await_confirmation(
        &self,
        handle: &PendingHandle,
    ) -> Result<ConfirmedReceipt, RailError> {
        self.inner().await_confirmation(handle).await
    }

    async fn lookup(&self, submission_ref: &str) -> Result<SubmissionState, RailError> {
        self.inner().lookup(submission_ref).await
    }

    async fn custody_balance(&self) -> Result<Amount, RailError> {
        self.inner().custody_balance().await
    }
}
