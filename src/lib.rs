//! Bounty Escrow - escrow ledger and dual-rail payment gateway for bug-fix bounties
//!
//! Creators lock value against a work item (repository + issue). When a pull
//! request resolves the issue with passing tests, an oracle releases the
//! bounty to the solver less a protocol fee. Unclaimed bounties are refunded
//! on cancellation or expiry.
//!
//! # How it works
//!
//! 1. The gateway makes sure the creator authorized the lock (allowance or balance)
//! 2. The ledger journals the planned transition and submits the movement to the rail
//! 3. Once the rail confirms, the transition is committed and projected into
//!    the reconciliation store
//!
//! # Settlement rails
//!
//! - Custodial: a token ledger with allowances and a gas budget, value held in a vault
//! - Service: an external balance-transfer service, value held in an escrow account
//!
//! # Guarantees
//!
//! - Value in custody always covers the sum of active bounty amounts
//! - At most one active bounty per work item
//! - A bounty pays out at most once and never above its cap

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod pg_storage;
pub mod rail;
pub mod reconciliation;
pub mod roles;
pub mod server;
pub mod storage;
pub mod types;
pub mod units;
pub mod workflow;

pub use auth::{is_valid_hex_address, is_valid_ss58_address};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ErrorKind, EscrowError, RailError};
pub use gateway::{OnChain, PaymentGateway, PaymentReceipt};
pub use ledger::{
    CustodyReport, EscrowLedger, InFlight, LedgerSettings, LedgerSnapshot, ReleaseReceipt,
    Resolution,
};
pub use pg_storage::PgStore;
pub use rail::{Rail, RailKind, SettlementRail};
pub use reconciliation::{ReconciliationRecord, ReconciliationStore, SyncState};
pub use roles::{Role, RoleRegistry};
pub use storage::SqliteStore;
pub use types::{
    dedupe_key, Amount, Bounty, BountyId, BountyStatus, CreateBounty, FeeSplit, LedgerConfig,
    Principal,
};
pub use workflow::{
    OracleReleaseWorkflow, PayoutDirectory, ReleaseOutcome, ResolutionSignal, RetryPolicy,
    SkipReason, StaticPayoutDirectory,
};
