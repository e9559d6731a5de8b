//! Core bounty types shared by the ledger, the gateway and the reconciliation store

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::{is_valid_hex_address, normalize_hex_address};

/// Monotonically assigned bounty identifier
pub type BountyId = u64;

/// Amount in the active rail's atomic units
pub type Amount = u128;

/// Basis-point denominator for fee math
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Highest fee rate an admin may configure (10%)
pub const FEE_CAP_BPS: u32 = 1_000;

/// A principal is identified by its address on the active rail.
///
/// Hex addresses are case-insensitive on the custodial chain and are stored
/// lowercased. SS58 addresses are case-sensitive and kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let lowered = normalize_hex_address(&address);
        if is_valid_hex_address(&lowered) {
            Self(lowered)
        } else {
            Self(address)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Principal {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Principal> for String {
    fn from(p: Principal) -> Self {
        p.0
    }
}

/// Lifecycle status. Active is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BountyStatus {
    Active,
    Claimed,
    Cancelled,
    Expired,
}

impl BountyStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BountyStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BountyStatus::Active => "active",
            BountyStatus::Claimed => "claimed",
            BountyStatus::Cancelled => "cancelled",
            BountyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BountyStatus::Active),
            "claimed" => Some(BountyStatus::Claimed),
            "cancelled" => Some(BountyStatus::Cancelled),
            "expired" => Some(BountyStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for BountyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness key for a work item: sha256 over `lowercase(repository):issue_id`.
pub fn dedupe_key(repository: &str, issue_id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository.trim().to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(issue_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounty {
    pub id: BountyId,
    pub dedupe_key: String,
    pub repository: String,
    pub issue_id: u64,
    pub issue_url: String,
    pub creator: Principal,
    pub solver: Option<Principal>,
    pub solver_identity: Option<String>,
    pub pull_request_url: Option<String>,
    pub initial_amount: Amount,
    pub current_amount: Amount,
    pub max_amount: Amount,
    pub status: BountyStatus,
    pub created_at: u64,
    pub claimed_at: Option<u64>,
    pub closed_at: Option<u64>,
    /// 0 means the bounty never expires
    pub expires_at: u64,
    pub escalation_count: u32,
}

impl Bounty {
    pub fn is_active(&self) -> bool {
        self.status == BountyStatus::Active
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }

    /// Amount still open for escalation before `max_amount` is reached
    pub fn headroom(&self) -> Amount {
        self.max_amount.saturating_sub(self.current_amount)
    }

    /// Checks the per-bounty value invariant.
    pub fn amounts_consistent(&self) -> bool {
        self.initial_amount <= self.current_amount && self.current_amount <= self.max_amount
    }
}

/// Parameters for a new bounty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBounty {
    pub repository: String,
    pub issue_id: u64,
    pub issue_url: String,
    pub amount: Amount,
    pub max_amount: Amount,
    #[serde(default)]
    pub expires_at: u64,
}

/// Split of a released amount between solver and fee recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub amount: Amount,
    pub fee: Amount,
    pub payout: Amount,
}

impl FeeSplit {
    /// `fee = floor(amount * bps / 10000)`, `payout = amount - fee`
    pub fn compute(amount: Amount, fee_rate_bps: u32) -> Self {
        let bps = fee_rate_bps.min(BPS_DENOMINATOR) as Amount;
        // Split the multiplication so amounts near u128::MAX cannot overflow.
        let denom = BPS_DENOMINATOR as Amount;
        let fee = (amount / denom) * bps + (amount % denom) * bps / denom;
        Self {
            amount,
            fee,
            payout: amount - fee,
        }
    }
}

/// Ledger-level economic configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub min_amount: Amount,
    pub max_amount: Amount,
    pub fee_rate_bps: u32,
    pub fee_recipient: Principal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_key_is_case_insensitive_on_repository() {
        assert_eq!(
            dedupe_key("PlatformNetwork/Bounty", 42),
            dedupe_key("platformnetwork/bounty", 42)
        );
        assert_ne!(
            dedupe_key("platformnetwork/bounty", 42),
            dedupe_key("platformnetwork/bounty", 43)
        );
        assert_eq!(dedupe_key("a/b", 1).len(), 64);
    }

    #[test]
    fn test_fee_split_truncates() {
        let split = FeeSplit::compute(150, 250);
        assert_eq!(split.fee, 3);
        assert_eq!(split.payout, 147);
        assert_eq!(split.fee + split.payout, 150);
    }

    #[test]
    fn test_fee_split_no_leak_on_large_amounts() {
        let amount = u128::MAX - 7;
        let split = FeeSplit::compute(amount, 999);
        assert_eq!(split.fee + split.payout, amount);

        let zero = FeeSplit::compute(12345, 0);
        assert_eq!(zero.fee, 0);
        assert_eq!(zero.payout, 12345);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!BountyStatus::Active.is_terminal());
        assert!(BountyStatus::Claimed.is_terminal());
        assert!(BountyStatus::Cancelled.is_terminal());
        assert!(BountyStatus::Expired.is_terminal());
        assert_eq!(BountyStatus::parse("expired"), Some(BountyStatus::Expired));
        assert_eq!(BountyStatus::parse("nope"), None);
    }

    #[test]
    fn test_principal_normalizes_hex_case() {
        let mixed = Principal::new("0x00000000000000000000000000000000000000AB");
        assert_eq!(mixed, Principal::from("0x00000000000000000000000000000000000000ab"));
        assert_eq!(mixed.as_str(), "0x00000000000000000000000000000000000000ab");

        let ss58 = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
        assert_eq!(Principal::new(ss58).as_str(), ss58);

        let parsed: Principal =
            serde_json::from_str("\"0x00000000000000000000000000000000000000AB\"").unwrap();
        assert_eq!(parsed, mixed);
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            "\"0x00000000000000000000000000000000000000ab\""
        );
    }
}
