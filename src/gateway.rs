//! Payment gateway
//!
//! Front door for value movements on the configured rail. Locking operations
//! are preceded by a spending-authorization step, direct payments come out of
//! the operator treasury, and everything touching a bounty is forwarded to the
//! escrow ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EscrowError, RailError};
use crate::ledger::{EscrowLedger, ReleaseReceipt};
use crate::rail::{Authorization, ConfirmedReceipt, Movement, Rail, RailKind, SettlementRail};
use crate::types::{Amount, Bounty, BountyId, CreateBounty, FeeSplit, Principal};
use crate::units::{format_units, parse_units};

/// Result of an operation that only exists on the custodial rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum OnChain<T> {
    Applied(T),
    NotApplicable,
}

impl<T> OnChain<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            OnChain::Applied(value) => Some(value),
            OnChain::NotApplicable => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub recipient: String,
    pub amount: Amount,
    pub bounty_id: Option<BountyId>,
    pub receipt: ConfirmedReceipt,
}

pub struct PaymentGateway {
    rail: Arc<Rail>,
    ledger: Arc<EscrowLedger>,
    timeout: Duration,
}

impl PaymentGateway {
    pub fn new(ledger: Arc<EscrowLedger>) -> Self {
        Self {
            rail: ledger.rail().clone(),
            timeout: ledger.settings().confirmation_timeout,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<EscrowLedger> {
        &self.ledger
    }

    pub fn rail_kind(&self) -> RailKind {
        self.rail.kind()
    }

    pub fn validate_address(&self, address: &str) -> bool {
        self.rail.validate_address(address)
    }

    pub fn calculate_fee(&self, amount: Amount) -> FeeSplit {
        self.ledger.fee_split(amount)
    }

    pub fn to_atomic(&self, value: &str) -> Result<Amount, EscrowError> {
        parse_units(value, self.rail.decimals())
    }

    pub fn format_amount(&self, value: Amount) -> String {
        format_units(value, self.rail.decimals())
    }

    /// Pay `amount` from the operator treasury. Escrow custody is never touched.
    pub async fn send_payment(
        &self,
        recipient: &str,
        amount: Amount,
        bounty_id: Option<BountyId>,
    ) -> Result<PaymentReceipt, EscrowError> {
        if !self.rail.validate_address(recipient) {
            return Err(EscrowError::InvalidRecipient(recipient.to_string()));
        }
        if amount == 0 {
            return Err(EscrowError::InvalidAmount(
                "payment amount must be positive".to_string(),
            ));
        }

        let rail_err = |e: RailError| EscrowError::rail(bounty_id, e);
        let available = self
            .rail
            .balance_of(self.rail.operator_account())
            .await
            .map_err(rail_err)?;
        if available < amount {
            return Err(rail_err(RailError::InsufficientBalance {
                needed: amount,
                available,
            }));
        }
        let headroom = self.rail.fee_headroom().await.map_err(rail_err)?;
        if !headroom.covers(1) {
            return Err(rail_err(RailError::InsufficientFeeBudget {
                needed: headroom.per_submission,
                available: headroom.available,
            }));
        }

        let handle = self
            .rail
            .submit(
                Movement::Direct {
                    to: recipient.to_string(),
                    amount,
                },
                bounty_id,
            )
            .await
            .map_err(rail_err)?;
        let receipt = match tokio::time::timeout(
            self.timeout,
            self.rail.await_confirmation(&handle),
        )
        .await
        {
            Ok(result) => result.map_err(rail_err)?,
            Err(_) => {
                warn!(
                    "Payment {} to {} not confirmed within {:?}",
                    handle.submission_ref, recipient, self.timeout
                );
                return Err(rail_err(RailError::Timeout {
                    submission_ref: handle.submission_ref,
                }));
            }
        };

        info!(
            "Paid {} to {} (settlement {})",
            self.format_amount(amount),
            recipient,
            receipt.settlement_ref
        );
        // Custodial chain balances travel with the ledger snapshot; a failure is logged
        let _ = self.ledger.persist();
        Ok(PaymentReceipt {
            recipient: recipient.to_string(),
            amount,
            bounty_id,
            receipt,
        })
    }

    pub async fn create_bounty(
        &self,
        request: CreateBounty,
        caller: &Principal,
    ) -> Result<BountyId, EscrowError> {
        self.authorize(caller, request.amount, None).await?;
        self.ledger.create_bounty(request, caller).await
    }

    pub async fn escalate_bounty(
        &self,
        id: BountyId,
        additional: Amount,
        caller: &Principal,
    ) -> Result<Bounty, EscrowError> {
        self.authorize(caller, additional, Some(id)).await?;
        self.ledger.escalate_bounty(id, additional, caller).await
    }

    pub async fn release_bounty(
        &self,
        id: BountyId,
        solver: &Principal,
        solver_identity: &str,
        pull_request_url: &str,
        caller: &Principal,
    ) -> Result<ReleaseReceipt, EscrowError> {
        self.ledger
            .release(id, solver, solver_identity, pull_request_url, caller)
            .await
    }

    pub async fn create_on_chain_bounty(
        &self,
        request: CreateBounty,
        caller: &Principal,
    ) -> Result<OnChain<BountyId>, EscrowError> {
        if !self.on_chain() {
            return Ok(OnChain::NotApplicable);
        }
        self.create_bounty(request, caller).await.map(OnChain::Applied)
    }

    pub async fn escalate_on_chain_bounty(
        &self,
        id: BountyId,
        additional: Amount,
        caller: &Principal,
    ) -> Result<OnChain<Bounty>, EscrowError> {
        if !self.on_chain() {
            return Ok(OnChain::NotApplicable);
        }
        self.escalate_bounty(id, additional, caller)
            .await
            .map(OnChain::Applied)
    }

    pub async fn release_on_chain_bounty(
        &self,
        id: BountyId,
        solver: &Principal,
        solver_identity: &str,
        pull_request_url: &str,
        caller: &Principal,
    ) -> Result<OnChain<ReleaseReceipt>, EscrowError> {
        if !self.on_chain() {
            return Ok(OnChain::NotApplicable);
        }
        self.release_bounty(id, solver, solver_identity, pull_request_url, caller)
            .await
            .map(OnChain::Applied)
    }

    pub fn get_on_chain_bounty(&self, id: BountyId) -> Result<OnChain<Bounty>, EscrowError> {
        if !self.on_chain() {
            return Ok(OnChain::NotApplicable);
        }
        self.ledger.get_bounty(id).map(OnChain::Applied)
    }

    fn on_chain(&self) -> bool {
        self.rail.kind() == RailKind::Custodial
    }

    async fn authorize(
        &self,
        owner: &Principal,
        amount: Amount,
        bounty_id: Option<BountyId>,
    ) -> Result<(), EscrowError> {
        if self.ledger.is_paused() {
            return Err(EscrowError::SystemPaused);
        }
        match self
            .rail
            .ensure_authorization(owner.as_str(), amount)
            .await
            .map_err(|e| EscrowError::rail(bounty_id, e))?
        {
            Authorization::Approved(receipt) => info!(
                "Approved {} from {} toward custody ({})",
                self.format_amount(amount),
                owner,
                receipt.settlement_ref
            ),
            Authorization::Sufficient | Authorization::NotRequired => {
                debug!("{} already covers {}", owner, amount)
            }
        }
        Ok(())
    }
}
