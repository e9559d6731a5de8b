//! Custodial-chain rail
//!
//! [`TokenChain`] is the token ledger the escrow vault lives on: balances,
//! allowances, a native gas balance per account, a bounded mempool and block
//! production (automatic, or manual for tests). [`CustodialRail`] maps escrow
//! movements onto chain transactions submitted by the operator account.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Authorization, Confirmation, ConfirmedReceipt, FeeHeadroom, Movement, PendingHandle,
    RailKind, SettlementRail, SubmissionState,
};
use crate::auth::{is_valid_hex_address, is_zero_hex_address, normalize_hex_address};
use crate::error::RailError;
use crate::types::{Amount, BountyId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    /// Token decimals
    pub decimals: u32,
    /// Native gas charged to the sender of every transaction
    pub gas_fee: Amount,
    /// Mempool capacity; submissions beyond it are rejected as congestion
    pub max_pending: usize,
    /// Mine a block on every submission
    pub auto_mine: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            decimals: 18,
            gas_fee: 21_000,
            max_pending: 64,
            auto_mine: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxCall {
    Transfer {
        from: String,
        to: String,
        amount: Amount,
    },
    TransferFrom {
        spender: String,
        from: String,
        to: String,
        amount: Amount,
    },
    Approve {
        owner: String,
        spender: String,
        amount: Amount,
    },
    /// Executes every call or none
    Batch(Vec<TxCall>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Confirmed { height: u64 },
    Failed(RailError),
}

#[derive(Debug, Clone)]
struct PendingTx {
    hash: String,
    sender: String,
    call: TxCall,
}

#[derive(Debug, Default, Clone)]
struct Accounts {
    balances: HashMap<String, Amount>,
    allowances: HashMap<(String, String), Amount>,
}

impl Accounts {
    fn balance(&self, account: &str) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn allowance(&self, owner: &str, spender: &str) -> Amount {
        self.allowances
            .get(&(owner.to_string(), spender.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn move_value(&mut self, from: &str, to: &str, amount: Amount) -> Result<(), RailError> {
        let available = self.balance(from);
        if available < amount {
            return Err(RailError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        self.balances.insert(from.to_string(), available - amount);
        let credited = self
            .balance(to)
            .checked_add(amount)
            .ok_or_else(|| RailError::Rejected("balance overflow".to_string()))?;
        self.balances.insert(to.to_string(), credited);
        Ok(())
    }

    fn apply(&mut self, call: &TxCall) -> Result<(), RailError> {
        match call {
            TxCall::Transfer { from, to, amount } => self.move_value(from, to, *amount),
            TxCall::TransferFrom {
                spender,
                from,
                to,
                amount,
            } => {
                let approved = self.allowance(from, spender);
                if approved < *amount {
                    return Err(RailError::InsufficientAllowance {
                        needed: *amount,
                        approved,
                    });
                }
                self.move_value(from, to, *amount)?;
                self.allowances
                    .insert((from.clone(), spender.clone()), approved - amount);
                Ok(())
            }
            TxCall::Approve {
                owner,
                spender,
                amount,
            } => {
                self.allowances
                    .insert((owner.clone(), spender.clone()), *amount);
                Ok(())
            }
            TxCall::Batch(calls) => {
                for call in calls {
                    self.apply(call)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    accounts: Accounts,
    gas: HashMap<String, Amount>,
    height: u64,
    nonce: u64,
    mempool: VecDeque<PendingTx>,
    outcomes: HashMap<String, TxOutcome>,
    /// Idempotency key to transaction hash
    keys: HashMap<Uuid, String>,
}

impl ChainState {
    fn gas_of(&self, account: &str) -> Amount {
        self.gas.get(account).copied().unwrap_or(0)
    }
}

/// Durable chain state. Queued transactions are not part of it: a chain
/// restored from a snapshot has an empty mempool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub height: u64,
    pub nonce: u64,
    pub balances: BTreeMap<String, Amount>,
    /// `(owner, spender, amount)`
    pub allowances: Vec<(String, String, Amount)>,
    pub gas: BTreeMap<String, Amount>,
    pub outcomes: BTreeMap<String, TxOutcome>,
    pub keys: BTreeMap<Uuid, String>,
}

pub struct TokenChain {
    params: ChainParams,
    state: Mutex<ChainState>,
    auto_mine: Mutex<bool>,
    heights: watch::Sender<u64>,
}

impl TokenChain {
    pub fn new(params: ChainParams) -> Self {
        let (heights, _) = watch::channel(0);
        Self {
            auto_mine: Mutex::new(params.auto_mine),
            params,
            state: Mutex::new(ChainState::default()),
            heights,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Credit tokens out of thin air (genesis allocation, dev faucet)
    pub fn mint(&self, account: &str, amount: Amount) {
        let account = normalize_hex_address(account);
        let mut state = self.state.lock();
        let balance = state.accounts.balance(&account).saturating_add(amount);
        state.accounts.balances.insert(account, balance);
    }

    /// Credit native gas
    pub fn fund_gas(&self, account: &str, amount: Amount) {
        let account = normalize_hex_address(account);
        let mut state = self.state.lock();
        let gas = state.gas_of(&account).saturating_add(amount);
        state.gas.insert(account, gas);
    }

    pub fn balance_of(&self, account: &str) -> Amount {
        self.state
            .lock()
            .accounts
            .balance(&normalize_hex_address(account))
    }

    pub fn allowance(&self, owner: &str, spender: &str) -> Amount {
        self.state.lock().accounts.allowance(
            &normalize_hex_address(owner),
            &normalize_hex_address(spender),
        )
    }

    pub fn gas_balance(&self, account: &str) -> Amount {
        self.state.lock().gas_of(&normalize_hex_address(account))
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        *self.auto_mine.lock() = enabled;
    }

    /// Queue a transaction. Rejections here leave no trace on the chain.
    pub fn submit(&self, sender: &str, call: TxCall) -> Result<String, RailError> {
        self.queue(sender, call, None)
    }

    /// Queue a transaction once per key; a repeated key returns the first hash.
    pub fn submit_keyed(&self, sender: &str, call: TxCall, key: Uuid) -> Result<String, RailError> {
        self.queue(sender, call, Some(key))
    }

    pub fn find_key(&self, key: Uuid) -> Option<String> {
        self.state.lock().keys.get(&key).cloned()
    }

    fn queue(&self, sender: &str, call: TxCall, key: Option<Uuid>) -> Result<String, RailError> {
        let sender = normalize_hex_address(sender);
        let call = normalize_call(call);
        let hash = {
            let mut state = self.state.lock();
            if let Some(existing) = key.and_then(|k| state.keys.get(&k)) {
                debug!("Transaction key {:?} already submitted as {}", key, existing);
                return Ok(existing.clone());
            }
            if state.mempool.len() >= self.params.max_pending {
                warn!(
                    "Mempool full ({} pending), rejecting transaction from {}",
                    state.mempool.len(),
                    sender
                );
                return Err(RailError::Congested);
            }

            let queued_by_sender = state
                .mempool
                .iter()
                .filter(|tx| tx.sender == sender)
                .count() as Amount;
            let needed = self.params.gas_fee.saturating_mul(queued_by_sender + 1);
            let available = state.gas_of(&sender);
            if available < needed {
                return Err(RailError::InsufficientFeeBudget { needed, available });
            }

            // Dry run against current state so obvious failures surface before queueing
            let mut scratch = state.accounts.clone();
            scratch.apply(&call)?;

            state.nonce += 1;
            let hash = tx_hash(&sender, state.nonce, &call);
            state.mempool.push_back(PendingTx {
                hash: hash.clone(),
                sender: sender.clone(),
                call,
            });
            if let Some(key) = key {
                state.keys.insert(key, hash.clone());
            }
            hash
        };
        debug!("Queued transaction {} from {}", hash, sender);

        if *self.auto_mine.lock() {
            self.mine();
        }
        Ok(hash)
    }

    /// Produce one block containing every queued transaction
    pub fn mine(&self) -> u64 {
        let height = {
            let mut state = self.state.lock();
            state.height += 1;
            let height = state.height;
            let gas_fee = self.params.gas_fee;
            while let Some(tx) = state.mempool.pop_front() {
                let available = state.gas_of(&tx.sender);
                let outcome = if available < gas_fee {
                    TxOutcome::Failed(RailError::InsufficientFeeBudget {
                        needed: gas_fee,
                        available,
                    })
                } else {
                    state.gas.insert(tx.sender.clone(), available - gas_fee);
                    let mut scratch = state.accounts.clone();
                    match scratch.apply(&tx.call) {
                        Ok(()) => {
                            state.accounts = scratch;
                            TxOutcome::Confirmed { height }
                        }
                        Err(e) => {
                            warn!("Transaction {} reverted: {}", tx.hash, e);
                            TxOutcome::Failed(e)
                        }
                    }
                };
                state.outcomes.insert(tx.hash, outcome);
            }
            height
        };
        self.heights.send_replace(height);
        height
    }

    /// `None` if the chain has never seen the hash, `Some(None)` while queued
    pub fn outcome(&self, hash: &str) -> Option<Option<TxOutcome>> {
        let state = self.state.lock();
        if let Some(outcome) = state.outcomes.get(hash) {
            return Some(Some(outcome.clone()));
        }
        if state.mempool.iter().any(|tx| tx.hash == hash) {
            return Some(None);
        }
        None
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let state = self.state.lock();
        let mut allowances: Vec<(String, String, Amount)> = state
            .accounts
            .allowances
            .iter()
            .map(|((owner, spender), amount)| (owner.clone(), spender.clone(), *amount))
            .collect();
        allowances.sort();
        ChainSnapshot {
            height: state.height,
            nonce: state.nonce,
            balances: state.accounts.balances.clone().into_iter().collect(),
            allowances,
            gas: state.gas.clone().into_iter().collect(),
            outcomes: state.outcomes.clone().into_iter().collect(),
            keys: state.keys.clone().into_iter().collect(),
        }
    }

    /// Replace all chain state. Queued transactions are dropped.
    pub fn restore(&self, snapshot: ChainSnapshot) {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.mempool.len();
            *state = ChainState {
                accounts: Accounts {
                    balances: snapshot.balances.into_iter().collect(),
                    allowances: snapshot
                        .allowances
                        .into_iter()
                        .map(|(owner, spender, amount)| ((owner, spender), amount))
                        .collect(),
                },
                gas: snapshot.gas.into_iter().collect(),
                height: snapshot.height,
                nonce: snapshot.nonce,
                mempool: VecDeque::new(),
                outcomes: snapshot.outcomes.into_iter().collect(),
                keys: snapshot.keys.into_iter().collect(),
            };
            dropped
        };
        if dropped > 0 {
            warn!("Dropped {} queued transactions on chain restore", dropped);
        }
        info!("Chain restored at height {}", snapshot.height);
        self.heights.send_replace(snapshot.height);
    }

    /// Suspends until the transaction is mined.
    pub async fn wait_for(&self, hash: &str) -> Result<TxOutcome, RailError> {
        let mut heights = self.heights.subscribe();
        loop {
            match self.outcome(hash) {
                Some(Some(outcome)) => return Ok(outcome),
                Some(None) => {}
                None => {
                    return Err(RailError::Rejected(format!(
                        "unknown transaction {}",
                        hash
                    )))
                }
            }
            if heights.changed().await.is_err() {
                return Err(RailError::Transport("chain stopped".to_string()));
            }
        }
    }
}

fn normalize_call(call: TxCall) -> TxCall {
    match call {
        TxCall::Transfer { from, to, amount } => TxCall::Transfer {
            from: normalize_hex_address(&from),
            to: normalize_hex_address(&to),
            amount,
        },
        TxCall::TransferFrom {
            spender,
            from,
            to,
            amount,
        } => TxCall::TransferFrom {
            spender: normalize_hex_address(&spender),
            from: normalize_hex_address(&from),
            to: normalize_hex_address(&to),
            amount,
        },
        TxCall::Approve {
            owner,
            spender,
            amount,
        } => TxCall::Approve {
            owner: normalize_hex_address(&owner),
            spender: normalize_hex_address(&spender),
            amount,
        },
        TxCall::Batch(calls) => TxCall::Batch(calls.into_iter().map(normalize_call).collect()),
    }
}

fn tx_hash(sender: &str, nonce: u64, call: &TxCall) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(format!("{:?}", call).as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

pub struct CustodialRail {
    chain: Arc<TokenChain>,
    vault: String,
    operator: String,
}

impl CustodialRail {
    pub fn new(chain: Arc<TokenChain>, vault: &str, operator: &str) -> Self {
        Self {
            chain,
            vault: normalize_hex_address(vault),
            operator: normalize_hex_address(operator),
        }
    }

    pub fn chain(&self) -> &Arc<TokenChain> {
        &self.chain
    }

    fn call_for(&self, movement: &Movement) -> TxCall {
        match movement {
            Movement::Lock { from, amount } => TxCall::TransferFrom {
                spender: self.vault.clone(),
                from: from.clone(),
                to: self.vault.clone(),
                amount: *amount,
            },
            Movement::Release { transfers } => TxCall::Batch(
                transfers
                    .iter()
                    .map(|t| TxCall::Transfer {
                        from: self.vault.clone(),
                        to: t.to.clone(),
                        amount: t.amount,
                    })
                    .collect(),
            ),
            Movement::Direct { to, amount } => TxCall::Transfer {
                from: self.operator.clone(),
                to: to.clone(),
                amount: *amount,
            },
        }
    }

    fn receipt(&self, hash: &str, height: u64) -> ConfirmedReceipt {
        ConfirmedReceipt {
            submission_ref: hash.to_string(),
            settlement_ref: hash.to_string(),
            confirmation: Confirmation::Height(height),
        }
    }
}

#[async_trait]
impl SettlementRail for CustodialRail {
    fn kind(&self) -> RailKind {
        RailKind::Custodial
    }

    fn decimals(&self) -> u32 {
        self.chain.params().decimals
    }

    fn custody_account(&self) -> &str {
        &self.vault
    }

    fn operator_account(&self) -> &str {
        &self.operator
    }

    fn validate_address(&self, address: &str) -> bool {
        is_valid_hex_address(address) && !is_zero_hex_address(address)
    }

    async fn ensure_authorization(
        &self,
        owner: &str,
        amount: Amount,
    ) -> Result<Authorization, RailError> {
        let available = self.chain.balance_of(owner);
        if available < amount {
            return Err(RailError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        if self.chain.allowance(owner, &self.vault) >= amount {
            return Ok(Authorization::Sufficient);
        }

        let hash = self.chain.submit(
            &self.operator,
            TxCall::Approve {
                owner: owner.to_string(),
                spender: self.vault.clone(),
                amount,
            },
        )?;
        match self.chain.wait_for(&hash).await? {
            TxOutcome::Confirmed { height } => {
                info!("Approved {} for vault spending by {} at height {}", amount, owner, height);
                Ok(Authorization::Approved(self.receipt(&hash, height)))
            }
            TxOutcome::Failed(e) => Err(e),
        }
    }

    async fn balance_of(&self, account: &str) -> Result<Amount, RailError> {
        Ok(self.chain.balance_of(account))
    }

    async fn fee_headroom(&self) -> Result<FeeHeadroom, RailError> {
        Ok(FeeHeadroom {
            available: self.chain.gas_balance(&self.operator),
            per_submission: self.chain.params().gas_fee,
        })
    }

    async fn submit_keyed(
        &self,
        movement: Movement,
        bounty_id: Option<BountyId>,
        key: Uuid,
    ) -> Result<PendingHandle, RailError> {
        let call = self.call_for(&movement);
        let hash = self.chain.submit_keyed(&self.operator, call, key)?;
        debug!(
            "Submitted {} of {} for bounty {:?} as {}",
            movement.label(),
            movement.total(),
            bounty_id,
            hash
        );
        Ok(PendingHandle {
            submission_ref: hash,
            rail: RailKind::Custodial,
            bounty_id,
            submitted_at: Utc::now(),
        })
    }

    async fn find_submission(&self, key: Uuid) -> Result<Option<String>, RailError> {
        Ok(self.chain.find_key(key))
    }

    async fn await_confirmation(
        &self,
        handle: &PendingHandle,
    ) -> Result<ConfirmedReceipt, RailError> {
        match self.chain.wait_for(&handle.submission_ref).await? {
            TxOutcome::Confirmed { height } => Ok(self.receipt(&handle.submission_ref, height)),
            TxOutcome::Failed(e) => Err(e),
        }
    }

    async fn lookup(&self, submission_ref: &str) -> Result<SubmissionState, RailError> {
        Ok(match self.chain.outcome(submission_ref) {
            None => SubmissionState::Unknown,
            Some(None) => SubmissionState::Pending,
            Some(Some(TxOutcome::Confirmed { height })) => {
                SubmissionState::Confirmed(self.receipt(submission_ref, height))
            }
            Some(Some(TxOutcome::Failed(e))) => SubmissionState::Failed(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::Transfer;

    fn addr(n: u8) -> String {
        format!("0x{:040x}", n)
    }

    fn chain() -> Arc<TokenChain> {
        let chain = Arc::new(TokenChain::new(ChainParams {
            decimals: 0,
            gas_fee: 1,
            max_pending: 2,
            auto_mine: true,
        }));
        chain.fund_gas(&addr(1), 100);
        chain
    }

    #[test]
    fn test_transfer_and_gas() {
        let chain = chain();
        chain.mint(&addr(2), 50);
        let hash = chain
            .submit(
                &addr(1),
                TxCall::Transfer {
                    from: addr(2),
                    to: addr(3),
                    amount: 20,
                },
            )
            .unwrap();
        assert_eq!(
            chain.outcome(&hash),
            Some(Some(TxOutcome::Confirmed { height: 1 }))
        );
        assert_eq!(chain.balance_of(&addr(2)), 30);
        assert_eq!(chain.balance_of(&addr(3)), 20);
        assert_eq!(chain.gas_balance(&addr(1)), 99);
    }

    #[test]
    fn test_batch_reverts_as_a_whole() {
        let chain = chain();
        chain.mint(&addr(2), 10);
        chain.mint(&addr(5), 3);
        chain.set_auto_mine(false);

        let drain = chain
            .submit(
                &addr(1),
                TxCall::Transfer {
                    from: addr(2),
                    to: addr(4),
                    amount: 10,
                },
            )
            .unwrap();
        // Passes the dry run, but the drain above is mined first
        let batch = chain
            .submit(
                &addr(1),
                TxCall::Batch(vec![
                    TxCall::Transfer {
                        from: addr(5),
                        to: addr(6),
                        amount: 3,
                    },
                    TxCall::Transfer {
                        from: addr(2),
                        to: addr(3),
                        amount: 5,
                    },
                ]),
            )
            .unwrap();
        chain.mine();

        assert!(matches!(
            chain.outcome(&drain),
            Some(Some(TxOutcome::Confirmed { .. }))
        ));
        assert!(matches!(
            chain.outcome(&batch),
            Some(Some(TxOutcome::Failed(RailError::InsufficientBalance { .. })))
        ));
        assert_eq!(chain.balance_of(&addr(5)), 3);
        assert_eq!(chain.balance_of(&addr(6)), 0);
        assert_eq!(chain.balance_of(&addr(3)), 0);
        // Gas is spent even on revert
        assert_eq!(chain.gas_balance(&addr(1)), 98);
    }

    #[test]
    fn test_congestion_and_fee_budget() {
        let chain = chain();
        chain.set_auto_mine(false);
        chain.mint(&addr(2), 10);
        let transfer = || TxCall::Transfer {
            from: addr(2),
            to: addr(3),
            amount: 1,
        };
        chain.submit(&addr(1), transfer()).unwrap();
        chain.submit(&addr(1), transfer()).unwrap();
        assert_eq!(chain.submit(&addr(1), transfer()), Err(RailError::Congested));

        let err = chain.submit(&addr(9), transfer()).unwrap_err();
        assert!(matches!(err, RailError::Congested));
        chain.mine();
        let err = chain.submit(&addr(9), transfer()).unwrap_err();
        assert_eq!(
            err,
            RailError::InsufficientFeeBudget {
                needed: 1,
                available: 0
            }
        );
    }

    #[tokio::test]
    async fn test_rail_lock_requires_allowance() {
        let chain = chain();
        let rail = CustodialRail::new(chain.clone(), &addr(10), &addr(1));
        chain.mint(&addr(2), 100);

        let err = rail
            .submit(
                Movement::Lock {
                    from: addr(2),
                    amount: 40,
                },
                Some(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RailError::InsufficientAllowance { .. }));

        let auth = rail.ensure_authorization(&addr(2), 40).await.unwrap();
        assert!(matches!(auth, Authorization::Approved(_)));
        assert_eq!(
            rail.ensure_authorization(&addr(2), 40).await.unwrap(),
            Authorization::Sufficient
        );

        let handle = rail
            .submit(
                Movement::Lock {
                    from: addr(2),
                    amount: 40,
                },
                Some(1),
            )
            .await
            .unwrap();
        let receipt = rail.await_confirmation(&handle).await.unwrap();
        assert!(matches!(receipt.confirmation, Confirmation::Height(_)));
        assert_eq!(rail.custody_balance().await.unwrap(), 40);
        assert_eq!(chain.allowance(&addr(2), &addr(10)), 0);
    }

    #[tokio::test]
    async fn test_rail_release_and_lookup() {
        let chain = chain();
        let rail = CustodialRail::new(chain.clone(), &addr(10), &addr(1));
        chain.mint(&addr(10), 100);
        chain.set_auto_mine(false);

        let handle = rail
            .submit(
                Movement::Release {
                    transfers: vec![
                        Transfer {
                            to: addr(3),
                            amount: 97,
                        },
                        Transfer {
                            to: addr(4),
                            amount: 3,
                        },
                    ],
                },
                Some(7),
            )
            .await
            .unwrap();
        assert_eq!(
            rail.lookup(&handle.submission_ref).await.unwrap(),
            SubmissionState::Pending
        );
        chain.mine();
        assert!(matches!(
            rail.lookup(&handle.submission_ref).await.unwrap(),
            SubmissionState::Confirmed(_)
        ));
        assert_eq!(chain.balance_of(&addr(3)), 97);
        assert_eq!(chain.balance_of(&addr(4)), 3);
        assert_eq!(rail.custody_balance().await.unwrap(), 0);
        assert_eq!(
            rail.lookup("0xdeadbeef").await.unwrap(),
            SubmissionState::Unknown
        );
    }

    #[test]
    fn test_address_validation() {
        let chain = Arc::new(TokenChain::new(ChainParams::default()));
        let rail = CustodialRail::new(chain, &addr(10), &addr(1));
        assert!(rail.validate_address(&addr(3)));
        assert!(!rail.validate_address(&addr(0)));
        assert!(!rail.validate_address("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"));
    }

    #[tokio::test]
    async fn test_keyed_submission_moves_value_once() {
        let chain = chain();
        let rail = CustodialRail::new(chain.clone(), &addr(10), &addr(1));
        chain.mint(&addr(10), 100);
        let key = Uuid::new_v4();
        let payout = || Movement::Release {
            transfers: vec![Transfer {
                to: addr(3),
                amount: 60,
            }],
        };

        assert_eq!(rail.find_submission(key).await.unwrap(), None);
        let first = rail.submit_keyed(payout(), Some(1), key).await.unwrap();
        let second = rail.submit_keyed(payout(), Some(1), key).await.unwrap();
        assert_eq!(first.submission_ref, second.submission_ref);
        assert_eq!(
            rail.find_submission(key).await.unwrap(),
            Some(first.submission_ref)
        );
        assert_eq!(chain.balance_of(&addr(3)), 60);
        assert_eq!(rail.custody_balance().await.unwrap(), 40);
    }

    #[test]
    fn test_snapshot_restore() {
        let chain = chain();
        chain.mint(&addr(2), 50);
        let approved = chain
            .submit(
                &addr(1),
                TxCall::Approve {
                    owner: addr(2),
                    spender: addr(10),
                    amount: 30,
                },
            )
            .unwrap();
        let key = Uuid::new_v4();
        chain.set_auto_mine(false);
        let queued = chain
            .submit_keyed(
                &addr(1),
                TxCall::Transfer {
                    from: addr(2),
                    to: addr(3),
                    amount: 5,
                },
                key,
            )
            .unwrap();
        let snapshot = chain.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let restored = TokenChain::new(chain.params().clone());
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.balance_of(&addr(2)), 50);
        assert_eq!(restored.allowance(&addr(2), &addr(10)), 30);
        assert_eq!(restored.gas_balance(&addr(1)), 99);
        assert_eq!(restored.height(), 1);
        assert!(matches!(
            restored.outcome(&approved),
            Some(Some(TxOutcome::Confirmed { height: 1 }))
        ));
        // The queued transfer is gone, but its key is remembered
        assert_eq!(restored.pending_count(), 0);
        assert_eq!(restored.outcome(&queued), None);
        assert_eq!(restored.find_key(key), Some(queued));
    }
}
