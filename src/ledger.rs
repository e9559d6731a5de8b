//! Escrow ledger
//!
//! The authoritative bounty state machine and the only component that moves
//! custodied value. Every state-changing operation follows the same path:
//!
//! 1. validate and journal the planned transition under the state lock
//! 2. submit the value movement to the rail
//! 3. wait (bounded) for confirmation, then commit the transition
//!
//! Operations on one bounty are serialized by a per-bounty async mutex. The
//! published status only changes at commit, so readers never observe a
//! transition the rail has not confirmed.
//!
//! With a snapshot path configured, the journal is written to disk before any
//! movement is submitted and again after every commit or discard. Each
//! journaled transition carries the idempotency key it is submitted under, so
//! a restarted ledger can find the submission on the rail and finish it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EscrowError, RailError};
use crate::rail::{
    ChainSnapshot, ConfirmedReceipt, Movement, PendingHandle, Rail, SettlementRail,
    SubmissionState, Transfer,
};
use crate::reconciliation::ReconciliationStore;
use crate::roles::{Role, RoleRegistry};
use crate::types::{
    dedupe_key, Amount, Bounty, BountyId, BountyStatus, CreateBounty, FeeSplit, LedgerConfig,
    Principal, FEE_CAP_BPS,
};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Anyone may create bounties; otherwise the Creator role is required
    pub open_creation: bool,
    /// Upper bound on a single confirmation wait
    pub confirmation_timeout: Duration,
    /// Where the ledger persists itself. `None` keeps state in memory only.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            open_creation: true,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Create,
    Escalate,
    Release,
    Cancel,
    Expire,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Create => "create",
            Transition::Escalate => "escalate",
            Transition::Release => "release",
            Transition::Cancel => "cancel",
            Transition::Expire => "expire",
        }
    }
}

/// A journaled transition awaiting rail confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub transition: Transition,
    /// The bounty as it will read once committed
    pub projected: Bounty,
    pub movement: Movement,
    /// Idempotency key the movement is submitted under
    pub submission_key: Uuid,
    /// Unset until the rail accepts the submission
    pub handle: Option<PendingHandle>,
    pub journaled_at: u64,
}

/// Outcome of re-querying the rail for an in-flight transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing was in flight
    Idle,
    Committed(ConfirmedReceipt),
    Discarded(RailError),
    StillPending,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReceipt {
    pub bounty: Bounty,
    pub split: FeeSplit,
    pub receipt: ConfirmedReceipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyReport {
    /// Value the rail reports in the custody account
    pub held: Amount,
    /// Sum of current amounts over active bounties
    pub locked: Amount,
    pub surplus: Amount,
    pub in_flight: usize,
    pub quiescent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub next_id: BountyId,
    pub bounties: Vec<Bounty>,
    pub in_flight: Vec<InFlight>,
    pub config: LedgerConfig,
    pub paused: bool,
    pub roles: Vec<(Role, Vec<Principal>)>,
    /// Token chain state when the ledger runs on the custodial rail
    #[serde(default)]
    pub chain: Option<ChainSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// Write atomically (temp file, then rename)
    pub fn write_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }
}

#[derive(Debug)]
struct LedgerState {
    next_id: BountyId,
    bounties: BTreeMap<BountyId, Bounty>,
    /// Active bounties and reserved in-flight creates
    active_by_key: HashMap<String, BountyId>,
    latest_by_key: HashMap<String, BountyId>,
    by_creator: HashMap<Principal, Vec<BountyId>>,
    by_solver: HashMap<Principal, Vec<BountyId>>,
    in_flight: BTreeMap<BountyId, InFlight>,
    config: LedgerConfig,
    paused: bool,
    total_locked: Amount,
}

impl LedgerState {
    fn new(config: LedgerConfig) -> Self {
        Self {
            next_id: 1,
            bounties: BTreeMap::new(),
            active_by_key: HashMap::new(),
            latest_by_key: HashMap::new(),
            by_creator: HashMap::new(),
            by_solver: HashMap::new(),
            in_flight: BTreeMap::new(),
            config,
            paused: false,
            total_locked: 0,
        }
    }

    /// Apply a confirmed transition. Either everything is applied or nothing.
    fn commit(&mut self, projected: Bounty) -> Result<(), EscrowError> {
        let id = projected.id;
        if !projected.amounts_consistent() {
            return Err(EscrowError::InvariantViolation(format!(
                "bounty {} amounts out of order (initial {}, current {}, max {})",
                id, projected.initial_amount, projected.current_amount, projected.max_amount
            )));
        }

        let previous = self.bounties.get(&id).cloned();
        if let Some(prev) = &previous {
            if prev.status.is_terminal() {
                return Err(EscrowError::InvariantViolation(format!(
                    "bounty {} is already {}",
                    id, prev.status
                )));
            }
            if projected.current_amount < prev.current_amount {
                return Err(EscrowError::InvariantViolation(format!(
                    "bounty {} current amount would decrease",
                    id
                )));
            }
        }
        if projected.is_active() {
            if let Some(other) = self.active_by_key.get(&projected.dedupe_key) {
                if *other != id {
                    return Err(EscrowError::InvariantViolation(format!(
                        "bounty {} shares its work item with active bounty {}",
                        id, other
                    )));
                }
            }
        }

        let released = previous
            .as_ref()
            .filter(|b| b.is_active())
            .map(|b| b.current_amount)
            .unwrap_or(0);
        let locked = if projected.is_active() {
            projected.current_amount
        } else {
            0
        };
        let total = self
            .total_locked
            .checked_sub(released)
            .and_then(|t| t.checked_add(locked))
            .ok_or_else(|| {
                EscrowError::InvariantViolation(format!(
                    "locked total out of range committing bounty {}",
                    id
                ))
            })?;

        self.total_locked = total;
        if previous.is_none() {
            self.by_creator
                .entry(projected.creator.clone())
                .or_default()
                .push(id);
            self.latest_by_key.insert(projected.dedupe_key.clone(), id);
        }
        let had_solver = previous.as_ref().map(|b| b.solver.is_some()).unwrap_or(false);
        if let (Some(solver), false) = (&projected.solver, had_solver) {
            self.by_solver.entry(solver.clone()).or_default().push(id);
        }
        if projected.is_active() {
            self.active_by_key.insert(projected.dedupe_key.clone(), id);
        } else if self.active_by_key.get(&projected.dedupe_key) == Some(&id) {
            self.active_by_key.remove(&projected.dedupe_key);
        }
        self.bounties.insert(id, projected);
        Ok(())
    }

    fn collect(&self, ids: Option<&Vec<BountyId>>) -> Vec<Bounty> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.bounties.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    fn first_in_flight(&self) -> Option<BountyId> {
        self.in_flight.keys().next().copied()
    }
}

/// Validated transition ready to journal
struct Plan {
    transition: Transition,
    projected: Bounty,
    movement: Movement,
}

pub struct EscrowLedger {
    rail: Arc<Rail>,
    store: Arc<dyn ReconciliationStore>,
    roles: RoleRegistry,
    clock: Arc<dyn Clock>,
    settings: LedgerSettings,
    state: RwLock<LedgerState>,
    bounty_locks: Mutex<HashMap<BountyId, Arc<AsyncMutex<()>>>>,
    recovery: AsyncMutex<()>,
    persist_lock: Mutex<()>,
}

fn unauthorized(caller: &Principal, action: &'static str, id: BountyId) -> EscrowError {
    EscrowError::Unauthorized {
        principal: caller.clone(),
        action,
        bounty_id: Some(id),
    }
}

fn ensure_active(bounty: &Bounty) -> Result<(), EscrowError> {
    if bounty.is_active() {
        Ok(())
    } else {
        Err(EscrowError::NotActive {
            id: bounty.id,
            status: bounty.status,
        })
    }
}

/// Refund the full current amount to the creator
fn refund(bounty: &Bounty) -> Movement {
    Movement::Release {
        transfers: vec![Transfer {
            to: bounty.creator.as_str().to_string(),
            amount: bounty.current_amount,
        }],
    }
}

fn validate_config(rail: &Rail, config: &LedgerConfig) -> Result<(), EscrowError> {
    if config.fee_rate_bps > FEE_CAP_BPS {
        return Err(EscrowError::InvalidConfig(format!(
            "fee rate {} bps exceeds cap of {} bps",
            config.fee_rate_bps, FEE_CAP_BPS
        )));
    }
    if config.min_amount == 0 {
        return Err(EscrowError::InvalidConfig(
            "minimum amount must be positive".to_string(),
        ));
    }
    if config.max_amount < config.min_amount {
        return Err(EscrowError::InvalidConfig(format!(
            "maximum amount {} is below minimum {}",
            config.max_amount, config.min_amount
        )));
    }
    if !rail.validate_address(config.fee_recipient.as_str())
        || config.fee_recipient.as_str() == rail.custody_account()
    {
        return Err(EscrowError::InvalidRecipient(
            config.fee_recipient.to_string(),
        ));
    }
    Ok(())
}

impl EscrowLedger {
    pub fn new(
        rail: Arc<Rail>,
        store: Arc<dyn ReconciliationStore>,
        roles: RoleRegistry,
        config: LedgerConfig,
        settings: LedgerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EscrowError> {
        validate_config(&rail, &config)?;
        info!(
            "Escrow ledger on {} rail (fee {} bps, amounts {}..={}, open creation: {})",
            rail.kind(),
            config.fee_rate_bps,
            config.min_amount,
            config.max_amount,
            settings.open_creation
        );
        Ok(Self {
            rail,
            store,
            roles,
            clock,
            settings,
            state: RwLock::new(LedgerState::new(config)),
            bounty_locks: Mutex::new(HashMap::new()),
            recovery: AsyncMutex::new(()),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn rail(&self) -> &Arc<Rail> {
        &self.rail
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // ==================== Queries ====================

    pub fn get_bounty(&self, id: BountyId) -> Result<Bounty, EscrowError> {
        self.state
            .read()
            .bounties
            .get(&id)
            .cloned()
            .ok_or(EscrowError::NotFound(id))
    }

    /// The active bounty for a work item, else the most recent one
    pub fn get_bounty_by_work_item(&self, repository: &str, issue_id: u64) -> Option<Bounty> {
        let key = dedupe_key(repository, issue_id);
        let state = self.state.read();
        state
            .active_by_key
            .get(&key)
            .and_then(|id| state.bounties.get(id))
            .or_else(|| {
                state
                    .latest_by_key
                    .get(&key)
                    .and_then(|id| state.bounties.get(id))
            })
            .cloned()
    }

    pub fn get_bounties_by_creator(&self, creator: &Principal) -> Vec<Bounty> {
        let state = self.state.read();
        state.collect(state.by_creator.get(creator))
    }

    pub fn get_bounties_by_solver(&self, solver: &Principal) -> Vec<Bounty> {
        let state = self.state.read();
        state.collect(state.by_solver.get(solver))
    }

    pub fn all_bounties(&self) -> Vec<Bounty> {
        self.state.read().bounties.values().cloned().collect()
    }

    pub fn config(&self) -> LedgerConfig {
        self.state.read().config.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    pub fn locked_total(&self) -> Amount {
        self.state.read().total_locked
    }

    /// Id the next created bounty will get
    pub fn next_id(&self) -> BountyId {
        self.state.read().next_id
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        self.state.read().in_flight.values().cloned().collect()
    }

    /// Fee split at the current fee rate
    pub fn fee_split(&self, amount: Amount) -> FeeSplit {
        FeeSplit::compute(amount, self.state.read().config.fee_rate_bps)
    }

    // ==================== Bounty lifecycle ====================

    pub async fn create_bounty(
        &self,
        request: CreateBounty,
        caller: &Principal,
    ) -> Result<BountyId, EscrowError> {
        let now = self.clock.now();
        let repository = request.repository.trim().to_string();
        let key = dedupe_key(&repository, request.issue_id);
        let submission_key = Uuid::new_v4();

        let (id, movement) = {
            let mut state = self.state.write();
            if state.paused {
                return Err(EscrowError::SystemPaused);
            }
            if !self.settings.open_creation {
                self.roles.require(caller, Role::Creator, "create bounties")?;
            }
            let config = &state.config;
            if request.max_amount > config.max_amount {
                return Err(EscrowError::AmountOutOfRange {
                    amount: request.max_amount,
                    min: config.min_amount,
                    max: config.max_amount,
                });
            }
            if request.amount < config.min_amount || request.amount > request.max_amount {
                return Err(EscrowError::AmountOutOfRange {
                    amount: request.amount,
                    min: config.min_amount,
                    max: request.max_amount,
                });
            }
            if request.expires_at != 0 && request.expires_at <= now {
                return Err(EscrowError::InvalidExpiry {
                    expires_at: request.expires_at,
                    now,
                });
            }
            if let Some(existing) = state.active_by_key.get(&key) {
                return Err(EscrowError::DuplicateWorkItem {
                    repository,
                    issue_id: request.issue_id,
                    existing: *existing,
                });
            }

            let id = state.next_id;
            state.next_id += 1;
            let bounty = Bounty {
                id,
                dedupe_key: key.clone(),
                repository,
                issue_id: request.issue_id,
                issue_url: request.issue_url,
                creator: caller.clone(),
                solver: None,
                solver_identity: None,
                pull_request_url: None,
                initial_amount: request.amount,
                current_amount: request.amount,
                max_amount: request.max_amount,
                status: BountyStatus::Active,
                created_at: now,
                claimed_at: None,
                closed_at: None,
                expires_at: request.expires_at,
                escalation_count: 0,
            };
            let movement = Movement::Lock {
                from: caller.as_str().to_string(),
                amount: request.amount,
            };
            state.active_by_key.insert(key, id);
            state.in_flight.insert(
                id,
                InFlight {
                    transition: Transition::Create,
                    projected: bounty,
                    movement: movement.clone(),
                    submission_key,
                    handle: None,
                    journaled_at: now,
                },
            );
            (id, movement)
        };

        let _guard = self.lock_bounty(id).await;
        self.settle(id, movement, submission_key).await?;
        Ok(id)
    }

    pub async fn escalate_bounty(
        &self,
        id: BountyId,
        additional: Amount,
        caller: &Principal,
    ) -> Result<Bounty, EscrowError> {
        let (bounty, _) = self
            .transition(id, |state, bounty, _now| {
                if state.paused {
                    return Err(EscrowError::SystemPaused);
                }
                ensure_active(bounty)?;
                if *caller != bounty.creator && !self.roles.has_role(caller, Role::Oracle) {
                    return Err(unauthorized(caller, "escalate this bounty", id));
                }
                if additional == 0 {
                    return Err(EscrowError::AmountOutOfRange {
                        amount: 0,
                        min: 1,
                        max: bounty.headroom(),
                    });
                }
                let current_amount = bounty
                    .current_amount
                    .checked_add(additional)
                    .filter(|total| *total <= bounty.max_amount)
                    .ok_or(EscrowError::CapExceeded {
                        id,
                        additional,
                        max: bounty.max_amount,
                    })?;

                let mut projected = bounty.clone();
                projected.current_amount = current_amount;
                projected.escalation_count += 1;
                Ok(Plan {
                    transition: Transition::Escalate,
                    projected,
                    movement: Movement::Lock {
                        from: caller.as_str().to_string(),
                        amount: additional,
                    },
                })
            })
            .await?;
        Ok(bounty)
    }

    /// Pay the bounty out to `solver`, less the protocol fee. Oracle only.
    pub async fn release(
        &self,
        id: BountyId,
        solver: &Principal,
        solver_identity: &str,
        pull_request_url: &str,
        caller: &Principal,
    ) -> Result<ReleaseReceipt, EscrowError> {
        let mut split = None;
        let (bounty, receipt) = self
            .transition(id, |state, bounty, now| {
                if state.paused {
                    return Err(EscrowError::SystemPaused);
                }
                if !self.roles.has_role(caller, Role::Oracle) {
                    return Err(unauthorized(caller, "release bounties", id));
                }
                ensure_active(bounty)?;
                if !self.rail.validate_address(solver.as_str())
                    || solver.as_str() == self.rail.custody_account()
                {
                    return Err(EscrowError::InvalidRecipient(solver.to_string()));
                }

                let fees = FeeSplit::compute(bounty.current_amount, state.config.fee_rate_bps);
                let transfers = [
                    (solver.as_str(), fees.payout),
                    (state.config.fee_recipient.as_str(), fees.fee),
                ]
                .into_iter()
                .filter(|(_, amount)| *amount > 0)
                .map(|(to, amount)| Transfer {
                    to: to.to_string(),
                    amount,
                })
                .collect();
                split = Some(fees);

                let mut projected = bounty.clone();
                projected.status = BountyStatus::Claimed;
                projected.solver = Some(solver.clone());
                projected.solver_identity = Some(solver_identity.to_string());
                projected.pull_request_url = Some(pull_request_url.to_string());
                projected.claimed_at = Some(now);
                projected.closed_at = Some(now);
                Ok(Plan {
                    transition: Transition::Release,
                    projected,
                    movement: Movement::Release { transfers },
                })
            })
            .await?;

        let split = split.ok_or_else(|| {
            EscrowError::InvariantViolation(format!("bounty {} released without a fee split", id))
        })?;
        Ok(ReleaseReceipt {
            bounty,
            split,
            receipt,
        })
    }

    /// Refund to the creator. Creator or admin; allowed while paused.
    pub async fn cancel(&self, id: BountyId, caller: &Principal) -> Result<Bounty, EscrowError> {
        let (bounty, _) = self
            .transition(id, |_state, bounty, now| {
                ensure_active(bounty)?;
                if *caller != bounty.creator && !self.roles.has_role(caller, Role::Admin) {
                    return Err(unauthorized(caller, "cancel this bounty", id));
                }
                let mut projected = bounty.clone();
                projected.status = BountyStatus::Cancelled;
                projected.closed_at = Some(now);
                Ok(Plan {
                    transition: Transition::Cancel,
                    projected,
                    movement: refund(bounty),
                })
            })
            .await?;
        Ok(bounty)
    }

    /// Refund an expired bounty to its creator. Anyone may call; allowed while paused.
    pub async fn sweep_expired(
        &self,
        id: BountyId,
        caller: &Principal,
    ) -> Result<Bounty, EscrowError> {
        let (bounty, _) = self
            .transition(id, |_state, bounty, now| {
                ensure_active(bounty)?;
                if !bounty.has_expired(now) {
                    return Err(EscrowError::NotYetExpired {
                        id,
                        expires_at: bounty.expires_at,
                        now,
                    });
                }
                debug!("Bounty {} swept by {}", id, caller);
                let mut projected = bounty.clone();
                projected.status = BountyStatus::Expired;
                projected.closed_at = Some(now);
                Ok(Plan {
                    transition: Transition::Expire,
                    projected,
                    movement: refund(bounty),
                })
            })
            .await?;
        Ok(bounty)
    }

    /// Re-query the rail for a transition left in flight by a timed-out
    /// confirmation, and commit or discard it. Anyone may call.
    pub async fn resolve_in_flight(&self, id: BountyId) -> Result<Resolution, EscrowError> {
        let _guard = self.lock_bounty(id).await;
        self.resolve_locked(id).await
    }

    pub async fn resolve_all_in_flight(&self) -> Vec<(BountyId, Result<Resolution, EscrowError>)> {
        let ids: Vec<BountyId> = self.state.read().in_flight.keys().copied().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push((id, self.resolve_in_flight(id).await));
        }
        results
    }

    // ==================== Administration ====================

    pub fn update_config(
        &self,
        config: LedgerConfig,
        caller: &Principal,
    ) -> Result<LedgerConfig, EscrowError> {
        self.roles.require(caller, Role::Admin, "update configuration")?;
        validate_config(&self.rail, &config)?;
        self.state.write().config = config.clone();
        self.checkpoint();
        info!(
            "Configuration updated by {}: fee {} bps to {}, amounts {}..={}",
            caller, config.fee_rate_bps, config.fee_recipient, config.min_amount, config.max_amount
        );
        Ok(config)
    }

    pub fn pause(&self, caller: &Principal) -> Result<(), EscrowError> {
        self.roles.require(caller, Role::Admin, "pause the system")?;
        self.state.write().paused = true;
        self.checkpoint();
        warn!("Escrow paused by {}", caller);
        Ok(())
    }

    pub fn unpause(&self, caller: &Principal) -> Result<(), EscrowError> {
        self.roles.require(caller, Role::Admin, "unpause the system")?;
        self.state.write().paused = false;
        self.checkpoint();
        info!("Escrow unpaused by {}", caller);
        Ok(())
    }

    pub fn grant_role(
        &self,
        role: Role,
        principal: Principal,
        caller: &Principal,
    ) -> Result<bool, EscrowError> {
        let added = self.roles.grant(role, principal, caller)?;
        if added {
            self.checkpoint();
        }
        Ok(added)
    }

    pub fn revoke_role(
        &self,
        role: Role,
        principal: &Principal,
        caller: &Principal,
    ) -> Result<bool, EscrowError> {
        let removed = self.roles.revoke(role, principal, caller)?;
        if removed {
            self.checkpoint();
        }
        Ok(removed)
    }

    /// Compare custody against the locked total.
    pub async fn verify_custody(&self) -> Result<CustodyReport, EscrowError> {
        let held = self
            .rail
            .custody_balance()
            .await
            .map_err(|e| EscrowError::rail(None, e))?;

        let (locked, in_flight) = {
            let state = self.state.read();
            let summed = state
                .bounties
                .values()
                .filter(|b| b.is_active())
                .try_fold(0 as Amount, |acc, b| acc.checked_add(b.current_amount));
            if summed != Some(state.total_locked) {
                error!(
                    "Locked total {} disagrees with active bounties ({:?})",
                    state.total_locked, summed
                );
                return Err(EscrowError::InvariantViolation(format!(
                    "locked total {} disagrees with active bounties",
                    state.total_locked
                )));
            }
            (state.total_locked, state.in_flight.len())
        };

        let quiescent = in_flight == 0;
        if quiescent && held < locked {
            error!(
                "Custody shortfall: {} held in {} but {} locked",
                held,
                self.rail.custody_account(),
                locked
            );
            return Err(EscrowError::InvariantViolation(format!(
                "custody holds {} but {} is locked",
                held, locked
            )));
        }
        let surplus = held.saturating_sub(locked);
        if quiescent && surplus > 0 {
            warn!("Custody holds {} above the locked total", surplus);
        }
        Ok(CustodyReport {
            held,
            locked,
            surplus,
            in_flight,
            quiescent,
        })
    }

    /// Sweep custody value above the locked total to `to`. Admin only; never
    /// takes custody below the locked total.
    pub async fn recover_surplus(
        &self,
        to: &str,
        caller: &Principal,
    ) -> Result<(Amount, ConfirmedReceipt), EscrowError> {
        self.roles.require(caller, Role::Admin, "recover surplus")?;
        if !self.rail.validate_address(to) {
            return Err(EscrowError::InvalidRecipient(to.to_string()));
        }
        let _guard = self.recovery.lock().await;

        let before = self.quiescent_locked()?;
        let held = self
            .rail
            .custody_balance()
            .await
            .map_err(|e| EscrowError::rail(None, e))?;
        let after = self.quiescent_locked()?;
        let surplus = held.saturating_sub(before.max(after));
        if surplus == 0 {
            return Err(EscrowError::InvalidAmount(
                "no surplus held in custody".to_string(),
            ));
        }

        let movement = Movement::Release {
            transfers: vec![Transfer {
                to: to.to_string(),
                amount: surplus,
            }],
        };
        let handle = self
            .rail
            .submit(movement, None)
            .await
            .map_err(|e| EscrowError::rail(None, e))?;
        let receipt = match tokio::time::timeout(
            self.settings.confirmation_timeout,
            self.rail.await_confirmation(&handle),
        )
        .await
        {
            Ok(result) => result.map_err(|e| EscrowError::rail(None, e))?,
            Err(_) => {
                return Err(EscrowError::rail(
                    None,
                    RailError::Timeout {
                        submission_ref: handle.submission_ref,
                    },
                ))
            }
        };
        warn!("Recovered {} surplus from custody to {} (by {})", surplus, to, caller);
        self.checkpoint();
        Ok((surplus, receipt))
    }

    // ==================== Snapshots ====================

    /// Capture ledger state, then chain state. A movement journaled after the
    /// ledger read cannot be on the chain yet, because it is submitted only
    /// after its own persist, which waits for this one.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut roles: Vec<(Role, Vec<Principal>)> = self.roles.snapshot().into_iter().collect();
        roles.sort_by_key(|(role, _)| role.as_str());
        let mut snapshot = {
            let state = self.state.read();
            LedgerSnapshot {
                next_id: state.next_id,
                bounties: state.bounties.values().cloned().collect(),
                in_flight: state.in_flight.values().cloned().collect(),
                config: state.config.clone(),
                paused: state.paused,
                roles,
                chain: None,
                taken_at: Utc::now(),
            }
        };
        snapshot.chain = self.rail.as_custodial().map(|rail| rail.chain().snapshot());
        snapshot
    }

    /// Write a snapshot to the configured path. No-op without one.
    pub fn persist(&self) -> Result<(), EscrowError> {
        let Some(path) = &self.settings.snapshot_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();
        self.snapshot().write_to(path).map_err(|e| {
            error!("Failed to persist ledger to {}: {:#}", path.display(), e);
            EscrowError::Persistence(format!("{:#}", e))
        })
    }

    /// Persist after a change that already took effect
    fn checkpoint(&self) {
        // A failed write is logged by persist; the next one catches up
        let _ = self.persist();
    }

    /// Replace all ledger state. Only call while no operations are running.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), EscrowError> {
        validate_config(&self.rail, &snapshot.config)?;
        let has_admin = snapshot
            .roles
            .iter()
            .any(|(role, members)| *role == Role::Admin && !members.is_empty());
        if !has_admin {
            return Err(EscrowError::InvalidConfig(
                "snapshot has no admin".to_string(),
            ));
        }

        let mut state = LedgerState::new(snapshot.config);
        state.paused = snapshot.paused;
        let mut bounties = snapshot.bounties;
        bounties.sort_by_key(|b| b.id);
        for bounty in bounties {
            if bounty.id >= snapshot.next_id {
                return Err(EscrowError::InvariantViolation(format!(
                    "snapshot bounty {} is beyond next id {}",
                    bounty.id, snapshot.next_id
                )));
            }
            state.commit(bounty)?;
        }
        for entry in snapshot.in_flight {
            let id = entry.projected.id;
            if id >= snapshot.next_id {
                return Err(EscrowError::InvariantViolation(format!(
                    "snapshot in-flight bounty {} is beyond next id {}",
                    id, snapshot.next_id
                )));
            }
            if entry.transition == Transition::Create {
                state
                    .active_by_key
                    .insert(entry.projected.dedupe_key.clone(), id);
            }
            state.in_flight.insert(id, entry);
        }
        state.next_id = snapshot.next_id;

        let bounty_count = state.bounties.len();
        let in_flight = state.in_flight.len();
        *self.state.write() = state;
        self.roles.restore(snapshot.roles.into_iter().collect());
        match (snapshot.chain, self.rail.as_custodial()) {
            (Some(chain), Some(rail)) => rail.chain().restore(chain),
            (None, Some(_)) => warn!("Snapshot has no chain state; keeping the fresh chain"),
            (Some(_), None) => warn!("Ignoring chain state in snapshot on the service rail"),
            (None, None) => {}
        }
        info!(
            "Restored ledger snapshot from {} ({} bounties, {} in flight)",
            snapshot.taken_at, bounty_count, in_flight
        );
        Ok(())
    }

    // ==================== Internals ====================

    async fn lock_bounty(&self, id: BountyId) -> OwnedMutexGuard<()> {
        let lock = self.bounty_locks.lock().entry(id).or_default().clone();
        lock.lock_owned().await
    }

    fn quiescent_locked(&self) -> Result<Amount, EscrowError> {
        let state = self.state.read();
        match state.first_in_flight() {
            Some(id) => Err(EscrowError::SettlementInFlight { id }),
            None => Ok(state.total_locked),
        }
    }

    /// Serialize on the bounty, validate and journal a plan, then settle it.
    async fn transition<F>(
        &self,
        id: BountyId,
        plan: F,
    ) -> Result<(Bounty, ConfirmedReceipt), EscrowError>
    where
        F: FnOnce(&LedgerState, &Bounty, u64) -> Result<Plan, EscrowError>,
    {
        let _guard = self.lock_bounty(id).await;
        let now = self.clock.now();
        let submission_key = Uuid::new_v4();
        let movement = {
            let mut state = self.state.write();
            let current = state
                .bounties
                .get(&id)
                .cloned()
                .ok_or(EscrowError::NotFound(id))?;
            if state.in_flight.contains_key(&id) {
                return Err(EscrowError::SettlementInFlight { id });
            }
            let Plan {
                transition,
                projected,
                movement,
            } = plan(&*state, &current, now)?;
            state.in_flight.insert(
                id,
                InFlight {
                    transition,
                    projected,
                    movement: movement.clone(),
                    submission_key,
                    handle: None,
                    journaled_at: now,
                },
            );
            movement
        };

        let receipt = self.settle(id, movement, submission_key).await?;
        Ok((self.get_bounty(id)?, receipt))
    }

    /// Persist the journal, submit the movement and wait for it. Caller holds
    /// the bounty lock.
    async fn settle(
        &self,
        id: BountyId,
        movement: Movement,
        key: Uuid,
    ) -> Result<ConfirmedReceipt, EscrowError> {
        if let Err(e) = self.persist() {
            self.abandon(id, &e.to_string()).await;
            return Err(e);
        }

        let label = movement.label();
        let amount = movement.total();
        let handle = match self.rail.submit_keyed(movement, Some(id), key).await {
            Ok(handle) => handle,
            Err(e) if e.is_ambiguous() => {
                warn!(
                    "Bounty {}: {} submission under key {} has an unknown outcome ({}), keeping it in flight",
                    id, label, key, e
                );
                return Err(EscrowError::rail(Some(id), e));
            }
            Err(e) => {
                self.abandon(id, &e.to_string()).await;
                return Err(EscrowError::rail(Some(id), e));
            }
        };
        debug!(
            "Bounty {}: {} of {} submitted as {}",
            id, label, amount, handle.submission_ref
        );

        let projected = {
            let mut state = self.state.write();
            match state.in_flight.get_mut(&id) {
                Some(entry) => {
                    entry.handle = Some(handle.clone());
                    entry.projected.clone()
                }
                None => {
                    error!("Bounty {} lost its in-flight entry after submission", id);
                    return Err(EscrowError::InvariantViolation(format!(
                        "bounty {} has no in-flight entry",
                        id
                    )));
                }
            }
        };
        if let Err(e) = self
            .store
            .record_pending(&projected, &handle.submission_ref)
            .await
        {
            warn!("Bounty {}: failed to record pending submission: {:#}", id, e);
        }

        match tokio::time::timeout(
            self.settings.confirmation_timeout,
            self.rail.await_confirmation(&handle),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                self.finish(id, &receipt).await?;
                Ok(receipt)
            }
            Ok(Err(e)) if e.is_ambiguous() => {
                warn!(
                    "Bounty {}: lost track of {} ({}), keeping it in flight",
                    id, handle.submission_ref, e
                );
                Err(EscrowError::rail(Some(id), e))
            }
            Ok(Err(e)) => {
                self.abandon(id, &e.to_string()).await;
                Err(EscrowError::rail(Some(id), e))
            }
            Err(_) => {
                warn!(
                    "Bounty {}: confirmation of {} timed out after {:?}, re-querying rail",
                    id, handle.submission_ref, self.settings.confirmation_timeout
                );
                match self.resolve_locked(id).await? {
                    Resolution::Committed(receipt) => Ok(receipt),
                    Resolution::Discarded(e) => Err(EscrowError::rail(Some(id), e)),
                    Resolution::StillPending | Resolution::Idle => Err(EscrowError::rail(
                        Some(id),
                        RailError::Timeout {
                            submission_ref: handle.submission_ref,
                        },
                    )),
                }
            }
        }
    }

    async fn resolve_locked(&self, id: BountyId) -> Result<Resolution, EscrowError> {
        let (handle, key) = {
            let state = self.state.read();
            match state.in_flight.get(&id) {
                None => return Ok(Resolution::Idle),
                Some(entry) => (entry.handle.clone(), entry.submission_key),
            }
        };
        let handle = match handle {
            Some(handle) => handle,
            None => match self.recover_handle(id, key).await? {
                Some(handle) => handle,
                None => {
                    let e = RailError::Rejected("never submitted to the rail".to_string());
                    self.abandon(id, &e.to_string()).await;
                    return Ok(Resolution::Discarded(e));
                }
            },
        };

        let state = self
            .rail
            .lookup(&handle.submission_ref)
            .await
            .map_err(|e| EscrowError::rail(Some(id), e))?;
        match state {
            SubmissionState::Confirmed(receipt) => {
                self.finish(id, &receipt).await?;
                Ok(Resolution::Committed(receipt))
            }
            SubmissionState::Failed(e) => {
                self.abandon(id, &e.to_string()).await;
                Ok(Resolution::Discarded(e))
            }
            SubmissionState::Unknown => {
                let e = RailError::Rejected(format!(
                    "submission {} unknown to the rail",
                    handle.submission_ref
                ));
                self.abandon(id, &e.to_string()).await;
                Ok(Resolution::Discarded(e))
            }
            SubmissionState::Pending => {
                warn!(
                    "Bounty {}: submission {} still pending",
                    id, handle.submission_ref
                );
                Ok(Resolution::StillPending)
            }
        }
    }

    /// Ask the rail whether a submission under `key` was accepted, and attach
    /// it to the journal entry if so.
    async fn recover_handle(
        &self,
        id: BountyId,
        key: Uuid,
    ) -> Result<Option<PendingHandle>, EscrowError> {
        let found = self
            .rail
            .find_submission(key)
            .await
            .map_err(|e| EscrowError::rail(Some(id), e))?;
        let Some(submission_ref) = found else {
            return Ok(None);
        };
        info!(
            "Bounty {}: found submission {} under key {}",
            id, submission_ref, key
        );
        let handle = PendingHandle {
            submission_ref,
            rail: self.rail.kind(),
            bounty_id: Some(id),
            submitted_at: Utc::now(),
        };
        let projected = {
            let mut state = self.state.write();
            match state.in_flight.get_mut(&id) {
                Some(entry) => {
                    entry.handle = Some(handle.clone());
                    entry.projected.clone()
                }
                None => return Ok(None),
            }
        };
        if let Err(e) = self
            .store
            .record_pending(&projected, &handle.submission_ref)
            .await
        {
            warn!("Bounty {}: failed to record pending submission: {:#}", id, e);
        }
        Ok(Some(handle))
    }

    /// Commit a confirmed transition and clear its journal entry.
    async fn finish(&self, id: BountyId, receipt: &ConfirmedReceipt) -> Result<(), EscrowError> {
        let entry = {
            let mut state = self.state.write();
            let Some(entry) = state.in_flight.get(&id).cloned() else {
                return Err(EscrowError::InvariantViolation(format!(
                    "bounty {} confirmed without an in-flight entry",
                    id
                )));
            };
            if let Err(e) = state.commit(entry.projected.clone()) {
                error!(
                    "Bounty {}: confirmed {} cannot be committed: {}",
                    id,
                    entry.transition.as_str(),
                    e
                );
                return Err(e);
            }
            state.in_flight.remove(&id);
            entry
        };
        self.checkpoint();

        let bounty = &entry.projected;
        info!(
            "Bounty {} {}: {} {} ({}#{}), settlement {}",
            id,
            entry.transition.as_str(),
            bounty.status,
            bounty.current_amount,
            bounty.repository,
            bounty.issue_id,
            receipt.settlement_ref
        );
        if let Err(e) = self
            .store
            .confirm(id, &receipt.settlement_ref, &receipt.confirmation)
            .await
        {
            warn!("Bounty {}: failed to record confirmation: {:#}", id, e);
        }
        Ok(())
    }

    /// Drop a journaled transition that will never commit.
    async fn abandon(&self, id: BountyId, reason: &str) {
        let (entry, committed) = {
            let mut state = self.state.write();
            let entry = state.in_flight.remove(&id);
            if let Some(entry) = &entry {
                let key = &entry.projected.dedupe_key;
                if entry.transition == Transition::Create && state.active_by_key.get(key) == Some(&id)
                {
                    state.active_by_key.remove(key);
                }
            }
            (entry, state.bounties.get(&id).cloned())
        };
        let Some(entry) = entry else {
            return;
        };
        self.checkpoint();

        warn!(
            "Bounty {}: {} abandoned: {}",
            id,
            entry.transition.as_str(),
            reason
        );
        if entry.handle.is_some() {
            if let Err(e) = self
                .store
                .mark_failed(id, reason, committed.as_ref())
                .await
            {
                warn!("Bounty {}: failed to record failure: {:#}", id, e);
            }
        }
    }
}
