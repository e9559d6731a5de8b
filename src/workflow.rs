//! Oracle release workflow
//!
//! Turns "work item resolved, tests passing" signals into bounty releases:
//! find the active bounty, map the solver's handle to a payout address, and
//! release through the gateway with bounded retries on transient rail errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EscrowError;
use crate::gateway::PaymentGateway;
use crate::ledger::Resolution;
use crate::rail::ConfirmedReceipt;
use crate::types::{BountyId, BountyStatus, FeeSplit, Principal};

/// Maps a solver's external handle to a payout address on the active rail
#[async_trait]
pub trait PayoutDirectory: Send + Sync {
    async fn payout_address(&self, solver_identity: &str) -> Option<Principal>;
}

/// Fixed handle → address map, case-insensitive on the handle
#[derive(Debug, Default, Clone)]
pub struct StaticPayoutDirectory {
    entries: HashMap<String, Principal>,
}

impl StaticPayoutDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(handle, address)| (handle.to_lowercase(), Principal::new(address)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PayoutDirectory for StaticPayoutDirectory {
    async fn payout_address(&self, solver_identity: &str) -> Option<Principal> {
        self.entries.get(&solver_identity.to_lowercase()).cloned()
    }
}

/// A work item was resolved by a pull request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSignal {
    pub repository: String,
    pub issue_id: u64,
    pub solver_identity: String,
    pub pull_request_url: String,
    pub tests_passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "status", rename_all = "snake_case")]
pub enum SkipReason {
    TestsFailing,
    NoBounty,
    NotActive(BountyStatus),
    NoPayoutAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released {
        bounty_id: BountyId,
        split: FeeSplit,
        receipt: ConfirmedReceipt,
    },
    AlreadyReleased {
        bounty_id: BountyId,
    },
    Skipped {
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; attempt 1 never waits)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub struct OracleReleaseWorkflow {
    gateway: Arc<PaymentGateway>,
    directory: Arc<dyn PayoutDirectory>,
    oracle: Principal,
    retry: RetryPolicy,
    concurrency: usize,
}

fn skipped(reason: SkipReason) -> ReleaseOutcome {
    ReleaseOutcome::Skipped { reason }
}

impl OracleReleaseWorkflow {
    pub fn new(
        gateway: Arc<PaymentGateway>,
        directory: Arc<dyn PayoutDirectory>,
        oracle: Principal,
    ) -> Self {
        Self {
            gateway,
            directory,
            oracle,
            retry: RetryPolicy::default(),
            concurrency: 4,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn handle(&self, signal: ResolutionSignal) -> Result<ReleaseOutcome, EscrowError> {
        if !signal.tests_passed {
            debug!(
                "{}#{} resolved with failing tests, not releasing",
                signal.repository, signal.issue_id
            );
            return Ok(skipped(SkipReason::TestsFailing));
        }

        let ledger = self.gateway.ledger();
        let Some(bounty) = ledger.get_bounty_by_work_item(&signal.repository, signal.issue_id)
        else {
            return Ok(skipped(SkipReason::NoBounty));
        };
        match bounty.status {
            BountyStatus::Active => {}
            BountyStatus::Claimed => {
                return Ok(ReleaseOutcome::AlreadyReleased {
                    bounty_id: bounty.id,
                })
            }
            status => return Ok(skipped(SkipReason::NotActive(status))),
        }

        let Some(solver) = self.directory.payout_address(&signal.solver_identity).await else {
            warn!(
                "No payout address for {}, bounty {} stays open",
                signal.solver_identity, bounty.id
            );
            return Ok(skipped(SkipReason::NoPayoutAddress));
        };

        let id = bounty.id;
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
                if let Resolution::Committed(receipt) = ledger.resolve_in_flight(id).await? {
                    let bounty = ledger.get_bounty(id)?;
                    if bounty.status == BountyStatus::Claimed && bounty.solver.as_ref() == Some(&solver) {
                        info!("Bounty {} release confirmed on re-query", id);
                        return Ok(ReleaseOutcome::Released {
                            bounty_id: id,
                            split: ledger.fee_split(bounty.current_amount),
                            receipt,
                        });
                    }
                }
            }

            let result = self
                .gateway
                .release_bounty(
                    id,
                    &solver,
                    &signal.solver_identity,
                    &signal.pull_request_url,
                    &self.oracle,
                )
                .await;
            match result {
                Ok(release) => {
                    info!(
                        "Released bounty {} to {} ({}): payout {}, fee {}",
                        id,
                        signal.solver_identity,
                        solver,
                        self.gateway.format_amount(release.split.payout),
                        self.gateway.format_amount(release.split.fee)
                    );
                    return Ok(ReleaseOutcome::Released {
                        bounty_id: id,
                        split: release.split,
                        receipt: release.receipt,
                    });
                }
                Err(EscrowError::NotActive {
                    status: BountyStatus::Claimed,
                    ..
                }) => return Ok(ReleaseOutcome::AlreadyReleased { bounty_id: id }),
                Err(EscrowError::NotActive { status, .. }) => {
                    return Ok(skipped(SkipReason::NotActive(status)))
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "Release of bounty {} failed (attempt {}/{}): {}",
                        id, attempt, self.retry.max_attempts, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle signals with bounded parallelism. Results keep the input order.
    pub async fn handle_batch(
        &self,
        signals: Vec<ResolutionSignal>,
    ) -> Vec<Result<ReleaseOutcome, EscrowError>> {
        stream::iter(signals)
            .map(|signal| self.handle(signal))
            .buffered(self.concurrency)
            .collect()
            .await
    }
}
