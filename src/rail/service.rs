//! Service-backed rail
//!
//! Value sits in an escrow account held by an external balance-transfer
//! service. Movements are submitted as atomic transfer batches and polled
//! until the service reports them settled.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Authorization, Confirmation, ConfirmedReceipt, FeeHeadroom, Movement, PendingHandle,
    RailKind, SettlementRail, SubmissionState,
};
use crate::auth::is_valid_ss58_address;
use crate::error::RailError;
use crate::types::{Amount, BountyId};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "X-Api-Key";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Amounts travel as decimal strings; JSON numbers cannot carry u128.
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::types::Amount;

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Amount>().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub idempotency_key: Uuid,
    pub fee_payer: String,
    pub transfers: Vec<TransferRequest>,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Settled {
        settled_at: DateTime<Utc>,
        reference: String,
    },
    Failed {
        reason: String,
    },
}

/// Balance-transfer service API
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn balance(&self, account: &str) -> Result<Amount, RailError>;

    async fn fee_budget(&self, account: &str) -> Result<FeeHeadroom, RailError>;

    /// Submit transfers that settle together or not at all. Returns the batch id.
    async fn submit_batch(&self, batch: &BatchRequest) -> Result<String, RailError>;

    /// `None` if the service has never seen the batch
    async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>, RailError>;

    /// Id of the batch accepted under `idempotency_key`, if any
    async fn find_batch(&self, idempotency_key: Uuid) -> Result<Option<String>, RailError>;
}

// ==================== In-memory service ====================

#[derive(Debug, Default)]
struct ServiceState {
    balances: HashMap<String, Amount>,
    fee_budgets: HashMap<String, Amount>,
    batches: BTreeMap<u64, (BatchRequest, BatchStatus)>,
    idempotency: HashMap<Uuid, u64>,
    next_batch: u64,
}

impl ServiceState {
    fn balance(&self, account: &str) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn apply(&mut self, transfers: &[TransferRequest]) -> Result<(), RailError> {
        let mut working = self.balances.clone();
        for t in transfers {
            let available = working.get(&t.from).copied().unwrap_or(0);
            if available < t.amount {
                return Err(RailError::InsufficientBalance {
                    needed: t.amount,
                    available,
                });
            }
            working.insert(t.from.clone(), available - t.amount);
            let credited = working
                .get(&t.to)
                .copied()
                .unwrap_or(0)
                .checked_add(t.amount)
                .ok_or_else(|| RailError::Rejected("balance overflow".to_string()))?;
            working.insert(t.to.clone(), credited);
        }
        self.balances = working;
        Ok(())
    }
}

/// Transfer service kept in process memory, for development and tests
pub struct InMemoryTransferService {
    state: Mutex<ServiceState>,
    fee_per_batch: Amount,
    congested: AtomicBool,
    hold: AtomicBool,
}

impl InMemoryTransferService {
    pub fn new(fee_per_batch: Amount) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            fee_per_batch,
            congested: AtomicBool::new(false),
            hold: AtomicBool::new(false),
        }
    }

    pub fn credit(&self, account: &str, amount: Amount) {
        let mut state = self.state.lock();
        let balance = state.balance(account).saturating_add(amount);
        state.balances.insert(account.to_string(), balance);
    }

    pub fn fund_fees(&self, account: &str, amount: Amount) {
        let mut state = self.state.lock();
        let budget = state
            .fee_budgets
            .get(account)
            .copied()
            .unwrap_or(0)
            .saturating_add(amount);
        state.fee_budgets.insert(account.to_string(), budget);
    }

    /// Reject new batches as if the service were rate limiting
    pub fn set_congested(&self, congested: bool) {
        self.congested.store(congested, Ordering::SeqCst);
    }

    /// Keep accepted batches pending until `settle_pending` runs
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Settle every pending batch in submission order. Returns how many settled.
    pub fn settle_pending(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<u64> = state
            .batches
            .iter()
            .filter(|(_, (_, status))| *status == BatchStatus::Pending)
            .map(|(id, _)| *id)
            .collect();

        let mut settled = 0;
        for id in pending {
            let Some((request, _)) = state.batches.get(&id).cloned() else {
                continue;
            };
            let status = match state.apply(&request.transfers) {
                Ok(()) => {
                    settled += 1;
                    settled_status(id)
                }
                Err(e) => {
                    warn!("Batch {} failed at settlement: {}", id, e);
                    BatchStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            state.batches.insert(id, (request, status));
        }
        settled
    }
}

fn settled_status(id: u64) -> BatchStatus {
    BatchStatus::Settled {
        settled_at: Utc::now(),
        reference: format!("settlement-{}", id),
    }
}

#[async_trait]
impl TransferService for InMemoryTransferService {
    async fn balance(&self, account: &str) -> Result<Amount, RailError> {
        Ok(self.state.lock().balance(account))
    }

    async fn fee_budget(&self, account: &str) -> Result<FeeHeadroom, RailError> {
        let available = self
            .state
            .lock()
            .fee_budgets
            .get(account)
            .copied()
            .unwrap_or(0);
        Ok(FeeHeadroom {
            available,
            per_submission: self.fee_per_batch,
        })
    }

    async fn submit_batch(&self, batch: &BatchRequest) -> Result<String, RailError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.idempotency.get(&batch.idempotency_key) {
            return Ok(existing.to_string());
        }
        if self.congested.load(Ordering::SeqCst) {
            return Err(RailError::Congested);
        }

        let budget = state
            .fee_budgets
            .get(&batch.fee_payer)
            .copied()
            .unwrap_or(0);
        if budget < self.fee_per_batch {
            return Err(RailError::InsufficientFeeBudget {
                needed: self.fee_per_batch,
                available: budget,
            });
        }

        let mut dry_run = ServiceState {
            balances: state.balances.clone(),
            ..ServiceState::default()
        };
        dry_run.apply(&batch.transfers)?;

        state
            .fee_budgets
            .insert(batch.fee_payer.clone(), budget - self.fee_per_batch);
        state.next_batch += 1;
        let id = state.next_batch;
        let status = if self.hold.load(Ordering::SeqCst) {
            BatchStatus::Pending
        } else {
            state.balances = dry_run.balances;
            settled_status(id)
        };
        state.batches.insert(id, (batch.clone(), status));
        state.idempotency.insert(batch.idempotency_key, id);
        Ok(id.to_string())
    }

    async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>, RailError> {
        let Ok(id) = batch_id.parse::<u64>() else {
            return Ok(None);
        };
        Ok(self
            .state
            .lock()
            .batches
            .get(&id)
            .map(|(_, status)| status.clone()))
    }

    async fn find_batch(&self, idempotency_key: Uuid) -> Result<Option<String>, RailError> {
        Ok(self
            .state
            .lock()
            .idempotency
            .get(&idempotency_key)
            .map(|id| id.to_string()))
    }
}

// ==================== HTTP service client ====================

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(with = "amount_str")]
    balance: Amount,
}

#[derive(Debug, Deserialize)]
struct FeeBudgetResponse {
    #[serde(with = "amount_str")]
    available: Amount,
    #[serde(with = "amount_str")]
    per_batch: Amount,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    needed: Option<String>,
    #[serde(default)]
    available: Option<String>,
}

/// Client for a remote balance-transfer service
pub struct HttpTransferService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransferService {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn account_url(&self, account: &str, resource: &str) -> String {
        self.url(&format!(
            "accounts/{}/{}",
            urlencoding::encode(account),
            resource
        ))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RailError> {
        let resp = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            resp.json().await.map_err(transport)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(map_error_status(status, &body))
        }
    }
}

fn transport(e: reqwest::Error) -> RailError {
    RailError::Transport(e.to_string())
}

/// Translate a non-success response into a rail error
fn map_error_status(status: StatusCode, body: &str) -> RailError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let parse_amount = |v: &Option<String>| {
        v.as_deref()
            .and_then(|s| s.parse::<Amount>().ok())
            .unwrap_or(0)
    };

    if status == StatusCode::PAYMENT_REQUIRED {
        let needed = parse_amount(&parsed.needed);
        let available = parse_amount(&parsed.available);
        if parsed.code == "insufficient_fee_budget" {
            RailError::InsufficientFeeBudget { needed, available }
        } else {
            RailError::InsufficientBalance { needed, available }
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
    {
        RailError::Congested
    } else if status.is_client_error() {
        RailError::Rejected(
            parsed
                .message
                .unwrap_or_else(|| format!("{} {}", status, body.trim())),
        )
    } else {
        RailError::Transport(format!("{} {}", status, body.trim()))
    }
}

#[async_trait]
impl TransferService for HttpTransferService {
    async fn balance(&self, account: &str) -> Result<Amount, RailError> {
        let resp: BalanceResponse = self.get_json(&self.account_url(account, "balance")).await?;
        Ok(resp.balance)
    }

    async fn fee_budget(&self, account: &str) -> Result<FeeHeadroom, RailError> {
        let resp: FeeBudgetResponse = self
            .get_json(&self.account_url(account, "fee-budget"))
            .await?;
        Ok(FeeHeadroom {
            available: resp.available,
            per_submission: resp.per_batch,
        })
    }

    async fn submit_batch(&self, batch: &BatchRequest) -> Result<String, RailError> {
        let resp = self
            .authorized(self.client.post(self.url("batches")))
            .header(IDEMPOTENCY_HEADER, batch.idempotency_key.to_string())
            .json(batch)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            let body: SubmitResponse = resp.json().await.map_err(transport)?;
            Ok(body.id)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(map_error_status(status, &body))
        }
    }

    async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>, RailError> {
        let url = self.url(&format!("batches/{}", urlencoding::encode(batch_id)));
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            resp.json().await.map(Some).map_err(transport)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(map_error_status(status, &body))
        }
    }

    async fn find_batch(&self, idempotency_key: Uuid) -> Result<Option<String>, RailError> {
        let url = self.url(&format!("batches?idempotency_key={}", idempotency_key));
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            let body: SubmitResponse = resp.json().await.map_err(transport)?;
            Ok(Some(body.id))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(map_error_status(status, &body))
        }
    }
}

// ==================== Rail ====================

pub struct ServiceRail {
    service: Arc<dyn TransferService>,
    escrow_account: String,
    operator_account: String,
    decimals: u32,
    poll_interval: Duration,
}

impl ServiceRail {
    pub fn new(
        service: Arc<dyn TransferService>,
        escrow_account: &str,
        operator_account: &str,
        decimals: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            escrow_account: escrow_account.to_string(),
            operator_account: operator_account.to_string(),
            decimals,
            poll_interval,
        }
    }

    fn batch_for(
        &self,
        movement: &Movement,
        bounty_id: Option<BountyId>,
        key: Uuid,
    ) -> BatchRequest {
        let transfers = match movement {
            Movement::Lock { from, amount } => vec![TransferRequest {
                from: from.clone(),
                to: self.escrow_account.clone(),
                amount: *amount,
            }],
            Movement::Release { transfers } => transfers
                .iter()
                .map(|t| TransferRequest {
                    from: self.escrow_account.clone(),
                    to: t.to.clone(),
                    amount: t.amount,
                })
                .collect(),
            Movement::Direct { to, amount } => vec![TransferRequest {
                from: self.operator_account.clone(),
                to: to.clone(),
                amount: *amount,
            }],
        };
        BatchRequest {
            idempotency_key: key,
            fee_payer: self.operator_account.clone(),
            transfers,
            memo: bounty_id.map(|id| format!("bounty:{}:{}", id, movement.label())),
        }
    }
}

fn receipt(batch_id: &str, settled_at: DateTime<Utc>, reference: String) -> ConfirmedReceipt {
    ConfirmedReceipt {
        submission_ref: batch_id.to_string(),
        settlement_ref: reference,
        confirmation: Confirmation::Time(settled_at),
    }
}

#[async_trait]
impl SettlementRail for ServiceRail {
    fn kind(&self) -> RailKind {
        RailKind::Service
    }

    fn decimals(&self) -> u32 {
        self.decimals
    }

    fn custody_account(&self) -> &str {
        &self.escrow_account
    }

    fn operator_account(&self) -> &str {
        &self.operator_account
    }

    fn validate_address(&self, address: &str) -> bool {
        is_valid_ss58_address(address)
    }

    async fn ensure_authorization(
        &self,
        owner: &str,
        amount: Amount,
    ) -> Result<Authorization, RailError> {
        let available = self.service.balance(owner).await?;
        if available < amount {
            return Err(RailError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        Ok(Authorization::NotRequired)
    }

    async fn balance_of(&self, account: &str) -> Result<Amount, RailError> {
        self.service.balance(account).await
    }

    async fn fee_headroom(&self) -> Result<FeeHeadroom, RailError> {
        self.service.fee_budget(&self.operator_account).await
    }

    async fn submit_keyed(
        &self,
        movement: Movement,
        bounty_id: Option<BountyId>,
        key: Uuid,
    ) -> Result<PendingHandle, RailError> {
        let batch = self.batch_for(&movement, bounty_id, key);
        let batch_id = self.service.submit_batch(&batch).await?;
        info!(
            "Submitted {} batch {} ({} transfers, total {})",
            movement.label(),
            batch_id,
            batch.transfers.len(),
            movement.total()
        );
        Ok(PendingHandle {
            submission_ref: batch_id,
            rail: RailKind::Service,
            bounty_id,
            submitted_at: Utc::now(),
        })
    }

    async fn find_submission(&self, key: Uuid) -> Result<Option<String>, RailError> {
        self.service.find_batch(key).await
    }

    async fn await_confirmation(
        &self,
        handle: &PendingHandle,
    ) -> Result<ConfirmedReceipt, RailError> {
        loop {
            match self.service.batch_status(&handle.submission_ref).await? {
                Some(BatchStatus::Settled {
                    settled_at,
                    reference,
                }) => return Ok(receipt(&handle.submission_ref, settled_at, reference)),
                Some(BatchStatus::Failed { reason }) => return Err(RailError::Rejected(reason)),
                Some(BatchStatus::Pending) => {
                    debug!("Batch {} still pending", handle.submission_ref);
                    tokio::time::sleep(self.poll_interval).await;
                }
                None => {
                    return Err(RailError::Rejected(format!(
                        "unknown batch {}",
                        handle.submission_ref
                    )))
                }
            }
        }
    }

    async fn lookup(&self, submission_ref: &str) -> Result<SubmissionState, RailError> {
        Ok(match self.service.batch_status(submission_ref).await? {
            None => SubmissionState::Unknown,
            Some(BatchStatus::Pending) => SubmissionState::Pending,
            Some(BatchStatus::Settled {
                settled_at,
                reference,
            }) => SubmissionState::Confirmed(receipt(submission_ref, settled_at, reference)),
            Some(BatchStatus::Failed { reason }) => {
                SubmissionState::Failed(RailError::Rejected(reason))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::Transfer;

    const ESCROW: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
    const OPERATOR: &str = "5FHneW46xGXgs5mUiveU4sbTyGBzmstUspZC92UhjJM694ty";
    const ALICE: &str = "5FLSigC9HGRKVhB9FiEo4Y3koPsNmBmLJbpXg2mp1hXcS59Y";

    fn service() -> Arc<InMemoryTransferService> {
        let service = Arc::new(InMemoryTransferService::new(2));
        service.fund_fees(OPERATOR, 10);
        service
    }

    fn rail(service: Arc<InMemoryTransferService>) -> ServiceRail {
        ServiceRail::new(service, ESCROW, OPERATOR, 6, Duration::from_millis(5))
    }

    fn batch(from: &str, to: &str, amount: Amount) -> BatchRequest {
        BatchRequest {
            idempotency_key: Uuid::new_v4(),
            fee_payer: OPERATOR.to_string(),
            transfers: vec![TransferRequest {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            }],
            memo: None,
        }
    }

    #[tokio::test]
    async fn test_batch_settles_and_charges_fee() {
        let service = service();
        service.credit(ALICE, 100);
        let id = service.submit_batch(&batch(ALICE, ESCROW, 40)).await.unwrap();

        assert!(matches!(
            service.batch_status(&id).await.unwrap(),
            Some(BatchStatus::Settled { .. })
        ));
        assert_eq!(service.balance(ALICE).await.unwrap(), 60);
        assert_eq!(service.balance(ESCROW).await.unwrap(), 40);
        assert_eq!(service.fee_budget(OPERATOR).await.unwrap().available, 8);
    }

    #[tokio::test]
    async fn test_idempotent_resubmission() {
        let service = service();
        service.credit(ALICE, 100);
        let request = batch(ALICE, ESCROW, 40);
        let first = service.submit_batch(&request).await.unwrap();
        let second = service.submit_batch(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.balance(ESCROW).await.unwrap(), 40);
        assert_eq!(
            service.find_batch(request.idempotency_key).await.unwrap(),
            Some(first)
        );
        assert_eq!(service.find_batch(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejections() {
        let service = service();
        service.credit(ALICE, 10);

        let err = service.submit_batch(&batch(ALICE, ESCROW, 11)).await.unwrap_err();
        assert_eq!(
            err,
            RailError::InsufficientBalance {
                needed: 11,
                available: 10
            }
        );

        service.set_congested(true);
        let err = service.submit_batch(&batch(ALICE, ESCROW, 1)).await.unwrap_err();
        assert_eq!(err, RailError::Congested);
        service.set_congested(false);

        let mut unfunded = batch(ALICE, ESCROW, 1);
        unfunded.fee_payer = ESCROW.to_string();
        let err = service.submit_batch(&unfunded).await.unwrap_err();
        assert!(matches!(err, RailError::InsufficientFeeBudget { .. }));
        assert_eq!(service.balance(ALICE).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_rail_release_with_hold() {
        let service = service();
        service.credit(ESCROW, 100);
        service.set_hold(true);
        let rail = rail(service.clone());

        let handle = rail
            .submit(
                Movement::Release {
                    transfers: vec![
                        Transfer {
                            to: ALICE.to_string(),
                            amount: 97,
                        },
                        Transfer {
                            to: OPERATOR.to_string(),
                            amount: 3,
                        },
                    ],
                },
                Some(1),
            )
            .await
            .unwrap();
        assert_eq!(
            rail.lookup(&handle.submission_ref).await.unwrap(),
            SubmissionState::Pending
        );

        let settler = service.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            settler.settle_pending();
        });
        let receipt = rail.await_confirmation(&handle).await.unwrap();
        assert!(matches!(receipt.confirmation, Confirmation::Time(_)));
        assert_eq!(rail.balance_of(ALICE).await.unwrap(), 97);
        assert_eq!(rail.custody_balance().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rail_authorization_is_balance_check() {
        let service = service();
        service.credit(ALICE, 5);
        let rail = rail(service);
        assert_eq!(
            rail.ensure_authorization(ALICE, 5).await.unwrap(),
            Authorization::NotRequired
        );
        assert!(matches!(
            rail.ensure_authorization(ALICE, 6).await,
            Err(RailError::InsufficientBalance { .. })
        ));
        assert_eq!(rail.lookup("999").await.unwrap(), SubmissionState::Unknown);
    }

    #[test]
    fn test_rail_address_validation() {
        let rail = rail(service());
        assert!(rail.validate_address(ALICE));
        assert!(!rail.validate_address("0x00000000000000000000000000000000000000a1"));
    }

    #[test]
    fn test_http_urls() {
        let client = HttpTransferService::new("https://transfers.example.com/", None);
        assert_eq!(client.base_url, "https://transfers.example.com");
        assert_eq!(
            client.url("batches"),
            "https://transfers.example.com/v1/batches"
        );
        assert_eq!(
            client.account_url("a b", "fee-budget"),
            "https://transfers.example.com/v1/accounts/a%20b/fee-budget"
        );
    }

    #[test]
    fn test_error_status_mapping() {
        let body = r#"{"code":"insufficient_fee_budget","needed":"5","available":"1"}"#;
        assert_eq!(
            map_error_status(StatusCode::PAYMENT_REQUIRED, body),
            RailError::InsufficientFeeBudget {
                needed: 5,
                available: 1
            }
        );
        assert!(matches!(
            map_error_status(StatusCode::PAYMENT_REQUIRED, "{}"),
            RailError::InsufficientBalance { .. }
        ));
        assert_eq!(
            map_error_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RailError::Congested
        );
        assert_eq!(
            map_error_status(StatusCode::BAD_REQUEST, r#"{"message":"bad account"}"#),
            RailError::Rejected("bad account".to_string())
        );
        assert!(matches!(
            map_error_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            RailError::Transport(_)
        ));
    }

    #[test]
    fn test_amounts_serialize_as_strings() {
        let json = serde_json::to_value(TransferRequest {
            from: "a".into(),
            to: "b".into(),
            amount: u128::MAX,
        })
        .unwrap();
        assert_eq!(json["amount"], u128::MAX.to_string());
    }
}
