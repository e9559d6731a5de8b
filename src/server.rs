//! Bounty Escrow Server
//!
//! HTTP API over the escrow ledger and its reconciliation projection. Reads are
//! open; resolution signals are accepted from the oracle with a bearer token.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, EscrowError};
use crate::gateway::PaymentGateway;
use crate::ledger::CustodyReport;
use crate::rail::{RailKind, SettlementRail};
use crate::reconciliation::{ReconciliationRecord, ReconciliationStore};
use crate::types::{Bounty, BountyId, BountyStatus, FeeSplit, Principal};
use crate::workflow::{OracleReleaseWorkflow, ReleaseOutcome, ResolutionSignal};

pub struct AppState {
    pub gateway: Arc<PaymentGateway>,
    pub store: Arc<dyn ReconciliationStore>,
    pub intake: Option<ResolutionIntake>,
    pub started_at: std::time::Instant,
}

/// Oracle workflow behind `POST /resolutions`
pub struct ResolutionIntake {
    pub workflow: Arc<OracleReleaseWorkflow>,
    pub token: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new();
    if state.intake.is_some() {
        router = router.route("/resolutions", post(resolutions_handler));
    }
    router
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .route("/bounties/:id", get(bounty_handler))
        .route("/work-items", get(work_item_handler))
        .route("/creators/:principal/bounties", get(creator_handler))
        .route("/solvers/:principal/bounties", get(solver_handler))
        .route("/fee-quote", get(fee_quote_handler))
        .route("/custody", get(custody_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body returned by every handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub kind: String,
    #[serde(default)]
    pub bounty_id: Option<BountyId>,
}

#[derive(Debug)]
struct HandlerError(StatusCode, ApiError);

impl From<EscrowError> for HandlerError {
    fn from(e: EscrowError) -> Self {
        let (status, kind) = match (&e, e.kind()) {
            (EscrowError::NotFound(_), _) => (StatusCode::NOT_FOUND, "not_found"),
            (_, ErrorKind::Validation) => (StatusCode::BAD_REQUEST, "validation"),
            (_, ErrorKind::Authorization) => (StatusCode::FORBIDDEN, "authorization"),
            (_, ErrorKind::StateConflict) => (StatusCode::CONFLICT, "state_conflict"),
            (_, ErrorKind::Rail) => (StatusCode::BAD_GATEWAY, "rail"),
            (_, ErrorKind::InvariantViolation) => {
                error!("Invariant violation served to API: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "invariant_violation")
            }
        };
        HandlerError(
            status,
            ApiError {
                error: e.to_string(),
                kind: kind.to_string(),
                bounty_id: e.bounty_id(),
            },
        )
    }
}

impl HandlerError {
    fn internal(e: anyhow::Error) -> Self {
        warn!("Reconciliation query failed: {:#}", e);
        HandlerError(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiError {
                error: e.to_string(),
                kind: "storage".to_string(),
                bounty_id: None,
            },
        )
    }

    fn bad_request(message: String) -> Self {
        HandlerError(
            StatusCode::BAD_REQUEST,
            ApiError {
                error: message,
                kind: "validation".to_string(),
                bounty_id: None,
            },
        )
    }

    fn unauthorized() -> Self {
        HandlerError(
            StatusCode::UNAUTHORIZED,
            ApiError {
                error: "missing or invalid bearer token".to_string(),
                kind: "authorization".to_string(),
                bounty_id: None,
            },
        )
    }

    fn not_found(what: String) -> Self {
        HandlerError(
            StatusCode::NOT_FOUND,
            ApiError {
                error: what,
                kind: "not_found".to_string(),
                bounty_id: None,
            },
        )
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, HandlerError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub rail: RailKind,
    pub paused: bool,
    pub in_flight: usize,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ledger = state.gateway.ledger();
    Json(HealthResponse {
        healthy: true,
        rail: state.gateway.rail_kind(),
        paused: ledger.is_paused(),
        in_flight: ledger.in_flight().len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ledger configuration with amounts rendered in both unit systems
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub rail: RailKind,
    pub decimals: u32,
    pub min_amount: String,
    pub max_amount: String,
    pub min_amount_display: String,
    pub max_amount_display: String,
    pub fee_rate_bps: u32,
    pub fee_recipient: Principal,
    pub paused: bool,
    pub open_creation: bool,
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let gateway = &state.gateway;
    let ledger = gateway.ledger();
    let config = ledger.config();
    Json(ConfigResponse {
        rail: gateway.rail_kind(),
        decimals: ledger.rail().decimals(),
        min_amount: config.min_amount.to_string(),
        max_amount: config.max_amount.to_string(),
        min_amount_display: gateway.format_amount(config.min_amount),
        max_amount_display: gateway.format_amount(config.max_amount),
        fee_rate_bps: config.fee_rate_bps,
        fee_recipient: config.fee_recipient,
        paused: ledger.is_paused(),
        open_creation: ledger.settings().open_creation,
    })
}

/// A bounty with its reconciliation record, when the projection has one
#[derive(Debug, Serialize, Deserialize)]
pub struct BountyView {
    pub bounty: Bounty,
    pub reconciliation: Option<ReconciliationRecord>,
}

async fn bounty_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
) -> ApiResult<BountyView> {
    let bounty = state.gateway.ledger().get_bounty(id)?;
    let reconciliation = state
        .store
        .get(id)
        .await
        .unwrap_or_else(|e| {
            warn!("Reconciliation lookup for bounty {} failed: {:#}", id, e);
            None
        });
    Ok(Json(BountyView {
        bounty,
        reconciliation,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WorkItemQuery {
    pub repository: String,
    pub issue_id: u64,
    /// Include the reconciliation history for the work item
    #[serde(default)]
    pub history: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkItemResponse {
    pub bounty: Bounty,
    #[serde(default)]
    pub history: Vec<ReconciliationRecord>,
}

async fn work_item_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkItemQuery>,
) -> ApiResult<WorkItemResponse> {
    let bounty = state
        .gateway
        .ledger()
        .get_bounty_by_work_item(&query.repository, query.issue_id)
        .ok_or_else(|| {
            HandlerError::not_found(format!(
                "no bounty for {}#{}",
                query.repository, query.issue_id
            ))
        })?;
    let history = if query.history {
        state
            .store
            .by_work_item(&query.repository, query.issue_id)
            .await
            .map_err(HandlerError::internal)?
    } else {
        Vec::new()
    };
    Ok(Json(WorkItemResponse { bounty, history }))
}

#[derive(Debug, Deserialize)]
pub struct CreatorQuery {
    pub status: Option<String>,
}

async fn creator_handler(
    State(state): State<Arc<AppState>>,
    Path(principal): Path<String>,
    Query(query): Query<CreatorQuery>,
) -> ApiResult<Vec<Bounty>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            BountyStatus::parse(s)
                .ok_or_else(|| HandlerError::bad_request(format!("unknown status '{}'", s)))?,
        ),
    };
    let bounties = state
        .gateway
        .ledger()
        .get_bounties_by_creator(&Principal::new(principal))
        .into_iter()
        .filter(|b| status.map(|s| b.status == s).unwrap_or(true))
        .collect();
    Ok(Json(bounties))
}

async fn solver_handler(
    State(state): State<Arc<AppState>>,
    Path(principal): Path<String>,
) -> Json<Vec<Bounty>> {
    Json(
        state
            .gateway
            .ledger()
            .get_bounties_by_solver(&Principal::new(principal)),
    )
}

#[derive(Debug, Deserialize)]
pub struct FeeQuoteQuery {
    /// Decimal token amount
    pub amount: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeeQuote {
    pub split: FeeSplit,
    pub fee_rate_bps: u32,
    pub amount_display: String,
    pub fee_display: String,
    pub payout_display: String,
}

async fn fee_quote_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeeQuoteQuery>,
) -> ApiResult<FeeQuote> {
    let gateway = &state.gateway;
    let amount = gateway.to_atomic(&query.amount)?;
    let split = gateway.calculate_fee(amount);
    Ok(Json(FeeQuote {
        split,
        fee_rate_bps: gateway.ledger().config().fee_rate_bps,
        amount_display: gateway.format_amount(split.amount),
        fee_display: gateway.format_amount(split.fee),
        payout_display: gateway.format_amount(split.payout),
    }))
}

async fn custody_handler(State(state): State<Arc<AppState>>) -> ApiResult<CustodyReport> {
    Ok(Json(state.gateway.ledger().verify_custody().await?))
}

/// Per-signal result of `POST /resolutions`, in request order
#[derive(Debug, Serialize)]
pub struct ResolutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReleaseOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn resolutions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(signals): Json<Vec<ResolutionSignal>>,
) -> ApiResult<Vec<ResolutionResult>> {
    let intake = state
        .intake
        .as_ref()
        .ok_or_else(|| HandlerError::not_found("resolution intake disabled".to_string()))?;
    if bearer_token(&headers) != Some(intake.token.as_str()) {
        warn!("Rejected resolution batch with a bad token");
        return Err(HandlerError::unauthorized());
    }

    info!("Handling {} resolution signals", signals.len());
    let results = intake
        .workflow
        .handle_batch(signals)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(outcome) => ResolutionResult {
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => ResolutionResult {
                outcome: None,
                error: Some(HandlerError::from(e).1),
            },
        })
        .collect();
    Ok(Json(results))
}

/// Run the server until `shutdown` resolves
pub async fn run_server(
    host: &str,
    port: u16,
    gateway: Arc<PaymentGateway>,
    store: Arc<dyn ReconciliationStore>,
    intake: Option<ResolutionIntake>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if intake.is_none() {
        info!("Resolution intake disabled");
    }
    let state = Arc::new(AppState {
        gateway,
        store,
        intake,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Bounty Escrow server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{EscrowLedger, LedgerSettings};
    use crate::rail::custodial::TxCall;
    use crate::rail::{ChainParams, CustodialRail, Rail, TokenChain};
    use crate::roles::{Role, RoleRegistry};
    use crate::storage::SqliteStore;
    use crate::types::{CreateBounty, LedgerConfig};
    use crate::workflow::{SkipReason, StaticPayoutDirectory};
    use axum::http::HeaderValue;
    use std::time::Duration;

    const TOKEN: &str = "oracle-secret";

    fn addr(n: u8) -> String {
        format!("0x{:040x}", n)
    }

    async fn state() -> Arc<AppState> {
        let chain = Arc::new(TokenChain::new(ChainParams {
            decimals: 2,
            gas_fee: 1,
            max_pending: 16,
            auto_mine: true,
        }));
        chain.fund_gas(&addr(0xa1), 100);
        chain.mint(&addr(3), 10_000);
        chain
            .submit(
                &addr(0xa1),
                TxCall::Approve {
                    owner: addr(3),
                    spender: addr(0xa0),
                    amount: 10_000,
                },
            )
            .unwrap();
        let store: Arc<SqliteStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let roles = RoleRegistry::new([Principal::new(addr(1))]).unwrap();
        roles
            .grant(Role::Oracle, Principal::new(addr(2)), &Principal::new(addr(1)))
            .unwrap();
        let ledger = EscrowLedger::new(
            Arc::new(Rail::Custodial(CustodialRail::new(chain, &addr(0xa0), &addr(0xa1)))),
            store.clone(),
            roles,
            LedgerConfig {
                min_amount: 100,
                max_amount: 100_000,
                fee_rate_bps: 250,
                fee_recipient: Principal::new(addr(0xfe)),
            },
            LedgerSettings {
                open_creation: true,
                confirmation_timeout: Duration::from_secs(5),
                snapshot_path: None,
            },
            Arc::new(ManualClock::new(1_000)),
        )
        .unwrap();
        let gateway = Arc::new(PaymentGateway::new(Arc::new(ledger)));
        gateway
            .create_bounty(
                CreateBounty {
                    repository: "acme/widgets".to_string(),
                    issue_id: 5,
                    issue_url: "https://example.com/acme/widgets/issues/5".to_string(),
                    amount: 1_000,
                    max_amount: 2_000,
                    expires_at: 0,
                },
                &Principal::new(addr(3)),
            )
            .await
            .unwrap();
        let directory = Arc::new(StaticPayoutDirectory::new([(
            "octocat".to_string(),
            addr(4),
        )]));
        let workflow = OracleReleaseWorkflow::new(
            gateway.clone(),
            directory,
            Principal::new(addr(2)),
        );
        Arc::new(AppState {
            gateway,
            store,
            intake: Some(ResolutionIntake {
                workflow: Arc::new(workflow),
                token: TOKEN.to_string(),
            }),
            started_at: std::time::Instant::now(),
        })
    }

    fn resolved(issue_id: u64) -> ResolutionSignal {
        ResolutionSignal {
            repository: "acme/widgets".to_string(),
            issue_id,
            solver_identity: "octocat".to_string(),
            pull_request_url: format!("https://example.com/acme/widgets/pull/{}", issue_id),
            tests_passed: true,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_resolutions_require_token() {
        let state = state().await;
        for headers in [HeaderMap::new(), bearer("wrong")] {
            let err = resolutions_handler(State(state.clone()), headers, Json(vec![resolved(5)]))
                .await
                .unwrap_err();
            assert_eq!(err.0, StatusCode::UNAUTHORIZED);
        }
        assert!(state.gateway.ledger().get_bounty(1).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_resolutions_release_through_workflow() {
        let state = state().await;
        let Json(results) = resolutions_handler(
            State(state.clone()),
            bearer(TOKEN),
            Json(vec![resolved(5), resolved(6)]),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0].outcome,
            Some(ReleaseOutcome::Released { bounty_id: 1, .. })
        ));
        assert_eq!(
            results[1].outcome,
            Some(ReleaseOutcome::Skipped {
                reason: SkipReason::NoBounty
            })
        );

        let bounty = state.gateway.ledger().get_bounty(1).unwrap();
        assert_eq!(bounty.status, BountyStatus::Claimed);
        assert_eq!(bounty.solver, Some(Principal::new(addr(4))));

        let Json(again) = resolutions_handler(State(state), bearer(TOKEN), Json(vec![resolved(5)]))
            .await
            .unwrap();
        assert!(matches!(
            again[0].outcome,
            Some(ReleaseOutcome::AlreadyReleased { bounty_id: 1 })
        ));
    }

    #[tokio::test]
    async fn test_bounty_lookup_and_not_found() {
        let state = state().await;
        let Json(view) = bounty_handler(State(state.clone()), Path(1)).await.unwrap();
        assert_eq!(view.bounty.current_amount, 1_000);
        assert!(view.reconciliation.is_some());

        let err = bounty_handler(State(state), Path(99)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        assert_eq!(err.1.bounty_id, Some(99));
    }

    #[tokio::test]
    async fn test_work_item_with_history() {
        let state = state().await;
        let Json(found) = work_item_handler(
            State(state.clone()),
            Query(WorkItemQuery {
                repository: "ACME/widgets".to_string(),
                issue_id: 5,
                history: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.bounty.id, 1);
        assert_eq!(found.history.len(), 1);

        let missing = work_item_handler(
            State(state),
            Query(WorkItemQuery {
                repository: "acme/widgets".to_string(),
                issue_id: 6,
                history: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_creator_filter() {
        let state = state().await;
        let Json(active) = creator_handler(
            State(state.clone()),
            Path(addr(3)),
            Query(CreatorQuery {
                status: Some("active".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(active.len(), 1);

        let Json(claimed) = creator_handler(
            State(state.clone()),
            Path(addr(3)),
            Query(CreatorQuery {
                status: Some("claimed".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(claimed.is_empty());

        let err = creator_handler(
            State(state),
            Path(addr(3)),
            Query(CreatorQuery {
                status: Some("bogus".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fee_quote_and_custody() {
        let state = state().await;
        let Json(quote) = fee_quote_handler(
            State(state.clone()),
            Query(FeeQuoteQuery {
                amount: "1.5".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(quote.split.amount, 150);
        assert_eq!(quote.split.fee, 3);
        assert_eq!(quote.payout_display, "1.47");

        let Json(report) = custody_handler(State(state.clone())).await.unwrap();
        assert_eq!(report.held, 1_000);
        assert_eq!(report.locked, 1_000);
        assert_eq!(
            state.gateway.ledger().rail().custody_balance().await.unwrap(),
            1_000
        );

        let Json(config) = config_handler(State(state)).await;
        assert_eq!(config.min_amount_display, "1");
        assert_eq!(config.decimals, 2);
    }
}
