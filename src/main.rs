//! Bounty Escrow Server
//!
//! Builds the rail, ledger, reconciliation store and gateway from config,
//! recovers in-flight settlements, and serves the API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bounty_escrow::config::{Config, CustodialConfig, RailChoice, ServiceConfig};
use bounty_escrow::rail::{
    ChainParams, CustodialRail, HttpTransferService, Rail, ServiceRail, TokenChain,
};
use bounty_escrow::server::ResolutionIntake;
use bounty_escrow::units::parse_units;
use bounty_escrow::{
    ErrorKind, EscrowLedger, LedgerSnapshot, OracleReleaseWorkflow, PaymentGateway, PgStore,
    Principal, ReconciliationStore, Resolution, Role, RoleRegistry, SettlementRail, SqliteStore,
    StaticPayoutDirectory, SystemClock,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Bounty Escrow Server");

    let config = Config::load()?;
    let rail = Arc::new(build_rail(&config)?);
    info!(
        "Using {} rail (custody {}, operator {})",
        rail.kind(),
        rail.custody_account(),
        rail.operator_account()
    );

    let store: Arc<dyn ReconciliationStore> = match config.database_url() {
        Some(url) => {
            let store = PgStore::new(&url).await?;
            info!("PostgreSQL reconciliation store initialized");
            Arc::new(store)
        }
        None => {
            let path = &config.database.sqlite_path;
            let store = SqliteStore::new(path)?;
            info!("SQLite reconciliation store at {}", path.display());
            Arc::new(store)
        }
    };

    let ledger = Arc::new(build_ledger(&config, rail, store.clone())?);
    match &config.ledger.snapshot_path {
        Some(path) => restore_snapshot(&ledger, path)?,
        None => warn!("No ledger.snapshot_path configured, ledger state will not survive a restart"),
    }

    // A projection row the ledger has never issued means the snapshot is stale
    if let Some(highest) = store
        .highest_bounty_id()
        .await
        .context("Failed to read reconciliation projection")?
    {
        if highest >= ledger.next_id() {
            anyhow::bail!(
                "Reconciliation store holds bounty {} but the ledger only issued ids below {}; \
                 refusing to rebuild the projection from stale ledger state",
                highest,
                ledger.next_id()
            );
        }
    }
    let rebuilt = store
        .rebuild(&ledger.all_bounties())
        .await
        .context("Failed to rebuild reconciliation projection")?;
    info!("Reconciliation projection rebuilt ({} rows)", rebuilt);

    for (id, result) in ledger.resolve_all_in_flight().await {
        match result {
            Ok(Resolution::StillPending) => warn!("Bounty {} settlement still pending", id),
            Ok(resolution) => info!("Bounty {} in-flight settlement resolved: {:?}", id, resolution),
            Err(e) => error!("Bounty {} in-flight settlement unresolved: {}", id, e),
        }
    }
    match ledger.verify_custody().await {
        Ok(report) => info!(
            "Custody holds {} against {} locked ({} surplus)",
            report.held, report.locked, report.surplus
        ),
        Err(e) if e.kind() == ErrorKind::InvariantViolation => {
            return Err(e).context("Custody does not cover the restored ledger");
        }
        Err(e) => error!("Custody check failed: {}", e),
    }
    ledger
        .persist()
        .context("Failed to persist ledger after startup")?;

    let gateway = Arc::new(PaymentGateway::new(ledger.clone()));
    let intake = build_intake(&config, &gateway);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };
    bounty_escrow::server::run_server(
        &config.host(),
        config.port(),
        gateway,
        store,
        intake,
        shutdown,
    )
    .await?;

    ledger
        .persist()
        .context("Failed to write final snapshot")?;
    info!("Bounty Escrow Server stopped");
    Ok(())
}

/// Oracle intake needs a token and an oracle principal holding the role
fn build_intake(config: &Config, gateway: &Arc<PaymentGateway>) -> Option<ResolutionIntake> {
    let token = config.server.oracle_token()?;
    let Some(oracle) = config
        .ledger
        .oracles
        .iter()
        .map(|o| Principal::new(o.as_str()))
        .find(|o| gateway.ledger().roles().has_role(o, Role::Oracle))
    else {
        warn!("Oracle token set but no configured oracle holds the role, intake disabled");
        return None;
    };
    let directory = StaticPayoutDirectory::new(config.directory.payouts.clone());
    info!(
        "Resolution intake enabled for oracle {} ({} payout addresses)",
        oracle,
        directory.len()
    );
    let workflow = OracleReleaseWorkflow::new(gateway.clone(), Arc::new(directory), oracle);
    Some(ResolutionIntake {
        workflow: Arc::new(workflow),
        token,
    })
}

fn build_rail(config: &Config) -> anyhow::Result<Rail> {
    match config.rail.kind {
        RailChoice::Custodial => {
            let custodial = config
                .rail
                .custodial
                .as_ref()
                .context("[rail.custodial] section missing")?;
            build_custodial(custodial)
        }
        RailChoice::Service => {
            let service = config
                .rail
                .service
                .as_ref()
                .context("[rail.service] section missing")?;
            Ok(build_service(service))
        }
    }
}

fn build_custodial(config: &CustodialConfig) -> anyhow::Result<Rail> {
    let params = ChainParams {
        decimals: config.decimals,
        gas_fee: parse_units(&config.gas_fee, 0).context("Invalid rail.custodial.gas_fee")?,
        max_pending: config.max_pending,
        auto_mine: true,
    };
    let chain = Arc::new(TokenChain::new(params));
    if let Some(gas) = &config.operator_gas {
        let gas = parse_units(gas, 0).context("Invalid rail.custodial.operator_gas")?;
        chain.fund_gas(&config.operator, gas);
    }
    for allocation in &config.genesis {
        let amount = parse_units(&allocation.amount, config.decimals)
            .with_context(|| format!("Invalid genesis amount for {}", allocation.account))?;
        chain.mint(&allocation.account, amount);
        info!("Genesis: {} tokens to {}", allocation.amount, allocation.account);
    }
    let rail = CustodialRail::new(chain, &config.vault, &config.operator);
    for (name, account) in [("vault", &config.vault), ("operator", &config.operator)] {
        if !rail.validate_address(account) {
            anyhow::bail!("rail.custodial.{} is not a valid address: {}", name, account);
        }
    }
    Ok(Rail::Custodial(rail))
}

fn build_service(config: &ServiceConfig) -> Rail {
    let api_key = config.api_key();
    if api_key.is_none() {
        warn!("No API key for the transfer service, requests are unauthenticated");
    }
    let service = Arc::new(HttpTransferService::new(&config.base_url, api_key));
    Rail::ServiceBacked(ServiceRail::new(
        service,
        &config.escrow_account,
        &config.operator_account,
        config.decimals,
        Duration::from_millis(config.poll_interval_ms),
    ))
}

fn build_ledger(
    config: &Config,
    rail: Arc<Rail>,
    store: Arc<dyn ReconciliationStore>,
) -> anyhow::Result<EscrowLedger> {
    let admins = config.ledger.admins.iter().map(|a| Principal::new(a.as_str()));
    let roles = RoleRegistry::new(admins)?;
    let bootstrap = roles
        .members(Role::Admin)
        .into_iter()
        .next()
        .context("No admin configured")?;
    for (role, members) in [
        (Role::Oracle, &config.ledger.oracles),
        (Role::Creator, &config.ledger.creators),
    ] {
        for member in members {
            roles.grant(role, Principal::new(member.as_str()), &bootstrap)?;
        }
    }

    let ledger = EscrowLedger::new(
        rail,
        store,
        roles,
        config.ledger_config()?,
        config.ledger_settings(),
        Arc::new(SystemClock),
    )?;
    Ok(ledger)
}

fn restore_snapshot(ledger: &EscrowLedger, path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        info!("No snapshot at {}, starting with an empty ledger", path.display());
        return Ok(());
    }
    let snapshot = LedgerSnapshot::read_from(path)?;
    ledger
        .restore(snapshot)
        .with_context(|| format!("Failed to restore snapshot {}", path.display()))?;
    Ok(())
}
