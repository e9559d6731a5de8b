//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding and reconciliation database
//! - Ledger economics, bootstrap roles and snapshots
//! - Settlement rail selection (custodial chain or transfer service)
//! - Static payout directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerSettings;
use crate::types::{LedgerConfig, Principal};
use crate::units::parse_units;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");
const CONFIG_PATH_ENV: &str = "ESCROW_CONFIG";

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub ledger: LedgerSection,
    pub rail: RailConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Environment variable holding the bearer token for resolution intake.
    /// Intake is disabled when unset.
    #[serde(default)]
    pub oracle_token_env: Option<String>,
}

/// Reconciliation store. DATABASE_URL selects PostgreSQL instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("escrow.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    /// Decimal token amount
    pub min_amount: String,
    /// Decimal token amount
    pub max_amount: String,
    pub fee_rate_bps: u32,
    pub fee_recipient: String,
    pub admins: Vec<String>,
    #[serde(default)]
    pub oracles: Vec<String>,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default = "default_true")]
    pub open_creation: bool,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    /// Rewritten on every committed change when set
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_confirmation_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailChoice {
    Custodial,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailConfig {
    pub kind: RailChoice,
    #[serde(default)]
    pub custodial: Option<CustodialConfig>,
    #[serde(default)]
    pub service: Option<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodialConfig {
    pub vault: String,
    pub operator: String,
    #[serde(default = "default_chain_decimals")]
    pub decimals: u32,
    /// Atomic units charged per transaction
    pub gas_fee: String,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Native gas credited to the operator at startup
    #[serde(default)]
    pub operator_gas: Option<String>,
    #[serde(default)]
    pub genesis: Vec<GenesisAllocation>,
}

fn default_chain_decimals() -> u32 {
    18
}

fn default_max_pending() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub account: String,
    /// Decimal token amount
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub escrow_account: String,
    pub operator_account: String,
    pub decimals: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_poll_interval() -> u64 {
    500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Solver handle → payout address
    #[serde(default)]
    pub payouts: BTreeMap<String, String>,
}

impl Config {
    /// Load from $ESCROW_CONFIG, else config.toml, else the embedded default
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::load_from(path),
            _ => Self::load_from("config.toml"),
        }
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Self::parse(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        match self.rail.kind {
            RailChoice::Custodial if self.rail.custodial.is_none() => {
                anyhow::bail!("rail.kind is custodial but [rail.custodial] is missing")
            }
            RailChoice::Service if self.rail.service.is_none() => {
                anyhow::bail!("rail.kind is service but [rail.service] is missing")
            }
            _ => {}
        }
        if self.ledger.admins.is_empty() {
            anyhow::bail!("ledger.admins must name at least one admin");
        }
        Ok(())
    }

    /// ESCROW_HOST takes precedence
    pub fn host(&self) -> String {
        match std::env::var("ESCROW_HOST") {
            Ok(host) if !host.is_empty() => host,
            _ => self.server.host.clone(),
        }
    }

    /// ESCROW_PORT takes precedence
    pub fn port(&self) -> u16 {
        std::env::var("ESCROW_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.server.port)
    }

    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty())
    }

    /// Decimals of the selected rail
    pub fn rail_decimals(&self) -> u32 {
        match self.rail.kind {
            RailChoice::Custodial => self
                .rail
                .custodial
                .as_ref()
                .map(|c| c.decimals)
                .unwrap_or_else(default_chain_decimals),
            RailChoice::Service => self.rail.service.as_ref().map(|s| s.decimals).unwrap_or(0),
        }
    }

    /// Economic configuration in the selected rail's atomic units
    pub fn ledger_config(&self) -> Result<LedgerConfig> {
        let decimals = self.rail_decimals();
        Ok(LedgerConfig {
            min_amount: parse_units(&self.ledger.min_amount, decimals)
                .context("Invalid ledger.min_amount")?,
            max_amount: parse_units(&self.ledger.max_amount, decimals)
                .context("Invalid ledger.max_amount")?,
            fee_rate_bps: self.ledger.fee_rate_bps,
            fee_recipient: Principal::new(self.ledger.fee_recipient.as_str()),
        })
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            open_creation: self.ledger.open_creation,
            confirmation_timeout: Duration::from_secs(self.ledger.confirmation_timeout_secs),
            snapshot_path: self.ledger.snapshot_path.clone(),
        }
    }
}

impl ServerConfig {
    pub fn oracle_token(&self) -> Option<String> {
        self.oracle_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty())
    }
}

impl ServiceConfig {
    /// API key from the environment variable named by `api_key_env`
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                oracle_token_env: None,
            },
            database: DatabaseConfig::default(),
            ledger: LedgerSection {
                min_amount: "1".to_string(),
                max_amount: "100000".to_string(),
                fee_rate_bps: 250,
                fee_recipient: "0x00000000000000000000000000000000000000fe".to_string(),
                admins: vec!["0x0000000000000000000000000000000000000001".to_string()],
                oracles: Vec::new(),
                creators: Vec::new(),
                open_creation: true,
                confirmation_timeout_secs: default_confirmation_timeout(),
                snapshot_path: None,
            },
            rail: RailConfig {
                kind: RailChoice::Custodial,
                custodial: Some(CustodialConfig {
                    vault: "0x00000000000000000000000000000000000000a0".to_string(),
                    operator: "0x00000000000000000000000000000000000000a1".to_string(),
                    decimals: default_chain_decimals(),
                    gas_fee: "21000".to_string(),
                    max_pending: default_max_pending(),
                    operator_gas: None,
                    genesis: Vec::new(),
                }),
                service: None,
            },
            directory: DirectoryConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.rail.kind, RailChoice::Custodial);
        assert_eq!(config.rail_decimals(), 18);
        assert_eq!(config.ledger.fee_rate_bps, 250);
        assert_eq!(config.directory.payouts.len(), 1);
        assert!(config.rail.service.is_some());
    }

    #[test]
    fn test_ledger_config_uses_rail_decimals() {
        let mut config = Config::default();
        let ledger = config.ledger_config().unwrap();
        assert_eq!(ledger.min_amount, 1_000_000_000_000_000_000);

        config.rail.kind = RailChoice::Service;
        config.rail.service = Some(ServiceConfig {
            base_url: "http://localhost:9955".to_string(),
            escrow_account: "escrow".to_string(),
            operator_account: "operator".to_string(),
            decimals: 2,
            poll_interval_ms: 100,
            api_key_env: None,
        });
        config.ledger.max_amount = "12.5".to_string();
        let ledger = config.ledger_config().unwrap();
        assert_eq!(ledger.min_amount, 100);
        assert_eq!(ledger.max_amount, 1_250);

        config.ledger.min_amount = "0.001".to_string();
        assert!(config.ledger_config().is_err());
    }

    #[test]
    fn test_missing_rail_section_is_rejected() {
        let content = DEFAULT_CONFIG.replace("kind = \"custodial\"", "kind = \"service\"");
        assert!(Config::parse(&content).is_ok());

        let without_service = match content.find("[rail.service]") {
            Some(start) => {
                let end = content[start..]
                    .find("[directory")
                    .map(|i| start + i)
                    .unwrap_or(content.len());
                format!("{}{}", &content[..start], &content[end..])
            }
            None => content.clone(),
        };
        assert!(Config::parse(&without_service).is_err());
    }

    #[test]
    fn test_load_from_missing_path_uses_default() {
        let config = Config::load_from("/nonexistent/escrow-config.toml").unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("escrow-config-{}.toml", uuid::Uuid::new_v4()));
        let content = DEFAULT_CONFIG.replace("port = 8080", "port = 9191");
        std::fs::write(&path, content).unwrap();
        let config = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.server.port, 9191);
        assert_eq!(
            config.ledger_settings().confirmation_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.ledger_settings().snapshot_path,
            Some(PathBuf::from("escrow-snapshot.json"))
        );
        assert_eq!(
            config.server.oracle_token_env.as_deref(),
            Some("ESCROW_ORACLE_TOKEN")
        );
    }
}
