//! Bounty Escrow API Client
//!
//! Typed wrapper over the server's read-only endpoints.

use anyhow::{anyhow, Context, Result};
use bounty_escrow::ledger::CustodyReport;
use bounty_escrow::reconciliation::SyncState;
use bounty_escrow::server::{ApiError, ConfigResponse, FeeQuote, HealthResponse};
use bounty_escrow::{Bounty, BountyId, BountyStatus};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync status of the last rail submission for a bounty
#[derive(Debug, Deserialize)]
pub struct SyncSummary {
    pub id: BountyId,
    pub status: BountyStatus,
    pub sync_state: SyncState,
    #[serde(default)]
    pub submission_ref: Option<String>,
    #[serde(default)]
    pub settlement_ref: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BountyDetails {
    pub bounty: Bounty,
    pub reconciliation: Option<SyncSummary>,
}

#[derive(Debug, Deserialize)]
pub struct WorkItemDetails {
    pub bounty: Bounty,
    #[serde(default)]
    pub history: Vec<SyncSummary>,
}

pub struct EscrowClient {
    client: Client,
    base_url: String,
}

impl EscrowClient {
    pub fn new(server_url: &str) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            let text = resp.text().await.unwrap_or_else(|_| "Unknown error".into());
            match serde_json::from_str::<ApiError>(&text) {
                Ok(body) => Err(anyhow!("{} ({}, {})", body.error, body.kind, status)),
                Err(_) => Err(anyhow!("Request failed ({}): {}", status, text)),
            }
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get_json("health").await
    }

    pub async fn config(&self) -> Result<ConfigResponse> {
        self.get_json("config").await
    }

    pub async fn bounty(&self, id: BountyId) -> Result<BountyDetails> {
        self.get_json(&format!("bounties/{}", id)).await
    }

    pub async fn work_item(
        &self,
        repository: &str,
        issue_id: u64,
        history: bool,
    ) -> Result<WorkItemDetails> {
        self.get_json(&format!(
            "work-items?repository={}&issue_id={}&history={}",
            urlencoding::encode(repository),
            issue_id,
            history
        ))
        .await
    }

    pub async fn by_creator(
        &self,
        principal: &str,
        status: Option<BountyStatus>,
    ) -> Result<Vec<Bounty>> {
        let mut path = format!("creators/{}/bounties", urlencoding::encode(principal));
        if let Some(status) = status {
            path.push_str(&format!("?status={}", status.as_str()));
        }
        self.get_json(&path).await
    }

    pub async fn by_solver(&self, principal: &str) -> Result<Vec<Bounty>> {
        self.get_json(&format!(
            "solvers/{}/bounties",
            urlencoding::encode(principal)
        ))
        .await
    }

    pub async fn fee_quote(&self, amount: &str) -> Result<FeeQuote> {
        self.get_json(&format!("fee-quote?amount={}", urlencoding::encode(amount)))
            .await
    }

    pub async fn custody(&self) -> Result<CustodyReport> {
        self.get_json("custody").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_strips_trailing_slash() {
        let client = EscrowClient::new("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_url() {
        let client = EscrowClient::new("http://localhost:8080");
        assert_eq!(client.url("/custody"), "http://localhost:8080/custody");
        assert_eq!(
            client.url("bounties/7"),
            "http://localhost:8080/bounties/7"
        );
    }

    #[test]
    fn test_sync_summary_ignores_bounty_fields() {
        let json = r#"{
            "id": 3,
            "status": "claimed",
            "repository": "acme/widgets",
            "current_amount": 1500,
            "sync_state": "confirmed",
            "settlement_ref": "0xabc"
        }"#;
        let summary: SyncSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.id, 3);
        assert_eq!(summary.status, BountyStatus::Claimed);
        assert_eq!(summary.sync_state, SyncState::Confirmed);
        assert_eq!(summary.submission_ref, None);
    }
}
