//! Bounty command - show one bounty and its settlement status

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::Result;
use bounty_escrow::reconciliation::SyncState;
use bounty_escrow::BountyId;

pub async fn run(server: &str, id: BountyId) -> Result<()> {
    let client = EscrowClient::new(server);
    let config = client.config().await?;
    let details = client.bounty(id).await?;

    print_header(&format!("Bounty #{}", id));
    super::print_bounty(&details.bounty, config.decimals);

    println!();
    match details.reconciliation {
        Some(sync) => {
            let state = match sync.sync_state {
                SyncState::Confirmed => style_green(sync.sync_state.as_str()),
                SyncState::Pending => style_yellow(sync.sync_state.as_str()),
                SyncState::Failed => style_red(sync.sync_state.as_str()),
                SyncState::Superseded => style_dim(sync.sync_state.as_str()),
            };
            println!("Settlement:       {}", state);
            if let Some(reference) = &sync.settlement_ref {
                println!("Settlement ref:   {}", reference);
            } else if let Some(reference) = &sync.submission_ref {
                println!("Submission ref:   {}", reference);
            }
            if let Some(reason) = &sync.failure_reason {
                print_warning(&format!("Last submission failed: {}", reason));
            }
        }
        None => print_info("No reconciliation record yet"),
    }

    Ok(())
}
