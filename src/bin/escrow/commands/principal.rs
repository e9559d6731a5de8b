//! Creator and solver commands - list bounties for a principal

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::{anyhow, Result};
use bounty_escrow::units::format_units;
use bounty_escrow::{Bounty, BountyStatus};

pub async fn run_creator(server: &str, principal: &str, status: Option<&str>) -> Result<()> {
    let status = status
        .map(|s| BountyStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
        .transpose()?;
    let client = EscrowClient::new(server);
    let config = client.config().await?;
    let bounties = client.by_creator(principal, status).await?;

    print_header(&format!("Bounties created by {}", truncate_address(principal)));
    print_list(&bounties, config.decimals);
    Ok(())
}

pub async fn run_solver(server: &str, principal: &str) -> Result<()> {
    let client = EscrowClient::new(server);
    let config = client.config().await?;
    let bounties = client.by_solver(principal).await?;

    print_header(&format!("Bounties paid to {}", truncate_address(principal)));
    print_list(&bounties, config.decimals);

    let total: u128 = bounties
        .iter()
        .filter(|b| b.status == BountyStatus::Claimed)
        .map(|b| b.current_amount)
        .fold(0, u128::saturating_add);
    if total > 0 {
        println!();
        println!(
            "Total released:   {} {}",
            style_green(&format_units(total, config.decimals)),
            style_dim("(before fees)")
        );
    }
    Ok(())
}

fn print_list(bounties: &[Bounty], decimals: u32) {
    if bounties.is_empty() {
        print_info("No bounties found");
        return;
    }
    for bounty in bounties {
        super::print_bounty_row(bounty, decimals);
    }
    println!();
    println!("{}", style_dim(&format!("{} bounties", bounties.len())));
}
