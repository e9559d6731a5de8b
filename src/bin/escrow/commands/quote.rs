//! Quote command - fee split for a release amount

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, amount: &str) -> Result<()> {
    let client = EscrowClient::new(server);
    let quote = client.fee_quote(amount).await?;

    print_header("Fee Quote");
    println!("Amount:           {}", style_bold(&quote.amount_display));
    println!(
        "Fee:              {} ({} bps)",
        style_yellow(&quote.fee_display),
        quote.fee_rate_bps
    );
    println!("Solver receives:  {}", style_green(&quote.payout_display));
    Ok(())
}
