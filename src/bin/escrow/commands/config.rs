//! Config command - show escrow configuration

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str) -> Result<()> {
    let client = EscrowClient::new(server);
    let health = client.health().await?;
    let config = client.config().await?;

    print_header("Escrow Configuration");
    println!(
        "Server:           {} {}",
        style_cyan(server),
        style_dim(&format!("v{}, up {}s", health.version, health.uptime_secs))
    );
    println!("Rail:             {}", style_bold(&config.rail.to_string()));
    println!("Decimals:         {}", config.decimals);
    println!(
        "Amount range:     {} .. {}",
        config.min_amount_display, config.max_amount_display
    );
    println!(
        "Fee:              {} bps to {}",
        config.fee_rate_bps,
        truncate_address(config.fee_recipient.as_str())
    );
    println!(
        "Creation:         {}",
        if config.open_creation {
            "open"
        } else {
            "restricted to creators"
        }
    );

    println!();
    if config.paused {
        print_warning("Escrow is paused: creation, escalation and release are rejected");
    } else {
        print_success("Escrow is accepting operations");
    }
    if health.in_flight > 0 {
        print_info(&format!("{} settlements in flight", health.in_flight));
    }
    Ok(())
}
