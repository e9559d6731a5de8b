//! Custody command - compare custody holdings with locked bounty value

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::Result;
use bounty_escrow::units::format_units;

pub async fn run(server: &str) -> Result<()> {
    let client = EscrowClient::new(server);
    let config = client.config().await?;
    let report = client.custody().await?;
    let fmt = |v| format_units(v, config.decimals);

    print_header("Custody");
    println!("Held:             {}", style_bold(&fmt(report.held)));
    println!("Locked:           {}", fmt(report.locked));
    if report.surplus > 0 {
        println!("Surplus:          {}", style_yellow(&fmt(report.surplus)));
    }
    println!();
    if report.quiescent {
        print_success("Custody covers every active bounty");
    } else {
        print_warning(&format!(
            "{} settlements in flight, figures may move",
            report.in_flight
        ));
    }
    Ok(())
}
