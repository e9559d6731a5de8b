//! Work-item command - find the bounty for a repository issue

use crate::client::EscrowClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, repository: &str, issue_id: u64, history: bool) -> Result<()> {
    let client = EscrowClient::new(server);
    let config = client.config().await?;
    let details = client.work_item(repository, issue_id, history).await?;

    print_header(&format!("{}#{}", repository, issue_id));
    super::print_bounty(&details.bounty, config.decimals);

    if history {
        println!();
        println!("{}", style_bold("Submissions:"));
        if details.history.is_empty() {
            println!("  {}", style_dim("none recorded"));
        }
        for record in &details.history {
            println!(
                "  #{:<6} {:<10} {}",
                record.id,
                style_status(record.status),
                record.sync_state.as_str()
            );
        }
    }

    Ok(())
}
