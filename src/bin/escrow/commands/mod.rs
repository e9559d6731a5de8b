pub mod bounty;
pub mod config;
pub mod custody;
pub mod principal;
pub mod quote;
pub mod work_item;

use crate::style::*;
use bounty_escrow::units::format_units;
use bounty_escrow::Bounty;

/// One-line summary used by list views
pub fn print_bounty_row(bounty: &Bounty, decimals: u32) {
    println!(
        "  #{:<6} {:<10} {:>16}  {}#{}",
        bounty.id,
        style_status(bounty.status),
        format_units(bounty.current_amount, decimals),
        bounty.repository,
        bounty.issue_id
    );
}

pub fn print_bounty(bounty: &Bounty, decimals: u32) {
    println!("Bounty:           #{}", style_bold(&bounty.id.to_string()));
    println!("Status:           {}", style_status(bounty.status));
    println!(
        "Work item:        {}#{}",
        bounty.repository, bounty.issue_id
    );
    println!("Issue:            {}", style_dim(&bounty.issue_url));
    println!("Creator:          {}", truncate_address(bounty.creator.as_str()));
    println!(
        "Amount:           {} (initial {}, cap {})",
        style_green(&format_units(bounty.current_amount, decimals)),
        format_units(bounty.initial_amount, decimals),
        format_units(bounty.max_amount, decimals)
    );
    if bounty.escalation_count > 0 {
        println!("Escalations:      {}", bounty.escalation_count);
    }
    if bounty.expires_at > 0 {
        println!("Expires at:       {}", format_timestamp(bounty.expires_at));
    }
    if let Some(solver) = &bounty.solver {
        println!(
            "Solver:           {} ({})",
            style_cyan(bounty.solver_identity.as_deref().unwrap_or("?")),
            truncate_address(solver.as_str())
        );
    }
    if let Some(pr) = &bounty.pull_request_url {
        println!("Pull request:     {}", style_dim(pr));
    }
    if let Some(closed_at) = bounty.closed_at {
        println!("Closed at:        {}", format_timestamp(closed_at));
    }
}

fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(u64::MAX), u64::MAX.to_string());
    }
}
