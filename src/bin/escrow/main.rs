//! Bounty Escrow CLI
//!
//! Command-line interface for querying a Bounty Escrow server.

mod client;
mod commands;
mod style;

use clap::{Parser, Subcommand};
use style::*;

#[derive(Parser)]
#[command(name = "escrow")]
#[command(author = "CortexLM")]
#[command(version)]
#[command(about = "Bounty Escrow - inspect bounties, fees and custody", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Escrow server URL
    #[arg(
        short,
        long,
        env = "ESCROW_URL",
        default_value = "http://127.0.0.1:8080",
        global = true
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a bounty by id
    #[command(visible_alias = "b")]
    Bounty { id: u64 },

    /// Find the bounty for a repository issue
    #[command(visible_alias = "wi")]
    WorkItem {
        /// Repository, e.g. owner/name
        repository: String,
        issue_id: u64,
        /// Include submission history
        #[arg(long)]
        history: bool,
    },

    /// List bounties opened by a creator
    Creator {
        principal: String,
        /// Filter by status (active, claimed, cancelled, expired)
        #[arg(long)]
        status: Option<String>,
    },

    /// List bounties paid to a solver
    Solver { principal: String },

    /// Quote the fee split for an amount
    #[command(visible_alias = "q")]
    Quote {
        /// Decimal token amount, e.g. 12.5
        amount: String,
    },

    /// Compare custody holdings against locked bounties
    Custody,

    /// Show escrow configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let server = cli.server.as_str();
    let result = match cli.command {
        Commands::Bounty { id } => commands::bounty::run(server, id).await,
        Commands::WorkItem {
            repository,
            issue_id,
            history,
        } => commands::work_item::run(server, &repository, issue_id, history).await,
        Commands::Creator { principal, status } => {
            commands::principal::run_creator(server, &principal, status.as_deref()).await
        }
        Commands::Solver { principal } => commands::principal::run_solver(server, &principal).await,
        Commands::Quote { amount } => commands::quote::run(server, &amount).await,
        Commands::Custody => commands::custody::run(server).await,
        Commands::Config => commands::config::run(server).await,
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_work_item() {
        let cli = Cli::try_parse_from([
            "escrow",
            "--server",
            "http://escrow:9000",
            "work-item",
            "acme/widgets",
            "42",
            "--history",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://escrow:9000");
        assert!(matches!(
            cli.command,
            Commands::WorkItem {
                issue_id: 42,
                history: true,
                ..
            }
        ));
    }
}
