//! Command line configuration

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// Blockchain watcher
///
/// Follows every configured chain and records the redemptions of cross-chain
/// messages it finds, one reconciled record per message.
///
/// # Examples
///
/// ```bash
/// # Watch every chain in the config file
/// blockchain-watcher run --config config/watchers.json --database-url ./watcher-data/watcher.db
///
/// # Replay a range of one chain without touching its cursor
/// blockchain-watcher backfiller --chain-name ethereum --from 17000000 --to 17000500
/// ```
#[derive(Parser, Debug)]
#[command(name = "blockchain-watcher")]
#[command(about = "Watch chains for VAA redemptions", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Watcher config file (JSON)
    #[arg(long, global = true, env = "WATCHER_CONFIG", default_value = "config/watchers.json")]
    pub config: String,

    /// SQLite path, `sqlite:` URL or `postgres://` URL
    #[arg(
        long,
        global = true,
        env = "WATCHER_DATABASE_URL",
        default_value = "./watcher-data/watcher.db"
    )]
    pub database_url: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every configured watcher and the admin HTTP server
    Run(RunArgs),
    /// Backfill one chain over an explicit block range, then exit
    Backfiller(BackfillerArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Host for the admin HTTP server
    #[arg(long, env = "WATCHER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the admin HTTP server
    #[arg(long, env = "WATCHER_PORT", default_value = "8080")]
    pub port: u16,

    /// Seconds watchers get to stop after SIGINT/SIGTERM
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

#[derive(Args, Debug)]
pub struct BackfillerArgs {
    /// Network the chain belongs to (logged)
    #[arg(long, value_enum, default_value = "mainnet")]
    pub network: Network,

    /// Chain to backfill, as named in the config file
    #[arg(long)]
    pub chain_name: String,

    /// Override the chain's endpoint URL
    #[arg(long)]
    pub chain_url: Option<String>,

    /// First block (inclusive)
    #[arg(long)]
    pub from: u64,

    /// Last block (inclusive)
    #[arg(long)]
    pub to: u64,

    /// Override the chain's requests per second
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Blocks per page (defaults to the chain's size_blocks)
    #[arg(long)]
    pub page_size: Option<u64>,

    /// Write the chain cursor after each page
    #[arg(long)]
    pub persist_blocks: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfiller_flags() {
        let cli = Cli::parse_from([
            "blockchain-watcher",
            "backfiller",
            "--network",
            "testnet",
            "--chain-name",
            "ethereum",
            "--chain-url",
            "https://eth.example",
            "--from",
            "10",
            "--to",
            "20",
            "--rate-limit",
            "2.5",
            "--page-size",
            "5",
            "--persist-blocks",
            "--database-url",
            ":memory:",
        ]);

        assert_eq!(cli.common.database_url, ":memory:");
        let Command::Backfiller(args) = cli.command else {
            panic!("expected backfiller");
        };
        assert_eq!(args.network, Network::Testnet);
        assert_eq!(args.chain_name, "ethereum");
        assert_eq!(args.chain_url.as_deref(), Some("https://eth.example"));
        assert_eq!((args.from, args.to), (10, 20));
        assert_eq!(args.rate_limit, Some(2.5));
        assert_eq!(args.page_size, Some(5));
        assert!(args.persist_blocks);
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["blockchain-watcher", "run"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.port, 8080);
        assert_eq!(args.shutdown_timeout, 30);
    }
}
