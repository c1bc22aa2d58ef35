//! CLI parser and command dispatch.

mod classify;
mod config_cmd;
mod fetch;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use stealthfetch::{Expect, FetchOptions, Settings};

#[derive(Parser)]
#[command(name = "sfetch")]
#[command(about = "Fetch pages with identity/egress rotation, pacing and block-aware retries")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides STEALTHFETCH_CONFIG and discovered config files)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Ignore configured egress routes and connect directly
    #[arg(short = 'D', long, global = true)]
    direct: bool,

    /// Maximum requests in flight
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one or more URLs, printing one JSON line per URL
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,
        /// Accept any content type (skip HTML content checks)
        #[arg(long)]
        any: bool,
        /// Directory to save fetched bodies into
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Override the configured attempt budget
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Sticky-session key (defaults to each URL's host)
        #[arg(long)]
        session: Option<String>,
        /// Print per-route usage after the run
        #[arg(long)]
        stats: bool,
    },

    /// Classify a saved response body offline
    Classify {
        /// File containing the response body
        file: PathBuf,
        /// HTTP status of the response
        #[arg(long, default_value = "200")]
        status: u16,
        /// Content-Type header of the response
        #[arg(long)]
        content_type: Option<String>,
        /// Accept any content type (skip HTML content checks)
        #[arg(long)]
        any: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn expect_from(any: bool) -> Expect {
    if any {
        Expect::Any
    } else {
        Expect::Html
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?
        .with_env_overrides()
        .context("Invalid environment configuration")?
        .with_cli_overrides(cli.direct, cli.concurrency);

    match cli.command {
        Commands::Fetch {
            urls,
            any,
            out,
            max_attempts,
            session,
            stats,
        } => {
            let options = FetchOptions {
                expect: expect_from(any),
                session_key: session,
                max_attempts,
            };
            fetch::cmd_fetch(&settings, &urls, &options, out.as_deref(), stats || cli.verbose)
                .await
        }
        Commands::Classify {
            file,
            status,
            content_type,
            any,
        } => classify::cmd_classify(
            &settings,
            &file,
            status,
            content_type.as_deref(),
            expect_from(any),
        ),
        Commands::Config => config_cmd::cmd_config_show(&settings),
    }
}
