mod cli;
mod crawl;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use gleaner_core::AppConfig;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;

    if let Ok(v) = std::env::var("GLEANER_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 && n <= 512 {
                config.fetcher.num_workers = n;
            }
        }
    }

    match cli.command {
        Commands::Crawl { seeds, seed, output } => {
            crawl::run_crawl(config, seeds, seed, output).await?;
        }
        Commands::Check { url, robots } => {
            crawl::run_check(config, url, robots).await?;
        }
    }

    Ok(())
}
