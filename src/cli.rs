use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gleaner", about = "Polite, horizontally-scalable web fetcher")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl seed URLs using an in-memory work queue
    Crawl {
        /// Seed URLs (comma-separated, or a file with one per line)
        #[arg(short, long)]
        seeds: Option<String>,

        /// Single seed URL
        #[arg(long)]
        seed: Option<String>,

        /// Append one JSON record per fetched page to this file
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Normalize a URL and optionally evaluate robots.txt for it
    Check {
        /// URL to inspect
        url: String,

        /// Fetch robots.txt and report the verdict for this URL
        #[arg(long)]
        robots: bool,
    },
}
