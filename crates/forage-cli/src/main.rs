use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use forage_client::{HackerNewsClient, Post, RedditClient, RedditSort, StoryList};
use forage_core::{AppError, ErrorHandler, MultiTierTokenBucket, ResilienceConfig, TokenBucket};

#[derive(Parser)]
#[command(name = "forage", version, about = "Rate-limited forum scraper for Hacker News and Reddit")]
struct Cli {
    /// Output format for collected posts
    #[arg(short, long, value_enum, global = true, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect stories from Hacker News
    Hn {
        /// Story list: top, new or best
        #[arg(long, default_value = "top")]
        list: StoryList,

        /// Number of stories to collect
        #[arg(short, long, default_value_t = 30)]
        limit: usize,

        /// Requests per second allowed against the API
        #[arg(long, env = "FORAGE_HN_PER_SECOND", default_value_t = 10.0)]
        per_second: f64,

        /// Requests per minute allowed against the API
        #[arg(long, env = "FORAGE_HN_PER_MINUTE", default_value_t = 300.0)]
        per_minute: f64,

        /// Requests per hour allowed against the API
        #[arg(long, env = "FORAGE_HN_PER_HOUR", default_value_t = 10_000.0)]
        per_hour: f64,
    },

    /// Collect posts from a subreddit listing
    Reddit {
        /// Subreddit name without the r/ prefix
        #[arg(short, long)]
        subreddit: String,

        /// Listing sort: hot, new, top or rising
        #[arg(long, default_value = "hot")]
        sort: RedditSort,

        /// Number of posts to collect (max 100)
        #[arg(short, long, default_value_t = 25)]
        limit: u32,

        /// Requests per minute allowed against the API
        #[arg(long, env = "FORAGE_REDDIT_PER_MINUTE", default_value_t = 60.0)]
        per_minute: f64,

        /// Burst size for Reddit requests
        #[arg(long, env = "FORAGE_REDDIT_BURST", default_value_t = 10.0)]
        burst: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("forage=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    let config = ResilienceConfig::from_env().context("Invalid resilience configuration")?;
    let cancel = CancellationToken::new();
    let handler = Arc::new(ErrorHandler::new(config).with_cancellation(cancel.clone()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling pending requests");
                cancel.cancel();
            }
        }
    });

    let result = collect(cli.command, handler.clone()).await;

    tracing::debug!(
        stats = %serde_json::to_string(&handler.stats())?,
        "Resilience state after run"
    );

    match result {
        Ok(posts) => {
            tracing::info!(count = posts.len(), "Collected posts");
            write_posts(&posts, format)
        }
        Err(err) if format == OutputFormat::Json => {
            eprintln!("{}", serde_json::to_string(&err)?);
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

async fn collect(command: Commands, handler: Arc<ErrorHandler>) -> Result<Vec<Post>, AppError> {
    match command {
        Commands::Hn {
            list,
            limit,
            per_second,
            per_minute,
            per_hour,
        } => {
            let limiter = MultiTierTokenBucket::multi_tier(per_second, per_minute, per_hour)?;
            let client = HackerNewsClient::new(handler)?.with_limiter(limiter);

            tracing::info!(list = %list, limit, "Fetching Hacker News stories");
            client.stories(list, limit).await
        }
        Commands::Reddit {
            subreddit,
            sort,
            limit,
            per_minute,
            burst,
        } => {
            let bucket = TokenBucket::per_minute(per_minute, Some(burst))?;
            let client = RedditClient::new(handler)?.with_bucket(bucket);

            tracing::info!(subreddit = %subreddit, sort = %sort, limit, "Fetching Reddit listing");
            client.listing(&subreddit, sort, limit).await
        }
    }
}

fn write_posts(posts: &[Post], format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, posts)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            for post in posts {
                writer.serialize(post).context("Failed to write CSV row")?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}
