use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use ratewatch::cache::{FeedCache, FileCache};
use ratewatch::config::Config;
use ratewatch::convert::{convert, format_rate, Direction};
use ratewatch::feed::{FeedSource, HttpFeedSource};
use ratewatch::filter::{FilteredRates, QueryFilter};
use ratewatch::refresh::RefreshCoordinator;
use ratewatch::scheduler::{self, RetryPolicy};
use ratewatch::store::{FeedSnapshot, RateStore};
use ratewatch::util::{pad_to_width, strip_control_chars};

/// Built-in feed for offline and diagnostic runs.
const DEMO_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?><rss><channel>"#,
    "<title>Demo GBP Rates</title>",
    "<lastBuildDate>Tue, 14 Oct 2025 06:00:55 UTC</lastBuildDate>",
    "<item><title>AED - United Arab Emirates Dirham</title><description>4.9471</description></item>",
    "<item><title>JPY - Japanese Yen</title><description>183.4200</description></item>",
    "</channel></rss>",
);

const CODE_COL: usize = 5;
const NAME_COL: usize = 32;
const HTTP_RETRY_DELAY: Duration = Duration::from_secs(1);
const SCHEDULER_RETRY_DELAY: Duration = Duration::from_secs(30);

type Coordinator = RefreshCoordinator<HttpFeedSource, FileCache>;

/// Get the config directory path (~/.config/ratewatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("ratewatch"))
}

#[derive(Parser, Debug)]
#[command(name = "ratewatch", about = "GBP exchange rates from a live feed")]
struct Args {
    /// Config file (default ~/.config/ratewatch/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current rates
    List {
        /// Only show rates whose code, name or country contains this text
        #[arg(long)]
        query: Option<String>,
        /// Use the cached feed instead of fetching
        #[arg(long)]
        offline: bool,
        /// Use the built-in demo feed
        #[arg(long, conflicts_with = "offline")]
        demo: bool,
    },
    /// Convert an amount between GBP and another currency
    Convert {
        /// Currency code, e.g. EUR
        code: String,
        /// Amount to convert ("," accepted as decimal separator)
        amount: String,
        /// Treat AMOUNT as the foreign currency and convert to GBP
        #[arg(long)]
        to_gbp: bool,
        #[arg(long)]
        offline: bool,
    },
    /// Keep rates refreshed; type a query on stdin to filter
    Watch,
}

/// Where the initial rates come from.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Network,
    Cache,
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for tables
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let store = RateStore::new();
    let source = HttpFeedSource::new(&config.feed_url, config.request_timeout())
        .context("Failed to build HTTP client")?
        .with_retries(config.max_retries, HTTP_RETRY_DELAY);
    tracing::info!(url = %source.url(), "Using rate feed");
    let cache = FileCache::new(config.cache_path_in(&config_dir));
    let coordinator = Arc::new(RefreshCoordinator::new(
        source,
        cache,
        store.clone(),
        config.parse_options(),
    ));

    match args.command {
        Command::List {
            query,
            offline,
            demo,
        } => {
            let origin = match (demo, offline) {
                (true, _) => Origin::Demo,
                (false, true) => Origin::Cache,
                (false, false) => Origin::Network,
            };
            load_once(&coordinator, origin).await?;

            let filter = QueryFilter::spawn(store.clone(), config.debounce());
            filter.set_query(query.as_deref());
            print_table(&store.feed(), &filter.current());
        }
        Command::Convert {
            code,
            amount,
            to_gbp,
            offline,
        } => {
            let origin = if offline { Origin::Cache } else { Origin::Network };
            load_once(&coordinator, origin).await?;

            let item = store.find_by_code(&code);
            let direction = if to_gbp {
                Direction::ForeignToGbp
            } else {
                Direction::GbpToForeign
            };
            let code = item
                .as_ref()
                .map(|i| i.code.clone())
                .unwrap_or_else(|| code.trim().to_ascii_uppercase());

            match convert(&amount, item.map(|i| i.rate), direction) {
                Ok(conversion) => println!("{}", conversion.describe(&code)),
                Err(e) => anyhow::bail!("{}: {}", code, e),
            }
        }
        Command::Watch => run_watch(coordinator, &config).await?,
    }

    Ok(())
}

/// Loads rates for a one-shot command and waits until they are applied.
///
/// A failed network fetch falls back to the cache; the store keeps the
/// fetch error so it can be reported.
async fn load_once(coordinator: &Coordinator, origin: Origin) -> Result<()> {
    match origin {
        Origin::Demo => {
            coordinator.load_text(DEMO_XML.to_string()).await;
        }
        Origin::Cache => {
            let entry = coordinator
                .cache()
                .get()
                .context("Failed to read feed cache")?
                .with_context(|| {
                    format!(
                        "No cached feed at {}; run without --offline first",
                        coordinator.cache().path().display()
                    )
                })?;
            eprintln!("Using feed cached at {}", entry.fetched_at.format("%Y-%m-%d %H:%M UTC"));
            coordinator.observe(entry.text).await;
        }
        Origin::Network => {
            if coordinator.foreground_refresh().await.is_err() && coordinator.sync_from_cache().await
            {
                eprintln!("Fetch failed, showing cached rates");
            }
        }
    }

    coordinator.shutdown().await;

    if let Some(error) = coordinator.store().snapshot().error {
        eprintln!("Error: {}", error);
    }
    Ok(())
}

async fn run_watch<S, C>(coordinator: Arc<RefreshCoordinator<S, C>>, config: &Config) -> Result<()>
where
    S: FeedSource,
    C: FeedCache,
{
    let store = coordinator.store().clone();
    let filter = QueryFilter::spawn(store.clone(), config.debounce());
    let mut filtered = filter.subscribe();
    let mut errors = store.subscribe_error();

    coordinator.sync_from_cache().await;

    let foreground = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let _ = coordinator.foreground_refresh().await;
        })
    };

    let mut periodic = config.refresh_interval().map(|interval| {
        scheduler::spawn_periodic(
            Arc::clone(&coordinator),
            interval,
            RetryPolicy {
                max_retries: config.max_retries,
                base_delay: SCHEDULER_RETRY_DELAY,
            },
        )
    });

    print_table(&store.feed(), &filter.current());
    eprintln!("Type to filter, empty line to clear, Ctrl-C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        #[cfg(unix)]
        let sigterm_fut = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_fut = std::future::pending::<Option<()>>();

        #[cfg(unix)]
        let sigint_fut = sigint.recv();
        #[cfg(not(unix))]
        let sigint_fut = tokio::signal::ctrl_c();

        tokio::select! {
            biased;

            _ = sigterm_fut => {
                tracing::info!("Received SIGTERM, shutting down gracefully");
                break;
            }

            _ = sigint_fut => {
                tracing::info!("Received SIGINT, shutting down gracefully");
                break;
            }

            Some(rates) = filtered.next() => {
                print_table(&store.feed(), &rates);
            }

            Some(error) = errors.next() => {
                if let Some(message) = error {
                    eprintln!("! {}", message);
                }
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => filter.set_query_debounced(Some(line.trim())),
                Ok(None) => {
                    tracing::debug!("stdin closed, still watching");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    foreground.abort();
    if let Some(handle) = periodic.as_mut() {
        handle.stop();
    }
    drop(filter);
    coordinator.shutdown().await;
    Ok(())
}

fn print_table(feed: &FeedSnapshot, rates: &FilteredRates) {
    println!("{}", strip_control_chars(&feed.title));
    if !feed.last_updated.is_empty() {
        println!("Last updated: {}", strip_control_chars(&feed.last_updated));
    }
    if !rates.query.trim().is_empty() {
        println!(
            "Filter \"{}\": {} of {}",
            strip_control_chars(rates.query.trim()),
            rates.items.len(),
            feed.items.len()
        );
    }
    println!();
    println!(
        "{}  {}  {:>14}",
        pad_to_width("CODE", CODE_COL),
        pad_to_width("NAME", NAME_COL),
        "1 GBP ="
    );
    for item in rates.items.iter() {
        let rate = format_rate(item.rate).unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {:>14}",
            pad_to_width(&strip_control_chars(&item.code), CODE_COL),
            pad_to_width(&strip_control_chars(&item.name), NAME_COL),
            rate
        );
    }
    if rates.items.is_empty() {
        println!("(no matching rates)");
    }
}
