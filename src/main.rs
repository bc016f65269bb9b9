use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crawlrank::backlinks::{graph, BacklinkDiscoverer};
use crawlrank::config::{self, Settings};
use crawlrank::logring::{LogRing, RingLayer};
use crawlrank::progress::ProgressStore;
use crawlrank::storage::StoreError;
use crawlrank::{App, CrawlOptions, CrawlRunError};

const EXIT_OK: u8 = 0;
const EXIT_ABORT_OR_CONFIG: u8 = 1;
const EXIT_NO_BACKEND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Crawl,
    Discover,
    Reset,
    Status,
    Help,
}

#[derive(Debug)]
struct Cli {
    command: Command,
    options: CrawlOptions,
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut command = Command::Crawl;
    let mut options = CrawlOptions::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "crawl" => command = Command::Crawl,
            "discover" => command = Command::Discover,
            "--reset" | "-r" => command = Command::Reset,
            "--status" | "-s" => command = Command::Status,
            "--help" | "-h" => command = Command::Help,
            "--start-page" => options.start_page = Some(parse_number(arg, iter.next())?),
            "--max-pages" => options.max_pages = Some(parse_number(arg, iter.next())?),
            "--batch-size" => options.batch_size = Some(parse_number(arg, iter.next())?),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Cli { command, options })
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u32, String> {
    let raw = value.ok_or_else(|| format!("{flag} requires a value"))?;
    raw.parse::<u32>()
        .map_err(|_| format!("{flag} requires a positive integer, got {raw}"))
}

fn print_help() {
    println!("crawlrank - batch web crawler and backlink analysis engine");
    println!();
    println!("Usage: crawlrank [COMMAND] [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  crawl            Run resumable auto batch crawling (default)");
    println!("  discover         Run backlink discovery from seed_urls.json and compute graph metrics");
    println!();
    println!("Options:");
    println!("  --reset          Reset progress and start from page 1");
    println!("  --status         Show crawl progress and backend health");
    println!("  --start-page N   Start from page N (overrides saved progress)");
    println!("  --max-pages N    Process at most N pages this run");
    println!("  --batch-size N   URLs per batch (default 50)");
}

#[tokio::main]
async fn main() -> ExitCode {
    let ring = Arc::new(LogRing::default());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(RingLayer::new(ring.clone()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{message}");
            print_help();
            return ExitCode::from(EXIT_ABORT_OR_CONFIG);
        }
    };

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(EXIT_ABORT_OR_CONFIG);
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            ExitCode::from(EXIT_OK)
        }
        Command::Reset => {
            let store = ProgressStore::new(&settings.progress_path);
            match store.reset() {
                Ok(()) => {
                    println!("Progress reset, next run starts from page 1");
                    ExitCode::from(EXIT_OK)
                }
                Err(error) => {
                    eprintln!("failed to reset progress: {error}");
                    ExitCode::from(EXIT_ABORT_OR_CONFIG)
                }
            }
        }
        Command::Status => show_status(&settings).await,
        Command::Crawl => run_crawl(settings, cli.options).await,
        Command::Discover => run_discover(settings).await,
    }
}

/// Cancel the token on the first Ctrl-C; a second one exits immediately.
fn install_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current batch");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second interrupt, exiting immediately");
            std::process::exit(i32::from(EXIT_ABORT_OR_CONFIG));
        }
    });
}

async fn run_crawl(settings: Settings, options: CrawlOptions) -> ExitCode {
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let app = match App::bootstrap(settings, cancel).await {
        Ok(app) => app,
        Err(error) => return report_bootstrap_failure(error),
    };

    match app.batch_crawler().run(options).await {
        Ok(summary) => {
            println!(
                "Crawl finished: {} URLs processed ({} ok, {} failed) across {} batches in {:.1}s",
                summary.pages_processed,
                summary.successful,
                summary.failed,
                summary.batches,
                summary.elapsed_s
            );
            ExitCode::from(EXIT_OK)
        }
        Err(CrawlRunError::Store(error)) if error.is_quota_exhaustion() => {
            eprintln!("{error}");
            ExitCode::from(EXIT_NO_BACKEND)
        }
        Err(error) => {
            eprintln!("crawl failed: {error}");
            ExitCode::from(EXIT_ABORT_OR_CONFIG)
        }
    }
}

async fn run_discover(settings: Settings) -> ExitCode {
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let seeds = match config::load_seed_urls(&settings.seed_urls_path) {
        Ok(seeds) if !seeds.is_empty() => seeds,
        Ok(_) => {
            eprintln!("no valid seed URLs in {}", settings.seed_urls_path);
            return ExitCode::from(EXIT_ABORT_OR_CONFIG);
        }
        Err(error) => {
            eprintln!("seed file error: {error}");
            return ExitCode::from(EXIT_ABORT_OR_CONFIG);
        }
    };

    let max_depth = settings.max_depth;
    let max_concurrent = settings.max_concurrent;
    let app = match App::bootstrap(settings, cancel.clone()).await {
        Ok(app) => app,
        Err(error) => return report_bootstrap_failure(error),
    };

    let mut discoverer =
        BacklinkDiscoverer::new(app.fetcher(), max_depth, max_concurrent, cancel);
    match app.store.urls_batch(1, 200).await {
        Ok(known) => discoverer.prime_from_known(&known),
        Err(error) => tracing::warn!(%error, "could not prime frontier from stored backlinks"),
    }
    let backlinks = discoverer.discover(&seeds).await;
    println!(
        "Discovery complete: {} backlinks from {} pages",
        backlinks.len(),
        discoverer.visited_count()
    );

    let result: Result<(), StoreError> = async {
        let stored = app.store.store_backlinks(&backlinks).await?;
        println!("Stored {stored} new backlinks");

        // Graph metrics run over everything accumulated so far, not just
        // this run's findings.
        let all = app.store.all_backlinks().await?;
        let authority = graph::domain_authority(&all);
        app.store.store_domain_scores(&authority).await?;
        println!("Stored domain authority for {} domains", authority.len());

        let link_graph = graph::LinkGraph::from_backlinks(&all);
        let ranks = link_graph.pagerank(graph::DAMPING_FACTOR);
        app.store.store_pagerank_scores(&ranks).await?;
        println!(
            "PageRank computed over {} nodes / {} edges",
            link_graph.node_count(),
            link_graph.edge_count()
        );

        let spam = graph::detect_spam(&all);
        if !spam.is_empty() {
            println!("Flagged {} potential spam backlinks", spam.len());
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(error) if error.is_quota_exhaustion() => {
            eprintln!("{error}");
            ExitCode::from(EXIT_NO_BACKEND)
        }
        Err(error) => {
            eprintln!("discovery storage failed: {error}");
            ExitCode::from(EXIT_ABORT_OR_CONFIG)
        }
    }
}

async fn show_status(settings: &Settings) -> ExitCode {
    let store = ProgressStore::new(&settings.progress_path);
    match store.load() {
        Ok(progress) => {
            println!("Crawl progress");
            println!("  current page:  {}", progress.current_page);
            println!("  batch size:    {}", progress.batch_size);
            println!("  processed:     {}", progress.urls_processed);
            println!("  successful:    {}", progress.successful_crawls);
            println!("  failed:        {}", progress.failed_crawls);
            if progress.total_urls > 0 {
                let completion =
                    progress.urls_processed as f64 / progress.total_urls as f64 * 100.0;
                println!("  completion:    {completion:.1}%");
            }
            if let Some(last_update) = &progress.last_update {
                println!("  last update:   {last_update}");
            }
            if let (Some(session), Some(db)) = (progress.session_id, &progress.db_name) {
                println!("  session:       {session} in {db}");
            }
        }
        Err(error) => {
            eprintln!("failed to load progress: {error}");
            return ExitCode::from(EXIT_ABORT_OR_CONFIG);
        }
    }

    // Backend health is best effort; status still works when the
    // registry cannot be opened.
    match App::bootstrap(settings.clone(), CancellationToken::new()).await {
        Ok(app) => {
            println!("Backends");
            for health in app.store.router().health_snapshot().await {
                println!(
                    "  {:<20} {:>9} pool  {:?}  storage={}B writes={} reachable={}",
                    health.name,
                    health.pool.to_string(),
                    health.level,
                    health.storage_bytes,
                    health.rows_written,
                    health.reachable
                );
            }
        }
        Err(error) => {
            println!("Backends unavailable: {error}");
        }
    }
    ExitCode::from(EXIT_OK)
}

fn report_bootstrap_failure(error: crawlrank::AppError) -> ExitCode {
    match &error {
        crawlrank::AppError::Store(store_error) if store_error.is_quota_exhaustion() => {
            eprintln!("{error}");
            ExitCode::from(EXIT_NO_BACKEND)
        }
        _ => {
            eprintln!("startup failed: {error}");
            ExitCode::from(EXIT_ABORT_OR_CONFIG)
        }
    }
}
