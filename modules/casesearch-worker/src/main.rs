use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use casesearch_common::{Config, QueuedCase};
use casesearch_scraper::pg::{
    self, PgCaseStore, PgFailureLog, PgLivenessTable, PgPageStore, PgQueue, SCRAPER_FAILED_QUEUE,
    SCRAPER_QUEUE,
};
use casesearch_scraper::{
    DeletePermanentFailures, Harness, HarnessError, HttpSession, HttpSessionFactory, Scraper,
    ScraperConfig,
};
use casesearch_worker::{ChainRunner, ChannelInvoker, Trigger, WorkerConfig, WorkerController};

#[derive(Parser)]
#[command(name = "casesearch-worker")]
#[command(about = "Case Search detail page scraper")]
#[command(version)]
struct Cli {
    /// Session pool size (defaults to SCRAPER_DEFAULT_CONCURRENCY)
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run schedule ticks and the worker chain until interrupted
    Run,

    /// Handle one schedule tick and drain the resulting chain
    Tick,

    /// Handle one JSON trigger event and drain the resulting chain
    Handle {
        #[arg(long)]
        event: String,
    },

    /// Scrape a single case by number
    Case { case_number: String },

    /// Scrape every case that has never been scraped
    Backfill {
        #[arg(long)]
        batch_size: Option<i64>,
    },

    /// Drain the failed-items queue
    FailedQueue {
        #[arg(long)]
        nitems: Option<usize>,
    },

    /// Register a case and put it on the scraper queue
    Enqueue {
        case_number: String,
        detail_loc: String,
    },

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("casesearch=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();

    let threads = cli.threads.unwrap_or(config.scraper_default_concurrency);
    let pool = pg::connect(&config.database_url, threads as u32 + 4).await?;
    pg::migrate(&pool).await?;

    match cli.command {
        Commands::Migrate => {
            info!("Migrations applied");
            Ok(())
        }
        Commands::Enqueue {
            case_number,
            detail_loc,
        } => enqueue(&config, pool, case_number, detail_loc).await,
        Commands::Case { case_number } => {
            let scraper = build_scraper(&config, &pool);
            let factory = HttpSessionFactory::from_config(&config);
            scraper.scrape_specific_case(&factory, &case_number).await?;
            info!(case_number = %case_number, "Case scraped");
            Ok(())
        }
        Commands::Backfill { batch_size } => {
            let harness = build_harness(&config, &pool, threads).await?;
            let stats = harness
                .scrape_missing_cases(batch_size.unwrap_or(config.backfill_batch_size))
                .await?;
            info!("Backfill finished. {stats}");
            Ok(())
        }
        Commands::FailedQueue { nitems } => {
            let harness = build_harness(&config, &pool, threads).await?;
            let queue = PgQueue::new(
                pool.clone(),
                SCRAPER_FAILED_QUEUE,
                config.queue_visibility_timeout_secs,
            );
            match harness.scrape_from_failed_queue(&queue, nitems).await {
                Ok(stats) => info!("Failed queue run finished. {stats}"),
                Err(HarnessError::NoItems { total }) => {
                    warn!(total, "No cases scraped from failed queue")
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        Commands::Tick => {
            let (controller, mut runner) = build_chain(&config, &pool, threads).await?;
            let decision = controller.handle(Trigger::Scheduled).await?;
            info!(?decision, "Tick handled");
            let links = runner.drain().await;
            info!(links, "Worker chain drained");
            Ok(())
        }
        Commands::Handle { event } => {
            let trigger = Trigger::parse(&event)?;
            let (controller, mut runner) = build_chain(&config, &pool, threads).await?;
            let decision = controller.handle(trigger).await?;
            info!(?decision, "Event handled");
            runner.drain().await;
            Ok(())
        }
        Commands::Run => run(&config, &pool, threads).await,
    }
}

/// Tick on the schedule and run worker links as they are invoked.
async fn run(config: &Config, pool: &PgPool, threads: usize) -> Result<()> {
    let (controller, runner) = build_chain(config, pool, threads).await?;
    let runner = tokio::spawn(runner.run(async {
        tokio::signal::ctrl_c().await.ok();
    }));

    let mut interval = tokio::time::interval(Duration::from_secs(config.schedule_interval_secs));
    info!(
        interval_secs = config.schedule_interval_secs,
        "Scraper worker running"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = controller.handle(Trigger::Scheduled).await {
                    warn!(error = %e, "Scheduled tick failed");
                }
            }
        }
    }

    runner.await?;
    Ok(())
}

async fn enqueue(
    config: &Config,
    pool: PgPool,
    case_number: String,
    detail_loc: String,
) -> Result<()> {
    PgCaseStore::new(pool.clone())
        .upsert_case(&case_number, &detail_loc)
        .await?;
    let queue = PgQueue::new(pool, SCRAPER_QUEUE, config.queue_visibility_timeout_secs);
    queue
        .enqueue(&QueuedCase {
            case_number: case_number.clone(),
            detail_loc,
        })
        .await?;
    info!(case_number = %case_number, queue = queue.name(), "Case enqueued");
    Ok(())
}

fn build_scraper(config: &Config, pool: &PgPool) -> Arc<Scraper> {
    Arc::new(Scraper::new(
        ScraperConfig::from_config(config),
        Arc::new(PgPageStore::new(pool.clone())),
        Arc::new(PgCaseStore::new(pool.clone())),
        Arc::new(PgFailureLog::new(pool.clone())),
    ))
}

async fn build_harness(
    config: &Config,
    pool: &PgPool,
    threads: usize,
) -> Result<Harness<HttpSession>> {
    let scraper = build_scraper(config, pool);
    let factory = HttpSessionFactory::from_config(config);
    let harness = Harness::create(scraper, &factory, threads).await?;
    Ok(harness.with_error_hook(Arc::new(DeletePermanentFailures)))
}

async fn build_chain(
    config: &Config,
    pool: &PgPool,
    threads: usize,
) -> Result<(
    Arc<WorkerController<HttpSession>>,
    ChainRunner<HttpSession>,
)> {
    let harness = Arc::new(build_harness(config, pool, threads).await?);
    let (invoker, rx) = ChannelInvoker::new();
    let controller = Arc::new(WorkerController::new(
        harness,
        Arc::new(PgQueue::new(
            pool.clone(),
            SCRAPER_QUEUE,
            config.queue_visibility_timeout_secs,
        )),
        Arc::new(PgLivenessTable::new(pool.clone())),
        Arc::new(invoker),
        WorkerConfig::from_config(config),
    ));
    let runner = ChainRunner::new(controller.clone(), rx);
    Ok((controller, runner))
}
