// Crawl worker service: consumes queued crawl jobs and runs the scheduler.
//
// The HTTP API, auth and UI live in a separate service; this binary owns
// everything from the queue down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::watch;

use sitevault::{
    config::CrawlTuning,
    db::Database,
    jobs::JobProcessor,
    queue::{self, EventPublisher, JobQueue},
    scheduler::Scheduler,
    storage::StorageConfig,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let tuning = CrawlTuning::from_env();

    let db_path = PathBuf::from(env_or("DATABASE_PATH", "./data/sitevault.db"));
    let redis_url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
    let storage_path = PathBuf::from(env_or("STORAGE_PATH", "./data/storage"));
    let worker_count: usize = env_or("CRAWL_WORKER_COUNT", "2").parse().unwrap_or(2);

    info!("Starting sitevault workers (db={}, storage={})", db_path.display(), storage_path.display());

    let db = Database::open(&db_path).await?;
    let redis = queue::connect(&redis_url).await?;
    let job_queue = JobQueue::new(redis.clone());
    let events = EventPublisher::new(redis.clone());
    // Per-site backends (local subtree or object store URL) resolve from
    // these roots at job time.
    let storage = StorageConfig::new(storage_path, tuning.local_temp_path.clone());

    let processor = Arc::new(JobProcessor::new(
        db.clone(),
        job_queue.clone(),
        events,
        storage,
        tuning,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for worker_id in 0..worker_count {
        let processor = Arc::clone(&processor);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            processor.run_worker(worker_id, shutdown).await;
        }));
    }

    let scheduler = Scheduler::new(db, job_queue, redis);
    let scheduler_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    info!("All workers stopped");
    Ok(())
}
