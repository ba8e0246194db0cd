mod cli;
mod openai;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use newsflow_ai::LlmClient;
use newsflow_infra::ai::AnalysisService;
use newsflow_infra::ingest::StorageConsumer;
use newsflow_infra::jobs::{JobPublisher, JobWorker, PostgresJobStore};
use newsflow_infra::news_store::PostgresNewsEventStore;
use newsflow_infra::queue::RedisNewsQueue;

use crate::cli::{Cli, Command, DatabaseArgs, JobsArgs, StoreArgs};
use crate::openai::OpenAiProvider;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    newsflow_observability::init_with(cli.log_format.into());

    match cli.command {
        Command::Jobs(args) => run_jobs(args).await,
        Command::Store(args) => run_store(args).await,
    }
}

async fn connect(args: &DatabaseArgs) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("failed to connect to postgres")
}

async fn run_jobs(args: JobsArgs) -> Result<()> {
    let pool = connect(&args.database).await?;
    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    let events = Arc::new(PostgresNewsEventStore::new(pool));

    let provider = OpenAiProvider::new(args.llm.llm_api_key.clone(), args.llm.llm_model.clone())
        .with_base_url(args.llm.llm_base_url.clone());
    let client = LlmClient::new(Arc::new(provider), args.llm.client_config());
    let runner = Arc::new(AnalysisService::new(events, client));

    let config = args.worker_config();
    tracing::info!(
        worker_id = %config.worker_id,
        batch_size = config.batch_size,
        max_attempts = config.max_attempts,
        once = args.once,
        "starting job worker"
    );
    let worker = Arc::new(JobWorker::new(jobs, runner, config));

    if args.once {
        let stats = worker.run_once().await.context("job worker pass failed")?;
        tracing::info!(?stats, "job worker pass complete");
        return Ok(());
    }

    let handle = worker.spawn();
    wait_for_shutdown().await;
    let stats = handle.shutdown().await;
    tracing::info!(?stats, "job worker exited");
    Ok(())
}

async fn run_store(args: StoreArgs) -> Result<()> {
    let pool = connect(&args.database).await?;
    let events = Arc::new(PostgresNewsEventStore::new(pool.clone()));
    let queue = Arc::new(
        RedisNewsQueue::new(&args.redis_url, Some(args.queue.clone()))
            .context("invalid redis url")?,
    );

    let mut consumer = StorageConsumer::new(queue, events, args.consumer_config());
    if args.publish_jobs {
        consumer = consumer.with_publisher(JobPublisher::new(Arc::new(PostgresJobStore::new(pool))));
    }

    tracing::info!(queue = %args.queue, publish_jobs = args.publish_jobs, "starting storage consumer");
    let handle = Arc::new(consumer).spawn();
    wait_for_shutdown().await;
    let stats = handle.shutdown().await;
    tracing::info!(?stats, "storage consumer exited");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
}
