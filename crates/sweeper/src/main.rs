use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use redeliver_infra::config::RetryConfig;
use redeliver_infra::event_bus::RedisStreamsPublisher;
use redeliver_infra::failed_events::{
    PostgresFailedEventStore, PublishingRedeliverer, RetryOrchestrator, SweepScheduler,
};
use redeliver_sweeper::{Cli, Command, RedisArgs, execute};

type Orchestrator = RetryOrchestrator<Arc<PostgresFailedEventStore>>;
type Scheduler = SweepScheduler<Arc<PostgresFailedEventStore>, PublishingRedeliverer<RedisStreamsPublisher>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    redeliver_observability::init();

    let cli = Cli::parse();
    let config = RetryConfig::from_env().context("invalid FAILED_EVENTS_* configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect_lazy(&cli.database_url)
        .context("invalid DATABASE_URL")?;
    let store = Arc::new(PostgresFailedEventStore::new(pool));

    match cli.command {
        Command::Migrate => {
            store.ensure_schema().await.context("failed to apply failed_events schema")?;
            info!("failed_events schema ready");
        }
        Command::Run(redis) => {
            let scheduler = scheduler(config.orchestrator(store)?, &config, &redis)?;
            run(scheduler, config.auto_retry).await?;
        }
        Command::Sweep(redis) => {
            let scheduler = scheduler(config.orchestrator(store)?, &config, &redis)?;
            let report = scheduler.process_retries().await?;
            print_json(&serde_json::to_value(report)?)?;
        }
        Command::Admin(command) => {
            let orchestrator = config.orchestrator(store)?;
            print_json(&execute(&orchestrator, &command).await?)?;
        }
    }

    Ok(())
}

fn scheduler(orchestrator: Orchestrator, config: &RetryConfig, redis: &RedisArgs) -> anyhow::Result<Arc<Scheduler>> {
    let mut publisher = RedisStreamsPublisher::new(&redis.redis_url, Some(redis.stream_prefix.clone()))
        .context("invalid REDIS_URL")?;
    if let Some(max_len) = redis.stream_max_len {
        publisher = publisher.with_max_len(max_len);
    }

    Ok(Arc::new(SweepScheduler::new(
        Arc::new(orchestrator),
        PublishingRedeliverer::new(publisher),
        config.sweep_config(),
    )))
}

async fn run(scheduler: Arc<Scheduler>, auto_retry: bool) -> anyhow::Result<()> {
    if !auto_retry {
        warn!("FAILED_EVENTS_AUTO_RETRY is off; nothing to run");
        return Ok(());
    }

    scheduler.start_auto_retry();
    info!(
        interval_ms = scheduler.config().interval.as_millis() as u64,
        "failed-event sweeper started"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    scheduler.shutdown().await;
    while scheduler.is_processing() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("failed-event sweeper stopped");
    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
