mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use served::config::ServedConfig;
use served::context::fakes;
use served::domain::{TransactionFlags, TransactionId};
use served::error::Result;
use served::{coordination, Runner, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &served::config::LoggingConfig) {
    let filter = config
        .filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServedConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("failed to load config: {e}, using defaults");
        ServedConfig::default_config()
    });

    init_logging(&config.logging);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Submit {
            transaction_type,
            name,
            channel,
        } => submit(config, transaction_type.into(), name, channel).await,
        Commands::Status { id } => status(config, id).await,
        Commands::Cleanup => cleanup(config).await,
    }
}

async fn serve(config: ServedConfig) -> Result<()> {
    let store = Arc::new(Store::load(&config.store).await?);
    let runner = Runner::new(store.clone(), fakes::collaborators(), config.runner.event_queue_capacity);

    let shutdown = coordination::shutdown_handle();
    let cleanup_handle = tokio::spawn(coordination::periodic_cleanup(store.clone(), config.runner.clone()));

    let shutdown_for_wait = shutdown.clone();
    let runner_for_wait = runner.clone();
    let store_for_wait = store.clone();
    let shutdown_task = tokio::spawn(async move {
        shutdown_for_wait.wait_and_drain(&runner_for_wait, &store_for_wait).await;
    });

    info!("served runner started");
    loop {
        if shutdown.is_requested() {
            break;
        }
        if !runner.run_once().await {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    cleanup_handle.abort();
    shutdown_task.await.ok();
    store.close().await;
    info!("served runner stopped");
    Ok(())
}

async fn submit(
    config: ServedConfig,
    transaction_type: served::domain::TransactionType,
    name: String,
    channel: String,
) -> Result<()> {
    let store = Store::load(&config.store).await?;
    let runner = Runner::new(Arc::new(store), fakes::collaborators(), config.runner.event_queue_capacity);

    let id = runner
        .create_transaction(transaction_type, TransactionFlags::NONE, name, channel, "submitted via served-cli")
        .await;

    if id == 0 {
        warn!("failed to submit transaction");
    } else {
        println!("{id}");
    }
    Ok(())
}

async fn status(config: ServedConfig, id: Option<TransactionId>) -> Result<()> {
    let store = Store::load(&config.store).await?;

    match id {
        Some(id) => match store.get_transaction(id).await {
            Some(transaction) => println!(
                "{} {} flags={} state={} wait={:?} completed={}",
                transaction.id,
                transaction.transaction_type,
                transaction.flags.0,
                transaction.current_state,
                transaction.wait,
                transaction.completed_at.is_some()
            ),
            None => println!("no such transaction: {id}"),
        },
        None => {
            for id in store.active_transactions().await {
                if let Some(transaction) = store.get_transaction(id).await {
                    println!("{} {} active", transaction.id, transaction.transaction_type);
                }
            }
        }
    }
    Ok(())
}

async fn cleanup(config: ServedConfig) -> Result<()> {
    let store = Store::load(&config.store).await?;
    let pruned = store.cleanup(config.runner.retain_count, config.runner.retain_days).await?;
    println!("pruned {pruned} transactions");
    Ok(())
}
