//! Command line simulations of Stratus primitives.
//!
//! Each subcommand runs several independent participants against one
//! in-memory store and reports whether the coordination guarantees held.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use stratus_common::{StratusConfig, StratusError, logging::init_logging};
use stratus_coordination::{Coordinator, DictionaryKind, LockContext, OnError, WaitTime};
use stratus_store::{MemoryStore, MemoryStoreOptions, StoreAdapter};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "stratus", version, about)]
struct Cli {
    /// Configuration file layered under STRATUS__* environment variables
    #[arg(short = 'c', long = "config", env = "STRATUS_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
    /// Latency added to every store call
    #[arg(long = "latency-ms", default_value_t = 0)]
    latency_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Workers from separate applications contend for one lock
    Lock {
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 5)]
        rounds: usize,
        #[arg(long, default_value = "simulation/lock")]
        resource: String,
        /// How long each acquisition holds the lock
        #[arg(long = "hold-ms", default_value_t = 20)]
        hold_ms: u64,
    },
    /// Consumers drain a queue, some failing and leaving messages for redelivery
    Queue {
        #[arg(long, default_value_t = 50)]
        messages: usize,
        #[arg(long, default_value_t = 4)]
        consumers: usize,
        /// Every n-th processed message fails
        #[arg(long = "fail-every", default_value_t = 7)]
        fail_every: u32,
    },
    /// Writers fill one dictionary concurrently
    Dictionary {
        #[arg(long, value_enum, default_value_t = Kind::Indexed)]
        kind: Kind,
        #[arg(long, default_value_t = 4)]
        writers: usize,
        #[arg(long = "keys", default_value_t = 10)]
        keys_per_writer: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Indexed,
    NonIndexed,
}

impl From<Kind> for DictionaryKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Indexed => DictionaryKind::Indexed,
            Kind::NonIndexed => DictionaryKind::NonIndexed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, true).context("failed to initialize logging")?;

    let config = StratusConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::with_options(
        MemoryStoreOptions::default().latency(Duration::from_millis(cli.latency_ms)),
    ));

    match cli.command {
        Command::Lock {
            workers,
            rounds,
            resource,
            hold_ms,
        } => simulate_lock(store, config, workers, rounds, resource, hold_ms).await,
        Command::Queue {
            messages,
            consumers,
            fail_every,
        } => simulate_queue(store, config, messages, consumers, fail_every).await,
        Command::Dictionary {
            kind,
            writers,
            keys_per_writer,
        } => simulate_dictionary(store, config, kind.into(), writers, keys_per_writer).await,
    }
}

async fn simulate_lock(
    store: Arc<dyn StoreAdapter>,
    config: StratusConfig,
    workers: usize,
    rounds: usize,
    resource: String,
    hold_ms: u64,
) -> anyhow::Result<()> {
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let timeout = Duration::from_millis(hold_ms * (workers as u64 + 1) * 10);

    let mut tasks = Vec::with_capacity(workers);
    for worker in 0..workers {
        let coordinator = Coordinator::new(store.clone(), config.clone())?;
        let resource = resource.clone();
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        tasks.push(tokio::spawn(async move {
            let locks = coordinator.lock_manager();
            for round in 0..rounds {
                let handle = locks
                    .acquire(&resource, LockContext::Application, timeout)
                    .await?;
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                debug!(worker, round, "Holding lock");
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locks.release(&handle).await?;
            }
            Ok::<_, StratusError>(locks.stats())
        }));
    }

    let mut contentions = 0;
    for task in futures::future::join_all(tasks).await {
        let stats = task??;
        contentions += stats.contentions;
    }

    let overlaps = overlaps.load(Ordering::SeqCst);
    info!(workers, rounds, contentions, overlaps, "Lock simulation finished");
    println!(
        "lock: {} acquisitions, {} contended attempts, {} overlaps",
        workers * rounds,
        contentions,
        overlaps
    );
    if overlaps > 0 {
        bail!("mutual exclusion violated {} times", overlaps);
    }
    Ok(())
}

async fn simulate_queue(
    store: Arc<dyn StoreAdapter>,
    config: StratusConfig,
    messages: usize,
    consumers: usize,
    fail_every: u32,
) -> anyhow::Result<()> {
    let coordinator = Coordinator::new(store, config)?;
    let queue = coordinator.queue("simulation-jobs");
    queue.create().await?;
    queue
        .push_many((0..messages).map(|i| format!("job-{}", i)))
        .await?;

    let processed = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let redeliveries = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::with_capacity(consumers);
    for consumer in 0..consumers {
        let queue = queue.clone();
        let processed = processed.clone();
        let completed = completed.clone();
        let redeliveries = redeliveries.clone();
        tasks.push(tokio::spawn(async move {
            while completed.load(Ordering::SeqCst) < messages {
                let Some(message) = queue
                    .pop_one(WaitTime::Up(Duration::from_millis(200)))
                    .await?
                else {
                    continue;
                };
                if message.delivery_count() > 1 {
                    redeliveries.fetch_add(1, Ordering::SeqCst);
                }

                let attempt = processed.fetch_add(1, Ordering::SeqCst) + 1;
                let outcome = queue
                    .consume(message, OnError::Redeliver, |message| async move {
                        if fail_every > 0 && attempt % fail_every == 0 {
                            return Err(StratusError::Internal(format!(
                                "simulated failure on {}",
                                message.id()
                            )));
                        }
                        Ok(())
                    })
                    .await;
                match outcome {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => warn!(consumer, error = %e, "Processing failed, message left for redelivery"),
                }
            }
            Ok::<_, StratusError>(())
        }));
    }
    for task in futures::future::join_all(tasks).await {
        task??;
    }

    let completed = completed.load(Ordering::SeqCst);
    let redeliveries = redeliveries.load(Ordering::SeqCst);
    let remaining = queue.len().await?;
    info!(completed, redeliveries, remaining, "Queue simulation finished");
    println!(
        "queue: {} completed, {} redeliveries, {} left in queue",
        completed, redeliveries, remaining
    );
    queue.destroy().await?;
    if remaining > 0 {
        bail!("{} messages were never completed", remaining);
    }
    Ok(())
}

async fn simulate_dictionary(
    store: Arc<dyn StoreAdapter>,
    config: StratusConfig,
    kind: DictionaryKind,
    writers: usize,
    keys_per_writer: usize,
) -> anyhow::Result<()> {
    let mut tasks = Vec::with_capacity(writers);
    for writer in 0..writers {
        let coordinator = Coordinator::new(store.clone(), config.clone())?;
        let dictionary = coordinator.dictionary("simulation", kind)?;
        tasks.push(tokio::spawn(async move {
            for key in 0..keys_per_writer {
                dictionary
                    .set(&format!("w{}-k{}", writer, key), format!("value-{}", key))
                    .await?;
            }
            Ok::<_, StratusError>(())
        }));
    }
    for task in futures::future::join_all(tasks).await {
        task??;
    }

    let reader = Coordinator::new(store, config)?.dictionary("simulation", kind)?;
    let found = reader.len().await?;
    let expected = writers * keys_per_writer;
    info!(%kind, expected, found, "Dictionary simulation finished");
    println!("dictionary ({}): {} of {} keys present", kind, found, expected);
    if found != expected {
        bail!("{} keys lost", expected.saturating_sub(found));
    }
    Ok(())
}
