use clap::Parser;
use corebank::application::consumer::{ConsumerConfig, EventConsumer, LoggingHandler};
use corebank::application::engine::{EngineConfig, TransactionEngine};
use corebank::application::relay::{OutboxRelay, RelayConfig};
use corebank::domain::account::{Account, AccountId, Balance};
use corebank::domain::event::{TRANSACTION_EVENT_SCHEMA, TRANSACTION_EVENTS_SUBJECT};
use corebank::domain::ports::{LedgerStore, LedgerStoreRef, MessageBus, MessageBusRef};
use corebank::infrastructure::in_memory::{
    InMemoryBus, InMemoryDeadLetterSink, InMemoryLedgerStore, TracingAuditSink,
};
use corebank::interfaces::request::RequestReader;
use corebank::schema::{InMemorySchemaRegistry, SchemaCodec};
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input transaction requests, one JSON object per line
    input: PathBuf,

    /// Seed account as id:customer:currency:balance (repeatable)
    #[arg(long = "seed-account", value_name = "SPEC")]
    seed_accounts: Vec<String>,

    /// Topic carrying transaction events
    #[arg(long, default_value = "transaction-events")]
    topic: String,

    /// How long to wait for the outbox to drain before exiting
    #[arg(long, default_value_t = 10)]
    drain_timeout_secs: u64,

    /// Path to a persistent database. If provided, uses RocksDB.
    #[cfg(feature = "storage-rocksdb")]
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Kafka bootstrap servers. If provided, publishes through Kafka.
    #[cfg(feature = "bus-kafka")]
    #[arg(long)]
    brokers: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let store = build_store(&cli)?;
    let bus = build_bus(&cli)?;

    for spec in &cli.seed_accounts {
        let account = parse_seed_account(spec).map_err(miette::Report::msg)?;
        store.create_account(account).await.into_diagnostic()?;
    }

    let registry = Arc::new(InMemorySchemaRegistry::new());
    let codec = Arc::new(
        SchemaCodec::for_subject(registry, TRANSACTION_EVENTS_SUBJECT, TRANSACTION_EVENT_SCHEMA)
            .into_diagnostic()?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = OutboxRelay::new(
        store.clone(),
        bus.clone(),
        RelayConfig {
            topic: cli.topic.clone(),
            ..RelayConfig::default()
        },
    );
    let relay_handle = relay.handle();
    let relay_task = tokio::spawn(relay.run(shutdown_rx.clone()));

    let consumer = EventConsumer::new(
        codec.clone(),
        Arc::new(LoggingHandler),
        Arc::new(InMemoryDeadLetterSink::new()),
        ConsumerConfig::default(),
    );
    let subscription = bus.subscribe(&cli.topic).await.into_diagnostic()?;
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_task =
        tokio::spawn(async move { consumer.run(subscription, consumer_shutdown).await });

    let engine = TransactionEngine::new(
        store.clone(),
        codec,
        Arc::new(TracingAuditSink),
        relay_handle,
        EngineConfig::default(),
    );

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = RequestReader::new(BufReader::new(file));
    for request in reader.requests() {
        match request {
            Ok(request) => {
                if let Err(e) = engine.submit(request).await {
                    eprintln!("Rejected request: {e}");
                }
            }
            Err(e) => {
                eprintln!("Error reading request: {e}");
            }
        }
    }

    drain_outbox(&store, Duration::from_secs(cli.drain_timeout_secs)).await?;

    shutdown_tx.send(true).ok();
    let _ = relay_task.await;
    let _ = consumer_task.await;

    let accounts = store.accounts().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for account in accounts {
        serde_json::to_writer(&mut out, &account).into_diagnostic()?;
        writeln!(out).into_diagnostic()?;
    }

    Ok(())
}

fn build_store(_cli: &Cli) -> Result<LedgerStoreRef> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = &_cli.db_path {
        let store =
            corebank::infrastructure::rocksdb::RocksDbLedgerStore::open(path).into_diagnostic()?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(InMemoryLedgerStore::new()))
}

fn build_bus(_cli: &Cli) -> Result<MessageBusRef> {
    #[cfg(feature = "bus-kafka")]
    if let Some(brokers) = &_cli.brokers {
        let bus =
            corebank::infrastructure::kafka::KafkaBus::new(brokers, "corebank").into_diagnostic()?;
        return Ok(Arc::new(bus));
    }
    Ok(Arc::new(InMemoryBus::new()))
}

/// Parses `id:customer:currency:balance`, e.g. `ACC-1:CUST-1:USD:100.00`.
fn parse_seed_account(spec: &str) -> std::result::Result<Account, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [id, customer, currency, balance] = parts[..] else {
        return Err(format!(
            "invalid seed account '{spec}', expected id:customer:currency:balance"
        ));
    };
    let balance =
        Decimal::from_str(balance).map_err(|e| format!("invalid balance in '{spec}': {e}"))?;
    Ok(Account::new(
        AccountId::new(id),
        customer,
        currency,
        Balance::new(balance),
    ))
}

/// Waits until no PENDING outbox entries remain, bounded by `timeout`.
/// FAILED entries do not hold up exit; they are already surfaced in the log.
async fn drain_outbox(store: &LedgerStoreRef, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pending = store.pending_outbox().await.into_diagnostic()?;
        if pending.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!("{} outbox entries still pending at exit", pending.len());
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
