//! Budget reconciler - line-oriented JSON front end.
//!
//! Reads one command per line on stdin and writes one JSON object per line on
//! stdout: command results as `{"ok": ...}` / `{"error": ...}` and domain
//! events as `{"event": ...}`. Logs go to stderr.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use budget_reconciler::alternatives::{CatalogSearch, ProviderSearch};
use budget_reconciler::budget::{NewBudget, VendorEdit};
use budget_reconciler::events::{BroadcastEmitter, DomainEvent, InboundEvent};
use budget_reconciler::package::PackageSnapshot;
use budget_reconciler::storage::InMemoryStorage;
use budget_reconciler::{Config, Engine, ReconcileError};

const CATALOG_PROVIDER: &str = "catalog";

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    CreateBudget { budget: NewBudget },
    PackageUpdated {
        package_id: String,
        provider_id: String,
        snapshot: PackageSnapshot,
        timestamp: DateTime<Utc>,
    },
    PackageDeleted { package_id: String, provider_id: String },
    VendorEdit { budget_id: Uuid, edit: VendorEdit },
    Restore { budget_id: Uuid, version: u64 },
    CloseSession { budget_id: Uuid },
    Get { budget_id: Uuid },
    History { budget_id: Uuid },
    Diff { budget_id: Uuid, from: u64, to: u64 },
    State { budget_id: Uuid },
}

struct App {
    engine: Engine,
    catalog: Arc<CatalogSearch>,
}

impl App {
    async fn execute(&self, command: Command) -> Result<Value, ReconcileError> {
        let book = &self.engine.book;
        let value = match command {
            Command::CreateBudget { budget } => to_value(book.create(budget).await?),
            Command::PackageUpdated {
                package_id,
                provider_id,
                snapshot,
                timestamp,
            } => {
                self.catalog.upsert(snapshot.clone()).await;
                let event = InboundEvent::PackageUpdated {
                    package_id,
                    provider_id,
                    snapshot,
                    timestamp,
                };
                to_value(self.engine.scheduler.handle(event).await?)
            }
            Command::PackageDeleted {
                package_id,
                provider_id,
            } => {
                self.catalog.remove(&package_id).await;
                let event = InboundEvent::PackageDeleted {
                    package_id,
                    provider_id,
                };
                to_value(self.engine.scheduler.handle(event).await?)
            }
            Command::VendorEdit { budget_id, edit } => {
                to_value(book.vendor_edit(budget_id, edit).await?)
            }
            Command::Restore { budget_id, version } => {
                to_value(book.restore(budget_id, version).await?)
            }
            Command::CloseSession { budget_id } => to_value(book.close_session(budget_id).await?),
            Command::Get { budget_id } => to_value(book.get(budget_id).await?),
            Command::History { budget_id } => {
                to_value(self.engine.versions.history(budget_id).await?)
            }
            Command::Diff { budget_id, from, to } => {
                to_value(self.engine.versions.diff(budget_id, from, to).await?)
            }
            Command::State { budget_id } => {
                json!({ "state": format!("{:?}", self.engine.scheduler.state(budget_id)) })
            }
        };
        Ok(value)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "serialization_error": e.to_string() }))
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = rx.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "Failed to write to stdout");
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<DomainEvent>,
    out: mpsc::UnboundedSender<Value>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let _ = out.send(json!({ "event": event }));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event consumer lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    tracing::info!(?config, "Starting budget reconciler");

    let catalog = Arc::new(match &config.catalog_file {
        Some(path) => CatalogSearch::load(CATALOG_PROVIDER, path)?,
        None => CatalogSearch::new(CATALOG_PROVIDER),
    });
    let emitter = Arc::new(BroadcastEmitter::new(config.event_buffer));
    let providers: Vec<Arc<dyn ProviderSearch>> = vec![catalog.clone()];

    let engine = Engine::new(
        config.engine_settings()?,
        Arc::new(InMemoryStorage::new()),
        emitter.clone(),
        providers,
    );
    let sweep = engine.scheduler.spawn_expiry_sweep(config.expiry_sweep());

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx));
    let forwarder = tokio::spawn(forward_events(emitter.subscribe(), out_tx.clone()));

    let app = App { engine, catalog };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => match app.execute(command).await {
                Ok(value) => json!({ "ok": value }),
                Err(e) => json!({ "error": { "code": e.code(), "message": e.to_string() } }),
            },
            Err(e) => json!({ "error": { "code": "bad_command", "message": e.to_string() } }),
        };
        let _ = out_tx.send(reply);
    }

    let report = app.engine.scheduler.shutdown(config.shutdown_grace()).await;
    tracing::info!(
        completed = report.completed.len(),
        abandoned = report.abandoned.len(),
        "Scheduler stopped"
    );
    let _ = out_tx.send(json!({ "shutdown": report }));
    let _ = sweep.await;

    drop(app);
    drop(emitter);
    let _ = forwarder.await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
