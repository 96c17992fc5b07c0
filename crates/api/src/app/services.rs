//! Service wiring: stores, Registry client, vault, alert sinks and engine loops.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::warn;

use regsync_infra::alerts::{AlertSink, FanoutAlertSink, HttpAlertSink, TracingAlertSink};
use regsync_infra::config::SyncConfig;
use regsync_infra::dispatcher::Dispatcher;
use regsync_infra::drift::DriftDetector;
use regsync_infra::receipts::{ReceiptPoller, ReceiptProcessor};
use regsync_infra::registry::{HttpRegistryClient, HttpRegistryConfig, RegistryClient};
use regsync_infra::store::{InMemorySyncStore, PgSyncStore, SyncStore};
use regsync_infra::vault::CredentialVault;
use regsync_infra::workers::{PeriodicWorker, WorkerHandle};
use regsync_infra::writer::OutboxWriter;
use regsync_infra::EngineContext;

/// Everything the HTTP handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub engine: EngineContext,
    pub processor: Arc<ReceiptProcessor>,
    /// Attempt cap for replayed messages.
    pub writer: OutboxWriter,
}

impl AppServices {
    pub fn new(engine: EngineContext, processor: Arc<ReceiptProcessor>, writer: OutboxWriter) -> Self {
        Self {
            engine,
            processor,
            writer,
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.engine.store
    }
}

/// The engine loops owned by the process.
pub struct Engine {
    pub dispatcher: Dispatcher,
    pub poller: Arc<ReceiptPoller>,
    pub drift: Arc<DriftDetector>,
}

/// Wire services from configuration. Without `DATABASE_URL` everything lives
/// in memory.
pub async fn build_services(config: &SyncConfig) -> anyhow::Result<(AppServices, Engine)> {
    let store: Arc<dyn SyncStore> = match &config.database_url {
        Some(url) => {
            let store = PgSyncStore::connect(url).await.context("connecting to Postgres")?;
            store.migrate().await.context("running migrations")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            InMemorySyncStore::arc()
        }
    };

    let registry: Arc<dyn RegistryClient> = Arc::new(
        HttpRegistryClient::new(
            HttpRegistryConfig::new(config.registry_base_url.clone()).with_timeout(config.call_timeout),
        )
        .context("building registry client")?,
    );

    let vault = Arc::new(config.vault().context("loading credential keys")?);

    let mut alerts = FanoutAlertSink::new().with(Arc::new(TracingAlertSink));
    if let Some(url) = &config.alert_webhook_url {
        alerts = alerts.with(Arc::new(
            HttpAlertSink::new(url.clone(), config.call_timeout).context("building alert webhook client")?,
        ));
    }

    Ok(wire(store, registry, vault, Arc::new(alerts), config))
}

/// Assemble services and engine loops around already-built collaborators.
pub fn wire(
    store: Arc<dyn SyncStore>,
    registry: Arc<dyn RegistryClient>,
    vault: Arc<CredentialVault>,
    alerts: Arc<dyn AlertSink>,
    config: &SyncConfig,
) -> (AppServices, Engine) {
    let engine = EngineContext::new(store.clone(), registry, vault, alerts.clone());
    let processor = Arc::new(ReceiptProcessor::new(store, alerts, config.receipt_poll_interval()));

    let holder = format!("regsync-{}", uuid::Uuid::now_v7());
    let loops = Engine {
        dispatcher: Dispatcher::new(engine.clone(), processor.clone(), config.dispatcher(holder)),
        poller: Arc::new(ReceiptPoller::new(engine.clone(), processor.clone(), config.poller())),
        drift: Arc::new(DriftDetector::new(engine.clone())),
    };
    let services = AppServices::new(engine, processor, OutboxWriter::new(config.max_attempts));
    (services, loops)
}

/// Start the dispatcher, receipt poller and drift detector.
pub fn spawn_workers(engine: Engine, config: &SyncConfig) -> Vec<WorkerHandle> {
    let Engine { dispatcher, poller, drift } = engine;

    let dispatch = PeriodicWorker::spawn("dispatcher", config.poll_interval, move || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run_once(Utc::now()).await }
    });
    let receipts = PeriodicWorker::spawn("receipt-poller", config.receipt_poll_interval, move || {
        let poller = poller.clone();
        async move { poller.poll_once(Utc::now()).await }
    });
    let drift = PeriodicWorker::spawn("drift-detector", config.drift_interval, move || {
        let drift = drift.clone();
        async move { drift.run_once(Utc::now()).await }
    });

    vec![dispatch, receipts, drift]
}
