//! Service wiring: builds every component from [`AppConfig`] and owns their
//! startup and shutdown order.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::AppConfig;
use crate::database::{self, DbPool};
use crate::delivery::{DeliveryService, EventSink, PublishSink, TerminalEvent, WebhookSink};
use crate::model::ModelFactory;
use crate::pipeline::{
    MemoryPipelineStore, PipelineOrchestrator, PipelineStore, RecoveryReport, SqlitePipelineStore,
};
use crate::pool::WorkerPoolManager;
use crate::transport::{Gateway, TransportServer};

/// How often the delivery ledger is pruned.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Delivered ledger entries older than this are forgotten.
const LEDGER_RETENTION_HOURS: i64 = 24;

pub struct App {
    pools: Arc<WorkerPoolManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    delivery: Arc<DeliveryService>,
    publish: PublishSink,
    db: Option<DbPool>,
    server: Mutex<Option<TransportServer>>,
    local_addr: SocketAddr,
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
}

impl App {
    /// Validate `config` and build the service. Binds the transport listener
    /// but starts nothing.
    pub async fn build(config: AppConfig, factory: Arc<dyn ModelFactory>) -> Result<Self> {
        config.validate()?;

        let (store, db): (Arc<dyn PipelineStore>, Option<DbPool>) = match &config.database.url {
            Some(url) => {
                let pool = database::init_pool(url, &config.database).await?;
                database::run_migrations(&pool).await?;
                (Arc::new(SqlitePipelineStore::new(pool.clone())), Some(pool))
            }
            None => (Arc::new(MemoryPipelineStore::new()), None),
        };

        let pools = Arc::new(WorkerPoolManager::new(
            config.pool_settings(),
            config.scaling.clone(),
            factory,
        ));

        let publish = PublishSink::new(config.orchestrator.event_capacity.max(16));
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(publish.clone())];
        if let Some(url) = &config.delivery.webhook_url {
            let webhook = WebhookSink::new(
                url.clone(),
                Duration::from_secs(config.delivery.webhook_timeout_secs),
            )?;
            info!(url = %url, "Webhook delivery enabled");
            sinks.push(Arc::new(webhook));
        }
        sinks.push(Arc::new(WebhookSink::per_job(Duration::from_secs(
            config.delivery.webhook_timeout_secs,
        ))?));
        let delivery = Arc::new(DeliveryService::new(&config.delivery, sinks));

        let orchestrator = PipelineOrchestrator::new(
            config.orchestrator.clone(),
            config.retry.clone(),
            pools.clone(),
            store,
            delivery.clone(),
        );

        let gateway = Gateway::new(
            orchestrator.clone(),
            pools.clone(),
            Duration::from_millis(config.orchestrator.sync_timeout_ms),
        );
        let server =
            TransportServer::bind(&config.transport, Arc::new(gateway), publish.sender()).await?;
        let local_addr = server.local_addr()?;

        Ok(Self {
            pools,
            orchestrator,
            delivery,
            publish,
            db,
            server: Mutex::new(Some(server)),
            local_addr,
            cancellation_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Warm up pools, recover stored jobs, then start serving.
    pub async fn start(&self) -> Result<RecoveryReport> {
        self.pools.start().await;
        let report = self.orchestrator.start().await?;

        let server = self.server.lock().take();
        if let Some(server) = server {
            let token = self.cancellation_token.child_token();
            self.tasks.spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!(error = %e, "Transport server stopped with error");
                }
            });
        }

        self.spawn_maintenance();
        info!(addr = %self.local_addr, pools = self.pools.pool_keys().len(), "voxrelay started");
        Ok(report)
    }

    fn spawn_maintenance(&self) {
        let delivery = self.delivery.clone();
        let token = self.cancellation_token.child_token();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = chrono::Utc::now() - chrono::Duration::hours(LEDGER_RETENTION_HOURS);
                        let pruned = delivery.prune_ledger(cutoff);
                        if pruned > 0 {
                            debug!(pruned, "Pruned delivery ledger");
                        }
                    }
                }
            }
        });
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn pools(&self) -> &Arc<WorkerPoolManager> {
        &self.pools
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    /// Terminal events as published to transport subscribers.
    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalEvent> {
        self.publish.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop the transport, stop advancing jobs, drain the pools, then close
    /// the database. Jobs still in flight resume from the store on restart.
    pub async fn shutdown(&self) {
        info!("Shutting down voxrelay");
        self.cancellation_token.cancel();

        self.orchestrator.shutdown().await;
        self.pools.shutdown().await;

        self.tasks.close();
        self.tasks.wait().await;

        if let Some(db) = &self.db {
            db.close().await;
        }
        info!("voxrelay stopped");
    }
}
