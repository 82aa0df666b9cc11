//! Process lifecycle for the control plane.
//!
//! `ControlPlane::start` wires the components in dependency order (broker,
//! credentials, registry, gateway, stores, tiering, response, rules) and
//! spawns the consumers and periodic tasks. `shutdown` stops them in
//! reverse order, each within a bounded deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use crate::broker::{
    BrokerAdapter, BrokerTransport, Delivery, DeliveryHandler, EventPublisher, SubscriptionHandle,
};
use crate::clock::{Clock, SystemClock};
use crate::compliance::{AuditLog, Anonymizer, GdprService, SqliteAuditStore};
use crate::config::{decode_key, ControlPlaneConfig, StorageConfig};
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::events::{EventFamily, DETECTION_QUEUE};
use crate::ingest::IngestGateway;
use crate::logging::structured::LogContext;
use crate::registry::{AgentRegistry, HeartbeatSupervisor};
use crate::resilience::CancelToken;
use crate::response::{Effectors, ResponseExecutor};
use crate::rules::RuleEngine;
use crate::scheduler::PeriodicTask;
use crate::storage::{
    ArchiveStore, FsArchive, HotStore, InMemoryArchive, InMemoryHotStore, SqliteColdStore,
};
use crate::tiering::TieringPipeline;
use crate::{log_debug, log_info, log_warn};

pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Appends every delivered event to the hot tier.
pub struct HotStoreWriter {
    hot: Arc<dyn HotStore>,
}

impl HotStoreWriter {
    pub fn new(hot: Arc<dyn HotStore>) -> Self {
        Self { hot }
    }
}

#[async_trait]
impl DeliveryHandler for HotStoreWriter {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let event = delivery.decode_event()?;
        let entry = self.hot.append(&event)?;
        log_debug!(
            LogContext::for_agent(&event.agent_id).with_event(&event.id),
            "HOT_APPENDED",
            key = entry.key
        );
        Ok(())
    }
}

/// Feeds threat deliveries to the rule engine.
pub struct DetectionConsumer {
    engine: Arc<RuleEngine>,
    cancel: CancelToken,
}

impl DetectionConsumer {
    pub fn new(engine: Arc<RuleEngine>, cancel: CancelToken) -> Self {
        Self { engine, cancel }
    }
}

#[async_trait]
impl DeliveryHandler for DetectionConsumer {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let event = delivery.decode_event()?;
        // Action failures are recorded in the response log, not redelivered.
        self.engine.process(&event, &self.cancel).await;
        Ok(())
    }
}

/// What the deployment supplies from outside the core.
pub struct Collaborators {
    pub transport: Arc<dyn BrokerTransport>,
    pub effectors: Effectors,
    pub clock: Arc<dyn Clock>,
    /// Overrides the hot store chosen from configuration.
    pub hot: Option<Arc<dyn HotStore>>,
    /// Overrides the archive chosen from configuration.
    pub archive: Option<Arc<dyn ArchiveStore>>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn BrokerTransport>, effectors: Effectors) -> Self {
        Self {
            transport,
            effectors,
            clock: Arc::new(SystemClock),
            hot: None,
            archive: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hot_store(mut self, hot: Arc<dyn HotStore>) -> Self {
        self.hot = Some(hot);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = Some(archive);
        self
    }
}

fn hot_store(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn HotStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let store = crate::storage::RedisHotStore::with_limits(url, config.hot_max_len, config.hot_ttl_secs)?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(InMemoryHotStore::new(
        config.hot_max_len,
        config.hot_ttl_secs,
        clock,
    )))
}

fn archive_store(config: &StorageConfig) -> Result<Arc<dyn ArchiveStore>> {
    let archive: Arc<dyn ArchiveStore> = match &config.archive_dir {
        Some(dir) => Arc::new(FsArchive::new(dir)?),
        None => Arc::new(InMemoryArchive::new()),
    };
    Ok(archive)
}

pub struct ControlPlane {
    pub broker: BrokerAdapter,
    pub credentials: Arc<CredentialStore>,
    pub registry: Arc<AgentRegistry>,
    pub gateway: Arc<IngestGateway>,
    pub hot: Arc<dyn HotStore>,
    pub cold: Arc<SqliteColdStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub tiering: Arc<TieringPipeline>,
    pub executor: Arc<ResponseExecutor>,
    pub rules: Arc<RuleEngine>,
    pub gdpr: Arc<GdprService>,
    supervisor: PeriodicTask,
    tiering_tasks: Vec<PeriodicTask>,
    storage_consumers: Vec<SubscriptionHandle>,
    detection_consumer: SubscriptionHandle,
    cancel: CancelToken,
    stopped: AtomicBool,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl ControlPlane {
    pub async fn start(config: ControlPlaneConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ctx = LogContext::for_task("control_plane");
        let clock = collaborators.clock.clone();
        let cancel = CancelToken::new();

        let broker = BrokerAdapter::new(collaborators.transport.clone(), config.broker.clone());
        broker.connect().await?;
        let publisher: Arc<dyn EventPublisher> = Arc::new(broker.clone());

        let credentials = Arc::new(CredentialStore::new(config.credentials.clone(), clock.clone())?);
        let registry = Arc::new(AgentRegistry::new(
            config.registry.clone(),
            credentials.clone(),
            clock.clone(),
        ));

        let anonymizer = match &config.compliance.encryption_key_hex {
            Some(key) => Anonymizer::from_hex_key(key, &config.compliance.salt)?,
            None => Anonymizer::ephemeral(&config.compliance.salt),
        };
        let gateway = Arc::new(IngestGateway::new(
            registry.clone(),
            publisher.clone(),
            Arc::new(anonymizer),
            config.ingest.clone(),
            clock.clone(),
        ));

        let hot = match collaborators.hot {
            Some(hot) => hot,
            None => hot_store(&config.storage, clock.clone())?,
        };
        let cold = Arc::new(if config.storage.cold_path == ":memory:" {
            SqliteColdStore::open_in_memory()?
        } else {
            SqliteColdStore::open(&config.storage.cold_path)?
        });
        let archive = match collaborators.archive {
            Some(archive) => archive,
            None => archive_store(&config.storage)?,
        };

        let tiering = Arc::new(TieringPipeline::new(
            hot.clone(),
            cold.clone(),
            archive.clone(),
            publisher.clone(),
            config.tiering.clone(),
            config.storage.insert_batch_size,
            clock.clone(),
        ));

        let executor = Arc::new(ResponseExecutor::new(
            collaborators.effectors,
            config.response.clone(),
            clock.clone(),
        ));
        let rules = Arc::new(RuleEngine::with_default_rules(
            executor.clone(),
            config.response.response_log_capacity,
        )?);

        let audit = match &config.compliance.audit_signing_key_hex {
            Some(key) => AuditLog::new(
                Arc::new(SqliteAuditStore::new(cold.clone())),
                SigningKey::from_bytes(&decode_key("audit_signing_key_hex", key)?),
                clock.clone(),
            )?,
            None => AuditLog::ephemeral(Arc::new(SqliteAuditStore::new(cold.clone())), clock.clone())?,
        };
        let gdpr = Arc::new(GdprService::new(
            cold.clone(),
            Arc::new(audit),
            config.compliance.clone(),
            clock.clone(),
        ));

        let supervisor = Arc::new(HeartbeatSupervisor::new(
            registry.clone(),
            publisher.clone(),
            clock.clone(),
        ))
        .spawn(cancel.child());

        let mut storage_consumers = Vec::new();
        let writer: Arc<dyn DeliveryHandler> = Arc::new(HotStoreWriter::new(hot.clone()));
        for family in EventFamily::ALL {
            storage_consumers.push(broker.subscribe(family.queue(), writer.clone()).await?);
        }
        let tiering_tasks = tiering.spawn_all(&cancel);
        let detection_consumer = broker
            .subscribe(
                DETECTION_QUEUE,
                Arc::new(DetectionConsumer::new(rules.clone(), cancel.child())),
            )
            .await?;

        log_info!(
            ctx,
            "CONTROL_PLANE_STARTED",
            consumers = storage_consumers.len() + 1,
            tasks = tiering_tasks.len() + 1,
            dry_run = executor.is_dry_run()
        );

        Ok(Self {
            broker,
            credentials,
            registry,
            gateway,
            hot,
            cold,
            archive,
            tiering,
            executor,
            rules,
            gdpr,
            supervisor,
            tiering_tasks,
            storage_consumers,
            detection_consumer,
            cancel,
            stopped: AtomicBool::new(false),
            shutdown_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn supervisor(&self) -> &PeriodicTask {
        &self.supervisor
    }

    pub fn tiering_tasks(&self) -> &[PeriodicTask] {
        &self.tiering_tasks
    }

    /// Stop everything in reverse start order. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let ctx = LogContext::for_task("control_plane");
        log_info!(ctx, "CONTROL_PLANE_STOPPING");

        self.broker.unsubscribe(&self.detection_consumer).await;
        for task in &self.tiering_tasks {
            if let Err(err) = task.stop(SHUTDOWN_DEADLINE).await {
                log_warn!(ctx, "TASK_STOP_FAILED", task = task.name(), error = err.to_string());
            }
        }
        for handle in &self.storage_consumers {
            self.broker.unsubscribe(handle).await;
        }
        if let Err(err) = self.supervisor.stop(SHUTDOWN_DEADLINE).await {
            log_warn!(
                ctx,
                "TASK_STOP_FAILED",
                task = self.supervisor.name(),
                error = err.to_string()
            );
        }
        self.cancel.cancel();
        self.broker.close().await;

        self.stopped.store(true, Ordering::SeqCst);
        log_info!(ctx, "CONTROL_PLANE_STOPPED");
    }
}
