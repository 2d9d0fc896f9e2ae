// Composition root and lifecycle.
//
// `TitanRuntime::start` wires storage, cache, bus, fanout, federation,
// jobs and the MQTT bridge from `Settings`. There is no hidden global
// state; every long-lived component is an explicit instance owned here.
// `shutdown` cancels the background loops and lets in-flight work drain.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::RedisCache;
use crate::config::{EventBusKind, Settings};
use crate::discovery::AssetLinkStore;
use crate::error::{Result, TitanError};
use crate::events::{EventBus, MemoryEventBus, RedisStreamEventBus};
use crate::fanout::SubscriptionManager;
use crate::federation::{
    ConflictManager, FederationSync, FederationSyncConfig, PeerRegistry, PeerStore,
    RepositorySyncStore, SyncSummary,
};
use crate::jobs::JobQueue;
use crate::mqtt::{
    ElementValueHandler, HandlerRegistry, MqttConfig, MqttConnectionManager, MqttEventHandler,
    MqttPublisher, MqttReconnectConfig, MqttSubscriber,
};
use crate::packages::PackageStore;
use crate::poller::{FieldClient, FieldMapping, FieldPoller, FieldWriteHandler};
use crate::repository::{
    initialize_schema, AasRepository, ConceptDescriptionRepository, SubmodelRepository,
};
use crate::services::{DocumentService, ElementWriteService, ServiceContext};

pub struct TitanRuntime {
    pub settings: Settings,
    pub pool: PgPool,
    pub cache: Option<Arc<RedisCache>>,
    pub bus: Arc<dyn EventBus>,
    pub fanout: Arc<SubscriptionManager>,
    pub documents: DocumentService,
    pub elements: ElementWriteService,
    pub packages: PackageStore,
    pub asset_links: AssetLinkStore,
    pub jobs: Option<JobQueue>,
    pub federation: Arc<FederationSync>,
    pub peers: PeerStore,
    pub mqtt: Option<Arc<MqttConnectionManager>>,
    mqtt_subscriber: Option<MqttSubscriber>,
    poller: Mutex<Option<FieldPoller>>,
    shutdown: watch::Sender<bool>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl TitanRuntime {
    pub async fn start(settings: Settings) -> Result<Arc<Self>> {
        // Storage
        let pool = PgPoolOptions::new()
            .max_connections(settings.storage.connection_pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&settings.storage.database_url)
            .await
            .map_err(|e| TitanError::Unavailable(format!("database connect failed: {e}")))?;
        initialize_schema(&pool).await?;

        let shells = AasRepository::new(pool.clone());
        let submodels = SubmodelRepository::new(pool.clone());
        let concept_descriptions = ConceptDescriptionRepository::new(pool.clone());

        // Redis: cache, job queue, and optionally the distributed bus.
        let redis = match redis::Client::open(settings.cache.redis_url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!("redis unavailable, running without cache and job queue: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("bad redis url, running without cache and job queue: {e}");
                None
            }
        };

        let cache = redis
            .clone()
            .map(|redis| Arc::new(RedisCache::new(redis, settings.cache.cache_ttl_seconds)));
        let jobs = redis.clone().map(|redis| {
            JobQueue::new(redis)
                .with_ttls(settings.jobs.job_ttl_seconds, settings.jobs.result_ttl_seconds)
                .with_max_retries(settings.jobs.max_retries)
        });

        let bus: Arc<dyn EventBus> = match settings.events.event_bus {
            EventBusKind::Memory => Arc::new(MemoryEventBus::new()),
            EventBusKind::RedisStreams => {
                let Some(redis) = redis.clone() else {
                    return Err(TitanError::Unavailable(
                        "redisStreams event bus requires a reachable redis".to_string(),
                    ));
                };
                Arc::new(RedisStreamEventBus::with_names(
                    redis,
                    crate::events::redis_streams::STREAM_NAME,
                    &settings.events.consumer_group,
                    settings.events.consumer_id.clone(),
                ))
            }
        };

        // Federation: runtime registry seeded from the durable peer table.
        let registry = Arc::new(PeerRegistry::new());
        let peers = PeerStore::new(pool.clone());
        match peers.load_all().await {
            Ok(persisted) => {
                for peer in persisted {
                    registry.register(peer);
                }
            }
            Err(e) => warn!("could not load persisted peers: {e}"),
        }
        let conflict_manager = Arc::new(ConflictManager::new());
        let sync_store = Arc::new(RepositorySyncStore {
            shells: shells.clone(),
            submodels: submodels.clone(),
            concept_descriptions: concept_descriptions.clone(),
        });
        let federation = Arc::new(FederationSync::new(
            registry,
            conflict_manager,
            sync_store,
            FederationSyncConfig {
                mode: settings.federation.mode,
                topology: settings.federation.topology,
                hub_peer_id: settings.federation.hub_peer_id.clone(),
                delta_sync_enabled: settings.federation.delta_sync_enabled,
            },
        ));

        let ctx = ServiceContext {
            shells,
            submodels,
            concept_descriptions,
            cache: cache.clone(),
            bus: Arc::clone(&bus),
            change_tracker: Some(federation.clone()),
        };
        let documents = DocumentService::new(ctx.clone());
        let elements = ElementWriteService::new(ctx);

        // WebSocket fanout listens on the bus.
        let fanout = Arc::new(SubscriptionManager::new());
        bus.subscribe(Arc::clone(&fanout) as Arc<dyn crate::events::EventHandler>)
            .await;

        // MQTT bridge (publisher, and optionally the subscriber side).
        let mut mqtt = None;
        let mut mqtt_subscriber = None;
        if let Some(broker) = &settings.mqtt.broker {
            let client_id = format!(
                "{}-{}",
                settings.mqtt.client_id_prefix,
                uuid::Uuid::new_v4().simple()
            );
            let mut config = MqttConfig::new(broker, client_id);
            config.port = settings.mqtt.port;
            config.use_tls = settings.mqtt.use_tls;
            config.username = settings.mqtt.username.clone();
            config.password = settings.mqtt.password.clone();
            config.default_qos = settings.mqtt.default_qos;
            config.retain_events = settings.mqtt.retain_events;
            config.subscribe_enabled = settings.mqtt.subscribe_enabled;
            config.subscribe_topics = settings.mqtt.subscribe_topics.clone();
            config.reconnect = MqttReconnectConfig {
                initial: Duration::from_millis(settings.mqtt.reconnect_initial_ms),
                max: Duration::from_millis(settings.mqtt.reconnect_max_ms),
                multiplier: settings.mqtt.reconnect_multiplier,
                max_attempts: settings.mqtt.reconnect_max_attempts,
            };

            let manager = MqttConnectionManager::start(config.clone());
            let publisher = Arc::new(MqttPublisher::new(Arc::clone(&manager)));
            bus.subscribe(Arc::new(MqttEventHandler::new(publisher))).await;

            if config.subscribe_enabled {
                let mut handlers = HandlerRegistry::new();
                handlers.register(
                    ElementValueHandler::PATTERN,
                    Arc::new(ElementValueHandler::new(elements.clone())),
                );
                let subscriber = MqttSubscriber::new(Arc::clone(&manager), handlers);
                let topics = if config.subscribe_topics.is_empty() {
                    vec![ElementValueHandler::PATTERN.to_string()]
                } else {
                    config.subscribe_topics.clone()
                };
                subscriber.start(&topics).await?;
                mqtt_subscriber = Some(subscriber);
            }
            mqtt = Some(manager);
        }

        bus.start().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(Self {
            packages: PackageStore::new(pool.clone()),
            asset_links: AssetLinkStore::new(pool.clone()),
            settings,
            pool,
            cache,
            bus,
            fanout,
            documents,
            elements,
            jobs,
            federation,
            peers,
            mqtt,
            mqtt_subscriber,
            poller: Mutex::new(None),
            shutdown,
            sync_task: Mutex::new(None),
        });

        runtime.spawn_sync_loop(shutdown_rx).await;
        info!("titan runtime started");
        Ok(runtime)
    }

    /// Periodic federation pass: probe peers, sync, then persist the
    /// outcome. The sleep is cancellation-aware so shutdown never waits
    /// out a full interval.
    async fn spawn_sync_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let federation = Arc::clone(&self.federation);
        let pool = self.pool.clone();
        let interval = Duration::from_secs(self.settings.federation.sync_interval_seconds.max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                federation.registry().check_all_health().await;
                let started = std::time::Instant::now();
                let summary = federation.sync_once().await;
                if summary.status == "failed" {
                    error!(errors = ?summary.errors, "federation sync pass failed");
                }
                if summary.status != "skipped" {
                    record_sync_pass(&pool, &summary, started.elapsed()).await;
                    persist_conflicts(&pool, &federation).await;
                }
            }
            info!("federation sync loop stopped");
        });
        *self.sync_task.lock().await = Some(task);
    }

    /// Attach a field-protocol client: spawns the polling tasks and, for
    /// writable mappings, bridges element updates back to the field.
    pub async fn start_poller(
        &self,
        client: Arc<dyn FieldClient>,
        mappings: Vec<FieldMapping>,
    ) {
        let write_handler = FieldWriteHandler::new(
            Arc::clone(&client),
            self.elements.clone(),
            mappings.clone(),
        );
        if write_handler.mapping_count() > 0 {
            self.bus.subscribe(Arc::new(write_handler)).await;
        }

        let poller = FieldPoller::new(self.elements.clone(), client);
        poller.start(mappings).await;
        *self.poller.lock().await = Some(poller);
    }

    /// Register a peer in the runtime registry and the durable table.
    pub async fn register_peer(&self, peer: crate::federation::Peer) -> Result<()> {
        self.peers.save(&peer).await?;
        self.federation.registry().register(peer);
        Ok(())
    }

    /// Graceful shutdown: stop loops, close connections, release the pool.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.sync_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }
        if let Some(subscriber) = &self.mqtt_subscriber {
            subscriber.stop().await;
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.disconnect().await;
        }
        self.bus.stop().await;
        self.pool.close().await;
        info!("titan runtime stopped");
    }
}

/// Append one row to the sync log. Logging failures never disturb the
/// sync loop itself.
async fn record_sync_pass(pool: &PgPool, summary: &SyncSummary, duration: Duration) {
    let logged = sqlx::query(
        r#"
        INSERT INTO federation_sync_log (peer_id, status, pushed, pulled, conflicts, errors, duration_ms)
        VALUES ('*', $1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&summary.status)
    .bind(summary.pushed as i32)
    .bind(summary.pulled as i32)
    .bind(summary.conflicts as i32)
    .bind(sqlx::types::Json(&summary.errors))
    .bind(duration.as_secs_f64() * 1000.0)
    .execute(pool)
    .await;
    if let Err(e) = logged {
        warn!("could not record sync log entry: {e}");
    }
}

/// Mirror conflict state into the durable table: unresolved conflicts are
/// upserted, resolutions fill in their outcome columns.
async fn persist_conflicts(pool: &PgPool, federation: &FederationSync) {
    let manager = federation.conflict_manager();
    let mut conflicts = manager.unresolved();
    conflicts.extend(manager.resolved());

    for conflict in conflicts {
        let strategy = conflict
            .resolution_strategy
            .and_then(|s| serde_json::to_value(s).ok())
            .and_then(|v| v.as_str().map(str::to_string));
        let stored = sqlx::query(
            r#"
            INSERT INTO federation_conflicts (
                id, peer_id, entity_type, entity_id,
                local_doc, local_etag, remote_doc, remote_etag,
                detected_at, resolved_at, resolution_strategy, resolved_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE
                SET resolved_at = EXCLUDED.resolved_at,
                    resolution_strategy = EXCLUDED.resolution_strategy,
                    resolved_by = EXCLUDED.resolved_by
            "#,
        )
        .bind(&conflict.id)
        .bind(&conflict.peer_id)
        .bind(&conflict.entity_type)
        .bind(&conflict.entity_id)
        .bind(sqlx::types::Json(&conflict.local_doc))
        .bind(&conflict.local_etag)
        .bind(sqlx::types::Json(&conflict.remote_doc))
        .bind(&conflict.remote_etag)
        .bind(conflict.detected_at)
        .bind(conflict.resolved_at)
        .bind(strategy)
        .bind(&conflict.resolved_by)
        .execute(pool)
        .await;
        if let Err(e) = stored {
            warn!(conflict_id = %conflict.id, "could not persist conflict: {e}");
        }
    }
}
