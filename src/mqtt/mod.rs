// MQTT bridge: publisher side.
//
// One broker connection per process, owned by a connection manager with an
// explicit state machine (DISCONNECTED → CONNECTING → CONNECTED →
// RECONNECTING → FAILED) and exponential reconnect backoff. Publishers
// look per-topic QoS/retain up in a wildcard-aware registry.
//
// Topic layout:
//   titan/aas/{idB64}/{created|updated|deleted}
//   titan/submodel/{idB64}/{created|updated|deleted}
//   titan/element/{submodelIdB64}/{idShortPath}/{eventType}

pub mod subscriber;

pub use subscriber::{ElementValueHandler, HandlerRegistry, MessageHandler, MqttMessage, MqttSubscriber};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TitanError};
use crate::events::{EventEntity, EventHandler, RepositoryEvent};

pub const TOPIC_PREFIX: &str = "titan";

#[derive(Debug, Clone)]
pub struct MqttReconnectConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for MqttReconnectConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub reconnect: MqttReconnectConfig,
    pub default_qos: u8,
    pub retain_events: bool,
    pub subscribe_enabled: bool,
    pub subscribe_topics: Vec<String>,
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: 1883,
            use_tls: false,
            username: None,
            password: None,
            client_id: client_id.into(),
            reconnect: MqttReconnectConfig::default(),
            default_qos: 1,
            retain_events: false,
            subscribe_enabled: false,
            subscribe_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl MqttConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MqttConnectionState::Disconnected => "disconnected",
            MqttConnectionState::Connecting => "connecting",
            MqttConnectionState::Connected => "connected",
            MqttConnectionState::Reconnecting => "reconnecting",
            MqttConnectionState::Failed => "failed",
        }
    }
}

/// Publish and connection counters, surfaced on dashboards.
#[derive(Debug, Default)]
pub struct MqttMetrics {
    pub messages_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub connection_attempts: AtomicU64,
    pub successful_connections: AtomicU64,
    pub disconnections: AtomicU64,
}

impl MqttMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "messagesPublished": self.messages_published.load(Ordering::Relaxed),
            "publishErrors": self.publish_errors.load(Ordering::Relaxed),
            "connectionAttempts": self.connection_attempts.load(Ordering::Relaxed),
            "successfulConnections": self.successful_connections.load(Ordering::Relaxed),
            "disconnections": self.disconnections.load(Ordering::Relaxed),
        })
    }
}

/// Per-topic QoS/retain, with `+`/`#` wildcard patterns and a default.
pub struct TopicConfigRegistry {
    default_qos: u8,
    default_retain: bool,
    configs: RwLock<Vec<(String, TopicConfig)>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TopicConfig {
    pub qos: u8,
    pub retain: bool,
}

impl TopicConfigRegistry {
    pub fn new(default_qos: u8, default_retain: bool) -> Self {
        Self {
            default_qos,
            default_retain,
            configs: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, topic_pattern: impl Into<String>, config: TopicConfig) {
        self.configs.write().push((topic_pattern.into(), config));
    }

    /// Exact match first, then pattern match, then the default.
    pub fn get_config(&self, topic: &str) -> TopicConfig {
        let configs = self.configs.read();
        if let Some((_, config)) = configs.iter().find(|(pattern, _)| pattern == topic) {
            return *config;
        }
        for (pattern, config) in configs.iter() {
            if topic_matches(topic, pattern) {
                return *config;
            }
        }
        TopicConfig {
            qos: self.default_qos,
            retain: self.default_retain,
        }
    }
}

/// MQTT wildcard matching: `+` one segment, `#` any suffix.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let pattern_parts: Vec<&str> = pattern.split('/').collect();

    if let Some(hash) = pattern_parts.iter().position(|p| *p == "#") {
        return topic_parts.len() >= hash
            && topic_parts[..hash]
                .iter()
                .zip(&pattern_parts[..hash])
                .all(|(t, p)| *p == "+" || t == p);
    }
    topic_parts.len() == pattern_parts.len()
        && topic_parts
            .iter()
            .zip(&pattern_parts)
            .all(|(t, p)| *p == "+" || t == p)
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Owns the broker connection and its event loop task.
pub struct MqttConnectionManager {
    config: MqttConfig,
    client: AsyncClient,
    state: Arc<RwLock<MqttConnectionState>>,
    pub metrics: Arc<MqttMetrics>,
    incoming: Mutex<Option<mpsc::Receiver<MqttMessage>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnectionManager {
    /// Build the client and start the connection event loop.
    pub fn start(config: MqttConfig) -> Arc<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if config.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let state = Arc::new(RwLock::new(MqttConnectionState::Connecting));
        let metrics = Arc::new(MqttMetrics::default());
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let manager = Arc::new(Self {
            config: config.clone(),
            client,
            state: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            incoming: Mutex::new(Some(incoming_rx)),
            shutdown,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(connection_loop(
            event_loop,
            config,
            state,
            metrics,
            incoming_tx,
            shutdown_rx,
        ));
        *manager.task.try_lock().expect("task slot uncontended at startup") = Some(task);
        manager
    }

    pub fn state(&self) -> MqttConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == MqttConnectionState::Connected
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Receiver of inbound publishes; taken once by the subscriber.
    pub async fn take_incoming(&self) -> Option<mpsc::Receiver<MqttMessage>> {
        self.incoming.lock().await.take()
    }

    /// Queue a publish. Fails once the state machine has given up.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> Result<()> {
        if self.state() == MqttConnectionState::Failed {
            self.metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TitanError::Unavailable(
                "mqtt connection failed after max reconnect attempts".to_string(),
            ));
        }
        match self
            .client
            .publish(topic, qos_from_u8(qos), retain, payload)
            .await
        {
            Ok(()) => {
                self.metrics
                    .messages_published
                    .fetch_add(1, Ordering::Relaxed);
                debug!(topic, qos, retain, "published to mqtt");
                Ok(())
            }
            Err(e) => {
                self.metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
                Err(TitanError::Unavailable(format!("mqtt publish failed: {e}")))
            }
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        let _ = self.client.disconnect().await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        *self.state.write() = MqttConnectionState::Disconnected;
        self.metrics.disconnections.fetch_add(1, Ordering::Relaxed);
        info!("disconnected from mqtt broker");
    }

    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "connected": self.is_connected(),
            "state": self.state().as_str(),
            "broker": self.config.broker,
            "port": self.config.port,
            "metrics": self.metrics.snapshot(),
        })
    }
}

/// Drives the rumqttc event loop, tracking the connection state machine
/// and applying exponential backoff between failed attempts.
async fn connection_loop(
    mut event_loop: rumqttc::EventLoop,
    config: MqttConfig,
    state: Arc<RwLock<MqttConnectionState>>,
    metrics: Arc<MqttMetrics>,
    incoming_tx: mpsc::Sender<MqttMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = config.reconnect.initial;
    let mut attempts: u32 = 0;
    metrics.connection_attempts.fetch_add(1, Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    *state.write() = MqttConnectionState::Connected;
                    metrics.successful_connections.fetch_add(1, Ordering::Relaxed);
                    delay = config.reconnect.initial;
                    attempts = 0;
                    info!(broker = %config.broker, port = config.port, "connected to mqtt broker");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        qos: publish.qos as u8,
                        retain: publish.retain,
                    };
                    if incoming_tx.try_send(message).is_err() {
                        warn!(topic = %publish.topic, "inbound mqtt queue full, dropping message");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    attempts += 1;
                    metrics.connection_attempts.fetch_add(1, Ordering::Relaxed);
                    if attempts >= config.reconnect.max_attempts {
                        *state.write() = MqttConnectionState::Failed;
                        error!(
                            attempts,
                            "mqtt gave up after max reconnect attempts: {e}"
                        );
                        break;
                    }
                    *state.write() = MqttConnectionState::Reconnecting;
                    warn!(attempts, "mqtt connection error, retrying in {delay:?}: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * config.reconnect.multiplier)
                            .min(config.reconnect.max.as_secs_f64()),
                    );
                }
            }
        }
    }
}

/// Compact wire form of an event on MQTT topics.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MqttEventPayload<'a> {
    event_id: &'a str,
    event_type: &'a str,
    entity: &'a str,
    identifier: &'a str,
    identifier_b64: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_short_path: Option<&'a str>,
    timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
}

pub struct MqttPublisher {
    manager: Arc<MqttConnectionManager>,
    topic_config: TopicConfigRegistry,
}

impl MqttPublisher {
    pub fn new(manager: Arc<MqttConnectionManager>) -> Self {
        let topic_config = TopicConfigRegistry::new(
            manager.config.default_qos,
            manager.config.retain_events,
        );
        Self {
            manager,
            topic_config,
        }
    }

    pub fn with_topic_config(manager: Arc<MqttConnectionManager>, topic_config: TopicConfigRegistry) -> Self {
        Self {
            manager,
            topic_config,
        }
    }

    pub fn topic_config(&self) -> &TopicConfigRegistry {
        &self.topic_config
    }

    /// Topic for a repository event.
    pub fn topic_for(event: &RepositoryEvent) -> String {
        match event.entity {
            EventEntity::Element => format!(
                "{TOPIC_PREFIX}/element/{}/{}/{}",
                event.identifier_b64,
                event.id_short_path.as_deref().unwrap_or(""),
                event.event_type.as_str(),
            ),
            entity => format!(
                "{TOPIC_PREFIX}/{}/{}/{}",
                entity.as_str(),
                event.identifier_b64,
                event.event_type.as_str(),
            ),
        }
    }

    pub async fn publish_event(&self, event: &RepositoryEvent) -> Result<()> {
        let topic = Self::topic_for(event);
        let payload = serde_json::to_vec(&MqttEventPayload {
            event_id: &event.event_id,
            event_type: event.event_type.as_str(),
            entity: event.entity.as_str(),
            identifier: &event.identifier,
            identifier_b64: &event.identifier_b64,
            id_short_path: event.id_short_path.as_deref(),
            timestamp: event.timestamp,
            etag: event.etag.as_deref(),
        })
        .map_err(|e| TitanError::Internal(anyhow::Error::new(e)))?;

        let config = self.topic_config.get_config(&topic);
        self.manager
            .publish(&topic, payload, config.qos, config.retain)
            .await
    }
}

/// Bus handler that forwards every repository event to the broker.
pub struct MqttEventHandler {
    publisher: Arc<MqttPublisher>,
}

impl MqttEventHandler {
    pub fn new(publisher: Arc<MqttPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventHandler for MqttEventHandler {
    async fn handle(&self, event: &RepositoryEvent) -> anyhow::Result<()> {
        if let Err(e) = self.publisher.publish_event(event).await {
            // Broker unavailability must not poison bus retry loops.
            warn!(event_id = %event.event_id, "mqtt forward failed: {e}");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mqtt-bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("titan/aas/abc/created", "titan/aas/+/created"));
        assert!(topic_matches("titan/aas/abc/created", "titan/#"));
        assert!(topic_matches("titan/element/sm/T/value", "titan/element/+/+/value"));
        assert!(!topic_matches("titan/aas/abc/created", "titan/aas/+/deleted"));
        assert!(!topic_matches("titan/aas/abc", "titan/aas/+/created"));
        assert!(topic_matches("titan/element/sm/a/b/value", "titan/element/+/#"));
    }

    #[test]
    fn test_topic_config_lookup() {
        let registry = TopicConfigRegistry::new(1, false);
        registry.register(
            "titan/aas/+/created",
            TopicConfig {
                qos: 2,
                retain: true,
            },
        );
        let hit = registry.get_config("titan/aas/abc/created");
        assert_eq!(hit.qos, 2);
        assert!(hit.retain);
        let fallback = registry.get_config("titan/submodel/abc/created");
        assert_eq!(fallback.qos, 1);
        assert!(!fallback.retain);
    }

    #[test]
    fn test_event_topics() {
        let event = RepositoryEvent::new(EventKind::Created, EventEntity::Aas, "urn:x:aas:1");
        assert_eq!(
            MqttPublisher::topic_for(&event),
            format!("titan/aas/{}/created", event.identifier_b64)
        );

        let event = RepositoryEvent::new(EventKind::Updated, EventEntity::Element, "urn:x:sm:1")
            .with_path("Stack[0].Temperature");
        assert_eq!(
            MqttPublisher::topic_for(&event),
            format!("titan/element/{}/Stack[0].Temperature/updated", event.identifier_b64)
        );
    }

    #[test]
    fn test_backoff_sequence() {
        let config = MqttReconnectConfig::default();
        let mut delay = config.initial;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_secs_f64());
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * config.multiplier).min(config.max.as_secs_f64()),
            );
        }
        assert_eq!(seen[0], 1.0);
        assert_eq!(seen[1], 2.0);
        assert!(seen.iter().all(|d| *d <= 60.0));
        assert_eq!(*seen.last().unwrap(), 60.0);
    }
}
