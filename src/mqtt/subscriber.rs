// MQTT subscriber: routes inbound publishes to handlers by topic pattern.
//
// The flagship handler accepts element-value updates from the field
// (`titan/element/{idB64}/{path}/value`) and commits them through the
// shared element-write pipeline. Malformed identifiers, missing submodels,
// bad paths and unparsable payloads are logged and dropped; the
// subscriber only consumes, it never signals the broker.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{topic_matches, MqttConnectionManager};
use crate::error::{Result, TitanError};
use crate::services::ElementWriteService;

/// Parsed inbound publish.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl MqttMessage {
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.payload).map_err(TitanError::from)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Whether this handler wants the topic (beyond the registry pattern).
    fn matches(&self, topic: &str) -> bool;
    async fn handle(&self, message: &MqttMessage) -> anyhow::Result<()>;
}

/// Maps topic patterns (`+`/`#` wildcards) to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<(String, Arc<dyn MessageHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let pattern = pattern.into();
        debug!(pattern, "registered mqtt handler");
        self.handlers.push((pattern, handler));
    }

    pub fn get_handlers(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .iter()
            .filter(|(pattern, handler)| topic_matches(topic, pattern) && handler.matches(topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

pub struct MqttSubscriber {
    manager: Arc<MqttConnectionManager>,
    registry: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSubscriber {
    pub fn new(manager: Arc<MqttConnectionManager>, registry: HandlerRegistry) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            registry: Arc::new(registry),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the configured topics and start dispatching.
    pub async fn start(&self, topics: &[String]) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("mqtt subscriber already running");
            return Ok(());
        }
        if topics.is_empty() {
            warn!("no mqtt topics to subscribe to");
            return Ok(());
        }

        let client = self.manager.client();
        for topic in topics {
            client
                .subscribe(topic, rumqttc::QoS::AtLeastOnce)
                .await
                .map_err(|e| TitanError::Unavailable(format!("mqtt subscribe failed: {e}")))?;
            debug!(topic, "subscribed");
        }

        let Some(mut incoming) = self.manager.take_incoming().await else {
            return Err(TitanError::Internal(anyhow::anyhow!(
                "inbound mqtt receiver already taken"
            )));
        };
        let registry = Arc::clone(&self.registry);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_message = incoming.recv() => {
                        let Some(message) = maybe_message else { break };
                        let handlers = registry.get_handlers(&message.topic);
                        if handlers.is_empty() {
                            debug!(topic = %message.topic, "no handler for topic");
                            continue;
                        }
                        for handler in handlers {
                            if let Err(e) = handler.handle(&message).await {
                                error!(topic = %message.topic, "mqtt handler failed: {e:#}");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("mqtt dispatch loop stopped");
        }));
        info!(topics = ?topics, "mqtt subscriber started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

static ELEMENT_VALUE_TOPIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^titan/element/([^/]+)/(.+)/value$").expect("topic pattern compiles"));

/// Applies `titan/element/{idB64}/{path}/value` payloads to the store.
///
/// Payload shapes: a bare JSON scalar/document is the value itself; an
/// object carrying a `value` member contributes that member (the
/// `{value, valueType}` form field devices send).
pub struct ElementValueHandler {
    elements: ElementWriteService,
}

impl ElementValueHandler {
    pub const PATTERN: &'static str = "titan/element/+/#";

    pub fn new(elements: ElementWriteService) -> Self {
        Self { elements }
    }
}

#[async_trait]
impl MessageHandler for ElementValueHandler {
    fn matches(&self, topic: &str) -> bool {
        ELEMENT_VALUE_TOPIC.is_match(topic)
    }

    async fn handle(&self, message: &MqttMessage) -> anyhow::Result<()> {
        let Some(captures) = ELEMENT_VALUE_TOPIC.captures(&message.topic) else {
            return Ok(());
        };
        let submodel_id_b64 = &captures[1];
        let id_short_path = &captures[2];

        let payload = match message.payload_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %message.topic, "dropping unparsable payload: {e}");
                return Ok(());
            }
        };
        let value = match &payload {
            serde_json::Value::Object(map) if map.contains_key("value") => {
                map.get("value").cloned().unwrap_or(serde_json::Value::Null)
            }
            other => (*other).clone(),
        };

        match self
            .elements
            .update_value(submodel_id_b64, id_short_path, &value)
            .await
        {
            Ok(etag) => {
                info!(
                    submodel = submodel_id_b64,
                    path = id_short_path,
                    etag,
                    "element updated via mqtt"
                );
            }
            Err(e @ TitanError::InvalidIdentifier(_))
            | Err(e @ TitanError::NotFound { .. })
            | Err(e @ TitanError::ElementNotFound(_))
            | Err(e @ TitanError::InvalidPath(_))
            | Err(e @ TitanError::BadRequest(_)) => {
                warn!(topic = %message.topic, "dropping element update: {e}");
            }
            Err(e) => {
                error!(topic = %message.topic, "element update failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;

    #[async_trait]
    impl MessageHandler for Sink {
        fn matches(&self, _topic: &str) -> bool {
            true
        }
        async fn handle(&self, _message: &MqttMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_pattern_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register("titan/element/+/#", Arc::new(Sink));
        registry.register("titan/+/+/command/#", Arc::new(Sink));

        assert_eq!(registry.get_handlers("titan/element/sm/T/value").len(), 1);
        assert_eq!(registry.get_handlers("titan/aas/x/command/refresh").len(), 1);
        assert_eq!(registry.get_handlers("other/element/sm/T/value").len(), 0);
    }

    #[test]
    fn test_element_topic_regex() {
        let captures = ELEMENT_VALUE_TOPIC
            .captures("titan/element/dXJu/Stack[0].Temperature/value")
            .unwrap();
        assert_eq!(&captures[1], "dXJu");
        assert_eq!(&captures[2], "Stack[0].Temperature");

        assert!(ELEMENT_VALUE_TOPIC.is_match("titan/element/dXJu/a/b/value"));
        assert!(!ELEMENT_VALUE_TOPIC.is_match("titan/element/dXJu/value"));
        assert!(!ELEMENT_VALUE_TOPIC.is_match("titan/aas/dXJu/created"));
    }
}
