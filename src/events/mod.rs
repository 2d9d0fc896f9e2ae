// Typed repository events and the bus contract.
//
// Two bus implementations satisfy the same trait: an in-process bus for
// single-instance deployments and a Redis-Streams bus with consumer groups
// for clusters. Handlers must be idempotent; delivery is at-least-once on
// the distributed bus.

pub mod memory;
pub mod redis_streams;

pub use memory::MemoryEventBus;
pub use redis_streams::RedisStreamEventBus;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

/// Which entity type the event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventEntity {
    Aas,
    Submodel,
    Element,
    ConceptDescription,
}

impl EventEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventEntity::Aas => "aas",
            EventEntity::Submodel => "submodel",
            EventEntity::Element => "element",
            EventEntity::ConceptDescription => "concept_description",
        }
    }
}

/// One change notification. Byte payloads are base64 on the wire so the
/// whole envelope stays valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryEvent {
    pub event_id: String,
    pub event_type: EventKind,
    pub entity: EventEntity,
    pub identifier: String,
    pub identifier_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "serde_b64", default)]
    pub doc_bytes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "serde_b64", default)]
    pub value_bytes: Option<Vec<u8>>,
}

impl RepositoryEvent {
    pub fn new(
        event_type: EventKind,
        entity: EventEntity,
        identifier: impl Into<String>,
    ) -> Self {
        let identifier = identifier.into();
        let identifier_b64 = crate::ids::encode_id_to_b64url(&identifier);
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            entity,
            identifier,
            identifier_b64,
            id_short_path: None,
            timestamp: Utc::now(),
            etag: None,
            doc_bytes: None,
            value_bytes: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_doc_bytes(mut self, doc_bytes: Vec<u8>) -> Self {
        self.doc_bytes = Some(doc_bytes);
        self
    }

    pub fn with_path(mut self, id_short_path: impl Into<String>) -> Self {
        self.id_short_path = Some(id_short_path.into());
        self
    }

    pub fn with_value_bytes(mut self, value_bytes: Vec<u8>) -> Self {
        self.value_bytes = Some(value_bytes);
        self
    }
}

/// Base64 (standard alphabet) encoding for optional byte fields.
mod serde_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A subscriber callback. Must be idempotent: the Redis bus redelivers
/// unacknowledged entries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RepositoryEvent) -> anyhow::Result<()>;

    /// Name used in error logs.
    fn name(&self) -> &str {
        "handler"
    }
}

/// The bus contract shared by both implementations.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: RepositoryEvent) -> Result<()>;
    async fn subscribe(&self, handler: Arc<dyn EventHandler>);
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
}
