// Peer registry with health probing.
//
// The registry is an in-memory map guarded by a single lock; health probes
// never hold the lock across I/O. The peer's URL is copied out, the probe
// runs, and the status is written back afterwards.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, TitanError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
    Degraded,
}

/// What this peer can accept; gates push targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCapabilities {
    pub aas_repository: bool,
    pub submodel_repository: bool,
    pub concept_description_repository: bool,
    pub registry: bool,
    pub discovery: bool,
    pub events: bool,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            aas_repository: true,
            submodel_repository: true,
            concept_description_repository: true,
            registry: true,
            discovery: true,
            events: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: PeerStatus,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
            status: PeerStatus::Offline,
            capabilities: PeerCapabilities::default(),
            last_seen: None,
            last_sync: None,
            version: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == PeerStatus::Online
    }
}

pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
    http: reqwest::Client,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    pub fn register(&self, peer: Peer) {
        debug!(peer_id = %peer.id, url = %peer.url, "peer registered");
        self.peers.write().insert(peer.id.clone(), peer);
    }

    pub fn unregister(&self, peer_id: &str) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn list_all(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn list_healthy(&self) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_healthy())
            .cloned()
            .collect()
    }

    pub fn set_last_sync(&self, peer_id: &str, at: DateTime<Utc>) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_sync = Some(at);
        }
    }

    /// Probe one peer's well-known health endpoint and record the outcome.
    pub async fn check_health(&self, peer_id: &str) -> Result<PeerStatus> {
        let url = self
            .get(peer_id)
            .map(|peer| peer.url.clone())
            .ok_or_else(|| TitanError::NotFound {
                what: "Peer",
                id: peer_id.to_string(),
            })?;
        let probe = Url::parse(&url)
            .and_then(|base| base.join("health"))
            .map_err(|e| TitanError::BadRequest(format!("bad peer url {url}: {e}")))?;

        let status = match self.http.get(probe).send().await {
            Ok(response) if response.status().is_success() => PeerStatus::Online,
            Ok(response) => {
                warn!(peer_id, status = %response.status(), "peer probe degraded");
                PeerStatus::Degraded
            }
            Err(e) => {
                warn!(peer_id, "peer probe failed: {e}");
                PeerStatus::Offline
            }
        };

        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.status = status;
            if status == PeerStatus::Online {
                peer.last_seen = Some(Utc::now());
            }
        }
        Ok(status)
    }

    /// Probe every registered peer concurrently.
    pub async fn check_all_health(&self) {
        let ids: Vec<String> = self.peers.read().keys().cloned().collect();
        join_all(ids.iter().map(|peer_id| self.check_health(peer_id))).await;
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable peer records backing the in-memory registry across restarts.
#[derive(Clone)]
pub struct PeerStore {
    pool: sqlx::PgPool,
}

impl PeerStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_all(&self) -> Result<Vec<Peer>> {
        let rows: Vec<(
            String,
            String,
            Option<String>,
            String,
            sqlx::types::Json<PeerCapabilities>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            Option<String>,
        )> = sqlx::query_as(
            r#"
            SELECT id, url, name, status, capabilities, last_seen, last_sync, version
            FROM federation_peers
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, url, name, status, capabilities, last_seen, last_sync, version)| Peer {
                    id,
                    url,
                    name,
                    status: match status.as_str() {
                        "online" => PeerStatus::Online,
                        "degraded" => PeerStatus::Degraded,
                        _ => PeerStatus::Offline,
                    },
                    capabilities: capabilities.0,
                    last_seen,
                    last_sync,
                    version,
                },
            )
            .collect())
    }

    pub async fn save(&self, peer: &Peer) -> Result<()> {
        let status = match peer.status {
            PeerStatus::Online => "online",
            PeerStatus::Offline => "offline",
            PeerStatus::Degraded => "degraded",
        };
        sqlx::query(
            r#"
            INSERT INTO federation_peers (id, url, name, status, capabilities, last_seen, last_sync, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
                SET url = EXCLUDED.url,
                    name = EXCLUDED.name,
                    status = EXCLUDED.status,
                    capabilities = EXCLUDED.capabilities,
                    last_seen = EXCLUDED.last_seen,
                    last_sync = EXCLUDED.last_sync,
                    version = EXCLUDED.version
            "#,
        )
        .bind(&peer.id)
        .bind(&peer.url)
        .bind(&peer.name)
        .bind(status)
        .bind(sqlx::types::Json(&peer.capabilities))
        .bind(peer.last_seen)
        .bind(peer.last_sync)
        .bind(&peer.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, peer_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM federation_peers WHERE id = $1")
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(id: &str) -> Peer {
        let mut peer = Peer::new(id, format!("http://{id}.example.com"));
        peer.status = PeerStatus::Online;
        peer
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PeerRegistry::new();
        registry.register(online("peer-001"));
        assert!(registry.get("peer-001").is_some());
        assert!(registry.unregister("peer-001"));
        assert!(registry.get("peer-001").is_none());
        assert!(!registry.unregister("peer-001"));
    }

    #[test]
    fn test_list_healthy_filters_offline() {
        let registry = PeerRegistry::new();
        registry.register(online("peer-001"));
        let mut down = Peer::new("peer-002", "http://peer2.example.com");
        down.status = PeerStatus::Offline;
        registry.register(down);
        let mut degraded = Peer::new("peer-003", "http://peer3.example.com");
        degraded.status = PeerStatus::Degraded;
        registry.register(degraded);

        let healthy = registry.list_healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "peer-001");
    }

    #[test]
    fn test_peer_wire_shape() {
        let peer = online("peer-001");
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["capabilities"]["submodelRepository"], true);
    }
}
