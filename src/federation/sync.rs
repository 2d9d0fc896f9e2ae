// Topology-aware federation sync.
//
// Push replays the local change queue against each sync peer; pull lists
// the peer's entities and compares ETags by identifier, recording a
// conflict when both sides hold diverged documents. Per-peer errors are
// collected into the summary and never abort the loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::conflicts::{ConflictInfo, ConflictManager, ResolutionStrategy, Winner};
use super::peer::{Peer, PeerRegistry};
use crate::canonical::{canonical_bytes, generate_etag};
use crate::error::{Result, TitanError};
use crate::ids::encode_id_to_b64url;
use crate::model::{AssetAdministrationShell, ConceptDescription, Submodel};
use crate::repository::{AasRepository, ConceptDescriptionRepository, SubmodelRepository};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CHANGE_QUEUE_MAX: usize = 10_000;
const PULL_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Pull,
    Push,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTopology {
    Mesh,
    HubSpoke,
}

/// One tracked local mutation, replayed on push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    #[serde(rename = "changeId")]
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of pending changes; overflow drops the oldest entries.
pub struct ChangeQueue {
    changes: Mutex<VecDeque<SyncChange>>,
    max_size: usize,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::with_max_size(CHANGE_QUEUE_MAX)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            changes: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    pub fn add(&self, change: SyncChange) {
        let mut changes = self.changes.lock();
        if changes.len() >= self.max_size {
            changes.pop_front();
        }
        changes.push_back(change);
    }

    /// Pending changes, optionally only those after `since`.
    pub fn get_pending(&self, since: Option<DateTime<Utc>>) -> Vec<SyncChange> {
        let changes = self.changes.lock();
        changes
            .iter()
            .filter(|change| since.map_or(true, |since| change.timestamp > since))
            .cloned()
            .collect()
    }

    pub fn mark_synced(&self, ids: &[String]) -> usize {
        let mut changes = self.changes.lock();
        let before = changes.len();
        changes.retain(|change| !ids.contains(&change.id));
        before - changes.len()
    }

    pub fn clear(&self) -> usize {
        let mut changes = self.changes.lock();
        let count = changes.len();
        changes.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-side hook: repositories report every mutation here so the next
/// push can replay it.
pub trait ChangeTracker: Send + Sync {
    fn track_change(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: &str,
        doc: Option<Value>,
        etag: Option<String>,
    );
}

/// Local-store seam used by pull and conflict resolution. Kept as a trait
/// so sync logic is testable without Postgres.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn local_etag(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>>;
    async fn local_doc(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>>;
    /// Create or replace the local copy from a remote document.
    async fn apply_remote(&self, entity_type: &str, doc: &Value) -> Result<()>;
}

/// Production `SyncStore` over the three repositories. Writes go through
/// the repositories directly: pulled documents must not re-enter the
/// change queue, or peers would echo each other's changes forever.
pub struct RepositorySyncStore {
    pub shells: AasRepository,
    pub submodels: SubmodelRepository,
    pub concept_descriptions: ConceptDescriptionRepository,
}

#[async_trait]
impl SyncStore for RepositorySyncStore {
    async fn local_etag(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>> {
        let row = match entity_type {
            "aas" => self.shells.get_bytes_by_id(entity_id).await?,
            "submodel" => self.submodels.get_bytes_by_id(entity_id).await?,
            "concept_description" => self.concept_descriptions.get_bytes_by_id(entity_id).await?,
            other => {
                return Err(TitanError::BadRequest(format!("unknown entity type {other}")))
            }
        };
        Ok(row.map(|(_, etag)| etag))
    }

    async fn local_doc(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        let row = match entity_type {
            "aas" => self.shells.get_bytes_by_id(entity_id).await?,
            "submodel" => self.submodels.get_bytes_by_id(entity_id).await?,
            "concept_description" => self.concept_descriptions.get_bytes_by_id(entity_id).await?,
            other => {
                return Err(TitanError::BadRequest(format!("unknown entity type {other}")))
            }
        };
        row.map(|(doc_bytes, _)| serde_json::from_slice(&doc_bytes).map_err(TitanError::from))
            .transpose()
    }

    async fn apply_remote(&self, entity_type: &str, doc: &Value) -> Result<()> {
        match entity_type {
            "aas" => {
                let shell: AssetAdministrationShell = serde_json::from_value(doc.clone())?;
                if self.shells.exists(&shell.id).await? {
                    self.shells.update(&shell.id.clone(), &shell, None).await?;
                } else {
                    self.shells.create(&shell).await?;
                }
            }
            "submodel" => {
                let submodel: Submodel = serde_json::from_value(doc.clone())?;
                if self.submodels.exists(&submodel.id).await? {
                    self.submodels
                        .update(&submodel.id.clone(), &submodel, None)
                        .await?;
                } else {
                    self.submodels.create(&submodel).await?;
                }
            }
            "concept_description" => {
                let cd: ConceptDescription = serde_json::from_value(doc.clone())?;
                if self.concept_descriptions.exists(&cd.id).await? {
                    self.concept_descriptions
                        .update(&cd.id.clone(), &cd, None)
                        .await?;
                } else {
                    self.concept_descriptions.create(&cd).await?;
                }
            }
            other => {
                return Err(TitanError::BadRequest(format!("unknown entity type {other}")))
            }
        }
        Ok(())
    }
}

/// Outcome of one peer exchange.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub peer_id: String,
    pub success: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    pub duration_ms: f64,
}

/// Outcome of a whole `sync_once` pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub status: String,
    pub peers: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

pub struct FederationSyncConfig {
    pub mode: SyncMode,
    pub topology: SyncTopology,
    pub hub_peer_id: Option<String>,
    pub delta_sync_enabled: bool,
}

impl Default for FederationSyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Bidirectional,
            topology: SyncTopology::Mesh,
            hub_peer_id: None,
            delta_sync_enabled: true,
        }
    }
}

pub struct FederationSync {
    registry: Arc<PeerRegistry>,
    conflict_manager: Arc<ConflictManager>,
    store: Arc<dyn SyncStore>,
    pub change_queue: ChangeQueue,
    etag_store: DashMap<String, String>,
    config: FederationSyncConfig,
    http: reqwest::Client,
}

impl FederationSync {
    pub fn new(
        registry: Arc<PeerRegistry>,
        conflict_manager: Arc<ConflictManager>,
        store: Arc<dyn SyncStore>,
        config: FederationSyncConfig,
    ) -> Self {
        Self {
            registry,
            conflict_manager,
            store,
            change_queue: ChangeQueue::new(),
            etag_store: DashMap::new(),
            config,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn conflict_manager(&self) -> &Arc<ConflictManager> {
        &self.conflict_manager
    }

    pub fn mode(&self) -> SyncMode {
        self.config.mode
    }

    /// Peers this instance exchanges with under the configured topology:
    /// mesh talks to every healthy peer; a spoke talks only to its hub; a
    /// hub (hub-spoke without `hub_peer_id`) talks to every healthy peer.
    pub fn get_sync_peers(&self) -> Vec<Peer> {
        let healthy = self.registry.list_healthy();
        match (self.config.topology, &self.config.hub_peer_id) {
            (SyncTopology::Mesh, _) | (SyncTopology::HubSpoke, None) => healthy,
            (SyncTopology::HubSpoke, Some(hub_id)) => healthy
                .into_iter()
                .filter(|peer| &peer.id == hub_id)
                .collect(),
        }
    }

    /// One full sync pass over every sync peer.
    #[instrument(skip(self))]
    pub async fn sync_once(&self) -> SyncSummary {
        let peers = self.get_sync_peers();
        if peers.is_empty() {
            return SyncSummary {
                status: "skipped".to_string(),
                peers: 0,
                pushed: 0,
                pulled: 0,
                conflicts: 0,
                errors: vec!["no healthy peers".to_string()],
            };
        }

        let mut summary = SyncSummary {
            status: String::new(),
            peers: peers.len(),
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            errors: Vec::new(),
        };
        let mut failed_peers = 0;

        for peer in &peers {
            let result = self.sync_peer(peer).await;
            summary.pushed += result.pushed;
            summary.pulled += result.pulled;
            summary.conflicts += result.conflicts;
            summary.errors.extend(result.errors);
            if !result.success {
                failed_peers += 1;
            }
        }

        summary.status = if failed_peers == 0 {
            "completed".to_string()
        } else if failed_peers < peers.len() {
            "partial".to_string()
        } else {
            "failed".to_string()
        };
        info!(
            status = %summary.status,
            pushed = summary.pushed,
            pulled = summary.pulled,
            conflicts = summary.conflicts,
            "sync pass finished"
        );
        summary
    }

    async fn sync_peer(&self, peer: &Peer) -> SyncResult {
        let started = std::time::Instant::now();
        let mut result = SyncResult {
            peer_id: peer.id.clone(),
            success: true,
            ..SyncResult::default()
        };

        if matches!(self.config.mode, SyncMode::Push | SyncMode::Bidirectional) {
            if let Err(e) = self.push_changes(peer, &mut result).await {
                result.success = false;
                result.errors.push(format!("push to {}: {e}", peer.id));
            }
        }
        if matches!(self.config.mode, SyncMode::Pull | SyncMode::Bidirectional) {
            if let Err(e) = self.pull_entities(peer, &mut result).await {
                result.success = false;
                result.errors.push(format!("pull from {}: {e}", peer.id));
            }
        }

        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }

    /// Replay tracked changes against one peer.
    async fn push_changes(&self, peer: &Peer, result: &mut SyncResult) -> Result<()> {
        let since = if self.config.delta_sync_enabled {
            peer.last_sync
        } else {
            None
        };
        let pending = self.change_queue.get_pending(since);
        if pending.is_empty() {
            return Ok(());
        }

        let mut synced_ids = Vec::new();
        let mut last_timestamp = None;
        for change in pending {
            if !peer_accepts(peer, &change.entity_type) {
                debug!(peer_id = %peer.id, entity = %change.entity_type, "peer lacks capability, skipping");
                continue;
            }
            match self.push_one(peer, &change).await {
                Ok(()) => {
                    result.pushed += 1;
                    last_timestamp = Some(change.timestamp);
                    synced_ids.push(change.id.clone());
                }
                Err(e) => {
                    result.errors.push(format!(
                        "{} {} {}: {e}",
                        change.operation, change.entity_type, change.entity_id
                    ));
                }
            }
        }

        if let Some(at) = last_timestamp {
            self.registry.set_last_sync(&peer.id, at);
        }
        self.change_queue.mark_synced(&synced_ids);
        Ok(())
    }

    async fn push_one(&self, peer: &Peer, change: &SyncChange) -> Result<()> {
        let collection = entity_collection(&change.entity_type)?;
        let token = encode_id_to_b64url(&change.entity_id);

        let response = match change.operation.as_str() {
            "create" => {
                let doc = change.doc.as_ref().ok_or_else(|| {
                    TitanError::BadRequest("create change carries no document".into())
                })?;
                self.http
                    .post(format!("{}/{collection}", peer.url))
                    .json(doc)
                    .send()
                    .await
            }
            "update" => {
                let doc = change.doc.as_ref().ok_or_else(|| {
                    TitanError::BadRequest("update change carries no document".into())
                })?;
                let mut request = self
                    .http
                    .put(format!("{}/{collection}/{token}", peer.url))
                    .json(doc);
                if let Some(etag) = &change.etag {
                    request = request.header("If-Match", format!("\"{etag}\""));
                }
                request.send().await
            }
            "delete" => {
                self.http
                    .delete(format!("{}/{collection}/{token}", peer.url))
                    .send()
                    .await
            }
            other => {
                return Err(TitanError::BadRequest(format!("unknown operation {other}")));
            }
        };

        let response = response.map_err(|e| TitanError::Unavailable(e.to_string()))?;
        let status = response.status();
        // 409 on create means the peer already has it; 404 on delete means
        // it is already gone. Both are terminal for this change.
        let acceptable = status.is_success()
            || (change.operation == "create" && status.as_u16() == 409)
            || (change.operation == "delete" && status.as_u16() == 404);
        if !acceptable {
            return Err(TitanError::Unavailable(format!(
                "peer answered {status} for {} {}",
                change.operation, change.entity_id
            )));
        }
        Ok(())
    }

    /// List the peer's entities and reconcile by identifier and ETag.
    async fn pull_entities(&self, peer: &Peer, result: &mut SyncResult) -> Result<()> {
        for entity_type in ["aas", "submodel", "concept_description"] {
            if !peer_accepts(peer, entity_type) {
                continue;
            }
            let collection = entity_collection(entity_type)?;
            let url = format!("{}/{collection}?limit={PULL_PAGE_LIMIT}", peer.url);
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            if !response.status().is_success() {
                result
                    .errors
                    .push(format!("list {collection} on {}: {}", peer.id, response.status()));
                continue;
            }
            let envelope: Value = response
                .json()
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            let Some(docs) = envelope.get("result").and_then(Value::as_array) else {
                continue;
            };

            for remote_doc in docs {
                match self.reconcile_remote(peer, entity_type, remote_doc).await {
                    Ok(Reconciled::Pulled) => result.pulled += 1,
                    Ok(Reconciled::Conflict) => result.conflicts += 1,
                    Ok(Reconciled::InSync) => {}
                    Err(e) => result.errors.push(format!("reconcile on {}: {e}", peer.id)),
                }
            }
        }
        Ok(())
    }

    async fn reconcile_remote(
        &self,
        peer: &Peer,
        entity_type: &str,
        remote_doc: &Value,
    ) -> Result<Reconciled> {
        let Some(entity_id) = remote_doc.get("id").and_then(Value::as_str) else {
            return Err(TitanError::BadRequest("remote document without id".into()));
        };

        // A fresh ETag over the remote bytes: the peer's stored validator
        // is not trusted across instances.
        let remote_etag = generate_etag(&canonical_bytes(remote_doc));
        let local_etag = self.store.local_etag(entity_type, entity_id).await?;

        match local_etag {
            None => {
                self.store.apply_remote(entity_type, remote_doc).await?;
                self.etag_store
                    .insert(etag_key(entity_type, entity_id), remote_etag);
                Ok(Reconciled::Pulled)
            }
            Some(local_etag) if local_etag == remote_etag => Ok(Reconciled::InSync),
            Some(local_etag) => {
                let local_doc = self
                    .store
                    .local_doc(entity_type, entity_id)
                    .await?
                    .unwrap_or(Value::Null);
                warn!(
                    peer_id = %peer.id,
                    entity_type,
                    entity_id,
                    "etag divergence, recording conflict"
                );
                self.conflict_manager.add_conflict(ConflictInfo::new(
                    &peer.id,
                    entity_type,
                    entity_id,
                    local_doc,
                    local_etag,
                    remote_doc.clone(),
                    remote_etag,
                ));
                Ok(Reconciled::Conflict)
            }
        }
    }

    /// Resolve one recorded conflict with the given strategy. The winning
    /// document is written through the store; callers emit the update
    /// event from the repository write path.
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<ConflictInfo> {
        let conflict = self
            .conflict_manager
            .get(conflict_id)
            .ok_or_else(|| TitanError::NotFound {
                what: "Conflict",
                id: conflict_id.to_string(),
            })?;

        if self.conflict_manager.decide(&conflict, strategy) == Winner::Remote {
            self.store
                .apply_remote(&conflict.entity_type, &conflict.remote_doc)
                .await?;
        }
        self.conflict_manager
            .mark_resolved(conflict_id, strategy, resolved_by)
            .ok_or_else(|| TitanError::Gone(format!("conflict {conflict_id} already resolved")))
    }

    /// Apply one strategy to all unresolved conflicts, optionally only
    /// those from one peer.
    #[instrument(skip(self))]
    pub async fn resolve_all_conflicts(
        &self,
        strategy: ResolutionStrategy,
        peer_id: Option<&str>,
        resolved_by: &str,
    ) -> (usize, usize) {
        let candidates: Vec<ConflictInfo> = self
            .conflict_manager
            .unresolved()
            .into_iter()
            .filter(|c| peer_id.map_or(true, |p| c.peer_id == p))
            .collect();

        let mut resolved = 0;
        let mut failed = 0;
        for conflict in candidates {
            match self.resolve_conflict(&conflict.id, strategy, resolved_by).await {
                Ok(_) => resolved += 1,
                Err(e) => {
                    warn!(conflict_id = %conflict.id, "batch resolve failed: {e}");
                    failed += 1;
                }
            }
        }
        (resolved, failed)
    }

    pub fn get_sync_status(&self) -> Value {
        serde_json::json!({
            "mode": self.config.mode,
            "topology": self.config.topology,
            "hubPeerId": self.config.hub_peer_id,
            "deltaSyncEnabled": self.config.delta_sync_enabled,
            "peersTotal": self.registry.list_all().len(),
            "peersHealthy": self.registry.list_healthy().len(),
            "pendingChanges": self.change_queue.len(),
            "unresolvedConflicts": self.conflict_manager.unresolved_count(),
        })
    }

    pub fn clear_pending_changes(&self) -> usize {
        self.change_queue.clear()
    }
}

enum Reconciled {
    Pulled,
    Conflict,
    InSync,
}

impl ChangeTracker for FederationSync {
    fn track_change(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: &str,
        doc: Option<Value>,
        etag: Option<String>,
    ) {
        if let Some(etag) = &etag {
            self.etag_store
                .insert(etag_key(entity_type, entity_id), etag.clone());
        }
        self.change_queue.add(SyncChange {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            doc,
            etag,
            timestamp: Utc::now(),
        });
    }
}

fn etag_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

fn entity_collection(entity_type: &str) -> Result<&'static str> {
    match entity_type {
        "aas" => Ok("shells"),
        "submodel" => Ok("submodels"),
        "concept_description" => Ok("concept-descriptions"),
        other => Err(TitanError::BadRequest(format!("unknown entity type {other}"))),
    }
}

fn peer_accepts(peer: &Peer, entity_type: &str) -> bool {
    match entity_type {
        "aas" => peer.capabilities.aas_repository,
        "submodel" => peer.capabilities.submodel_repository,
        "concept_description" => peer.capabilities.concept_description_repository,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::peer::PeerStatus;
    use chrono::Duration as ChronoDuration;

    struct NullStore;

    #[async_trait]
    impl SyncStore for NullStore {
        async fn local_etag(&self, _: &str, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn local_doc(&self, _: &str, _: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn apply_remote(&self, _: &str, _: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn sync_with(config: FederationSyncConfig) -> FederationSync {
        FederationSync::new(
            Arc::new(PeerRegistry::new()),
            Arc::new(ConflictManager::new()),
            Arc::new(NullStore),
            config,
        )
    }

    fn online(id: &str) -> Peer {
        let mut peer = Peer::new(id, format!("http://{id}.example.com"));
        peer.status = PeerStatus::Online;
        peer
    }

    #[test]
    fn test_change_queue_overflow_drops_oldest() {
        let queue = ChangeQueue::with_max_size(3);
        for i in 0..5 {
            queue.add(SyncChange {
                id: format!("c{i}"),
                entity_type: "aas".into(),
                entity_id: format!("id{i}"),
                operation: "create".into(),
                doc: None,
                etag: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(queue.len(), 3);
        let ids: Vec<String> = queue.get_pending(None).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_change_queue_since_filter() {
        let queue = ChangeQueue::new();
        let old = SyncChange {
            id: "old".into(),
            entity_type: "aas".into(),
            entity_id: "id1".into(),
            operation: "create".into(),
            doc: None,
            etag: None,
            timestamp: Utc::now() - ChronoDuration::hours(2),
        };
        queue.add(old);
        queue.add(SyncChange {
            id: "new".into(),
            entity_type: "aas".into(),
            entity_id: "id2".into(),
            operation: "create".into(),
            doc: None,
            etag: None,
            timestamp: Utc::now(),
        });

        let since = Utc::now() - ChronoDuration::minutes(30);
        let pending = queue.get_pending(Some(since));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "new");
    }

    #[test]
    fn test_mark_synced_removes_entries() {
        let queue = ChangeQueue::new();
        for id in ["c1", "c2"] {
            queue.add(SyncChange {
                id: id.into(),
                entity_type: "aas".into(),
                entity_id: id.into(),
                operation: "update".into(),
                doc: None,
                etag: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(queue.mark_synced(&["c1".to_string()]), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_pending(None)[0].id, "c2");
    }

    #[test]
    fn test_mesh_topology_syncs_all_healthy() {
        let sync = sync_with(FederationSyncConfig::default());
        sync.registry.register(online("hub"));
        sync.registry.register(online("spoke1"));
        sync.registry.register(online("spoke2"));
        assert_eq!(sync.get_sync_peers().len(), 3);
    }

    #[test]
    fn test_hub_spoke_as_spoke_syncs_only_hub() {
        let sync = sync_with(FederationSyncConfig {
            topology: SyncTopology::HubSpoke,
            hub_peer_id: Some("hub".to_string()),
            ..FederationSyncConfig::default()
        });
        sync.registry.register(online("hub"));
        sync.registry.register(online("spoke1"));
        let peers = sync.get_sync_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "hub");
    }

    #[test]
    fn test_hub_spoke_as_hub_syncs_all() {
        let sync = sync_with(FederationSyncConfig {
            topology: SyncTopology::HubSpoke,
            hub_peer_id: None,
            ..FederationSyncConfig::default()
        });
        sync.registry.register(online("spoke1"));
        sync.registry.register(online("spoke2"));
        assert_eq!(sync.get_sync_peers().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_once_without_peers_is_skipped() {
        let sync = sync_with(FederationSyncConfig::default());
        let summary = sync.sync_once().await;
        assert_eq!(summary.status, "skipped");
        assert_eq!(summary.peers, 0);
    }

    #[test]
    fn test_track_change_fills_queue_and_etag_store() {
        let sync = sync_with(FederationSyncConfig::default());
        sync.track_change(
            "submodel",
            "urn:x:sm:1",
            "update",
            None,
            Some("xyz789".to_string()),
        );
        assert_eq!(sync.change_queue.len(), 1);
        assert_eq!(
            sync.etag_store.get("submodel:urn:x:sm:1").map(|e| e.clone()),
            Some("xyz789".to_string())
        );
    }

    #[test]
    fn test_capability_gating() {
        let mut peer = online("p");
        peer.capabilities.submodel_repository = false;
        assert!(peer_accepts(&peer, "aas"));
        assert!(!peer_accepts(&peer, "submodel"));
    }

    #[test]
    fn test_sync_status_shape() {
        let sync = sync_with(FederationSyncConfig {
            topology: SyncTopology::HubSpoke,
            hub_peer_id: Some("hub-001".to_string()),
            ..FederationSyncConfig::default()
        });
        sync.track_change("aas", "id1", "create", None, None);
        let status = sync.get_sync_status();
        assert_eq!(status["topology"], "hubSpoke");
        assert_eq!(status["hubPeerId"], "hub-001");
        assert_eq!(status["pendingChanges"], 1);
        assert_eq!(status["deltaSyncEnabled"], true);
    }
}
