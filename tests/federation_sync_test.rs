// Federation behavior against a scripted in-memory store: topology
// selection, change tracking, and the conflict lifecycle end to end.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use titan_aas::federation::{
    ConflictInfo, ConflictManager, FederationSync, FederationSyncConfig, Peer, PeerRegistry,
    PeerStatus, ResolutionStrategy, SyncMode, SyncStore, SyncTopology, Winner,
};
use titan_aas::Result;

/// In-memory store that records what the sync loop applies.
#[derive(Default)]
struct ScriptedStore {
    docs: Mutex<HashMap<String, Value>>,
    applied: Mutex<Vec<(String, Value)>>,
}

impl ScriptedStore {
    fn key(entity_type: &str, entity_id: &str) -> String {
        format!("{entity_type}:{entity_id}")
    }

    fn seed(&self, entity_type: &str, doc: Value) {
        let entity_id = doc["id"].as_str().unwrap().to_string();
        self.docs
            .lock()
            .insert(Self::key(entity_type, &entity_id), doc);
    }
}

#[async_trait]
impl SyncStore for ScriptedStore {
    async fn local_etag(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>> {
        Ok(self
            .docs
            .lock()
            .get(&Self::key(entity_type, entity_id))
            .map(|doc| titan_aas::generate_etag(&titan_aas::canonical_bytes(doc))))
    }

    async fn local_doc(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        Ok(self
            .docs
            .lock()
            .get(&Self::key(entity_type, entity_id))
            .cloned())
    }

    async fn apply_remote(&self, entity_type: &str, doc: &Value) -> Result<()> {
        let entity_id = doc["id"].as_str().unwrap_or_default().to_string();
        self.docs
            .lock()
            .insert(Self::key(entity_type, &entity_id), doc.clone());
        self.applied
            .lock()
            .push((entity_type.to_string(), doc.clone()));
        Ok(())
    }
}

fn harness(config: FederationSyncConfig) -> (FederationSync, Arc<ScriptedStore>) {
    let store = Arc::new(ScriptedStore::default());
    let sync = FederationSync::new(
        Arc::new(PeerRegistry::new()),
        Arc::new(ConflictManager::new()),
        store.clone(),
        config,
    );
    (sync, store)
}

fn online(id: &str) -> Peer {
    let mut peer = Peer::new(id, format!("http://{id}.example.com"));
    peer.status = PeerStatus::Online;
    peer
}

#[test]
fn topology_selects_sync_peers() {
    let (mesh, _) = harness(FederationSyncConfig::default());
    mesh.registry().register(online("a"));
    mesh.registry().register(online("b"));
    let mut down = Peer::new("c", "http://c.example.com");
    down.status = PeerStatus::Offline;
    mesh.registry().register(down);
    assert_eq!(mesh.get_sync_peers().len(), 2);

    let (spoke, _) = harness(FederationSyncConfig {
        topology: SyncTopology::HubSpoke,
        hub_peer_id: Some("hub".to_string()),
        ..FederationSyncConfig::default()
    });
    spoke.registry().register(online("hub"));
    spoke.registry().register(online("other"));
    let peers = spoke.get_sync_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "hub");

    let (hub, _) = harness(FederationSyncConfig {
        topology: SyncTopology::HubSpoke,
        hub_peer_id: None,
        ..FederationSyncConfig::default()
    });
    hub.registry().register(online("s1"));
    hub.registry().register(online("s2"));
    assert_eq!(hub.get_sync_peers().len(), 2);
}

#[tokio::test]
async fn sync_without_healthy_peers_is_skipped() {
    let (sync, _) = harness(FederationSyncConfig {
        mode: SyncMode::Push,
        ..FederationSyncConfig::default()
    });
    let summary = sync.sync_once().await;
    assert_eq!(summary.status, "skipped");
    assert_eq!(summary.peers, 0);
    assert_eq!(summary.pushed, 0);
}

#[test]
fn tracked_changes_accumulate_for_push() {
    use titan_aas::federation::ChangeTracker;

    let (sync, _) = harness(FederationSyncConfig::default());
    sync.track_change(
        "aas",
        "urn:x:aas:1",
        "create",
        Some(json!({"id": "urn:x:aas:1"})),
        Some("etag-1".to_string()),
    );
    sync.track_change("aas", "urn:x:aas:1", "delete", None, None);

    let pending = sync.change_queue.get_pending(None);
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].operation, "create");
    assert_eq!(pending[1].operation, "delete");

    assert_eq!(sync.clear_pending_changes(), 2);
    assert!(sync.change_queue.is_empty());
}

#[tokio::test]
async fn remote_preferred_resolution_overwrites_local() {
    let (sync, store) = harness(FederationSyncConfig::default());
    store.seed("submodel", json!({"id": "urn:x:sm:1", "idShort": "Local"}));

    let conflict = ConflictInfo::new(
        "peer-001",
        "submodel",
        "urn:x:sm:1",
        json!({"id": "urn:x:sm:1", "idShort": "Local"}),
        "etag-local",
        json!({"id": "urn:x:sm:1", "idShort": "Remote"}),
        "etag-remote",
    );
    let conflict_id = conflict.id.clone();
    sync.conflict_manager().add_conflict(conflict);

    let resolved = sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::RemotePreferred, "operator")
        .await
        .unwrap();
    assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::RemotePreferred));

    let applied = store.applied.lock();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1["idShort"], "Remote");
    assert_eq!(sync.conflict_manager().unresolved_count(), 0);
}

#[tokio::test]
async fn local_preferred_resolution_leaves_store_untouched() {
    let (sync, store) = harness(FederationSyncConfig::default());
    let conflict = ConflictInfo::new(
        "peer-001",
        "aas",
        "urn:x:aas:1",
        json!({"id": "urn:x:aas:1", "idShort": "Local"}),
        "etag-local",
        json!({"id": "urn:x:aas:1", "idShort": "Remote"}),
        "etag-remote",
    );
    let conflict_id = conflict.id.clone();
    sync.conflict_manager().add_conflict(conflict);

    sync.resolve_conflict(&conflict_id, ResolutionStrategy::LocalPreferred, "operator")
        .await
        .unwrap();
    assert!(store.applied.lock().is_empty());
}

#[tokio::test]
async fn batch_resolution_filters_by_peer() {
    let (sync, _) = harness(FederationSyncConfig::default());
    for peer_id in ["peer-a", "peer-a", "peer-b"] {
        sync.conflict_manager().add_conflict(ConflictInfo::new(
            peer_id,
            "aas",
            format!("urn:x:aas:{peer_id}"),
            json!({"id": "x"}),
            "l",
            json!({"id": "x"}),
            "r",
        ));
    }

    let (resolved, failed) = sync
        .resolve_all_conflicts(ResolutionStrategy::LocalPreferred, Some("peer-a"), "op")
        .await;
    assert_eq!((resolved, failed), (2, 0));
    assert_eq!(sync.conflict_manager().unresolved_count(), 1);
    assert_eq!(sync.conflict_manager().unresolved()[0].peer_id, "peer-b");
}

#[test]
fn last_write_wins_prefers_later_revision_then_etag() {
    let manager = ConflictManager::new();
    let newer_remote = ConflictInfo::new(
        "p",
        "submodel",
        "urn:x:sm:1",
        json!({"id": "x", "administration": {"revision": "2"}}),
        "zzzz",
        json!({"id": "x", "administration": {"revision": "9"}}),
        "aaaa",
    );
    assert_eq!(
        manager.decide(&newer_remote, ResolutionStrategy::LastWriteWins),
        Winner::Remote
    );

    let tied = ConflictInfo::new(
        "p",
        "submodel",
        "urn:x:sm:1",
        json!({"id": "x"}),
        "aaaa",
        json!({"id": "x"}),
        "zzzz",
    );
    assert_eq!(
        manager.decide(&tied, ResolutionStrategy::LastWriteWins),
        Winner::Remote
    );
}

#[test]
fn sync_status_reports_queue_and_conflicts() {
    use titan_aas::federation::ChangeTracker;

    let (sync, _) = harness(FederationSyncConfig {
        topology: SyncTopology::HubSpoke,
        hub_peer_id: Some("hub-001".to_string()),
        delta_sync_enabled: false,
        ..FederationSyncConfig::default()
    });
    sync.track_change("aas", "id1", "create", None, None);
    let status = sync.get_sync_status();
    assert_eq!(status["mode"], "bidirectional");
    assert_eq!(status["topology"], "hubSpoke");
    assert_eq!(status["deltaSyncEnabled"], false);
    assert_eq!(status["pendingChanges"], 1);
    assert_eq!(status["unresolvedConflicts"], 0);
}
