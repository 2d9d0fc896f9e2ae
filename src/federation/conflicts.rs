// Conflict records and resolution strategies.
//
// A conflict is recorded when a pull finds the same identifier with
// diverged ETags on both sides. It stays in the unresolved list until a
// resolution call names a strategy; the winning document is applied by
// `FederationSync`, which owns the store handle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    LastWriteWins,
    LocalPreferred,
    RemotePreferred,
}

/// Which side a strategy picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub id: String,
    pub peer_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_doc: Value,
    pub local_etag: String,
    pub remote_doc: Value,
    pub remote_etag: String,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl ConflictInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        local_doc: Value,
        local_etag: impl Into<String>,
        remote_doc: Value,
        remote_etag: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer_id: peer_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            local_doc,
            local_etag: local_etag.into(),
            remote_doc,
            remote_etag: remote_etag.into(),
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_strategy: None,
            resolved_by: None,
        }
    }
}

/// Revision marker used by last-write-wins: `administration.revision`
/// parsed numerically when present, falling back to the document's
/// `updatedAt` timestamp text.
fn revision_marker(doc: &Value) -> (i64, String) {
    let revision = doc
        .pointer("/administration/revision")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(-1);
    let updated_at = doc
        .get("updatedAt")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    (revision, updated_at)
}

#[derive(Default)]
pub struct ConflictManager {
    unresolved: Mutex<Vec<ConflictInfo>>,
    resolved: Mutex<Vec<ConflictInfo>>,
}

impl ConflictManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_conflict(&self, conflict: ConflictInfo) {
        self.unresolved.lock().push(conflict);
    }

    pub fn get(&self, conflict_id: &str) -> Option<ConflictInfo> {
        self.unresolved
            .lock()
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
    }

    pub fn unresolved(&self) -> Vec<ConflictInfo> {
        self.unresolved.lock().clone()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.lock().len()
    }

    pub fn resolved(&self) -> Vec<ConflictInfo> {
        self.resolved.lock().clone()
    }

    /// Decide which side wins under the given strategy.
    pub fn decide(&self, conflict: &ConflictInfo, strategy: ResolutionStrategy) -> Winner {
        match strategy {
            ResolutionStrategy::LocalPreferred => Winner::Local,
            ResolutionStrategy::RemotePreferred => Winner::Remote,
            ResolutionStrategy::LastWriteWins => {
                let local = revision_marker(&conflict.local_doc);
                let remote = revision_marker(&conflict.remote_doc);
                match remote.cmp(&local) {
                    std::cmp::Ordering::Greater => Winner::Remote,
                    std::cmp::Ordering::Less => Winner::Local,
                    // Full tie: the lexicographically higher ETag wins, so
                    // every instance picks the same side.
                    std::cmp::Ordering::Equal => {
                        if conflict.remote_etag > conflict.local_etag {
                            Winner::Remote
                        } else {
                            Winner::Local
                        }
                    }
                }
            }
        }
    }

    /// Move a conflict to the resolved list, recording how it was settled.
    pub fn mark_resolved(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Option<ConflictInfo> {
        let mut unresolved = self.unresolved.lock();
        let position = unresolved.iter().position(|c| c.id == conflict_id)?;
        let mut conflict = unresolved.remove(position);
        conflict.resolved_at = Some(Utc::now());
        conflict.resolution_strategy = Some(strategy);
        conflict.resolved_by = Some(resolved_by.to_string());
        self.resolved.lock().push(conflict.clone());
        Some(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict(local_doc: Value, remote_doc: Value) -> ConflictInfo {
        ConflictInfo::new(
            "peer-001",
            "submodel",
            "urn:x:sm:1",
            local_doc,
            "aaaa",
            remote_doc,
            "bbbb",
        )
    }

    #[test]
    fn test_fixed_strategies() {
        let manager = ConflictManager::new();
        let c = conflict(json!({"id": "x"}), json!({"id": "x"}));
        assert_eq!(manager.decide(&c, ResolutionStrategy::LocalPreferred), Winner::Local);
        assert_eq!(
            manager.decide(&c, ResolutionStrategy::RemotePreferred),
            Winner::Remote
        );
    }

    #[test]
    fn test_last_write_wins_by_revision() {
        let manager = ConflictManager::new();
        let c = conflict(
            json!({"id": "x", "administration": {"revision": "3"}}),
            json!({"id": "x", "administration": {"revision": "5"}}),
        );
        assert_eq!(manager.decide(&c, ResolutionStrategy::LastWriteWins), Winner::Remote);

        let c = conflict(
            json!({"id": "x", "administration": {"revision": "7"}}),
            json!({"id": "x", "administration": {"revision": "5"}}),
        );
        assert_eq!(manager.decide(&c, ResolutionStrategy::LastWriteWins), Winner::Local);
    }

    #[test]
    fn test_last_write_wins_tie_break_by_etag() {
        let manager = ConflictManager::new();
        // Equal revisions, remote etag "bbbb" > local "aaaa".
        let c = conflict(
            json!({"id": "x", "administration": {"revision": "1"}}),
            json!({"id": "x", "administration": {"revision": "1"}}),
        );
        assert_eq!(manager.decide(&c, ResolutionStrategy::LastWriteWins), Winner::Remote);
    }

    #[test]
    fn test_resolution_lifecycle() {
        let manager = ConflictManager::new();
        let c = conflict(json!({"id": "x"}), json!({"id": "x"}));
        let id = c.id.clone();
        manager.add_conflict(c);
        assert_eq!(manager.unresolved_count(), 1);

        let resolved = manager
            .mark_resolved(&id, ResolutionStrategy::RemotePreferred, "operator")
            .unwrap();
        assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::RemotePreferred));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(manager.unresolved_count(), 0);
        assert_eq!(manager.resolved().len(), 1);

        assert!(manager.mark_resolved(&id, ResolutionStrategy::LocalPreferred, "x").is_none());
    }
}
