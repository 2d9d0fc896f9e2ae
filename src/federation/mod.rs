// Federation: peer registry, change queue, sync loop and conflict
// handling for multi-instance deployments.

pub mod conflicts;
pub mod peer;
pub mod sync;

pub use conflicts::{ConflictInfo, ConflictManager, ResolutionStrategy, Winner};
pub use peer::{Peer, PeerCapabilities, PeerRegistry, PeerStatus, PeerStore};
pub use sync::{
    ChangeQueue, ChangeTracker, FederationSync, FederationSyncConfig, RepositorySyncStore,
    SyncChange, SyncMode, SyncResult, SyncStore, SyncSummary, SyncTopology,
};
