// Titan-AAS - Asset Administration Shell server core
// Root library module

pub mod cache;
pub mod canonical;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fanout;
pub mod federation;
pub mod ids;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod mqtt;
pub mod observability;
pub mod packages;
pub mod poller;
pub mod projection;
pub mod registry;
pub mod repository;
pub mod services;
pub mod validation;

// Re-export the error type used across every public API
pub use error::{ErrorEnvelope, ErrorMessage, Result, TitanError};

// Re-export the core data model
pub use model::{
    AssetAdministrationShell, ConceptDescription, Reference, Submodel, SubmodelElement,
};

// Re-export identifier and canonicalization helpers
pub use canonical::{canonical_bytes, canonical_bytes_for, generate_etag};
pub use ids::{decode_id_from_b64url, encode_id_to_b64url};

// Re-export the repositories and paging
pub use repository::{
    initialize_schema, AasRepository, ConceptDescriptionRepository, PagedResult,
    SubmodelRepository,
};

// Re-export projection and element operations
pub use projection::{Content, Extent, IdShortPath, Level};

// Re-export the event pipeline
pub use events::{
    EventBus, EventEntity, EventHandler, EventKind, MemoryEventBus, RedisStreamEventBus,
    RepositoryEvent,
};
pub use fanout::{EventFilter, Subscription, SubscriptionManager};

// Re-export services and lifecycle
pub use lifecycle::TitanRuntime;
pub use services::{DocumentService, ElementWriteService, ServiceContext};

// Re-export configuration
pub use config::Settings;

// Re-export logging bootstrap
pub use observability::{init_logging, init_logging_with_level};
