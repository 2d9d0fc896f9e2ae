// Write orchestration: every successful mutation persists, updates the
// cache, emits an event, and feeds the federation change queue, in that
// order, after the storage transaction has committed.
//
// The external HTTP router, the MQTT subscriber and the field poller all
// come through here, so the §3 lifecycle holds no matter which surface
// drove the write.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::instrument;

use crate::cache::{CacheScope, RedisCache};
use crate::canonical::canonical_bytes;
use crate::error::{Result, TitanError};
use crate::events::{EventBus, EventEntity, EventKind, RepositoryEvent};
use crate::federation::ChangeTracker;
use crate::ids::{decode_id_from_b64url, encode_id_to_b64url};
use crate::model::{AssetAdministrationShell, ConceptDescription, Submodel};
use crate::projection::{self, IdShortPath};
use crate::repository::{AasRepository, ConceptDescriptionRepository, SubmodelRepository};

/// Shared handle bundle the services operate on.
#[derive(Clone)]
pub struct ServiceContext {
    pub shells: AasRepository,
    pub submodels: SubmodelRepository,
    pub concept_descriptions: ConceptDescriptionRepository,
    pub cache: Option<Arc<RedisCache>>,
    pub bus: Arc<dyn EventBus>,
    pub change_tracker: Option<Arc<dyn ChangeTracker>>,
}

impl ServiceContext {
    async fn emit(&self, event: RepositoryEvent) {
        // Event loss must not fail the write that already committed.
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!("event publish failed after commit: {e}");
        }
    }

    fn track(&self, entity_type: &str, entity_id: &str, operation: &str, doc: Option<Value>, etag: Option<String>) {
        if let Some(tracker) = &self.change_tracker {
            tracker.track_change(entity_type, entity_id, operation, doc, etag);
        }
    }
}

/// CRUD over whole documents, with the cache write-behind and event flow.
#[derive(Clone)]
pub struct DocumentService {
    ctx: ServiceContext,
}

impl DocumentService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    // -- shells ---------------------------------------------------------------

    /// Cached read; falls through to storage on miss and repopulates.
    #[instrument(skip(self))]
    pub async fn get_shell_bytes(&self, identifier_b64: &str) -> Result<(Bytes, String)> {
        if let Some(cache) = &self.ctx.cache {
            if let Some(hit) = cache.get_doc(CacheScope::Aas, identifier_b64).await {
                return Ok(hit);
            }
        }
        let (doc_bytes, etag) = self
            .ctx
            .shells
            .get_bytes(identifier_b64)
            .await?
            .ok_or_else(|| TitanError::NotFound {
                what: "Aas",
                id: identifier_b64.to_string(),
            })?;
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::Aas, identifier_b64, &doc_bytes, &etag)
                .await;
        }
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self, shell))]
    pub async fn create_shell(&self, shell: &AssetAdministrationShell) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self.ctx.shells.create(shell).await?;
        let identifier_b64 = encode_id_to_b64url(&shell.id);
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::Aas, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Created, EventEntity::Aas, &shell.id)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "aas",
            &shell.id,
            "create",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self, shell))]
    pub async fn update_shell(
        &self,
        identifier: &str,
        shell: &AssetAdministrationShell,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self.ctx.shells.update(identifier, shell, if_match).await?;
        let identifier_b64 = encode_id_to_b64url(identifier);
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::Aas, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Updated, EventEntity::Aas, identifier)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "aas",
            identifier,
            "update",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self))]
    pub async fn delete_shell(&self, identifier: &str) -> Result<bool> {
        let deleted = self.ctx.shells.delete(identifier).await?;
        if deleted {
            let identifier_b64 = encode_id_to_b64url(identifier);
            if let Some(cache) = &self.ctx.cache {
                cache.delete_doc(CacheScope::Aas, &identifier_b64).await;
            }
            self.ctx
                .emit(RepositoryEvent::new(
                    EventKind::Deleted,
                    EventEntity::Aas,
                    identifier,
                ))
                .await;
            self.ctx.track("aas", identifier, "delete", None, None);
        }
        Ok(deleted)
    }

    // -- submodels ------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_submodel_bytes(&self, identifier_b64: &str) -> Result<(Bytes, String)> {
        if let Some(cache) = &self.ctx.cache {
            if let Some(hit) = cache.get_doc(CacheScope::Submodel, identifier_b64).await {
                return Ok(hit);
            }
        }
        let (doc_bytes, etag) = self
            .ctx
            .submodels
            .get_bytes(identifier_b64)
            .await?
            .ok_or_else(|| TitanError::NotFound {
                what: "Submodel",
                id: identifier_b64.to_string(),
            })?;
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::Submodel, identifier_b64, &doc_bytes, &etag)
                .await;
        }
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self, submodel))]
    pub async fn create_submodel(&self, submodel: &Submodel) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self.ctx.submodels.create(submodel).await?;
        let identifier_b64 = encode_id_to_b64url(&submodel.id);
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::Submodel, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Created, EventEntity::Submodel, &submodel.id)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "submodel",
            &submodel.id,
            "create",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    /// Submodel replace: refreshes the doc key and sweeps every element
    /// slice scoped to this submodel.
    #[instrument(skip(self, submodel))]
    pub async fn update_submodel(
        &self,
        identifier: &str,
        submodel: &Submodel,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self
            .ctx
            .submodels
            .update(identifier, submodel, if_match)
            .await?;
        let identifier_b64 = encode_id_to_b64url(identifier);
        if let Some(cache) = &self.ctx.cache {
            cache.invalidate_elements(&identifier_b64).await;
            cache
                .set_doc(CacheScope::Submodel, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Updated, EventEntity::Submodel, identifier)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "submodel",
            identifier,
            "update",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self))]
    pub async fn delete_submodel(&self, identifier: &str) -> Result<bool> {
        let deleted = self.ctx.submodels.delete(identifier).await?;
        if deleted {
            let identifier_b64 = encode_id_to_b64url(identifier);
            if let Some(cache) = &self.ctx.cache {
                cache.invalidate_submodel(&identifier_b64).await;
            }
            self.ctx
                .emit(RepositoryEvent::new(
                    EventKind::Deleted,
                    EventEntity::Submodel,
                    identifier,
                ))
                .await;
            self.ctx.track("submodel", identifier, "delete", None, None);
        }
        Ok(deleted)
    }

    // -- concept descriptions -------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_concept_description_bytes(
        &self,
        identifier_b64: &str,
    ) -> Result<(Bytes, String)> {
        if let Some(cache) = &self.ctx.cache {
            if let Some(hit) = cache
                .get_doc(CacheScope::ConceptDescription, identifier_b64)
                .await
            {
                return Ok(hit);
            }
        }
        let (doc_bytes, etag) = self
            .ctx
            .concept_descriptions
            .get_bytes(identifier_b64)
            .await?
            .ok_or_else(|| TitanError::NotFound {
                what: "ConceptDescription",
                id: identifier_b64.to_string(),
            })?;
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::ConceptDescription, identifier_b64, &doc_bytes, &etag)
                .await;
        }
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self, cd))]
    pub async fn create_concept_description(
        &self,
        cd: &ConceptDescription,
    ) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self.ctx.concept_descriptions.create(cd).await?;
        let identifier_b64 = encode_id_to_b64url(&cd.id);
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::ConceptDescription, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Created, EventEntity::ConceptDescription, &cd.id)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "concept_description",
            &cd.id,
            "create",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self, cd))]
    pub async fn update_concept_description(
        &self,
        identifier: &str,
        cd: &ConceptDescription,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        let (doc_bytes, etag) = self
            .ctx
            .concept_descriptions
            .update(identifier, cd, if_match)
            .await?;
        let identifier_b64 = encode_id_to_b64url(identifier);
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_doc(CacheScope::ConceptDescription, &identifier_b64, &doc_bytes, &etag)
                .await;
        }
        self.ctx
            .emit(
                RepositoryEvent::new(EventKind::Updated, EventEntity::ConceptDescription, identifier)
                    .with_etag(&etag)
                    .with_doc_bytes(doc_bytes.to_vec()),
            )
            .await;
        self.ctx.track(
            "concept_description",
            identifier,
            "update",
            serde_json::from_slice(&doc_bytes).ok(),
            Some(etag.clone()),
        );
        Ok((doc_bytes, etag))
    }

    #[instrument(skip(self))]
    pub async fn delete_concept_description(&self, identifier: &str) -> Result<bool> {
        let deleted = self.ctx.concept_descriptions.delete(identifier).await?;
        if deleted {
            let identifier_b64 = encode_id_to_b64url(identifier);
            if let Some(cache) = &self.ctx.cache {
                cache
                    .delete_doc(CacheScope::ConceptDescription, &identifier_b64)
                    .await;
            }
            self.ctx
                .emit(RepositoryEvent::new(
                    EventKind::Deleted,
                    EventEntity::ConceptDescription,
                    identifier,
                ))
                .await;
            self.ctx
                .track("concept_description", identifier, "delete", None, None);
        }
        Ok(deleted)
    }
}

/// Element-level operations on a submodel's tree: load, transform through
/// the projection engine, re-validate the typed model, persist, invalidate
/// the touched cache slices, emit an element event.
#[derive(Clone)]
pub struct ElementWriteService {
    ctx: ServiceContext,
}

impl ElementWriteService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Value-only update (the MQTT subscriber and field-poller entry point).
    #[instrument(skip(self, value))]
    pub async fn update_value(
        &self,
        submodel_id_b64: &str,
        id_short_path: &str,
        value: &Value,
    ) -> Result<String> {
        let path = IdShortPath::parse(id_short_path)?;
        self.transform(submodel_id_b64, &path, |doc| {
            projection::update_element_value(doc, &path, value)
        })
        .await
    }

    /// Insert a new element; `parent` of `None` targets the submodel root.
    #[instrument(skip(self, element))]
    pub async fn insert(
        &self,
        submodel_id_b64: &str,
        parent: Option<&str>,
        element: Value,
    ) -> Result<String> {
        let parent_path = parent.map(IdShortPath::parse).transpose()?;
        let anchor = parent_path
            .clone()
            .unwrap_or_else(|| IdShortPath::from_tokens(Vec::new()));
        self.transform(submodel_id_b64, &anchor, |doc| {
            projection::insert_element(doc, parent_path.as_ref(), element.clone())
        })
        .await
    }

    #[instrument(skip(self, element))]
    pub async fn replace(
        &self,
        submodel_id_b64: &str,
        id_short_path: &str,
        element: Value,
    ) -> Result<String> {
        let path = IdShortPath::parse(id_short_path)?;
        self.transform(submodel_id_b64, &path, |doc| {
            projection::replace_element(doc, &path, element.clone())
        })
        .await
    }

    #[instrument(skip(self, partial))]
    pub async fn patch(
        &self,
        submodel_id_b64: &str,
        id_short_path: &str,
        partial: &Value,
    ) -> Result<String> {
        let path = IdShortPath::parse(id_short_path)?;
        self.transform(submodel_id_b64, &path, |doc| {
            projection::patch_element(doc, &path, partial)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, submodel_id_b64: &str, id_short_path: &str) -> Result<String> {
        let path = IdShortPath::parse(id_short_path)?;
        self.transform(submodel_id_b64, &path, |doc| {
            projection::delete_element(doc, &path)
        })
        .await
    }

    /// Cached `$value` read of one element.
    #[instrument(skip(self))]
    pub async fn get_value(&self, submodel_id_b64: &str, id_short_path: &str) -> Result<Bytes> {
        let path = IdShortPath::parse(id_short_path)?;
        if let Some(cache) = &self.ctx.cache {
            if let Some(hit) = cache.get_elem_value(submodel_id_b64, id_short_path).await {
                return Ok(hit);
            }
        }
        let (doc_bytes, _etag) = self
            .ctx
            .submodels
            .get_bytes(submodel_id_b64)
            .await?
            .ok_or_else(|| TitanError::NotFound {
                what: "Submodel",
                id: submodel_id_b64.to_string(),
            })?;
        let doc: Value = serde_json::from_slice(&doc_bytes)?;
        let node = projection::navigate(&doc, &path)?;
        let value_bytes = canonical_bytes(&projection::element_value(node));
        if let Some(cache) = &self.ctx.cache {
            cache
                .set_elem_value(submodel_id_b64, id_short_path, &value_bytes)
                .await;
        }
        Ok(Bytes::from(value_bytes))
    }

    /// The shared write pipeline. `apply` mutates the document in place;
    /// everything after it is common to all element operations.
    async fn transform<F>(
        &self,
        submodel_id_b64: &str,
        touched: &IdShortPath,
        apply: F,
    ) -> Result<String>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let identifier = decode_id_from_b64url(submodel_id_b64)?;
        let (doc_bytes, _etag) = self
            .ctx
            .submodels
            .get_bytes(submodel_id_b64)
            .await?
            .ok_or_else(|| TitanError::NotFound {
                what: "Submodel",
                id: identifier.clone(),
            })?;
        let mut doc: Value = serde_json::from_slice(&doc_bytes)?;

        apply(&mut doc)?;

        let submodel: Submodel = serde_json::from_value(doc)
            .map_err(|e| TitanError::BadRequest(format!("transformed submodel is invalid: {e}")))?;
        let (new_bytes, etag) = self.ctx.submodels.update(&identifier, &submodel, None).await?;

        if let Some(cache) = &self.ctx.cache {
            // The element's own slice, every ancestor slice, and the doc key.
            let mut prefix = Vec::new();
            for token in touched.tokens() {
                prefix.push(token.clone());
                let ancestor = IdShortPath::from_tokens(prefix.clone());
                cache
                    .delete_elem_value(submodel_id_b64, &ancestor.to_string())
                    .await;
            }
            cache
                .set_doc(CacheScope::Submodel, submodel_id_b64, &new_bytes, &etag)
                .await;
        }

        let mut event = RepositoryEvent::new(EventKind::Updated, EventEntity::Element, &identifier)
            .with_etag(&etag);
        if !touched.is_empty() {
            event = event.with_path(touched.to_string());
        }
        self.ctx.emit(event).await;
        self.ctx.track(
            "submodel",
            &identifier,
            "update",
            serde_json::from_slice(&new_bytes).ok(),
            Some(etag.clone()),
        );
        Ok(etag)
    }
}
