// Redis document cache fronting the repositories.
//
// Two keyspaces: whole-document bytes+etag per entity, and element-value
// slices per (submodel, idShortPath). Every operation is best-effort: a
// cache failure is logged and the caller falls through to storage; it
// never fails the primary path.

use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

/// Document keyspace prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    Aas,
    Submodel,
    ConceptDescription,
}

impl CacheScope {
    fn prefix(&self) -> &'static str {
        match self {
            CacheScope::Aas => "aas",
            CacheScope::Submodel => "submodel",
            CacheScope::ConceptDescription => "cd",
        }
    }
}

#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
    doc_ttl_seconds: u64,
    element_ttl_seconds: u64,
}

impl RedisCache {
    pub fn new(redis: ConnectionManager, doc_ttl_seconds: u64) -> Self {
        Self {
            redis,
            doc_ttl_seconds,
            // Element slices churn faster than whole documents.
            element_ttl_seconds: doc_ttl_seconds.min(60),
        }
    }

    fn doc_key(scope: CacheScope, identifier_b64: &str) -> String {
        format!("{}:{}", scope.prefix(), identifier_b64)
    }

    fn elem_key(submodel_id_b64: &str, id_short_path: &str) -> String {
        format!("elem:{submodel_id_b64}:{id_short_path}")
    }

    /// Cached document bytes and etag, or a miss.
    pub async fn get_doc(
        &self,
        scope: CacheScope,
        identifier_b64: &str,
    ) -> Option<(Bytes, String)> {
        let key = Self::doc_key(scope, identifier_b64);
        let mut redis = self.redis.clone();
        let fetched: redis::RedisResult<(Option<Vec<u8>>, Option<String>)> =
            redis.hget(&key, &["doc", "etag"]).await;
        match fetched {
            Ok((Some(doc), Some(etag))) => {
                debug!(key, "cache hit");
                Some((Bytes::from(doc), etag))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(key, "cache read failed: {e}");
                None
            }
        }
    }

    pub async fn set_doc(
        &self,
        scope: CacheScope,
        identifier_b64: &str,
        doc_bytes: &[u8],
        etag: &str,
    ) {
        let key = Self::doc_key(scope, identifier_b64);
        let mut redis = self.redis.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .hset(&key, "doc", doc_bytes)
            .ignore()
            .hset(&key, "etag", etag)
            .ignore()
            .expire(&key, self.doc_ttl_seconds as i64)
            .ignore()
            .query_async(&mut redis)
            .await;
        if let Err(e) = result {
            warn!(key, "cache write failed: {e}");
        }
    }

    pub async fn delete_doc(&self, scope: CacheScope, identifier_b64: &str) {
        let key = Self::doc_key(scope, identifier_b64);
        let mut redis = self.redis.clone();
        let result: redis::RedisResult<usize> = redis.del(&key).await;
        if let Err(e) = result {
            warn!(key, "cache delete failed: {e}");
        }
    }

    pub async fn get_elem_value(
        &self,
        submodel_id_b64: &str,
        id_short_path: &str,
    ) -> Option<Bytes> {
        let key = Self::elem_key(submodel_id_b64, id_short_path);
        let mut redis = self.redis.clone();
        let fetched: redis::RedisResult<Option<Vec<u8>>> = redis.get(&key).await;
        match fetched {
            Ok(Some(bytes)) => Some(Bytes::from(bytes)),
            Ok(None) => None,
            Err(e) => {
                warn!(key, "cache read failed: {e}");
                None
            }
        }
    }

    pub async fn set_elem_value(
        &self,
        submodel_id_b64: &str,
        id_short_path: &str,
        value_bytes: &[u8],
    ) {
        let key = Self::elem_key(submodel_id_b64, id_short_path);
        let mut redis = self.redis.clone();
        let result: redis::RedisResult<()> = redis
            .set_ex(&key, value_bytes, self.element_ttl_seconds)
            .await;
        if let Err(e) = result {
            warn!(key, "cache write failed: {e}");
        }
    }

    pub async fn delete_elem_value(&self, submodel_id_b64: &str, id_short_path: &str) {
        let key = Self::elem_key(submodel_id_b64, id_short_path);
        let mut redis = self.redis.clone();
        let result: redis::RedisResult<usize> = redis.del(&key).await;
        if let Err(e) = result {
            warn!(key, "cache delete failed: {e}");
        }
    }

    /// Pattern-delete every element-value slice of a submodel. Used on any
    /// submodel-level write and on delete.
    pub async fn invalidate_elements(&self, submodel_id_b64: &str) {
        let pattern = format!("elem:{submodel_id_b64}:*");
        let mut redis = self.redis.clone();

        let mut cursor: u64 = 0;
        loop {
            let scanned: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut redis)
                .await;
            match scanned {
                Ok((next, keys)) => {
                    if !keys.is_empty() {
                        let deleted: redis::RedisResult<usize> = redis.del(&keys).await;
                        if let Err(e) = deleted {
                            warn!(pattern, "cache sweep delete failed: {e}");
                            return;
                        }
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(e) => {
                    warn!(pattern, "cache sweep scan failed: {e}");
                    return;
                }
            }
        }
    }

    /// Full invalidation for one submodel write: its doc key plus every
    /// element slice scoped to it.
    pub async fn invalidate_submodel(&self, identifier_b64: &str) {
        self.delete_doc(CacheScope::Submodel, identifier_b64).await;
        self.invalidate_elements(identifier_b64).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(RedisCache::doc_key(CacheScope::Aas, "dXJu"), "aas:dXJu");
        assert_eq!(
            RedisCache::doc_key(CacheScope::ConceptDescription, "dXJu"),
            "cd:dXJu"
        );
        assert_eq!(
            RedisCache::elem_key("dXJu", "Stack[0].Temperature"),
            "elem:dXJu:Stack[0].Temperature"
        );
    }
}
