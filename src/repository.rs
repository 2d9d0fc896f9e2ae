// Typed document repositories over Postgres.
//
// Fast path: `get_bytes`/`list_paged` serve stored canonical bytes without
// touching the typed model; `list_paged` has Postgres assemble the entire
// paged envelope so no per-row hydration happens in Rust. Slow path:
// `get_model` parses into the typed model for projections and writes.
//
// Writes validate, canonicalize and store doc + doc_bytes + etag in one
// transaction, serialized per identifier by a row-level lock, and hand
// `(bytes, etag)` back so callers can populate the cache and build the
// response without re-reading.

use bytes::Bytes;
use serde_json::Value;
use sqlx::{types::Json, PgPool, Postgres, Transaction};
use tracing::instrument;

use crate::canonical::{canonical_bytes_for, generate_etag};
use crate::error::{Result, TitanError};
use crate::ids::encode_id_to_b64url;
use crate::model::{AssetAdministrationShell, ConceptDescription, ModellingKind, Submodel};
use crate::validation;

/// Result of a paginated query with the response already assembled.
#[derive(Debug, Clone)]
pub struct PagedResult {
    /// Complete JSON envelope, ready to stream.
    pub response_bytes: Bytes,
    /// Cursor for the next page (None when this is the last page).
    pub next_cursor: Option<String>,
    /// Items in this page.
    pub count: usize,
}

impl PagedResult {
    fn empty() -> Self {
        Self {
            response_bytes: Bytes::from_static(br#"{"result":[],"paging_metadata":{"cursor":null}}"#),
            next_cursor: None,
            count: 0,
        }
    }

    /// Extract cursor and count from an envelope Postgres built.
    fn from_envelope(response: String) -> Result<Self> {
        let parsed: Value = serde_json::from_str(&response)
            .map_err(|e| TitanError::Internal(anyhow::anyhow!("bad paging envelope: {e}")))?;
        let next_cursor = parsed
            .pointer("/paging_metadata/cursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        let count = parsed
            .get("result")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        Ok(Self {
            response_bytes: Bytes::from(response),
            next_cursor,
            count,
        })
    }

    /// Assemble the envelope in Rust from already-loaded documents. Only
    /// the slow (in-memory filtered) path uses this.
    pub fn assemble(docs: Vec<Value>, next_cursor: Option<String>) -> Self {
        let count = docs.len();
        let envelope = serde_json::json!({
            "result": docs,
            "paging_metadata": { "cursor": next_cursor },
        });
        Self {
            response_bytes: Bytes::from(
                serde_json::to_vec(&envelope).expect("envelope serializes"),
            ),
            next_cursor,
            count,
        }
    }
}

/// Create all tables and indexes if absent. Called from the composition
/// root on startup; a no-op on an initialized database.
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS aas (
            identifier      TEXT PRIMARY KEY,
            identifier_b64  TEXT NOT NULL UNIQUE,
            doc             JSONB NOT NULL,
            doc_bytes       BYTEA NOT NULL,
            etag            TEXT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS submodels (
            identifier      TEXT PRIMARY KEY,
            identifier_b64  TEXT NOT NULL UNIQUE,
            semantic_id     TEXT,
            kind            TEXT,
            doc             JSONB NOT NULL,
            doc_bytes       BYTEA NOT NULL,
            etag            TEXT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_submodels_semantic_id ON submodels (semantic_id)",
        "CREATE INDEX IF NOT EXISTS idx_submodels_kind ON submodels (kind)",
        r#"
        CREATE TABLE IF NOT EXISTS concept_descriptions (
            identifier      TEXT PRIMARY KEY,
            identifier_b64  TEXT NOT NULL UNIQUE,
            doc             JSONB NOT NULL,
            doc_bytes       BYTEA NOT NULL,
            etag            TEXT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS blob_assets (
            id                   BIGSERIAL PRIMARY KEY,
            submodel_identifier  TEXT NOT NULL,
            id_short_path        TEXT NOT NULL,
            content_type         TEXT NOT NULL,
            storage_uri          TEXT NOT NULL,
            size_bytes           BIGINT NOT NULL DEFAULT 0,
            created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (submodel_identifier, id_short_path)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS aasx_packages (
            package_id                  TEXT PRIMARY KEY,
            filename                    TEXT NOT NULL,
            storage_uri                 TEXT NOT NULL,
            size_bytes                  BIGINT NOT NULL,
            content_hash                TEXT NOT NULL,
            shell_count                 INTEGER NOT NULL DEFAULT 0,
            submodel_count              INTEGER NOT NULL DEFAULT 0,
            concept_description_count   INTEGER NOT NULL DEFAULT 0,
            package_info                JSONB NOT NULL,
            version                     INTEGER NOT NULL DEFAULT 1,
            previous_version_id         TEXT,
            created_at                  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            created_by                  TEXT NOT NULL DEFAULT '',
            version_comment             TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS asset_links (
            id              BIGSERIAL PRIMARY KEY,
            aas_identifier  TEXT NOT NULL,
            name            TEXT NOT NULL,
            value           TEXT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (aas_identifier, name, value)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_asset_links_pair ON asset_links (name, value)",
        r#"
        CREATE TABLE IF NOT EXISTS federation_peers (
            id           TEXT PRIMARY KEY,
            url          TEXT NOT NULL,
            name         TEXT,
            status       TEXT NOT NULL,
            capabilities JSONB NOT NULL,
            last_seen    TIMESTAMPTZ,
            last_sync    TIMESTAMPTZ,
            version      TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS federation_sync_log (
            id          BIGSERIAL PRIMARY KEY,
            peer_id     TEXT NOT NULL,
            status      TEXT NOT NULL,
            pushed      INTEGER NOT NULL DEFAULT 0,
            pulled      INTEGER NOT NULL DEFAULT 0,
            conflicts   INTEGER NOT NULL DEFAULT 0,
            errors      JSONB NOT NULL DEFAULT '[]'::jsonb,
            started_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            duration_ms DOUBLE PRECISION NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS federation_conflicts (
            id                  TEXT PRIMARY KEY,
            peer_id             TEXT NOT NULL,
            entity_type         TEXT NOT NULL,
            entity_id           TEXT NOT NULL,
            local_doc           JSONB NOT NULL,
            local_etag          TEXT NOT NULL,
            remote_doc          JSONB NOT NULL,
            remote_etag         TEXT NOT NULL,
            detected_at         TIMESTAMPTZ NOT NULL,
            resolved_at         TIMESTAMPTZ,
            resolution_strategy TEXT,
            resolved_by         TEXT
        )
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = e {
        db.is_unique_violation()
    } else {
        false
    }
}

fn precondition(expected: &str, current: &str) -> Result<()> {
    // Accept both bare and quoted validators.
    let trim = |s: &str| s.trim_matches('"').to_string();
    if trim(expected) != trim(current) {
        return Err(TitanError::PreconditionFailed {
            expected: trim(expected),
            current: trim(current),
        });
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Asset Administration Shells
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AasRepository {
    pool: PgPool,
}

impl AasRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fast path: stored canonical bytes and etag, no parsing.
    #[instrument(skip(self))]
    pub async fn get_bytes(&self, identifier_b64: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM aas WHERE identifier_b64 = $1",
        )
        .bind(identifier_b64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    #[instrument(skip(self))]
    pub async fn get_bytes_by_id(&self, identifier: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> =
            sqlx::query_as("SELECT doc_bytes, etag FROM aas WHERE identifier = $1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    /// Slow path: typed model for projections and transformations.
    #[instrument(skip(self))]
    pub async fn get_model(&self, identifier_b64: &str) -> Result<Option<AssetAdministrationShell>> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT doc FROM aas WHERE identifier_b64 = $1")
                .bind(identifier_b64)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(Json(doc),)| serde_json::from_value(doc).map_err(TitanError::from))
            .transpose()
    }

    #[instrument(skip(self, shell))]
    pub async fn create(&self, shell: &AssetAdministrationShell) -> Result<(Bytes, String)> {
        validation::validate_shell(shell)?;
        let doc_bytes = canonical_bytes_for(shell)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO aas (identifier, identifier_b64, doc, doc_bytes, etag)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&shell.id)
        .bind(encode_id_to_b64url(&shell.id))
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((Bytes::from(doc_bytes), etag)),
            Err(e) if is_unique_violation(&e) => Err(TitanError::Conflict(format!(
                "shell {} already exists",
                shell.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace an existing shell. `if_match` of `Some` enforces the
    /// optimistic-concurrency precondition under the row lock.
    #[instrument(skip(self, shell))]
    pub async fn update(
        &self,
        identifier: &str,
        shell: &AssetAdministrationShell,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        validation::validate_shell(shell)?;
        if shell.id != identifier {
            return Err(TitanError::BadRequest(format!(
                "body id {} does not match path identifier {identifier}",
                shell.id
            )));
        }
        let doc_bytes = canonical_bytes_for(shell)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let mut tx = self.pool.begin().await?;
        let current = lock_etag(&mut tx, "aas", identifier).await?;
        let Some(current) = current else {
            return Err(TitanError::NotFound {
                what: "Aas",
                id: identifier.to_string(),
            });
        };
        if let Some(expected) = if_match {
            precondition(expected, &current)?;
        }

        sqlx::query(
            r#"
            UPDATE aas
            SET doc = $2, doc_bytes = $3, etag = $4, updated_at = NOW()
            WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((Bytes::from(doc_bytes), etag))
    }

    /// Idempotent delete; also removes the shell's asset links.
    #[instrument(skip(self))]
    pub async fn delete(&self, identifier: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM asset_links WHERE aas_identifier = $1")
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM aas WHERE identifier = $1")
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM aas WHERE identifier = $1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Zero-copy paginated list: Postgres assembles the whole envelope.
    #[instrument(skip(self))]
    pub async fn list_paged(&self, limit: i64, cursor: Option<&str>) -> Result<PagedResult> {
        let response: Option<String> = sqlx::query_scalar(
            r#"
            WITH page AS (
                SELECT doc, created_at
                FROM aas
                WHERE ($2::text IS NULL OR created_at > CAST($2 AS timestamptz))
                ORDER BY created_at
                LIMIT $1
            ),
            next_cursor AS (
                SELECT created_at::text AS cursor
                FROM page
                ORDER BY created_at DESC
                LIMIT 1
            ),
            has_more AS (
                SELECT EXISTS(
                    SELECT 1 FROM aas
                    WHERE created_at > (SELECT MAX(created_at) FROM page)
                ) AS more
            )
            SELECT json_build_object(
                'result', COALESCE((SELECT json_agg(doc) FROM page), '[]'::json),
                'paging_metadata', json_build_object(
                    'cursor', CASE
                        WHEN (SELECT more FROM has_more) THEN (SELECT cursor FROM next_cursor)
                        ELSE NULL
                    END
                )
            )::text AS response
            "#,
        )
        .bind(limit)
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await?;

        match response {
            Some(response) => PagedResult::from_envelope(response),
            None => Ok(PagedResult::empty()),
        }
    }

    /// Slow path for filters the storage engine cannot express: load a
    /// page, filter in memory, rebuild the envelope.
    #[instrument(skip(self))]
    pub async fn list_filtered_by_id_short(
        &self,
        limit: i64,
        cursor: Option<&str>,
        id_short: &str,
    ) -> Result<PagedResult> {
        let rows: Vec<(Json<Value>, String)> = sqlx::query_as(
            r#"
            SELECT doc, created_at::text
            FROM aas
            WHERE ($2::text IS NULL OR created_at > CAST($2 AS timestamptz))
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|(_, created_at)| created_at.clone())
        } else {
            None
        };
        let docs = rows
            .into_iter()
            .map(|(Json(doc), _)| doc)
            .filter(|doc| doc.get("idShort").and_then(Value::as_str) == Some(id_short))
            .collect();
        Ok(PagedResult::assemble(docs, next_cursor))
    }

    #[instrument(skip(self))]
    pub async fn list_all(&self, limit: i64, offset: i64) -> Result<Vec<(Bytes, String)>> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM aas ORDER BY created_at LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc, etag)| (Bytes::from(doc), etag))
            .collect())
    }
}

async fn lock_etag(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    identifier: &str,
) -> Result<Option<String>> {
    // Table names are compile-time constants from this module, never input.
    let sql = format!("SELECT etag FROM {table} WHERE identifier = $1 FOR UPDATE");
    let row: Option<(String,)> = sqlx::query_as(&sql)
        .bind(identifier)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|(etag,)| etag))
}

// -----------------------------------------------------------------------------
// Submodels
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct SubmodelRepository {
    pool: PgPool,
}

impl SubmodelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn get_bytes(&self, identifier_b64: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM submodels WHERE identifier_b64 = $1",
        )
        .bind(identifier_b64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    #[instrument(skip(self))]
    pub async fn get_bytes_by_id(&self, identifier: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> =
            sqlx::query_as("SELECT doc_bytes, etag FROM submodels WHERE identifier = $1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    #[instrument(skip(self))]
    pub async fn get_model(&self, identifier_b64: &str) -> Result<Option<Submodel>> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT doc FROM submodels WHERE identifier_b64 = $1")
                .bind(identifier_b64)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(Json(doc),)| serde_json::from_value(doc).map_err(TitanError::from))
            .transpose()
    }

    #[instrument(skip(self))]
    pub async fn get_model_by_id(&self, identifier: &str) -> Result<Option<Submodel>> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT doc FROM submodels WHERE identifier = $1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(Json(doc),)| serde_json::from_value(doc).map_err(TitanError::from))
            .transpose()
    }

    #[instrument(skip(self, submodel))]
    pub async fn create(&self, submodel: &Submodel) -> Result<(Bytes, String)> {
        validation::validate_submodel(submodel)?;
        let doc_bytes = canonical_bytes_for(submodel)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO submodels (identifier, identifier_b64, semantic_id, kind, doc, doc_bytes, etag)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&submodel.id)
        .bind(encode_id_to_b64url(&submodel.id))
        .bind(semantic_id_column(submodel))
        .bind(kind_column(submodel))
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((Bytes::from(doc_bytes), etag)),
            Err(e) if is_unique_violation(&e) => Err(TitanError::Conflict(format!(
                "submodel {} already exists",
                submodel.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, submodel))]
    pub async fn update(
        &self,
        identifier: &str,
        submodel: &Submodel,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        validation::validate_submodel(submodel)?;
        if submodel.id != identifier {
            return Err(TitanError::BadRequest(format!(
                "body id {} does not match path identifier {identifier}",
                submodel.id
            )));
        }
        let doc_bytes = canonical_bytes_for(submodel)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let mut tx = self.pool.begin().await?;
        let current = lock_etag(&mut tx, "submodels", identifier).await?;
        let Some(current) = current else {
            return Err(TitanError::NotFound {
                what: "Submodel",
                id: identifier.to_string(),
            });
        };
        if let Some(expected) = if_match {
            precondition(expected, &current)?;
        }

        sqlx::query(
            r#"
            UPDATE submodels
            SET semantic_id = $2, kind = $3, doc = $4, doc_bytes = $5, etag = $6,
                updated_at = NOW()
            WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .bind(semantic_id_column(submodel))
        .bind(kind_column(submodel))
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((Bytes::from(doc_bytes), etag))
    }

    /// Idempotent delete, cascading to externalized blob rows.
    #[instrument(skip(self))]
    pub async fn delete(&self, identifier: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blob_assets WHERE submodel_identifier = $1")
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM submodels WHERE identifier = $1")
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM submodels WHERE identifier = $1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    pub async fn find_by_semantic_id(
        &self,
        semantic_id: &str,
        limit: i64,
    ) -> Result<Vec<(Bytes, String)>> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM submodels WHERE semantic_id = $1 LIMIT $2",
        )
        .bind(semantic_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc, etag)| (Bytes::from(doc), etag))
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn find_by_kind(&self, kind: ModellingKind, limit: i64) -> Result<Vec<(Bytes, String)>> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM submodels WHERE kind = $1 LIMIT $2",
        )
        .bind(kind_str(kind))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc, etag)| (Bytes::from(doc), etag))
            .collect())
    }

    /// Zero-copy paginated list with semanticId and kind pushed down into
    /// both the page and the has-more subquery.
    #[instrument(skip(self))]
    pub async fn list_paged(
        &self,
        limit: i64,
        cursor: Option<&str>,
        semantic_id: Option<&str>,
        kind: Option<ModellingKind>,
    ) -> Result<PagedResult> {
        let response: Option<String> = sqlx::query_scalar(
            r#"
            WITH page AS (
                SELECT doc, created_at
                FROM submodels
                WHERE ($2::text IS NULL OR created_at > CAST($2 AS timestamptz))
                  AND ($3::text IS NULL OR semantic_id = $3)
                  AND ($4::text IS NULL OR kind = $4)
                ORDER BY created_at
                LIMIT $1
            ),
            next_cursor AS (
                SELECT created_at::text AS cursor
                FROM page
                ORDER BY created_at DESC
                LIMIT 1
            ),
            has_more AS (
                SELECT EXISTS(
                    SELECT 1 FROM submodels
                    WHERE created_at > (SELECT MAX(created_at) FROM page)
                      AND ($3::text IS NULL OR semantic_id = $3)
                      AND ($4::text IS NULL OR kind = $4)
                ) AS more
            )
            SELECT json_build_object(
                'result', COALESCE((SELECT json_agg(doc) FROM page), '[]'::json),
                'paging_metadata', json_build_object(
                    'cursor', CASE
                        WHEN (SELECT more FROM has_more) THEN (SELECT cursor FROM next_cursor)
                        ELSE NULL
                    END
                )
            )::text AS response
            "#,
        )
        .bind(limit)
        .bind(cursor)
        .bind(semantic_id)
        .bind(kind.map(kind_str))
        .fetch_optional(&self.pool)
        .await?;

        match response {
            Some(response) => PagedResult::from_envelope(response),
            None => Ok(PagedResult::empty()),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_filtered_by_id_short(
        &self,
        limit: i64,
        cursor: Option<&str>,
        id_short: &str,
    ) -> Result<PagedResult> {
        let rows: Vec<(Json<Value>, String)> = sqlx::query_as(
            r#"
            SELECT doc, created_at::text
            FROM submodels
            WHERE ($2::text IS NULL OR created_at > CAST($2 AS timestamptz))
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|(_, created_at)| created_at.clone())
        } else {
            None
        };
        let docs = rows
            .into_iter()
            .map(|(Json(doc), _)| doc)
            .filter(|doc| doc.get("idShort").and_then(Value::as_str) == Some(id_short))
            .collect();
        Ok(PagedResult::assemble(docs, next_cursor))
    }

    #[instrument(skip(self))]
    pub async fn list_all(&self, limit: i64, offset: i64) -> Result<Vec<(Bytes, String)>> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM submodels ORDER BY created_at LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc, etag)| (Bytes::from(doc), etag))
            .collect())
    }
}

fn semantic_id_column(submodel: &Submodel) -> Option<String> {
    submodel
        .semantic_id
        .as_ref()
        .and_then(|r| r.last_key_value())
        .map(str::to_string)
}

fn kind_column(submodel: &Submodel) -> Option<&'static str> {
    submodel.kind.map(kind_str)
}

fn kind_str(kind: ModellingKind) -> &'static str {
    match kind {
        ModellingKind::Instance => "Instance",
        ModellingKind::Template => "Template",
    }
}

// -----------------------------------------------------------------------------
// Concept Descriptions
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConceptDescriptionRepository {
    pool: PgPool,
}

impl ConceptDescriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn get_bytes(&self, identifier_b64: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM concept_descriptions WHERE identifier_b64 = $1",
        )
        .bind(identifier_b64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    #[instrument(skip(self))]
    pub async fn get_bytes_by_id(&self, identifier: &str) -> Result<Option<(Bytes, String)>> {
        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM concept_descriptions WHERE identifier = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(doc, etag)| (Bytes::from(doc), etag)))
    }

    #[instrument(skip(self))]
    pub async fn get_model(&self, identifier_b64: &str) -> Result<Option<ConceptDescription>> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT doc FROM concept_descriptions WHERE identifier_b64 = $1")
                .bind(identifier_b64)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(Json(doc),)| serde_json::from_value(doc).map_err(TitanError::from))
            .transpose()
    }

    #[instrument(skip(self, cd))]
    pub async fn create(&self, cd: &ConceptDescription) -> Result<(Bytes, String)> {
        validation::validate_concept_description(cd)?;
        let doc_bytes = canonical_bytes_for(cd)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO concept_descriptions (identifier, identifier_b64, doc, doc_bytes, etag)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&cd.id)
        .bind(encode_id_to_b64url(&cd.id))
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((Bytes::from(doc_bytes), etag)),
            Err(e) if is_unique_violation(&e) => Err(TitanError::Conflict(format!(
                "concept description {} already exists",
                cd.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, cd))]
    pub async fn update(
        &self,
        identifier: &str,
        cd: &ConceptDescription,
        if_match: Option<&str>,
    ) -> Result<(Bytes, String)> {
        validation::validate_concept_description(cd)?;
        if cd.id != identifier {
            return Err(TitanError::BadRequest(format!(
                "body id {} does not match path identifier {identifier}",
                cd.id
            )));
        }
        let doc_bytes = canonical_bytes_for(cd)?;
        let etag = generate_etag(&doc_bytes);
        let doc: Value = serde_json::from_slice(&doc_bytes)?;

        let mut tx = self.pool.begin().await?;
        let current = lock_etag(&mut tx, "concept_descriptions", identifier).await?;
        let Some(current) = current else {
            return Err(TitanError::NotFound {
                what: "ConceptDescription",
                id: identifier.to_string(),
            });
        };
        if let Some(expected) = if_match {
            precondition(expected, &current)?;
        }

        sqlx::query(
            r#"
            UPDATE concept_descriptions
            SET doc = $2, doc_bytes = $3, etag = $4, updated_at = NOW()
            WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .bind(Json(doc))
        .bind(&doc_bytes)
        .bind(&etag)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((Bytes::from(doc_bytes), etag))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, identifier: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM concept_descriptions WHERE identifier = $1")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM concept_descriptions WHERE identifier = $1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    pub async fn list_paged(&self, limit: i64, cursor: Option<&str>) -> Result<PagedResult> {
        let response: Option<String> = sqlx::query_scalar(
            r#"
            WITH page AS (
                SELECT doc, created_at
                FROM concept_descriptions
                WHERE ($2::text IS NULL OR created_at > CAST($2 AS timestamptz))
                ORDER BY created_at
                LIMIT $1
            ),
            next_cursor AS (
                SELECT created_at::text AS cursor
                FROM page
                ORDER BY created_at DESC
                LIMIT 1
            ),
            has_more AS (
                SELECT EXISTS(
                    SELECT 1 FROM concept_descriptions
                    WHERE created_at > (SELECT MAX(created_at) FROM page)
                ) AS more
            )
            SELECT json_build_object(
                'result', COALESCE((SELECT json_agg(doc) FROM page), '[]'::json),
                'paging_metadata', json_build_object(
                    'cursor', CASE
                        WHEN (SELECT more FROM has_more) THEN (SELECT cursor FROM next_cursor)
                        ELSE NULL
                    END
                )
            )::text AS response
            "#,
        )
        .bind(limit)
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await?;

        match response {
            Some(response) => PagedResult::from_envelope(response),
            None => Ok(PagedResult::empty()),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_all(&self, limit: i64, offset: i64) -> Result<Vec<(Bytes, String)>> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT doc_bytes, etag FROM concept_descriptions ORDER BY created_at LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc, etag)| (Bytes::from(doc), etag))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parsing() {
        let result = PagedResult::from_envelope(
            r#"{"result":[{"id":"a"},{"id":"b"}],"paging_metadata":{"cursor":"2026-01-01"}}"#
                .to_string(),
        )
        .unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.next_cursor.as_deref(), Some("2026-01-01"));

        let last = PagedResult::from_envelope(
            r#"{"result":[{"id":"c"}],"paging_metadata":{"cursor":null}}"#.to_string(),
        )
        .unwrap();
        assert_eq!(last.count, 1);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn test_envelope_assembly() {
        let result = PagedResult::assemble(vec![json!({"id": "a"})], Some("c1".to_string()));
        assert_eq!(result.count, 1);
        let parsed: Value = serde_json::from_slice(&result.response_bytes).unwrap();
        assert_eq!(parsed["result"][0]["id"], "a");
        assert_eq!(parsed["paging_metadata"]["cursor"], "c1");
    }

    #[test]
    fn test_empty_envelope_shape() {
        let empty = PagedResult::empty();
        let parsed: Value = serde_json::from_slice(&empty.response_bytes).unwrap();
        assert_eq!(parsed["result"], json!([]));
        assert_eq!(parsed["paging_metadata"]["cursor"], Value::Null);
    }

    #[test]
    fn test_precondition_trims_quotes() {
        assert!(precondition("\"abc\"", "abc").is_ok());
        assert!(precondition("abc", "abc").is_ok());
        assert!(matches!(
            precondition("\"abc\"", "def"),
            Err(TitanError::PreconditionFailed { .. })
        ));
    }

    #[test]
    fn test_semantic_id_column_uses_last_key() {
        let submodel: Submodel = serde_json::from_value(json!({
            "id": "urn:x:sm:1",
            "semanticId": {
                "type": "ExternalReference",
                "keys": [
                    {"type": "GlobalReference", "value": "urn:outer"},
                    {"type": "GlobalReference", "value": "urn:sem:battery"}
                ]
            }
        }))
        .unwrap();
        assert_eq!(
            semantic_id_column(&submodel).as_deref(),
            Some("urn:sem:battery")
        );
    }
}
