// AASX package records with linear version chains.
//
// The ZIP/XML codec is an external collaborator; what lives here is the
// record store: package metadata, the ids each package carried, and the
// version chain with rollback. A rollback never rewrites history; it
// creates a new head version restoring the target's content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, TitanError};

/// Identifiers a package carried, kept for re-import and cleanup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub shell_ids: Vec<String>,
    pub submodel_ids: Vec<String>,
    pub concept_description_ids: Vec<String>,
}

/// What the external AASX parser hands over after `importFromStream`.
#[derive(Debug, Clone, Default)]
pub struct PackageImport {
    pub shells: Vec<Value>,
    pub submodels: Vec<Value>,
    pub concept_descriptions: Vec<Value>,
    /// Supplementary file names inside the container.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub package_id: String,
    pub filename: String,
    pub storage_uri: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub shell_count: i32,
    pub submodel_count: i32,
    pub concept_description_count: i32,
    #[sqlx(json)]
    pub package_info: PackageInfo,
    pub version: i32,
    pub previous_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub version_comment: Option<String>,
}

/// Fields supplied when registering a new package or version.
#[derive(Debug, Clone)]
pub struct NewPackage {
    pub filename: String,
    pub storage_uri: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub package_info: PackageInfo,
    pub created_by: String,
    pub version_comment: Option<String>,
}

#[derive(Clone)]
pub struct PackageStore {
    pool: PgPool,
}

impl PackageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, package))]
    pub async fn create(&self, package: NewPackage) -> Result<PackageRecord> {
        self.insert(package, 1, None).await
    }

    /// Register a new version on top of an existing package.
    #[instrument(skip(self, package))]
    pub async fn create_version(
        &self,
        previous_package_id: &str,
        package: NewPackage,
    ) -> Result<PackageRecord> {
        let previous = self.get(previous_package_id).await?.ok_or_else(|| {
            TitanError::NotFound {
                what: "Package",
                id: previous_package_id.to_string(),
            }
        })?;
        self.insert(package, previous.version + 1, Some(previous.package_id))
            .await
    }

    async fn insert(
        &self,
        package: NewPackage,
        version: i32,
        previous_version_id: Option<String>,
    ) -> Result<PackageRecord> {
        let package_id = Uuid::new_v4().to_string();
        let record: PackageRecord = sqlx::query_as(
            r#"
            INSERT INTO aasx_packages (
                package_id,
                filename,
                storage_uri,
                size_bytes,
                content_hash,
                shell_count,
                submodel_count,
                concept_description_count,
                package_info,
                version,
                previous_version_id,
                created_by,
                version_comment
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING
                package_id, filename, storage_uri, size_bytes, content_hash,
                shell_count, submodel_count, concept_description_count,
                package_info, version, previous_version_id, created_at,
                created_by, version_comment
            "#,
        )
        .bind(&package_id)
        .bind(&package.filename)
        .bind(&package.storage_uri)
        .bind(package.size_bytes)
        .bind(&package.content_hash)
        .bind(package.package_info.shell_ids.len() as i32)
        .bind(package.package_info.submodel_ids.len() as i32)
        .bind(package.package_info.concept_description_ids.len() as i32)
        .bind(Json(&package.package_info))
        .bind(version)
        .bind(previous_version_id)
        .bind(&package.created_by)
        .bind(&package.version_comment)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, package_id: &str) -> Result<Option<PackageRecord>> {
        let record: Option<PackageRecord> = sqlx::query_as(
            r#"
            SELECT
                package_id, filename, storage_uri, size_bytes, content_hash,
                shell_count, submodel_count, concept_description_count,
                package_info, version, previous_version_id, created_at,
                created_by, version_comment
            FROM aasx_packages
            WHERE package_id = $1
            "#,
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<PackageRecord>> {
        let records: Vec<PackageRecord> = sqlx::query_as(
            r#"
            SELECT
                package_id, filename, storage_uri, size_bytes, content_hash,
                shell_count, submodel_count, concept_description_count,
                package_info, version, previous_version_id, created_at,
                created_by, version_comment
            FROM aasx_packages
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// The version chain for a package head, newest first.
    #[instrument(skip(self))]
    pub async fn version_history(&self, package_id: &str) -> Result<Vec<PackageRecord>> {
        let mut history = Vec::new();
        let mut current = self.get(package_id).await?;
        while let Some(record) = current {
            let previous = record.previous_version_id.clone();
            history.push(record);
            current = match previous {
                Some(previous_id) => self.get(&previous_id).await?,
                None => None,
            };
        }
        Ok(history)
    }

    /// Roll back to an earlier version: creates a new head restoring that
    /// version's content, keeping the chain append-only.
    #[instrument(skip(self))]
    pub async fn rollback(
        &self,
        package_id: &str,
        target_version: i32,
        rolled_back_by: &str,
    ) -> Result<PackageRecord> {
        let head = self.get(package_id).await?.ok_or_else(|| TitanError::NotFound {
            what: "Package",
            id: package_id.to_string(),
        })?;
        let target = self
            .version_history(package_id)
            .await?
            .into_iter()
            .find(|record| record.version == target_version)
            .ok_or_else(|| TitanError::NotFound {
                what: "PackageVersion",
                id: format!("{package_id}@{target_version}"),
            })?;

        self.insert(
            NewPackage {
                filename: target.filename.clone(),
                storage_uri: target.storage_uri.clone(),
                size_bytes: target.size_bytes,
                content_hash: target.content_hash.clone(),
                package_info: target.package_info.clone(),
                created_by: rolled_back_by.to_string(),
                version_comment: Some(format!(
                    "rollback to version {target_version}"
                )),
            },
            head.version + 1,
            Some(head.package_id),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, package_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM aasx_packages WHERE package_id = $1")
            .bind(package_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_info_wire_shape() {
        let info = PackageInfo {
            shell_ids: vec!["urn:x:aas:1".into()],
            submodel_ids: vec!["urn:x:sm:1".into(), "urn:x:sm:2".into()],
            concept_description_ids: vec![],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["shellIds"][0], "urn:x:aas:1");
        assert_eq!(json["submodelIds"].as_array().unwrap().len(), 2);
        assert_eq!(json["conceptDescriptionIds"], serde_json::json!([]));
    }
}
