// Asset-link discovery: maps specific asset ids (name/value pairs) to
// shell identifiers, backing the `/lookup` surface.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::instrument;

use crate::error::Result;

/// One asset-id link attached to a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLink {
    pub name: String,
    pub value: String,
}

#[derive(Clone)]
pub struct AssetLinkStore {
    pool: PgPool,
}

impl AssetLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn get_links(&self, aas_identifier: &str) -> Result<Vec<AssetLink>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, value FROM asset_links WHERE aas_identifier = $1 ORDER BY name, value",
        )
        .bind(aas_identifier)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, value)| AssetLink { name, value })
            .collect())
    }

    /// Replace a shell's links with the given set.
    #[instrument(skip(self, links))]
    pub async fn replace_links(
        &self,
        aas_identifier: &str,
        links: &[AssetLink],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM asset_links WHERE aas_identifier = $1")
            .bind(aas_identifier)
            .execute(&mut *tx)
            .await?;
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO asset_links (aas_identifier, name, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (aas_identifier, name, value) DO NOTHING
                "#,
            )
            .bind(aas_identifier)
            .bind(&link.name)
            .bind(&link.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_links(&self, aas_identifier: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM asset_links WHERE aas_identifier = $1")
            .bind(aas_identifier)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Shell identifiers matching ALL supplied asset-link pairs.
    #[instrument(skip(self, links))]
    pub async fn search_shell_ids(&self, links: &[AssetLink], limit: i64) -> Result<Vec<String>> {
        if links.is_empty() {
            return Ok(Vec::new());
        }

        // One EXISTS clause per requested pair; the shell must carry every
        // pair to match.
        let mut sql = String::from("SELECT DISTINCT al.aas_identifier FROM asset_links al WHERE ");
        let mut clauses = Vec::with_capacity(links.len());
        for i in 0..links.len() {
            let name_param = i * 2 + 1;
            let value_param = i * 2 + 2;
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM asset_links x WHERE x.aas_identifier = al.aas_identifier \
                 AND x.name = ${name_param} AND x.value = ${value_param})"
            ));
        }
        sql.push_str(&clauses.join(" AND "));
        sql.push_str(&format!(
            " ORDER BY al.aas_identifier LIMIT ${}",
            links.len() * 2 + 1
        ));

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for link in links {
            query = query.bind(&link.name).bind(&link.value);
        }
        query = query.bind(limit);

        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_link_wire_shape() {
        let link = AssetLink {
            name: "serialNumber".into(),
            value: "SN-0042".into(),
        };
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(json["name"], "serialNumber");
        assert_eq!(json["value"], "SN-0042");
    }
}
