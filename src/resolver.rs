//! Logical group name → remote knowledge-base id.
//!
//! Rows are append-only. The same name may end up with several rows (for
//! example after a manual insert); [`NameResolver::resolve`] always answers
//! with the earliest one.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::NameRelation;

#[derive(Clone)]
pub struct NameResolver {
    pool: SqlitePool,
}

impl NameResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Knowledge-base id of the earliest row named `name`, if any.
    pub async fn resolve(&self, name: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT knowledge_id FROM name_relation WHERE name = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref kb) = id {
            tracing::debug!(name, knowledge_id = %kb, "resolved knowledge base");
        }
        Ok(id)
    }

    /// Appends a mapping. Empty names or ids are ignored.
    pub async fn record(&self, name: &str, knowledge_id: &str) -> Result<()> {
        if name.is_empty() || knowledge_id.is_empty() {
            return Ok(());
        }
        sqlx::query("INSERT INTO name_relation (name, knowledge_id, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(knowledge_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        tracing::info!(name, knowledge_id, "saved knowledge base mapping");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<NameRelation>> {
        let rows = sqlx::query(
            "SELECT id, name, knowledge_id, created_at FROM name_relation ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_relation).collect())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Vec<NameRelation>> {
        let rows = sqlx::query(
            "SELECT id, name, knowledge_id, created_at FROM name_relation WHERE name = ? ORDER BY id ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_relation).collect())
    }
}

fn row_to_relation(row: &sqlx::sqlite::SqliteRow) -> NameRelation {
    NameRelation {
        id: row.get("id"),
        name: row.get("name"),
        knowledge_id: row.get("knowledge_id"),
        created_at: row.get("created_at"),
    }
}
