//! Upload history.
//!
//! One row per successful upload. The orchestrator checks it before every
//! upload so that a folder retried after a partial failure does not push the
//! same file twice; operators read and prune it through the CLI and the admin
//! API.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::UploadRecord;

const COLUMNS: &str = "id, knowledge_id, knowledge_name, file_name, created_at";

#[derive(Clone)]
pub struct UploadLedger {
    pool: SqlitePool,
}

impl UploadLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn was_uploaded(&self, knowledge_id: &str, file_key: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM upload_record WHERE knowledge_id = ? AND file_name = ?",
        )
        .bind(knowledge_id)
        .bind(file_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    /// Appends a record and returns its id.
    pub async fn record(
        &self,
        knowledge_id: &str,
        knowledge_name: &str,
        file_name: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO upload_record (knowledge_id, knowledge_name, file_name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(knowledge_id)
        .bind(knowledge_name)
        .bind(file_name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<UploadRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM upload_record WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    pub async fn by_knowledge_base(&self, knowledge_id: &str) -> Result<Vec<UploadRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_record WHERE knowledge_id = ? ORDER BY id ASC",
            COLUMNS
        ))
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Records whose file name contains `fragment`.
    pub async fn search_file_name(&self, fragment: &str) -> Result<Vec<UploadRecord>> {
        // instr() keeps `%` and `_` in the fragment literal.
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_record WHERE instr(file_name, ?) > 0 ORDER BY id ASC",
            COLUMNS
        ))
        .bind(fragment)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn count_by_knowledge_base(&self, knowledge_id: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_record WHERE knowledge_id = ?")
                .bind(knowledge_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    /// Deletes a record; returns whether a row was removed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_record WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> UploadRecord {
    UploadRecord {
        id: row.get("id"),
        knowledge_id: row.get("knowledge_id"),
        knowledge_name: row.get("knowledge_name"),
        file_name: row.get("file_name"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn ledger(tmp: &TempDir) -> UploadLedger {
        let pool = db::open(&tmp.path().join("kb.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        UploadLedger::new(pool)
    }

    #[tokio::test]
    async fn test_was_uploaded_after_record() {
        let tmp = TempDir::new().unwrap();
        let l = ledger(&tmp).await;
        assert!(!l.was_uploaded("kb-1", "/in/a.txt").await.unwrap());
        l.record("kb-1", "2024年03月", "/in/a.txt").await.unwrap();
        assert!(l.was_uploaded("kb-1", "/in/a.txt").await.unwrap());
        assert!(!l.was_uploaded("kb-2", "/in/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_queries_and_delete() {
        let tmp = TempDir::new().unwrap();
        let l = ledger(&tmp).await;
        let a = l.record("kb-1", "g", "/in/2024/03/a.txt").await.unwrap();
        l.record("kb-1", "g", "/in/2024/03/b.txt").await.unwrap();
        l.record("kb-2", "h", "/in/2024/04/c_100%.txt").await.unwrap();

        assert_eq!(l.count_by_knowledge_base("kb-1").await.unwrap(), 2);
        assert_eq!(l.by_knowledge_base("kb-2").await.unwrap().len(), 1);
        assert_eq!(l.search_file_name("2024/03").await.unwrap().len(), 2);
        assert_eq!(l.search_file_name("100%").await.unwrap().len(), 1);
        assert_eq!(l.search_file_name("%").await.unwrap().len(), 1);

        let rec = l.get(a).await.unwrap().unwrap();
        assert_eq!(rec.file_name, "/in/2024/03/a.txt");
        assert!(l.delete(a).await.unwrap());
        assert!(!l.delete(a).await.unwrap());
        assert!(l.get(a).await.unwrap().is_none());
    }
}
