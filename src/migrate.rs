use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the bookkeeping tables on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Logical group name -> remote knowledge base. Names are not unique;
    // lookups take the lowest id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS name_relation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            knowledge_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_record (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            knowledge_id TEXT NOT NULL,
            knowledge_name TEXT NOT NULL,
            file_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_name_relation_name ON name_relation(name)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_upload_record_kb_file ON upload_record(knowledge_id, file_name)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
