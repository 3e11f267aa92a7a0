use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    create_index_table(&pool, &config.index.tokenizer).await?;
    pool.close().await;
    Ok(())
}

/// Create the key-value table on an open pool.
///
/// The search table is left to [`create_index_table`], which the index
/// calls when it builds, so a bad tokenizer never blocks the records.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Key-value collaborator: token, record id lists, stubs, harvest timestamps
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the FTS5 table backing the search index.
///
/// FTS5 CREATE is not idempotent natively, so we check first.
pub async fn create_index_table(pool: &SqlitePool, tokenizer: &str) -> Result<(), sqlx::Error> {
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='record_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        // Tokenizer is config-controlled, single quotes are escaped for the DDL literal
        let ddl = format!(
            "CREATE VIRTUAL TABLE record_fts USING fts5(key UNINDEXED, text, tokenize = '{}')",
            tokenizer.replace('\'', "''")
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    Ok(())
}
