//! Idempotent schema creation.
//!
//! Content, chunks and embeddings are keyed by content hash; documents map
//! `(collection, path)` onto a hash. `path_contexts` holds folder
//! descriptions and `llm_cache` memoizes expansion and rerank responses.
//! Statements only ever create missing objects, so rerunning against an
//! existing database keeps every row.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            hash TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            pos INTEGER NOT NULL,
            text TEXT NOT NULL,
            PRIMARY KEY (hash, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            path TEXT NOT NULL,
            title TEXT NOT NULL,
            hash TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            deactivated_at INTEGER,
            UNIQUE(collection, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            embedded_at INTEGER NOT NULL,
            PRIMARY KEY (hash, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS path_contexts (
            collection TEXT NOT NULL,
            path TEXT NOT NULL,
            description TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_cache (
            cache_key TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        // rowid mirrors documents.id
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                collection UNINDEXED,
                path UNINDEXED,
                title,
                body,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection_active ON documents(collection, active)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model)")
        .execute(pool)
        .await?;

    Ok(())
}
