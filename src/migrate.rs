use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema if it does not exist. Safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Authoritative store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc (
            doc_id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            version INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(project_id, filename, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_chunk (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            page INTEGER NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(doc_id, chunk_index),
            FOREIGN KEY (doc_id) REFERENCES doc(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Which index has acknowledged which chunk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_index_state (
            chunk_id TEXT NOT NULL,
            index_kind TEXT NOT NULL,
            model_version TEXT,
            confirmed_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, index_kind),
            FOREIGN KEY (chunk_id) REFERENCES doc_chunk(chunk_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Outlives its chunks: remove entries are written for deleted chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconcile_backlog (
            chunk_id TEXT NOT NULL,
            index_kind TEXT NOT NULL,
            op TEXT NOT NULL,
            project_id TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, index_kind, op)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model_version TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Keyword index. FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                doc_id UNINDEXED,
                project_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_project_filename ON doc(project_id, filename)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_chunk_doc_id ON doc_chunk(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_project ON chunk_vectors(project_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_backlog_enqueued_at ON reconcile_backlog(enqueued_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
