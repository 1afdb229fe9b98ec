use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the schema if it does not exist yet. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            source_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL DEFAULT '',
            total_words INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawled_pages (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            chunk_number INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            source_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(url, chunk_number),
            FOREIGN KEY (source_id) REFERENCES sources(source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_examples (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            chunk_number INTEGER NOT NULL,
            content TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            source_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(url, chunk_number),
            FOREIGN KEY (source_id) REFERENCES sources(source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    if !table_exists(pool, "crawled_pages_fts").await? {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE crawled_pages_fts USING fts5(
                row_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }
    if !table_exists(pool, "code_examples_fts").await? {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE code_examples_fts USING fts5(
                row_id UNINDEXED,
                content,
                summary
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawled_pages_source ON crawled_pages(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawled_pages_url ON crawled_pages(url)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_code_examples_source ON code_examples(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_code_examples_url ON code_examples(url)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}
