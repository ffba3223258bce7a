use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Contract records; analysis and validation are embedded as JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contracts (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            blob_path TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            retention_days INTEGER NOT NULL,
            status TEXT NOT NULL,
            analysis_json TEXT,
            validation_json TEXT,
            failure_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only validation snapshots, one row per version
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validation_records (
            id TEXT NOT NULL,
            version INTEGER NOT NULL,
            contract_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            result_json TEXT NOT NULL,
            elements_json TEXT,
            confidence_score REAL NOT NULL,
            baseline_confidence REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_entries (
            id TEXT PRIMARY KEY,
            validation_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            previous_version INTEGER NOT NULL,
            current_version INTEGER NOT NULL,
            changes_json TEXT NOT NULL DEFAULT '{}',
            reason TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback_entries (
            id TEXT PRIMARY KEY,
            validation_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            feedback_type TEXT NOT NULL,
            rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
            comment TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Knowledge entries form a version chain per entry_id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id TEXT PRIMARY KEY,
            entry_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            category TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL DEFAULT '',
            version INTEGER NOT NULL,
            parent_version_id TEXT,
            is_latest INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(entry_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contracts_owner ON contracts(owner_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_validation_records_contract ON validation_records(contract_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_validation ON audit_entries(validation_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_feedback_validation ON feedback_entries(validation_id)",
    )
    .execute(pool)
    .await?;
    // At most one latest row per logical knowledge entry
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_knowledge_latest ON knowledge_entries(entry_id) WHERE is_latest = 1",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge_entries(category, is_latest)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
