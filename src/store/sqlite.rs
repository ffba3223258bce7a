//! SQLite-backed implementation of the repository traits.
//!
//! Timestamps are stored as Unix milliseconds. Embedded sub-records
//! (analysis, validation, element results, audit changes, tags) are JSON
//! text columns. The schema lives in [`crate::migrate`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    AuditEntry, ContractRecord, FeedbackEntry, KnowledgeEntry, KnowledgeInput, ValidationRecord,
};

use super::{
    rank_knowledge, AuditStore, ContractStore, FeedbackStore, KnowledgeStore,
    ValidationRecordStore,
};

/// SQLite implementation of every repository trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("encoding JSON column")
}

fn opt_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("decoding column {}", column))
}

fn contract_from_row(row: &SqliteRow) -> Result<ContractRecord> {
    let status: String = row.get("status");
    let analysis: Option<String> = row.get("analysis_json");
    let validation: Option<String> = row.get("validation_json");
    let retention_days: i64 = row.get("retention_days");
    Ok(ContractRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        original_filename: row.get("original_filename"),
        mime_type: row.get("mime_type"),
        blob_path: row.get("blob_path"),
        created_at: from_millis(row.get("created_at")),
        retention_days: u32::try_from(retention_days).unwrap_or(0),
        status: status.parse().map_err(anyhow::Error::msg)?,
        analysis: analysis
            .as_deref()
            .map(|raw| from_json(raw, "analysis_json"))
            .transpose()?,
        validation: validation
            .as_deref()
            .map(|raw| from_json(raw, "validation_json"))
            .transpose()?,
        failure_reason: row.get("failure_reason"),
    })
}

fn validation_from_row(row: &SqliteRow) -> Result<ValidationRecord> {
    let result: String = row.get("result_json");
    let elements: Option<String> = row.get("elements_json");
    let version: i64 = row.get("version");
    Ok(ValidationRecord {
        id: row.get("id"),
        contract_id: row.get("contract_id"),
        owner_id: row.get("owner_id"),
        result: from_json(&result, "result_json")?,
        elements: elements
            .as_deref()
            .map(|raw| from_json(raw, "elements_json"))
            .transpose()?,
        confidence_score: row.get("confidence_score"),
        baseline_confidence: row.get("baseline_confidence"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        version: u32::try_from(version).context("negative validation version")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let action: String = row.get("action");
    let changes: String = row.get("changes_json");
    let previous: i64 = row.get("previous_version");
    let current: i64 = row.get("current_version");
    Ok(AuditEntry {
        id: row.get("id"),
        validation_id: row.get("validation_id"),
        actor_id: row.get("actor_id"),
        action: action.parse().map_err(anyhow::Error::msg)?,
        previous_version: u32::try_from(previous).unwrap_or(0),
        current_version: u32::try_from(current).unwrap_or(0),
        changes: from_json(&changes, "changes_json")?,
        reason: row.get("reason"),
        created_at: from_millis(row.get("created_at")),
    })
}

fn feedback_from_row(row: &SqliteRow) -> Result<FeedbackEntry> {
    let feedback_type: String = row.get("feedback_type");
    let rating: i64 = row.get("rating");
    Ok(FeedbackEntry {
        id: row.get("id"),
        validation_id: row.get("validation_id"),
        actor_id: row.get("actor_id"),
        feedback_type: feedback_type.parse().map_err(anyhow::Error::msg)?,
        rating: u8::try_from(rating).context("rating out of range")?,
        comment: row.get("comment"),
        created_at: from_millis(row.get("created_at")),
    })
}

fn knowledge_from_row(row: &SqliteRow) -> Result<KnowledgeEntry> {
    let tags: String = row.get("tags_json");
    let version: i64 = row.get("version");
    let is_latest: i64 = row.get("is_latest");
    Ok(KnowledgeEntry {
        id: row.get("id"),
        entry_id: row.get("entry_id"),
        title: row.get("title"),
        content: row.get("content"),
        category: row.get("category"),
        tags: from_json(&tags, "tags_json")?,
        source: row.get("source"),
        version: u32::try_from(version).context("negative knowledge version")?,
        parent_version_id: row.get("parent_version_id"),
        is_latest: is_latest != 0,
        created_at: from_millis(row.get("created_at")),
    })
}

#[async_trait]
impl ContractStore for SqliteStore {
    async fn insert_contract(&self, record: &ContractRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contracts (id, owner_id, original_filename, mime_type, blob_path,
                                   created_at, retention_days, status, analysis_json,
                                   validation_json, failure_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.original_filename)
        .bind(&record.mime_type)
        .bind(&record.blob_path)
        .bind(to_millis(record.created_at))
        .bind(i64::from(record.retention_days))
        .bind(record.status.as_str())
        .bind(opt_json(record.analysis.as_ref())?)
        .bind(opt_json(record.validation.as_ref())?)
        .bind(&record.failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_contract(&self, record: &ContractRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE contracts
            SET status = ?, analysis_json = ?, validation_json = ?, failure_reason = ?,
                retention_days = ?, blob_path = ?
            WHERE id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(opt_json(record.analysis.as_ref())?)
        .bind(opt_json(record.validation.as_ref())?)
        .bind(&record.failure_reason)
        .bind(i64::from(record.retention_days))
        .bind(&record.blob_path)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("contract {} not found", record.id);
        }
        Ok(())
    }

    async fn get_contract(&self, id: &str) -> Result<Option<ContractRecord>> {
        let row = sqlx::query("SELECT * FROM contracts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(contract_from_row).transpose()
    }

    async fn delete_contract(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM contracts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContractRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM contracts
            WHERE created_at + retention_days * 86400000 <= ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contract_from_row).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ValidationRecordStore for SqliteStore {
    async fn append_validation(&self, record: &ValidationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO validation_records (id, version, contract_id, owner_id, result_json,
                                            elements_json, confidence_score, baseline_confidence,
                                            created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(i64::from(record.version))
        .bind(&record.contract_id)
        .bind(&record.owner_id)
        .bind(to_json(&record.result)?)
        .bind(opt_json(record.elements.as_ref())?)
        .bind(record.confidence_score)
        .bind(record.baseline_confidence)
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "appending validation {} version {}",
                record.id, record.version
            )
        })?;
        Ok(())
    }

    async fn latest_validation(&self, id: &str) -> Result<Option<ValidationRecord>> {
        let row = sqlx::query(
            "SELECT * FROM validation_records WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(validation_from_row).transpose()
    }

    async fn latest_for_contract(&self, contract_id: &str) -> Result<Option<ValidationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM validation_records
            WHERE contract_id = ?
            ORDER BY created_at DESC, version DESC
            LIMIT 1
            "#,
        )
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(validation_from_row).transpose()
    }

    async fn validation_history(&self, id: &str) -> Result<Vec<ValidationRecord>> {
        let rows = sqlx::query("SELECT * FROM validation_records WHERE id = ? ORDER BY version ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(validation_from_row).collect()
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (id, validation_id, actor_id, action, previous_version,
                                       current_version, changes_json, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.validation_id)
        .bind(&entry.actor_id)
        .bind(entry.action.as_str())
        .bind(i64::from(entry.previous_version))
        .bind(i64::from(entry.current_version))
        .bind(to_json(&entry.changes)?)
        .bind(&entry.reason)
        .bind(to_millis(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_for(&self, validation_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_entries
            WHERE validation_id = ?
            ORDER BY created_at ASC, current_version ASC
            "#,
        )
        .bind(validation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[async_trait]
impl FeedbackStore for SqliteStore {
    async fn add_feedback(&self, entry: &FeedbackEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feedback_entries (id, validation_id, actor_id, feedback_type, rating,
                                          comment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.validation_id)
        .bind(&entry.actor_id)
        .bind(entry.feedback_type.as_str())
        .bind(i64::from(entry.rating))
        .bind(&entry.comment)
        .bind(to_millis(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn feedback_for(&self, validation_id: &str) -> Result<Vec<FeedbackEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM feedback_entries WHERE validation_id = ? ORDER BY created_at ASC",
        )
        .bind(validation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(feedback_from_row).collect()
    }
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert_knowledge(&self, input: KnowledgeInput) -> Result<KnowledgeEntry> {
        let mut tx = self.pool.begin().await?;

        let previous = match input.entry_id.as_deref() {
            Some(entry_id) => sqlx::query(
                "SELECT * FROM knowledge_entries WHERE entry_id = ? AND is_latest = 1",
            )
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(knowledge_from_row)
            .transpose()?,
            None => None,
        };

        let entry = KnowledgeEntry::next_version(previous.as_ref(), input);

        if let Some(prev) = &previous {
            sqlx::query("UPDATE knowledge_entries SET is_latest = 0 WHERE id = ?")
                .bind(&prev.id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO knowledge_entries (id, entry_id, title, content, category, tags_json,
                                           source, version, parent_version_id, is_latest,
                                           created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.entry_id)
        .bind(&entry.title)
        .bind(&entry.content)
        .bind(&entry.category)
        .bind(to_json(&entry.tags)?)
        .bind(&entry.source)
        .bind(i64::from(entry.version))
        .bind(&entry.parent_version_id)
        .bind(to_millis(entry.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn get_knowledge(&self, entry_id: &str) -> Result<Option<KnowledgeEntry>> {
        let row =
            sqlx::query("SELECT * FROM knowledge_entries WHERE entry_id = ? AND is_latest = 1")
                .bind(entry_id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(knowledge_from_row).transpose()
    }

    async fn knowledge_history(&self, entry_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let rows =
            sqlx::query("SELECT * FROM knowledge_entries WHERE entry_id = ? ORDER BY version ASC")
                .bind(entry_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(knowledge_from_row).collect()
    }

    async fn list_knowledge(
        &self,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match category {
            Some(category) => {
                sqlx::query(
                    r#"
                    SELECT * FROM knowledge_entries
                    WHERE is_latest = 1 AND category = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(category.trim().to_ascii_lowercase())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM knowledge_entries WHERE is_latest = 1 ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(knowledge_from_row).collect()
    }

    async fn search_knowledge(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() >= 3)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        // Coarse filter in SQL, exact ranking in Rust.
        let mut sql = String::from("SELECT * FROM knowledge_entries WHERE is_latest = 1");
        if category.is_some() {
            sql.push_str(" AND category = ?");
        }
        sql.push_str(" AND (");
        for (i, _) in terms.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str(
                "(lower(title) LIKE ? OR lower(content) LIKE ? OR lower(tags_json) LIKE ? OR category LIKE ?)",
            );
        }
        sql.push(')');

        let mut q = sqlx::query(&sql);
        if let Some(category) = category {
            q = q.bind(category.trim().to_ascii_lowercase());
        }
        for term in &terms {
            let pattern = format!("%{}%", term);
            q = q
                .bind(pattern.clone())
                .bind(pattern.clone())
                .bind(pattern.clone())
                .bind(pattern);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let entries = rows
            .iter()
            .map(knowledge_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(rank_knowledge(entries, query, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use crate::models::{AuditAction, ContractStatus, FeedbackType};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        // Second run must be a no-op.
        migrate_pool(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn contract_roundtrip_with_embedded_json() {
        let (_dir, store) = store().await;
        let mut record = ContractRecord::new("u1", "a.pdf", "application/pdf", "u1/a.pdf", 30);
        store.insert_contract(&record).await.unwrap();

        record.advance(ContractStatus::Analyzed);
        record.analysis = Some(serde_json::from_str(r#"{"summary": {"currency": "USD"}}"#).unwrap());
        store.update_contract(&record).await.unwrap();

        let got = store.get_contract(&record.id).await.unwrap().unwrap();
        assert_eq!(got.status, ContractStatus::Analyzed);
        assert_eq!(
            got.analysis.unwrap().summary.currency.as_deref(),
            Some("USD")
        );
        assert_eq!(
            got.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );

        assert!(store.delete_contract(&record.id).await.unwrap());
        assert!(store.get_contract(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_query_uses_retention_days() {
        let (_dir, store) = store().await;
        let mut old = ContractRecord::new("u1", "o.txt", "text/plain", "u1/o.txt", 1);
        old.created_at = Utc::now() - chrono::Duration::days(3);
        let fresh = ContractRecord::new("u1", "n.txt", "text/plain", "u1/n.txt", 1);
        store.insert_contract(&old).await.unwrap();
        store.insert_contract(&fresh).await.unwrap();
        let expired = store.list_expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
    }

    #[tokio::test]
    async fn audit_and_feedback_roundtrip() {
        let (_dir, store) = store().await;
        store
            .append_audit(&AuditEntry {
                id: "a1".into(),
                validation_id: "v1".into(),
                actor_id: "system".into(),
                action: AuditAction::ConfidenceUpdated,
                previous_version: 1,
                current_version: 2,
                changes: serde_json::json!({"before": 0.8, "after": 0.95, "n": 2}),
                reason: Some("feedback".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let trail = store.audit_for("v1").await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::ConfidenceUpdated);
        assert_eq!(trail[0].changes["n"], 2);

        store
            .add_feedback(&FeedbackEntry {
                id: "f1".into(),
                validation_id: "v1".into(),
                actor_id: "u1".into(),
                feedback_type: FeedbackType::Accuracy,
                rating: 5,
                comment: "spot on".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let feedback = store.feedback_for("v1").await.unwrap();
        assert_eq!(feedback[0].rating, 5);
    }

    #[tokio::test]
    async fn knowledge_versioning_is_transactional() {
        let (_dir, store) = store().await;
        let first = store
            .upsert_knowledge(KnowledgeInput {
                title: "Construction payment norms".into(),
                content: "Retainage 5%".into(),
                category: "construction".into(),
                tags: ["payments".to_string()].into_iter().collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        let second = store
            .upsert_knowledge(KnowledgeInput {
                entry_id: Some(first.entry_id.clone()),
                title: "Construction payment norms".into(),
                content: "Retainage 10%".into(),
                category: "construction".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.version, 2);

        let history = store.knowledge_history(&first.entry_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_latest);
        assert!(history[1].is_latest);

        let hits = store
            .search_knowledge("construction contract standards", None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Retainage 10%");

        let listed = store.list_knowledge(Some("construction"), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
