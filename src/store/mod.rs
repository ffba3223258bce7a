//! Storage abstraction for contract records, validation history, audit and
//! feedback logs, and the knowledge corpus.
//!
//! Each concern is its own trait so callers depend only on what they use;
//! both backends ([`MemoryStore`](memory::MemoryStore) and
//! [`SqliteStore`](sqlite::SqliteStore)) implement all of them, and
//! [`Stores`] bundles one backend behind the five trait objects.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Trait | Methods |
//! |-------|---------|
//! | [`ContractStore`] | insert, update, get, delete, list expired |
//! | [`ValidationRecordStore`] | append version, latest by id / contract, history |
//! | [`AuditStore`] | append, list by validation |
//! | [`FeedbackStore`] | append, list by validation |
//! | [`KnowledgeStore`] | versioned upsert, get latest, history, list, search |

pub mod memory;
pub mod sqlite;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::{
    AuditEntry, ContractRecord, FeedbackEntry, KnowledgeEntry, KnowledgeInput, ValidationRecord,
};

/// Upper bound on any single repository call made by the pipeline.
pub const REPOSITORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a repository future under [`REPOSITORY_TIMEOUT`].
pub async fn bounded<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(REPOSITORY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "repository call timed out after {}s",
            REPOSITORY_TIMEOUT.as_secs()
        )),
    }
}

/// [`bounded`] plus cancellation, with failures mapped to a storage error
/// at `stage`.
pub async fn guarded<T, F>(cancel: &CancellationToken, stage: Stage, fut: F) -> PipelineResult<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::canceled(stage)),
        result = bounded(fut) => result.map_err(|e| PipelineError::storage(stage, e)),
    }
}

#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn insert_contract(&self, record: &ContractRecord) -> Result<()>;

    /// Overwrites an existing record. Fails if the id is unknown.
    async fn update_contract(&self, record: &ContractRecord) -> Result<()>;

    async fn get_contract(&self, id: &str) -> Result<Option<ContractRecord>>;

    /// Returns whether a record was removed.
    async fn delete_contract(&self, id: &str) -> Result<bool>;

    /// Records whose retention window ended at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContractRecord>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ValidationRecordStore: Send + Sync {
    /// Appends a version. Fails if `(id, version)` already exists.
    async fn append_validation(&self, record: &ValidationRecord) -> Result<()>;

    /// Highest version for a validation id.
    async fn latest_validation(&self, id: &str) -> Result<Option<ValidationRecord>>;

    /// Highest version of the most recent validation of a contract.
    async fn latest_for_contract(&self, contract_id: &str) -> Result<Option<ValidationRecord>>;

    /// All versions, ascending.
    async fn validation_history(&self, id: &str) -> Result<Vec<ValidationRecord>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Oldest first.
    async fn audit_for(&self, validation_id: &str) -> Result<Vec<AuditEntry>>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn add_feedback(&self, entry: &FeedbackEntry) -> Result<()>;

    /// Oldest first.
    async fn feedback_for(&self, validation_id: &str) -> Result<Vec<FeedbackEntry>>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Appends a new version of `input.entry_id` (or a new entry when it is
    /// `None` or unknown) and clears `is_latest` on the previous version,
    /// atomically.
    async fn upsert_knowledge(&self, input: KnowledgeInput) -> Result<KnowledgeEntry>;

    /// Latest version of a logical entry.
    async fn get_knowledge(&self, entry_id: &str) -> Result<Option<KnowledgeEntry>>;

    /// All versions, ascending.
    async fn knowledge_history(&self, entry_id: &str) -> Result<Vec<KnowledgeEntry>>;

    /// Latest versions, newest first, optionally restricted to a category.
    async fn list_knowledge(
        &self,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>>;

    /// Latest versions matching any query term (case-insensitive, over
    /// title, content, and tags), best match first.
    async fn search_knowledge(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>>;
}

/// One backend seen through each repository trait.
#[derive(Clone)]
pub struct Stores {
    pub contracts: Arc<dyn ContractStore>,
    pub validations: Arc<dyn ValidationRecordStore>,
    pub audit: Arc<dyn AuditStore>,
    pub feedback: Arc<dyn FeedbackStore>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ContractStore
            + ValidationRecordStore
            + AuditStore
            + FeedbackStore
            + KnowledgeStore
            + 'static,
    {
        Self {
            contracts: backend.clone(),
            validations: backend.clone(),
            audit: backend.clone(),
            feedback: backend.clone(),
            knowledge: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(memory::MemoryStore::new()))
    }
}

/// Ranks latest knowledge rows against a query; shared by the backends so
/// they order results identically.
pub(crate) fn rank_knowledge(
    rows: Vec<KnowledgeEntry>,
    query: &str,
    limit: usize,
) -> Vec<KnowledgeEntry> {
    let mut scored: Vec<(usize, KnowledgeEntry)> = rows
        .into_iter()
        .map(|e| (e.match_score(query), e))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| b.created_at.cmp(&a.created_at)));
    scored.into_iter().take(limit).map(|(_, e)| e).collect()
}
