//! In-memory store for tests and `database.dialect = "memory"`.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Nothing survives a restart.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AuditEntry, ContractRecord, FeedbackEntry, KnowledgeEntry, KnowledgeInput, ValidationRecord,
};

use super::{
    rank_knowledge, AuditStore, ContractStore, FeedbackStore, KnowledgeStore,
    ValidationRecordStore,
};

#[derive(Default)]
pub struct MemoryStore {
    contracts: RwLock<HashMap<String, ContractRecord>>,
    validations: RwLock<Vec<ValidationRecord>>,
    audit: RwLock<Vec<AuditEntry>>,
    feedback: RwLock<Vec<FeedbackEntry>>,
    knowledge: RwLock<Vec<KnowledgeEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("memory store lock poisoned"))
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn insert_contract(&self, record: &ContractRecord) -> Result<()> {
        let mut contracts = write(&self.contracts)?;
        if contracts.contains_key(&record.id) {
            bail!("contract {} already exists", record.id);
        }
        contracts.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_contract(&self, record: &ContractRecord) -> Result<()> {
        let mut contracts = write(&self.contracts)?;
        match contracts.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => bail!("contract {} not found", record.id),
        }
    }

    async fn get_contract(&self, id: &str) -> Result<Option<ContractRecord>> {
        Ok(read(&self.contracts)?.get(id).cloned())
    }

    async fn delete_contract(&self, id: &str) -> Result<bool> {
        Ok(write(&self.contracts)?.remove(id).is_some())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContractRecord>> {
        let mut expired: Vec<ContractRecord> = read(&self.contracts)?
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.created_at);
        Ok(expired)
    }
}

#[async_trait]
impl ValidationRecordStore for MemoryStore {
    async fn append_validation(&self, record: &ValidationRecord) -> Result<()> {
        let mut validations = write(&self.validations)?;
        if validations
            .iter()
            .any(|v| v.id == record.id && v.version == record.version)
        {
            bail!(
                "validation {} version {} already exists",
                record.id,
                record.version
            );
        }
        validations.push(record.clone());
        Ok(())
    }

    async fn latest_validation(&self, id: &str) -> Result<Option<ValidationRecord>> {
        Ok(read(&self.validations)?
            .iter()
            .filter(|v| v.id == id)
            .max_by_key(|v| v.version)
            .cloned())
    }

    async fn latest_for_contract(&self, contract_id: &str) -> Result<Option<ValidationRecord>> {
        Ok(read(&self.validations)?
            .iter()
            .filter(|v| v.contract_id == contract_id)
            .max_by_key(|v| (v.created_at, v.version))
            .cloned())
    }

    async fn validation_history(&self, id: &str) -> Result<Vec<ValidationRecord>> {
        let mut history: Vec<ValidationRecord> = read(&self.validations)?
            .iter()
            .filter(|v| v.id == id)
            .cloned()
            .collect();
        history.sort_by_key(|v| v.version);
        Ok(history)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        write(&self.audit)?.push(entry.clone());
        Ok(())
    }

    async fn audit_for(&self, validation_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(read(&self.audit)?
            .iter()
            .filter(|a| a.validation_id == validation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeedbackStore for MemoryStore {
    async fn add_feedback(&self, entry: &FeedbackEntry) -> Result<()> {
        write(&self.feedback)?.push(entry.clone());
        Ok(())
    }

    async fn feedback_for(&self, validation_id: &str) -> Result<Vec<FeedbackEntry>> {
        Ok(read(&self.feedback)?
            .iter()
            .filter(|f| f.validation_id == validation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn upsert_knowledge(&self, input: KnowledgeInput) -> Result<KnowledgeEntry> {
        // One write guard covers both the flag flip and the append.
        let mut rows = write(&self.knowledge)?;
        let previous_idx = input
            .entry_id
            .as_deref()
            .and_then(|id| rows.iter().position(|r| r.entry_id == id && r.is_latest));
        let entry = KnowledgeEntry::next_version(previous_idx.map(|i| &rows[i]), input);
        if let Some(i) = previous_idx {
            rows[i].is_latest = false;
        }
        rows.push(entry.clone());
        Ok(entry)
    }

    async fn get_knowledge(&self, entry_id: &str) -> Result<Option<KnowledgeEntry>> {
        Ok(read(&self.knowledge)?
            .iter()
            .find(|r| r.entry_id == entry_id && r.is_latest)
            .cloned())
    }

    async fn knowledge_history(&self, entry_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let mut history: Vec<KnowledgeEntry> = read(&self.knowledge)?
            .iter()
            .filter(|r| r.entry_id == entry_id)
            .cloned()
            .collect();
        history.sort_by_key(|r| r.version);
        Ok(history)
    }

    async fn list_knowledge(
        &self,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        let category = category.map(|c| c.trim().to_ascii_lowercase());
        let mut rows: Vec<KnowledgeEntry> = read(&self.knowledge)?
            .iter()
            .filter(|r| r.is_latest)
            .filter(|r| category.as_deref().map_or(true, |c| r.category == c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn search_knowledge(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        let category = category.map(|c| c.trim().to_ascii_lowercase());
        let rows: Vec<KnowledgeEntry> = read(&self.knowledge)?
            .iter()
            .filter(|r| r.is_latest)
            .filter(|r| category.as_deref().map_or(true, |c| r.category == c))
            .cloned()
            .collect();
        Ok(rank_knowledge(rows, query, limit))
    }
}
