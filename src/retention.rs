//! Retention sweep: contracts past `created_at + retention_days` are
//! deleted along with their blobs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::metrics::Metrics;
use crate::store::{bounded, ContractStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
    pub blob_failures: usize,
}

#[derive(Clone)]
pub struct RetentionSweeper {
    contracts: Arc<dyn ContractStore>,
    blobs: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
}

impl RetentionSweeper {
    pub fn new(
        contracts: Arc<dyn ContractStore>,
        blobs: Arc<dyn BlobStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            contracts,
            blobs,
            metrics,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = bounded(self.contracts.list_expired(now)).await?;
        let mut report = SweepReport {
            expired: expired.len(),
            ..Default::default()
        };
        for record in expired {
            if !bounded(self.contracts.delete_contract(&record.id)).await? {
                continue;
            }
            report.deleted += 1;
            if let Err(e) = self.blobs.delete(&record.blob_path).await {
                report.blob_failures += 1;
                tracing::warn!(contract_id = %record.id, error = %e, "expired blob not removed");
            }
        }
        for _ in 0..report.deleted {
            self.metrics.incr("retention_deleted_total", &[]);
        }
        if report.expired > 0 {
            tracing::info!(
                expired = report.expired,
                deleted = report.deleted,
                blob_failures = report.blob_failures,
                "retention sweep"
            );
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::models::ContractRecord;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn removes_only_expired_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()));
        let store = Arc::new(MemoryStore::new());

        let old_key = blobs.save("u1", "old.txt", b"old").await.unwrap();
        let mut old = ContractRecord::new("u1", "old.txt", "text/plain", &old_key, 30);
        old.created_at = Utc::now() - chrono::Duration::days(31);
        store.insert_contract(&old).await.unwrap();

        let fresh_key = blobs.save("u1", "new.txt", b"new").await.unwrap();
        let fresh = ContractRecord::new("u1", "new.txt", "text/plain", &fresh_key, 30);
        store.insert_contract(&fresh).await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let sweeper = RetentionSweeper::new(store.clone(), blobs.clone(), metrics.clone());
        let report = sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(store.get_contract(&old.id).await.unwrap().is_none());
        assert!(store.get_contract(&fresh.id).await.unwrap().is_some());
        assert!(blobs.read(&old_key).await.is_err());
        assert_eq!(blobs.read(&fresh_key).await.unwrap(), b"new");
        assert_eq!(metrics.counter("retention_deleted_total", &[]), 1);

        let again = sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }
}
