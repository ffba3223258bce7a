//! Industry standards for risk-assessment prompts.
//!
//! For each industry tag, the latest knowledge entries in that category are
//! used; when the category is empty a term search for
//! `"<industry> contract standards"` stands in. Non-empty per-industry text
//! is cached under `knowledge:<industry>` until it expires or an entry in
//! that category changes. Store and cache failures never propagate: the
//! worst case is an empty string.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::KnowledgeConfig;
use crate::models::KnowledgeEntry;
use crate::store::{bounded, KnowledgeStore};

const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct KnowledgeLookup {
    store: Arc<dyn KnowledgeStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
    max_chars: usize,
    per_industry: usize,
}

impl KnowledgeLookup {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        cache: Arc<dyn Cache>,
        config: &KnowledgeConfig,
    ) -> Self {
        Self {
            store,
            cache,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            max_chars: config.max_chars,
            per_industry: config.entries_per_industry.max(1),
        }
    }

    pub fn cache_key(industry: &str) -> String {
        format!("knowledge:{}", industry.trim().to_ascii_lowercase())
    }

    /// Drops the cached text for `industry`. Called after an entry in that
    /// category is created or revised.
    pub async fn invalidate(&self, industry: &str) {
        let key = Self::cache_key(industry);
        match tokio::time::timeout(CACHE_OP_TIMEOUT, self.cache.delete(&key)).await {
            Ok(Ok(())) => tracing::debug!(key = %key, "knowledge cache invalidated"),
            Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "knowledge cache invalidation failed"),
            Err(_) => tracing::warn!(key = %key, "knowledge cache invalidation timed out"),
        }
    }

    /// Concatenated standards for `industries`, bounded to the configured
    /// character cap. Empty when nothing is known or lookups fail.
    pub async fn standards_for(&self, cancel: &CancellationToken, industries: &[String]) -> String {
        let mut out = String::new();
        let mut seen = Vec::new();
        for industry in industries {
            let industry = industry.trim().to_ascii_lowercase();
            if industry.is_empty() || seen.contains(&industry) {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            let text = tokio::select! {
                _ = cancel.cancelled() => break,
                text = self.industry_text(&industry) => text,
            };
            seen.push(industry);
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&text);
            if out.chars().count() >= self.max_chars {
                break;
            }
        }
        truncate_chars(&out, self.max_chars)
    }

    async fn industry_text(&self, industry: &str) -> String {
        let key = Self::cache_key(industry);
        match tokio::time::timeout(CACHE_OP_TIMEOUT, self.cache.get(&key)).await {
            Ok(Ok(Some(hit))) => return hit,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "knowledge cache read failed"),
            Err(_) => tracing::warn!(key = %key, "knowledge cache read timed out"),
        }

        let entries = match self.fetch(industry).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(industry, error = %e, "knowledge lookup failed");
                return String::new();
            }
        };
        let text = render(&entries);
        if text.is_empty() {
            return text;
        }

        match tokio::time::timeout(CACHE_OP_TIMEOUT, self.cache.set_with_ttl(&key, &text, self.ttl))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "knowledge cache write failed"),
            Err(_) => tracing::warn!(key = %key, "knowledge cache write timed out"),
        }
        text
    }

    async fn fetch(&self, industry: &str) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let by_category =
            bounded(self.store.list_knowledge(Some(industry), self.per_industry)).await?;
        if !by_category.is_empty() {
            return Ok(by_category);
        }
        let query = format!("{} contract standards", industry);
        bounded(self.store.search_knowledge(&query, None, self.per_industry)).await
    }
}

fn render(entries: &[KnowledgeEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("## {}\n{}", e.title, e.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::KnowledgeInput;
    use crate::store::memory::MemoryStore;
    use anyhow::bail;
    use async_trait::async_trait;

    fn config(max_chars: usize) -> KnowledgeConfig {
        KnowledgeConfig {
            cache_ttl_secs: 3600,
            max_chars,
            entries_per_industry: 2,
        }
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (title, category) in [
            ("Retainage", "construction"),
            ("Lien waivers", "construction"),
            ("Change orders", "construction"),
            ("SaaS uptime", "software"),
        ] {
            store
                .upsert_knowledge(KnowledgeInput {
                    title: title.into(),
                    content: format!("{} guidance", title),
                    category: category.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn takes_two_per_industry_and_caches() {
        let store = seeded().await;
        let cache = Arc::new(MemoryCache::new(16));
        let lookup = KnowledgeLookup::new(store, cache.clone(), &config(8192));
        let cancel = CancellationToken::new();

        let text = lookup
            .standards_for(&cancel, &["Construction".into(), "software".into()])
            .await;
        assert_eq!(text.matches("## ").count(), 3);
        assert!(text.contains("SaaS uptime"));
        assert!(cache
            .get("knowledge:construction")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn caps_output_length() {
        let store = seeded().await;
        let lookup = KnowledgeLookup::new(store, Arc::new(MemoryCache::new(16)), &config(20));
        let text = lookup
            .standards_for(&CancellationToken::new(), &["construction".into()])
            .await;
        assert_eq!(text.chars().count(), 20);
    }

    #[tokio::test]
    async fn falls_back_to_term_search() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_knowledge(KnowledgeInput {
                title: "Logistics contract standards".into(),
                content: "Incoterms".into(),
                category: "shipping".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let lookup = KnowledgeLookup::new(store, Arc::new(MemoryCache::new(16)), &config(8192));
        let text = lookup
            .standards_for(&CancellationToken::new(), &["logistics".into()])
            .await;
        assert!(text.contains("Incoterms"));
    }

    struct Failing;

    #[async_trait]
    impl KnowledgeStore for Failing {
        async fn upsert_knowledge(&self, _: KnowledgeInput) -> anyhow::Result<KnowledgeEntry> {
            bail!("down")
        }
        async fn get_knowledge(&self, _: &str) -> anyhow::Result<Option<KnowledgeEntry>> {
            bail!("down")
        }
        async fn knowledge_history(&self, _: &str) -> anyhow::Result<Vec<KnowledgeEntry>> {
            bail!("down")
        }
        async fn list_knowledge(
            &self,
            _: Option<&str>,
            _: usize,
        ) -> anyhow::Result<Vec<KnowledgeEntry>> {
            bail!("down")
        }
        async fn search_knowledge(
            &self,
            _: &str,
            _: Option<&str>,
            _: usize,
        ) -> anyhow::Result<Vec<KnowledgeEntry>> {
            bail!("down")
        }
    }

    #[tokio::test]
    async fn store_failure_yields_empty() {
        let lookup =
            KnowledgeLookup::new(Arc::new(Failing), Arc::new(MemoryCache::new(16)), &config(8192));
        let text = lookup
            .standards_for(&CancellationToken::new(), &["construction".into()])
            .await;
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn new_entries_are_seen_after_invalidation() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(16));
        let lookup = KnowledgeLookup::new(store.clone(), cache.clone(), &config(8192));
        let cancel = CancellationToken::new();
        let industries = vec!["Aviation".to_string()];

        assert!(lookup.standards_for(&cancel, &industries).await.is_empty());
        assert!(cache.get("knowledge:aviation").await.unwrap().is_none());

        store
            .upsert_knowledge(KnowledgeInput {
                title: "Aircraft leasing".into(),
                content: "Maintenance reserves are customary.".into(),
                category: "aviation".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(lookup
            .standards_for(&cancel, &industries)
            .await
            .contains("Maintenance reserves"));

        store
            .upsert_knowledge(KnowledgeInput {
                title: "Wet lease".into(),
                content: "Lessor supplies crew.".into(),
                category: "aviation".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!lookup
            .standards_for(&cancel, &industries)
            .await
            .contains("Lessor supplies crew"));
        lookup.invalidate("Aviation").await;
        assert!(lookup
            .standards_for(&cancel, &industries)
            .await
            .contains("Lessor supplies crew"));
    }
}
