//! Short-horizon, similarity-keyed suppression of repeat observations.
//!
//! Per-process and in memory only. A restart forgets everything, which is
//! fine: the cache only rate-limits work, it never decides identity.

use crate::config::DedupSettings;
use crate::error::Result;
use crate::vector::cosine_similarity;
use chrono::{DateTime, Utc};
use common::Embedding;
use std::collections::HashMap;
use std::sync::Arc;
use telemetry::metrics::FACE_ENGINE_DEDUP_LOOKUPS;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
enum EntryState<T> {
    /// Registered, result not in yet
    Pending,
    Ready(T),
}

#[derive(Debug, Clone)]
struct Entry<T> {
    id: u64,
    embedding: Embedding,
    observed_at: DateTime<Utc>,
    state: EntryState<T>,
}

/// Handle for the pending entry a miss registered
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a pending entry must be completed or abandoned"]
pub struct Ticket {
    source: String,
    entry_id: u64,
}

impl Ticket {
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// Nothing similar within the window; a pending entry now holds the slot
    Miss(Ticket),
    /// A similar observation is still being processed
    Pending,
    /// A similar observation already produced this record
    Hit(T),
}

impl<T> CacheLookup<T> {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, CacheLookup::Miss(_))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    pub hits: u64,
    pub pending_hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub abandoned: u64,
    pub entries: usize,
}

struct CacheState<T> {
    settings: DedupSettings,
    sources: HashMap<String, Vec<Entry<T>>>,
    next_id: u64,
    stats: DedupStats,
}

/// Recently observed embeddings per source, each live for one cooldown window
#[derive(Clone)]
pub struct DedupCache<T> {
    name: &'static str,
    state: Arc<RwLock<CacheState<T>>>,
}

impl<T: Clone + Send + Sync> DedupCache<T> {
    /// `name` labels this instance in metrics and logs
    pub fn new(name: &'static str, settings: DedupSettings) -> Self {
        Self {
            name,
            state: Arc::new(RwLock::new(CacheState {
                settings,
                sources: HashMap::new(),
                next_id: 0,
                stats: DedupStats::default(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn settings(&self) -> DedupSettings {
        self.state.read().await.settings
    }

    /// Applies to the next lookup; existing entries are kept
    pub async fn set_settings(&self, settings: DedupSettings) {
        self.state.write().await.settings = settings;
    }

    /// Look for a similar observation from `source` within the window.
    ///
    /// On a miss the embedding is registered as pending before returning, so
    /// a concurrent lookup for the same appearance sees `Pending` instead of
    /// starting duplicate work.
    pub async fn check_and_register(
        &self,
        embedding: &[f32],
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<T>> {
        let mut state = self.state.write().await;
        let settings = state.settings;
        let window = settings.cooldown();

        let entries = state.sources.entry(source.to_string()).or_default();
        let before = entries.len();
        entries.retain(|e| now.signed_duration_since(e.observed_at) <= window);
        let expired = (before - entries.len()) as u64;

        let mut found = None;
        for entry in entries.iter() {
            let similarity = cosine_similarity(embedding, &entry.embedding)?;
            if similarity >= settings.similarity_threshold {
                found = Some((entry.state.clone(), similarity));
                break;
            }
        }

        let lookup = match found {
            Some((EntryState::Ready(record), similarity)) => {
                debug!(cache = self.name, source, similarity, "dedup hit");
                CacheLookup::Hit(record)
            }
            Some((EntryState::Pending, similarity)) => {
                debug!(cache = self.name, source, similarity, "dedup hit on pending entry");
                CacheLookup::Pending
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state
                    .sources
                    .entry(source.to_string())
                    .or_default()
                    .push(Entry {
                        id,
                        embedding: embedding.to_vec(),
                        observed_at: now,
                        state: EntryState::Pending,
                    });
                CacheLookup::Miss(Ticket {
                    source: source.to_string(),
                    entry_id: id,
                })
            }
        };

        state.stats.expirations += expired;
        let result = match &lookup {
            CacheLookup::Hit(_) => {
                state.stats.hits += 1;
                "hit"
            }
            CacheLookup::Pending => {
                state.stats.pending_hits += 1;
                "pending"
            }
            CacheLookup::Miss(_) => {
                state.stats.misses += 1;
                "miss"
            }
        };
        FACE_ENGINE_DEDUP_LOOKUPS
            .with_label_values(&[self.name, result])
            .inc();

        Ok(lookup)
    }

    /// Attach the result to a pending entry; a no-op if it has since expired or been cleared
    pub async fn complete(&self, ticket: Ticket, record: T) {
        let mut state = self.state.write().await;
        if let Some(entry) = state
            .sources
            .get_mut(&ticket.source)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == ticket.entry_id))
        {
            entry.state = EntryState::Ready(record);
        }
    }

    /// Drop a pending entry whose work failed so the slot is free again
    pub async fn abandon(&self, ticket: Ticket) {
        let mut state = self.state.write().await;
        let removed = match state.sources.get_mut(&ticket.source) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != ticket.entry_id);
                before != entries.len()
            }
            None => false,
        };
        if removed {
            state.stats.abandoned += 1;
            debug!(cache = self.name, source = %ticket.source, "abandoned pending entry");
        }
    }

    pub async fn clear_source(&self, source: &str) {
        self.state.write().await.sources.remove(source);
    }

    pub async fn clear(&self) {
        self.state.write().await.sources.clear();
    }

    pub async fn stats(&self) -> DedupStats {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        stats.entries = state.sources.values().map(Vec::len).sum();
        stats
    }
}
