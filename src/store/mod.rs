//! Per-user collection of entity stats and the operations that keep it in
//! step with the transcripts.
//!
//! A [`StatsStore`] owns one user's [`StatsCollection`]. Mutations go through
//! `Arc::make_mut`, so snapshots handed out earlier keep seeing the state they
//! were taken from.

pub mod persist;


use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationAggregator, hash_transcript};
use crate::source::TranscriptSource;
use crate::types::{ConversationSummary, EntityStats};
use persist::LoadError;

/// Bump when the persisted layout or any aggregation rule changes.
pub const STATS_VERSION: u32 = 2;

// ============================================================================
// StatsCollection
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsCollection {
    pub version: u32,
    /// Last time any aggregate changed
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Settings the aggregates were computed with
    #[serde(default)]
    pub aggregation: Option<ConversationAggregator>,
    #[serde(serialize_with = "persist::serialize_global")]
    pub global: Arc<EntityStats>,
    pub stats: BTreeMap<String, Arc<EntityStats>>,
}

impl Default for StatsCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollection {
    pub fn new() -> Self {
        Self::with_aggregation(ConversationAggregator::default())
    }

    pub fn with_aggregation(aggregation: ConversationAggregator) -> Self {
        Self {
            version: STATS_VERSION,
            timestamp: None,
            aggregation: Some(aggregation),
            global: Arc::new(EntityStats::new_global()),
            stats: BTreeMap::new(),
        }
    }

    /// Global stats, one entity, or one conversation of an entity.
    pub fn get(&self, entity_key: Option<&str>, chat_name: Option<&str>) -> Option<StatsView> {
        match (entity_key, chat_name) {
            (None, None) => Some(StatsView::Global(Arc::clone(&self.global))),
            (Some(entity), None) => self.stats.get(entity).cloned().map(StatsView::Entity),
            (Some(entity), Some(chat)) => self
                .stats
                .get(entity)?
                .find_chat(entity, chat)
                .cloned()
                .map(StatsView::Conversation),
            (None, Some(_)) => None,
        }
    }

    /// Global sums match the entities and every entity matches its summaries.
    pub fn is_consistent(&self) -> bool {
        let chats: u64 = self.stats.values().map(|e| e.chats).sum();
        let size: u64 = self.stats.values().map(|e| e.chat_size).sum();
        self.global.chats == chats
            && self.global.chat_size == size
            && self.global.is_consistent()
            && self.stats.values().all(|e| e.is_consistent())
    }

    /// Point the global entity at the summaries held by the entities.
    pub(crate) fn relink_global(&mut self) {
        let summaries = self
            .stats
            .values()
            .flat_map(|entity| entity.chat_summaries.iter().cloned())
            .collect();
        Arc::make_mut(&mut self.global).chat_summaries = summaries;
    }

    fn touch(&mut self) {
        self.timestamp = Some(Utc::now());
    }

    fn incorporate(&mut self, summary: Arc<ConversationSummary>) {
        let key = summary.entity_key.clone();
        let entity = self
            .stats
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EntityStats::new(key)));
        Arc::make_mut(entity).incorporate(Arc::clone(&summary));
        Arc::make_mut(&mut self.global).incorporate(summary);
        self.touch();
    }

    fn retract(&mut self, entity_key: &str, chat_name: &str) -> Option<Arc<ConversationSummary>> {
        let entity = self.stats.get_mut(entity_key)?;
        entity.find_chat(entity_key, chat_name)?;

        let removed = Arc::make_mut(entity).retract(entity_key, chat_name);
        if entity.chats == 0 {
            self.stats.remove(entity_key);
        }
        Arc::make_mut(&mut self.global).retract(entity_key, chat_name);
        self.touch();
        removed
    }

    /// Drop an entity and its contribution to the global entity.
    fn discard_entity(&mut self, entity_key: &str) -> Option<Arc<EntityStats>> {
        let entity = self.stats.remove(entity_key)?;
        let global = Arc::make_mut(&mut self.global);
        for summary in &entity.chat_summaries {
            global.retract(&summary.entity_key, &summary.chat_name);
        }
        self.touch();
        Some(entity)
    }
}

/// Result of a [`StatsCollection::get`] query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsView {
    Global(Arc<EntityStats>),
    Entity(Arc<EntityStats>),
    Conversation(Arc<ConversationSummary>),
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New or changed transcript folded in
    Updated,
    /// Transcript identical to the tracked one
    Unchanged,
    /// Conversation gone or empty, previous contribution removed
    Retracted,
    /// Conversation gone or empty and never tracked
    Untracked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub entities: usize,
    pub conversations: usize,
    /// Conversations whose transcript could not be read, as (entity, chat)
    pub failed: Vec<(String, String)>,
    /// Entities whose conversations could not be listed
    pub failed_entities: Vec<String>,
    pub cancelled: bool,
}

impl RebuildReport {
    fn absorb(&mut self, other: RebuildReport) {
        self.entities += other.entities;
        self.conversations += other.conversations;
        self.failed.extend(other.failed);
        self.failed_entities.extend(other.failed_entities);
    }
}

// ============================================================================
// StatsStore
// ============================================================================

pub struct StatsStore {
    source: Arc<dyn TranscriptSource>,
    path: PathBuf,
    aggregator: ConversationAggregator,
    collection: Arc<StatsCollection>,
    last_saved: Option<DateTime<Utc>>,
    stale: bool,
}

/// What to do when the stored document cannot be used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Rebuild from the transcripts before returning
    Rebuild,
    /// Return an empty, stale store and leave the rebuild to the caller
    Deferred,
}

impl StatsStore {
    /// Empty store persisting to `path`; nothing is read.
    pub fn new(
        source: Arc<dyn TranscriptSource>,
        path: impl Into<PathBuf>,
        aggregator: ConversationAggregator,
    ) -> Self {
        Self {
            source,
            path: path.into(),
            aggregator,
            collection: Arc::new(StatsCollection::with_aggregation(aggregator)),
            last_saved: None,
            stale: false,
        }
    }

    /// Open the store persisted at `path`, rebuilding from the transcripts
    /// when the document is missing, unreadable, outdated or inconsistent.
    pub async fn load(
        source: Arc<dyn TranscriptSource>,
        path: impl Into<PathBuf>,
        aggregator: ConversationAggregator,
    ) -> Result<Self> {
        Self::load_with(source, path, aggregator, LoadMode::Rebuild).await
    }

    pub async fn load_with(
        source: Arc<dyn TranscriptSource>,
        path: impl Into<PathBuf>,
        aggregator: ConversationAggregator,
        mode: LoadMode,
    ) -> Result<Self> {
        let mut store = Self::new(source, path, aggregator);

        let loaded = match persist::load_collection(&store.path) {
            Ok(collection) if collection.aggregation != Some(aggregator) => {
                tracing::info!(path = %store.path.display(), "aggregation settings changed, rebuilding");
                None
            }
            Ok(collection) if collection.is_consistent() => Some(collection),
            Ok(_) => {
                tracing::warn!(path = %store.path.display(), "stored stats are inconsistent, rebuilding");
                None
            }
            Err(LoadError::Missing) => {
                tracing::info!(path = %store.path.display(), "no stored stats, building");
                None
            }
            Err(LoadError::VersionMismatch { found }) => {
                tracing::info!(found, current = STATS_VERSION, "stats version changed, rebuilding");
                None
            }
            Err(LoadError::Corrupt(error)) => {
                tracing::warn!(path = %store.path.display(), %error, "stored stats unreadable, rebuilding");
                None
            }
        };

        match (loaded, mode) {
            (Some(collection), _) => {
                store.last_saved = collection.timestamp;
                store.collection = Arc::new(collection);
            }
            (None, LoadMode::Deferred) => store.stale = true,
            (None, LoadMode::Rebuild) => {
                let report = store.rebuild_all(&AtomicBool::new(false)).await?;
                if !report.failed.is_empty() {
                    tracing::warn!(failed = report.failed.len(), "some conversations could not be read");
                }
            }
        }

        Ok(store)
    }

    /// Whether the stored stats were unusable and nothing has rebuilt them
    /// since.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// The current state; later mutations do not affect it.
    pub fn snapshot(&self) -> Arc<StatsCollection> {
        Arc::clone(&self.collection)
    }

    pub fn get(&self, entity_key: Option<&str>, chat_name: Option<&str>) -> Option<StatsView> {
        self.collection.get(entity_key, chat_name)
    }

    /// Whether aggregates changed since the last save.
    pub fn is_dirty(&self) -> bool {
        match (self.collection.timestamp, self.last_saved) {
            (Some(calculated), Some(saved)) => calculated > saved,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Re-read one conversation and fold it in.
    pub async fn update(&mut self, entity_key: &str, chat_name: &str) -> Result<UpdateOutcome> {
        let bytes = self
            .source
            .read_transcript(entity_key, chat_name)
            .await
            .with_context(|| format!("Failed to read conversation {entity_key}/{chat_name}"))?;

        let Some(bytes) = bytes else {
            return Ok(self.retract(entity_key, chat_name));
        };

        if let Some(tracked) = self
            .collection
            .stats
            .get(entity_key)
            .and_then(|e| e.find_chat(entity_key, chat_name))
            && tracked.chat_hash == hash_transcript(&bytes)
        {
            return Ok(UpdateOutcome::Unchanged);
        }

        match self.aggregator.aggregate(entity_key, chat_name, &bytes) {
            Some(summary) => {
                tracing::debug!(
                    entity = entity_key,
                    chat = chat_name,
                    messages = summary.message_count,
                    "conversation updated"
                );
                Arc::make_mut(&mut self.collection).incorporate(Arc::new(summary));
                Ok(UpdateOutcome::Updated)
            }
            None => Ok(self.retract(entity_key, chat_name)),
        }
    }

    /// Forget a deleted conversation.
    pub fn remove(&mut self, entity_key: &str, chat_name: &str) -> UpdateOutcome {
        self.retract(entity_key, chat_name)
    }

    fn retract(&mut self, entity_key: &str, chat_name: &str) -> UpdateOutcome {
        let tracked = self
            .collection
            .stats
            .get(entity_key)
            .is_some_and(|e| e.find_chat(entity_key, chat_name).is_some());
        if !tracked {
            return UpdateOutcome::Untracked;
        }

        Arc::make_mut(&mut self.collection).retract(entity_key, chat_name);
        tracing::debug!(entity = entity_key, chat = chat_name, "conversation retracted");
        UpdateOutcome::Retracted
    }

    /// Recompute one entity from all of its transcripts.
    ///
    /// A conversation whose transcript cannot be read keeps its previous
    /// contribution and is listed in the report.
    pub async fn rebuild_entity(&mut self, entity_key: &str) -> Result<RebuildReport> {
        let chats = self
            .source
            .list_conversations(entity_key)
            .await
            .with_context(|| format!("Failed to list conversations of {entity_key}"))?;

        let previous = Arc::make_mut(&mut self.collection).discard_entity(entity_key);

        let mut report = RebuildReport {
            entities: 1,
            ..Default::default()
        };
        // Listing order, with unreadable conversations keeping their old summary
        let mut slots: Vec<Option<Arc<ConversationSummary>>> = Vec::with_capacity(chats.len());
        let mut transcripts = Vec::with_capacity(chats.len());

        for chat in chats {
            match self.source.read_transcript(entity_key, &chat).await {
                Ok(Some(bytes)) => {
                    transcripts.push((slots.len(), chat, bytes));
                    slots.push(None);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(entity = entity_key, chat = %chat, error = %error, "failed to read conversation");
                    if let Some(old) = previous.as_ref().and_then(|e| e.find_chat(entity_key, &chat)) {
                        slots.push(Some(Arc::clone(old)));
                    }
                    report.failed.push((entity_key.to_string(), chat));
                }
            }
        }

        let aggregator = self.aggregator;
        let key = entity_key.to_string();
        let summaries: Vec<(usize, Option<ConversationSummary>)> =
            tokio::task::spawn_blocking(move || {
                transcripts
                    .par_iter()
                    .map(|(slot, chat, bytes)| (*slot, aggregator.aggregate(&key, chat, bytes)))
                    .collect()
            })
            .await
            .context("Aggregation task failed")?;

        for (slot, summary) in summaries {
            if let Some(summary) = summary {
                report.conversations += 1;
                slots[slot] = Some(Arc::new(summary));
            }
        }

        let collection = Arc::make_mut(&mut self.collection);
        for summary in slots.into_iter().flatten() {
            collection.incorporate(summary);
        }
        collection.touch();

        Ok(report)
    }

    /// Discard everything and rebuild every entity the source knows about.
    ///
    /// `cancel` is checked between entities; entities finished before it was
    /// raised stay in the store.
    pub async fn rebuild_all(&mut self, cancel: &AtomicBool) -> Result<RebuildReport> {
        let entities = self
            .source
            .list_entities()
            .await
            .context("Failed to list entities")?;

        self.collection = Arc::new(StatsCollection::with_aggregation(self.aggregator));
        let mut report = RebuildReport::default();

        for entity in entities {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("rebuild cancelled");
                report.cancelled = true;
                break;
            }
            match self.rebuild_entity(&entity).await {
                Ok(entity_report) => report.absorb(entity_report),
                Err(error) => {
                    tracing::warn!(entity = %entity, error = %error, "failed to rebuild entity");
                    report.failed_entities.push(entity);
                }
            }
        }

        Arc::make_mut(&mut self.collection).touch();
        self.stale = report.cancelled;
        tracing::info!(
            entities = report.entities,
            conversations = report.conversations,
            failed = report.failed.len(),
            "rebuilt stats"
        );
        Ok(report)
    }

    /// Write the collection if it changed since the last save.
    ///
    /// Returns whether anything was written.
    pub async fn save(&mut self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }

        let collection = self.snapshot();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || persist::save_collection(&path, &collection))
            .await
            .context("Save task failed")??;

        self.last_saved = self.collection.timestamp;
        tracing::info!(path = %self.path.display(), "saved stats");
        Ok(true)
    }
}
