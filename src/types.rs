use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateStat;

/// Key of the distinguished entity that aggregates across all others.
pub const GLOBAL_ENTITY_KEY: &str = "global";

// ============================================================================
// ModelUsage - per-model generation counts
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsageEntry {
    pub count: u64,
    pub tokens: u64,
}

/// Model name -> generation count and tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelUsage(BTreeMap<String, ModelUsageEntry>);

impl ModelUsage {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, model: &str) -> Option<&ModelUsageEntry> {
        self.0.get(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelUsageEntry)> {
        self.0.iter()
    }

    /// Record one generation by `model`.
    pub fn increment(&mut self, model: &str, tokens: u64) {
        let entry = self.0.entry(model.to_string()).or_default();
        entry.count += 1;
        entry.tokens += tokens;
    }

    pub fn merge(&mut self, other: &ModelUsage) {
        for (model, usage) in &other.0 {
            let entry = self.0.entry(model.clone()).or_default();
            entry.count += usage.count;
            entry.tokens += usage.tokens;
        }
    }

    /// Mirror of [`merge`](Self::merge); models that drop to zero are removed.
    pub fn unmerge(&mut self, other: &ModelUsage) {
        for (model, usage) in &other.0 {
            if let Some(entry) = self.0.get_mut(model) {
                entry.count = entry.count.saturating_sub(usage.count);
                entry.tokens = entry.tokens.saturating_sub(usage.tokens);
                if entry.count == 0 && entry.tokens == 0 {
                    self.0.remove(model);
                }
            }
        }
    }
}

// ============================================================================
// MessageStats - one transcript record
// ============================================================================

/// Normalized metrics of one transcript record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub is_user: bool,
    pub is_character: bool,
    pub is_system: bool,
    /// xxh3 of the message text, `None` for empty text
    #[serde(default)]
    pub hash: Option<String>,
    pub send_date: Option<DateTime<Utc>>,
    pub words: u64,
    /// Milliseconds, including accepted alternates
    pub gen_time: Option<f64>,
    pub gen_tokens: Option<f64>,
    /// Milliseconds spent on alternates only
    pub swipe_time: Option<f64>,
    pub swipes: Option<f64>,
    /// Stored alternates minus one, as recorded on the transcript line
    pub stored_swipes: Option<u64>,
    pub models: ModelUsage,
    /// Completion time of every generation for this slot
    pub gen_ends: Vec<DateTime<Utc>>,
}

// ============================================================================
// MetricSet - the eight tracked metrics
// ============================================================================

/// One aggregate per tracked metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    pub gen_time: AggregateStat,
    pub gen_tokens: AggregateStat,
    pub swipe_time: AggregateStat,
    pub swipes: AggregateStat,
    pub response_time: AggregateStat,
    pub words: AggregateStat,
    pub user_words: AggregateStat,
    pub char_words: AggregateStat,
}

impl MetricSet {
    fn pairs_mut<'a>(
        &'a mut self,
        other: &'a MetricSet,
    ) -> [(&'a mut AggregateStat, &'a AggregateStat); 8] {
        [
            (&mut self.gen_time, &other.gen_time),
            (&mut self.gen_tokens, &other.gen_tokens),
            (&mut self.swipe_time, &other.swipe_time),
            (&mut self.swipes, &other.swipes),
            (&mut self.response_time, &other.response_time),
            (&mut self.words, &other.words),
            (&mut self.user_words, &other.user_words),
            (&mut self.char_words, &other.char_words),
        ]
    }

    pub fn iter(&self) -> [(&'static str, &AggregateStat); 8] {
        [
            ("gen_time", &self.gen_time),
            ("gen_tokens", &self.gen_tokens),
            ("swipe_time", &self.swipe_time),
            ("swipes", &self.swipes),
            ("response_time", &self.response_time),
            ("words", &self.words),
            ("user_words", &self.user_words),
            ("char_words", &self.char_words),
        ]
    }

    pub fn stats_mut(&mut self) -> [&mut AggregateStat; 8] {
        [
            &mut self.gen_time,
            &mut self.gen_tokens,
            &mut self.swipe_time,
            &mut self.swipes,
            &mut self.response_time,
            &mut self.words,
            &mut self.user_words,
            &mut self.char_words,
        ]
    }

    pub fn add_aggregated(&mut self, other: &MetricSet) {
        for (stat, from) in self.pairs_mut(other) {
            stat.add_aggregated(from);
        }
    }

    pub fn remove_aggregated(&mut self, other: &MetricSet) {
        for (stat, from) in self.pairs_mut(other) {
            stat.remove_aggregated(from);
        }
    }

    pub fn add_aggregated_as_one(&mut self, other: &MetricSet) {
        for (stat, from) in self.pairs_mut(other) {
            stat.add_aggregated_as_one(from);
        }
    }

    pub fn remove_aggregated_as_one(&mut self, other: &MetricSet) {
        for (stat, from) in self.pairs_mut(other) {
            stat.remove_aggregated_as_one(from);
        }
    }
}

// ============================================================================
// ConversationSummary
// ============================================================================

/// Stats of one conversation, a pure function of its transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub entity_key: String,
    pub chat_name: String,
    /// sha256 of the transcript bytes (first 8 bytes, hex)
    pub chat_hash: String,
    pub chat_size: u64,
    pub create_date: Option<DateTime<Utc>>,
    pub last_interaction_date: Option<DateTime<Utc>>,
    pub user_name: Option<String>,
    pub char_name: Option<String>,
    /// Milliseconds between creation and the last interaction
    pub chatting_time: Option<f64>,
    pub message_count: u64,
    pub user_msg_count: u64,
    pub char_msg_count: u64,
    pub system_msg_count: u64,
    pub metrics: MetricSet,
    pub models: ModelUsage,
    pub messages: Vec<MessageStats>,
}

impl ConversationSummary {
    /// Whether `self` describes the conversation `entity_key`/`chat_name`.
    #[inline]
    pub fn is_chat(&self, entity_key: &str, chat_name: &str) -> bool {
        self.entity_key == entity_key && self.chat_name == chat_name
    }
}

// ============================================================================
// EntityStats
// ============================================================================

/// Stats of one entity (a character) or of the global entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
    pub key: String,
    /// Set only on the entity that aggregates across all others
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub global: bool,
    pub user_name: Option<String>,
    pub char_name: Option<String>,
    pub chats: u64,
    pub chat_size: u64,
    pub first_create_date: Option<DateTime<Utc>>,
    pub last_create_date: Option<DateTime<Utc>>,
    pub first_interaction_date: Option<DateTime<Utc>>,
    pub last_interaction_date: Option<DateTime<Utc>>,

    /// One sample per conversation
    pub chatting_time: AggregateStat,
    pub messages: AggregateStat,
    pub user_messages: AggregateStat,
    pub char_messages: AggregateStat,
    pub system_messages: AggregateStat,

    /// Conversation granularity: one folded total per conversation
    pub chat_metrics: MetricSet,
    /// Message granularity: every per-message sample of every conversation
    pub message_metrics: MetricSet,

    pub models: ModelUsage,

    /// Conversations currently contributing to this entity
    #[serde(default)]
    pub chat_summaries: Vec<Arc<ConversationSummary>>,
}

impl EntityStats {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// The entity folding every conversation of every other entity.
    pub fn new_global() -> Self {
        Self {
            key: GLOBAL_ENTITY_KEY.to_string(),
            global: true,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn find_chat(&self, entity_key: &str, chat_name: &str) -> Option<&Arc<ConversationSummary>> {
        self.chat_summaries
            .iter()
            .find(|s| s.is_chat(entity_key, chat_name))
    }
}
