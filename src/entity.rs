//! Incorporating and retracting conversation summaries on an entity.
//!
//! Every fold here has an exact mirror so a conversation can be swapped out
//! when its transcript changes. The global entity goes through the very same
//! calls as the owning entity.

use std::collections::HashSet;
use std::sync::Arc;

use crate::types::{ConversationSummary, EntityStats};

impl EntityStats {
    /// Fold `summary` into this entity, replacing any earlier summary of the
    /// same conversation.
    pub fn incorporate(&mut self, summary: Arc<ConversationSummary>) {
        self.retract(&summary.entity_key, &summary.chat_name);

        self.chats += 1;
        self.chat_size += summary.chat_size;
        self.extend_dates(&summary);

        self.chatting_time.add(summary.chatting_time);
        self.messages.add(summary.message_count as f64);
        self.user_messages.add(summary.user_msg_count as f64);
        self.char_messages.add(summary.char_msg_count as f64);
        self.system_messages.add(summary.system_msg_count as f64);

        self.chat_metrics.add_aggregated_as_one(&summary.metrics);
        self.message_metrics.add_aggregated(&summary.metrics);
        self.models.merge(&summary.models);

        if let Some(name) = summary.user_name.as_ref().filter(|n| !n.is_empty()) {
            self.user_name = Some(name.clone());
        }
        if let Some(name) = summary.char_name.as_ref().filter(|n| !n.is_empty()) {
            self.char_name = Some(name.clone());
        }

        self.chat_summaries.push(summary);
    }

    /// Remove the conversation `entity_key`/`chat_name` from this entity.
    ///
    /// Returns the retracted summary, or `None` if it was not tracked.
    pub fn retract(
        &mut self,
        entity_key: &str,
        chat_name: &str,
    ) -> Option<Arc<ConversationSummary>> {
        let pos = self
            .chat_summaries
            .iter()
            .position(|s| s.is_chat(entity_key, chat_name))?;
        let summary = self.chat_summaries.remove(pos);

        self.chats = self.chats.saturating_sub(1);
        self.chat_size = self.chat_size.saturating_sub(summary.chat_size);

        self.chatting_time.remove(summary.chatting_time);
        self.messages.remove(summary.message_count as f64);
        self.user_messages.remove(summary.user_msg_count as f64);
        self.char_messages.remove(summary.char_msg_count as f64);
        self.system_messages.remove(summary.system_msg_count as f64);

        self.chat_metrics.remove_aggregated_as_one(&summary.metrics);
        self.message_metrics.remove_aggregated(&summary.metrics);
        self.models.unmerge(&summary.models);

        self.recompute_dates();
        Some(summary)
    }

    /// Total per-message samples of `metric` across the tracked conversations.
    pub fn tracked_sample_count(&self, metric: &str) -> u64 {
        self.chat_summaries
            .iter()
            .flat_map(|s| s.metrics.iter())
            .filter(|(name, _)| *name == metric)
            .map(|(_, stat)| stat.count)
            .sum()
    }

    /// Messages whose text already appears elsewhere among the same entity's
    /// chats, as left behind by branching a chat.
    pub fn repeated_message_count(&self) -> u64 {
        let mut seen = HashSet::new();
        self.chat_summaries
            .iter()
            .flat_map(|s| {
                s.messages
                    .iter()
                    .filter_map(|m| m.hash.as_deref())
                    .map(move |hash| (s.entity_key.as_str(), hash))
            })
            .filter(|key| !seen.insert(*key))
            .count() as u64
    }

    /// Whether every message-granularity metric holds exactly the samples of
    /// the tracked conversations.
    pub fn is_consistent(&self) -> bool {
        self.message_metrics
            .iter()
            .into_iter()
            .all(|(name, stat)| stat.count == self.tracked_sample_count(name))
            && self.chats == self.chat_summaries.len() as u64
    }

    fn extend_dates(&mut self, summary: &ConversationSummary) {
        fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        }

        self.first_create_date = min_opt(self.first_create_date, summary.create_date);
        self.last_create_date = self.last_create_date.max(summary.create_date);
        self.first_interaction_date =
            min_opt(self.first_interaction_date, summary.last_interaction_date);
        self.last_interaction_date = self.last_interaction_date.max(summary.last_interaction_date);
    }

    // Extremes cannot be un-folded, so they are rebuilt from what remains.
    fn recompute_dates(&mut self) {
        self.first_create_date = None;
        self.last_create_date = None;
        self.first_interaction_date = None;
        self.last_interaction_date = None;

        let summaries = std::mem::take(&mut self.chat_summaries);
        for summary in &summaries {
            self.extend_dates(summary);
        }
        self.chat_summaries = summaries;
    }
}
