//! Folding one transcript into a [`ConversationSummary`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::extract::{duration_ms, extract_message_stats};
use crate::transcript::{TranscriptLine, parse_transcript};
use crate::types::{ConversationSummary, MessageStats};

/// Hash of a whole transcript, used as the conversation's content identity.
pub fn hash_transcript(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAggregator {
    /// Clamp negative response times (clock skew, out-of-order edits) to zero
    pub clamp_negative_response_time: bool,
}

impl Default for ConversationAggregator {
    fn default() -> Self {
        Self {
            clamp_negative_response_time: true,
        }
    }
}

impl ConversationAggregator {
    pub fn new(clamp_negative_response_time: bool) -> Self {
        Self {
            clamp_negative_response_time,
        }
    }

    /// Aggregate the transcript `bytes` of `entity_key`/`chat_name`.
    ///
    /// Returns `None` when the transcript holds no message records.
    pub fn aggregate(
        &self,
        entity_key: &str,
        chat_name: &str,
        bytes: &[u8],
    ) -> Option<ConversationSummary> {
        let mut summary = ConversationSummary {
            entity_key: entity_key.to_string(),
            chat_name: chat_name.to_string(),
            chat_hash: hash_transcript(bytes),
            chat_size: bytes.len() as u64,
            ..Default::default()
        };

        for line in parse_transcript(bytes) {
            let record = match line {
                TranscriptLine::Header(header) => {
                    let created = header.create_date.as_ref().and_then(|d| d.to_datetime());
                    summary.create_date = created;
                    summary.last_interaction_date = created;
                    if let Some(name) = header.user_name.filter(|n| !n.is_empty()) {
                        summary.user_name = Some(name);
                    }
                    if let Some(name) = header.character_name.filter(|n| !n.is_empty()) {
                        summary.char_name = Some(name);
                    }
                    continue;
                }
                TranscriptLine::Message(record) => record,
            };

            let message = extract_message_stats(&record);

            if let Some(name) = record.name.as_ref().filter(|n| !n.is_empty()) {
                if message.is_user {
                    summary.user_name = Some(name.clone());
                } else if message.is_character {
                    summary.char_name = Some(name.clone());
                }
            }

            if summary.create_date.is_none() {
                summary.create_date = message.send_date;
            }
            let latest = message
                .send_date
                .iter()
                .chain(message.gen_ends.iter())
                .copied()
                .max();
            summary.last_interaction_date = summary.last_interaction_date.max(latest);

            if message.is_user
                && let Some(previous) = summary.messages.last()
            {
                let response = self.response_time(previous, &message);
                summary.metrics.response_time.add(response);
            }

            self.fold_message(&mut summary, &message);
            summary.messages.push(message);
        }

        if summary.messages.is_empty() {
            return None;
        }

        if let (Some(created), Some(last)) = (summary.create_date, summary.last_interaction_date) {
            summary.chatting_time = Some(duration_ms(created, last));
        }

        Some(summary)
    }

    fn fold_message(&self, summary: &mut ConversationSummary, message: &MessageStats) {
        summary.message_count += 1;
        if message.is_system {
            summary.system_msg_count += 1;
        }
        if message.is_user {
            summary.user_msg_count += 1;
        }
        if message.is_character {
            summary.char_msg_count += 1;
        }

        let metrics = &mut summary.metrics;
        metrics.gen_time.add(message.gen_time);
        metrics.gen_tokens.add(message.gen_tokens);
        metrics.swipe_time.add(message.swipe_time);
        metrics.swipes.add(message.swipes);

        let words = message.words as f64;
        metrics.words.add(words);
        if message.is_user {
            metrics.user_words.add(words);
        }
        if message.is_character {
            metrics.char_words.add(words);
        }

        summary.models.merge(&message.models);
    }

    /// Time the user took to answer: from the latest output of the previous
    /// record they could have read, to their own message.
    fn response_time(&self, previous: &MessageStats, message: &MessageStats) -> Option<f64> {
        let sent = message.send_date?;
        let seen = previous
            .gen_ends
            .iter()
            .copied()
            .filter(|end| *end < sent)
            .max()
            .or(previous.send_date)?;

        let millis = signed_ms(seen, sent);
        if self.clamp_negative_response_time {
            Some(millis.max(0.0))
        } else {
            Some(millis)
        }
    }
}

fn signed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> String {
        Utc.timestamp_opt(1_714_560_000 + secs, 0)
            .single()
            .unwrap()
            .to_rfc3339()
    }

    fn user(text: &str, at: i64) -> String {
        format!(
            r#"{{"name":"You","is_user":true,"is_system":false,"send_date":"{}","mes":"{}"}}"#,
            ts(at),
            text
        )
    }

    fn header(at: i64) -> String {
        format!(
            r#"{{"user_name":"You","character_name":"Seraphina","create_date":"{}","chat_metadata":{{}}}}"#,
            ts(at)
        )
    }

    #[test]
    fn response_time_uses_latest_completion_before_reply() {
        // The assistant answered at t=5 and was regenerated, finishing at t=8.
        let assistant = format!(
            r#"{{"name":"Seraphina","is_user":false,"send_date":"{s}","mes":"hello","gen_started":"{s}","gen_finished":"{e}","swipe_info":[{{"gen_started":"{s}","gen_finished":"{e}"}},{{"gen_started":"{s2}","gen_finished":"{e2}"}}]}}"#,
            s = ts(1),
            e = ts(5),
            s2 = ts(6),
            e2 = ts(8)
        );
        let transcript = [user("hi", 0), assistant, user("ok", 10)].join("\n");
        assert_eq!(parse_transcript(transcript.as_bytes()).len(), 3);

        let summary = ConversationAggregator::default()
            .aggregate("seraphina", "chat1", transcript.as_bytes())
            .expect("summary");

        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.user_msg_count, 2);
        assert_eq!(summary.char_msg_count, 1);
        assert_eq!(summary.metrics.response_time.values, vec![2000.0]);
        assert_eq!(summary.metrics.swipes.total, 1.0);
        assert_eq!(summary.last_interaction_date, Some(Utc.timestamp_opt(1_714_560_010, 0).unwrap()));
    }

    #[test]
    fn completions_after_the_reply_are_ignored() {
        let assistant = format!(
            r#"{{"is_user":false,"send_date":"{s}","mes":"late","gen_started":"{s}","gen_finished":"{e}"}}"#,
            s = ts(2),
            e = ts(20)
        );
        let transcript = [assistant, user("impatient", 10)].join("\n");
        let summary = ConversationAggregator::default()
            .aggregate("c", "chat", transcript.as_bytes())
            .unwrap();
        // Falls back to the previous record's send date.
        assert_eq!(summary.metrics.response_time.values, vec![8000.0]);
    }

    #[test]
    fn negative_response_time_is_clamped_unless_disabled() {
        let transcript = [user("first", 10), user("skewed", 4)].join("\n");

        let clamped = ConversationAggregator::default()
            .aggregate("c", "chat", transcript.as_bytes())
            .unwrap();
        assert_eq!(clamped.metrics.response_time.values, vec![0.0]);

        let raw = ConversationAggregator::new(false)
            .aggregate("c", "chat", transcript.as_bytes())
            .unwrap();
        assert_eq!(raw.metrics.response_time.values, vec![-6000.0]);
    }

    #[test]
    fn header_seeds_dates_and_is_not_a_message() {
        let transcript = [header(0), user("one two three", 30)].join("\n");
        let summary = ConversationAggregator::default()
            .aggregate("seraphina", "chat", transcript.as_bytes())
            .unwrap();

        assert_eq!(summary.message_count, 1);
        assert_eq!(summary.create_date, Some(Utc.timestamp_opt(1_714_560_000, 0).unwrap()));
        assert_eq!(summary.chatting_time, Some(30_000.0));
        assert_eq!(summary.char_name.as_deref(), Some("Seraphina"));
        assert_eq!(summary.metrics.words.total, 3.0);
        assert_eq!(summary.metrics.user_words.total, 3.0);
        assert!(summary.metrics.char_words.is_empty());
        // A single human turn has nothing to respond to.
        assert!(summary.metrics.response_time.is_empty());
    }

    #[test]
    fn empty_or_header_only_transcript_has_no_summary() {
        let aggregator = ConversationAggregator::default();
        assert!(aggregator.aggregate("c", "chat", b"").is_none());
        assert!(aggregator.aggregate("c", "chat", header(0).as_bytes()).is_none());
        assert!(aggregator.aggregate("c", "chat", b"garbage\n{}\n").is_none());
    }

    #[test]
    fn malformed_lines_do_not_abort_the_conversation() {
        let transcript = [user("a", 0), "{broken".to_string(), user("b c", 5)].join("\n");
        let summary = ConversationAggregator::default()
            .aggregate("c", "chat", transcript.as_bytes())
            .unwrap();
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.metrics.words.values, vec![1.0, 2.0]);
    }

    #[test]
    fn identity_hash_and_size_come_from_bytes() {
        let transcript = user("hello", 0);
        let summary = ConversationAggregator::default()
            .aggregate("seraphina", "chat", transcript.as_bytes())
            .unwrap();
        assert_eq!(summary.chat_size, transcript.len() as u64);
        assert_eq!(summary.chat_hash, hash_transcript(transcript.as_bytes()));
        assert_eq!(summary.chat_hash.len(), 16);
        assert!(summary.is_chat("seraphina", "chat"));
    }
}
