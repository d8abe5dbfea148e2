//! Per-message metrics extraction.

use chrono::{DateTime, Utc};
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::xxh3_64;

use crate::transcript::{ChatRecord, RawTimestamp};
use crate::types::MessageStats;

/// Count word-like segments using Unicode word boundaries.
///
/// Scripts without spaces between words (CJK) are split per segment instead
/// of counting as a single word.
pub fn count_words(text: &str) -> u64 {
    text.unicode_words().count() as u64
}

#[inline]
pub fn hash_message(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// Milliseconds from `start` to `end`, never negative.
#[inline]
pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64
}

fn resolve(ts: &Option<RawTimestamp>) -> Option<DateTime<Utc>> {
    ts.as_ref().and_then(RawTimestamp::to_datetime)
}

/// Turn one transcript record into [`MessageStats`].
pub fn extract_message_stats(record: &ChatRecord) -> MessageStats {
    let mut stats = MessageStats {
        is_user: record.is_user,
        is_character: !record.is_user && !record.is_system,
        is_system: record.is_system,
        hash: (!record.mes.is_empty()).then(|| hash_message(&record.mes)),
        send_date: resolve(&record.send_date),
        words: count_words(&record.mes),
        stored_swipes: record.stored_swipe_count(),
        ..Default::default()
    };

    if record.is_user {
        return stats;
    }

    let primary_start = resolve(&record.gen_started);
    let primary_end = resolve(&record.gen_finished);
    let mut has_generation = false;

    if let (Some(start), Some(end)) = (primary_start, primary_end) {
        let tokens = record.token_count();
        stats.gen_time = Some(duration_ms(start, end));
        stats.gen_tokens = Some(tokens as f64);
        stats.gen_ends.push(end);
        if let Some(model) = record.model() {
            stats.models.increment(model, tokens);
        }
        has_generation = true;
    }

    let alternates = record.swipe_info.as_deref().unwrap_or_default();
    let mut swipes = 0u64;
    let mut swipe_time = 0.0;

    // The first alternate is the original generation, never a swipe
    for swipe in alternates.iter().skip(1).flatten() {
        let (Some(start), Some(end)) = (resolve(&swipe.gen_started), resolve(&swipe.gen_finished))
        else {
            continue;
        };
        // The primary generation may also be stored among later alternates
        if Some(start) == primary_start {
            continue;
        }

        let time = duration_ms(start, end);
        stats.gen_time = Some(stats.gen_time.unwrap_or(0.0) + time);
        swipe_time += time;
        swipes += 1;
        stats.gen_ends.push(end);
        if let Some(model) = swipe.model() {
            stats.models.increment(model, swipe.token_count());
        }
    }

    if has_generation || !alternates.is_empty() {
        stats.swipes = Some(swipes as f64);
        stats.swipe_time = Some(swipe_time);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(json: &str) -> ChatRecord {
        let mut bytes = json.as_bytes().to_vec();
        simd_json::from_slice(&mut bytes).expect("valid record")
    }

    #[test]
    fn counts_words_by_unicode_segmentation() {
        assert_eq!(count_words("Hello, world! 你好"), 4);
        assert_eq!(count_words("  spaced   out  "), 2);
        assert_eq!(count_words("..."), 0);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn empty_text_has_no_hash() {
        let empty = extract_message_stats(&record(r#"{"is_user":true,"mes":""}"#));
        assert_eq!(empty.hash, None);

        let a = extract_message_stats(&record(r#"{"is_user":true,"mes":"same"}"#));
        let b = extract_message_stats(&record(r#"{"is_user":false,"mes":"same"}"#));
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.as_deref().map(str::len), Some(16));
    }

    #[test]
    fn human_turn_only_has_words_and_date() {
        let stats = extract_message_stats(&record(
            r#"{"name":"You","is_user":true,"send_date":"2024-05-01T10:00:00Z","mes":"how are you today","gen_started":"2024-05-01T09:59:00Z","gen_finished":"2024-05-01T10:00:00Z"}"#,
        ));
        assert!(stats.is_user);
        assert!(!stats.is_character);
        assert_eq!(stats.words, 4);
        assert_eq!(
            stats.send_date,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(stats.gen_time, None);
        assert_eq!(stats.gen_tokens, None);
        assert_eq!(stats.swipes, None);
        assert!(stats.gen_ends.is_empty());
        assert!(stats.models.is_empty());
    }

    #[test]
    fn assistant_turn_records_generation() {
        let stats = extract_message_stats(&record(
            r#"{"name":"Seraphina","is_user":false,"send_date":"2024-05-01T10:00:05Z","mes":"Hi there","gen_started":"2024-05-01T10:00:01Z","gen_finished":"2024-05-01T10:00:05Z","extra":{"token_count":42,"model":"gpt-4o"}}"#,
        ));
        assert!(stats.is_character);
        assert_eq!(stats.gen_time, Some(4000.0));
        assert_eq!(stats.gen_tokens, Some(42.0));
        assert_eq!(stats.swipes, Some(0.0));
        assert_eq!(stats.swipe_time, Some(0.0));
        assert_eq!(
            stats.gen_ends,
            vec![Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap()]
        );
        let usage = stats.models.get("gpt-4o").expect("model usage");
        assert_eq!((usage.count, usage.tokens), (1, 42));
    }

    #[test]
    fn missing_token_count_defaults_to_zero() {
        let stats = extract_message_stats(&record(
            r#"{"is_user":false,"mes":"x","gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:01Z"}"#,
        ));
        assert_eq!(stats.gen_tokens, Some(0.0));
        assert!(stats.models.is_empty());
    }

    #[test]
    fn only_complete_differing_alternates_count_as_swipes() {
        // Three stored alternates: the primary itself, one complete regeneration
        // and one that never finished.
        let stats = extract_message_stats(&record(
            r#"{"is_user":false,"mes":"third","gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:02Z",
                "extra":{"model":"gpt-4o","token_count":10},
                "swipes":["first","second","third"],
                "swipe_info":[
                    {"gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:02Z","extra":{"model":"gpt-4o","token_count":10}},
                    {"gen_started":"2024-05-01T10:00:10Z","gen_finished":"2024-05-01T10:00:13Z","extra":{"model":"claude-3-opus","token_count":20}},
                    {"gen_started":"2024-05-01T10:00:20Z"}
                ]}"#,
        ));
        assert_eq!(stats.stored_swipes, Some(2));
        assert_eq!(stats.swipes, Some(1.0));
        assert_eq!(stats.swipe_time, Some(3000.0));
        assert_eq!(stats.gen_time, Some(5000.0));
        assert_eq!(stats.gen_ends.len(), 2);
        assert_eq!(stats.models.get("claude-3-opus").map(|u| u.tokens), Some(20));
        assert_eq!(stats.models.get("gpt-4o").map(|u| u.count), Some(1));
    }

    #[test]
    fn two_complete_regenerations_out_of_three_alternates() {
        let stats = extract_message_stats(&record(
            r#"{"is_user":false,"mes":"c","gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:01Z",
                "swipe_info":[
                    {"gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:01Z"},
                    {"gen_started":"2024-05-01T10:01:00Z","gen_finished":"2024-05-01T10:01:02Z"},
                    {"gen_started":"2024-05-01T10:02:00Z","gen_finished":"2024-05-01T10:02:04Z"}
                ]}"#,
        ));
        assert_eq!(stats.swipes, Some(2.0));
        assert_eq!(stats.swipe_time, Some(6000.0));
        assert_eq!(stats.gen_time, Some(7000.0));
    }

    #[test]
    fn first_alternate_is_not_a_swipe() {
        let stats = extract_message_stats(&record(
            r#"{"is_user":false,"mes":"only","swipe_info":[{"gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:03Z"}]}"#,
        ));
        assert_eq!(stats.swipes, Some(0.0));
        assert_eq!(stats.swipe_time, Some(0.0));
        assert_eq!(stats.gen_time, None);
        assert!(stats.gen_ends.is_empty());
    }

    #[test]
    fn later_alternate_matching_the_primary_start_is_skipped() {
        let stats = extract_message_stats(&record(
            r#"{"is_user":false,"mes":"b","gen_started":"2024-05-01T10:01:00Z","gen_finished":"2024-05-01T10:01:02Z","swipe_info":[{"gen_started":"2024-05-01T10:00:00Z","gen_finished":"2024-05-01T10:00:01Z"},{"gen_started":"2024-05-01T10:01:00Z","gen_finished":"2024-05-01T10:01:02Z"}]}"#,
        ));
        assert_eq!(stats.swipes, Some(0.0));
        assert_eq!(stats.gen_time, Some(2000.0));
        assert_eq!(stats.gen_ends.len(), 1);
    }

    #[test]
    fn system_message_is_neither_user_nor_character() {
        let stats =
            extract_message_stats(&record(r#"{"is_user":false,"is_system":true,"mes":"note"}"#));
        assert!(stats.is_system);
        assert!(!stats.is_character);
        assert_eq!(stats.swipes, None);
    }
}
