//! JSONL chat transcript schema.
//!
//! One line per record. The first line of a chat file may be a header
//! carrying the creation date and chat metadata instead of a message.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde::de::IgnoredAny;

// ============================================================================
// Timestamps
// ============================================================================

/// A timestamp as stored in transcripts: epoch milliseconds or text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Millis(ms) => millis_to_datetime(*ms),
            RawTimestamp::Text(text) => parse_timestamp(text),
        }
    }
}

fn millis_to_datetime(ms: f64) -> Option<DateTime<Utc>> {
    if !ms.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(ms as i64)
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse any of the timestamp formats found in chat files.
///
/// Formats without an offset are taken as local time.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(ms) = text.parse::<f64>() {
        return millis_to_datetime(ms);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return local_to_utc(naive);
    }

    if let Some(naive) = parse_humanized(text) {
        return local_to_utc(naive);
    }

    // "May 1, 2024 1:45pm"
    NaiveDateTime::parse_from_str(text, "%B %d, %Y %I:%M%p")
        .ok()
        .and_then(local_to_utc)
}

/// `2024-05-01@13h45m07s` and `2024-5-1 @13h 45m 7s 120ms`.
fn parse_humanized(text: &str) -> Option<NaiveDateTime> {
    let (date, time) = text.split_once('@')?;
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;

    let (mut hours, mut minutes, mut seconds, mut millis) = (0u32, 0u32, 0u32, 0u32);
    let mut digits = String::new();
    let mut chars = time.chars().filter(|c| !c.is_whitespace()).peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u32 = digits.parse().ok()?;
        digits.clear();
        match c {
            'h' => hours = value,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                millis = value;
            }
            'm' => minutes = value,
            's' => seconds = value,
            _ => return None,
        }
    }

    if !digits.is_empty() {
        return None;
    }

    date.and_hms_milli_opt(hours, minutes, seconds, millis)
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordExtra {
    #[serde(default)]
    pub token_count: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// One stored alternate generation of a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwipeInfo {
    #[serde(default)]
    pub gen_started: Option<RawTimestamp>,
    #[serde(default)]
    pub gen_finished: Option<RawTimestamp>,
    #[serde(default)]
    pub extra: Option<RecordExtra>,
}

impl SwipeInfo {
    pub fn model(&self) -> Option<&str> {
        self.extra.as_ref().and_then(|e| e.model.as_deref())
    }

    pub fn token_count(&self) -> u64 {
        token_count(self.extra.as_ref())
    }
}

fn token_count(extra: Option<&RecordExtra>) -> u64 {
    extra
        .and_then(|e| e.token_count)
        .filter(|t| t.is_finite() && *t > 0.0)
        .map(|t| t as u64)
        .unwrap_or(0)
}

/// A chat message line.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRecord {
    #[serde(default)]
    pub name: Option<String>,
    pub is_user: bool,
    #[serde(default)]
    pub is_system: bool,
    pub mes: String,
    #[serde(default)]
    pub send_date: Option<RawTimestamp>,
    #[serde(default)]
    pub gen_started: Option<RawTimestamp>,
    #[serde(default)]
    pub gen_finished: Option<RawTimestamp>,
    #[serde(default)]
    pub extra: Option<RecordExtra>,
    #[serde(default)]
    pub swipes: Option<Vec<IgnoredAny>>,
    #[serde(default)]
    pub swipe_info: Option<Vec<Option<SwipeInfo>>>,
}

impl ChatRecord {
    pub fn model(&self) -> Option<&str> {
        self.extra.as_ref().and_then(|e| e.model.as_deref())
    }

    pub fn token_count(&self) -> u64 {
        token_count(self.extra.as_ref())
    }

    /// Stored alternates minus one, `None` when no alternates are stored.
    pub fn stored_swipe_count(&self) -> Option<u64> {
        let stored = match (&self.swipes, &self.swipe_info) {
            (Some(swipes), _) => swipes.len(),
            (None, Some(info)) => info.len(),
            (None, None) => return None,
        };
        (stored as u64).checked_sub(1)
    }
}

/// First line of a chat file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatHeader {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub create_date: Option<RawTimestamp>,
    #[serde(default)]
    chat_metadata: Option<IgnoredAny>,
    #[serde(default)]
    mes: Option<IgnoredAny>,
}

impl ChatHeader {
    fn is_header(&self) -> bool {
        self.mes.is_none() && (self.create_date.is_some() || self.chat_metadata.is_some())
    }
}

#[derive(Debug, Clone)]
pub enum TranscriptLine {
    Header(ChatHeader),
    Message(Box<ChatRecord>),
}

/// Parse a transcript, skipping lines that are not valid records.
pub fn parse_transcript(bytes: &[u8]) -> Vec<TranscriptLine> {
    let mut lines = Vec::new();
    let mut seen_first = false;

    for (i, line) in bytes.split(|&b| b == b'\n').enumerate() {
        if line.is_empty() || line.iter().all(|&b| b.is_ascii_whitespace()) {
            continue;
        }

        let is_first = !seen_first;
        seen_first = true;

        if is_first {
            let mut line_buf = line.to_vec();
            if let Ok(header) = simd_json::from_slice::<ChatHeader>(&mut line_buf)
                && header.is_header()
            {
                lines.push(TranscriptLine::Header(header));
                continue;
            }
        }

        let mut line_buf = line.to_vec();
        match simd_json::from_slice::<ChatRecord>(&mut line_buf) {
            Ok(record) => lines.push(TranscriptLine::Message(Box::new(record))),
            Err(e) => {
                tracing::warn!(line = i + 1, error = %e, "skipping malformed transcript record");
            }
        }
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap();
        local_to_utc(naive).unwrap()
    }

    #[test]
    fn parses_rfc3339_and_millis() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 7).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T13:45:07Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T13:45:07.000Z"), Some(expected));
        assert_eq!(
            parse_timestamp(&expected.timestamp_millis().to_string()),
            Some(expected)
        );
        assert_eq!(
            RawTimestamp::Millis(expected.timestamp_millis() as f64).to_datetime(),
            Some(expected)
        );
    }

    #[test]
    fn parses_humanized_forms_as_local_time() {
        assert_eq!(
            parse_timestamp("2024-05-01@13h45m07s"),
            Some(local(2024, 5, 1, 13, 45, 7))
        );
        let with_millis = parse_timestamp("2024-5-1 @13h 45m 7s 120ms").unwrap();
        assert_eq!(
            with_millis.timestamp_millis(),
            local(2024, 5, 1, 13, 45, 7).timestamp_millis() + 120
        );
    }

    #[test]
    fn parses_legacy_display_form() {
        assert_eq!(
            parse_timestamp("May 1, 2024 1:45pm"),
            Some(local(2024, 5, 1, 13, 45, 0))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2024-05-01@13x"), None);
    }

    #[test]
    fn parse_transcript_detects_header_and_skips_bad_lines() {
        let data = br#"{"user_name":"You","character_name":"Seraphina","create_date":"2024-05-01@13h45m07s","chat_metadata":{}}
{"name":"You","is_user":true,"is_system":false,"send_date":"2024-05-01T13:46:00Z","mes":"hi"}
not json at all
{"name":"Seraphina","is_user":false}

{"name":"Seraphina","is_user":false,"send_date":1714571220000,"mes":"hello","extra":{"token_count":12,"model":"gpt-4o"}}
"#;
        let lines = parse_transcript(data);
        assert_eq!(lines.len(), 3);

        match &lines[0] {
            TranscriptLine::Header(header) => {
                assert_eq!(header.character_name.as_deref(), Some("Seraphina"));
                assert!(header.create_date.is_some());
            }
            other => panic!("expected header, got {other:?}"),
        }
        match &lines[2] {
            TranscriptLine::Message(record) => {
                assert_eq!(record.model(), Some("gpt-4o"));
                assert_eq!(record.token_count(), 12);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn first_line_message_is_not_a_header() {
        let data = br#"{"name":"You","is_user":true,"send_date":"2024-05-01T13:46:00Z","mes":"hi"}"#;
        let lines = parse_transcript(data);
        assert!(matches!(lines.as_slice(), [TranscriptLine::Message(_)]));
    }

    #[test]
    fn stored_swipe_count_is_alternates_minus_one() {
        let mut data = br#"{"is_user":false,"mes":"a","swipes":["a","b","c"]}"#.to_vec();
        let record: ChatRecord = simd_json::from_slice(&mut data).unwrap();
        assert_eq!(record.stored_swipe_count(), Some(2));

        let mut data = br#"{"is_user":false,"mes":"a"}"#.to_vec();
        let record: ChatRecord = simd_json::from_slice(&mut data).unwrap();
        assert_eq!(record.stored_swipe_count(), None);
    }
}
