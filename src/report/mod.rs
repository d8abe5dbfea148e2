//! Text and JSON rendering of stats for the CLI.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use num_format::{Locale, ToFormattedString};

use crate::aggregate::AggregateStat;
use crate::config::FormattingConfig;
use crate::store::StatsView;
use crate::types::{ConversationSummary, EntityStats, MetricSet, ModelUsage};


#[derive(Clone)]
pub struct NumberFormatOptions {
    pub use_comma: bool,
    pub use_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl From<&FormattingConfig> for NumberFormatOptions {
    fn from(config: &FormattingConfig) -> Self {
        Self {
            use_comma: config.number_comma,
            use_human: config.number_human,
            locale: config.locale.clone(),
            decimal_places: config.decimal_places,
        }
    }
}

/// Format a number for display. Accepts both u32 and u64.
pub fn format_number(n: impl Into<u64>, options: &NumberFormatOptions) -> String {
    let n: u64 = n.into();
    let locale = match options.locale.as_str() {
        "de" => Locale::de,
        "fr" => Locale::fr,
        "es" => Locale::es,
        "it" => Locale::it,
        "ja" => Locale::ja,
        "ko" => Locale::ko,
        "zh" => Locale::zh,
        _ => Locale::en,
    };

    let prec = options.decimal_places;
    if options.use_human {
        match n {
            n if n >= 1_000_000_000_000 => format!("{:.prec$}t", n as f64 / 1e12),
            n if n >= 1_000_000_000 => format!("{:.prec$}b", n as f64 / 1e9),
            n if n >= 1_000_000 => format!("{:.prec$}m", n as f64 / 1e6),
            n if n >= 1_000 => format!("{:.prec$}k", n as f64 / 1e3),
            n => n.to_string(),
        }
    } else if options.use_comma {
        n.to_formatted_string(&locale)
    } else {
        n.to_string()
    }
}

fn format_total(value: f64, options: &NumberFormatOptions) -> String {
    format_number(value.max(0.0).round() as u64, options)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Humanize a duration in milliseconds, keeping the two largest units.
pub fn format_duration(ms: f64) -> String {
    if !ms.is_finite() || ms <= 0.0 {
        return "0s".to_string();
    }
    if ms < 1_000.0 {
        return format!("{}ms", ms.round() as u64);
    }
    if ms < 60_000.0 {
        return format!("{:.1}s", ms / 1_000.0);
    }

    let total_secs = (ms / 1_000.0).round() as u64;
    let units = [
        (total_secs / 86_400, "d"),
        (total_secs % 86_400 / 3_600, "h"),
        (total_secs % 3_600 / 60, "m"),
        (total_secs % 60, "s"),
    ];

    let Some(first) = units.iter().position(|(value, _)| *value > 0) else {
        return "0s".to_string();
    };
    units[first..]
        .iter()
        .take(2)
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_date(date: Option<DateTime<Utc>>) -> String {
    match date {
        Some(date) => date.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

// ============================================================================
// Text
// ============================================================================

fn line(out: &mut String, label: &str, value: impl AsRef<str>) {
    let _ = writeln!(out, "  {:<20}{}", format!("{label}:"), value.as_ref());
}

fn duration_summary(stat: &AggregateStat) -> String {
    if stat.is_empty() {
        return "-".to_string();
    }
    format!(
        "{} total, {} average",
        format_duration(stat.total),
        format_duration(stat.avg)
    )
}

fn render_models(out: &mut String, models: &ModelUsage, options: &NumberFormatOptions) {
    if models.is_empty() {
        return;
    }
    let mut models: Vec<_> = models.iter().collect();
    models.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

    let _ = writeln!(out, "  Models:");
    for (model, usage) in models {
        let _ = writeln!(
            out,
            "    {model}: {} generations, {} tokens",
            format_number(usage.count, options),
            format_number(usage.tokens, options)
        );
    }
}

fn render_metrics(out: &mut String, metrics: &MetricSet, options: &NumberFormatOptions) {
    line(
        out,
        "Words",
        format!(
            "{} (user {}, character {})",
            format_total(metrics.words.total, options),
            format_total(metrics.user_words.total, options),
            format_total(metrics.char_words.total, options)
        ),
    );
    if !metrics.words.is_empty() {
        line(out, "Words per message", format!("{:.1}", metrics.words.avg));
    }
    line(out, "Generation time", duration_summary(&metrics.gen_time));
    line(out, "Generated tokens", format_total(metrics.gen_tokens.total, options));
    line(
        out,
        "Swipes",
        format!(
            "{} ({})",
            format_total(metrics.swipes.total, options),
            format_duration(metrics.swipe_time.total)
        ),
    );
    let response = if metrics.response_time.is_empty() {
        "-".to_string()
    } else {
        format!("{} average", format_duration(metrics.response_time.avg))
    };
    line(out, "Response time", response);
}

pub fn render_entity(stats: &EntityStats, options: &NumberFormatOptions) -> String {
    let mut out = String::new();
    let title = if stats.is_global() {
        "All characters".to_string()
    } else {
        match stats.char_name.as_deref() {
            Some(name) if name != stats.key => format!("{name} ({})", stats.key),
            _ => stats.key.clone(),
        }
    };
    let _ = writeln!(out, "{title}");

    line(&mut out, "Chats", format_number(stats.chats, options));
    line(&mut out, "Chat size", format_bytes(stats.chat_size));
    line(
        &mut out,
        "Messages",
        format!(
            "{} (user {}, character {}, system {})",
            format_total(stats.messages.total, options),
            format_total(stats.user_messages.total, options),
            format_total(stats.char_messages.total, options),
            format_total(stats.system_messages.total, options)
        ),
    );
    let repeated = stats.repeated_message_count();
    if repeated > 0 {
        line(&mut out, "Repeated messages", format_number(repeated, options));
    }
    render_metrics(&mut out, &stats.message_metrics, options);
    line(&mut out, "Chatting time", format_duration(stats.chatting_time.total));
    line(&mut out, "First chat", format_date(stats.first_create_date));
    line(&mut out, "Last interaction", format_date(stats.last_interaction_date));
    render_models(&mut out, &stats.models, options);
    out
}

pub fn render_conversation(summary: &ConversationSummary, options: &NumberFormatOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} / {}", summary.entity_key, summary.chat_name);

    line(&mut out, "Chat size", format_bytes(summary.chat_size));
    line(
        &mut out,
        "Messages",
        format!(
            "{} (user {}, character {}, system {})",
            format_number(summary.message_count, options),
            format_number(summary.user_msg_count, options),
            format_number(summary.char_msg_count, options),
            format_number(summary.system_msg_count, options)
        ),
    );
    render_metrics(&mut out, &summary.metrics, options);
    line(
        &mut out,
        "Chatting time",
        format_duration(summary.chatting_time.unwrap_or(0.0)),
    );
    line(&mut out, "Created", format_date(summary.create_date));
    line(&mut out, "Last interaction", format_date(summary.last_interaction_date));
    render_models(&mut out, &summary.models, options);
    out
}

pub fn render_view(view: &StatsView, options: &NumberFormatOptions) -> String {
    match view {
        StatsView::Global(stats) | StatsView::Entity(stats) => render_entity(stats, options),
        StatsView::Conversation(summary) => render_conversation(summary, options),
    }
}

// ============================================================================
// JSON
// ============================================================================

fn strip_metrics(metrics: &mut MetricSet) {
    for stat in metrics.stats_mut() {
        stat.values.clear();
    }
}

fn strip_summary(summary: &ConversationSummary) -> Arc<ConversationSummary> {
    let mut summary = summary.clone();
    summary.messages.clear();
    strip_metrics(&mut summary.metrics);
    Arc::new(summary)
}

fn strip_entity(stats: &EntityStats) -> Arc<EntityStats> {
    let mut stats = stats.clone();
    for stat in [
        &mut stats.chatting_time,
        &mut stats.messages,
        &mut stats.user_messages,
        &mut stats.char_messages,
        &mut stats.system_messages,
    ] {
        stat.values.clear();
    }
    strip_metrics(&mut stats.chat_metrics);
    strip_metrics(&mut stats.message_metrics);
    stats.chat_summaries = stats
        .chat_summaries
        .iter()
        .map(|summary| strip_summary(summary))
        .collect();
    Arc::new(stats)
}

/// Drop retained samples and per-message rows, keeping the aggregates.
pub fn without_detail(view: &StatsView) -> StatsView {
    match view {
        StatsView::Global(stats) => StatsView::Global(strip_entity(stats)),
        StatsView::Entity(stats) => StatsView::Entity(strip_entity(stats)),
        StatsView::Conversation(summary) => StatsView::Conversation(strip_summary(summary)),
    }
}

pub fn to_json(view: &StatsView, pretty: bool) -> Result<String> {
    let json = if pretty {
        simd_json::to_string_pretty(view)?
    } else {
        simd_json::to_string(view)?
    };
    Ok(json)
}
