//! Discovery of log levels and other well-known fields.
//!
//! Levels are looked up, in order, in level-like stream labels, level-like
//! structured metadata, JSON or logfmt keys in the line, and finally by
//! scanning the line for level keywords.

use crate::labels::{LabelPair, Labels};
use crate::limits::TenantLimits;
use crate::stream::Entry;
use std::collections::BTreeMap;

/// Structured metadata name carrying the discovered level.
pub const LEVEL_LABEL: &str = "detected_level";

/// Level reported when nothing matched.
pub const LEVEL_UNKNOWN: &str = "unknown";

const LEVEL_FIELDS: &[&str] = &[
    "level",
    "LEVEL",
    "Level",
    "lvl",
    "LVL",
    "Lvl",
    "severity",
    "SEVERITY",
    "Severity",
    "severity_text",
    "SeverityText",
];

/// Per-request view of a tenant's discovery settings.
pub struct FieldDetector<'a> {
    discover_levels: bool,
    generic_fields: &'a BTreeMap<String, Vec<String>>,
}

impl<'a> FieldDetector<'a> {
    /// Detector for a tenant.
    pub fn new(limits: &'a TenantLimits) -> Self {
        Self {
            discover_levels: limits.discover_log_levels,
            generic_fields: &limits.discover_generic_fields,
        }
    }

    /// Returns true if levels should be discovered.
    pub fn should_discover_log_levels(&self) -> bool {
        self.discover_levels
    }

    /// Returns true if any generic field is configured.
    pub fn should_discover_generic_fields(&self) -> bool {
        !self.generic_fields.is_empty()
    }

    /// Configured generic fields and their hint keys.
    pub fn generic_fields(&self) -> &BTreeMap<String, Vec<String>> {
        self.generic_fields
    }

    /// The `detected_level` pair for an entry, or `None` if one is already
    /// present on the stream or the entry.
    pub fn extract_log_level(
        &self,
        labels: &Labels,
        metadata: &[LabelPair],
        entry: &Entry,
    ) -> Option<LabelPair> {
        if labels.has(LEVEL_LABEL) || metadata.iter().any(|p| p.name == LEVEL_LABEL) {
            return None;
        }

        let level = LEVEL_FIELDS
            .iter()
            .find_map(|f| labels.get(f))
            .or_else(|| {
                LEVEL_FIELDS.iter().find_map(|f| {
                    metadata
                        .iter()
                        .find(|p| p.name == *f)
                        .map(|p| p.value.as_str())
                })
            })
            .map(normalize_level)
            .or_else(|| level_from_line(&entry.line))
            .unwrap_or_else(|| LEVEL_UNKNOWN.to_string());

        Some(LabelPair::new(LEVEL_LABEL, level))
    }

    /// Value for a generic field, looked up by each hint key in metadata and
    /// then in the line. `None` if the field is already present or no hint
    /// matched.
    pub fn extract_generic_field(
        &self,
        field: &str,
        hints: &[String],
        labels: &Labels,
        metadata: &[LabelPair],
        entry: &Entry,
    ) -> Option<LabelPair> {
        if labels.has(field) || metadata.iter().any(|p| p.name == field) {
            return None;
        }

        for hint in hints {
            if let Some(p) = metadata.iter().find(|p| &p.name == hint) {
                return Some(LabelPair::new(field, p.value.as_str()));
            }
        }

        let fields = line_fields(&entry.line);
        hints
            .iter()
            .find_map(|hint| fields.get(hint.as_str()))
            .map(|value| LabelPair::new(field, value.as_str()))
    }
}

fn normalize_level(value: &str) -> String {
    match value.to_ascii_lowercase().as_str() {
        "trace" | "trc" => "trace",
        "debug" | "dbg" => "debug",
        "info" | "inf" | "information" | "notice" => "info",
        "warn" | "warning" | "wrn" => "warn",
        "error" | "err" | "eror" => "error",
        "critical" | "crit" => "critical",
        "fatal" | "ftl" | "panic" => "fatal",
        _ => return value.to_string(),
    }
    .to_string()
}

fn level_from_line(line: &str) -> Option<String> {
    let fields = line_fields(line);
    if let Some(level) = LEVEL_FIELDS.iter().find_map(|f| fields.get(*f)) {
        return Some(normalize_level(level));
    }
    level_from_keywords(line).map(str::to_string)
}

fn level_from_keywords(line: &str) -> Option<&'static str> {
    let mut found: Option<(u8, &'static str)> = None;
    for word in line.split(|c: char| !c.is_ascii_alphabetic()) {
        let candidate = match word.to_ascii_lowercase().as_str() {
            "fatal" | "panic" => (6, "fatal"),
            "critical" | "crit" => (5, "critical"),
            "error" | "err" => (4, "error"),
            "warn" | "warning" => (3, "warn"),
            "info" => (2, "info"),
            "debug" => (1, "debug"),
            "trace" => (0, "trace"),
            _ => continue,
        };
        if found.map_or(true, |(rank, _)| candidate.0 > rank) {
            found = Some(candidate);
        }
    }
    found.map(|(_, level)| level)
}

/// Top-level key/value pairs of a JSON object line, or of a logfmt line.
fn line_fields(line: &str) -> BTreeMap<String, String> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            return map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    serde_json::Value::Number(n) => Some((k, n.to_string())),
                    serde_json::Value::Bool(b) => Some((k, b.to_string())),
                    _ => None,
                })
                .collect();
        }
    }
    logfmt_fields(line)
}

fn logfmt_fields(line: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut key_end = start;
        let mut has_value = false;
        while let Some(&(i, c)) = chars.peek() {
            if c == '=' {
                key_end = i;
                has_value = true;
                chars.next();
                break;
            }
            if c.is_whitespace() {
                key_end = i;
                break;
            }
            key_end = i + c.len_utf8();
            chars.next();
        }
        let key = &line[start..key_end];
        if !has_value {
            continue;
        }

        let mut value = String::new();
        if let Some(&(_, '"')) = chars.peek() {
            chars.next();
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        if !key.is_empty() {
            fields.insert(key.to_string(), value);
        }
    }
    fields
}
