//! Stream and entry validation.
//!
//! Every check reports what it discards to the discard metrics and the usage
//! tracker, so callers only have to decide what to do with the error.

use crate::labels::{is_valid_label_name, LabelPair, Labels};
use crate::limits::{Limits, TenantLimits};
use crate::metrics::DistributorMetrics;
use crate::stream::{Entry, Stream};
use crate::usage::UsageTracker;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Why data was discarded or mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// The label string could not be parsed.
    InvalidLabels,
    /// The stream has no labels.
    MissingLabels,
    /// Too many labels.
    MaxLabelNamesPerSeries,
    /// A label name is too long.
    LabelNameTooLong,
    /// A label value is too long.
    LabelValueTooLong,
    /// A label name appears twice.
    DuplicateLabelNames,
    /// A required label is missing.
    MissingEnforcedLabels,
    /// The entry is older than the tenant accepts.
    GreaterThanMaxSampleAge,
    /// The entry is too far in the future.
    TooFarInFuture,
    /// The line exceeds the maximum line size.
    LineTooLong,
    /// Structured metadata is not allowed for the tenant.
    DisallowedStructuredMetadata,
    /// Structured metadata exceeds the size limit.
    StructuredMetadataTooLarge,
    /// Structured metadata exceeds the entry count limit.
    StructuredMetadataTooMany,
    /// The tenant's ingestion is blocked.
    BlockedIngestion,
    /// The stream's policy is blocked.
    BlockedIngestionPolicy,
    /// The tenant exceeded its ingestion rate.
    RateLimited,
    /// The limits service rejected the stream.
    StreamLimit,
}

impl DiscardReason {
    /// Metric label for the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::InvalidLabels => "invalid_labels",
            DiscardReason::MissingLabels => "missing_labels",
            DiscardReason::MaxLabelNamesPerSeries => "max_label_names_per_series",
            DiscardReason::LabelNameTooLong => "label_name_too_long",
            DiscardReason::LabelValueTooLong => "label_value_too_long",
            DiscardReason::DuplicateLabelNames => "duplicate_label_names",
            DiscardReason::MissingEnforcedLabels => "missing_enforced_labels",
            DiscardReason::GreaterThanMaxSampleAge => "greater_than_max_sample_age",
            DiscardReason::TooFarInFuture => "too_far_in_future",
            DiscardReason::LineTooLong => "line_too_long",
            DiscardReason::DisallowedStructuredMetadata => "disallowed_structured_metadata",
            DiscardReason::StructuredMetadataTooLarge => "structured_metadata_too_large",
            DiscardReason::StructuredMetadataTooMany => "structured_metadata_too_many",
            DiscardReason::BlockedIngestion => "blocked_ingestion",
            DiscardReason::BlockedIngestionPolicy => "blocked_ingestion_policy",
            DiscardReason::RateLimited => "rate_limited",
            DiscardReason::StreamLimit => "stream_limit",
        }
    }
}

/// A rejected stream or entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    /// Discard reason.
    pub reason: DiscardReason,
    /// Message returned to the client.
    pub message: String,
}

impl ValidationError {
    fn new(reason: DiscardReason, message: String) -> Self {
        Self { reason, message }
    }
}

/// Ingestion block in effect for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionBlock {
    /// Status code configured for the block.
    pub status: u16,
    /// Discard reason.
    pub reason: DiscardReason,
    /// Message for logs and the client.
    pub message: String,
}

/// Snapshot of a tenant's limits at the time a request arrived.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Request time in Unix nanoseconds.
    pub now_ns: i64,
    /// Effective limits.
    pub limits: Arc<TenantLimits>,
}

impl ValidationContext {
    /// Context for a tenant at `now`.
    pub fn new(tenant_id: &str, now: SystemTime, limits: Arc<TenantLimits>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            now_ns: unix_nanos(now),
            limits,
        }
    }

    fn oldest_allowed_ns(&self) -> i64 {
        self.now_ns
            .saturating_sub(secs_to_nanos(self.limits.reject_old_samples_max_age_secs))
    }

    fn newest_allowed_ns(&self) -> i64 {
        self.now_ns
            .saturating_add(secs_to_nanos(self.limits.creation_grace_period_secs))
    }
}

/// Result of parsing and validating a stream's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLabels {
    /// Parsed label set.
    pub labels: Labels,
    /// Canonical label string.
    pub canonical: String,
    /// Stable label hash.
    pub hash: u64,
    /// Policy the stream belongs to (may be empty).
    pub policy: String,
}

/// Labels already parsed within one request, keyed by the raw label string.
/// Only successful parses are kept.
#[derive(Debug, Default)]
pub struct LabelCache {
    parsed: HashMap<String, ParsedLabels>,
}

impl LabelCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct label strings cached.
    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }
}

/// Accepted line totals of one request, overall and per policy.
#[derive(Debug, Clone, Default)]
pub struct PushStats {
    /// Accepted entries.
    pub line_count: usize,
    /// Accepted bytes (line plus structured metadata).
    pub line_size: usize,
    by_policy: HashMap<String, (usize, usize)>,
}

impl PushStats {
    /// Account for an accepted entry.
    pub fn compute(&mut self, entry: &Entry, policy: &str) {
        let size = entry_total_size(entry);
        self.line_count += 1;
        self.line_size += size;
        let slot = self.by_policy.entry(policy.to_string()).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += size;
    }

    /// `(policy, entries, bytes)` per policy.
    pub fn by_policy(&self) -> impl Iterator<Item = (&str, usize, usize)> {
        self.by_policy
            .iter()
            .map(|(policy, (count, size))| (policy.as_str(), *count, *size))
    }
}

/// Validates streams and entries against tenant limits.
pub struct Validator {
    limits: Arc<dyn Limits>,
    metrics: DistributorMetrics,
    usage: Option<Arc<dyn UsageTracker>>,
}

impl Validator {
    /// Create a validator.
    pub fn new(
        limits: Arc<dyn Limits>,
        metrics: DistributorMetrics,
        usage: Option<Arc<dyn UsageTracker>>,
    ) -> Self {
        Self {
            limits,
            metrics,
            usage,
        }
    }

    /// Limits snapshot for a tenant at `now`.
    pub fn validation_context(&self, now: SystemTime, tenant_id: &str) -> ValidationContext {
        ValidationContext::new(tenant_id, now, self.limits.tenant_limits(tenant_id))
    }

    /// Truncate over-long lines in place when the tenant enables truncation.
    pub fn truncate_lines(&self, ctx: &ValidationContext, stream: &mut Stream) {
        let limits = &ctx.limits;
        if !limits.max_line_size_truncate || limits.max_line_size == 0 {
            return;
        }
        let suffix = limits.max_line_size_truncate_identifier.as_str();
        let Some(truncate_to) = limits.max_line_size.checked_sub(suffix.len()) else {
            return;
        };
        if truncate_to == 0 {
            return;
        }

        let mut truncated_samples = 0u64;
        let mut truncated_bytes = 0u64;
        for entry in &mut stream.entries {
            if entry.line.len() <= limits.max_line_size {
                continue;
            }
            let mut cut = truncate_to;
            while !entry.line.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated_bytes += (entry.line.len() - cut) as u64;
            truncated_samples += 1;
            entry.line.truncate(cut);
            entry.line.push_str(suffix);
        }

        if truncated_samples > 0 {
            let labels = [DiscardReason::LineTooLong.as_str(), ctx.tenant_id.as_str()];
            self.metrics
                .mutated_samples
                .with_label_values(&labels)
                .inc_by(truncated_samples);
            self.metrics
                .mutated_bytes
                .with_label_values(&labels)
                .inc_by(truncated_bytes);
        }
    }

    /// Parse a stream's labels, resolve its policy and validate the set.
    pub fn parse_stream_labels(
        &self,
        ctx: &ValidationContext,
        stream: &Stream,
        format: &str,
    ) -> Result<ParsedLabels, ValidationError> {
        let labels = match Labels::parse(&stream.labels) {
            Ok(labels) => labels,
            Err(e) => {
                self.report_discarded(
                    ctx,
                    DiscardReason::InvalidLabels,
                    &Labels::empty(),
                    "",
                    entries_total_size(&stream.entries),
                    stream.entries.len(),
                    format,
                );
                return Err(ValidationError::new(
                    DiscardReason::InvalidLabels,
                    format!(
                        "error parsing labels '{}' with error: {}",
                        stream.labels, e
                    ),
                ));
            }
        };

        let policy = ctx.limits.policy_for(&ctx.tenant_id, &labels);
        self.validate_labels(ctx, &labels, stream, &policy, format)?;

        Ok(ParsedLabels {
            canonical: labels.to_string(),
            hash: labels.stable_hash(),
            labels,
            policy,
        })
    }

    /// [`Validator::parse_stream_labels`] reusing the result for a label
    /// string already seen in the same request.
    pub fn parse_stream_labels_cached(
        &self,
        ctx: &ValidationContext,
        stream: &Stream,
        format: &str,
        cache: &mut LabelCache,
    ) -> Result<ParsedLabels, ValidationError> {
        if let Some(parsed) = cache.parsed.get(&stream.labels) {
            return Ok(parsed.clone());
        }
        let parsed = self.parse_stream_labels(ctx, stream, format)?;
        cache.parsed.insert(stream.labels.clone(), parsed.clone());
        Ok(parsed)
    }

    /// Check label count, name and value lengths, and duplicates.
    pub fn validate_labels(
        &self,
        ctx: &ValidationContext,
        labels: &Labels,
        stream: &Stream,
        policy: &str,
        format: &str,
    ) -> Result<(), ValidationError> {
        let limits = &ctx.limits;
        let result = if labels.is_empty() {
            Err(ValidationError::new(
                DiscardReason::MissingLabels,
                "error at least one label pair is required per stream".to_string(),
            ))
        } else if labels.len() > limits.max_label_names_per_series {
            Err(ValidationError::new(
                DiscardReason::MaxLabelNamesPerSeries,
                format!(
                    "entry for stream '{}' has {} label names; limit {}",
                    stream.labels,
                    labels.len(),
                    limits.max_label_names_per_series
                ),
            ))
        } else {
            check_label_pairs(labels, &stream.labels, limits)
        };

        if let Err(err) = &result {
            self.report_discarded(
                ctx,
                err.reason,
                labels,
                policy,
                entries_total_size(&stream.entries),
                stream.entries.len(),
                format,
            );
        }
        result
    }

    /// Enforced labels (tenant-wide and per policy) missing from `labels`,
    /// in configuration order and without duplicates.
    pub fn missing_enforced_labels(
        &self,
        ctx: &ValidationContext,
        labels: &Labels,
        policy: &str,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        ctx.limits
            .enforced_labels
            .iter()
            .chain(ctx.limits.policy_enforced_labels(policy))
            .filter(|name| seen.insert(name.as_str()))
            .filter(|name| !labels.has(name))
            .cloned()
            .collect()
    }

    /// Check one entry's timestamp, line size and structured metadata.
    pub fn validate_entry(
        &self,
        ctx: &ValidationContext,
        labels: &Labels,
        stream_labels: &str,
        entry: &Entry,
        policy: &str,
        format: &str,
    ) -> Result<(), ValidationError> {
        let result = check_entry(ctx, stream_labels, entry);
        if let Err(err) = &result {
            self.report_discarded(
                ctx,
                err.reason,
                labels,
                policy,
                entry_total_size(entry),
                1,
                format,
            );
        }
        result
    }

    /// Rewrite structured metadata names to valid label names and replace
    /// invalid UTF-8 placeholders in values with a space.
    pub fn normalize_structured_metadata(
        &self,
        ctx: &ValidationContext,
        entry: &mut Entry,
        format: &str,
    ) {
        let mut sanitized = 0u64;
        let mut changed_names = false;
        for pair in &mut entry.structured_metadata {
            if !is_valid_label_name(&pair.name) {
                pair.name = normalize_label_name(&pair.name);
                changed_names = true;
                sanitized += 1;
            }
            if pair.value.contains(char::REPLACEMENT_CHARACTER) {
                pair.value = pair.value.replace(char::REPLACEMENT_CHARACTER, " ");
                sanitized += 1;
            }
        }

        if changed_names {
            let merged: BTreeMap<String, String> = entry
                .structured_metadata
                .drain(..)
                .map(|p| (p.name, p.value))
                .collect();
            entry.structured_metadata = merged
                .into_iter()
                .map(|(name, value)| LabelPair { name, value })
                .collect();
        }

        if sanitized > 0 {
            self.metrics
                .structured_metadata_sanitized
                .with_label_values(&[ctx.tenant_id.as_str(), format])
                .inc_by(sanitized);
        }
    }

    /// Block in effect for the tenant or the stream's policy, if any.
    pub fn should_block_ingestion(
        &self,
        ctx: &ValidationContext,
        policy: &str,
    ) -> Option<IngestionBlock> {
        let limits = &ctx.limits;
        let now_secs = ctx.now_ns.div_euclid(NANOS_PER_SEC);
        let status = limits.blocked_ingestion_status_code;

        if let Some(until) = limits.blocked_ingestion_until {
            if until > now_secs {
                return Some(IngestionBlock {
                    status,
                    reason: DiscardReason::BlockedIngestion,
                    message: format!(
                        "ingestion blocked for user {} until unix time {} with status code {}",
                        ctx.tenant_id, until, status
                    ),
                });
            }
        }

        match limits.block_policy_ingestion_until.get(policy) {
            Some(&until) if until > now_secs => Some(IngestionBlock {
                status,
                reason: DiscardReason::BlockedIngestionPolicy,
                message: format!(
                    "ingestion blocked for user {} (policy: {}) until unix time {} with status code {}",
                    ctx.tenant_id, policy, until, status
                ),
            }),
            _ => None,
        }
    }

    /// Record discarded entries and bytes in metrics and the usage tracker.
    #[allow(clippy::too_many_arguments)]
    pub fn report_discarded(
        &self,
        ctx: &ValidationContext,
        reason: DiscardReason,
        labels: &Labels,
        policy: &str,
        bytes: usize,
        count: usize,
        format: &str,
    ) {
        self.metrics.record_discarded(
            reason.as_str(),
            &ctx.tenant_id,
            policy,
            format,
            count,
            bytes,
        );
        if let Some(usage) = &self.usage {
            usage.discarded_bytes_add(&ctx.tenant_id, reason.as_str(), labels, bytes as f64, format);
        }
    }
}

fn check_label_pairs(
    labels: &Labels,
    stream_labels: &str,
    limits: &TenantLimits,
) -> Result<(), ValidationError> {
    let mut last_name: Option<&str> = None;
    for pair in labels.iter() {
        if pair.name.len() > limits.max_label_name_length {
            return Err(ValidationError::new(
                DiscardReason::LabelNameTooLong,
                format!(
                    "stream '{}' has label name too long: '{}'",
                    stream_labels, pair.name
                ),
            ));
        }
        if pair.value.len() > limits.max_label_value_length {
            return Err(ValidationError::new(
                DiscardReason::LabelValueTooLong,
                format!(
                    "stream '{}' has label value too long: '{}'",
                    stream_labels, pair.value
                ),
            ));
        }
        if last_name == Some(pair.name.as_str()) {
            return Err(ValidationError::new(
                DiscardReason::DuplicateLabelNames,
                format!(
                    "stream '{}' has duplicate label name: '{}'",
                    stream_labels, pair.name
                ),
            ));
        }
        last_name = Some(pair.name.as_str());
    }
    Ok(())
}

fn check_entry(
    ctx: &ValidationContext,
    stream_labels: &str,
    entry: &Entry,
) -> Result<(), ValidationError> {
    let limits = &ctx.limits;
    let ts = entry.timestamp_ns;

    if limits.reject_old_samples && ts < ctx.oldest_allowed_ns() {
        return Err(ValidationError::new(
            DiscardReason::GreaterThanMaxSampleAge,
            format!(
                "entry for stream '{}' has timestamp too old: {}, oldest acceptable timestamp is: {}",
                stream_labels,
                ts,
                ctx.oldest_allowed_ns()
            ),
        ));
    }
    if ts > ctx.newest_allowed_ns() {
        return Err(ValidationError::new(
            DiscardReason::TooFarInFuture,
            format!(
                "entry for stream '{}' has timestamp too new: {}",
                stream_labels, ts
            ),
        ));
    }
    if limits.max_line_size != 0 && entry.line.len() > limits.max_line_size {
        return Err(ValidationError::new(
            DiscardReason::LineTooLong,
            format!(
                "max entry size '{}' bytes exceeded for stream '{}' while adding an entry with length '{}' bytes",
                limits.max_line_size,
                stream_labels,
                entry.line.len()
            ),
        ));
    }

    if entry.structured_metadata.is_empty() {
        return Ok(());
    }
    if !limits.allow_structured_metadata {
        return Err(ValidationError::new(
            DiscardReason::DisallowedStructuredMetadata,
            format!(
                "stream '{}' includes structured metadata, but this feature is disallowed for the tenant",
                stream_labels
            ),
        ));
    }
    let size = entry.structured_metadata_size();
    if limits.max_structured_metadata_size != 0 && size > limits.max_structured_metadata_size {
        return Err(ValidationError::new(
            DiscardReason::StructuredMetadataTooLarge,
            format!(
                "stream '{}' has structured metadata too large: '{}' bytes, limit: '{}' bytes",
                stream_labels, size, limits.max_structured_metadata_size
            ),
        ));
    }
    let count = entry.structured_metadata.len();
    if limits.max_structured_metadata_entries_count != 0
        && count > limits.max_structured_metadata_entries_count
    {
        return Err(ValidationError::new(
            DiscardReason::StructuredMetadataTooMany,
            format!(
                "stream '{}' has too many structured metadata labels: '{}', limit: '{}'",
                stream_labels, count, limits.max_structured_metadata_entries_count
            ),
        ));
    }
    Ok(())
}

/// Rewrite `name` to `[a-zA-Z_][a-zA-Z0-9_]*`: invalid characters become
/// `_` and a leading digit gets a `key_` prefix.
pub fn normalize_label_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "key_");
    }
    out
}

/// Line plus structured metadata size of one entry.
pub fn entry_total_size(entry: &Entry) -> usize {
    entry.line.len() + entry.structured_metadata_size()
}

/// Line plus structured metadata size of many entries.
pub fn entries_total_size(entries: &[Entry]) -> usize {
    entries.iter().map(entry_total_size).sum()
}

/// Unix nanoseconds of a wall-clock time (negative before the epoch).
pub fn unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

fn secs_to_nanos(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(NANOS_PER_SEC)
}
