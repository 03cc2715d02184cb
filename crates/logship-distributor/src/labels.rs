//! Label sets: parsing, canonical formatting, stable hashing and building.
//!
//! A label set is kept sorted by name and free of duplicates once built. Its
//! canonical string form is `{a="1", b="2"}` and is what gets hashed onto the
//! ring, so every code path that changes labels must go through
//! [`LabelsBuilder`] to keep the string and the hash in step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const FNV64_OFFSET: u64 = 14695981039346656037;
const FNV64_PRIME: u64 = 1099511628211;
const FNV32_OFFSET: u32 = 2166136261;
const FNV32_PRIME: u32 = 16777619;
const SEPARATOR: u8 = 0xff;

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelPair {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl LabelPair {
    /// Create a new pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Failure to parse a label string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason} at position {pos}")]
pub struct LabelParseError {
    /// What went wrong.
    pub reason: String,
    /// Byte offset into the input.
    pub pos: usize,
}

/// An ordered label set.
///
/// Parsing keeps duplicate names so that validation can report them;
/// everything produced by [`LabelsBuilder`] is de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<LabelPair>);

impl Labels {
    /// An empty label set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a label set from pairs, sorting by name and keeping the last
    /// value for duplicated names.
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .collect();
        Self(map.into_iter().map(|(name, value)| LabelPair { name, value }).collect())
    }

    /// Parse a label string such as `{app="api", env="prod"}`.
    pub fn parse(input: &str) -> Result<Self, LabelParseError> {
        Parser::new(input).parse()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the named label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Returns true if a label with this name exists.
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    /// Iterate over the pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = &LabelPair> {
        self.0.iter()
    }

    /// First duplicated label name, if any.
    pub fn duplicate_name(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|w| w[0].name == w[1].name)
            .map(|w| w[0].name.as_str())
    }

    /// Stable structural hash of the label set.
    pub fn stable_hash(&self) -> u64 {
        let mut h = FNV64_OFFSET;
        for pair in &self.0 {
            for b in pair.name.bytes().chain([SEPARATOR]) {
                h ^= b as u64;
                h = h.wrapping_mul(FNV64_PRIME);
            }
            for b in pair.value.bytes().chain([SEPARATOR]) {
                h ^= b as u64;
                h = h.wrapping_mul(FNV64_PRIME);
            }
        }
        h
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, pair) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=\"", pair.name)?;
            for c in pair.value.chars() {
                match c {
                    '"' => f.write_str("\\\"")?,
                    '\\' => f.write_str("\\\\")?,
                    '\n' => f.write_str("\\n")?,
                    '\t' => f.write_str("\\t")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

/// Mapping-based label builder.
///
/// Construct once from a base set, then `set`/`del` and call
/// [`LabelsBuilder::labels`] for each derived set.
#[derive(Debug, Clone, Default)]
pub struct LabelsBuilder {
    map: BTreeMap<String, String>,
}

impl LabelsBuilder {
    /// Start from an existing label set.
    pub fn new(base: &Labels) -> Self {
        Self {
            map: base
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
        }
    }

    /// Set (or overwrite) a label.
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        self.map.insert(name.to_string(), value.to_string());
        self
    }

    /// Remove a label.
    pub fn del(&mut self, name: &str) -> &mut Self {
        self.map.remove(name);
        self
    }

    /// Returns true if the label is currently set.
    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Produce the sorted label set.
    pub fn labels(&self) -> Labels {
        Labels(
            self.map
                .iter()
                .map(|(n, v)| LabelPair::new(n.as_str(), v.as_str()))
                .collect(),
        )
    }
}

/// Returns true if `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ring token for a tenant's stream: FNV-1a 32 over the tenant id followed by
/// the canonical label string.
pub fn token_for(tenant_id: &str, labels: &str) -> u32 {
    let mut h = FNV32_OFFSET;
    for b in tenant_id.bytes().chain(labels.bytes()) {
        h ^= b as u32;
        h = h.wrapping_mul(FNV32_PRIME);
    }
    h
}

struct Parser<'a> {
    input: &'a [u8],
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            input: src.as_bytes(),
            src,
            pos: 0,
        }
    }

    fn err(&self, reason: &str) -> LabelParseError {
        LabelParseError {
            reason: reason.to_string(),
            pos: self.pos,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), LabelParseError> {
        self.skip_ws();
        if self.input.get(self.pos) == Some(&b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", b as char)))
        }
    }

    fn parse(mut self) -> Result<Labels, LabelParseError> {
        self.expect(b'{')?;
        let mut pairs = Vec::new();
        self.skip_ws();
        if self.input.get(self.pos) == Some(&b'}') {
            self.pos += 1;
        } else {
            loop {
                let name = self.parse_name()?;
                self.expect(b'=')?;
                let value = self.parse_value()?;
                pairs.push(LabelPair { name, value });
                self.skip_ws();
                match self.input.get(self.pos) {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b'}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.err("expected ',' or '}'")),
                }
            }
        }
        self.skip_ws();
        if self.pos != self.input.len() {
            return Err(self.err("unexpected trailing characters"));
        }
        pairs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Labels(pairs))
    }

    fn parse_name(&mut self) -> Result<String, LabelParseError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_alphanumeric() || self.input[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let name = &self.src[start..self.pos];
        if !is_valid_label_name(name) {
            return Err(LabelParseError {
                reason: format!("invalid label name {name:?}"),
                pos: start,
            });
        }
        Ok(name.to_string())
    }

    fn parse_value(&mut self) -> Result<String, LabelParseError> {
        self.expect(b'"')?;
        let mut value = String::new();
        let rest = &self.src[self.pos..];
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, e @ ('"' | '\\'))) => value.push(e),
                    _ => {
                        self.pos += i;
                        return Err(self.err("invalid escape sequence"));
                    }
                },
                c => value.push(c),
            }
        }
        self.pos = self.input.len();
        Err(self.err("unterminated quoted string"))
    }
}
