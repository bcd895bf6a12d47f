//! Core domain types for Linetag runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::LinetagError;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Stable identifier of a keyword record: the source's natural key, or the
/// 1-based row position when the source has none.
///
/// Deserializes from either a JSON string or a JSON number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier derived from a 1-based row position.
    pub fn from_row(position: usize) -> Self {
        Self(position.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Label normalization
// ---------------------------------------------------------------------------

/// Normalize a Line/Item cell: trims whitespace and maps blank cells and
/// spreadsheet null spellings (`nan`, `None`, `null`) to `None`.
pub fn normalize_label(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "nan" | "none" | "null" | "n/a" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Whether two labels name the same thing, ignoring case and spacing.
pub fn labels_match(a: &str, b: &str) -> bool {
    let mut left = a.split_whitespace().map(str::to_lowercase);
    let mut right = b.split_whitespace().map(str::to_lowercase);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return true,
            (Some(l), Some(r)) if l == r => continue,
            _ => return false,
        }
    }
}

fn deserialize_label<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(normalize_label(raw.as_deref()))
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One keyword occurrence and its (possibly partial) classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, unique within a run.
    pub id: RecordId,
    /// Raw keyword text as supplied by the source.
    #[serde(alias = "Keyword", alias = "key word", alias = "key_word", alias = "Key Word")]
    pub keyword: String,
    /// Assigned Line, `None` until resolved.
    #[serde(
        default,
        alias = "Line",
        alias = "U_line",
        alias = "u_line",
        deserialize_with = "deserialize_label"
    )]
    pub line: Option<String>,
    /// Assigned Item, `None` until resolved.
    #[serde(default, alias = "Item", deserialize_with = "deserialize_label")]
    pub item: Option<String>,
}

impl Record {
    /// Create an unresolved record.
    pub fn new(id: RecordId, keyword: impl Into<String>) -> Self {
        Self {
            id,
            keyword: keyword.into(),
            line: None,
            item: None,
        }
    }

    /// Builder-style helper for pre-resolved records.
    pub fn with_labels(mut self, line: Option<&str>, item: Option<&str>) -> Self {
        self.line = normalize_label(line);
        self.item = normalize_label(item);
        self
    }

    /// Resolution status, or `None` when the record holds an Item without a Line.
    pub fn status(&self) -> Option<ResolutionStatus> {
        ResolutionStatus::of(self.line.as_deref(), self.item.as_deref())
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.status() == Some(ResolutionStatus::FullyResolved)
    }

    /// Fill currently-null fields from a proposal. Never overwrites a
    /// non-null field.
    ///
    /// An Item is only filled when the record's Line (existing or just
    /// filled) matches the proposal's Line, so Item always stays inside its
    /// parent Line.
    pub fn fill_from(&mut self, line: Option<&str>, item: Option<&str>) -> FieldChange {
        let mut change = FieldChange::default();

        if self.line.is_none() {
            if let Some(line) = line {
                self.line = Some(line.to_string());
                change.line_filled = true;
            }
        }

        if self.item.is_none() {
            if let (Some(item), Some(proposed_line)) = (item, line) {
                if self
                    .line
                    .as_deref()
                    .is_some_and(|current| labels_match(current, proposed_line))
                {
                    self.item = Some(item.to_string());
                    change.item_filled = true;
                }
            }
        }

        change
    }
}

/// Which fields a [`Record::fill_from`] call actually filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldChange {
    pub line_filled: bool,
    pub item_filled: bool,
}

impl FieldChange {
    pub fn any(&self) -> bool {
        self.line_filled || self.item_filled
    }
}

// ---------------------------------------------------------------------------
// ResolutionStatus
// ---------------------------------------------------------------------------

/// The three valid resolution states of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Unresolved,
    LineOnly,
    FullyResolved,
}

impl ResolutionStatus {
    /// Derive the status from a (Line, Item) pair. `None` for an Item without a Line.
    pub fn of(line: Option<&str>, item: Option<&str>) -> Option<Self> {
        match (line, item) {
            (None, None) => Some(Self::Unresolved),
            (Some(_), None) => Some(Self::LineOnly),
            (Some(_), Some(_)) => Some(Self::FullyResolved),
            (None, Some(_)) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::LineOnly => "line_only",
            Self::FullyResolved => "fully_resolved",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// An ordered, bounded slice of records processed as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position of this chunk in the pass.
    pub index: usize,
    /// Records in original order.
    pub records: Vec<Record>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.iter().any(|r| &r.id == id)
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A backend's (Line, Item) suggestion for one record. Either field may be
/// absent, meaning "no match" for that level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: RecordId,
    #[serde(default, deserialize_with = "deserialize_label")]
    pub line: Option<String>,
    #[serde(default, deserialize_with = "deserialize_label")]
    pub item: Option<String>,
}

impl Proposal {
    pub fn new(id: RecordId, line: Option<&str>, item: Option<&str>) -> Self {
        Self {
            id,
            line: normalize_label(line),
            item: normalize_label(item),
        }
    }

    pub fn no_match(id: RecordId) -> Self {
        Self {
            id,
            line: None,
            item: None,
        }
    }

    pub fn is_no_match(&self) -> bool {
        self.line.is_none() && self.item.is_none()
    }
}

// ---------------------------------------------------------------------------
// PassKind
// ---------------------------------------------------------------------------

/// The two classification passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Pass 1: Line assignment over every record.
    Line,
    /// Pass 2: Item refinement over records still missing a field.
    Item,
}

impl PassKind {
    /// Directory and storage key for this pass.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Item => "item",
        }
    }

    pub fn all() -> [PassKind; 2] {
        [Self::Line, Self::Item]
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PassKind {
    type Err = LinetagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" | "pass1" | "1" => Ok(Self::Line),
            "item" | "pass2" | "2" => Ok(Self::Item),
            other => Err(LinetagError::validation(format!(
                "unknown pass '{other}': expected 'line' or 'item'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch log
// ---------------------------------------------------------------------------

/// Outcome of one classification attempt on one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Failed; another attempt follows.
    Retry,
    /// Failed; the chunk is permanently failed for this pass.
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = LinetagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "retry" => Ok(Self::Retry),
            "failed" => Ok(Self::Failed),
            other => Err(LinetagError::parse(format!("unknown attempt outcome '{other}'"))),
        }
    }
}

/// One row of the batch log, keyed by (pass, chunk index, attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLogEntry {
    pub pass: PassKind,
    pub chunk_index: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Records sent in this attempt.
    pub records: usize,
    /// Short error label (`backend`, `timeout`, `response_format`).
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn record_id_accepts_numbers_and_strings() {
        let a: RecordId = serde_json::from_str("42").unwrap();
        let b: RecordId = serde_json::from_str(r#""kw-42""#).unwrap();
        assert_eq!(a.as_str(), "42");
        assert_eq!(b.as_str(), "kw-42");
    }

    #[test]
    fn normalize_label_blanks() {
        assert_eq!(normalize_label(None), None);
        assert_eq!(normalize_label(Some("   ")), None);
        assert_eq!(normalize_label(Some("nan")), None);
        assert_eq!(normalize_label(Some("None")), None);
        assert_eq!(normalize_label(Some(" Pumps ")), Some("Pumps".into()));
    }

    #[test]
    fn record_deserializes_column_aliases() {
        let json = r#"{"id": 7, "Key Word": "hydraulic pump", "U_line": "Pumps", "Item": ""}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.id.as_str(), "7");
        assert_eq!(record.keyword, "hydraulic pump");
        assert_eq!(record.line.as_deref(), Some("Pumps"));
        assert_eq!(record.item, None);
        assert_eq!(record.status(), Some(ResolutionStatus::LineOnly));
    }

    #[test]
    fn status_rejects_item_without_line() {
        assert_eq!(ResolutionStatus::of(None, Some("Gear Pump")), None);
        assert_eq!(ResolutionStatus::of(None, None), Some(ResolutionStatus::Unresolved));
        assert_eq!(
            ResolutionStatus::of(Some("Pumps"), Some("Gear Pump")),
            Some(ResolutionStatus::FullyResolved)
        );
    }

    #[test]
    fn fill_from_never_overwrites() {
        let mut record =
            Record::new(RecordId::new("1"), "gear pump").with_labels(Some("Pumps"), None);

        let change = record.fill_from(Some("Valves"), Some("Ball Valve"));
        assert!(!change.any());
        assert_eq!(record.line.as_deref(), Some("Pumps"));
        assert_eq!(record.item, None);

        let change = record.fill_from(Some("Pumps"), Some("Gear Pump"));
        assert!(change.item_filled);
        assert!(!change.line_filled);
        assert_eq!(record.item.as_deref(), Some("Gear Pump"));

        let change = record.fill_from(None, None);
        assert!(!change.any());
        assert!(record.is_fully_resolved());
    }

    #[test]
    fn fill_from_matches_line_loosely() {
        let mut record =
            Record::new(RecordId::new("1"), "gear pump").with_labels(Some("pumps "), None);
        assert!(labels_match("Hydraulic  Pumps", "hydraulic pumps"));
        let change = record.fill_from(Some("Pumps"), Some("Gear Pump"));
        assert!(change.item_filled);
        assert_eq!(record.line.as_deref(), Some("pumps"));
    }

    #[test]
    fn fill_from_drops_item_without_line() {
        let mut record = Record::new(RecordId::new("1"), "gear pump");
        let change = record.fill_from(None, Some("Gear Pump"));
        assert!(!change.any());
        assert_eq!(record.status(), Some(ResolutionStatus::Unresolved));
    }

    #[test]
    fn pass_kind_parsing() {
        assert_eq!("line".parse::<PassKind>().unwrap(), PassKind::Line);
        assert_eq!("Item".parse::<PassKind>().unwrap(), PassKind::Item);
        assert!("pass3".parse::<PassKind>().is_err());
        assert_eq!(PassKind::Item.to_string(), "item");
    }

    #[test]
    fn attempt_outcome_roundtrip() {
        for outcome in [AttemptOutcome::Success, AttemptOutcome::Retry, AttemptOutcome::Failed] {
            assert_eq!(outcome.as_str().parse::<AttemptOutcome>().unwrap(), outcome);
        }
        assert!("exploded".parse::<AttemptOutcome>().is_err());
    }

    #[test]
    fn proposal_no_match() {
        let p = Proposal::new(RecordId::new("3"), Some(" "), Some("nan"));
        assert!(p.is_no_match());
    }
}
