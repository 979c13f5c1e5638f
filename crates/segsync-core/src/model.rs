//! Data model shared by every reconciliation component
//!
//! - [`CellValue`]: one typed spreadsheet cell (`Text`, `Number` or `Empty`)
//! - [`Row`]: an ordered, string-keyed sequence of cells
//! - [`SegmentRule`]: one grouped segment definition for one list
//! - [`SubscriberRecord`] / [`ListSnapshot`]: the local state of one list
//! - [`ChangeSet`]: subscribers whose tags changed during a run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A single typed cell value
///
/// Serialized untagged so JSON workbooks stay readable: numbers are JSON
/// numbers, text is a JSON string and empty cells are `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// A finite numeric value
    Number(f64),
    /// Free text (never empty after trimming when produced by [`CellValue::parse`])
    Text(String),
    /// No value
    #[default]
    Empty,
}

impl CellValue {
    /// Classify a raw string cell
    ///
    /// Trimmed-empty input is `Empty`, a finite number is `Number`,
    /// everything else is `Text` (kept verbatim).
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Empty;
        }
        match parse_finite(trimmed) {
            Some(n) => CellValue::Number(n),
            None => CellValue::Text(raw.to_string()),
        }
    }

    /// Numeric view of this cell, if it has one
    ///
    /// Text cells are coerced when their trimmed content is a finite number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Number(_) => None,
            CellValue::Text(s) => parse_finite(s.trim()),
            CellValue::Empty => None,
        }
    }

    /// Trimmed textual view of this cell
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.trim().to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this cell carries no value
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            CellValue::Text(s) => f.write_str(s),
            CellValue::Empty => Ok(()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(raw: &str) -> Self {
        CellValue::parse(raw)
    }
}

impl From<String> for CellValue {
    fn from(raw: String) -> Self {
        CellValue::parse(&raw)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// An ordered, string-keyed row of cells
///
/// Column order is preserved as read so a rewritten sheet keeps the
/// operator's layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    cells: Vec<(String, CellValue)>,
}

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cell by exact column name
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Set a cell, replacing an existing column or appending a new one
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    /// Builder-style [`Row::set`]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Column names in order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    /// Cells in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the row has no cells
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.set(column, value);
        }
        row
    }
}

/// Remote identifier of a subscriber list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(pub String);

impl ListId {
    /// Create a list id from any displayable value
    pub fn new(id: impl fmt::Display) -> Self {
        Self(id.to_string())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A grouped segment definition
///
/// `conditions` maps an attribute name to the set of acceptable values.
/// An empty set means "no value specified" and never blocks a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRule {
    /// List the segment belongs to
    pub list_name: String,
    /// Segment (tag) name
    pub segment_name: String,
    /// Attribute -> acceptable values
    pub conditions: BTreeMap<String, BTreeSet<String>>,
}

impl SegmentRule {
    /// Create a rule with no conditions
    pub fn new(list_name: impl Into<String>, segment_name: impl Into<String>) -> Self {
        Self {
            list_name: list_name.into(),
            segment_name: segment_name.into(),
            conditions: BTreeMap::new(),
        }
    }

    /// Add an acceptable value for an attribute (blank values are ignored)
    pub fn with_condition(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_value(attribute, value);
        self
    }

    /// Add an acceptable value for an attribute (blank values are ignored)
    pub fn add_value(&mut self, attribute: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let values = self.conditions.entry(attribute.into()).or_default();
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            values.insert(trimmed.to_string());
        }
    }

    /// Conditions that actually constrain a match
    pub fn effective_conditions(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.conditions.iter().filter(|(_, values)| !values.is_empty())
    }

    /// Attribute names referenced by effective conditions
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.effective_conditions().map(|(name, _)| name.as_str())
    }
}

/// One subscriber of one list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Unique key within the list
    pub email: String,
    /// Every non-email, non-tag column
    pub attributes: BTreeMap<String, CellValue>,
    /// `;`-delimited, deduplicated tag string
    pub segments: String,
}

impl SubscriberRecord {
    /// Create a record with no attributes and no tags
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            attributes: BTreeMap::new(),
            segments: String::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_attribute(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    /// Builder-style tag string setter
    pub fn with_segments(mut self, segments: impl Into<String>) -> Self {
        self.segments = segments.into();
        self
    }
}

/// Metadata persisted alongside a list snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Remote list id learned in a previous run
    pub remote_list_id: Option<ListId>,
    /// Custom fields known to exist remotely
    pub known_remote_fields: BTreeSet<String>,
}

/// A primary-sheet row that is not a subscriber (blank or repeated email)
///
/// Kept only so saving writes it back where it was; it is never evaluated
/// or synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughRow {
    /// Zero-based row index in the primary sheet
    pub position: usize,
    /// The row exactly as read
    pub row: Row,
}

/// All local state of one list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSnapshot {
    /// List name
    pub list_name: String,
    /// Column order of the primary view (email and tag columns included)
    pub columns: Vec<String>,
    /// Name of the column holding the email
    pub email_column: String,
    /// Name of the column holding the tag string
    pub tag_column: String,
    /// Subscribers, in sheet order
    pub records: Vec<SubscriberRecord>,
    /// Rows without a usable email, by ascending position
    #[serde(default)]
    pub passthrough: Vec<PassthroughRow>,
    /// Remote metadata
    pub meta: SnapshotMeta,
}

impl ListSnapshot {
    /// Create an empty snapshot with only the email and tag columns
    pub fn empty(list_name: impl Into<String>, tag_column: impl Into<String>) -> Self {
        let tag_column = tag_column.into();
        Self {
            list_name: list_name.into(),
            columns: vec!["email".to_string(), tag_column.clone()],
            email_column: "email".to_string(),
            tag_column,
            records: Vec::new(),
            passthrough: Vec::new(),
            meta: SnapshotMeta::default(),
        }
    }

    /// Emails of every record
    pub fn emails(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.email.clone()).collect()
    }

    /// Look up a record by email
    pub fn record(&self, email: &str) -> Option<&SubscriberRecord> {
        self.records.iter().find(|r| r.email == email)
    }

    /// Whether the primary view has a column with this name
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Compare tag strings against an earlier copy of this snapshot
    ///
    /// Records are matched by email. Every record whose tag string differs
    /// from its value in `before` becomes a [`ChangeEntry`] stamped `at`.
    pub fn diff_segments(&self, before: &ListSnapshot, at: DateTime<Utc>) -> ChangeSet {
        let prior: HashMap<&str, &str> = before
            .records
            .iter()
            .map(|r| (r.email.as_str(), r.segments.as_str()))
            .collect();

        let entries = self
            .records
            .iter()
            .filter_map(|record| {
                let previous = prior.get(record.email.as_str()).copied().unwrap_or("");
                (previous.trim() != record.segments.trim()).then(|| ChangeEntry {
                    record: record.clone(),
                    prior_segments: previous.to_string(),
                    changed_at: at,
                })
            })
            .collect();

        ChangeSet { entries }
    }
}

/// A subscriber whose tags changed during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// The record after evaluation
    pub record: SubscriberRecord,
    /// Tag string at load time
    pub prior_segments: String,
    /// When the change was detected
    pub changed_at: DateTime<Utc>,
}

/// Subscribers whose tags changed during one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changed subscribers, in snapshot order
    pub entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    /// Number of changed subscribers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Emails of the changed subscribers
    pub fn emails(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.record.email.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_parse_classifies() {
        assert_eq!(CellValue::parse("  "), CellValue::Empty);
        assert_eq!(CellValue::parse("12"), CellValue::Number(12.0));
        assert_eq!(CellValue::parse(" 1.5 "), CellValue::Number(1.5));
        assert_eq!(CellValue::parse("Madrid"), CellValue::Text("Madrid".to_string()));
        // Non-finite spellings stay text
        assert_eq!(CellValue::parse("nan"), CellValue::Text("nan".to_string()));
        assert_eq!(CellValue::parse("inf"), CellValue::Text("inf".to_string()));
    }

    #[test]
    fn test_cell_display_drops_integral_fraction() {
        assert_eq!(CellValue::Number(3.0).to_string(), "3");
        assert_eq!(CellValue::Number(2.5).to_string(), "2.5");
        assert_eq!(CellValue::Empty.to_string(), "");
    }

    #[test]
    fn test_cell_json_is_untagged() {
        let row = Row::new()
            .with("email", "a@x.es")
            .with("N ORGANO", 2.0)
            .with("SEDE", CellValue::Empty);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[["email","a@x.es"],["N ORGANO",2.0],["SEDE",null]]"#);

        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_row_set_replaces_in_place() {
        let mut row = Row::new().with("a", "1").with("b", "2");
        row.set("a", "3");
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(row.get("a"), Some(&CellValue::Number(3.0)));
    }

    #[test]
    fn test_rule_ignores_blank_values() {
        let rule = SegmentRule::new("L1", "Seg1")
            .with_condition("SEDE", "Madrid")
            .with_condition("ORGANO", "  ");
        assert_eq!(rule.attributes().collect::<Vec<_>>(), vec!["SEDE"]);
        assert!(rule.conditions["ORGANO"].is_empty());
    }

    #[test]
    fn test_diff_segments_reports_prior_value() {
        let mut before = ListSnapshot::empty("L1", "Segmentos");
        before.records.push(SubscriberRecord::new("a@x.es").with_segments("SegA"));
        before.records.push(SubscriberRecord::new("b@x.es"));

        let mut after = before.clone();
        after.records[0].segments = "SegA;SegB".to_string();

        let at = Utc::now();
        let changes = after.diff_segments(&before, at);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.entries[0].record.email, "a@x.es");
        assert_eq!(changes.entries[0].prior_segments, "SegA");
        assert_eq!(changes.entries[0].changed_at, at);
    }
}
