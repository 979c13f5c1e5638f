//! Rule store adapter
//!
//! Reads raw rule rows from the tabular store and groups them into one
//! [`SegmentRule`] per (list, segment). Repeated rows for the same pair are
//! merged column by column, so
//!
//! ```text
//! NOMBRE LISTA | NOMBRE SEGMENTO | SEDE
//! L1           | Seg1            | Madrid
//! L1           | Seg1            | Bilbao
//! ```
//!
//! becomes one rule with `SEDE = {Madrid, Bilbao}`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RuleSourceConfig;
use crate::error::{Error, Result};
use crate::model::{Row, SegmentRule};
use crate::traits::TableStore;

/// Segment rules of one list, in first-seen order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRules {
    /// List name
    pub list_name: String,
    /// Grouped rules, unique by segment name
    pub rules: Vec<SegmentRule>,
}

impl ListRules {
    /// Union of every attribute referenced by an effective condition
    pub fn condition_attributes(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|rule| rule.attributes().map(str::to_string))
            .collect()
    }
}

/// Every grouped rule, keyed by list in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    lists: Vec<ListRules>,
}

impl RuleSet {
    /// Lists with their rules
    pub fn lists(&self) -> &[ListRules] {
        &self.lists
    }

    /// Rules of one list (empty when the list has none)
    pub fn rules_for(&self, list_name: &str) -> &[SegmentRule] {
        self.lists
            .iter()
            .find(|l| l.list_name == list_name)
            .map(|l| l.rules.as_slice())
            .unwrap_or(&[])
    }

    /// List names in first-seen order
    pub fn list_names(&self) -> impl Iterator<Item = &str> {
        self.lists.iter().map(|l| l.list_name.as_str())
    }

    /// Number of lists
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// Whether there is nothing to reconcile
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Total number of grouped rules across lists
    pub fn rule_count(&self) -> usize {
        self.lists.iter().map(|l| l.rules.len()).sum()
    }
}

/// Group raw rule rows into per-list segment rules
///
/// # Errors
///
/// [`Error::MalformedRuleData`] when rows exist but the list or segment
/// column is absent from all of them.
pub fn group_rules(rows: &[Row], config: &RuleSourceConfig) -> Result<RuleSet> {
    if rows.is_empty() {
        return Ok(RuleSet::default());
    }

    let columns: BTreeSet<&str> = rows.iter().flat_map(|r| r.columns()).map(str::trim).collect();
    for required in [&config.list_column, &config.segment_column] {
        if !columns.contains(required.as_str()) {
            return Err(Error::malformed_rules(format!(
                "required column '{}' not found (columns: {:?})",
                required, columns
            )));
        }
    }

    let mut lists: Vec<ListRules> = Vec::new();
    let mut list_index: HashMap<String, usize> = HashMap::new();
    let mut rule_index: HashMap<(String, String), usize> = HashMap::new();

    for (line, row) in rows.iter().enumerate() {
        let list_name = cell_text(row, &config.list_column);
        let segment_name = cell_text(row, &config.segment_column);

        let (Some(list_name), Some(segment_name)) = (list_name, segment_name) else {
            warn!("Skipping rule row {}: missing list or segment name", line + 1);
            continue;
        };

        let li = *list_index.entry(list_name.clone()).or_insert_with(|| {
            lists.push(ListRules {
                list_name: list_name.clone(),
                rules: Vec::new(),
            });
            lists.len() - 1
        });

        let rules = &mut lists[li].rules;
        let ri = *rule_index
            .entry((list_name.clone(), segment_name.clone()))
            .or_insert_with(|| {
                rules.push(SegmentRule::new(list_name.clone(), segment_name.clone()));
                rules.len() - 1
            });

        let rule = &mut rules[ri];
        for (column, value) in row.iter() {
            let column = column.trim();
            if config.is_reserved_column(column) {
                continue;
            }
            // Blank cells still register the column, with no constraint
            rule.add_value(column, if value.is_empty() { String::new() } else { value.as_text() });
        }
    }

    debug!(
        "Grouped {} rule rows into {} rules across {} lists",
        rows.len(),
        lists.iter().map(|l| l.rules.len()).sum::<usize>(),
        lists.len()
    );

    Ok(RuleSet { lists })
}

fn cell_text(row: &Row, column: &str) -> Option<String> {
    row.iter()
        .find(|(name, _)| name.trim() == column)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .map(|value| value.as_text())
}

/// Rule rows living in one sheet of a table store
#[derive(Clone)]
pub struct RuleSource {
    store: Arc<dyn TableStore>,
    config: RuleSourceConfig,
}

impl RuleSource {
    /// Create a rule source over a table store
    pub fn new(store: Arc<dyn TableStore>, config: RuleSourceConfig) -> Self {
        Self { store, config }
    }

    /// Rule source configuration
    pub fn config(&self) -> &RuleSourceConfig {
        &self.config
    }

    /// Load and group every rule
    ///
    /// Zero rule rows yields an empty [`RuleSet`].
    pub async fn load_rules(&self) -> Result<RuleSet> {
        let rows = self
            .store
            .read_sheet(&self.config.store_id, &self.config.sheet)
            .await?;

        debug!(
            "Read {} rule rows from {}/{}",
            rows.len(),
            self.config.store_id,
            self.config.sheet
        );

        group_rules(&rows, &self.config)
    }
}

impl std::fmt::Debug for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSource")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
