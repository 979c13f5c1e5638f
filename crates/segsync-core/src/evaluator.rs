//! Condition evaluation
//!
//! A subscriber matches a segment when every effective condition holds:
//!
//! - a condition with an empty value set is skipped
//! - a condition whose attribute is absent fails
//! - a condition holds when the attribute equals **any** value in its set
//! - a rule with no effective conditions matches nothing
//!
//! Equality first tries numeric coercion of both sides and falls back to
//! trimmed exact string comparison.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{CellValue, SegmentRule};

/// Decide whether `attributes` satisfy `conditions`
pub fn matches(
    attributes: &BTreeMap<String, CellValue>,
    conditions: &BTreeMap<String, BTreeSet<String>>,
) -> bool {
    let mut effective = 0usize;

    for (attribute, accepted) in conditions {
        if accepted.is_empty() {
            continue;
        }
        effective += 1;

        let Some(actual) = attributes.get(attribute) else {
            return false;
        };

        if !accepted.iter().any(|expected| values_equal(actual, expected)) {
            return false;
        }
    }

    // Zero effective conditions must never tag a whole list
    effective > 0
}

/// Decide whether a subscriber's attributes satisfy a rule
pub fn rule_matches(attributes: &BTreeMap<String, CellValue>, rule: &SegmentRule) -> bool {
    matches(attributes, &rule.conditions)
}

/// Compare one cell against one expected rule value
pub fn values_equal(actual: &CellValue, expected: &str) -> bool {
    if actual.is_empty() {
        return expected.trim().is_empty();
    }

    let expected_cell = CellValue::parse(expected);
    if let (Some(a), Some(b)) = (actual.as_number(), expected_cell.as_number()) {
        return a == b;
    }

    actual.as_text() == expected.trim()
}
