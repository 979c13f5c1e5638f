//! Tag accumulation
//!
//! A subscriber's segments live in one delimited text field
//! (`"SegA;SegB"`). Applying a segment appends it once, keeping first-seen
//! order, and never produces a duplicate.

use crate::model::SubscriberRecord;

/// Delimiter between tags in the tag field
pub const TAG_DELIMITER: char = ';';

/// Split a tag string into trimmed, non-empty tags
pub fn parse_tags(raw: &str) -> Vec<&str> {
    raw.split(TAG_DELIMITER)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Join tags, dropping repeats after their first occurrence
pub fn join_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> String {
    let mut unique: Vec<&str> = Vec::new();
    for tag in tags {
        if !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    unique.join(&TAG_DELIMITER.to_string())
}

/// Whether a tag string already contains `segment`
pub fn has_tag(raw: &str, segment: &str) -> bool {
    parse_tags(raw).contains(&segment.trim())
}

/// Add `segment` to the record's tags
///
/// Returns `true` when the tag was appended and `false` when the record
/// already carried it (the record is left untouched).
pub fn apply(record: &mut SubscriberRecord, segment: &str) -> bool {
    let segment = segment.trim();
    if segment.is_empty() || has_tag(&record.segments, segment) {
        return false;
    }

    let mut tags = parse_tags(&record.segments);
    tags.push(segment);
    record.segments = join_tags(tags);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_assignment() {
        let mut record = SubscriberRecord::new("a@x.es");
        assert!(apply(&mut record, "SegA"));
        assert_eq!(record.segments, "SegA");
    }

    #[test]
    fn test_appends_in_first_seen_order() {
        let mut record = SubscriberRecord::new("a@x.es").with_segments("SegB");
        assert!(apply(&mut record, "SegA"));
        assert_eq!(record.segments, "SegB;SegA");
    }

    #[test]
    fn test_reapplying_existing_tag_is_a_no_op() {
        let mut record = SubscriberRecord::new("a@x.es").with_segments("SegA;SegB");
        assert!(!apply(&mut record, "SegA"));
        assert_eq!(record.segments, "SegA;SegB");
    }

    #[test]
    fn test_second_call_reports_unchanged() {
        let mut record = SubscriberRecord::new("a@x.es");
        assert!(apply(&mut record, "SegC"));
        assert!(!apply(&mut record, "SegC"));
        assert_eq!(parse_tags(&record.segments), vec!["SegC"]);
    }

    #[test]
    fn test_membership_ignores_padding() {
        let mut record = SubscriberRecord::new("a@x.es").with_segments(" SegA ; SegB");
        assert!(!apply(&mut record, "SegB"));
        assert_eq!(record.segments, " SegA ; SegB");
    }

    #[test]
    fn test_append_normalises_existing_duplicates() {
        let mut record = SubscriberRecord::new("a@x.es").with_segments("SegA;;SegA");
        assert!(apply(&mut record, "SegB"));
        assert_eq!(record.segments, "SegA;SegB");
    }

    #[test]
    fn test_blank_segment_is_ignored() {
        let mut record = SubscriberRecord::new("a@x.es");
        assert!(!apply(&mut record, "  "));
        assert!(record.segments.is_empty());
    }
}
