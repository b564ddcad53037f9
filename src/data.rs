//! Core data model: sorted scan keys, result documents, and row ranges.

use std::cmp::Ordering;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// One sorted key/value entry produced by the underlying store's range scan.
///
/// Ordering is (row, field, value, datatype, uid), matching the sort order
/// of the field index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanKey {
    /// Row identifier (shard/partition row).
    pub row: String,
    /// Field name this entry indexes.
    pub field: String,
    /// Normalized field value.
    pub value: String,
    /// Datatype of the record this entry belongs to.
    pub datatype: String,
    /// Unique record identifier within the row.
    pub uid: String,
    /// Entry timestamp in epoch millis.
    pub timestamp: i64,
}

impl ScanKey {
    pub fn new(
        row: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
        datatype: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        ScanKey {
            row: row.into(),
            field: field.into(),
            value: value.into(),
            datatype: datatype.into(),
            uid: uid.into(),
            timestamp: 0,
        }
    }

    /// Same key with an explicit timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Ord for ScanKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.field.cmp(&other.field))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.datatype.cmp(&other.datatype))
            .then_with(|| self.uid.cmp(&other.uid))
    }
}

impl PartialOrd for ScanKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Position of one token within a term-frequency field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPosition {
    pub token: String,
    pub position: u32,
}

/// A value held by a document field.
///
/// Term-frequency fields surface their tokenized form with positions so the
/// predicate evaluator can answer phrase/proximity questions; everything
/// else is plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Tokens(Vec<TokenPosition>),
}

impl FieldValue {
    /// Returns the text value if this is a Text variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the token positions if this is a Tokens variant.
    pub fn as_tokens(&self) -> Option<&[TokenPosition]> {
        match self {
            FieldValue::Tokens(t) => Some(t),
            _ => None,
        }
    }
}

/// A (possibly partial) result document assembled for one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique record identifier.
    pub uid: String,
    /// Field name to values. A field may carry multiple values.
    pub fields: AHashMap<String, Vec<FieldValue>>,
}

impl Document {
    pub fn new(uid: impl Into<String>) -> Self {
        Document {
            uid: uid.into(),
            fields: AHashMap::new(),
        }
    }

    /// Append a value to a field.
    pub fn put(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.entry(field.into()).or_default().push(value);
    }

    /// All values for a field, empty when absent.
    pub fn values(&self, field: &str) -> &[FieldValue] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First text value for a field.
    pub fn first_text(&self, field: &str) -> Option<&str> {
        self.values(field).iter().find_map(FieldValue::as_text)
    }

    /// Merge another document's fields into this one.
    pub fn merge(&mut self, other: Document) {
        for (field, mut values) in other.fields {
            self.fields.entry(field).or_default().append(&mut values);
        }
    }

    /// Number of distinct fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A contiguous row range: inclusive start, exclusive end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub start: String,
    pub end: String,
}

impl ScanRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        ScanRange {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Whether the row falls within this range.
    pub fn contains(&self, row: &str) -> bool {
        row >= self.start.as_str() && row < self.end.as_str()
    }

    /// Parse the wire form `start,end` used by the batch option map.
    pub fn parse(encoded: &str) -> Option<ScanRange> {
        let (start, end) = encoded.split_once(',')?;
        if start.is_empty() || end.is_empty() || start >= end {
            return None;
        }
        Some(ScanRange::new(start, end))
    }

    /// Split into up to `n` contiguous sub-ranges.
    ///
    /// Boundaries are synthesized at the first byte position where the
    /// bounds differ; when the range cannot be subdivided further the
    /// original range is returned alone. Sub-ranges cover the full range
    /// exactly.
    pub fn split(&self, n: usize) -> Vec<ScanRange> {
        if n <= 1 {
            return vec![self.clone()];
        }

        let start_bytes = self.start.as_bytes();
        let end_bytes = self.end.as_bytes();
        let prefix_len = start_bytes
            .iter()
            .zip(end_bytes.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let lo = start_bytes.get(prefix_len).copied().unwrap_or(0x00) as u32;
        let hi = end_bytes.get(prefix_len).copied().unwrap_or(0x7f) as u32;
        if hi <= lo + 1 {
            return vec![self.clone()];
        }

        let buckets = (n as u32).min(hi - lo);
        let prefix = &self.start[..prefix_len];
        let mut bounds = Vec::with_capacity(buckets as usize + 1);
        bounds.push(self.start.clone());
        for i in 1..buckets {
            let split_byte = lo + (hi - lo) * i / buckets;
            let mut bound = prefix.to_string();
            bound.push(split_byte as u8 as char);
            // Guard against non-monotonic bounds near the range edges.
            let ascending = bounds
                .last()
                .is_some_and(|last| bound.as_str() > last.as_str());
            if ascending && bound.as_str() < self.end.as_str() {
                bounds.push(bound);
            }
        }
        bounds.push(self.end.clone());

        bounds
            .windows(2)
            .map(|w| ScanRange::new(w[0].clone(), w[1].clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_key_ordering() {
        let a = ScanKey::new("row1", "COLOR", "red", "type-a", "uid1");
        let b = ScanKey::new("row1", "COLOR", "red", "type-a", "uid2");
        let c = ScanKey::new("row2", "COLOR", "blue", "type-a", "uid1");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_document_put_and_merge() {
        let mut doc = Document::new("uid1");
        doc.put("COLOR", FieldValue::Text("red".into()));
        doc.put("COLOR", FieldValue::Text("blue".into()));
        assert_eq!(doc.values("COLOR").len(), 2);
        assert_eq!(doc.first_text("COLOR"), Some("red"));

        let mut other = Document::new("uid1");
        other.put("SHAPE", FieldValue::Text("round".into()));
        doc.merge(other);
        assert_eq!(doc.field_count(), 2);
    }

    #[test]
    fn test_document_serde_round_trip() {
        let mut doc = Document::new("uid1");
        doc.put("COLOR", FieldValue::Text("red".into()));
        doc.put(
            "BODY",
            FieldValue::Tokens(vec![TokenPosition {
                token: "quick".into(),
                position: 2,
            }]),
        );
        let json = serde_json::to_string(&doc).unwrap();
        let round: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, round);
    }

    #[test]
    fn test_range_contains() {
        let range = ScanRange::new("a", "m");
        assert!(range.contains("a"));
        assert!(range.contains("llama"));
        assert!(!range.contains("m"));
        assert!(!range.contains("z"));
    }

    #[test]
    fn test_range_parse() {
        assert_eq!(ScanRange::parse("a,m"), Some(ScanRange::new("a", "m")));
        assert_eq!(ScanRange::parse("m,a"), None);
        assert_eq!(ScanRange::parse("nocomma"), None);
    }

    #[test]
    fn test_range_split_covers_range() {
        let range = ScanRange::new("a", "z");
        let parts = range.split(4);
        assert!(parts.len() > 1);
        assert_eq!(parts.first().unwrap().start, "a");
        assert_eq!(parts.last().unwrap().end, "z");
        for w in parts.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    #[test]
    fn test_range_split_degenerate() {
        let range = ScanRange::new("aa", "ab");
        let parts = range.split(8);
        assert_eq!(parts, vec![range]);
    }
}
