//! Field-index aggregation: turning index hits into a partial document.
//!
//! The aggregator performs no predicate evaluation. It collects the field
//! index entries gathered for one record into a [`Document`] the pipeline
//! can evaluate: index-only fields directly, composite fields synthesized
//! from their constituents, and term-frequency fields expanded to their
//! tokenized form when the query needs positions.

use std::sync::Arc;

use ahash::AHashMap;
use log::trace;

use crate::config::ScanOptions;
use crate::data::{Document, FieldValue, ScanKey};
use crate::error::Result;

/// Field carrying the record id when `include.record.id` is set.
pub(crate) const RECORD_ID_FIELD: &str = "RECORD_ID";

/// Supplier of token positions for term-frequency fields.
///
/// Backed by the store's term-frequency column in production; tests inject
/// a fixture.
pub trait TermFrequencySource: Send {
    /// Token positions recorded for (uid, field), empty when none.
    fn positions(&self, uid: &str, field: &str) -> Result<Vec<crate::data::TokenPosition>>;
}

/// Assembles partial documents from field index hits.
pub struct FieldIndexAggregator {
    options: Arc<ScanOptions>,
    tf_source: Option<Box<dyn TermFrequencySource>>,
}

impl FieldIndexAggregator {
    pub fn new(options: Arc<ScanOptions>) -> Self {
        FieldIndexAggregator {
            options,
            tf_source: None,
        }
    }

    /// Attach a term-frequency source; required for queries that set
    /// `term.frequencies.are.required`.
    pub fn with_term_frequencies(mut self, source: Box<dyn TermFrequencySource>) -> Self {
        self.tf_source = Some(source);
        self
    }

    /// Build the partial document for one record from its index hits.
    ///
    /// Keys failing the datatype filter are dropped before any value work.
    pub fn aggregate(&self, uid: &str, hits: &[ScanKey]) -> Result<Document> {
        let mut doc = Document::new(uid);
        let mut datatype: Option<&str> = None;

        // Constituent values gathered for composite synthesis, keyed by
        // field, in hit order.
        let mut constituent_values: AHashMap<&str, Vec<&str>> = AHashMap::new();
        let needs_constituents = !self.options.composite_metadata.is_empty();

        for key in hits {
            if !self.options.datatype_filter.accept(key) {
                trace!("datatype filter dropped {}/{}", key.datatype, key.field);
                continue;
            }
            datatype.get_or_insert(&key.datatype);

            if needs_constituents {
                constituent_values
                    .entry(key.field.as_str())
                    .or_default()
                    .push(key.value.as_str());
            }

            if self.options.index_only_fields.contains(&key.field) {
                self.put_limited(&mut doc, &key.field, FieldValue::Text(key.value.clone()));
            }
        }

        for (composite, constituents) in self.options.composite_metadata.iter() {
            let parts: Option<Vec<&str>> = constituents
                .iter()
                .map(|field| {
                    constituent_values
                        .get(field.as_str())
                        .and_then(|values| values.first().copied())
                })
                .collect();
            // Skipped when any constituent is absent from the hits.
            if let Some(parts) = parts {
                self.put_limited(&mut doc, composite, FieldValue::Text(parts.join(",")));
            }
        }

        if self.options.term_frequencies_required {
            if let Some(source) = &self.tf_source {
                for field in &self.options.term_frequency_fields {
                    let positions = source.positions(uid, field)?;
                    if !positions.is_empty() {
                        self.put_limited(&mut doc, field, FieldValue::Tokens(positions));
                    }
                }
            }
        }

        if self.options.include_datatype {
            if let Some(datatype) = datatype {
                doc.put(
                    self.options.datatype_field.clone(),
                    FieldValue::Text(datatype.to_string()),
                );
            }
        }
        if self.options.include_record_id {
            doc.put(RECORD_ID_FIELD, FieldValue::Text(uid.to_string()));
        }

        Ok(doc)
    }

    /// Append a value unless the field's configured limit is reached.
    fn put_limited(&self, doc: &mut Document, field: &str, value: FieldValue) {
        if let Some(&limit) = self.options.limit_fields.get(field) {
            if doc.values(field).len() >= limit {
                return;
            }
        }
        doc.put(field, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TokenPosition;
    use crate::filter::KeyFilter;

    fn options() -> ScanOptions {
        let mut opts = ScanOptions::default();
        opts.index_only_fields.insert("COLOR".to_string());
        opts.index_only_fields.insert("SHAPE".to_string());
        opts.include_record_id = false;
        opts
    }

    fn hit(field: &str, value: &str, datatype: &str) -> ScanKey {
        ScanKey::new("row1", field, value, datatype, "uid1")
    }

    #[test]
    fn test_index_only_fields_aggregated() {
        let agg = FieldIndexAggregator::new(Arc::new(options()));
        let doc = agg
            .aggregate(
                "uid1",
                &[
                    hit("COLOR", "red", "t1"),
                    hit("SHAPE", "round", "t1"),
                    hit("WEIGHT", "3", "t1"), // not index-only
                ],
            )
            .unwrap();
        assert_eq!(doc.first_text("COLOR"), Some("red"));
        assert_eq!(doc.first_text("SHAPE"), Some("round"));
        assert!(doc.values("WEIGHT").is_empty());
    }

    #[test]
    fn test_datatype_filter_applied_per_key() {
        let mut opts = options();
        opts.datatype_filter = Arc::new(KeyFilter::from_csv("t1"));
        let agg = FieldIndexAggregator::new(Arc::new(opts));
        let doc = agg
            .aggregate(
                "uid1",
                &[hit("COLOR", "red", "t1"), hit("SHAPE", "round", "t2")],
            )
            .unwrap();
        assert_eq!(doc.first_text("COLOR"), Some("red"));
        assert!(doc.values("SHAPE").is_empty());
    }

    #[test]
    fn test_composite_synthesis_in_constituent_order() {
        let mut opts = options();
        let mut composites = crate::config::CompositeMetadata::new();
        composites.insert(
            "MAKE_MODEL",
            vec!["MAKE".to_string(), "MODEL".to_string()],
        );
        opts.composite_metadata = Arc::new(composites);
        let agg = FieldIndexAggregator::new(Arc::new(opts));

        let doc = agg
            .aggregate(
                "uid1",
                &[hit("MODEL", "Model3", "t1"), hit("MAKE", "Tesla", "t1")],
            )
            .unwrap();
        assert_eq!(doc.first_text("MAKE_MODEL"), Some("Tesla,Model3"));
    }

    #[test]
    fn test_composite_skipped_when_constituent_missing() {
        let mut opts = options();
        let mut composites = crate::config::CompositeMetadata::new();
        composites.insert(
            "MAKE_MODEL",
            vec!["MAKE".to_string(), "MODEL".to_string()],
        );
        opts.composite_metadata = Arc::new(composites);
        let agg = FieldIndexAggregator::new(Arc::new(opts));

        let doc = agg.aggregate("uid1", &[hit("MAKE", "Tesla", "t1")]).unwrap();
        assert!(doc.values("MAKE_MODEL").is_empty());
    }

    #[test]
    fn test_term_frequency_tokens() {
        struct FixtureTf;
        impl TermFrequencySource for FixtureTf {
            fn positions(&self, _uid: &str, field: &str) -> Result<Vec<TokenPosition>> {
                if field == "BODY" {
                    Ok(vec![
                        TokenPosition {
                            token: "quick".to_string(),
                            position: 1,
                        },
                        TokenPosition {
                            token: "fox".to_string(),
                            position: 3,
                        },
                    ])
                } else {
                    Ok(Vec::new())
                }
            }
        }

        let mut opts = options();
        opts.term_frequency_fields.insert("BODY".to_string());
        opts.term_frequencies_required = true;
        let agg = FieldIndexAggregator::new(Arc::new(opts))
            .with_term_frequencies(Box::new(FixtureTf));

        let doc = agg.aggregate("uid1", &[]).unwrap();
        let tokens = doc.values("BODY")[0].as_tokens().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].token, "quick");
    }

    #[test]
    fn test_limit_fields_cap_values() {
        let mut opts = options();
        opts.limit_fields.insert("COLOR".to_string(), 2);
        let agg = FieldIndexAggregator::new(Arc::new(opts));
        let doc = agg
            .aggregate(
                "uid1",
                &[
                    hit("COLOR", "red", "t1"),
                    hit("COLOR", "blue", "t1"),
                    hit("COLOR", "green", "t1"),
                ],
            )
            .unwrap();
        assert_eq!(doc.values("COLOR").len(), 2);
    }

    #[test]
    fn test_datatype_and_record_id_fields() {
        let mut opts = options();
        opts.include_datatype = true;
        opts.include_record_id = true;
        let agg = FieldIndexAggregator::new(Arc::new(opts));
        let doc = agg.aggregate("uid1", &[hit("COLOR", "red", "t7")]).unwrap();
        assert_eq!(doc.first_text("EVENT_DATATYPE"), Some("t7"));
        assert_eq!(doc.first_text("RECORD_ID"), Some("uid1"));
    }
}
