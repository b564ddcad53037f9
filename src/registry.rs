//! Post-processing transform registry.
//!
//! Matched documents may be run through a chain of named transforms after
//! predicate evaluation. Transforms are registered under string tags and
//! resolved at configuration time; an unknown tag is a configuration
//! error, not a runtime failure.

use ahash::AHashMap;

use crate::data::Document;
use crate::error::{QuarryError, Result};

/// One post-evaluation transformation step. Returning `None` drops the
/// document from the result stream.
pub trait DocumentTransform: Send {
    fn apply(&self, doc: Document) -> Option<Document>;
}

type TransformFactory = Box<dyn Fn() -> Box<dyn DocumentTransform> + Send + Sync>;

/// Registry mapping a string tag to a transform factory.
pub struct TransformRegistry {
    factories: AHashMap<String, TransformFactory>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = TransformRegistry {
            factories: AHashMap::new(),
        };
        registry.register("drop-empty", || Box::new(DropEmpty));
        registry
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        TransformRegistry::default()
    }

    /// Register a factory under a tag, replacing any previous registration.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn DocumentTransform> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Validate a CSV of tags, returning them in order. Unknown tags fail
    /// with a configuration error.
    pub fn resolve_tags(&self, csv: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for tag in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if !self.is_registered(tag) {
                return Err(QuarryError::config(format!(
                    "unknown post-processing transform: '{tag}'"
                )));
            }
            tags.push(tag.to_string());
        }
        Ok(tags)
    }

    /// Instantiate the transform chain for previously resolved tags.
    pub fn build_chain(&self, tags: &[String]) -> Result<Vec<Box<dyn DocumentTransform>>> {
        tags.iter()
            .map(|tag| {
                self.factories
                    .get(tag)
                    .map(|factory| factory())
                    .ok_or_else(|| {
                        QuarryError::config(format!("unknown post-processing transform: '{tag}'"))
                    })
            })
            .collect()
    }
}

/// Built-in transform dropping documents with no fields.
struct DropEmpty;

impl DocumentTransform for DropEmpty {
    fn apply(&self, doc: Document) -> Option<Document> {
        if doc.is_empty() { None } else { Some(doc) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldValue;

    #[test]
    fn test_unknown_tag_is_config_error() {
        let registry = TransformRegistry::new();
        let err = registry.resolve_tags("drop-empty,nonsense").unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_resolve_and_build_chain() {
        let mut registry = TransformRegistry::new();
        registry.register("uppercase-uid", || Box::new(UppercaseUid));

        let tags = registry.resolve_tags("drop-empty, uppercase-uid").unwrap();
        assert_eq!(tags, vec!["drop-empty", "uppercase-uid"]);

        let chain = registry.build_chain(&tags).unwrap();
        let mut doc = Document::new("abc");
        doc.put("F", FieldValue::Text("v".into()));
        let mut doc = Some(doc);
        for transform in &chain {
            doc = doc.and_then(|d| transform.apply(d));
        }
        assert_eq!(doc.unwrap().uid, "ABC");
    }

    #[test]
    fn test_drop_empty() {
        let registry = TransformRegistry::new();
        let chain = registry.build_chain(&["drop-empty".to_string()]).unwrap();
        assert!(chain[0].apply(Document::new("u")).is_none());
    }

    struct UppercaseUid;

    impl DocumentTransform for UppercaseUid {
        fn apply(&self, mut doc: Document) -> Option<Document> {
            doc.uid = doc.uid.to_uppercase();
            Some(doc)
        }
    }
}
