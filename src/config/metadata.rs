//! Field metadata shipped through the option map.
//!
//! Three mappings share the same text wire format
//! (`FIELD:item1,item2;FIELD2:item3`):
//!
//! - [`TypeMetadata`] — field name to the set of value-type identifiers
//!   used to interpret that field's stored bytes
//! - [`CompositeMetadata`] — composite field name to the ordered fields it
//!   is synthesized from
//! - the non-indexed type map parsed by [`parse_field_type_map`]
//!
//! Unparsable entries are skipped with a warning rather than failing the
//! whole mapping, matching the forgiving behavior callers depend on.

use ahash::{AHashMap, AHashSet};
use log::{debug, warn};

use crate::error::Result;

/// Mapping from field name to the set of value-type identifiers for that
/// field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeMetadata {
    types: AHashMap<String, AHashSet<String>>,
}

impl TypeMetadata {
    pub fn new() -> Self {
        TypeMetadata::default()
    }

    /// Parse from the `FIELD:type1,type2;...` wire form.
    pub fn parse(data: &str) -> Self {
        TypeMetadata {
            types: parse_field_type_map(data),
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, type_name: impl Into<String>) {
        self.types
            .entry(field.into())
            .or_default()
            .insert(type_name.into());
    }

    pub fn types_for(&self, field: &str) -> Option<&AHashSet<String>> {
        self.types.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.types.keys()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Serialize back to the wire form.
    pub fn to_option_string(&self) -> String {
        serialize_field_type_map(&self.types)
    }
}

/// Mapping describing which index-only field names are synthesized by
/// combining other fields. Constituent order is significant: composite
/// values are built by joining constituent values in this order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositeMetadata {
    composites: AHashMap<String, Vec<String>>,
}

impl CompositeMetadata {
    pub fn new() -> Self {
        CompositeMetadata::default()
    }

    /// Parse from the `COMPOSITE:field1,field2;...` wire form.
    pub fn parse(data: &str) -> Self {
        let mut composites = AHashMap::new();
        for entry in data.split(';').filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some((name, fields)) if !name.is_empty() => {
                    let constituents: Vec<String> = fields
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect();
                    if constituents.is_empty() {
                        warn!("skipping composite entry with no constituents: '{entry}'");
                    } else {
                        composites.insert(name.trim().to_string(), constituents);
                    }
                }
                _ => warn!("skipping unparseable composite entry: '{entry}'"),
            }
        }
        CompositeMetadata { composites }
    }

    pub fn insert(&mut self, name: impl Into<String>, constituents: Vec<String>) {
        self.composites.insert(name.into(), constituents);
    }

    pub fn constituents(&self, composite: &str) -> Option<&[String]> {
        self.composites.get(composite).map(Vec::as_slice)
    }

    /// The synthesized field names; these extend the index-only set.
    pub fn composite_fields(&self) -> impl Iterator<Item = &String> {
        self.composites.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.composites.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.composites.is_empty()
    }
}

/// Parse a `FIELD:item1,item2;FIELD2:item3` mapping, skipping unparsable
/// entries with a warning.
pub fn parse_field_type_map(data: &str) -> AHashMap<String, AHashSet<String>> {
    let mut mapping = AHashMap::new();
    for entry in data.split(';').filter(|e| !e.is_empty()) {
        match entry.split_once(':') {
            Some((field, items)) if !field.is_empty() => {
                let set: AHashSet<String> = items
                    .split(',')
                    .map(str::trim)
                    .filter(|i| !i.is_empty())
                    .map(String::from)
                    .collect();
                mapping.insert(field.trim().to_string(), set);
            }
            _ => warn!("skipping unparseable type map entry: '{entry}' from '{data}'"),
        }
    }
    mapping
}

/// Serialize a field/type mapping to the wire form.
pub fn serialize_field_type_map(map: &AHashMap<String, AHashSet<String>>) -> String {
    let mut entries: Vec<String> = map
        .iter()
        .map(|(field, items)| {
            let mut items: Vec<&str> = items.iter().map(String::as_str).collect();
            items.sort_unstable();
            format!("{field}:{}", items.join(","))
        })
        .collect();
    entries.sort_unstable();
    entries.join(";")
}

/// External provider of type metadata, keyed by (table name, authorization
/// set).
///
/// Resolved once, eagerly, at session start; the result is cached on the
/// options for the session's lifetime. Provider failures are non-fatal:
/// the session falls back to an empty mapping.
pub trait TypeMetadataProvider: Send + Sync {
    fn resolve(&self, table: &str, auths: &[String]) -> Result<TypeMetadata>;
}

/// Resolve type metadata through a provider, falling back to an empty
/// mapping when the provider fails.
pub fn resolve_or_empty(
    provider: &dyn TypeMetadataProvider,
    table: &str,
    auths: &[String],
) -> TypeMetadata {
    match provider.resolve(table, auths) {
        Ok(metadata) => {
            debug!(
                "resolved type metadata for table '{table}': {} fields",
                metadata.len()
            );
            metadata
        }
        Err(e) => {
            warn!("type metadata provider failed for table '{table}', using empty mapping: {e}");
            TypeMetadata::new()
        }
    }
}
