//! Key filters applied before aggregation.
//!
//! The set of real-world filter shapes is small and closed, so filters are
//! a tagged enum rather than an open predicate trait.

use ahash::AHashSet;

use crate::data::ScanKey;

/// Filter over field-index keys, checked once per key before any value
/// work happens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyFilter {
    /// Pass everything through.
    #[default]
    Identity,
    /// Keep only keys whose datatype is in the allow-list.
    DatatypeAllowList(AHashSet<String>),
}

impl KeyFilter {
    /// Build from the `datatype.filter` CSV option. An empty or absent
    /// list means no filtering.
    pub fn from_csv(csv: &str) -> KeyFilter {
        let datatypes: AHashSet<String> = csv
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        if datatypes.is_empty() {
            KeyFilter::Identity
        } else {
            KeyFilter::DatatypeAllowList(datatypes)
        }
    }

    /// Whether the key passes this filter.
    pub fn accept(&self, key: &ScanKey) -> bool {
        match self {
            KeyFilter::Identity => true,
            KeyFilter::DatatypeAllowList(allowed) => allowed.contains(&key.datatype),
        }
    }
}
