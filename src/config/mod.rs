//! Configuration parsing and validation for a scan session.
//!
//! The calling scan-session host hands over a flat string-keyed option map;
//! [`options::ScanOptions::validate`] turns it into a strongly-typed,
//! immutable-after-validation configuration, failing closed on any
//! inconsistency. Large serialized sub-documents (type metadata, composite
//! metadata, the non-indexed type map) may travel gzip-compressed and
//! base64-encoded; see [`compress`].

pub mod compress;
pub mod metadata;
pub mod options;

pub use self::compress::{compress_option, decompress_option};
pub use self::metadata::{CompositeMetadata, TypeMetadata, TypeMetadataProvider};
pub use self::options::ScanOptions;
