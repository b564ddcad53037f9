//! # Quarry
//!
//! The scan-time query evaluation core of a distributed, indexed wide-column
//! data store: given a sorted range of key/value entries and a boolean
//! field-predicate query, it decides which records match, assembles their
//! result documents, and returns them incrementally to a calling scanner
//! while bounding memory, disk, and thread usage.
//!
//! ## Components
//!
//! - Option-map validation producing an immutable [`ScanOptions`]
//! - The ivarator: an external overflow cache that spills field-index hits
//!   to sorted runs and merges them back in ascending order
//! - The evaluation pipeline: serial or bounded-parallel predicate
//!   evaluation with scan-order delivery and cooperative yielding
//! - The batch coordinator multiplexing many (range, query) pairs through
//!   one scan session

// Core modules
mod aggregator;
mod batch;
pub mod cancel;
pub mod config;
mod data;
mod error;
mod filter;
pub mod ivarator;
mod metrics;
pub mod pipeline;
mod registry;
mod session;
mod util;

// Re-exports for the public API
pub use aggregator::{FieldIndexAggregator, TermFrequencySource};
pub use batch::{BatchCoordinator, BatchEntry};
pub use cancel::{CancellationPoller, CancellationSignal, ManualCancellation, NeverCancelled};
pub use config::compress::{compress_option, decompress_option};
pub use config::metadata::{CompositeMetadata, TypeMetadata, TypeMetadataProvider};
pub use config::options::ScanOptions;
pub use data::{Document, FieldValue, ScanKey, ScanRange, TokenPosition};
pub use error::{QuarryError, Result};
pub use filter::KeyFilter;
pub use ivarator::store::{FileSpillStore, MemorySpillStore, SpillStore};
pub use ivarator::{Ivarator, IvaratorConfig, SourceBudget};
pub use metrics::MetricsSink;
pub use pipeline::{
    EvalOutcome, Evaluator, ParallelPipeline, Pipeline, PipelineStatus, SerialPipeline,
    SubmitStatus,
};
pub use registry::{DocumentTransform, TransformRegistry};
pub use session::{ScanOutcome, ScanSession, SortedSource};
pub use util::HandleCache;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
