//! Scan session options: parsing, validation, self-documentation.
//!
//! [`ScanOptions::validate`] is the single entry point: it parses the flat
//! string-keyed option map the scan-session host hands over and fails
//! closed on any inconsistency rather than guessing a default that could
//! silently change query semantics. The returned options are immutable for
//! the rest of the session; [`ScanOptions::deep_copy`] produces an
//! independent copy for per-batch mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use log::{error, trace, warn};

use crate::batch::BatchEntry;
use crate::config::compress::decompress_option;
use crate::config::metadata::{
    CompositeMetadata, TypeMetadata, TypeMetadataProvider, parse_field_type_map, resolve_or_empty,
};
use crate::data::ScanRange;
use crate::error::{QuarryError, Result};
use crate::filter::KeyFilter;
use crate::registry::TransformRegistry;

// ── Option keys ─────────────────────────────────────────────────────────

pub const QUERY: &str = "query";
pub const QUERY_ID: &str = "query.id";
pub const SCAN_ID: &str = "scan.id";
pub const DISABLE_EVALUATION: &str = "disable.evaluation";
pub const LIMIT_SOURCES: &str = "sources.limit.count";
pub const DISABLE_INDEX_ONLY_DOCUMENTS: &str = "disable.index.only.documents";
pub const FULL_TABLE_SCAN_ONLY: &str = "full.table.scan.only";
pub const PROJECTION_FIELDS: &str = "projection.fields";
pub const EXCLUDE_FIELDS: &str = "exclude.fields";
pub const INDEX_ONLY_FIELDS: &str = "index.only.fields";
pub const COMPOSITE_METADATA: &str = "composite.metadata";
pub const TYPE_METADATA: &str = "type.metadata";
pub const TYPE_METADATA_AUTHS: &str = "type.metadata.auths";
pub const METADATA_TABLE_NAME: &str = "metadata.table.name";
pub const NON_INDEXED_TYPES: &str = "non.indexed.types";
pub const QUERY_MAPPING_COMPRESS: &str = "query.mapping.compress";
pub const DATATYPE_FILTER: &str = "datatype.filter";
pub const INCLUDE_DATATYPE: &str = "include.datatype";
pub const DATATYPE_FIELDNAME: &str = "include.datatype.fieldname";
pub const INCLUDE_RECORD_ID: &str = "include.record.id";
pub const TERM_FREQUENCY_FIELDS: &str = "term.frequency.fields";
pub const TERM_FREQUENCIES_REQUIRED: &str = "term.frequencies.are.required";
pub const LIMIT_FIELDS: &str = "limit.fields";
pub const HIT_LIST: &str = "hit.list";
pub const START_TIME: &str = "start.time";
pub const END_TIME: &str = "end.time";
pub const SORTED_UIDS: &str = "sorted.uids";
pub const POSTPROCESSING_CLASSES: &str = "postprocessing.classes";
pub const IVARATOR_CACHE_BASE_LOCATIONS: &str = "ivarator.cache.base.locations";
pub const IVARATOR_CACHE_BUFFER_SIZE: &str = "ivarator.cache.buffer.size";
pub const IVARATOR_SCAN_PERSIST_THRESHOLD: &str = "ivarator.scan.persist.threshold";
pub const IVARATOR_SCAN_TIMEOUT: &str = "ivarator.scan.timeout";
pub const MAX_INDEX_RANGE_SPLIT: &str = "max.index.range.split";
pub const MAX_IVARATOR_OPEN_FILES: &str = "max.ivarator.open.files";
pub const MAX_IVARATOR_SOURCES: &str = "max.ivarator.sources";
pub const MAX_EVALUATION_PIPELINES: &str = "max.evaluation.pipelines";
pub const SERIAL_EVALUATION_PIPELINE: &str = "serial.evaluation.pipeline";
pub const MAX_PIPELINE_CACHED_RESULTS: &str = "max.pipeline.cached.results";
pub const YIELD_THRESHOLD_MS: &str = "yield.threshold.ms";
pub const METRICS_HOST_COLON_PORT: &str = "metrics.host.colon.port";
pub const METRICS_MAX_QUEUE_SIZE: &str = "metrics.max.queue.size";
pub const BATCHED_QUERY: &str = "query.iterator.batch";
pub const BATCHED_QUERY_RANGE_PREFIX: &str = "query.iterator.batch.range.";
pub const BATCHED_QUERY_PREFIX: &str = "query.iterator.batch.query.";

pub const DEFAULT_DATATYPE_FIELDNAME: &str = "EVENT_DATATYPE";

// ── Options ─────────────────────────────────────────────────────────────

/// Validated scan session configuration. Immutable after
/// [`ScanOptions::validate`].
#[derive(Clone)]
pub struct ScanOptions {
    pub query: Option<String>,
    pub query_id: Option<String>,
    pub scan_id: Option<String>,
    pub disable_evaluation: bool,
    /// Maximum scan sources the client allows, -1 for unlimited.
    pub source_limit: i64,
    pub disable_index_only_documents: bool,
    pub full_table_scan_only: bool,

    pub project_results: bool,
    pub projection_fields: AHashSet<String>,
    pub exclude_fields: AHashSet<String>,

    pub index_only_fields: AHashSet<String>,
    pub type_metadata: Arc<TypeMetadata>,
    pub type_metadata_auths: Vec<String>,
    pub metadata_table_name: Option<String>,
    pub composite_metadata: Arc<CompositeMetadata>,
    pub non_indexed_types: AHashMap<String, AHashSet<String>>,
    pub datatype_filter: Arc<KeyFilter>,

    pub term_frequency_fields: AHashSet<String>,
    pub term_frequencies_required: bool,
    pub limit_fields: AHashMap<String, usize>,
    pub hit_list: bool,
    pub include_datatype: bool,
    pub datatype_field: String,
    pub include_record_id: bool,

    /// Epoch millis, inclusive.
    pub start_time: i64,
    /// Epoch millis, inclusive. Always >= start_time.
    pub end_time: i64,

    pub sorted_uids: bool,
    pub ivarator_cache_base_locations: Vec<String>,
    pub ivarator_cache_buffer_size: usize,
    pub ivarator_scan_persist_threshold: u64,
    pub ivarator_scan_timeout: Duration,
    pub max_index_range_split: usize,
    pub ivarator_max_open_files: usize,
    pub max_ivarator_sources: usize,

    pub max_evaluation_pipelines: usize,
    pub serial_evaluation_pipeline: bool,
    pub max_pipeline_cached_results: usize,
    pub yield_threshold: Duration,

    pub metrics_addr: Option<String>,
    pub metrics_max_queue_size: usize,

    pub batch_entries: Vec<BatchEntry>,
    pub postprocessing_tags: Vec<String>,

    compressed_mappings: bool,
    type_metadata_provider: Option<Arc<dyn TypeMetadataProvider>>,
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOptions")
            .field("query", &self.query)
            .field("query_id", &self.query_id)
            .field("scan_id", &self.scan_id)
            .field("disable_evaluation", &self.disable_evaluation)
            .field("full_table_scan_only", &self.full_table_scan_only)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("sorted_uids", &self.sorted_uids)
            .field("batch_entries", &self.batch_entries.len())
            .field(
                "max_evaluation_pipelines",
                &self.max_evaluation_pipelines,
            )
            .finish()
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            query: None,
            query_id: None,
            scan_id: None,
            disable_evaluation: false,
            source_limit: -1,
            disable_index_only_documents: false,
            full_table_scan_only: false,
            project_results: false,
            projection_fields: AHashSet::new(),
            exclude_fields: AHashSet::new(),
            index_only_fields: AHashSet::new(),
            type_metadata: Arc::new(TypeMetadata::new()),
            type_metadata_auths: Vec::new(),
            metadata_table_name: None,
            composite_metadata: Arc::new(CompositeMetadata::new()),
            non_indexed_types: AHashMap::new(),
            datatype_filter: Arc::new(KeyFilter::Identity),
            term_frequency_fields: AHashSet::new(),
            term_frequencies_required: false,
            limit_fields: AHashMap::new(),
            hit_list: false,
            include_datatype: false,
            datatype_field: DEFAULT_DATATYPE_FIELDNAME.to_string(),
            include_record_id: true,
            start_time: 0,
            end_time: 0,
            sorted_uids: true,
            ivarator_cache_base_locations: Vec::new(),
            ivarator_cache_buffer_size: 10_000,
            ivarator_scan_persist_threshold: 100_000,
            ivarator_scan_timeout: Duration::from_secs(60 * 60),
            max_index_range_split: 11,
            ivarator_max_open_files: 100,
            max_ivarator_sources: 33,
            max_evaluation_pipelines: 25,
            serial_evaluation_pipeline: false,
            max_pipeline_cached_results: 25,
            yield_threshold: Duration::from_millis(u64::MAX),
            metrics_addr: None,
            metrics_max_queue_size: 500,
            batch_entries: Vec::new(),
            postprocessing_tags: Vec::new(),
            compressed_mappings: false,
            type_metadata_provider: None,
        }
    }
}

impl ScanOptions {
    /// Validate an option map against the default transform registry.
    pub fn validate(options: &HashMap<String, String>) -> Result<ScanOptions> {
        Self::validate_with_registry(options, &TransformRegistry::default())
    }

    /// Validate an option map, failing closed on any inconsistency.
    pub fn validate_with_registry(
        options: &HashMap<String, String>,
        registry: &TransformRegistry,
    ) -> Result<ScanOptions> {
        trace!("validating {} options", options.len());

        let mut opts = ScanOptions::default();

        if let Some(v) = options.get(DISABLE_EVALUATION) {
            opts.disable_evaluation = parse_bool(v);
        }

        match options.get(QUERY) {
            Some(q) if !q.trim().is_empty() => opts.query = Some(q.clone()),
            _ if opts.disable_evaluation => {}
            _ => {
                error!("if a query is not specified, evaluation must be disabled");
                return Err(QuarryError::config(
                    "a predicate query is required unless evaluation is disabled",
                ));
            }
        }

        opts.query_id = options.get(QUERY_ID).cloned();
        opts.scan_id = options.get(SCAN_ID).cloned();

        if let Some(v) = options.get(LIMIT_SOURCES) {
            // An unparsable limit resets to unlimited rather than aborting.
            opts.source_limit = v.parse().unwrap_or(-1);
        }

        if let Some(v) = options.get(DISABLE_INDEX_ONLY_DOCUMENTS) {
            opts.disable_index_only_documents = parse_bool(v);
        }

        if let Some(v) = options.get(FULL_TABLE_SCAN_ONLY) {
            opts.full_table_scan_only = parse_bool(v);
        }

        if let Some(v) = options.get(QUERY_MAPPING_COMPRESS) {
            opts.compressed_mappings = parse_bool(v);
        }

        opts.validate_metadata(options)?;

        if let Some(fields) = options.get(PROJECTION_FIELDS) {
            opts.project_results = true;
            opts.projection_fields = parse_field_set(fields);
        }

        if let Some(fields) = options.get(EXCLUDE_FIELDS) {
            if opts.project_results {
                error!("{PROJECTION_FIELDS} and {EXCLUDE_FIELDS} are mutually exclusive");
                return Err(QuarryError::config(
                    "projection and exclusion field lists are mutually exclusive",
                ));
            }
            opts.project_results = true;
            opts.exclude_fields = parse_field_set(fields);
        }

        match options.get(INDEX_ONLY_FIELDS) {
            Some(fields) => opts.index_only_fields = parse_field_set(fields),
            None if !opts.full_table_scan_only => {
                error!("a list of index only fields must be provided for an optimized scan");
                return Err(QuarryError::config(
                    "index-only fields are required unless performing a full table scan",
                ));
            }
            None => {}
        }

        if let Some(csv) = options.get(DATATYPE_FILTER) {
            opts.datatype_filter = Arc::new(KeyFilter::from_csv(csv));
        }

        if let Some(v) = options.get(INCLUDE_DATATYPE) {
            opts.include_datatype = parse_bool(v);
            if opts.include_datatype {
                if let Some(name) = options.get(DATATYPE_FIELDNAME) {
                    opts.datatype_field = name.clone();
                }
            }
        }

        if let Some(v) = options.get(INCLUDE_RECORD_ID) {
            opts.include_record_id = parse_bool(v);
        }

        opts.start_time = parse_required_i64(options, START_TIME)?;
        opts.end_time = parse_required_i64(options, END_TIME)?;
        if opts.end_time < opts.start_time {
            error!(
                "the start time was greater than the end time: {} > {}",
                opts.start_time, opts.end_time
            );
            return Err(QuarryError::config(format!(
                "start time {} is after end time {}",
                opts.start_time, opts.end_time
            )));
        }

        if let Some(csv) = options.get(TERM_FREQUENCY_FIELDS) {
            opts.term_frequency_fields = parse_field_set(csv);
        }
        if let Some(v) = options.get(TERM_FREQUENCIES_REQUIRED) {
            opts.term_frequencies_required = parse_bool(v);
        }

        if let Some(raw) = options.get(LIMIT_FIELDS) {
            for group in raw.split(',').map(str::trim).filter(|g| !g.is_empty()) {
                if let Some((field, count)) = group.split_once('=') {
                    match count.trim().parse() {
                        Ok(count) => {
                            opts.limit_fields.insert(field.trim().to_string(), count);
                        }
                        Err(_) => {
                            return Err(QuarryError::config(format!(
                                "unparseable limit.fields entry: '{group}'"
                            )));
                        }
                    }
                }
            }
        }

        if let Some(v) = options.get(HIT_LIST) {
            opts.hit_list = parse_bool(v);
        }

        if let Some(v) = options.get(SORTED_UIDS) {
            opts.sorted_uids = parse_bool(v);
        }

        if let Some(csv) = options.get(POSTPROCESSING_CLASSES) {
            opts.postprocessing_tags = registry.resolve_tags(csv)?;
        }

        if let Some(csv) = options.get(IVARATOR_CACHE_BASE_LOCATIONS) {
            opts.ivarator_cache_base_locations = csv
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = options.get(IVARATOR_CACHE_BUFFER_SIZE) {
            opts.ivarator_cache_buffer_size = parse_number(IVARATOR_CACHE_BUFFER_SIZE, v)?;
        }
        if let Some(v) = options.get(IVARATOR_SCAN_PERSIST_THRESHOLD) {
            opts.ivarator_scan_persist_threshold =
                parse_number(IVARATOR_SCAN_PERSIST_THRESHOLD, v)?;
        }
        if let Some(v) = options.get(IVARATOR_SCAN_TIMEOUT) {
            opts.ivarator_scan_timeout =
                Duration::from_millis(parse_number(IVARATOR_SCAN_TIMEOUT, v)?);
        }
        if let Some(v) = options.get(MAX_INDEX_RANGE_SPLIT) {
            opts.max_index_range_split = parse_number(MAX_INDEX_RANGE_SPLIT, v)?;
        }
        if let Some(v) = options.get(MAX_IVARATOR_OPEN_FILES) {
            opts.ivarator_max_open_files = parse_number(MAX_IVARATOR_OPEN_FILES, v)?;
        }
        if let Some(v) = options.get(MAX_IVARATOR_SOURCES) {
            opts.max_ivarator_sources = parse_number(MAX_IVARATOR_SOURCES, v)?;
        }
        if let Some(v) = options.get(MAX_EVALUATION_PIPELINES) {
            opts.max_evaluation_pipelines = parse_number(MAX_EVALUATION_PIPELINES, v)?;
        }
        if let Some(v) = options.get(SERIAL_EVALUATION_PIPELINE) {
            opts.serial_evaluation_pipeline = parse_bool(v);
        }
        if let Some(v) = options.get(MAX_PIPELINE_CACHED_RESULTS) {
            opts.max_pipeline_cached_results = parse_number(MAX_PIPELINE_CACHED_RESULTS, v)?;
        }
        if let Some(v) = options.get(YIELD_THRESHOLD_MS) {
            opts.yield_threshold = Duration::from_millis(parse_number(YIELD_THRESHOLD_MS, v)?);
        }

        opts.metrics_addr = options.get(METRICS_HOST_COLON_PORT).cloned();
        if let Some(v) = options.get(METRICS_MAX_QUEUE_SIZE) {
            opts.metrics_max_queue_size = parse_number(METRICS_MAX_QUEUE_SIZE, v)?;
        }

        if let Some(v) = options.get(BATCHED_QUERY) {
            let batched: usize = parse_number(BATCHED_QUERY, v)?;
            if batched > 0 {
                // Combining is only meant to be used with threading enabled:
                // overlapping the next sub-query needs a second pipeline.
                if opts.max_evaluation_pipelines == 1 {
                    opts.max_evaluation_pipelines = 2;
                }
                for i in 0..batched {
                    let range = options.get(&format!("{BATCHED_QUERY_RANGE_PREFIX}{i}"));
                    let query = options.get(&format!("{BATCHED_QUERY_PREFIX}{i}"));
                    if let (Some(range_value), Some(query_value)) = (range, query) {
                        match ScanRange::parse(range_value) {
                            Some(range) => {
                                trace!("adding batch {range:?} {query_value}");
                                opts.batch_entries.push(BatchEntry {
                                    range,
                                    query: query_value.clone(),
                                });
                            }
                            None => {
                                return Err(QuarryError::config(format!(
                                    "unparseable batch range {i}: '{range_value}'"
                                )));
                            }
                        }
                    }
                }
            }
        }

        Ok(opts)
    }

    fn validate_metadata(&mut self, options: &HashMap<String, String>) -> Result<()> {
        if let Some(auths) = options.get(TYPE_METADATA_AUTHS) {
            let auths = self.maybe_decompress(auths)?;
            self.type_metadata_auths = auths
                .split([',', '&', ' '])
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            trace!("using type metadata auths key: {:?}", self.type_metadata_auths);
        }

        if let Some(serialized) = options.get(TYPE_METADATA) {
            let serialized = self.maybe_decompress(serialized)?;
            self.type_metadata = Arc::new(TypeMetadata::parse(&serialized));
        }

        if let Some(table) = options.get(METADATA_TABLE_NAME) {
            self.metadata_table_name = Some(table.clone());
        }

        if let Some(serialized) = options.get(COMPOSITE_METADATA) {
            let serialized = self.maybe_decompress(serialized)?;
            self.composite_metadata = Arc::new(CompositeMetadata::parse(&serialized));
        }

        if let Some(serialized) = options.get(NON_INDEXED_TYPES) {
            let serialized = self.maybe_decompress(serialized)?;
            self.non_indexed_types = parse_field_type_map(&serialized);
        }

        Ok(())
    }

    fn maybe_decompress(&self, value: &str) -> Result<String> {
        if self.compressed_mappings {
            decompress_option(value)
        } else {
            Ok(value.to_string())
        }
    }

    /// Attach the external type metadata provider used when the option map
    /// did not carry inline type metadata.
    pub fn with_type_metadata_provider(mut self, provider: Arc<dyn TypeMetadataProvider>) -> Self {
        self.type_metadata_provider = Some(provider);
        self
    }

    /// Resolve type metadata once, eagerly, at session start.
    ///
    /// Inline metadata wins; otherwise the provider is consulted, keyed by
    /// (metadata table, authorization set). Provider failures are
    /// non-fatal: the session falls back to an empty mapping.
    pub fn resolve_type_metadata(&mut self) {
        if !self.type_metadata.is_empty() {
            return;
        }
        match (&self.metadata_table_name, &self.type_metadata_provider) {
            (Some(table), Some(provider)) => {
                let resolved = resolve_or_empty(provider.as_ref(), table, &self.type_metadata_auths);
                self.type_metadata = Arc::new(resolved);
            }
            _ => warn!("no inline type metadata and no provider; using empty mapping"),
        }
    }

    /// Index-only fields plus composite fields (composites are index-only
    /// by definition).
    pub fn all_index_only_fields(&self) -> AHashSet<String> {
        let mut fields = self.index_only_fields.clone();
        fields.extend(self.composite_metadata.composite_fields().cloned());
        fields
    }

    /// Fields whose data may not be present in the base record: index-only
    /// fields, term-frequency fields (tokenized forms), and composites.
    pub fn non_record_fields(&self) -> AHashSet<String> {
        let mut fields = self.all_index_only_fields();
        fields.extend(self.term_frequency_fields.iter().cloned());
        fields
    }

    /// Datatypes that carry `field` without indexing it, from the
    /// non-indexed type map. Terms over such a field cannot be answered
    /// from the field index for those datatypes; the evaluator host falls
    /// back to fetching the record.
    pub fn type_identifiers_for(&self, field: &str) -> Option<&AHashSet<String>> {
        self.non_indexed_types.get(field)
    }

    /// An independent configuration that can be mutated per batch entry
    /// without affecting the original: mutable collections are duplicated
    /// field by field, immutable derived objects are shared by reference.
    pub fn deep_copy(&self) -> ScanOptions {
        ScanOptions {
            query: self.query.clone(),
            query_id: self.query_id.clone(),
            scan_id: self.scan_id.clone(),
            disable_evaluation: self.disable_evaluation,
            source_limit: self.source_limit,
            disable_index_only_documents: self.disable_index_only_documents,
            full_table_scan_only: self.full_table_scan_only,
            project_results: self.project_results,
            projection_fields: self.projection_fields.clone(),
            exclude_fields: self.exclude_fields.clone(),
            index_only_fields: self.index_only_fields.clone(),
            // Shared: immutable after validation.
            type_metadata: Arc::clone(&self.type_metadata),
            type_metadata_auths: self.type_metadata_auths.clone(),
            metadata_table_name: self.metadata_table_name.clone(),
            composite_metadata: Arc::clone(&self.composite_metadata),
            non_indexed_types: self.non_indexed_types.clone(),
            datatype_filter: Arc::clone(&self.datatype_filter),
            term_frequency_fields: self.term_frequency_fields.clone(),
            term_frequencies_required: self.term_frequencies_required,
            limit_fields: self.limit_fields.clone(),
            hit_list: self.hit_list,
            include_datatype: self.include_datatype,
            datatype_field: self.datatype_field.clone(),
            include_record_id: self.include_record_id,
            start_time: self.start_time,
            end_time: self.end_time,
            sorted_uids: self.sorted_uids,
            ivarator_cache_base_locations: self.ivarator_cache_base_locations.clone(),
            ivarator_cache_buffer_size: self.ivarator_cache_buffer_size,
            ivarator_scan_persist_threshold: self.ivarator_scan_persist_threshold,
            ivarator_scan_timeout: self.ivarator_scan_timeout,
            max_index_range_split: self.max_index_range_split,
            ivarator_max_open_files: self.ivarator_max_open_files,
            max_ivarator_sources: self.max_ivarator_sources,
            max_evaluation_pipelines: self.max_evaluation_pipelines,
            serial_evaluation_pipeline: self.serial_evaluation_pipeline,
            max_pipeline_cached_results: self.max_pipeline_cached_results,
            yield_threshold: self.yield_threshold,
            metrics_addr: self.metrics_addr.clone(),
            metrics_max_queue_size: self.metrics_max_queue_size,
            batch_entries: self.batch_entries.clone(),
            postprocessing_tags: self.postprocessing_tags.clone(),
            compressed_mappings: self.compressed_mappings,
            type_metadata_provider: self.type_metadata_provider.clone(),
        }
    }

    /// Whether an option key is part of the recognized contract, including
    /// the per-index batch keys.
    pub fn is_recognized_option(key: &str) -> bool {
        if describe_options().contains_key(key) {
            return true;
        }
        for prefix in [BATCHED_QUERY_RANGE_PREFIX, BATCHED_QUERY_PREFIX] {
            if let Some(index) = key.strip_prefix(prefix) {
                return index.parse::<usize>().is_ok();
            }
        }
        false
    }
}

/// Human-readable purpose of every recognized option key.
pub fn describe_options() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        (QUERY, "The boolean field-predicate query to evaluate documents against"),
        (QUERY_ID, "The UUID of the query"),
        (SCAN_ID, "The UUID of this scan session"),
        (DISABLE_EVALUATION, "If true, predicate evaluation is not performed against any document"),
        (LIMIT_SOURCES, "Allows the client to limit the number of scan sources used for this scan"),
        (DISABLE_INDEX_ONLY_DOCUMENTS, "Removes documents in which only hits against the index were found, and no base record"),
        (FULL_TABLE_SCAN_ONLY, "If true, do not perform boolean logic, just scan the documents"),
        (PROJECTION_FIELDS, "Fields to return to the client"),
        (EXCLUDE_FIELDS, "Fields to *not* return to the client"),
        (INDEX_ONLY_FIELDS, "The serialized collection of field names that only occur in the index"),
        (COMPOSITE_METADATA, "The serialized mapping of composite field names to their constituent fields"),
        (TYPE_METADATA, "A mapping of field name to a set of value-type identifiers"),
        (TYPE_METADATA_AUTHS, "The authorization set keying the external type metadata provider"),
        (METADATA_TABLE_NAME, "The name of the metadata table"),
        (NON_INDEXED_TYPES, "Type mappings to apply only at aggregation time"),
        (QUERY_MAPPING_COMPRESS, "Boolean value to indicate the metadata mappings are compressed"),
        (DATATYPE_FILTER, "CSV of datatype names that should be included when scanning"),
        (INCLUDE_DATATYPE, "Include the datatype as a field in the document"),
        (DATATYPE_FIELDNAME, "The field name to use when inserting the datatype into the document"),
        (INCLUDE_RECORD_ID, "Include the record id as a field in the document"),
        (TERM_FREQUENCY_FIELDS, "Comma-delimited list of fields that contain term frequencies"),
        (TERM_FREQUENCIES_REQUIRED, "Does the query require gathering term frequencies"),
        (LIMIT_FIELDS, "Per-field value limits, as FIELD=count pairs"),
        (HIT_LIST, "If true, evaluation additionally reports which sub-terms matched"),
        (START_TIME, "The start time for this query in epoch milliseconds"),
        (END_TIME, "The end time for this query in epoch milliseconds"),
        (SORTED_UIDS, "Whether the UIDs need to be sorted. Normally true; false lets a single-term ivarator return entries without pre-sorting"),
        (POSTPROCESSING_CLASSES, "CSV of registered transform tags to apply to documents that pass the query"),
        (IVARATOR_CACHE_BASE_LOCATIONS, "Alternative base locations for the ivarator spill cache, tried in order"),
        (IVARATOR_CACHE_BUFFER_SIZE, "Items held in memory before spilling to the external cache. Default is 10000"),
        (IVARATOR_SCAN_PERSIST_THRESHOLD, "Field index keys scanned before the cache buffer is forced to persist. Default is 100000"),
        (IVARATOR_SCAN_TIMEOUT, "The time in milliseconds after which the cache buffer is forced to persist. Default is 60 minutes"),
        (MAX_INDEX_RANGE_SPLIT, "The maximum number of sub-ranges to split a field index scan range into"),
        (MAX_IVARATOR_OPEN_FILES, "The maximum number of spill runs open at once during a merge sort; above this, runs are compacted first"),
        (MAX_IVARATOR_SOURCES, "The maximum number of scan sources for ivarators across all terms of the query"),
        (MAX_EVALUATION_PIPELINES, "The max number of evaluation pipelines"),
        (SERIAL_EVALUATION_PIPELINE, "Forces the serial pipeline: a single thread for evaluation"),
        (MAX_PIPELINE_CACHED_RESULTS, "The max number of evaluated results held beyond the pipelines awaiting in-order delivery"),
        (YIELD_THRESHOLD_MS, "Milliseconds of consecutive non-matching evaluation before the scan yields to the host scheduler"),
        (METRICS_HOST_COLON_PORT, "A metrics sink host:port; resource and timing counters are sent there when configured"),
        (METRICS_MAX_QUEUE_SIZE, "Max queued metrics before the sink flushes"),
        (BATCHED_QUERY, "Number of batched (range, query) pairs multiplexed through this session"),
    ])
}

// ── Parsers ─────────────────────────────────────────────────────────────

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_field_set(csv: &str) -> AHashSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}

fn parse_required_i64(options: &HashMap<String, String>, key: &str) -> Result<i64> {
    match options.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| QuarryError::config(format!("unparseable value for {key}: '{value}'"))),
        None => {
            error!("must pass a value for {key}");
            Err(QuarryError::config(format!("missing required option {key}")))
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QuarryError::config(format!("unparseable value for {key}: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compress::compress_option;

    fn minimal_options() -> HashMap<String, String> {
        HashMap::from([
            (QUERY.to_string(), "COLOR == 'red'".to_string()),
            (START_TIME.to_string(), "1000".to_string()),
            (END_TIME.to_string(), "2000".to_string()),
            (INDEX_ONLY_FIELDS.to_string(), "COLOR,SHAPE".to_string()),
        ])
    }

    #[test]
    fn test_minimal_valid() {
        let opts = ScanOptions::validate(&minimal_options()).unwrap();
        assert_eq!(opts.query.as_deref(), Some("COLOR == 'red'"));
        assert_eq!(opts.start_time, 1000);
        assert_eq!(opts.end_time, 2000);
        assert_eq!(opts.index_only_fields.len(), 2);
        assert!(opts.sorted_uids);
        assert_eq!(opts.ivarator_cache_buffer_size, 10_000);
        assert_eq!(opts.max_evaluation_pipelines, 25);
    }

    #[test]
    fn test_missing_query_fails_unless_evaluation_disabled() {
        let mut options = minimal_options();
        options.remove(QUERY);
        assert!(ScanOptions::validate(&options).is_err());

        options.insert(DISABLE_EVALUATION.to_string(), "true".to_string());
        let opts = ScanOptions::validate(&options).unwrap();
        assert!(opts.disable_evaluation);
        assert!(opts.query.is_none());
    }

    #[test]
    fn test_missing_time_bounds_fail() {
        for key in [START_TIME, END_TIME] {
            let mut options = minimal_options();
            options.remove(key);
            assert!(ScanOptions::validate(&options).is_err(), "{key} missing");
        }
    }

    #[test]
    fn test_start_after_end_fails() {
        let mut options = minimal_options();
        options.insert(START_TIME.to_string(), "2000".to_string());
        options.insert(END_TIME.to_string(), "1000".to_string());
        assert!(ScanOptions::validate(&options).is_err());
    }

    #[test]
    fn test_index_only_fields_required_unless_full_table_scan() {
        let mut options = minimal_options();
        options.remove(INDEX_ONLY_FIELDS);
        assert!(ScanOptions::validate(&options).is_err());

        options.insert(FULL_TABLE_SCAN_ONLY.to_string(), "true".to_string());
        assert!(ScanOptions::validate(&options).is_ok());
    }

    #[test]
    fn test_projection_and_exclusion_mutually_exclusive() {
        let mut options = minimal_options();
        options.insert(PROJECTION_FIELDS.to_string(), "A,B".to_string());
        options.insert(EXCLUDE_FIELDS.to_string(), "C".to_string());
        assert!(ScanOptions::validate(&options).is_err());

        let mut options = minimal_options();
        options.insert(PROJECTION_FIELDS.to_string(), "A,B".to_string());
        let opts = ScanOptions::validate(&options).unwrap();
        assert!(opts.project_results);
        assert!(opts.projection_fields.contains("A"));
    }

    #[test]
    fn test_unparsable_source_limit_resets_to_unlimited() {
        let mut options = minimal_options();
        options.insert(LIMIT_SOURCES.to_string(), "not a number".to_string());
        let opts = ScanOptions::validate(&options).unwrap();
        assert_eq!(opts.source_limit, -1);
    }

    #[test]
    fn test_compressed_metadata_round_trip() {
        let mut options = minimal_options();
        options.insert(QUERY_MAPPING_COMPRESS.to_string(), "true".to_string());
        options.insert(
            TYPE_METADATA.to_string(),
            compress_option("COLOR:LcType;COUNT:NumberType").unwrap(),
        );
        let opts = ScanOptions::validate(&options).unwrap();
        assert_eq!(opts.type_metadata.len(), 2);
    }

    #[test]
    fn test_corrupt_compressed_metadata_is_decode_error() {
        let mut options = minimal_options();
        options.insert(QUERY_MAPPING_COMPRESS.to_string(), "true".to_string());
        options.insert(TYPE_METADATA.to_string(), "!!definitely not base64".to_string());
        let err = ScanOptions::validate(&options).unwrap_err();
        assert!(matches!(err, QuarryError::Decode(_)));
    }

    #[test]
    fn test_batch_parsing_and_pipeline_forcing() {
        let mut options = minimal_options();
        options.insert(MAX_EVALUATION_PIPELINES.to_string(), "1".to_string());
        options.insert(BATCHED_QUERY.to_string(), "2".to_string());
        options.insert(
            format!("{BATCHED_QUERY_RANGE_PREFIX}0"),
            "a,b".to_string(),
        );
        options.insert(
            format!("{BATCHED_QUERY_PREFIX}0"),
            "COLOR == 'red'".to_string(),
        );
        options.insert(
            format!("{BATCHED_QUERY_RANGE_PREFIX}1"),
            "b,c".to_string(),
        );
        options.insert(
            format!("{BATCHED_QUERY_PREFIX}1"),
            "COLOR == 'blue'".to_string(),
        );

        let opts = ScanOptions::validate(&options).unwrap();
        assert_eq!(opts.batch_entries.len(), 2);
        // Batching with a single pipeline forces a second one.
        assert_eq!(opts.max_evaluation_pipelines, 2);
        assert_eq!(opts.batch_entries[0].query, "COLOR == 'red'");
    }

    #[test]
    fn test_batch_skips_missing_pairs() {
        let mut options = minimal_options();
        options.insert(BATCHED_QUERY.to_string(), "2".to_string());
        options.insert(format!("{BATCHED_QUERY_RANGE_PREFIX}1"), "b,c".to_string());
        options.insert(
            format!("{BATCHED_QUERY_PREFIX}1"),
            "COLOR == 'blue'".to_string(),
        );
        let opts = ScanOptions::validate(&options).unwrap();
        assert_eq!(opts.batch_entries.len(), 1);
    }

    #[test]
    fn test_unknown_postprocessing_tag_fails() {
        let mut options = minimal_options();
        options.insert(POSTPROCESSING_CLASSES.to_string(), "no-such-tag".to_string());
        assert!(ScanOptions::validate(&options).is_err());
    }

    #[test]
    fn test_all_index_only_fields_include_composites() {
        let mut options = minimal_options();
        options.insert(
            COMPOSITE_METADATA.to_string(),
            "MAKE_MODEL:MAKE,MODEL".to_string(),
        );
        let opts = ScanOptions::validate(&options).unwrap();
        let all = opts.all_index_only_fields();
        assert!(all.contains("COLOR"));
        assert!(all.contains("MAKE_MODEL"));
    }

    #[test]
    fn test_type_identifiers_for_non_indexed_field() {
        let mut options = minimal_options();
        options.insert(
            NON_INDEXED_TYPES.to_string(),
            "NOTES:type-a,type-b".to_string(),
        );
        let opts = ScanOptions::validate(&options).unwrap();

        let types = opts.type_identifiers_for("NOTES").unwrap();
        assert!(types.contains("type-a"));
        assert!(types.contains("type-b"));
        assert!(opts.type_identifiers_for("COLOR").is_none());
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let opts = ScanOptions::validate(&minimal_options()).unwrap();
        let mut copy = opts.deep_copy();
        copy.index_only_fields.insert("EXTRA".to_string());
        copy.query = Some("SHAPE == 'round'".to_string());

        assert!(!opts.index_only_fields.contains("EXTRA"));
        assert_eq!(opts.query.as_deref(), Some("COLOR == 'red'"));
        // Derived objects are shared, not duplicated.
        assert!(Arc::ptr_eq(&opts.type_metadata, &copy.type_metadata));
        assert!(Arc::ptr_eq(&opts.datatype_filter, &copy.datatype_filter));
    }

    #[test]
    fn test_describe_options_covers_recognition() {
        assert!(ScanOptions::is_recognized_option(QUERY));
        assert!(ScanOptions::is_recognized_option(YIELD_THRESHOLD_MS));
        assert!(ScanOptions::is_recognized_option(
            "query.iterator.batch.range.17"
        ));
        assert!(!ScanOptions::is_recognized_option("no.such.option"));
        assert!(!ScanOptions::is_recognized_option(
            "query.iterator.batch.range.x"
        ));
    }

    #[test]
    fn test_yield_threshold_parse() {
        let mut options = minimal_options();
        options.insert(YIELD_THRESHOLD_MS.to_string(), "250".to_string());
        let opts = ScanOptions::validate(&options).unwrap();
        assert_eq!(opts.yield_threshold, Duration::from_millis(250));
    }
}
