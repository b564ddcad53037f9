//! The scan session: one configured pass over a row range.
//!
//! A session owns the validated options and drives the whole machine:
//! keys come from the external [`SortedSource`], are grouped by record
//! into candidates, aggregated into partial documents, pushed through the
//! evaluation pipeline, and matches come back in scan order, run through
//! the post-processing transform chain and handed to the caller.
//!
//! A session always ends in a classified outcome. A cancelled scan is
//! [`ScanOutcome::Cancelled`], a yield is [`ScanOutcome::Yielded`] with a
//! resume point, and anything else is a typed error; a truncated stream is
//! never returned silently.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};

use ahash::AHashSet;

use crate::aggregator::{FieldIndexAggregator, RECORD_ID_FIELD};
use crate::batch::{BatchCoordinator, BatchEntry};
use crate::cancel::CancellationPoller;
use crate::config::ScanOptions;
use crate::data::{Document, ScanKey, ScanRange};
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::pipeline::{
    Evaluator, ParallelPipeline, Pipeline, PipelineStatus, SerialPipeline, SubmitStatus,
};
use crate::registry::{DocumentTransform, TransformRegistry};

/// External range-scan collaborator: the store's sorted key stream.
pub trait SortedSource: Send {
    /// Position the source at the start of the range; subsequent `next`
    /// calls return only keys within it.
    fn seek(&mut self, range: &ScanRange) -> Result<()>;

    /// The next key in sort order, `None` at the end of the range.
    fn next(&mut self) -> Result<Option<ScanKey>>;
}

/// How a scan ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every candidate in the range was evaluated and delivered.
    Complete { matched: u64 },
    /// The yield threshold elapsed; resume `resume_sequence` candidates
    /// past the start of the current batch entry.
    Yielded { resume_sequence: u64 },
    /// The session was cancelled; partial results already delivered stand.
    Cancelled,
}

enum Drained {
    Done(u64),
    Yielded(u64),
    Cancelled,
}

/// One configured scan over a row range.
pub struct ScanSession {
    options: Arc<ScanOptions>,
    evaluator: Arc<dyn Evaluator>,
    registry: TransformRegistry,
    poller: Option<Arc<CancellationPoller>>,
    metrics: Option<MetricsSink>,
    non_record_fields: AHashSet<String>,
}

impl ScanSession {
    pub fn new(options: ScanOptions, evaluator: Arc<dyn Evaluator>) -> ScanSession {
        let metrics = options
            .metrics_addr
            .as_deref()
            .map(|addr| MetricsSink::parse(addr, options.metrics_max_queue_size));
        let non_record_fields = options.non_record_fields();
        ScanSession {
            options: Arc::new(options),
            evaluator,
            registry: TransformRegistry::default(),
            poller: None,
            metrics,
            non_record_fields,
        }
    }

    pub fn with_cancellation(mut self, poller: Arc<CancellationPoller>) -> ScanSession {
        self.poller = Some(poller);
        self
    }

    /// Replace the default transform registry; the session's
    /// post-processing tags are resolved against this one.
    pub fn with_registry(mut self, registry: TransformRegistry) -> ScanSession {
        self.registry = registry;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan `range`, delivering each matched document to `on_match` in
    /// scan order.
    pub fn run(
        &self,
        source: &mut dyn SortedSource,
        range: &ScanRange,
        on_match: &mut dyn FnMut(Document),
    ) -> Result<ScanOutcome> {
        let transforms = self.registry.build_chain(&self.options.postprocessing_tags)?;
        let aggregator = FieldIndexAggregator::new(Arc::clone(&self.options));
        let mut pipeline = self.build_pipeline();

        let mut coordinator = if self.options.batch_entries.is_empty() {
            BatchCoordinator::new([BatchEntry {
                range: range.clone(),
                query: self.options.query.clone().unwrap_or_default(),
            }])
        } else {
            BatchCoordinator::new(self.options.batch_entries.iter().cloned())
        };

        let mut matched = 0u64;
        while let Some(entry) = coordinator.next() {
            pipeline.reprime(&entry.query);
            match self.run_entry(
                source,
                &entry,
                &aggregator,
                pipeline.as_mut(),
                &transforms,
                on_match,
            ) {
                Ok(Drained::Done(count)) => matched += count,
                Ok(Drained::Yielded(resume_sequence)) => {
                    self.count("yielded", 1);
                    self.flush_metrics();
                    return Ok(ScanOutcome::Yielded { resume_sequence });
                }
                Ok(Drained::Cancelled) => {
                    info!("scan session cancelled");
                    self.flush_metrics();
                    return Ok(ScanOutcome::Cancelled);
                }
                Err(e) if e.is_cancellation() => {
                    info!("scan session cancelled");
                    self.flush_metrics();
                    return Ok(ScanOutcome::Cancelled);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("scan complete: {matched} matches");
        self.flush_metrics();
        Ok(ScanOutcome::Complete { matched })
    }

    fn run_entry(
        &self,
        source: &mut dyn SortedSource,
        entry: &BatchEntry,
        aggregator: &FieldIndexAggregator,
        pipeline: &mut dyn Pipeline,
        transforms: &[Box<dyn DocumentTransform>],
        on_match: &mut dyn FnMut(Document),
    ) -> Result<Drained> {
        source.seek(&entry.range)?;
        self.count("seek", 1);

        let mut matched = 0u64;
        // Keys sort by (row, field, value, datatype, uid), so one record's
        // hits interleave with other records' inside a row. A record is
        // only complete at its row boundary: buffer per row, keyed by uid,
        // and flush whole records in uid order when the row ends.
        let mut current_row: Option<String> = None;
        let mut records: BTreeMap<String, Vec<ScanKey>> = BTreeMap::new();

        loop {
            if self.is_cancelled() {
                return Ok(Drained::Cancelled);
            }
            let key = source.next()?;
            self.count("next", 1);

            let row_done = match &key {
                Some(key) => current_row.as_deref().is_some_and(|row| row != key.row),
                None => current_row.is_some(),
            };
            if row_done {
                current_row = None;
                for (uid, hits) in std::mem::take(&mut records) {
                    let doc = aggregator.aggregate(&uid, &hits)?;
                    match self.push_candidate(doc, pipeline, transforms, on_match, &mut matched)? {
                        Drained::Done(_) => {}
                        other => return Ok(other),
                    }
                    match self.drain(pipeline, false, transforms, on_match, &mut matched)? {
                        Drained::Done(_) => {}
                        other => return Ok(other),
                    }
                }
            }

            match key {
                Some(key) => {
                    current_row.get_or_insert_with(|| key.row.clone());
                    records.entry(key.uid.clone()).or_default().push(key);
                }
                None => break,
            }
        }

        pipeline.finish();
        match self.drain(pipeline, true, transforms, on_match, &mut matched)? {
            Drained::Done(_) => Ok(Drained::Done(matched)),
            other => Ok(other),
        }
    }

    fn push_candidate(
        &self,
        doc: Document,
        pipeline: &mut dyn Pipeline,
        transforms: &[Box<dyn DocumentTransform>],
        on_match: &mut dyn FnMut(Document),
        matched: &mut u64,
    ) -> Result<Drained> {
        if self.options.disable_evaluation {
            self.deliver(doc, transforms, on_match, matched);
            return Ok(Drained::Done(*matched));
        }
        let mut doc = doc;
        loop {
            match pipeline.submit(doc)? {
                SubmitStatus::Accepted => return Ok(Drained::Done(*matched)),
                SubmitStatus::Saturated(returned) => {
                    // Make room by pulling delivered matches, then retry.
                    doc = returned;
                    match self.drain(pipeline, false, transforms, on_match, matched)? {
                        Drained::Done(_) => {}
                        other => return Ok(other),
                    }
                    if self.is_cancelled() {
                        return Ok(Drained::Cancelled);
                    }
                }
            }
        }
    }

    /// Pull whatever the pipeline has ready. `to_exhaustion` keeps pulling
    /// through Idle until the pipeline reports Exhausted.
    fn drain(
        &self,
        pipeline: &mut dyn Pipeline,
        to_exhaustion: bool,
        transforms: &[Box<dyn DocumentTransform>],
        on_match: &mut dyn FnMut(Document),
        matched: &mut u64,
    ) -> Result<Drained> {
        loop {
            match pipeline.next_match()? {
                PipelineStatus::Delivered { doc, .. } => {
                    self.deliver(doc, transforms, on_match, matched);
                }
                PipelineStatus::Idle => {
                    if !to_exhaustion {
                        return Ok(Drained::Done(*matched));
                    }
                    if self.is_cancelled() {
                        return Ok(Drained::Cancelled);
                    }
                }
                PipelineStatus::Yielded { resume_sequence } => {
                    return Ok(Drained::Yielded(resume_sequence));
                }
                PipelineStatus::Exhausted => return Ok(Drained::Done(*matched)),
            }
        }
    }

    fn deliver(
        &self,
        doc: Document,
        transforms: &[Box<dyn DocumentTransform>],
        on_match: &mut dyn FnMut(Document),
        matched: &mut u64,
    ) {
        let mut doc = Some(doc);
        for transform in transforms {
            doc = doc.and_then(|d| transform.apply(d));
            if doc.is_none() {
                return;
            }
        }
        let Some(mut doc) = doc else { return };
        if self.options.disable_index_only_documents && self.is_index_only(&doc) {
            self.count("index-only-dropped", 1);
            return;
        }
        self.project(&mut doc);
        *matched += 1;
        self.count("matched", 1);
        on_match(doc);
    }

    /// Whether every field was sourced from the index rather than the
    /// record's own data.
    fn is_index_only(&self, doc: &Document) -> bool {
        doc.fields.keys().all(|field| {
            self.non_record_fields.contains(field)
                || field.as_str() == RECORD_ID_FIELD
                || *field == self.options.datatype_field
        })
    }

    /// Restrict the outgoing document to the configured projection, or
    /// strip the configured exclusions.
    fn project(&self, doc: &mut Document) {
        if !self.options.project_results {
            return;
        }
        if !self.options.projection_fields.is_empty() {
            doc.fields
                .retain(|field, _| self.options.projection_fields.contains(field));
        } else {
            doc.fields
                .retain(|field, _| !self.options.exclude_fields.contains(field));
        }
    }

    fn build_pipeline(&self) -> Box<dyn Pipeline> {
        let query = self.options.query.clone().unwrap_or_default();
        if self.options.serial_evaluation_pipeline || self.options.max_evaluation_pipelines <= 1 {
            Box::new(SerialPipeline::new(
                Arc::clone(&self.evaluator),
                query,
                self.options.yield_threshold,
                self.options.hit_list,
            ))
        } else {
            let mut pipeline = ParallelPipeline::new(
                Arc::clone(&self.evaluator),
                query,
                self.options.max_evaluation_pipelines,
                self.options.max_pipeline_cached_results,
                self.options.yield_threshold,
                self.options.hit_list,
            );
            if let Some(poller) = &self.poller {
                pipeline = pipeline.with_cancellation(Arc::clone(poller));
            }
            Box::new(pipeline)
        }
    }

    fn is_cancelled(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| p.check())
    }

    fn count(&self, name: &str, value: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.count(name, value);
        }
    }

    fn flush_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.flush();
        }
    }
}
