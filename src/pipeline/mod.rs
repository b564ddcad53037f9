//! Predicate evaluation pipelines.
//!
//! Candidates arrive in scan order and matches must leave in scan order,
//! whatever order the evaluations finish in. [`SerialPipeline`] evaluates
//! on the calling thread; [`ParallelPipeline`] fans candidates out to a
//! fixed pool of workers through a bounded intake channel and reassembles
//! results through a bounded reorder buffer keyed by scan sequence number.
//! Workers only admit a result once its sequence falls inside the window
//! `next_deliver..next_deliver + capacity`, so memory stays capped however
//! uneven the evaluation latencies are. When the intake stays full past a
//! bounded wait, [`Pipeline::submit`] hands the candidate back as
//! [`SubmitStatus::Saturated`] so the caller can drain and retry instead
//! of blocking.
//!
//! Every blocking wait is bounded and re-polls the cancellation signal;
//! nothing in here can suspend indefinitely.
//!
//! The yield clock restarts on every delivered match. Once the elapsed
//! time since the last match (or since the pipeline was primed) exceeds
//! the yield threshold and no result is still in flight,
//! [`Pipeline::next_match`] reports [`PipelineStatus::Yielded`] with the
//! sequence to resume from; no candidate is skipped or evaluated twice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationPoller;
use crate::data::Document;
use crate::error::{QuarryError, Result};

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Outcome of evaluating one candidate.
#[derive(Debug, Clone, Default)]
pub struct EvalOutcome {
    pub matched: bool,
    /// Sub-terms that matched, populated in hit-list mode.
    pub hit_terms: Vec<String>,
}

/// Invocation contract of the external boolean predicate engine.
pub trait Evaluator: Send + Sync {
    /// Whether the document satisfies the query.
    fn evaluate(&self, query: &str, doc: &Document) -> Result<bool>;

    /// Like [`Evaluator::evaluate`], additionally reporting which
    /// sub-terms matched. The default wraps `evaluate` with no hit terms.
    fn evaluate_with_hits(&self, query: &str, doc: &Document) -> Result<EvalOutcome> {
        Ok(EvalOutcome {
            matched: self.evaluate(query, doc)?,
            hit_terms: Vec::new(),
        })
    }
}

/// What [`Pipeline::next_match`] found.
#[derive(Debug)]
pub enum PipelineStatus {
    /// The next match in scan order.
    Delivered {
        sequence: u64,
        doc: Document,
        hit_terms: Vec<String>,
    },
    /// Nothing ready; submit more candidates or call `finish`.
    Idle,
    /// The yield threshold elapsed without a match. Resume by re-seeking
    /// the scan to `resume_sequence` candidates past where it started.
    Yielded { resume_sequence: u64 },
    /// All submitted candidates evaluated and delivered.
    Exhausted,
}

/// What [`Pipeline::submit`] did with the candidate.
#[derive(Debug)]
pub enum SubmitStatus {
    /// The candidate was queued for evaluation.
    Accepted,
    /// The pipeline is full; the candidate comes back untouched. Drain
    /// some matches and resubmit.
    Saturated(Document),
}

/// Scan-order evaluation over a stream of candidates.
pub trait Pipeline: Send {
    /// Hand the next candidate over, in scan order. Waits a bounded time
    /// for backpressure, then returns [`SubmitStatus::Saturated`].
    fn submit(&mut self, doc: Document) -> Result<SubmitStatus>;

    /// Signal that no more candidates are coming for this batch entry.
    fn finish(&mut self);

    /// The next match in scan order, or the pipeline's current state.
    fn next_match(&mut self) -> Result<PipelineStatus>;

    /// Swap in the next batch entry's query without tearing the pipeline
    /// down. Any undelivered results are discarded.
    fn reprime(&mut self, query: &str);
}

// ── Serial pipeline ─────────────────────────────────────────────────────

/// Evaluates every candidate on the calling thread, immediately.
pub struct SerialPipeline {
    evaluator: Arc<dyn Evaluator>,
    query: String,
    hit_list: bool,
    yield_threshold: Duration,
    last_match: Instant,
    submitted: u64,
    ready: std::collections::VecDeque<(u64, Document, Vec<String>)>,
    finished: bool,
}

impl SerialPipeline {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        query: impl Into<String>,
        yield_threshold: Duration,
        hit_list: bool,
    ) -> SerialPipeline {
        SerialPipeline {
            evaluator,
            query: query.into(),
            hit_list,
            yield_threshold,
            last_match: Instant::now(),
            submitted: 0,
            ready: std::collections::VecDeque::new(),
            finished: false,
        }
    }
}

impl Pipeline for SerialPipeline {
    fn submit(&mut self, doc: Document) -> Result<SubmitStatus> {
        let sequence = self.submitted;
        self.submitted += 1;
        let outcome = if self.hit_list {
            self.evaluator.evaluate_with_hits(&self.query, &doc)?
        } else {
            EvalOutcome {
                matched: self.evaluator.evaluate(&self.query, &doc)?,
                hit_terms: Vec::new(),
            }
        };
        if outcome.matched {
            self.ready.push_back((sequence, doc, outcome.hit_terms));
        }
        Ok(SubmitStatus::Accepted)
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn next_match(&mut self) -> Result<PipelineStatus> {
        if let Some((sequence, doc, hit_terms)) = self.ready.pop_front() {
            self.last_match = Instant::now();
            return Ok(PipelineStatus::Delivered {
                sequence,
                doc,
                hit_terms,
            });
        }
        if self.last_match.elapsed() >= self.yield_threshold {
            return Ok(PipelineStatus::Yielded {
                resume_sequence: self.submitted,
            });
        }
        if self.finished {
            Ok(PipelineStatus::Exhausted)
        } else {
            Ok(PipelineStatus::Idle)
        }
    }

    fn reprime(&mut self, query: &str) {
        self.query = query.to_string();
        self.ready.clear();
        self.finished = false;
        self.last_match = Instant::now();
    }
}

// ── Parallel pipeline ───────────────────────────────────────────────────

struct WorkItem {
    sequence: u64,
    doc: Document,
    query: Arc<String>,
}

struct ReorderState {
    /// Next sequence to hand to the consumer.
    next_deliver: u64,
    /// Sequences submitted so far; `submitted - next_deliver` is in flight.
    submitted: u64,
    results: BTreeMap<u64, Result<(EvalOutcome, Document)>>,
    stopped: bool,
}

struct Shared {
    state: Mutex<ReorderState>,
    cond: Condvar,
    capacity: usize,
}

/// Bounded worker-pool pipeline with in-order delivery.
///
/// Workers are spawned once and live for the whole session; batch entries
/// re-prime the query without respawning them.
pub struct ParallelPipeline {
    shared: Arc<Shared>,
    intake: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    query: Arc<String>,
    yield_threshold: Duration,
    last_match: Instant,
    poller: Option<Arc<CancellationPoller>>,
    finished: bool,
}

impl ParallelPipeline {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        query: impl Into<String>,
        workers: usize,
        max_cached_results: usize,
        yield_threshold: Duration,
        hit_list: bool,
    ) -> ParallelPipeline {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(ReorderState {
                next_deliver: 0,
                submitted: 0,
                results: BTreeMap::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
            capacity: max_cached_results.max(1),
        });
        // Intake bound matches the worker count so at most one evaluation
        // per worker queues ahead of the reorder buffer.
        let (tx, rx) = bounded::<WorkItem>(workers);

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                let evaluator = Arc::clone(&evaluator);
                thread::Builder::new()
                    .name(format!("eval-pipeline-{i}"))
                    .spawn(move || worker_loop(rx, shared, evaluator, hit_list))
            })
            .collect::<std::io::Result<Vec<_>>>();

        let handles = match handles {
            Ok(handles) => handles,
            Err(e) => {
                // Thread spawn failing here means the process is in deep
                // trouble; run degraded with whatever spawned.
                warn!("failed to spawn evaluation workers: {e}");
                Vec::new()
            }
        };
        debug!("spawned {} evaluation workers", handles.len());

        ParallelPipeline {
            shared,
            intake: Some(tx),
            workers: handles,
            query: Arc::new(query.into()),
            yield_threshold,
            last_match: Instant::now(),
            poller: None,
            finished: false,
        }
    }

    pub fn with_cancellation(mut self, poller: Arc<CancellationPoller>) -> ParallelPipeline {
        self.poller = Some(poller);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if let Some(poller) = &self.poller {
            if poller.check() {
                return Err(QuarryError::Cancelled);
            }
        }
        Ok(())
    }
}

fn worker_loop(
    rx: Receiver<WorkItem>,
    shared: Arc<Shared>,
    evaluator: Arc<dyn Evaluator>,
    hit_list: bool,
) {
    loop {
        let item = match rx.recv_timeout(WAIT_SLICE) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => {
                if shared.state.lock().stopped {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let result = if hit_list {
            evaluator.evaluate_with_hits(&item.query, &item.doc)
        } else {
            evaluator
                .evaluate(&item.query, &item.doc)
                .map(|matched| EvalOutcome {
                    matched,
                    hit_terms: Vec::new(),
                })
        };
        let result = result.map(|outcome| (outcome, item.doc));

        let mut state = shared.state.lock();
        // Backpressure: admit the result only once its sequence falls in
        // the delivery window, capping the reorder buffer at `capacity`.
        while !state.stopped && item.sequence >= state.next_deliver + shared.capacity as u64 {
            shared.cond.wait_for(&mut state, WAIT_SLICE);
        }
        if state.stopped || item.sequence < state.next_deliver {
            // Discarded by a reprime; nothing waits for this result.
            continue;
        }
        state.results.insert(item.sequence, result);
        shared.cond.notify_all();
    }
}

impl Pipeline for ParallelPipeline {
    fn submit(&mut self, doc: Document) -> Result<SubmitStatus> {
        let sequence = {
            let mut state = self.shared.state.lock();
            let sequence = state.submitted;
            state.submitted += 1;
            sequence
        };
        let mut item = WorkItem {
            sequence,
            doc,
            query: Arc::clone(&self.query),
        };
        let Some(intake) = &self.intake else {
            return Err(QuarryError::evaluator("pipeline is shut down"));
        };
        let deadline = Instant::now() + 2 * WAIT_SLICE;
        loop {
            match intake.send_timeout(item, WAIT_SLICE) {
                Ok(()) => return Ok(SubmitStatus::Accepted),
                Err(SendTimeoutError::Timeout(returned)) => {
                    self.check_cancelled()?;
                    if Instant::now() >= deadline {
                        // Unreserve the sequence; the candidate was never
                        // sent, so a resubmit picks the same slot back up.
                        self.shared.state.lock().submitted -= 1;
                        return Ok(SubmitStatus::Saturated(returned.doc));
                    }
                    item = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(QuarryError::evaluator("evaluation workers are gone"));
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn next_match(&mut self) -> Result<PipelineStatus> {
        // Bounded: waits at most two slices before reporting Idle so the
        // caller can keep feeding candidates (and re-polling cancellation).
        let deadline = Instant::now() + 2 * WAIT_SLICE;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(poller) = &self.poller {
                if poller.check() {
                    return Err(QuarryError::Cancelled);
                }
            }

            loop {
                let sequence = state.next_deliver;
                let Some(result) = state.results.remove(&sequence) else {
                    break;
                };
                state.next_deliver += 1;
                self.shared.cond.notify_all();
                match result {
                    Err(e) => return Err(e),
                    Ok((outcome, doc)) if outcome.matched => {
                        self.last_match = Instant::now();
                        trace!("delivering match at sequence {sequence}");
                        return Ok(PipelineStatus::Delivered {
                            sequence,
                            doc,
                            hit_terms: outcome.hit_terms,
                        });
                    }
                    Ok(_) => {}
                }
            }

            let in_flight = state.submitted > state.next_deliver;
            if !in_flight {
                // Yield only once everything submitted has been delivered,
                // so the resume sequence skips and re-evaluates nothing.
                if self.last_match.elapsed() >= self.yield_threshold {
                    return Ok(PipelineStatus::Yielded {
                        resume_sequence: state.next_deliver,
                    });
                }
                return Ok(if self.finished {
                    PipelineStatus::Exhausted
                } else {
                    PipelineStatus::Idle
                });
            }
            if Instant::now() >= deadline {
                return Ok(PipelineStatus::Idle);
            }
            // Results are in flight; wait a slice and re-check.
            self.shared.cond.wait_for(&mut state, WAIT_SLICE);
        }
    }

    fn reprime(&mut self, query: &str) {
        self.query = Arc::new(query.to_string());
        let mut state = self.shared.state.lock();
        state.results.clear();
        state.next_deliver = state.submitted;
        drop(state);
        self.shared.cond.notify_all();
        self.finished = false;
        self.last_match = Instant::now();
    }
}

impl Drop for ParallelPipeline {
    fn drop(&mut self) {
        self.shared.state.lock().stopped = true;
        self.shared.cond.notify_all();
        self.intake = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
