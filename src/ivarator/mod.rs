//! The ivarator: a bounded-memory overflow cache for field index scans.
//!
//! A query term that matches a large slice of the index cannot hold its
//! hits in memory. The ivarator buffers `(sort key, uid)` entries up to a
//! configured size and spills them to sorted runs in a [`SpillStore`];
//! spilling is also forced after a configured number of scanned items or a
//! wall-clock timeout, so a slow scan still checkpoints its progress.
//! Consuming the ivarator merges the runs back into one ascending stream,
//! first compacting them so no more than the open-file budget is ever open
//! at once.
//!
//! Cancellation is polled before every persist and at every merge step; a
//! cancelled ivarator deletes its runs and surfaces
//! [`QuarryError::Cancelled`].

pub mod merge;
pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancellationPoller;
use crate::data::ScanRange;
use crate::error::{QuarryError, Result};
use crate::ivarator::merge::{KWayMerge, compact_runs};
use crate::ivarator::store::{RunReader, SpillStore};

/// Spill behavior knobs, taken from the validated scan options.
#[derive(Debug, Clone)]
pub struct IvaratorConfig {
    /// Entries buffered in memory before spilling.
    pub buffer_size: usize,
    /// Items scanned since the last persist that force one.
    pub persist_threshold: u64,
    /// Wall-clock time since the last persist that forces one.
    pub scan_timeout: Duration,
    /// Maximum runs open concurrently while merging.
    pub max_open_files: usize,
    /// When false (single indexed term), entries are returned run by run
    /// without a global merge.
    pub sorted: bool,
}

impl Default for IvaratorConfig {
    fn default() -> Self {
        IvaratorConfig {
            buffer_size: 10_000,
            persist_threshold: 100_000,
            scan_timeout: Duration::from_secs(60 * 60),
            max_open_files: 100,
            sorted: true,
        }
    }
}

/// Buffers and spills the hits of one query term.
pub struct Ivarator {
    config: IvaratorConfig,
    store: Arc<dyn SpillStore>,
    poller: Option<Arc<CancellationPoller>>,
    buffer: Vec<(String, String)>,
    runs: Vec<String>,
    scanned_since_persist: u64,
    last_persist: Instant,
}

impl Ivarator {
    pub fn new(config: IvaratorConfig, store: Arc<dyn SpillStore>) -> Ivarator {
        Ivarator {
            buffer: Vec::with_capacity(config.buffer_size.min(4096)),
            config,
            store,
            poller: None,
            runs: Vec::new(),
            scanned_since_persist: 0,
            last_persist: Instant::now(),
        }
    }

    pub fn with_cancellation(mut self, poller: Arc<CancellationPoller>) -> Ivarator {
        self.poller = Some(poller);
        self
    }

    /// Record one scanned item that produced no hit. Scan progress alone
    /// can force a persist, so a term matching almost nothing over a huge
    /// range still checkpoints.
    pub fn note_scan(&mut self) -> Result<()> {
        self.scanned_since_persist += 1;
        if self.should_persist() {
            self.persist()?;
        }
        Ok(())
    }

    /// Buffer one hit, spilling to a sorted run when a trigger fires.
    pub fn insert(&mut self, sort_key: impl Into<String>, uid: impl Into<String>) -> Result<()> {
        self.buffer.push((sort_key.into(), uid.into()));
        self.scanned_since_persist += 1;
        if self.should_persist() {
            self.persist()?;
        }
        Ok(())
    }

    fn should_persist(&self) -> bool {
        !self.buffer.is_empty()
            && (self.buffer.len() >= self.config.buffer_size
                || self.scanned_since_persist >= self.config.persist_threshold
                || self.last_persist.elapsed() >= self.config.scan_timeout)
    }

    fn persist(&mut self) -> Result<()> {
        self.check_cancelled()?;

        // Stable sort keeps equal (key, uid) entries in insertion order.
        self.buffer.sort();
        let name = format!("run-{}", Uuid::new_v4());
        debug!("persisting {} entries to {name}", self.buffer.len());

        let mut writer = self.store.create_run(&name)?;
        for (key, uid) in &self.buffer {
            writer.append(key, uid)?;
        }
        writer.finish()?;

        self.runs.push(name);
        self.buffer.clear();
        self.scanned_since_persist = 0;
        self.last_persist = Instant::now();
        Ok(())
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if let Some(poller) = &self.poller {
            if poller.check() {
                self.cleanup();
                return Err(QuarryError::Cancelled);
            }
        }
        Ok(())
    }

    /// Number of runs spilled so far.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Entries currently buffered in memory.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Delete all spilled runs, best effort.
    pub fn cleanup(&mut self) {
        for name in self.runs.drain(..) {
            if let Err(e) = self.store.delete_run(&name) {
                warn!("failed to delete spill run {name}: {e}");
            }
        }
    }

    /// Finish ingestion and return the result stream.
    ///
    /// The residual buffer is persisted as a final run; in sorted mode the
    /// runs are compacted to the open-file budget and k-way merged, in
    /// unsorted mode they are chained in creation order.
    pub fn into_stream(mut self) -> Result<IvaratorStream> {
        if !self.buffer.is_empty() {
            self.persist()?;
        }
        self.check_cancelled()?;

        let store = Arc::clone(&self.store);
        let poller = self.poller.clone();
        let mut runs = std::mem::take(&mut self.runs);
        let max_open = self.config.max_open_files;
        let sorted = self.config.sorted;
        drop(self);

        let result = if sorted {
            compact_and_merge(store.as_ref(), &mut runs, max_open)
        } else {
            chain_runs(store.as_ref(), &runs)
        };
        match result {
            Ok(mode) => Ok(IvaratorStream {
                mode,
                runs,
                store,
                poller,
            }),
            Err(e) => {
                // The runs left the dropped ivarator; delete them here or
                // nothing will.
                for name in runs.drain(..) {
                    if let Err(del) = store.delete_run(&name) {
                        warn!("failed to delete spill run {name}: {del}");
                    }
                }
                Err(e)
            }
        }
    }
}

impl Drop for Ivarator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn compact_and_merge(
    store: &dyn SpillStore,
    runs: &mut Vec<String>,
    max_open: usize,
) -> Result<StreamMode> {
    compact_runs(store, runs, max_open)?;
    let mut readers = Vec::with_capacity(runs.len());
    for name in runs.iter() {
        readers.push(store.open_run(name)?);
    }
    Ok(StreamMode::Merged(KWayMerge::new(readers)?))
}

fn chain_runs(store: &dyn SpillStore, runs: &[String]) -> Result<StreamMode> {
    let mut readers = VecDeque::with_capacity(runs.len());
    for name in runs {
        readers.push_back(store.open_run(name)?);
    }
    Ok(StreamMode::Chained(readers))
}

enum StreamMode {
    Merged(KWayMerge),
    Chained(VecDeque<Box<dyn RunReader>>),
}

/// The ivarator's output: `(sort key, uid)` entries, ascending when the
/// term required sorting. Deletes its runs when dropped.
pub struct IvaratorStream {
    mode: StreamMode,
    runs: Vec<String>,
    store: Arc<dyn SpillStore>,
    poller: Option<Arc<CancellationPoller>>,
}

impl std::fmt::Debug for IvaratorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvaratorStream")
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

impl IvaratorStream {
    pub fn next(&mut self) -> Result<Option<(String, String)>> {
        if let Some(poller) = &self.poller {
            if poller.check() {
                self.delete_runs();
                return Err(QuarryError::Cancelled);
            }
        }
        match &mut self.mode {
            StreamMode::Merged(merge) => merge.next(),
            StreamMode::Chained(readers) => loop {
                let Some(reader) = readers.front_mut() else {
                    return Ok(None);
                };
                match reader.next()? {
                    Some(entry) => return Ok(Some(entry)),
                    None => {
                        readers.pop_front();
                    }
                }
            },
        }
    }

    fn delete_runs(&mut self) {
        // Close readers before deleting their runs.
        self.mode = StreamMode::Chained(VecDeque::new());
        for name in self.runs.drain(..) {
            if let Err(e) = self.store.delete_run(&name) {
                warn!("failed to delete spill run {name}: {e}");
            }
        }
    }
}

impl Drop for IvaratorStream {
    fn drop(&mut self) {
        self.delete_runs();
    }
}

// ── Source budget ───────────────────────────────────────────────────────

/// Shared cap on concurrent scan sources across all terms of a query.
#[derive(Debug)]
pub struct SourceBudget {
    available: AtomicUsize,
}

impl SourceBudget {
    pub fn new(max_sources: usize) -> Arc<SourceBudget> {
        Arc::new(SourceBudget {
            available: AtomicUsize::new(max_sources),
        })
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    /// Reserve `count` sources, all or nothing.
    pub fn try_reserve(self: &Arc<Self>, count: usize) -> Option<SourceReservation> {
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |available| {
                available.checked_sub(count)
            })
            .ok()
            .map(|_| SourceReservation {
                budget: Arc::clone(self),
                count,
            })
    }
}

/// Held sources; returned to the budget on drop.
#[derive(Debug)]
pub struct SourceReservation {
    budget: Arc<SourceBudget>,
    count: usize,
}

impl SourceReservation {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SourceReservation {
    fn drop(&mut self) {
        self.budget.available.fetch_add(self.count, Ordering::SeqCst);
    }
}

/// Split a row range for parallel field index scanning, reserving one
/// source per sub-range from the shared budget.
///
/// When the budget cannot cover the requested split the range is split
/// more coarsely; a fully exhausted budget is a storage error rather than
/// an unbounded wait.
pub fn split_sources(
    range: &ScanRange,
    max_index_range_split: usize,
    budget: &Arc<SourceBudget>,
) -> Result<(Vec<ScanRange>, SourceReservation)> {
    let mut want = max_index_range_split.max(1).min(budget.available().max(1));
    loop {
        let parts = range.split(want);
        if let Some(reservation) = budget.try_reserve(parts.len()) {
            return Ok((parts, reservation));
        }
        if want <= 1 {
            return Err(QuarryError::storage("scan source budget exhausted"));
        }
        want /= 2;
    }
}
