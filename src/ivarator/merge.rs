//! K-way merge of sorted spill runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::ivarator::store::{RunReader, SpillStore};

/// One heap entry. Ties on (key, uid) are broken by run index so the merge
/// is stable with respect to run creation order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: String,
    uid: String,
    run: usize,
}

/// Streaming merge over N sorted run readers, yielding entries in strictly
/// ascending (key, uid) order.
pub struct KWayMerge {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    readers: Vec<Box<dyn RunReader>>,
}

impl KWayMerge {
    pub fn new(mut readers: Vec<Box<dyn RunReader>>) -> Result<KWayMerge> {
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some((key, uid)) = reader.next()? {
                heap.push(Reverse(HeapEntry { key, uid, run }));
            }
        }
        Ok(KWayMerge { heap, readers })
    }

    pub fn next(&mut self) -> Result<Option<(String, String)>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some((key, uid)) = self.readers[entry.run].next()? {
            self.heap.push(Reverse(HeapEntry {
                key,
                uid,
                run: entry.run,
            }));
        }
        Ok(Some((entry.key, entry.uid)))
    }
}

/// Merge runs down until at most `max_open` remain.
///
/// Each pass holds a batch of readers plus the replacement writer open,
/// so it merges `max_open - 1` runs at a time; the smallest workable
/// budget during compaction is 3 (two readers and one writer) and lower
/// budgets are raised to that. `runs` stays accurate throughout: on error
/// it still names every live run, replacements included, so the caller
/// can delete them.
pub fn compact_runs(store: &dyn SpillStore, runs: &mut Vec<String>, max_open: usize) -> Result<()> {
    let effective = if max_open < 3 {
        warn!("open-file budget {max_open} raised to 3 during compaction");
        3
    } else {
        max_open
    };
    let batch_size = effective - 1;
    while runs.len() > max_open {
        let batch: Vec<String> = runs[..batch_size.min(runs.len())].to_vec();
        let replacement = format!("compact-{}", Uuid::new_v4());
        debug!("compacting {} runs into {replacement}", batch.len());

        let mut readers = Vec::with_capacity(batch.len());
        for name in &batch {
            readers.push(store.open_run(name)?);
        }
        let mut merge = KWayMerge::new(readers)?;
        let mut writer = store.create_run(&replacement)?;
        // Track the replacement as soon as it exists so a failed write
        // still gets cleaned up.
        runs.push(replacement);
        while let Some((key, uid)) = merge.next()? {
            writer.append(&key, &uid)?;
        }
        writer.finish()?;
        drop(merge);

        for name in &batch {
            store.delete_run(name)?;
        }
        runs.drain(..batch.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivarator::store::MemorySpillStore;

    fn write_run(store: &dyn SpillStore, name: &str, entries: &[(&str, &str)]) {
        let mut writer = store.create_run(name).unwrap();
        for (key, uid) in entries {
            writer.append(key, uid).unwrap();
        }
        writer.finish().unwrap();
    }

    fn merge_all(store: &dyn SpillStore, runs: &[String]) -> Vec<(String, String)> {
        let readers = runs
            .iter()
            .map(|name| store.open_run(name).unwrap())
            .collect();
        let mut merge = KWayMerge::new(readers).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = merge.next().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_merge_ascending_across_runs() {
        let store = MemorySpillStore::new();
        write_run(&store, "r0", &[("a", "u1"), ("d", "u4")]);
        write_run(&store, "r1", &[("b", "u2"), ("e", "u5")]);
        write_run(&store, "r2", &[("c", "u3")]);

        let merged = merge_all(&store, &["r0".into(), "r1".into(), "r2".into()]);
        let keys: Vec<&str> = merged.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_merge_preserves_duplicates_stably() {
        let store = MemorySpillStore::new();
        write_run(&store, "r0", &[("k", "u1")]);
        write_run(&store, "r1", &[("k", "u1")]);

        let merged = merge_all(&store, &["r0".into(), "r1".into()]);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|(k, u)| k == "k" && u == "u1"));
    }

    #[test]
    fn test_compact_respects_open_budget() {
        let store = MemorySpillStore::new();
        for i in 0..7 {
            write_run(&store, &format!("r{i}"), &[(&format!("k{i}"), "u")]);
        }
        store.reset_peak_handles();
        let mut runs: Vec<String> = (0..7).map(|i| format!("r{i}")).collect();

        compact_runs(&store, &mut runs, 3).unwrap();
        assert!(runs.len() <= 3);
        // Readers and the replacement writer together stay in budget.
        assert!(store.max_open_handles() <= 3);

        // Every entry survives compaction, still in order.
        let merged = merge_all(&store, &runs);
        let keys: Vec<&str> = merged.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4", "k5", "k6"]);
    }

    #[test]
    fn test_compact_noop_when_under_budget() {
        let store = MemorySpillStore::new();
        write_run(&store, "r0", &[("a", "u")]);
        let mut runs = vec!["r0".to_string()];
        compact_runs(&store, &mut runs, 10).unwrap();
        assert_eq!(runs, vec!["r0".to_string()]);
    }
}
