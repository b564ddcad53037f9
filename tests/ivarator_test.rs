use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use quarry::cancel::{CancellationPoller, CancellationSignal, ManualCancellation};
use quarry::ivarator::IvaratorStream;
use quarry::{FileSpillStore, Ivarator, IvaratorConfig, MemorySpillStore, SpillStore};

fn drain(stream: &mut IvaratorStream) -> Vec<(String, String)> {
    let mut out = Vec::new();
    while let Some(entry) = stream.next().unwrap() {
        out.push(entry);
    }
    out
}

#[test]
fn test_file_backed_spill_and_merge() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SpillStore> = Arc::new(FileSpillStore::new(dir.path()).unwrap());
    let config = IvaratorConfig {
        buffer_size: 4,
        ..IvaratorConfig::default()
    };

    let mut ivarator = Ivarator::new(config, Arc::clone(&store));
    // Descending inserts so every run has to be re-sorted on the way out.
    for i in (0..25).rev() {
        ivarator.insert(format!("key-{i:03}"), format!("uid-{i:03}")).unwrap();
    }

    let mut stream = ivarator.into_stream().unwrap();
    let entries = drain(&mut stream);
    assert_eq!(entries.len(), 25);
    for (i, (key, uid)) in entries.iter().enumerate() {
        assert_eq!(key, &format!("key-{i:03}"));
        assert_eq!(uid, &format!("uid-{i:03}"));
    }

    // Stream drop removes the run files.
    drop(stream);
    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0);
}

#[test]
fn test_spill_example_three_runs_plus_residual() {
    // Buffer of 3 with 7 inserts: spills after the 3rd and 6th insert and
    // persists the last entry when the stream is built.
    let store = Arc::new(MemorySpillStore::new());
    let config = IvaratorConfig {
        buffer_size: 3,
        ..IvaratorConfig::default()
    };
    let mut ivarator = Ivarator::new(config, Arc::clone(&store) as Arc<dyn SpillStore>);
    for key in ["d", "a", "g", "b", "f", "c", "e"] {
        ivarator.insert(key, "u").unwrap();
    }
    assert_eq!(ivarator.run_count(), 2);
    assert_eq!(ivarator.buffered(), 1);

    let mut stream = ivarator.into_stream().unwrap();
    assert_eq!(store.run_count(), 3);
    let keys: Vec<String> = drain(&mut stream).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f", "g"]);
}

#[test]
fn test_merge_never_exceeds_open_file_budget() {
    let store = Arc::new(MemorySpillStore::new());
    let config = IvaratorConfig {
        buffer_size: 1,
        max_open_files: 4,
        ..IvaratorConfig::default()
    };
    let mut ivarator = Ivarator::new(config, Arc::clone(&store) as Arc<dyn SpillStore>);
    for i in 0..20 {
        ivarator.insert(format!("k{i:02}"), "u").unwrap();
    }
    assert_eq!(ivarator.run_count(), 20);

    store.reset_peak_handles();
    let mut stream = ivarator.into_stream().unwrap();
    let entries = drain(&mut stream);
    assert_eq!(entries.len(), 20);
    assert!(
        store.max_open_handles() <= 4,
        "peak open run handles {} exceeded budget",
        store.max_open_handles()
    );
}

#[test]
fn test_unsorted_opt_out_skips_global_merge() {
    let store = Arc::new(MemorySpillStore::new());
    let config = IvaratorConfig {
        buffer_size: 2,
        sorted: false,
        ..IvaratorConfig::default()
    };
    let mut ivarator = Ivarator::new(config, Arc::clone(&store) as Arc<dyn SpillStore>);
    for key in ["z", "y", "b", "a"] {
        ivarator.insert(key, "u").unwrap();
    }

    let mut stream = ivarator.into_stream().unwrap();
    let keys: Vec<String> = drain(&mut stream).into_iter().map(|(k, _)| k).collect();
    // Runs come back in creation order, each sorted internally; the
    // boundary between runs is not globally ordered.
    assert_eq!(keys, vec!["y", "z", "a", "b"]);
}

#[test]
fn test_cancellation_mid_merge_deletes_runs() {
    let store = Arc::new(MemorySpillStore::new());
    let signal = Arc::new(ManualCancellation::new());
    let poller = Arc::new(CancellationPoller::new(
        Arc::clone(&signal) as Arc<dyn CancellationSignal>,
        "scan-1",
        Duration::ZERO,
    ));

    let config = IvaratorConfig {
        buffer_size: 2,
        ..IvaratorConfig::default()
    };
    let mut ivarator = Ivarator::new(config, Arc::clone(&store) as Arc<dyn SpillStore>)
        .with_cancellation(poller);
    for key in ["a", "b", "c", "d", "e", "f"] {
        ivarator.insert(key, "u").unwrap();
    }

    let mut stream = ivarator.into_stream().unwrap();
    assert_eq!(stream.next().unwrap(), Some(("a".to_string(), "u".to_string())));

    signal.cancel();
    let err = stream.next().unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(store.run_count(), 0, "cancelled merge must delete its runs");
}
