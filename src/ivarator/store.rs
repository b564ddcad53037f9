//! Spill-store seam for the ivarator's sorted runs.
//!
//! A run is an append-only sequence of `(sort key, uid)` entries in a
//! length-prefixed binary format: `[u32 len][key bytes][u32 len][uid
//! bytes]`, big-endian. [`FileSpillStore`] is the production store;
//! [`MemorySpillStore`] backs tests and additionally tracks how many run
//! handles, readers and writers alike, are open at once so the open-file
//! budget can be verified.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{QuarryError, Result};
use crate::util::HandleCache;

const RUN_EXTENSION: &str = "run";

/// Writes one run. Entries must be appended in the intended read order.
pub trait RunWriter: Send {
    fn append(&mut self, key: &str, uid: &str) -> Result<()>;
    /// Flush and seal the run. Must be called; dropping without finishing
    /// may lose buffered entries.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Streams one run back in append order.
pub trait RunReader: Send {
    fn next(&mut self) -> Result<Option<(String, String)>>;
}

/// Where spill runs live. Implementations own naming-collision and
/// durability concerns; the ivarator only sees named runs. The open-file
/// budget counts every live run handle, writers included.
pub trait SpillStore: Send + Sync {
    fn create_run(&self, name: &str) -> Result<Box<dyn RunWriter>>;
    fn open_run(&self, name: &str) -> Result<Box<dyn RunReader>>;
    fn delete_run(&self, name: &str) -> Result<()>;
    fn list_runs(&self) -> Result<Vec<String>>;
    /// Whether the store's backing location is currently usable.
    fn is_reachable(&self) -> bool;
}

fn write_entry<W: Write>(out: &mut W, key: &str, uid: &str) -> Result<()> {
    out.write_u32::<BigEndian>(key.len() as u32)?;
    out.write_all(key.as_bytes())?;
    out.write_u32::<BigEndian>(uid.len() as u32)?;
    out.write_all(uid.as_bytes())?;
    Ok(())
}

fn read_entry<R: Read>(input: &mut R) -> Result<Option<(String, String)>> {
    // EOF at an entry boundary ends the run; EOF anywhere else is
    // corruption.
    let key_len = match input.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut key = vec![0u8; key_len as usize];
    input.read_exact(&mut key)?;
    let uid_len = input.read_u32::<BigEndian>()?;
    let mut uid = vec![0u8; uid_len as usize];
    input.read_exact(&mut uid)?;
    let key = String::from_utf8(key)
        .map_err(|_| QuarryError::storage("run entry key is not valid UTF-8"))?;
    let uid = String::from_utf8(uid)
        .map_err(|_| QuarryError::storage("run entry uid is not valid UTF-8"))?;
    Ok(Some((key, uid)))
}

// ── File-backed store ───────────────────────────────────────────────────

/// Spill store writing runs as files under a base directory.
#[derive(Debug)]
pub struct FileSpillStore {
    base: PathBuf,
}

impl FileSpillStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<FileSpillStore> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(FileSpillStore { base })
    }

    /// Pick the first usable base location, in declared order.
    ///
    /// Every alternative is probed by creating the directory and writing a
    /// throwaway file; unreachable locations are skipped with a warning.
    pub fn first_reachable(base_locations: &[String]) -> Result<FileSpillStore> {
        for location in base_locations {
            match FileSpillStore::new(location) {
                Ok(store) if store.is_reachable() => {
                    debug!("using spill cache location {location}");
                    return Ok(store);
                }
                Ok(_) => warn!("spill cache location {location} is not writable, skipping"),
                Err(e) => warn!("spill cache location {location} unusable, skipping: {e}"),
            }
        }
        Err(QuarryError::storage(format!(
            "no reachable spill cache location among {} alternatives",
            base_locations.len()
        )))
    }

    /// Like [`FileSpillStore::first_reachable`], consulting a cache of
    /// previously resolved locations so repeated sessions skip the probe.
    pub fn first_reachable_cached(
        base_locations: &[String],
        cache: &mut HandleCache<String, PathBuf>,
    ) -> Result<FileSpillStore> {
        for location in base_locations {
            if let Some(base) = cache.get(location) {
                return Ok(FileSpillStore { base: base.clone() });
            }
        }
        let store = FileSpillStore::first_reachable(base_locations)?;
        cache.insert(
            store.base.to_string_lossy().into_owned(),
            store.base.clone(),
        );
        Ok(store)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn run_path(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}.{RUN_EXTENSION}"))
    }
}

impl SpillStore for FileSpillStore {
    fn create_run(&self, name: &str) -> Result<Box<dyn RunWriter>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.run_path(name))?;
        Ok(Box::new(FileRunWriter {
            out: BufWriter::new(file),
        }))
    }

    fn open_run(&self, name: &str) -> Result<Box<dyn RunReader>> {
        let file = File::open(self.run_path(name))?;
        Ok(Box::new(FileRunReader {
            input: BufReader::new(file),
        }))
    }

    fn delete_run(&self, name: &str) -> Result<()> {
        fs::remove_file(self.run_path(name))?;
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RUN_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    fn is_reachable(&self) -> bool {
        let probe = self.base.join(".probe");
        match File::create(&probe) {
            Ok(_) => {
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }
}

struct FileRunWriter {
    out: BufWriter<File>,
}

impl RunWriter for FileRunWriter {
    fn append(&mut self, key: &str, uid: &str) -> Result<()> {
        write_entry(&mut self.out, key, uid)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

struct FileRunReader {
    input: BufReader<File>,
}

impl RunReader for FileRunReader {
    fn next(&mut self) -> Result<Option<(String, String)>> {
        read_entry(&mut self.input)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────

/// In-memory spill store for tests.
///
/// Tracks the peak number of concurrently open run handles, counting
/// writers as well as readers, so tests can assert the merge respects its
/// open-file budget.
#[derive(Debug, Default)]
pub struct MemorySpillStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    runs: Mutex<AHashMap<String, Arc<Vec<(String, String)>>>>,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
}

impl MemoryInner {
    fn handle_opened(&self) {
        let open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_handles.fetch_max(open, Ordering::SeqCst);
    }

    fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySpillStore {
    pub fn new() -> MemorySpillStore {
        MemorySpillStore::default()
    }

    /// Peak number of run handles open at the same time.
    pub fn max_open_handles(&self) -> usize {
        self.inner.max_open_handles.load(Ordering::SeqCst)
    }

    /// Forget the peak so a test can scope its assertion to one phase.
    pub fn reset_peak_handles(&self) {
        self.inner
            .max_open_handles
            .store(self.inner.open_handles.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Number of runs currently stored.
    pub fn run_count(&self) -> usize {
        self.inner.runs.lock().len()
    }
}

impl SpillStore for MemorySpillStore {
    fn create_run(&self, name: &str) -> Result<Box<dyn RunWriter>> {
        let mut runs = self.inner.runs.lock();
        if runs.contains_key(name) {
            return Err(QuarryError::storage(format!("run '{name}' already exists")));
        }
        runs.insert(name.to_string(), Arc::new(Vec::new()));
        drop(runs);
        self.inner.handle_opened();
        Ok(Box::new(MemoryRunWriter {
            name: name.to_string(),
            entries: Vec::new(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_run(&self, name: &str) -> Result<Box<dyn RunReader>> {
        let runs = self.inner.runs.lock();
        let data = runs
            .get(name)
            .cloned()
            .ok_or_else(|| QuarryError::storage(format!("no such run '{name}'")))?;
        drop(runs);
        self.inner.handle_opened();
        Ok(Box::new(MemoryRunReader {
            data,
            pos: 0,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn delete_run(&self, name: &str) -> Result<()> {
        self.inner.runs.lock().remove(name);
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner.runs.lock().keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    fn is_reachable(&self) -> bool {
        true
    }
}

struct MemoryRunWriter {
    name: String,
    entries: Vec<(String, String)>,
    inner: Arc<MemoryInner>,
}

impl RunWriter for MemoryRunWriter {
    fn append(&mut self, key: &str, uid: &str) -> Result<()> {
        self.entries.push((key.to_string(), uid.to_string()));
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let name = std::mem::take(&mut self.name);
        let entries = std::mem::take(&mut self.entries);
        self.inner.runs.lock().insert(name, Arc::new(entries));
        Ok(())
    }
}

impl Drop for MemoryRunWriter {
    fn drop(&mut self) {
        self.inner.handle_closed();
    }
}

struct MemoryRunReader {
    data: Arc<Vec<(String, String)>>,
    pos: usize,
    inner: Arc<MemoryInner>,
}

impl RunReader for MemoryRunReader {
    fn next(&mut self) -> Result<Option<(String, String)>> {
        match self.data.get(self.pos) {
            Some(entry) => {
                self.pos += 1;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }
}

impl Drop for MemoryRunReader {
    fn drop(&mut self) {
        self.inner.handle_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_run(store: &dyn SpillStore, name: &str, entries: &[(&str, &str)]) {
        let mut writer = store.create_run(name).unwrap();
        for (key, uid) in entries {
            writer.append(key, uid).unwrap();
        }
        writer.finish().unwrap();
    }

    fn drain(reader: &mut dyn RunReader) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Some(entry) = reader.next().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_file_run_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileSpillStore::new(dir.path()).unwrap();
        write_run(&store, "r0", &[("a", "u1"), ("b", "u2"), ("", "u3")]);

        let mut reader = store.open_run("r0").unwrap();
        assert_eq!(
            drain(reader.as_mut()),
            vec![
                ("a".to_string(), "u1".to_string()),
                ("b".to_string(), "u2".to_string()),
                ("".to_string(), "u3".to_string()),
            ]
        );

        assert_eq!(store.list_runs().unwrap(), vec!["r0"]);
        store.delete_run("r0").unwrap();
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_file_truncated_run_is_storage_or_io_error() {
        let dir = TempDir::new().unwrap();
        let store = FileSpillStore::new(dir.path()).unwrap();
        write_run(&store, "r0", &[("abcdef", "u1")]);

        // Chop the file mid-entry.
        let path = dir.path().join("r0.run");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = store.open_run("r0").unwrap();
        assert!(reader.next().is_err());
    }

    #[test]
    fn test_first_reachable_skips_bad_locations() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("cache").to_string_lossy().into_owned();
        let locations = vec!["/proc/definitely-not-writable/x".to_string(), good.clone()];
        let store = FileSpillStore::first_reachable(&locations).unwrap();
        assert_eq!(store.base(), Path::new(&good));
    }

    #[test]
    fn test_first_reachable_cached_skips_probe() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("cache").to_string_lossy().into_owned();
        let mut cache = HandleCache::new(4);

        let store = FileSpillStore::first_reachable_cached(
            std::slice::from_ref(&location),
            &mut cache,
        )
        .unwrap();
        assert_eq!(cache.len(), 1);

        // Second resolution hits the cache.
        let again =
            FileSpillStore::first_reachable_cached(std::slice::from_ref(&location), &mut cache)
                .unwrap();
        assert_eq!(again.base(), store.base());
    }

    #[test]
    fn test_first_reachable_all_bad() {
        let locations = vec!["/proc/nope/a".to_string()];
        assert!(FileSpillStore::first_reachable(&locations).is_err());
    }

    #[test]
    fn test_memory_store_tracks_open_handles() {
        let store = MemorySpillStore::new();
        write_run(&store, "r0", &[("a", "u1")]);
        write_run(&store, "r1", &[("b", "u2")]);
        store.reset_peak_handles();

        {
            let _r0 = store.open_run("r0").unwrap();
            let _r1 = store.open_run("r1").unwrap();
            // A writer open alongside two readers counts as a handle too.
            let _w = store.create_run("r2").unwrap();
            assert_eq!(store.max_open_handles(), 3);
        }
        let _r0 = store.open_run("r0").unwrap();
        // Peak stays at 3 even though only one handle is open now.
        assert_eq!(store.max_open_handles(), 3);
    }

    #[test]
    fn test_duplicate_run_name_rejected() {
        let store = MemorySpillStore::new();
        write_run(&store, "r0", &[]);
        assert!(store.create_run("r0").is_err());
    }
}
