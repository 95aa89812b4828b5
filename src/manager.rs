//! Versioned name→sketch registry: the MVCC set manager.
//!
//! Two radix indices (`primary`, `alternate`) hold the merged state; a
//! persistent, head-appended delta log carries not-yet-merged creates and
//! deletes. Readers walk `primary` then fall back to the delta log without
//! ever taking the write mutex — the log is a chain of immutable
//! `Arc<DeltaNode>` cells, so a reader that grabbed the head before a writer
//! prepended a new one still sees a perfectly valid, if slightly stale,
//! chain. A dedicated vacuum thread merges deltas into `alternate`, publishes
//! it as the new `primary`, waits out a version barrier, and only then
//! destroys retired wrappers.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use log::warn;
use parking_lot::Mutex;

use crate::config::GlobalConfig;
use crate::error::ManagerError;
use crate::hll;
use crate::radix::RadixTree;
use crate::sketch::Sketch;

const SET_DIR_PREFIX: &str = "hlld.";
const VACUUM_POLL_INTERVAL: Duration = Duration::from_millis(500);
const VACUUM_WARN_THRESHOLD: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaKind {
    Create,
    Delete,
    Barrier,
}

#[derive(Clone)]
struct DeltaEntry {
    version: u64,
    kind: DeltaKind,
    name: Vec<u8>,
    wrapper: Option<Arc<Sketch>>,
}

struct DeltaNode {
    entry: DeltaEntry,
    next: Option<Arc<DeltaNode>>,
}

/// Per-call overrides for `create`; absent fields fall back to the server's
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit precision override.
    pub precision: Option<u8>,
    /// Explicit target error override, resolved to a precision.
    pub eps: Option<f64>,
    /// Explicit storage-mode override.
    pub in_memory: Option<bool>,
}

impl CreateOptions {
    fn is_custom(&self) -> bool {
        self.precision.is_some() || self.eps.is_some() || self.in_memory.is_some()
    }
}

/// One row of a `list` reply.
#[derive(Debug, Clone)]
pub struct SetListing {
    /// Set name.
    pub name: Vec<u8>,
    /// Target error rate.
    pub eps: f64,
    /// Effective precision.
    pub precision: u8,
    /// Current or implied register byte size.
    pub byte_size: usize,
    /// Cached or live cardinality estimate.
    pub size_estimate: f64,
}

fn listing_of(name: &[u8], sketch: &Arc<Sketch>) -> SetListing {
    SetListing {
        name: name.to_vec(),
        eps: sketch.eps(),
        precision: sketch.precision(),
        byte_size: sketch.byte_size(),
        size_estimate: sketch.size(),
    }
}

fn validate_name(name: &[u8]) -> Result<(), ManagerError> {
    if name.is_empty() || name.len() > 200 {
        return Err(ManagerError::BadArguments);
    }
    if name.iter().any(|&b| matches!(b, b' ' | b'\t' | b'\n' | b'\r')) {
        return Err(ManagerError::BadArguments);
    }
    Ok(())
}

/// The MVCC set manager: name→sketch registry, delta log, vacuum.
pub struct SetManager {
    cfg: GlobalConfig,

    primary: ArcSwap<RadixTree<Sketch>>,
    alternate: Mutex<RadixTree<Sketch>>,

    vsn: AtomicU64,
    primary_vsn: AtomicU64,
    write_mutex: Mutex<()>,
    delta_head: ArcSwapOption<DeltaNode>,

    checkpoints: Mutex<HashMap<u64, u64>>,
    pending_deletes: Mutex<HashSet<Vec<u8>>>,

    should_run: AtomicBool,
}

impl std::fmt::Debug for SetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetManager")
            .field("data_dir", &self.cfg.data_dir)
            .field("vsn", &self.vsn.load(Ordering::Relaxed))
            .field("primary_vsn", &self.primary_vsn.load(Ordering::Relaxed))
            .finish()
    }
}

impl SetManager {
    /// Builds an empty manager. Call [`SetManager::list_restore`] to
    /// populate it from an existing data directory before serving traffic.
    pub fn new(cfg: GlobalConfig) -> Self {
        SetManager {
            cfg,
            primary: ArcSwap::from_pointee(RadixTree::new()),
            alternate: Mutex::new(RadixTree::new()),
            vsn: AtomicU64::new(0),
            primary_vsn: AtomicU64::new(0),
            write_mutex: Mutex::new(()),
            delta_head: ArcSwapOption::from(None),
            checkpoints: Mutex::new(HashMap::new()),
            pending_deletes: Mutex::new(HashSet::new()),
            should_run: AtomicBool::new(true),
        }
    }

    /// The server-wide configuration this manager was built with.
    pub fn config(&self) -> &GlobalConfig {
        &self.cfg
    }

    fn set_dir(&self, name: &[u8]) -> PathBuf {
        Path::new(&self.cfg.data_dir).join(format!("{SET_DIR_PREFIX}{}", String::from_utf8_lossy(name)))
    }

    // -- read path ---------------------------------------------------------

    /// Resolves `name` to its live wrapper, consulting the delta log for
    /// not-yet-merged creates/deletes when the primary index is stale. Never
    /// blocks on the write mutex.
    pub fn lookup(&self, name: &[u8]) -> Option<Arc<Sketch>> {
        if let Some(sketch) = self.primary.load().search(name) {
            return Some(sketch);
        }

        let primary_vsn = self.primary_vsn.load(Ordering::Acquire);
        let vsn = self.vsn.load(Ordering::Acquire);
        if primary_vsn == vsn {
            return None;
        }

        let mut cur = self.delta_head.load_full();
        while let Some(node) = cur {
            if node.entry.version <= primary_vsn {
                break;
            }
            if node.entry.kind != DeltaKind::Barrier && node.entry.name == name {
                return match node.entry.kind {
                    DeltaKind::Create => node.entry.wrapper.clone(),
                    DeltaKind::Delete => None,
                    DeltaKind::Barrier => unreachable!(),
                };
            }
            cur = node.next.clone();
        }
        None
    }

    fn append_delta(&self, kind: DeltaKind, name: Vec<u8>, wrapper: Option<Arc<Sketch>>) -> u64 {
        let version = self.vsn.fetch_add(1, Ordering::AcqRel) + 1;
        let next = self.delta_head.load_full();
        let node = DeltaNode {
            entry: DeltaEntry { version, kind, name, wrapper },
            next,
        };
        self.delta_head.store(Some(Arc::new(node)));
        version
    }

    // -- write path ---------------------------------------------------------

    /// Creates a new named set.
    pub fn create(&self, name: &[u8], opts: CreateOptions) -> Result<(), ManagerError> {
        validate_name(name)?;
        let _guard = self.write_mutex.lock();

        if self.lookup(name).is_some() {
            return Err(ManagerError::Exists);
        }
        if self.pending_deletes.lock().contains(name) {
            return Err(ManagerError::DeletePending);
        }

        let precision = match (opts.precision, opts.eps) {
            (Some(p), _) => {
                if !(hll::MIN_PRECISION..=hll::MAX_PRECISION).contains(&p) {
                    return Err(ManagerError::BadArguments);
                }
                p
            }
            (None, Some(eps)) => hll::precision_for_error(eps).ok_or(ManagerError::BadArguments)?,
            (None, None) => self.cfg.default_precision,
        };
        let eps = hll::error_for_precision(precision);
        let in_memory = opts.in_memory.unwrap_or(self.cfg.in_memory);
        let discover = opts.is_custom();

        let sketch = Sketch::open(
            self.set_dir(name),
            name.to_vec(),
            precision,
            eps,
            in_memory,
            self.cfg.use_mmap,
            discover,
        )
        .map_err(ManagerError::from)?;
        if discover {
            sketch.mark_hot();
        }

        self.append_delta(DeltaKind::Create, name.to_vec(), Some(Arc::new(sketch)));
        Ok(())
    }

    /// Marks a set inactive and pending-delete; its files are removed once
    /// the vacuum reclaims the DELETE delta.
    pub fn drop_set(&self, name: &[u8]) -> Result<(), ManagerError> {
        let _guard = self.write_mutex.lock();
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        sketch.mark_pending_delete();
        sketch.mark_inactive();
        self.append_delta(DeltaKind::Delete, name.to_vec(), Some(sketch));
        Ok(())
    }

    /// Marks a proxied set inactive without deleting its files, so a later
    /// `create` of the same name can discover and reload them.
    pub fn clear(&self, name: &[u8]) -> Result<(), ManagerError> {
        let _guard = self.write_mutex.lock();
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        if !sketch.is_proxied() {
            return Err(ManagerError::NotProxied);
        }
        sketch.mark_inactive();
        self.append_delta(DeltaKind::Delete, name.to_vec(), Some(sketch));
        Ok(())
    }

    // -- per-sketch operations ----------------------------------------------

    /// Flushes one set's dirty registers and config file to disk.
    pub fn flush(&self, name: &[u8]) -> Result<(), ManagerError> {
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        sketch.flush().map_err(ManagerError::from)
    }

    /// Faults out one set's registers (no-op for in-memory sets).
    pub fn unmap(&self, name: &[u8]) -> Result<(), ManagerError> {
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        sketch.unmap().map_err(ManagerError::from)
    }

    /// Adds every key to the named set, stopping at the first failure.
    pub fn add_keys(&self, name: &[u8], keys: &[&[u8]]) -> Result<(), ManagerError> {
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        for key in keys {
            sketch.add(key).map_err(ManagerError::from)?;
        }
        Ok(())
    }

    /// The set's current cardinality estimate (cached if proxied, live otherwise).
    pub fn size(&self, name: &[u8]) -> Result<f64, ManagerError> {
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        Ok(sketch.size())
    }

    /// Invokes `f` with the resolved sketch for read-only inspection (the
    /// `info` command uses this to read counters and storage mode).
    pub fn cb<R>(&self, name: &[u8], f: impl FnOnce(&Sketch) -> R) -> Result<R, ManagerError> {
        let sketch = self.lookup(name).ok_or(ManagerError::NotFound)?;
        Ok(f(&sketch))
    }

    // -- listings -------------------------------------------------------------

    /// Prefix-iterates the merged primary index, plus any not-yet-merged
    /// creates from the delta log so a just-created set is visible before
    /// the next vacuum cycle.
    pub fn list(&self, prefix: &[u8]) -> Vec<SetListing> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.primary.load().iter_prefix(prefix, |name, sketch| {
            seen.insert(name.to_vec());
            out.push(listing_of(name, sketch));
        });

        let primary_vsn = self.primary_vsn.load(Ordering::Acquire);
        let vsn = self.vsn.load(Ordering::Acquire);
        if primary_vsn == vsn {
            return out;
        }

        let mut deleted = HashSet::new();
        let mut cur = self.delta_head.load_full();
        while let Some(node) = cur {
            if node.entry.version <= primary_vsn {
                break;
            }
            match node.entry.kind {
                DeltaKind::Create => {
                    if node.entry.name.starts_with(prefix)
                        && !seen.contains(&node.entry.name)
                        && !deleted.contains(&node.entry.name)
                    {
                        if let Some(sketch) = &node.entry.wrapper {
                            seen.insert(node.entry.name.clone());
                            out.push(listing_of(&node.entry.name, sketch));
                        }
                    }
                }
                DeltaKind::Delete => {
                    deleted.insert(node.entry.name.clone());
                }
                DeltaKind::Barrier => {}
            }
            cur = node.next.clone();
        }
        out
    }

    /// Names of sets that are resident and have not been touched since the
    /// previous call; clears each one's `hot` flag as a side effect.
    pub fn list_cold(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.primary.load().iter(|name, sketch| {
            if sketch.take_hot() {
                return;
            }
            if sketch.is_proxied() {
                return;
            }
            out.push(name.to_vec());
        });
        out
    }

    /// Scans `data_dir` for `hlld.<name>` folders and inserts them directly
    /// into the primary index, with no delta and no vacuum involvement.
    /// Meant to be called once at startup before serving traffic.
    pub fn list_restore(&self) -> Result<(), ManagerError> {
        let dir = Path::new(&self.cfg.data_dir);
        if !dir.exists() {
            return Ok(());
        }

        let mut primary = (*self.primary.load_full()).clone();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_prefix(SET_DIR_PREFIX)) else {
                continue;
            };
            let name_bytes = name.as_bytes().to_vec();
            let sketch = Sketch::open(
                entry.path(),
                name_bytes.clone(),
                self.cfg.default_precision,
                self.cfg.default_eps,
                self.cfg.in_memory,
                self.cfg.use_mmap,
                false,
            )
            .map_err(ManagerError::from)?;
            primary.insert(&name_bytes, Arc::new(sketch));
        }
        self.primary.store(Arc::new(primary));
        Ok(())
    }

    // -- client checkpoints ---------------------------------------------------

    /// Records that `client_id` has witnessed the current version; the
    /// minimum across all recorded clients gates vacuum reclamation.
    pub fn checkpoint(&self, client_id: u64) {
        let vsn = self.vsn.load(Ordering::Acquire);
        self.checkpoints.lock().insert(client_id, vsn);
    }

    /// Removes a client's checkpoint entry (connection closed).
    pub fn leave(&self, client_id: u64) {
        self.checkpoints.lock().remove(&client_id);
    }

    // -- lifecycle --------------------------------------------------------

    /// Whether background loops should keep running.
    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    /// Cooperative shutdown signal for the vacuum and sweeper loops.
    pub fn stop(&self) {
        self.should_run.store(false, Ordering::Release);
    }

    fn collect_deltas_between(&self, lo_exclusive: u64, hi_inclusive: u64) -> Vec<DeltaEntry> {
        let mut out = Vec::new();
        let mut cur = self.delta_head.load_full();
        while let Some(node) = cur {
            if node.entry.version <= lo_exclusive {
                break;
            }
            if node.entry.version <= hi_inclusive {
                out.push(node.entry.clone());
            }
            cur = node.next.clone();
        }
        out.reverse();
        out
    }

    fn trim_deltas(&self, min_vsn: u64) {
        let _guard = self.write_mutex.lock();
        let mut remaining = Vec::new();
        let mut cur = self.delta_head.load_full();
        while let Some(node) = cur {
            if node.entry.version <= min_vsn {
                break;
            }
            remaining.push(node.entry.clone());
            cur = node.next.clone();
        }
        remaining.reverse();
        let mut next: Option<Arc<DeltaNode>> = None;
        for entry in remaining {
            next = Some(Arc::new(DeltaNode { entry, next }));
        }
        self.delta_head.store(next);
    }

    fn destroy_wrapper(sketch: &Sketch) {
        let result = if sketch.pending_delete() {
            sketch.delete()
        } else {
            sketch.unmap()
        };
        if let Err(err) = result {
            warn!("failed to reclaim set: {err}");
        }
    }

    /// Runs the vacuum loop until [`SetManager::stop`] is called. Meant to
    /// be spawned on its own thread.
    pub fn run_vacuum(&self) {
        let mut alt_vsn = self.primary_vsn.load(Ordering::Acquire);

        while self.should_run() {
            thread::sleep(VACUUM_POLL_INTERVAL);
            if !self.should_run() {
                break;
            }

            let vsn = self.vsn.load(Ordering::Acquire);
            let primary_vsn = self.primary_vsn.load(Ordering::Acquire);
            if vsn == primary_vsn {
                continue;
            }

            let client_min = self.checkpoints.lock().values().copied().min();
            let min_vsn = client_min.map_or(vsn, |c| c.min(vsn));
            if min_vsn <= primary_vsn {
                if vsn.saturating_sub(min_vsn) > VACUUM_WARN_THRESHOLD {
                    warn!("vacuum stalled: vsn={vsn} min_vsn={min_vsn}, a client may be lagging");
                }
                continue;
            }

            let deltas = self.collect_deltas_between(alt_vsn, min_vsn);
            {
                let mut alt = self.alternate.lock();
                for entry in &deltas {
                    match entry.kind {
                        DeltaKind::Create => {
                            alt.insert(&entry.name, entry.wrapper.clone().expect("create delta carries a wrapper"));
                        }
                        DeltaKind::Delete => {
                            alt.delete(&entry.name);
                        }
                        DeltaKind::Barrier => {}
                    }
                }
            }

            let newly_pending: Vec<Vec<u8>> = deltas
                .iter()
                .filter(|e| e.kind == DeltaKind::Delete)
                .map(|e| e.name.clone())
                .collect();
            {
                let mut pending = self.pending_deletes.lock();
                for name in &newly_pending {
                    pending.insert(name.clone());
                }
            }

            let new_primary = Arc::new(self.alternate.lock().clone());
            let old_primary = self.primary.swap(new_primary);
            self.primary_vsn.store(min_vsn, Ordering::Release);

            let barrier_vsn = {
                let _guard = self.write_mutex.lock();
                self.append_delta(DeltaKind::Barrier, Vec::new(), None)
            };
            loop {
                let all_past = self
                    .checkpoints
                    .lock()
                    .values()
                    .all(|&v| v >= barrier_vsn);
                if all_past || !self.should_run() {
                    break;
                }
                thread::sleep(VACUUM_POLL_INTERVAL);
            }

            {
                let mut old = (*old_primary).clone();
                for entry in &deltas {
                    match entry.kind {
                        DeltaKind::Create => {
                            old.insert(&entry.name, entry.wrapper.clone().expect("create delta carries a wrapper"));
                        }
                        DeltaKind::Delete => {
                            old.delete(&entry.name);
                        }
                        DeltaKind::Barrier => {}
                    }
                }
                *self.alternate.lock() = old;
            }

            for entry in &deltas {
                if entry.kind == DeltaKind::Delete {
                    if let Some(sketch) = &entry.wrapper {
                        Self::destroy_wrapper(sketch);
                    }
                }
            }

            self.trim_deltas(min_vsn);

            {
                let mut pending = self.pending_deletes.lock();
                for name in &newly_pending {
                    pending.remove(name);
                }
            }

            alt_vsn = min_vsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> SetManager {
        let mut cfg = GlobalConfig::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        SetManager::new(cfg)
    }

    #[test]
    fn create_list_drop_round_trip() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.create(b"foo", CreateOptions { eps: Some(0.01), ..Default::default() }).unwrap();
        let listing = mgr.list(b"");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, b"foo".to_vec());
        assert_eq!(listing[0].precision, 14);

        mgr.drop_set(b"foo").unwrap();
        assert!(mgr.lookup(b"foo").is_none());
    }

    #[test]
    fn create_twice_reports_exists() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create(b"a", CreateOptions::default()).unwrap();
        let err = mgr.create(b"a", CreateOptions::default()).unwrap_err();
        assert!(matches!(err, ManagerError::Exists));
    }

    #[test]
    fn drop_missing_reports_not_found() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert!(matches!(mgr.drop_set(b"ghost").unwrap_err(), ManagerError::NotFound));
    }

    #[test]
    fn clear_requires_proxied() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create(b"a", CreateOptions::default()).unwrap();
        mgr.add_keys(b"a", &[b"k"]).unwrap();
        // freshly created with no custom cfg is lazily faulted in only on add;
        // after one add it is resident, so clear must be rejected.
        assert!(matches!(mgr.clear(b"a").unwrap_err(), ManagerError::NotProxied));
    }

    #[test]
    fn clear_succeeds_when_proxied() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create(b"a", CreateOptions::default()).unwrap();
        mgr.clear(b"a").unwrap();
        assert!(mgr.lookup(b"a").is_none());
    }

    #[test]
    fn add_and_size_track_cardinality() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create(b"d", CreateOptions::default()).unwrap();
        let keys: Vec<Vec<u8>> = (0..10_000).map(|i| format!("foobar{i}").into_bytes()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        mgr.add_keys(b"d", &key_refs).unwrap();
        let size = mgr.size(b"d").unwrap();
        assert!((9_800.0..=10_200.0).contains(&size), "size={size}");
    }

    #[test]
    fn list_sees_unmerged_create_before_any_vacuum_cycle() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.create(b"fresh", CreateOptions::default()).unwrap();
        let names: Vec<_> = mgr.list(b"").into_iter().map(|l| l.name).collect();
        assert!(names.contains(&b"fresh".to_vec()));
    }

    #[test]
    fn create_drop_create_is_pending_until_vacuum_runs() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path()));
        mgr.create(b"x", CreateOptions::default()).unwrap();
        mgr.drop_set(b"x").unwrap();

        assert!(matches!(
            mgr.create(b"x", CreateOptions::default()).unwrap_err(),
            ManagerError::DeletePending
        ));

        let vacuum_mgr = mgr.clone();
        let handle = thread::spawn(move || vacuum_mgr.run_vacuum());

        let mut cleared = false;
        for _ in 0..40 {
            thread::sleep(Duration::from_millis(200));
            if mgr.create(b"x", CreateOptions::default()).is_ok() {
                cleared = true;
                break;
            }
        }
        mgr.stop();
        handle.join().unwrap();
        assert!(cleared, "vacuum never cleared the pending delete");
    }

    #[test]
    fn list_cold_clears_hot_after_one_report() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path()));
        mgr.create(b"a", CreateOptions::default()).unwrap();
        mgr.add_keys(b"a", &[b"k"]).unwrap();

        // list_cold only scans the primary index, so the create must reach
        // primary via a vacuum cycle before it can show up there at all.
        let vacuum_mgr = mgr.clone();
        let handle = thread::spawn(move || vacuum_mgr.run_vacuum());

        let mut merged = false;
        for _ in 0..40 {
            thread::sleep(Duration::from_millis(200));
            if !mgr.primary.load().is_empty() {
                merged = true;
                break;
            }
        }
        mgr.stop();
        handle.join().unwrap();
        assert!(merged, "vacuum never merged the create into primary");

        // hot right after add: not yet eligible.
        assert!(mgr.list_cold().is_empty());
        // hot flag was cleared by the probe above; next call reports it cold.
        assert_eq!(mgr.list_cold(), vec![b"a".to_vec()]);
    }
}
