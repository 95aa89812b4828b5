//! Per-set sketch lifecycle: fault-in, flush, fault-out, delete.
//!
//! A [`Sketch`] wraps one named set's HLL, its bitmap, and its on-disk
//! folder. The reader/writer lock around the live [`Hll`] guards its
//! existence only (`add`/`size`/`flush` read-lock it; `unmap` write-locks
//! it); a separate fault-in mutex serialises the proxied→resident
//! transition.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::bitmap::{registers_path, BackingMode, Bitmap};
use crate::config::SketchConfig;
use crate::error::SketchError;
use crate::hll::{self, Hll};

/// How a sketch's registers are backed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Anonymous memory only; never paged out, never written to disk.
    InMemory,
    /// File-backed, using a shared memory mapping.
    Shared,
    /// File-backed, using a privately-mapped, manually flushed region.
    Persistent,
}

impl StorageMode {
    fn backing_mode(self) -> BackingMode {
        match self {
            StorageMode::InMemory => BackingMode::Anonymous,
            StorageMode::Shared => BackingMode::Shared,
            StorageMode::Persistent => BackingMode::Persistent,
        }
    }

    /// The string used in the `info` command's `storage` field.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::InMemory => "in_memory",
            StorageMode::Shared => "shared",
            StorageMode::Persistent => "persistent",
        }
    }
}

/// A named HLL sketch: its identity, on-disk folder, and mutable lifecycle
/// state.
pub struct Sketch {
    name: Vec<u8>,
    dir: PathBuf,
    precision: u8,
    eps: f64,
    mode: StorageMode,

    active: AtomicBool,
    hot: AtomicBool,
    pending_delete: AtomicBool,
    dirty: AtomicBool,
    proxied: AtomicBool,
    config_written: AtomicBool,

    size_estimate: Mutex<f64>,
    adds: AtomicU64,
    page_ins: AtomicU64,
    page_outs: AtomicU64,

    hll: RwLock<Option<Hll>>,
    fault_lock: Mutex<()>,
}

impl std::fmt::Debug for Sketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sketch")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("precision", &self.precision)
            .field("mode", &self.mode.as_str())
            .field("proxied", &self.proxied.load(Ordering::Relaxed))
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Sketch {
    /// Opens (creating if missing) the folder for `name`, reading its
    /// `config.ini` if present and otherwise seeding it from `precision`/
    /// `eps`/`in_memory`. When `discover` is set, faults the registers in
    /// immediately and flushes the config file; otherwise the sketch stays
    /// proxied.
    pub fn open(
        dir: PathBuf,
        name: Vec<u8>,
        precision: u8,
        eps: f64,
        in_memory: bool,
        use_mmap: bool,
        discover: bool,
    ) -> Result<Self, SketchError> {
        fs::create_dir_all(&dir)?;

        let existing = SketchConfig::load(&dir).map_err(|e| {
            SketchError::Io(std::io::Error::other(e.to_string()))
        })?;

        let config_existed = existing.is_some();
        let (precision, eps, in_memory, size_estimate) = match existing {
            Some(cfg) => (cfg.default_precision, cfg.default_eps, cfg.in_memory, cfg.size),
            None => (precision, eps, in_memory, 0.0),
        };

        let mode = if in_memory {
            StorageMode::InMemory
        } else if use_mmap {
            StorageMode::Shared
        } else {
            StorageMode::Persistent
        };

        let sketch = Sketch {
            name,
            dir,
            precision,
            eps,
            mode,
            active: AtomicBool::new(true),
            hot: AtomicBool::new(false),
            pending_delete: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            proxied: AtomicBool::new(true),
            config_written: AtomicBool::new(config_existed),
            size_estimate: Mutex::new(size_estimate),
            adds: AtomicU64::new(0),
            page_ins: AtomicU64::new(0),
            page_outs: AtomicU64::new(0),
            hll: RwLock::new(None),
            fault_lock: Mutex::new(()),
        };

        if in_memory {
            // in_memory=true implies the sketch is never paged out.
            sketch.ensure_resident()?;
        } else if discover {
            sketch.ensure_resident()?;
            sketch.flush()?;
        }

        Ok(sketch)
    }

    /// The set's name.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The set's configured precision.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// The set's target error rate.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Current storage mode.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Whether destructive/mutative operations still accept this wrapper.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clears `active`, the synchronous half of drop/clear.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether on-disk files should be removed during teardown.
    pub fn pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    /// Marks this wrapper for on-disk removal once it's reclaimed.
    pub fn mark_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
    }

    /// Whether registers are not currently resident.
    pub fn is_proxied(&self) -> bool {
        self.proxied.load(Ordering::Acquire)
    }

    /// Clears `hot` and returns whether it was set (used by the cold sweep).
    pub fn take_hot(&self) -> bool {
        self.hot.swap(false, Ordering::AcqRel)
    }

    /// Marks this set hot without an actual `add` (used by `create` when a
    /// custom config makes the set resident immediately).
    pub fn mark_hot(&self) {
        self.hot.store(true, Ordering::Relaxed);
    }

    /// Add/page/page-out counters, for the `info` command.
    pub fn counters(&self) -> SketchCounters {
        SketchCounters {
            adds: self.adds.load(Ordering::Relaxed),
            page_ins: self.page_ins.load(Ordering::Relaxed),
            page_outs: self.page_outs.load(Ordering::Relaxed),
        }
    }

    fn ensure_resident(&self) -> Result<(), SketchError> {
        if !self.proxied.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.fault_lock.lock();
        if !self.proxied.load(Ordering::Acquire) {
            return Ok(());
        }

        let bytes = hll::bytes_for_precision(self.precision);
        let bitmap = if self.mode == StorageMode::InMemory {
            Bitmap::anonymous(bytes)?
        } else {
            let path = registers_path(&self.dir);
            let existed = path.exists();
            let bitmap = Bitmap::open_from_path(&path, bytes, true, self.mode.backing_mode())?;
            if existed {
                self.page_ins.fetch_add(1, Ordering::Relaxed);
            }
            bitmap
        };

        *self.hll.write() = Some(Hll::new(bitmap, self.precision));
        self.proxied.store(false, Ordering::Release);
        Ok(())
    }

    /// Faults in if necessary, hashes `key`, and folds it into the registers.
    pub fn add(&self, key: &[u8]) -> Result<(), SketchError> {
        self.ensure_resident()?;
        let guard = self.hll.read();
        if let Some(hll) = guard.as_ref() {
            hll.add(key);
        }
        drop(guard);
        self.adds.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        self.hot.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Live estimate if resident, else the cached value (no fault-in).
    pub fn size(&self) -> f64 {
        let guard = self.hll.read();
        if let Some(hll) = guard.as_ref() {
            hll.estimate()
        } else {
            *self.size_estimate.lock()
        }
    }

    /// Current bitmap size if resident, else the size implied by precision.
    pub fn byte_size(&self) -> usize {
        let guard = self.hll.read();
        if let Some(hll) = guard.as_ref() {
            hll.byte_size()
        } else {
            hll::bytes_for_precision(self.precision)
        }
    }

    /// No-op if proxied, or if already flushed once and still not dirty;
    /// otherwise persists `config.ini` (including the current estimate),
    /// clears `dirty`, then flushes the bitmap. The very first flush after
    /// open always writes `config.ini`, even with nothing added yet, so a
    /// custom precision/eps/in_memory override survives a restart before
    /// the first key.
    pub fn flush(&self) -> Result<(), SketchError> {
        let guard = self.hll.read();
        let Some(hll) = guard.as_ref() else {
            return Ok(());
        };
        let dirty = self.dirty.load(Ordering::Acquire);
        let first_flush = !self.config_written.load(Ordering::Acquire);
        if !dirty && !first_flush {
            return Ok(());
        }

        let estimate = hll.estimate();
        *self.size_estimate.lock() = estimate;
        let cfg = SketchConfig {
            size: estimate,
            default_eps: self.eps,
            default_precision: self.precision,
            in_memory: self.mode == StorageMode::InMemory,
        };
        cfg.save(&self.dir)
            .map_err(|e| SketchError::Io(std::io::Error::other(e.to_string())))?;
        self.config_written.store(true, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        hll.flush()?;
        Ok(())
    }

    /// Flushes, destroys the HLL, releases the bitmap, and marks proxied.
    /// Idempotent when already proxied.
    pub fn unmap(&self) -> Result<(), SketchError> {
        if self.mode == StorageMode::InMemory {
            return Ok(());
        }
        self.flush()?;
        let mut guard = self.hll.write();
        if guard.take().is_some() {
            self.page_outs.fetch_add(1, Ordering::Relaxed);
            self.proxied.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Closes (as `unmap`, for file-backed sets) then removes every file
    /// under the set's folder and the folder itself.
    pub fn delete(&self) -> Result<(), SketchError> {
        self.unmap()?;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// The folder this set's files live under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Per-sketch operation counters, surfaced by the `info` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SketchCounters {
    /// Number of `add` calls observed.
    pub adds: u64,
    /// Number of times registers were faulted in from an existing file.
    pub page_ins: u64,
    /// Number of times registers were faulted out.
    pub page_outs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_set_estimates_zero() {
        let dir = tempdir().unwrap();
        let sketch = Sketch::open(
            dir.path().join("hlld.foo"),
            b"foo".to_vec(),
            12,
            hll::error_for_precision(12),
            false,
            true,
            false,
        )
        .unwrap();
        assert_eq!(sketch.size(), 0.0);
    }

    #[test]
    fn add_then_size_is_resident_and_reasonable() {
        let dir = tempdir().unwrap();
        let sketch = Sketch::open(
            dir.path().join("hlld.foo"),
            b"foo".to_vec(),
            14,
            hll::error_for_precision(14),
            false,
            true,
            false,
        )
        .unwrap();
        for i in 0u64..10_000 {
            sketch.add(&i.to_le_bytes()).unwrap();
        }
        assert!(!sketch.is_proxied());
        let estimate = sketch.size();
        assert!((9_000.0..11_000.0).contains(&estimate), "estimate={estimate}");
        assert_eq!(sketch.byte_size(), hll::bytes_for_precision(14));
    }

    #[test]
    fn flush_then_reopen_preserves_estimate() {
        let dir = tempdir().unwrap();
        let set_dir = dir.path().join("hlld.foo");
        {
            let sketch = Sketch::open(
                set_dir.clone(),
                b"foo".to_vec(),
                12,
                hll::error_for_precision(12),
                false,
                true,
                false,
            )
            .unwrap();
            for i in 0u64..500 {
                sketch.add(&i.to_le_bytes()).unwrap();
            }
            sketch.flush().unwrap();
        }
        let reopened = Sketch::open(
            set_dir,
            b"foo".to_vec(),
            12,
            hll::error_for_precision(12),
            false,
            true,
            false,
        )
        .unwrap();
        assert!(reopened.is_proxied());
        assert!(reopened.size() > 0.0);
    }

    #[test]
    fn in_memory_never_proxies() {
        let dir = tempdir().unwrap();
        let sketch = Sketch::open(
            dir.path().join("hlld.mem"),
            b"mem".to_vec(),
            10,
            hll::error_for_precision(10),
            true,
            true,
            false,
        )
        .unwrap();
        assert!(!sketch.is_proxied());
        sketch.unmap().unwrap();
        assert!(!sketch.is_proxied());
    }

    #[test]
    fn delete_removes_the_folder() {
        let dir = tempdir().unwrap();
        let set_dir = dir.path().join("hlld.foo");
        let sketch = Sketch::open(
            set_dir.clone(),
            b"foo".to_vec(),
            10,
            hll::error_for_precision(10),
            false,
            true,
            true,
        )
        .unwrap();
        assert!(set_dir.exists());
        sketch.delete().unwrap();
        assert!(!set_dir.exists());
    }

    #[test]
    fn cold_sweep_probe_clears_hot_once() {
        let dir = tempdir().unwrap();
        let sketch = Sketch::open(
            dir.path().join("hlld.foo"),
            b"foo".to_vec(),
            10,
            hll::error_for_precision(10),
            false,
            true,
            false,
        )
        .unwrap();
        sketch.add(b"k").unwrap();
        assert!(sketch.take_hot());
        assert!(!sketch.take_hot());
    }
}
