//! Fixed-size byte buffer with three backing modes.
//!
//! Bit `i` is bit `7 - (i % 8)` of byte `i / 8`. The HLL register layer
//! above this one mostly works in terms of raw byte slices
//! (registers straddle byte boundaries), so [`Bitmap`] exposes both a bit
//! accessor pair and direct slice access.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use nix::sys::uio::{pread, pwrite};

use crate::error::BitmapError;

/// Selects how a [`Bitmap`]'s bytes are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingMode {
    /// Allocated in process memory; `flush` is a no-op.
    Anonymous,
    /// Backed by a file via a shared memory mapping.
    Shared,
    /// Backed by a file read once into a private anonymous region; dirty
    /// pages are written back with positional writes on `flush`.
    Persistent,
}

enum Storage {
    Anonymous(Vec<u8>),
    Shared { mmap: MmapMut, file: File },
    Persistent { mmap: MmapMut, file: File },
}

/// A fixed-length byte buffer addressable as an array of bits.
pub struct Bitmap {
    len: usize,
    storage: Storage,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.storage {
            Storage::Anonymous(_) => "anonymous",
            Storage::Shared { .. } => "shared",
            Storage::Persistent { .. } => "persistent",
        };
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("mode", &mode)
            .finish()
    }
}

impl Bitmap {
    /// Allocates an anonymous, zero-filled bitmap of `len` bytes.
    pub fn anonymous(len: usize) -> Result<Self, BitmapError> {
        if len == 0 {
            return Err(BitmapError::InvalidLength(len));
        }
        Ok(Self {
            len,
            storage: Storage::Anonymous(vec![0u8; len]),
        })
    }

    /// Opens (or creates) the bitmap at `path`.
    ///
    /// When `create` is set and the file is empty, it is truncated to `len`;
    /// when it exists, its length must equal `len`. Any failure while
    /// initializing a freshly created file causes the file to be unlinked.
    pub fn open_from_path(
        path: &Path,
        len: usize,
        create: bool,
        mode: BackingMode,
    ) -> Result<Self, BitmapError> {
        if mode == BackingMode::Anonymous {
            return Self::anonymous(len);
        }
        if len == 0 {
            return Err(BitmapError::InvalidLength(len));
        }

        let existed = path.exists();
        if !existed && !create {
            return Err(BitmapError::PathNotFound(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;

        let created_new = create && !existed;
        match Self::init_file(&file, len, created_new) {
            Ok(()) => {}
            Err(err) => {
                if created_new {
                    let _ = std::fs::remove_file(path);
                }
                return Err(err);
            }
        }

        match Self::open_from_file(file, len, mode) {
            Ok(bitmap) => Ok(bitmap),
            Err(err) => {
                if created_new {
                    let _ = std::fs::remove_file(path);
                }
                Err(err)
            }
        }
    }

    fn init_file(file: &File, len: usize, created_new: bool) -> Result<(), BitmapError> {
        let actual_len = file.metadata()?.len() as usize;
        if created_new && actual_len == 0 {
            file.set_len(len as u64)?;
        } else if actual_len != len {
            return Err(BitmapError::InvalidLength(actual_len));
        }
        Ok(())
    }

    /// Opens the bitmap over an already-open file handle.
    pub fn open_from_file(file: File, len: usize, mode: BackingMode) -> Result<Self, BitmapError> {
        if len == 0 {
            return Err(BitmapError::InvalidLength(len));
        }
        match mode {
            BackingMode::Anonymous => Self::anonymous(len),
            BackingMode::Shared => {
                // SAFETY: `file` is kept alive for as long as the mapping (owned together
                // in `Storage::Shared`), and nothing else in this process maps it mutably.
                let mmap = unsafe {
                    memmap2::MmapOptions::new()
                        .len(len)
                        .map_mut(&file)
                        .map_err(BitmapError::Io)?
                };
                Ok(Self {
                    len,
                    storage: Storage::Shared { mmap, file },
                })
            }
            BackingMode::Persistent => {
                let mut mmap = MmapMut::map_anon(len).map_err(BitmapError::Io)?;
                let mut offset = 0usize;
                while offset < len {
                    let read = pread(file.as_fd(), &mut mmap[offset..], offset as i64)
                        .map_err(|errno| BitmapError::Io(std::io::Error::from(errno)))?;
                    if read == 0 {
                        break;
                    }
                    offset += read;
                }
                Ok(Self {
                    len,
                    storage: Storage::Persistent { mmap, file },
                })
            }
        }
    }

    /// The buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty (always `false`; bitmaps are never zero-length).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows the whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Anonymous(buf) => buf,
            Storage::Shared { mmap, .. } => mmap,
            Storage::Persistent { mmap, .. } => mmap,
        }
    }

    /// Mutably borrows the whole buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Anonymous(buf) => buf,
            Storage::Shared { mmap, .. } => mmap,
            Storage::Persistent { mmap, .. } => mmap,
        }
    }

    /// Reads bit `i`.
    pub fn get_bit(&self, i: usize) -> bool {
        let byte = self.as_slice()[i / 8];
        (byte >> (7 - (i % 8))) & 1 == 1
    }

    /// Sets or clears bit `i`.
    pub fn set_bit(&mut self, i: usize, value: bool) {
        let byte = &mut self.as_mut_slice()[i / 8];
        let mask = 1u8 << (7 - (i % 8));
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    /// Flushes pending writes to the backing file, if any. Idempotent.
    pub fn flush(&mut self) -> Result<(), BitmapError> {
        match &mut self.storage {
            Storage::Anonymous(_) => Ok(()),
            Storage::Shared { mmap, file } => {
                mmap.flush().map_err(BitmapError::Io)?;
                file.sync_all().map_err(BitmapError::Io)?;
                Ok(())
            }
            Storage::Persistent { mmap, file } => {
                let page = page_size::get();
                let mut offset = 0usize;
                while offset < mmap.len() {
                    let end = (offset + page).min(mmap.len());
                    let written =
                        pwrite(file.as_fd(), &mmap[offset..end], offset as i64)
                            .map_err(|errno| BitmapError::Io(std::io::Error::from(errno)))?;
                    offset += written.max(1);
                }
                file.sync_all().map_err(BitmapError::Io)?;
                Ok(())
            }
        }
    }

    /// Flushes then releases the mapping and file handle.
    pub fn close(mut self) -> Result<(), BitmapError> {
        self.flush()
    }
}

/// Computes the on-disk path an error referred to, for diagnostics.
pub fn registers_path(dir: &Path) -> PathBuf {
    dir.join("registers.mmap")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn anonymous_round_trips_bits() {
        let mut bm = Bitmap::anonymous(16).unwrap();
        bm.set_bit(3, true);
        bm.set_bit(100, true);
        assert!(bm.get_bit(3));
        assert!(bm.get_bit(100));
        assert!(!bm.get_bit(4));
        bm.flush().unwrap();
    }

    #[test]
    fn anonymous_rejects_zero_length() {
        assert!(Bitmap::anonymous(0).is_err());
    }

    #[test]
    fn shared_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = registers_path(dir.path());
        {
            let mut bm = Bitmap::open_from_path(&path, 64, true, BackingMode::Shared).unwrap();
            bm.as_mut_slice()[0] = 0xAB;
            bm.flush().unwrap();
        }
        let bm = Bitmap::open_from_path(&path, 64, false, BackingMode::Shared).unwrap();
        assert_eq!(bm.as_slice()[0], 0xAB);
    }

    #[test]
    fn persistent_flush_writes_back_to_file() {
        let dir = tempdir().unwrap();
        let path = registers_path(dir.path());
        {
            let mut bm =
                Bitmap::open_from_path(&path, 64, true, BackingMode::Persistent).unwrap();
            bm.as_mut_slice()[10] = 0x42;
            bm.flush().unwrap();
        }
        let bm = Bitmap::open_from_path(&path, 64, false, BackingMode::Persistent).unwrap();
        assert_eq!(bm.as_slice()[10], 0x42);
    }

    #[test]
    fn open_from_path_rejects_mismatched_length() {
        let dir = tempdir().unwrap();
        let path = registers_path(dir.path());
        Bitmap::open_from_path(&path, 64, true, BackingMode::Shared).unwrap();
        let err = Bitmap::open_from_path(&path, 128, false, BackingMode::Shared).unwrap_err();
        assert!(matches!(err, BitmapError::InvalidLength(64)));
    }

    #[test]
    fn open_from_path_without_create_requires_existing_file() {
        let dir = tempdir().unwrap();
        let path = registers_path(dir.path());
        let err = Bitmap::open_from_path(&path, 64, false, BackingMode::Shared).unwrap_err();
        assert!(matches!(err, BitmapError::PathNotFound(_)));
    }

    #[test]
    fn creation_failure_unlinks_the_new_file() {
        let dir = tempdir().unwrap();
        let path = registers_path(dir.path());
        Bitmap::open_from_path(&path, 64, true, BackingMode::Shared).unwrap();
        // Reopening with `create` set but a mismatched length must fail without
        // touching the pre-existing file at all (it wasn't newly created here).
        let err = Bitmap::open_from_path(&path, 128, true, BackingMode::Shared).unwrap_err();
        assert!(matches!(err, BitmapError::InvalidLength(64)));
        assert!(path.exists());
    }
}
