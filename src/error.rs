//! Error taxonomy shared across the sketch storage layer and the set manager.
//!
//! Each lower layer (bitmap, config) defines the failure modes it can
//! actually produce; [`ManagerError`] is the one the protocol layer sees and
//! maps onto the wire reply strings from the command table.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures from the fixed-size byte buffer layer (`bitmap.rs`).
#[derive(Debug, Error)]
pub enum BitmapError {
    /// The requested length did not match an existing file, or was zero.
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    /// The file descriptor or handle passed in was not usable.
    #[error("bad file handle")]
    BadFileHandle,
    /// The backing path does not exist and `create` was not requested.
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),
    /// Any other I/O failure surfaced from the OS.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures from the per-set sketch lifecycle layer (`sketch.rs`).
#[derive(Debug, Error)]
pub enum SketchError {
    /// The underlying bitmap could not be opened, created or flushed.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    /// Generic I/O failure (config file read/write, directory removal, ...).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures from INI config parsing and validation (`config.rs`).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or is not valid INI.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The INI text could not be parsed.
    #[error("invalid ini: {0}")]
    Parse(String),
    /// A key was present but out of its documented bounds.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// Offending key name.
        key: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Errors the set manager surfaces to callers.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No active wrapper exists for the given name.
    #[error("Set does not exist")]
    NotFound,
    /// An active wrapper already exists for the given name.
    #[error("Exists")]
    Exists,
    /// A delete for this name has been accepted but not yet reclaimed by vacuum.
    #[error("Delete in progress")]
    DeletePending,
    /// `clear` was attempted on a sketch that is still resident.
    #[error("Set is not proxied. Close it first.")]
    NotProxied,
    /// The caller supplied arguments the manager rejects outright.
    #[error("Client Error: Bad arguments")]
    BadArguments,
    /// Allocation, mapping, or I/O failure while creating or faulting in a sketch.
    #[error("Internal Error: {0}")]
    Internal(String),
    /// I/O failure not otherwise classified above.
    #[error("Internal Error: {0}")]
    Io(#[from] io::Error),
}

impl From<SketchError> for ManagerError {
    fn from(err: SketchError) -> Self {
        ManagerError::Internal(err.to_string())
    }
}

impl From<BitmapError> for ManagerError {
    fn from(err: BitmapError) -> Self {
        ManagerError::Internal(err.to_string())
    }
}

/// Top level error returned from `main`; anything that should abort startup
/// (bad config, failed bind) flows through here with a non-zero exit code.
#[derive(Debug, Error)]
pub enum HlldError {
    /// The global config file failed to parse or validate.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The TCP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Any other I/O failure during startup (data dir scan, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The initial data-directory scan (`list_restore`) failed.
    #[error("failed to restore data directory: {0}")]
    Restore(#[from] ManagerError),
}
