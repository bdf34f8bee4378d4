use std::fmt;
use std::path::PathBuf;

use crate::core::pyc::CacheError;

/// What a missing layout entry was expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Directory => f.write_str("directory"),
            EntryKind::File => f.write_str("file"),
        }
    }
}

/// Failures with a defined surface form; everything else travels as plain
/// `anyhow` context chains.
#[derive(Debug, thiserror::Error)]
pub enum RelocateError {
    /// The target directory does not have the layout of a virtualenv. The
    /// message names the first missing entry, so callers can print it as-is.
    #[error("{} is not a virtualenv: not a {kind}: {}", root.display(), path.display())]
    NotAVirtualenv {
        root: PathBuf,
        kind: EntryKind,
        path: PathBuf,
    },

    /// The activation script exists but carries no `VIRTUAL_ENV` assignment.
    /// Unlike a layout mismatch this means the environment is corrupt.
    #[error("Could not find VIRTUAL_ENV= in activation script: {}", path.display())]
    ActivateMissingPath { path: PathBuf },

    /// A bytecode cache file could not be deserialized.
    #[error("invalid bytecode cache {}", path.display())]
    BadCache {
        path: PathBuf,
        #[source]
        source: CacheError,
    },
}
