use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::activation::Dialect;
use crate::core::error::{EntryKind, RelocateError};
use crate::core::fs::realpath_if_exists;

/// Which interpreter implementation produced the environment's on-disk
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Standard,
    PyPy,
}

/// Name of the executable directory under the environment root.
pub(crate) const BIN_DIR: &str = if cfg!(windows) { "Scripts" } else { "bin" };

/// Layout facts that differ per flavor and platform, resolved once at
/// detection time and carried in the descriptor instead of branching at
/// every call site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutRules {
    pub(crate) lib_dir: &'static str,
    /// Matches a version directory name under the library base.
    pub(crate) version_dir: fn(&str) -> bool,
    /// Version directory name with digits replaced by `#`, for diagnostics.
    pub(crate) version_wildcard: &'static str,
    /// `..` components from a site-packages manifest up to the env root.
    pub(crate) site_ascent: usize,
}

impl LayoutRules {
    pub(crate) fn for_flavor(flavor: Flavor) -> Self {
        match flavor {
            Flavor::PyPy => Self {
                lib_dir: "lib-python",
                version_dir: is_version,
                version_wildcard: "#.#",
                site_ascent: 1,
            },
            Flavor::Standard => Self {
                lib_dir: "lib",
                version_dir: is_python_version,
                version_wildcard: "python#.#",
                site_ascent: if cfg!(windows) { 2 } else { 3 },
            },
        }
    }
}

/// Matches `<major>.<minor>`, e.g. `3.11`.
fn is_version(name: &str) -> bool {
    match name.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Matches `python<major>.<minor>`, e.g. `python3.11`.
fn is_python_version(name: &str) -> bool {
    name.strip_prefix("python").is_some_and(is_version)
}

/// Everything the rewrite passes need to know about an environment,
/// resolved once per invocation and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Virtualenv {
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    /// Directories scanned for bytecode caches, besides the bin directory.
    pub lib_dirs: Vec<PathBuf>,
    pub site_packages: PathBuf,
    /// The absolute path the environment was created with, recovered from
    /// the activation script and canonicalized if it still exists.
    pub orig_path: PathBuf,
    pub flavor: Flavor,
    pub pyvenv_cfg: PathBuf,
    pub(crate) rules: LayoutRules,
}

impl Virtualenv {
    /// Classify `root` as a virtualenv and build the descriptor.
    ///
    /// Classification stops at the first missing entry with a
    /// [`RelocateError::NotAVirtualenv`] naming it. A structurally valid
    /// environment whose activation script lacks a `VIRTUAL_ENV` line fails
    /// with [`RelocateError::ActivateMissingPath`] instead: that is
    /// corruption, not a foreign directory.
    pub fn detect(root: &Path) -> Result<Self> {
        let flavor = if root.join("lib_pypy").is_dir() {
            Flavor::PyPy
        } else {
            Flavor::Standard
        };
        let rules = LayoutRules::for_flavor(flavor);

        let bin_dir = root.join(BIN_DIR);
        let lib_base = root.join(rules.lib_dir);
        for dir in [&bin_dir, &lib_base] {
            if !dir.is_dir() {
                return Err(not_a_virtualenv(root, EntryKind::Directory, dir));
            }
        }

        let lib_dir = if cfg!(windows) {
            lib_base.clone()
        } else {
            version_dir(root, &lib_base, &rules)?
        };

        let activate = bin_dir.join("activate");
        if !activate.is_file() {
            return Err(not_a_virtualenv(root, EntryKind::File, &activate));
        }

        let site_packages = match flavor {
            Flavor::PyPy => root.join("site-packages"),
            Flavor::Standard => lib_dir.join("site-packages"),
        };
        if !site_packages.is_dir() {
            return Err(not_a_virtualenv(root, EntryKind::Directory, &site_packages));
        }

        let orig_path = realpath_if_exists(&recover_original_path(&activate)?);

        let mut lib_dirs = vec![lib_dir];
        if flavor == Flavor::PyPy {
            lib_dirs.push(root.join("lib_pypy"));
        }

        Ok(Self {
            root: root.to_path_buf(),
            bin_dir,
            lib_dirs,
            site_packages,
            orig_path,
            flavor,
            pyvenv_cfg: root.join("pyvenv.cfg"),
            rules,
        })
    }
}

/// The single `<major>.<minor>`-shaped entry under the library base. Zero or
/// several candidates mean this is not an environment we understand.
fn version_dir(root: &Path, lib_base: &Path, rules: &LayoutRules) -> Result<PathBuf> {
    let mut matches = Vec::new();
    let entries = fs::read_dir(lib_base)
        .with_context(|| format!("failed to list {}", lib_base.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", lib_base.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if (rules.version_dir)(name) {
            matches.push(lib_base.join(name));
        }
    }
    matches.sort();
    match matches.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(not_a_virtualenv(
            root,
            EntryKind::Directory,
            &lib_base.join(rules.version_wildcard),
        )),
    }
}

/// Parse the recorded environment path out of the activation script.
fn recover_original_path(activate: &Path) -> Result<PathBuf> {
    let contents = fs::read_to_string(activate)
        .with_context(|| format!("failed to read {}", activate.display()))?;
    for line in contents.lines() {
        if let Some(span) = Dialect::Posix.detect(line) {
            return Ok(PathBuf::from(&line[span]));
        }
    }
    Err(RelocateError::ActivateMissingPath {
        path: activate.to_path_buf(),
    }
    .into())
}

fn not_a_virtualenv(root: &Path, kind: EntryKind, path: &Path) -> anyhow::Error {
    RelocateError::NotAVirtualenv {
        root: root.to_path_buf(),
        kind,
        path: path.to_path_buf(),
    }
    .into()
}
