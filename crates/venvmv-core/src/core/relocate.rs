use std::iter;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::fs::remove_dir_all_writable;
use crate::core::layout::Virtualenv;
use crate::core::report::{ChangeTag, Reporter};
use crate::core::{pth, pyc, pyvenv, scripts};

/// One relocation invocation: where the environment lives, the path it
/// should record, and the optional base-interpreter override.
#[derive(Debug, Clone)]
pub struct RelocateRequest {
    /// Environment directory on disk.
    pub venv_path: PathBuf,
    /// Absolute path every embedded reference is rewritten to.
    pub update_path: PathBuf,
    /// When present, `pyvenv.cfg`'s `home` line is pointed here.
    pub base_python_dir: Option<PathBuf>,
    /// Rewrite even when the recorded path already matches.
    pub force: bool,
}

/// Terminal states of a relocation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateOutcome {
    /// The recorded path already matches; no file was touched.
    UpToDate { root: PathBuf, update_path: PathBuf },
    /// Every pass ran; the environment now records `new`.
    Updated {
        root: PathBuf,
        orig: PathBuf,
        new: PathBuf,
    },
}

/// Run the full relocation pipeline against one environment.
///
/// Pass order is fixed and significant: plain scripts, bytecode caches over
/// the bin and library directories, path manifests, the optional config
/// rewrite, legacy `local/` removal, and only then the activation scripts:
/// they must record the final path, and must not be double-handled as
/// generic scripts. The original path used for containment checks is the one
/// captured at detection time throughout.
pub fn relocate(request: &RelocateRequest, reporter: &Reporter) -> Result<RelocateOutcome> {
    let venv = Virtualenv::detect(&request.venv_path)?;
    if !request.force && venv.orig_path == request.update_path {
        return Ok(RelocateOutcome::UpToDate {
            root: venv.root,
            update_path: request.update_path.clone(),
        });
    }

    tracing::info!(
        root = %venv.root.display(),
        orig = %venv.orig_path.display(),
        new = %request.update_path.display(),
        "relocating"
    );

    scripts::rewrite_all(&venv, &request.update_path, false, reporter)?;
    for lib_dir in iter::once(&venv.bin_dir).chain(venv.lib_dirs.iter()) {
        pyc::rewrite_tree(lib_dir, &request.update_path, reporter)?;
    }
    pth::rewrite_all(&venv, reporter)?;
    if let Some(base) = &request.base_python_dir {
        pyvenv::rewrite(&venv.pyvenv_cfg, base)?;
    }
    remove_legacy_local(&venv.root, reporter)?;
    scripts::rewrite_all(&venv, &request.update_path, true, reporter)?;

    Ok(RelocateOutcome::Updated {
        root: venv.root,
        orig: venv.orig_path,
        new: request.update_path.clone(),
    })
}

/// Older environments shipped a `local/` directory of symlinks; it only
/// repeats paths rewritten elsewhere and is safe to drop.
fn remove_legacy_local(root: &Path, reporter: &Reporter) -> Result<()> {
    let local = root.join("local");
    if local.exists() {
        reporter.changed(ChangeTag::RemovedDir, &local);
        remove_dir_all_writable(&local)?;
    }
    Ok(())
}
