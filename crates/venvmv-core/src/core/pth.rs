use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::layout::Virtualenv;
use crate::core::report::{ChangeTag, Reporter};

/// Extensions of path-manifest files in site-packages.
const MANIFEST_SUFFIXES: &[&str] = &[".pth", ".egg-link"];

/// Convert absolute paths in site-packages manifests to a form relative to
/// the manifest's own location, so they survive further moves untouched.
pub(crate) fn rewrite_all(venv: &Virtualenv, reporter: &Reporter) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(&venv.site_packages)
        .with_context(|| format!("failed to list {}", venv.site_packages.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {}", venv.site_packages.display()))?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for path in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if MANIFEST_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) && path.is_file() {
            rewrite_manifest(&path, &venv.orig_path, venv.rules.site_ascent, reporter)?;
        }
    }
    Ok(())
}

/// Rewrite one manifest. A line is eligible iff it is not an `import `
/// directive and its trimmed content is an absolute path; eligible lines are
/// re-expressed relative to the original root, prefixed with the layout's
/// fixed ascent back up to it.
fn rewrite_manifest(
    manifest: &Path,
    orig_path: &Path,
    ascent: usize,
    reporter: &Reporter,
) -> Result<()> {
    let contents = fs::read_to_string(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;

    let mut out = String::with_capacity(contents.len());
    let mut changed = false;
    for piece in contents.split_inclusive('\n') {
        let body = piece.strip_suffix('\n').unwrap_or(piece);
        let value = body.trim();
        if value.starts_with("import ") || !Path::new(value).is_absolute() {
            out.push_str(piece);
            continue;
        }
        let mut relocatable = PathBuf::new();
        for _ in 0..ascent {
            relocatable.push("..");
        }
        relocatable.push(relative_to(Path::new(value), orig_path));
        out.push_str(&relocatable.to_string_lossy());
        out.push('\n');
        changed = true;
    }

    if changed {
        fs::write(manifest, out)
            .with_context(|| format!("failed to write {}", manifest.display()))?;
        reporter.changed(ChangeTag::Manifest, manifest);
    }
    Ok(())
}

/// `path` expressed relative to `base`, ascending with `..` where the two
/// diverge. Both inputs are absolute.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_parts: Vec<_> = path.components().collect();
    let base_parts: Vec<_> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}
