use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::activation::{self, ACTIVATION_SCRIPTS};
use crate::core::layout::Virtualenv;
use crate::core::report::{ChangeTag, Reporter};

/// First bytes of a rewritable executable: a shebang on POSIX, the DOS `MZ`
/// header of a native launcher on Windows. Anything else in the bin
/// directory (data files, subdirectories, dangling symlinks) is skipped.
const EXEC_MARKER: &[u8; 2] = if cfg!(windows) { b"MZ" } else { b"#!" };

/// Rewrite every eligible entry directly in the binary directory.
///
/// With `activation_pass` false, activation scripts are skipped entirely;
/// they are deliberately deferred so they can record the final path. With it
/// true, only activation scripts are touched and everything else is skipped.
pub(crate) fn rewrite_all(
    venv: &Virtualenv,
    new_path: &Path,
    activation_pass: bool,
    reporter: &Reporter,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(&venv.bin_dir)
        .with_context(|| format!("failed to list {}", venv.bin_dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {}", venv.bin_dir.display()))?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for path in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let is_activation = ACTIVATION_SCRIPTS.contains(&name);
        if activation_pass {
            if is_activation && path.is_file() {
                activation::rewrite(&path, new_path, reporter)?;
            }
        } else if !is_activation && path.is_file() {
            rewrite_script(&path, &venv.orig_path, new_path, reporter)?;
        }
    }
    Ok(())
}

/// Rewrite the interpreter token of one script, leaving the file untouched
/// unless its interpreter lives inside the old environment.
pub(crate) fn rewrite_script(
    script: &Path,
    old_path: &Path,
    new_path: &Path,
    reporter: &Reporter,
) -> Result<()> {
    let data = fs::read(script).with_context(|| format!("failed to read {}", script.display()))?;
    if data.len() < 2 || &data[..2] != EXEC_MARKER {
        return Ok(());
    }
    let rewritten = if cfg!(windows) {
        rewrite_launcher(&data, old_path, new_path)
    } else {
        rewrite_shebang(&data, old_path, new_path)
    };
    if let Some(out) = rewritten {
        if out != data {
            fs::write(script, out)
                .with_context(|| format!("failed to write {}", script.display()))?;
            reporter.changed(ChangeTag::Script, script);
        }
    }
    Ok(())
}

/// Find the first line carrying a `#!` directive with an interpreter token
/// and rewrite that token. A bare `#!` keeps the scan going; a directive
/// naming a foreign interpreter settles the file as not ours to touch.
fn rewrite_shebang(data: &[u8], old_path: &Path, new_path: &Path) -> Option<Vec<u8>> {
    let mut line_start = 0;
    for line in data.split_inclusive(|&b| b == b'\n') {
        if let Some(marker) = line.windows(2).position(|w| w == b"#!") {
            let args_offset = marker + 2;
            let args = tokens(&line[args_offset..]);
            if !args.is_empty() {
                return rewrite_directive(data, line_start, line, args_offset, &args, old_path, new_path);
            }
        }
        line_start += line.len();
    }
    None
}

/// Windows native launchers embed the directive at a fixed offset in their
/// first line; no line scanning. Unverified platform extension.
fn rewrite_launcher(data: &[u8], old_path: &Path, new_path: &Path) -> Option<Vec<u8>> {
    let line = data.split_inclusive(|&b| b == b'\n').next()?;
    let args = tokens(&line[2..]);
    if args.is_empty() {
        return None;
    }
    rewrite_directive(data, 0, line, 2, &args, old_path, new_path)
}

fn tokens(tail: &[u8]) -> Vec<&[u8]> {
    tail.split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Replace the interpreter token of the directive in `line` (located at
/// `line_start` within `data`) when it is a path inside `old_path`,
/// preserving the remaining tokens.
fn rewrite_directive(
    data: &[u8],
    line_start: usize,
    line: &[u8],
    args_offset: usize,
    args: &[&[u8]],
    old_path: &Path,
    new_path: &Path,
) -> Option<Vec<u8>> {
    let interpreter = std::str::from_utf8(args.first()?).ok()?;
    // Containment: the token must resolve under the old root without any
    // `..` escape; relative tokens never qualify.
    let suffix = Path::new(interpreter).strip_prefix(old_path).ok()?;
    let new_bin = new_path.join(suffix);

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..line_start + args_offset]);
    out.extend_from_slice(new_bin.to_string_lossy().as_bytes());
    for token in &args[1..] {
        out.push(b' ');
        out.extend_from_slice(token);
    }
    out.push(b'\n');
    out.extend_from_slice(&data[line_start + line.len()..]);
    Some(out)
}
