use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::report::{ChangeTag, Reporter};

/// File names recognized as activation scripts, one per shell dialect.
pub(crate) const ACTIVATION_SCRIPTS: &[&str] = &[
    "activate",
    "activate.csh",
    "activate.fish",
    "activate.xsh",
    "activate.bat",
    "Activate.ps1",
    "activate.ps1",
    "activate_this.py",
];

/// A shell dialect's way of assigning `VIRTUAL_ENV`.
///
/// Each dialect knows how to locate the assigned path on a line, so adding a
/// dialect is a new variant plus a `detect` arm rather than another branch in
/// a compound pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// `VIRTUAL_ENV="/path"`; also covers xonsh and `activate_this.py`.
    Posix,
    /// `setenv VIRTUAL_ENV "/path"`
    Csh,
    /// `set -gx VIRTUAL_ENV "/path"`
    Fish,
    /// `set "VIRTUAL_ENV=C:\path"` (or the unquoted legacy form)
    Batch,
    /// `$env:VIRTUAL_ENV = "/path"`
    PowerShell,
}

impl Dialect {
    /// Dialect for a recognized activation-script file name.
    pub(crate) fn for_file(name: &str) -> Option<Self> {
        match name {
            "activate" | "activate.xsh" | "activate_this.py" => Some(Self::Posix),
            "activate.csh" => Some(Self::Csh),
            "activate.fish" => Some(Self::Fish),
            "activate.bat" => Some(Self::Batch),
            "Activate.ps1" | "activate.ps1" => Some(Self::PowerShell),
            _ => None,
        }
    }

    /// Span of the assigned path within `line`, if the line is this
    /// dialect's `VIRTUAL_ENV` assignment.
    pub(crate) fn detect(self, line: &str) -> Option<Range<usize>> {
        let start = match self {
            Self::Posix => prefix_end(line, "VIRTUAL_ENV=")?,
            Self::Csh => prefix_end(line, "setenv VIRTUAL_ENV ")?,
            Self::Fish => prefix_end(line, "set -gx VIRTUAL_ENV ")?,
            Self::Batch => prefix_end(line, "set \"VIRTUAL_ENV=")
                .or_else(|| prefix_end(line, "set VIRTUAL_ENV="))?,
            Self::PowerShell => {
                let after = prefix_end(line, "$env:VIRTUAL_ENV")
                    .or_else(|| prefix_end(line, "$VIRTUAL_ENV"))?;
                let rest = &line[after..];
                let eq = after + rest.len() - rest.trim_start().len();
                if !line[eq..].starts_with('=') {
                    return None;
                }
                let value = &line[eq + 1..];
                eq + 1 + value.len() - value.trim_start().len()
            }
        };
        Some(value_span(line, start))
    }
}

fn prefix_end(line: &str, prefix: &str) -> Option<usize> {
    line.starts_with(prefix).then_some(prefix.len())
}

/// Narrow `line[start..]` to the quoted (or bare) value: trailing whitespace
/// is dropped and any quote characters hugging the value are excluded.
fn value_span(line: &str, start: usize) -> Range<usize> {
    let bytes = line.as_bytes();
    let mut end = line.trim_end().len().max(start);
    while end > start && matches!(bytes[end - 1], b'\'' | b'"') {
        end -= 1;
    }
    let mut begin = start;
    while begin < end && matches!(bytes[begin], b'\'' | b'"') {
        begin += 1;
    }
    begin..end
}

/// Rewrite the `VIRTUAL_ENV` assignment of one activation script to
/// `new_path`, preserving every other byte of each line.
pub(crate) fn rewrite(script: &Path, new_path: &Path, reporter: &Reporter) -> Result<()> {
    let name = script.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(dialect) = Dialect::for_file(name) else {
        return Ok(());
    };
    let contents = fs::read_to_string(script)
        .with_context(|| format!("failed to read {}", script.display()))?;
    let new_value = new_path.to_string_lossy();

    let mut out = String::with_capacity(contents.len());
    let mut changed = false;
    for piece in contents.split_inclusive('\n') {
        let (body, ending) = match piece.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (piece, ""),
        };
        match dialect.detect(body) {
            Some(span) if body[span.clone()] != *new_value => {
                out.push_str(&body[..span.start]);
                out.push_str(&new_value);
                out.push_str(&body[span.end..]);
                out.push_str(ending);
                changed = true;
            }
            _ => out.push_str(piece),
        }
    }

    if changed {
        fs::write(script, out).with_context(|| format!("failed to write {}", script.display()))?;
        reporter.changed(ChangeTag::Activation, script);
    }
    Ok(())
}
