use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};

/// Rewrite the `home` line of `pyvenv.cfg` to the new base interpreter
/// directory. A missing file or missing key is tolerated silently: the field
/// is optional metadata.
pub(crate) fn rewrite(config: &Path, base_python_dir: &Path) -> Result<()> {
    let contents = match fs::read_to_string(config) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", config.display()))
        }
    };

    let mut out = String::with_capacity(contents.len());
    let mut replaced = false;
    for piece in contents.split_inclusive('\n') {
        let body = piece.strip_suffix('\n').unwrap_or(piece);
        if !replaced {
            if let Some((key, _)) = body.split_once('=') {
                if key.trim() == "home" {
                    out.push_str("home = ");
                    out.push_str(&base_python_dir.to_string_lossy());
                    out.push('\n');
                    replaced = true;
                    continue;
                }
            }
        }
        out.push_str(piece);
    }

    if replaced && out != contents {
        fs::write(config, out).with_context(|| format!("failed to write {}", config.display()))?;
    }
    Ok(())
}
