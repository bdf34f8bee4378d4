//! Bytecode cache rewriting: verbatim header passthrough plus a recursive
//! source-path rewrite of the nested code-object tree.

pub mod marshal;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::core::error::RelocateError;
use crate::core::report::{ChangeTag, Reporter};

use self::marshal::{Code, CodeLayout, MarshalError, Obj, Value};

/// Cache header: magic word, `\r\n`, a PEP 552 flags word, and two words of
/// source metadata (timestamp/size or hash). Copied through unchanged.
pub const HEADER_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("file is shorter than the {HEADER_LEN}-byte header")]
    TruncatedHeader,
    #[error("header magic is not terminated by \\r\\n")]
    BadMagic,
    #[error("unsupported magic number {0}")]
    UnsupportedMagic(u16),
    #[error("top-level object is not a code object")]
    NotCode,
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// The fixed-size cache-file header, retained verbatim across a rewrite so
/// timestamp/hash validation still matches the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    raw: [u8; HEADER_LEN],
}

impl CacheHeader {
    /// Header with the given magic word and zeroed validation fields.
    #[must_use]
    pub fn new(magic: u16) -> Self {
        let mut raw = [0u8; HEADER_LEN];
        raw[..2].copy_from_slice(&magic.to_le_bytes());
        raw[2] = b'\r';
        raw[3] = b'\n';
        Self { raw }
    }

    fn parse(data: &[u8]) -> Result<(Self, &[u8]), CacheError> {
        if data.len() < HEADER_LEN {
            return Err(CacheError::TruncatedHeader);
        }
        if data[2] != b'\r' || data[3] != b'\n' {
            return Err(CacheError::BadMagic);
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&data[..HEADER_LEN]);
        Ok((Self { raw }, &data[HEADER_LEN..]))
    }

    #[must_use]
    pub fn magic(&self) -> u16 {
        u16::from_le_bytes([self.raw[0], self.raw[1]])
    }

    /// Code-object layout for this magic, when the format is one we read.
    #[must_use]
    pub fn layout(&self) -> Option<CodeLayout> {
        match self.magic() {
            3390..=3399 => Some(CodeLayout::Py37),
            3400..=3449 => Some(CodeLayout::Py38),
            3450..=3799 => Some(CodeLayout::Py311),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.raw
    }
}

/// Split a cache file into its header and deserialized code-object tree.
pub fn read_cache(data: &[u8]) -> Result<(CacheHeader, Obj), CacheError> {
    let (header, body) = CacheHeader::parse(data)?;
    let layout = header
        .layout()
        .ok_or_else(|| CacheError::UnsupportedMagic(header.magic()))?;
    let obj = marshal::read(body, layout)?;
    if !matches!(obj.value, Value::Code(_)) {
        return Err(CacheError::NotCode);
    }
    Ok((header, obj))
}

/// Serialize `obj` after `header`, reproducing the cache-file framing.
pub fn compose(header: &CacheHeader, obj: &Obj) -> Result<Vec<u8>, CacheError> {
    let layout = header
        .layout()
        .ok_or_else(|| CacheError::UnsupportedMagic(header.magic()))?;
    let body = marshal::write(obj, layout)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Rewrite the embedded source path of one cache file to `new_source`.
/// Returns whether the file changed; an untouched tree is never written.
pub(crate) fn rewrite_cache(path: &Path, new_source: &str, reporter: &Reporter) -> Result<bool> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (header, obj) = match read_cache(&data) {
        Ok(parsed) => parsed,
        Err(source) => {
            reporter.cache_error(path);
            return Err(RelocateError::BadCache {
                path: path.to_path_buf(),
                source,
            }
            .into());
        }
    };
    let (obj, changed) = rewrite_object(obj, new_source);
    if changed {
        let out = compose(&header, &obj).map_err(|source| RelocateError::BadCache {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
        reporter.changed(ChangeTag::Bytecode, path);
    }
    Ok(changed)
}

/// Rewrite every cache file under `lib_dir`, re-rooting each file's embedded
/// source path under `new_root`.
pub(crate) fn rewrite_tree(lib_dir: &Path, new_root: &Path, reporter: &Reporter) -> Result<()> {
    for entry in WalkDir::new(lib_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", lib_dir.display()))?;
        // Symlinked caches are shared with another tree and not ours to
        // rewrite.
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".pyc") && !name.ends_with(".pyo") {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(lib_dir) else {
            continue;
        };
        let embedded = new_root.join(rel);
        rewrite_cache(entry.path(), &embedded.to_string_lossy(), reporter)?;
    }
    Ok(())
}

/// Recursive construct-if-changed rewrite. The explicit changed flag stands
/// in for the reference-identity trick: only a `true` result leads to a
/// write.
fn rewrite_object(obj: Obj, new_source: &str) -> (Obj, bool) {
    match obj.value {
        Value::Code(code) => {
            let (code, changed) = rewrite_code(*code, new_source);
            (
                Obj {
                    flag_ref: obj.flag_ref,
                    value: Value::Code(Box::new(code)),
                },
                changed,
            )
        }
        value => (
            Obj {
                flag_ref: obj.flag_ref,
                value,
            },
            false,
        ),
    }
}

fn rewrite_code(mut code: Code, new_source: &str) -> (Code, bool) {
    let mut changed = false;
    if let Value::Tuple { items, .. } = &mut code.consts.value {
        let owned = std::mem::take(items);
        *items = owned
            .into_iter()
            .map(|item| {
                if matches!(item.value, Value::Code(_)) {
                    let (item, item_changed) = rewrite_object(item, new_source);
                    changed |= item_changed;
                    item
                } else {
                    item
                }
            })
            .collect();
    }
    // The first serialized occurrence of the shared filename is a real
    // string; later occurrences are back references whose target this very
    // rewrite updates, so they are left as-is.
    if let Value::Str { bytes, .. } = &mut code.filename.value {
        if bytes.as_slice() != new_source.as_bytes() {
            *bytes = new_source.as_bytes().to_vec();
            changed = true;
        }
    }
    (code, changed)
}

#[cfg(test)]
mod tests {
    use super::marshal::StrKind;
    use super::*;

    fn str_obj(kind: StrKind, text: &str) -> Obj {
        Obj::plain(Value::Str {
            kind,
            bytes: text.as_bytes().to_vec(),
        })
    }

    fn code_obj(filename: &str, name: &str, consts: Vec<Obj>) -> Obj {
        let empty = || {
            Obj::plain(Value::Tuple {
                small: true,
                items: Vec::new(),
            })
        };
        Obj::plain(Value::Code(Box::new(Code {
            argcount: 0,
            posonlyargcount: Some(0),
            kwonlyargcount: 0,
            nlocals: Some(0),
            stacksize: 2,
            flags: 64,
            code: Obj::plain(Value::Bytes(vec![100, 0, 83, 0])),
            consts: Obj::plain(Value::Tuple {
                small: true,
                items: consts,
            }),
            names: empty(),
            varnames: Some(empty()),
            freevars: Some(empty()),
            cellvars: Some(empty()),
            localsplusnames: None,
            localspluskinds: None,
            filename: str_obj(StrKind::ShortAscii, filename),
            name: str_obj(StrKind::ShortAsciiInterned, name),
            qualname: None,
            firstlineno: 1,
            linetable: Obj::plain(Value::Bytes(vec![4, 0])),
            exceptiontable: None,
        })))
    }

    fn filenames(obj: &Obj, out: &mut Vec<String>) {
        if let Value::Code(code) = &obj.value {
            if let Value::Str { bytes, .. } = &code.filename.value {
                out.push(String::from_utf8_lossy(bytes).into_owned());
            }
            if let Value::Tuple { items, .. } = &code.consts.value {
                for item in items {
                    filenames(item, out);
                }
            }
        }
    }

    fn module(path: &str) -> Obj {
        code_obj(
            path,
            "<module>",
            vec![
                code_obj(path, "helper", vec![Obj::plain(Value::None)]),
                str_obj(StrKind::ShortAscii, "docstring"),
            ],
        )
    }

    #[test]
    fn rewrite_updates_every_nesting_level() {
        let (obj, changed) = rewrite_object(module("/a/venv/m.py"), "/b/venv/m.py");
        assert!(changed);
        let mut seen = Vec::new();
        filenames(&obj, &mut seen);
        assert_eq!(seen, vec!["/b/venv/m.py", "/b/venv/m.py"]);
    }

    #[test]
    fn rewrite_to_same_path_reports_unchanged() {
        let (_, changed) = rewrite_object(module("/a/venv/m.py"), "/a/venv/m.py");
        assert!(!changed);
    }

    #[test]
    fn roundtrip_returns_to_the_original_structure() {
        let header = CacheHeader::new(3439);
        let original = module("/a/venv/m.py");
        let bytes = compose(&header, &original).expect("compose");

        let (_, parsed) = read_cache(&bytes).expect("read");
        let (moved, _) = rewrite_object(parsed, "/b/venv/m.py");
        let (back, _) = rewrite_object(moved, "/a/venv/m.py");
        assert_eq!(back, original);
        assert_eq!(compose(&header, &back).expect("compose"), bytes);
    }

    #[test]
    fn rewrite_cache_preserves_the_header_verbatim() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("m.cpython-310.pyc");
        let mut header = CacheHeader::new(3439);
        // A populated timestamp field must be copied through untouched.
        header.raw[8..12].copy_from_slice(&0x6565_6565u32.to_le_bytes());
        std::fs::write(&path, compose(&header, &module("/a/venv/m.py")).expect("compose"))?;

        let changed = rewrite_cache(&path, "/b/venv/m.py", &Reporter::default())?;
        assert!(changed);
        let data = std::fs::read(&path)?;
        assert_eq!(&data[..HEADER_LEN], header.as_bytes());
        let (_, obj) = read_cache(&data).expect("read");
        let mut seen = Vec::new();
        filenames(&obj, &mut seen);
        assert!(seen.iter().all(|f| f == "/b/venv/m.py"));
        Ok(())
    }

    #[test]
    fn rewrite_cache_skips_writing_when_up_to_date() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("m.cpython-310.pyc");
        let header = CacheHeader::new(3439);
        std::fs::write(&path, compose(&header, &module("/b/venv/m.py")).expect("compose"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444))?;
        }
        let changed = rewrite_cache(&path, "/b/venv/m.py", &Reporter::default())?;
        assert!(!changed);
        Ok(())
    }

    #[test]
    fn garbage_fails_with_a_cache_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("bad.pyc");
        std::fs::write(&path, b"I am a very naughty pyc\n")?;
        let err = rewrite_cache(&path, "/b/venv/bad.py", &Reporter::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelocateError>(),
            Some(RelocateError::BadCache { .. })
        ));
        Ok(())
    }

    #[test]
    fn symlinked_caches_are_left_alone() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let lib = temp.path().join("lib");
        std::fs::create_dir_all(&lib)?;
        let shared = temp.path().join("shared.pyc");
        let header = CacheHeader::new(3439);
        std::fs::write(&shared, compose(&header, &module("/a/venv/s.py")).expect("compose"))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&shared, lib.join("s.pyc"))?;

        rewrite_tree(&lib, Path::new("/b/venv"), &Reporter::default())?;
        let (_, obj) = read_cache(&std::fs::read(&shared)?).expect("read");
        let mut seen = Vec::new();
        filenames(&obj, &mut seen);
        assert!(seen.iter().all(|f| f == "/a/venv/s.py"));
        Ok(())
    }

    #[test]
    fn tree_walk_re_roots_relative_to_the_lib_dir() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let lib = temp.path().join("lib/python3.10");
        let pycache = lib.join("site-packages/__pycache__");
        std::fs::create_dir_all(&pycache)?;
        let path = pycache.join("m.cpython-310.pyc");
        let header = CacheHeader::new(3439);
        std::fs::write(&path, compose(&header, &module("/a/venv/m.py")).expect("compose"))?;

        rewrite_tree(&lib, Path::new("/b/venv"), &Reporter::default())?;
        let (_, obj) = read_cache(&std::fs::read(&path)?).expect("read");
        let mut seen = Vec::new();
        filenames(&obj, &mut seen);
        assert!(seen
            .iter()
            .all(|f| f == "/b/venv/site-packages/__pycache__/m.cpython-310.pyc"));
        Ok(())
    }
}
