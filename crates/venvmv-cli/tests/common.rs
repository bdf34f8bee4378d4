#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use venvmv_core::api::{compose, read_cache, CacheHeader, Code, Obj, StrKind, Value};

/// CPython 3.10 cache magic; selects the 3.8–3.10 code layout.
pub const MAGIC_PY310: u16 = 3439;

pub fn venvmv() -> Command {
    let mut cmd = Command::cargo_bin("venvmv").expect("venvmv binary");
    // The registry variable must not leak in from the developer's shell.
    cmd.env_remove("WORKON_HOME");
    cmd
}

pub struct Fixture {
    pub root: PathBuf,
    pub bin: PathBuf,
    pub lib: PathBuf,
    pub site: PathBuf,
}

/// Build a synthetic POSIX virtualenv at `root` whose embedded paths all
/// reference `recorded`: activation scripts for three dialects, a shebanged
/// console script, a native-looking interpreter, one bytecode cache, one
/// path manifest, and a pyvenv.cfg.
pub fn make_venv(root: &Path, recorded: &Path) -> Fixture {
    let bin = root.join("bin");
    let lib = root.join("lib/python3.10");
    let site = lib.join("site-packages");
    fs::create_dir_all(&bin).expect("create bin");
    fs::create_dir_all(&site).expect("create site-packages");

    fs::write(bin.join("activate"), posix_activate(recorded)).expect("write activate");
    fs::write(
        bin.join("activate.csh"),
        format!("setenv VIRTUAL_ENV \"{}\"\nrehash\n", recorded.display()),
    )
    .expect("write activate.csh");
    fs::write(
        bin.join("activate.fish"),
        format!("set -gx VIRTUAL_ENV \"{}\"\n", recorded.display()),
    )
    .expect("write activate.fish");
    fs::write(
        bin.join("pip"),
        format!(
            "#!{}/bin/python\n# EASY-INSTALL-ENTRY-SCRIPT\nimport sys\n",
            recorded.display()
        ),
    )
    .expect("write pip");
    fs::write(bin.join("python"), b"\x7fELF\x02\x01\x01\x00not a script")
        .expect("write python");

    let pycache = site.join("__pycache__");
    fs::create_dir_all(&pycache).expect("create __pycache__");
    write_pyc(
        &pycache.join("mymodule.cpython-310.pyc"),
        &format!("{}/src/mymodule.py", recorded.display()),
    );
    fs::write(
        site.join("mymodule.pth"),
        format!("{}/src\n", recorded.display()),
    )
    .expect("write pth");
    fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\nversion = 3.10.12\n")
        .expect("write pyvenv.cfg");

    Fixture {
        root: root.to_path_buf(),
        bin,
        lib,
        site,
    }
}

pub fn posix_activate(recorded: &Path) -> String {
    format!(
        "# This file must be used with \"source bin/activate\"\n\
         deactivate () {{\n    unset VIRTUAL_ENV\n}}\n\
         VIRTUAL_ENV=\"{}\"\n\
         export VIRTUAL_ENV\n\
         PATH=\"$VIRTUAL_ENV/bin:$PATH\"\n\
         export PATH\n",
        recorded.display()
    )
}

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

/// A cache file for a module with one nested function, both recording
/// `source` as their origin.
pub fn write_pyc(path: &Path, source: &str) {
    let module = code_obj(
        source,
        "<module>",
        vec![
            code_obj(source, "greet", vec![Obj::plain(Value::None)]),
            str_obj(StrKind::ShortAscii, "mymodule docstring"),
        ],
    );
    let bytes = compose(&CacheHeader::new(MAGIC_PY310), &module).expect("compose pyc");
    fs::write(path, bytes).expect("write pyc");
}

/// Every `co_filename` reachable from the cache file's top-level object.
pub fn pyc_filenames(path: &Path) -> Vec<String> {
    let data = fs::read(path).expect("read pyc");
    let (_, obj) = read_cache(&data).expect("parse pyc");
    let mut seen = Vec::new();
    collect_filenames(&obj, &mut seen);
    seen
}

fn collect_filenames(obj: &Obj, out: &mut Vec<String>) {
    if let Value::Code(code) = &obj.value {
        if let Value::Str { bytes, .. } = &code.filename.value {
            out.push(String::from_utf8_lossy(bytes).into_owned());
        }
        if let Value::Tuple { items, .. } = &code.consts.value {
            for item in items {
                collect_filenames(item, out);
            }
        }
    }
}

/// Byte-level snapshot of every regular file under `dir`, for idempotence
/// assertions.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    collect_files(dir, dir, &mut files);
    files
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in fs::read_dir(dir).expect("list dir") {
        let entry = entry.expect("dir entry");
        let path = entry.path();
        let file_type = entry.file_type().expect("file type");
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_files(root, &path, out);
        } else {
            let rel = path.strip_prefix(root).expect("under root").to_path_buf();
            out.insert(rel, fs::read(&path).expect("read file"));
        }
    }
}
