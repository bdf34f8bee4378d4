use std::fs;
use std::path::PathBuf;

mod common;

use common::{make_venv, pyc_filenames, venvmv, write_pyc};

fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let base = temp.path().canonicalize().expect("canonical temp path");
    (temp, base)
}

#[test]
fn tolerates_non_script_entries_in_bin() {
    let (_temp, base) = canonical_tempdir();
    let before = base.join("before/venv");
    let after = base.join("after/venv");
    let venv = make_venv(&before, &before);

    fs::create_dir_all(venv.bin.join("im_a_directory")).expect("subdirectory");
    #[cfg(unix)]
    std::os::unix::fs::symlink("/i/dont/exist", venv.bin.join("bad_symlink"))
        .expect("dangling symlink");
    // Shebang-looking first bytes, but no interpreter token anywhere.
    fs::write(venv.bin.join("not-an-exe"), "#!\nohai").expect("decoy");

    venvmv()
        .arg("--update-path")
        .arg(&after)
        .arg(&before)
        .assert()
        .success();

    assert!(venv.bin.join("im_a_directory").is_dir());
    #[cfg(unix)]
    assert!(venv.bin.join("bad_symlink").symlink_metadata().is_ok());
    assert_eq!(fs::read(venv.bin.join("not-an-exe")).unwrap(), b"#!\nohai");
}

#[test]
fn foreign_and_relative_shebangs_stay_untouched() {
    let (_temp, base) = canonical_tempdir();
    let before = base.join("before/venv");
    let after = base.join("after/venv");
    let venv = make_venv(&before, &before);

    fs::write(venv.bin.join("bad_shebang"), "#!../bin/python\n").expect("relative shebang");
    fs::write(venv.bin.join("system_tool"), "#!/usr/bin/python\nimport os\n")
        .expect("foreign shebang");

    venvmv()
        .arg("--update-path")
        .arg(&after)
        .arg(&before)
        .assert()
        .success()
        .stdout(format!(
            "Updated: {} ({} -> {})\n",
            before.display(),
            before.display(),
            after.display()
        ));

    assert_eq!(
        fs::read(venv.bin.join("bad_shebang")).unwrap(),
        b"#!../bin/python\n"
    );
    assert_eq!(
        fs::read(venv.bin.join("system_tool")).unwrap(),
        b"#!/usr/bin/python\nimport os\n"
    );
}

#[test]
fn corrupt_cache_file_aborts_before_later_files() {
    let (_temp, base) = canonical_tempdir();
    let before = base.join("before/venv");
    let after = base.join("after/venv");
    let venv = make_venv(&before, &before);

    // Sorts before `site-packages`, so it is visited before the good cache.
    let bad = venv.lib.join("bad.pyc");
    fs::write(&bad, b"I am a very naughty pyc\n").expect("bad pyc");
    let good = venv.site.join("__pycache__/mymodule.cpython-310.pyc");
    let untouched = pyc_filenames(&good);

    let assert = venvmv()
        .arg("--update-path")
        .arg(&after)
        .arg(&before)
        .assert()
        .code(1)
        .stdout(format!("Error in {}\n", bad.display()));
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(
        stderr.contains("invalid bytecode cache"),
        "unexpected stderr: {stderr}"
    );
    assert_eq!(
        pyc_filenames(&good),
        untouched,
        "files ordered after the corrupt one must not be modified"
    );
    assert_eq!(
        fs::read(&bad).unwrap(),
        b"I am a very naughty pyc\n",
        "the corrupt file itself is left as evidence"
    );
}

#[test]
fn unsupported_cache_magic_aborts_too() {
    let (_temp, base) = canonical_tempdir();
    let before = base.join("before/venv");
    let after = base.join("after/venv");
    let venv = make_venv(&before, &before);

    // Valid framing, but a magic no supported interpreter uses.
    let odd = venv.lib.join("ancient.pyc");
    let mut data = Vec::new();
    data.extend_from_slice(&1234u16.to_le_bytes());
    data.extend_from_slice(b"\r\n");
    data.extend_from_slice(&[0; 12]);
    data.push(b'N');
    fs::write(&odd, data).expect("odd pyc");

    venvmv()
        .arg("--update-path")
        .arg(&after)
        .arg(&before)
        .assert()
        .code(1)
        .stdout(format!("Error in {}\n", odd.display()));
}

#[test]
fn symlinked_cache_files_are_skipped() {
    #[cfg(unix)]
    {
        let (_temp, base) = canonical_tempdir();
        let before = base.join("before/venv");
        let after = base.join("after/venv");
        let venv = make_venv(&before, &before);

        let shared = base.join("shared.pyc");
        write_pyc(&shared, "/shared/module.py");
        std::os::unix::fs::symlink(&shared, venv.site.join("__pycache__/os.pyc"))
            .expect("symlink cache");

        venvmv()
            .arg("--update-path")
            .arg(&after)
            .arg(&before)
            .assert()
            .success();
        assert_eq!(pyc_filenames(&shared), vec!["/shared/module.py"; 2]);
    }
}

#[test]
fn non_absolute_update_path_is_a_usage_error() {
    venvmv()
        .args(["--update-path", "notabs"])
        .assert()
        .code(1)
        .stdout("--update-path must be absolute: notabs\n");
}

#[test]
fn non_absolute_base_python_dir_is_a_usage_error() {
    venvmv()
        .args(["--update-path", "/abs/new", "--base-python-dir", "."])
        .assert()
        .code(1)
        .stdout("--base-python-dir must be absolute: .\n");
}
