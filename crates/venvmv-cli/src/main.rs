#![deny(clippy::all, warnings)]

use std::env;
use std::path::{Path, PathBuf};

use clap::Parser;
use venvmv_core::{
    realpath_if_exists, relocate, RelocateError, RelocateOutcome, RelocateRequest, Reporter,
};

mod cli;

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    std::process::exit(run(&cli));
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = format!("venvmv={level},venvmv_core={level}");
    // Diagnostics go to stderr; stdout carries only the command's output
    // contract.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli) -> i32 {
    let mut registry_env = false;
    let update_path = if cli.update_path == "auto" {
        absolute(&cli.path)
    } else {
        match env::var_os("WORKON_HOME") {
            // Joining an absolute --update-path leaves it unchanged, so the
            // registry only ever resolves short names.
            Some(home) => {
                registry_env = true;
                PathBuf::from(home).join(&cli.update_path)
            }
            None => PathBuf::from(&cli.update_path),
        }
    };
    if !update_path.is_absolute() {
        println!("--update-path must be absolute: {}", update_path.display());
        return 1;
    }
    let update_path = realpath_if_exists(&update_path);

    let base_python_dir = match cli.base_python_dir.as_deref() {
        None | Some("auto") => None,
        Some(dir) => {
            let dir = Path::new(dir);
            if !dir.is_absolute() {
                println!("--base-python-dir must be absolute: {}", dir.display());
                return 1;
            }
            Some(dir.to_path_buf())
        }
    };

    let venv_path = if registry_env {
        update_path.clone()
    } else {
        realpath_if_exists(&cli.path)
    };

    let request = RelocateRequest {
        venv_path,
        update_path,
        base_python_dir,
        force: cli.force,
    };
    let reporter = Reporter::new(cli.verbose);

    match relocate(&request, &reporter) {
        Ok(RelocateOutcome::UpToDate { root, update_path }) => {
            println!(
                "Already up-to-date: {} ({})",
                root.display(),
                update_path.display()
            );
            0
        }
        Ok(RelocateOutcome::Updated { root, orig, new }) => {
            println!(
                "Updated: {} ({} -> {})",
                root.display(),
                orig.display(),
                new.display()
            );
            0
        }
        Err(err) => {
            // Classification errors are part of the stdout contract; anything
            // else is an operational failure and goes to stderr.
            match err.downcast_ref::<RelocateError>() {
                Some(classification @ RelocateError::NotAVirtualenv { .. }) => {
                    println!("{classification}");
                }
                _ => eprintln!("venvmv: {err:#}"),
            }
            1
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
