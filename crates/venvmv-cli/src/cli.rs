use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Move an existing Python virtualenv without reinstalling packages.",
    after_help = "Examples:\n  venvmv --update-path /srv/app/venv /tmp/build/venv\n  venvmv --update-path auto /srv/app/venv\n  WORKON_HOME=~/.virtualenvs venvmv --update-path myenv\n"
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "New absolute prefix for the environment, \"auto\" to use the absolute form of PATH, or a registered name when WORKON_HOME is set"
    )]
    pub update_path: String,
    #[arg(
        long,
        value_name = "DIR",
        help = "Absolute base interpreter directory to record in pyvenv.cfg (omitted or \"auto\" leaves the file untouched)"
    )]
    pub base_python_dir: Option<String>,
    #[arg(
        long,
        help = "Rewrite even when the recorded path already matches the update path"
    )]
    pub force: bool,
    #[arg(short, long, help = "List changed files (A/S/B/P/D tags)")]
    pub verbose: bool,
    #[arg(
        value_name = "PATH",
        default_value = ".",
        help = "Virtualenv directory to update"
    )]
    pub path: PathBuf,
}
