use std::path::Path;

/// One-letter tags for the verbose change listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeTag {
    Activation,
    Script,
    Bytecode,
    Manifest,
    RemovedDir,
}

impl ChangeTag {
    fn letter(self) -> char {
        match self {
            ChangeTag::Activation => 'A',
            ChangeTag::Script => 'S',
            ChangeTag::Bytecode => 'B',
            ChangeTag::Manifest => 'P',
            ChangeTag::RemovedDir => 'D',
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ChangeTag::Activation => "activation script",
            ChangeTag::Script => "script",
            ChangeTag::Bytecode => "bytecode cache",
            ChangeTag::Manifest => "path manifest",
            ChangeTag::RemovedDir => "directory",
        }
    }
}

/// Emits the per-file change listing.
///
/// Threaded through every rewriter so verbosity is explicit configuration
/// rather than process-wide state. The tagged lines are part of the stdout
/// contract; tracing events carry the same information for log consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    verbose: bool,
}

impl Reporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub(crate) fn changed(&self, tag: ChangeTag, path: &Path) {
        tracing::debug!(kind = tag.describe(), path = %path.display(), "changed");
        if self.verbose {
            println!("{} {}", tag.letter(), path.display());
        }
    }

    /// Printed on the contract stream even without verbose mode, immediately
    /// before the underlying cache error propagates.
    pub(crate) fn cache_error(&self, path: &Path) {
        tracing::warn!(path = %path.display(), "unreadable bytecode cache");
        println!("Error in {}", path.display());
    }
}
