#![deny(clippy::all, warnings)]

mod core;

pub mod api;

pub mod pyc {
    pub use crate::core::pyc::*;
}

pub use crate::core::error::{EntryKind, RelocateError};
pub use crate::core::fs::realpath_if_exists;
pub use crate::core::layout::{Flavor, Virtualenv};
pub use crate::core::relocate::{relocate, RelocateOutcome, RelocateRequest};
pub use crate::core::report::Reporter;
