// Intended public API surface for `venvmv-core`.
//
// This module exists to keep the crate root small and make it explicit which
// types/functions are part of the stable interface used by the CLI and the
// integration tests.

pub use crate::core::error::{EntryKind, RelocateError};
pub use crate::core::fs::realpath_if_exists;
pub use crate::core::layout::{Flavor, Virtualenv};
pub use crate::core::pyc::marshal::{Code, CodeLayout, MarshalError, Obj, StrKind, Value};
pub use crate::core::pyc::{compose, read_cache, CacheError, CacheHeader, HEADER_LEN};
pub use crate::core::relocate::{relocate, RelocateOutcome, RelocateRequest};
pub use crate::core::report::Reporter;
