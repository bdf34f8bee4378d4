//! Internal implementation modules for `venvmv-core`.
//!
//! Most callers should go through `venvmv_core::api` rather than importing
//! these modules directly.

pub mod activation;
pub mod error;
pub mod fs;
pub mod layout;
pub mod pth;
pub mod pyc;
pub mod pyvenv;
pub mod relocate;
pub mod report;
pub mod scripts;
