//! Shared utilities across tartex modules.

pub mod files;
pub mod paths;

pub use files::{copy_with_dirs, ensure_parent_exists, mode_bits, mtime_secs};
pub use paths::{expand_tilde, extension, normalize, resolve, slash_path};
