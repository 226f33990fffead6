//! Path utilities.
//!
//! - [`fs`]: Filesystem path normalization (`normalize_path`, `join_within`)

pub mod fs;

pub use fs::{join_within, normalize_path, relative_to};
