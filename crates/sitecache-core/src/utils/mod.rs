//! Formatting helpers shared by the library and the CLI.

pub mod format;

pub use format::{age_display, format_bytes, truncate_string};
