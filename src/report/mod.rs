//! Terminal reporting.
//!
//! Formatting lives here so the engine and the pipeline stay free of
//! presentation concerns.

pub mod format;

pub use format::*;
