//! Input/output helpers.
//!
//! - scaling options from JSON (`config`)
//! - run summary export to JSON (`export`)

pub mod config;
pub mod export;

pub use config::*;
pub use export::*;
