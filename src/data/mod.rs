//! Input data for the driver.
//!
//! The engine consumes experiments and reflection tables; the binary feeds it
//! reproducible synthetic datasets with known per-dataset scales.

pub mod sample;

pub use sample::*;
