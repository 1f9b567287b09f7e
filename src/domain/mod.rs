//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - observations and per-dataset reflection tables (`Observation`, `ReflectionTable`)
//! - experiment metadata (`Experiment`, `ScalingModelInfo`)
//! - run configuration (`ScalingConfig`, `IntensityChoice`, `WeightingScheme`)

pub mod types;

pub use types::*;
