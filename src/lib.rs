//! `refl-scale` library crate.
//!
//! Scales symmetry-related diffraction intensities from one or more datasets
//! onto a common scale. The binary (`rscale`) is a thin wrapper so that:
//!
//! - the engine is testable without spawning processes
//! - the grouping table, target and scaler layers stay reusable on their own

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
pub mod scaler;
pub mod table;
