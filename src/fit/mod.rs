//! Refinement side of the engine.
//!
//! - `apm`: parameter vector, per-dataset parameter blocks, derivative matrix
//! - `target`: residuals, gradient and Jacobian over a scaler's grouping table
//! - `refine`: the damped Gauss-Newton loop the binary drives the target with

pub mod apm;
pub mod refine;
pub mod target;

pub use apm::*;
pub use refine::*;
pub use target::*;
