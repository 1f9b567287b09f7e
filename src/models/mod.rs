//! Scale-model seam.
//!
//! The engine only needs a model's scale factors and their parameter
//! derivatives for a block of observations; the analytical form lives behind
//! the `ScaleModel` trait. `PhysicalModel` is a small reference implementation
//! used by the binary and the tests.

pub mod model;

pub use model::*;
