//! Mathematical utilities: sparse incidence/derivative operators and the
//! weighted least-squares solve used by the refinement driver.

pub mod ols;
pub mod sparse;

pub use ols::*;
pub use sparse::*;
