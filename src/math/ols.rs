//! Weighted least squares solver.
//!
//! The refinement driver repeatedly solves the damped Gauss-Newton system
//!
//! ```text
//! minimize Σ w_i (r_i - J_i δ)^2 + λ Σ_k d_k δ_k^2
//! ```
//!
//! Implementation choices:
//! - We scale rows by `sqrt(w_i)` and solve an ordinary least squares problem.
//! - Damping is expressed as extra rows `sqrt(λ d_k) e_k` rather than by forming
//!   the normal equations, so the conditioning of `J` is not squared.
//! - SVD keeps the solve robust for tall and nearly rank-deficient systems.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// One Levenberg-Marquardt step `δ` for residuals `r = y - f(p)` with
/// Jacobian `J = ∂f/∂p`.
///
/// Damping is scaled by the diagonal of `JᵀWJ` (Marquardt scaling); a zero
/// diagonal entry falls back to unit damping so unidentified parameters stay put.
pub fn damped_gauss_newton_step(
    jacobian: &DMatrix<f64>,
    residuals: &DVector<f64>,
    weights: &DVector<f64>,
    lambda: f64,
) -> Option<DVector<f64>> {
    let n = jacobian.nrows();
    let p = jacobian.ncols();
    if residuals.len() != n || weights.len() != n {
        return None;
    }

    let mut xw = DMatrix::<f64>::zeros(n + p, p);
    let mut yw = DVector::<f64>::zeros(n + p);
    for i in 0..n {
        let sw = weights[i].max(0.0).sqrt();
        for k in 0..p {
            xw[(i, k)] = jacobian[(i, k)] * sw;
        }
        yw[i] = residuals[i] * sw;
    }

    let lambda = lambda.max(0.0);
    for k in 0..p {
        let diag: f64 = (0..n).map(|i| weights[i] * jacobian[(i, k)].powi(2)).sum();
        let d = if diag > 0.0 { diag } else { 1.0 };
        xw[(n + k, k)] = (lambda * d).sqrt();
    }

    solve_least_squares(&xw, &yw)
}
