//! Scaling target: residuals, gradient and Jacobian for the minimizer.
//!
//! With `g` the inverse scale factors, `w` the weights, `Ih` the group
//! estimates expanded to observations and `D = ∂g/∂p`:
//!
//! ```text
//! R      = w (I - g Ih)²                      objective = Σ R
//! ∂Ih/∂p = reduce(D ∘ (I - 2 g Ih) w) / reduce(w g²)
//! ∇      = Dᵀ(-2 rhl w Ih) + (∂Ih/∂p)ᵀ reduce(-2 rhl w g),   rhl = I - g Ih
//! J[:,k] = Ih D[:,k] + g expand(∂Ih/∂p[:,k])   (J = ∂(g Ih)/∂p)
//! ```
//!
//! `Ih` is itself a function of the parameters, so the second term of both the
//! gradient and the Jacobian is required. Observations in groups without a
//! defined `Ih` contribute nothing.
//!
//! Both minimizer conventions (value + gradient, residuals + Jacobian +
//! weights) are thin wrappers over the free functions below, evaluated on the
//! scaler's table as of the last `update_for_minimisation`.

use faer::sparse::Triplet;
use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{ScaleError, ScaleResult};
use crate::fit::ActiveParameterManager;
use crate::math::{SparseMatrix, column, from_triplets};
use crate::models::ABSORPTION_COMPONENT;
use crate::scaler::Scaler;
use crate::table::IhTable;

pub const RMSD_NAMES: [&str; 1] = ["RMSD_I"];
pub const RMSD_UNITS: [&str; 1] = ["a.u"];

/// `∂Ih/∂p` for one parameter: sorted `(group, value)` pairs.
type IhDerivativeColumn = Vec<(usize, f64)>;

fn check_shape(table: &IhTable, derivatives: &SparseMatrix) -> ScaleResult<()> {
    if derivatives.nrows() != table.size() {
        return Err(ScaleError::invalid(format!(
            "derivative matrix has {} rows, table has {} observations",
            derivatives.nrows(),
            table.size()
        )));
    }
    Ok(())
}

/// `I - g Ih`, zero for observations in inactive groups.
pub fn raw_residuals(table: &IhTable) -> DVector<f64> {
    let rhl = table.intensities() - table.ih_values().component_mul(table.scale_factors());
    rhl.component_mul(&table.active_mask())
}

/// `w (I - g Ih)²` per observation.
pub fn residuals(table: &IhTable) -> DVector<f64> {
    let rhl = raw_residuals(table);
    rhl.component_mul(&rhl).component_mul(table.weights())
}

/// `sqrt(Σ rhl² / n)`.
pub fn rmsd(table: &IhTable) -> f64 {
    let n = table.size();
    if n == 0 {
        return 0.0;
    }
    (raw_residuals(table).norm_squared() / n as f64).sqrt()
}

fn ih_derivatives(table: &IhTable, derivatives: &SparseMatrix) -> Vec<IhDerivativeColumn> {
    let g = table.scale_factors();
    let dih_raw = (table.intensities() - table.ih_values().component_mul(g) * 2.0).component_mul(table.weights());
    let group_of = table.group_of();
    let sum_gsq = table.sum_gsq_weights();

    (0..derivatives.ncols())
        .into_par_iter()
        .map(|k| {
            let mut entries: Vec<(usize, f64)> = column(derivatives, k)
                .map(|(row, d)| (group_of[row], d * dih_raw[row]))
                .collect();
            // Stable, so each group's sum runs in row order.
            entries.sort_by_key(|&(group, _)| group);

            let mut merged: IhDerivativeColumn = Vec::with_capacity(entries.len());
            for (group, value) in entries {
                match merged.last_mut() {
                    Some((last, acc)) if *last == group => *acc += value,
                    _ => merged.push((group, value)),
                }
            }
            merged
                .into_iter()
                .filter(|&(group, _)| table.is_group_active(group))
                .map(|(group, value)| (group, value / sum_gsq[group]))
                .collect()
        })
        .collect()
}

/// Gradient of `Σ R` with respect to the parameters.
pub fn gradient(table: &IhTable, derivatives: &SparseMatrix) -> ScaleResult<DVector<f64>> {
    check_shape(table, derivatives)?;
    let dih_dp = ih_derivatives(table, derivatives);

    let rhl_w = raw_residuals(table).component_mul(table.weights()) * -2.0;
    let direct = rhl_w.component_mul(table.ih_values());
    let indirect = table.reduce(&rhl_w.component_mul(table.scale_factors()));

    let values: Vec<f64> = (0..derivatives.ncols())
        .into_par_iter()
        .map(|k| {
            let term_1: f64 = column(derivatives, k).map(|(row, d)| d * direct[row]).sum();
            let term_2: f64 = dih_dp[k].iter().map(|&(group, v)| v * indirect[group]).sum();
            term_1 + term_2
        })
        .collect();
    Ok(DVector::from_vec(values))
}

/// `∂(g Ih)/∂p`, `n_obs x n_params`.
pub fn jacobian(table: &IhTable, derivatives: &SparseMatrix) -> ScaleResult<SparseMatrix> {
    check_shape(table, derivatives)?;
    let dih_dp = ih_derivatives(table, derivatives);

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); table.n_groups()];
    for (row, &group) in table.group_of().iter().enumerate() {
        members[group].push(row);
    }
    let ih = table.ih_values();
    let g = table.scale_factors();

    let columns: Vec<Vec<Triplet<usize, usize, f64>>> = (0..derivatives.ncols())
        .into_par_iter()
        .map(|k| {
            let mut col: Vec<Triplet<usize, usize, f64>> = column(derivatives, k)
                .map(|(row, d)| Triplet::new(row, k, ih[row] * d))
                .collect();
            for &(group, v) in &dih_dp[k] {
                col.extend(members[group].iter().map(|&row| Triplet::new(row, k, g[row] * v)));
            }
            col
        })
        .collect();

    let triplets: Vec<_> = columns.into_iter().flatten().collect();
    from_triplets(table.size(), derivatives.ncols(), &triplets)
}

/// Restraint rows for a Gauss-Newton minimizer: residuals are the restrained
/// values (target zero), each Jacobian row is a unit vector on its parameter.
#[derive(Debug, Clone)]
pub struct RestraintRows {
    pub residuals: DVector<f64>,
    pub jacobian: SparseMatrix,
    pub weights: DVector<f64>,
}

pub struct ScalingTarget<'a> {
    scaler: &'a mut Scaler,
    apm: &'a mut ActiveParameterManager,
    rmsds: Option<Vec<f64>>,
}

impl<'a> ScalingTarget<'a> {
    pub fn new(scaler: &'a mut Scaler, apm: &'a mut ActiveParameterManager) -> Self {
        Self {
            scaler,
            apm,
            rmsds: None,
        }
    }

    /// Recompute scale factors and `Ih` from the manager's current parameters.
    pub fn predict(&mut self) -> ScaleResult<()> {
        self.rmsds = None;
        self.scaler.update_for_minimisation(self.apm)
    }

    /// Install new parameters and recompute. Must precede any residual or
    /// derivative call after the parameters change.
    pub fn update_for_minimisation(&mut self, parameters: &DVector<f64>) -> ScaleResult<()> {
        self.apm.set_x(parameters)?;
        self.predict()
    }

    pub fn scaler(&self) -> &Scaler {
        &*self.scaler
    }

    pub fn apm(&self) -> &ActiveParameterManager {
        &*self.apm
    }

    fn table(&self) -> &IhTable {
        self.scaler.ih_table()
    }

    pub fn num_observations(&self) -> usize {
        self.table().size()
    }

    pub fn get_num_matches(&self) -> usize {
        self.num_observations()
    }

    /// Unweighted RMSD, cached until the next update.
    pub fn rmsds(&mut self) -> &[f64] {
        let table = self.scaler.ih_table();
        self.rmsds.get_or_insert_with(|| vec![rmsd(table)])
    }

    pub fn rmsd(&mut self) -> f64 {
        self.rmsds()[0]
    }

    /// Convergence is left to the minimizer's own criteria.
    pub fn achieved(&self) -> bool {
        false
    }

    pub fn raw_residuals(&self) -> DVector<f64> {
        raw_residuals(self.table())
    }

    pub fn residuals(&self) -> DVector<f64> {
        residuals(self.table())
    }

    pub fn weights(&self) -> &DVector<f64> {
        self.table().weights()
    }

    pub fn gradient(&self) -> ScaleResult<DVector<f64>> {
        gradient(self.table(), self.apm.derivatives()?)
    }

    pub fn jacobian(&self) -> ScaleResult<SparseMatrix> {
        jacobian(self.table(), self.apm.derivatives()?)
    }

    pub fn compute_functional_gradients(&self) -> ScaleResult<(f64, DVector<f64>)> {
        Ok((self.residuals().sum(), self.gradient()?))
    }

    /// Curvatures are not available.
    pub fn compute_functional_gradients_and_curvatures(
        &self,
    ) -> ScaleResult<(f64, DVector<f64>, Option<DVector<f64>>)> {
        let (f, g) = self.compute_functional_gradients()?;
        Ok((f, g, None))
    }

    /// Restraint functional and gradient, when an absorption component is active.
    pub fn compute_restraints_functional_gradients_and_curvatures(
        &self,
    ) -> Option<(f64, DVector<f64>, Option<DVector<f64>>)> {
        if !self.apm.has_component(ABSORPTION_COMPONENT) {
            return None;
        }
        let restraint = self.apm.restraints()?;
        Some((restraint.functional(), restraint.gradient, None))
    }

    pub fn compute_residuals(&self) -> (DVector<f64>, DVector<f64>) {
        (self.residuals(), self.weights().clone())
    }

    /// The Jacobian is `∂(g·Ih)/∂p`, the derivative of the unsquared
    /// `rhl = I - g·Ih` (up to sign), and pairs with `raw_residuals` and the
    /// returned weights. It is not the derivative of the squared `R = w·rhl²`
    /// also returned here.
    pub fn compute_residuals_and_gradients(&self) -> ScaleResult<(DVector<f64>, SparseMatrix, DVector<f64>)> {
        Ok((self.residuals(), self.jacobian()?, self.weights().clone()))
    }

    pub fn compute_restraints_residuals_and_gradients(&self) -> ScaleResult<Option<RestraintRows>> {
        if !self.apm.has_component(ABSORPTION_COMPONENT) {
            return Ok(None);
        }
        let Some(restraint) = self.apm.restraints() else {
            return Ok(None);
        };
        let triplets: Vec<_> = restraint
            .params
            .iter()
            .enumerate()
            .map(|(row, &param)| Triplet::new(row, param, 1.0))
            .collect();
        let jacobian = from_triplets(restraint.params.len(), self.apm.n_active_params(), &triplets)?;
        Ok(Some(RestraintRows {
            residuals: restraint.values,
            jacobian,
            weights: restraint.weights,
        }))
    }
}
