//! Damped Gauss-Newton driver.
//!
//! This is the minimizer the binary uses to exercise the engine contract end
//! to end. It only talks to the target through the residual/Jacobian/weight
//! convention plus the restraint rows:
//!
//! - solve `min Σ w (r - J δ)² + λ Σ d δ²` for the step
//! - accept the step if the objective drops, otherwise revert and raise `λ`
//! - stop when the relative objective change or the relative step size falls
//!   below `tolerance`

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ScaleError, ScaleResult};
use crate::fit::ScalingTarget;
use crate::math::{damped_gauss_newton_step, to_dense};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance: 1e-8,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefineReport {
    pub iterations: usize,
    pub converged: bool,
    pub rmsd_history: Vec<f64>,
    pub objective: f64,
    pub parameters: Vec<f64>,
}

/// Objective including any restraint.
fn total_objective(target: &ScalingTarget<'_>) -> ScaleResult<f64> {
    let (f, _) = target.compute_functional_gradients()?;
    let restraint = target
        .compute_restraints_functional_gradients_and_curvatures()
        .map_or(0.0, |(value, _, _)| value);
    Ok(f + restraint)
}

/// Stack observation rows and restraint rows into one dense system.
fn assemble_system(target: &ScalingTarget<'_>) -> ScaleResult<(DMatrix<f64>, DVector<f64>, DVector<f64>)> {
    let residuals = target.raw_residuals();
    let jacobian = to_dense(&target.jacobian()?);
    let weights = target.weights().clone();

    let Some(rows) = target.compute_restraints_residuals_and_gradients()? else {
        return Ok((jacobian, residuals, weights));
    };
    let n = jacobian.nrows();
    let m = rows.residuals.len();
    let p = jacobian.ncols();

    let mut j = DMatrix::<f64>::zeros(n + m, p);
    j.view_mut((0, 0), (n, p)).copy_from(&jacobian);
    j.view_mut((n, 0), (m, p)).copy_from(&to_dense(&rows.jacobian));

    let mut r = DVector::<f64>::zeros(n + m);
    r.rows_mut(0, n).copy_from(&residuals);
    r.rows_mut(n, m).copy_from(&(-&rows.residuals));

    let mut w = DVector::<f64>::zeros(n + m);
    w.rows_mut(0, n).copy_from(&weights);
    w.rows_mut(n, m).copy_from(&rows.weights);
    Ok((j, r, w))
}

pub fn refine(target: &mut ScalingTarget<'_>, opts: &RefineOptions) -> ScaleResult<RefineReport> {
    if target.apm().n_active_params() == 0 {
        target.predict()?;
        let objective = total_objective(target)?;
        return Ok(RefineReport {
            iterations: 0,
            converged: true,
            rmsd_history: vec![target.rmsd()],
            objective,
            parameters: Vec::new(),
        });
    }

    target.predict()?;
    let mut x = target.apm().x().clone();
    let mut objective = total_objective(target)?;
    let mut lambda = opts.initial_lambda;
    let mut rmsd_history = vec![target.rmsd()];
    let mut converged = false;
    let mut iterations = 0;

    while iterations < opts.max_iterations {
        iterations += 1;
        let (j, r, w) = assemble_system(target)?;
        let step = damped_gauss_newton_step(&j, &r, &w, lambda)
            .ok_or_else(|| ScaleError::invalid("normal equations could not be solved"))?;
        if step.norm() <= opts.tolerance * (x.norm() + opts.tolerance) {
            converged = true;
            break;
        }

        let trial = &x + &step;
        target.update_for_minimisation(&trial)?;
        let trial_objective = total_objective(target)?;

        if trial_objective.is_finite() && trial_objective <= objective {
            let change = (objective - trial_objective) / objective.abs().max(f64::MIN_POSITIVE);
            x = trial;
            objective = trial_objective;
            lambda = (lambda / 10.0).max(1e-12);
            rmsd_history.push(target.rmsd());
            debug!(
                "iteration {iterations}: objective {objective:.6e}, rmsd {:.6}, lambda {lambda:.1e}",
                target.rmsd()
            );
            if change < opts.tolerance {
                converged = true;
                break;
            }
        } else {
            target.update_for_minimisation(&x)?;
            lambda *= 10.0;
            debug!("iteration {iterations}: step rejected, lambda {lambda:.1e}");
            if lambda > 1e12 {
                converged = true;
                break;
            }
        }
    }

    info!(
        "Refinement finished after {iterations} iterations (converged: {converged}), final rmsd {:.6}",
        target.rmsd()
    );
    Ok(RefineReport {
        iterations,
        converged,
        rmsd_history,
        objective,
        parameters: x.iter().copied().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Experiment, GroupKey, Intensity, Observation, ReflectionTable, WeightingScheme,
    };
    use crate::models::{PhysicalModel, ScaleModel};
    use crate::scaler::{DatasetRole, DatasetScaler, Scaler, TargetScaler};

    fn dataset(id: &str, scale: f64, role: DatasetRole) -> DatasetScaler {
        let truth = [100.0, 40.0, 250.0, 75.0, 10.0];
        let observations = truth
            .iter()
            .enumerate()
            .map(|(h, &i)| Observation::new(GroupKey(h as i32, 0, 0), Intensity::new(i * scale, 1.0)))
            .collect();
        DatasetScaler::new(
            Experiment::new(id, role == DatasetRole::Fixed),
            ReflectionTable::new(id, observations),
            role,
            WeightingScheme::Unity,
        )
        .unwrap()
    }

    fn scale_only(_: &DatasetScaler) -> Box<dyn ScaleModel> {
        Box::new(PhysicalModel::scale_only())
    }

    #[test]
    fn recovers_relative_scale_against_a_reference() {
        let refined = dataset("b", 2.5, DatasetRole::Refined);
        let fixed = dataset("a", 1.0, DatasetRole::Fixed);
        let mut scaler = Scaler::Target(TargetScaler::new(vec![refined], vec![fixed]).unwrap());
        let mut apm = scaler.parameter_manager(scale_only).unwrap();
        let mut target = ScalingTarget::new(&mut scaler, &mut apm);

        let report = refine(&mut target, &RefineOptions::default()).unwrap();
        assert!(report.converged);
        assert!((report.parameters[0] - 2.5).abs() < 1e-6, "{:?}", report.parameters);
        assert!(report.rmsd_history.last().unwrap() < &1e-6);
        assert!(report.rmsd_history[0] > 1.0);
    }

    #[test]
    fn nothing_to_refine_reports_current_state() {
        let mut scaler = Scaler::Null(dataset("a", 1.0, DatasetRole::Fixed));
        let mut apm = scaler.parameter_manager(scale_only).unwrap();
        let mut target = ScalingTarget::new(&mut scaler, &mut apm);
        let report = refine(&mut target, &RefineOptions::default()).unwrap();
        assert_eq!(report.iterations, 0);
        assert!(report.parameters.is_empty());
    }
}
