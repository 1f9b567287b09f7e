//! Scale model evaluation.
//!
//! A model turns a parameter slice into one inverse scale factor per
//! observation plus the sparse derivative block `∂g/∂p`:
//!
//! ```text
//! g(o) = k · exp(B / (2 d²)) · (1 + Σ_l c_l s_l(o))
//! ```
//!
//! where `s_l(o)` are absorption-surface basis values computed upstream.

use faer::sparse::Triplet;
use nalgebra::DVector;

use crate::domain::Observation;
use crate::error::{ScaleError, ScaleResult};

pub const SCALE_COMPONENT: &str = "scale";
pub const DECAY_COMPONENT: &str = "decay";
pub const ABSORPTION_COMPONENT: &str = "absorption";

/// Scale factors and their derivatives for one block of observations.
///
/// Derivative triplets use block-local indices: `row` indexes the observation
/// slice passed to `evaluate`, `col` the model's own parameter slice.
#[derive(Debug, Clone)]
pub struct ScaleEvaluation {
    pub scales: Vec<f64>,
    pub derivatives: Vec<Triplet<usize, usize, f64>>,
}

/// Penalty on a subset of parameters.
///
/// `values` are the raw restrained quantities (target zero); the functional
/// contribution is `Σ weights · values²`.
#[derive(Debug, Clone)]
pub struct Restraint {
    /// Indices of the restrained parameters.
    pub params: Vec<usize>,
    pub values: DVector<f64>,
    pub weights: DVector<f64>,
    /// Gradient of the functional over the full parameter vector.
    pub gradient: DVector<f64>,
}

impl Restraint {
    /// Per-restraint functional terms `w · v²`.
    pub fn residuals(&self) -> DVector<f64> {
        self.values
            .component_mul(&self.values)
            .component_mul(&self.weights)
    }

    pub fn functional(&self) -> f64 {
        self.residuals().sum()
    }
}

pub trait ScaleModel: Send + Sync {
    fn id(&self) -> &str;

    /// Names of the active components.
    fn components(&self) -> Vec<String>;

    fn initial_parameters(&self) -> Vec<f64>;

    fn n_params(&self) -> usize {
        self.initial_parameters().len()
    }

    fn evaluate(&self, params: &[f64], observations: &[&Observation]) -> ScaleResult<ScaleEvaluation>;

    /// Optional parameter restraint, in the model's local parameter indices.
    fn restraint(&self, _params: &[f64]) -> Option<Restraint> {
        None
    }
}

/// Overall scale, optional B-factor decay and optional absorption surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalModel {
    pub initial_scale: f64,
    pub decay: bool,
    pub absorption_terms: usize,
    pub surface_weight: f64,
}

impl Default for PhysicalModel {
    fn default() -> Self {
        Self {
            initial_scale: 1.0,
            decay: true,
            absorption_terms: 0,
            surface_weight: 1e6,
        }
    }
}

impl PhysicalModel {
    pub fn scale_only() -> Self {
        Self {
            decay: false,
            ..Self::default()
        }
    }

    pub fn with_absorption(mut self, terms: usize, surface_weight: f64) -> Self {
        self.absorption_terms = terms;
        self.surface_weight = surface_weight;
        self
    }

    fn decay_index(&self) -> Option<usize> {
        self.decay.then_some(1)
    }

    fn absorption_offset(&self) -> usize {
        1 + usize::from(self.decay)
    }
}

impl ScaleModel for PhysicalModel {
    fn id(&self) -> &str {
        "physical"
    }

    fn components(&self) -> Vec<String> {
        let mut out = vec![SCALE_COMPONENT.to_string()];
        if self.decay {
            out.push(DECAY_COMPONENT.to_string());
        }
        if self.absorption_terms > 0 {
            out.push(ABSORPTION_COMPONENT.to_string());
        }
        out
    }

    fn initial_parameters(&self) -> Vec<f64> {
        let mut x = vec![self.initial_scale];
        if self.decay {
            x.push(0.0);
        }
        x.extend(std::iter::repeat_n(0.0, self.absorption_terms));
        x
    }

    fn evaluate(&self, params: &[f64], observations: &[&Observation]) -> ScaleResult<ScaleEvaluation> {
        if params.len() != self.n_params() {
            return Err(ScaleError::invalid(format!(
                "physical model expects {} parameters, got {}",
                self.n_params(),
                params.len()
            )));
        }

        let k = params[0];
        let b = self.decay_index().map_or(0.0, |i| params[i]);
        let abs_offset = self.absorption_offset();
        let coeffs = &params[abs_offset..];

        let mut scales = Vec::with_capacity(observations.len());
        let mut derivatives = Vec::with_capacity(observations.len() * params.len());

        for (row, obs) in observations.iter().enumerate() {
            let (decay, inv_2d2) = if self.decay {
                if !(obs.d.is_finite() && obs.d > 0.0) {
                    return Err(ScaleError::invalid(format!(
                        "decay component needs a positive d-spacing, got {} for {}",
                        obs.d, obs.group
                    )));
                }
                let inv_2d2 = 1.0 / (2.0 * obs.d * obs.d);
                ((b * inv_2d2).exp(), inv_2d2)
            } else {
                (1.0, 0.0)
            };

            let absorption = if coeffs.is_empty() {
                1.0
            } else {
                if obs.absorption_basis.len() < coeffs.len() {
                    return Err(ScaleError::invalid(format!(
                        "absorption component needs {} basis values, observation {} has {}",
                        coeffs.len(),
                        obs.group,
                        obs.absorption_basis.len()
                    )));
                }
                1.0 + coeffs
                    .iter()
                    .zip(&obs.absorption_basis)
                    .map(|(c, s)| c * s)
                    .sum::<f64>()
            };

            scales.push(k * decay * absorption);
            derivatives.push(Triplet::new(row, 0, decay * absorption));
            if let Some(i) = self.decay_index() {
                derivatives.push(Triplet::new(row, i, k * decay * absorption * inv_2d2));
            }
            for (l, s) in obs.absorption_basis.iter().take(coeffs.len()).enumerate() {
                derivatives.push(Triplet::new(row, abs_offset + l, k * decay * s));
            }
        }

        Ok(ScaleEvaluation {
            scales,
            derivatives,
        })
    }

    fn restraint(&self, params: &[f64]) -> Option<Restraint> {
        if self.absorption_terms == 0 || params.len() != self.n_params() {
            return None;
        }
        let offset = self.absorption_offset();
        let coeffs = DVector::from_row_slice(&params[offset..]);
        let weights = DVector::from_element(coeffs.len(), self.surface_weight);
        let mut gradient = DVector::zeros(params.len());
        for (l, c) in coeffs.iter().enumerate() {
            gradient[offset + l] = 2.0 * self.surface_weight * c;
        }
        Some(Restraint {
            params: (offset..params.len()).collect(),
            values: coeffs,
            weights,
            gradient,
        })
    }
}
