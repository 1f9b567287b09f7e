//! Active parameter manager.
//!
//! Owns the flat parameter vector the minimizer sees and knows which slice of
//! it belongs to which refined dataset. The scaler writes the assembled
//! derivative matrix `D` (`n_obs x n_params`, joint-table row order) back here
//! on every `update_for_minimisation`; the target only reads it.

use std::ops::Range;

use nalgebra::DVector;

use crate::error::{ScaleError, ScaleResult};
use crate::math::SparseMatrix;
use crate::models::{Restraint, ScaleModel};

/// Parameters of one refined dataset.
pub struct ParameterBlock {
    /// Dataset index in the joint table.
    pub dataset: usize,
    pub offset: usize,
    pub n_params: usize,
    pub model: Box<dyn ScaleModel>,
}

impl ParameterBlock {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.n_params
    }
}

impl std::fmt::Debug for ParameterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterBlock")
            .field("dataset", &self.dataset)
            .field("offset", &self.offset)
            .field("n_params", &self.n_params)
            .field("model", &self.model.id())
            .finish()
    }
}

#[derive(Debug)]
pub struct ActiveParameterManager {
    x: DVector<f64>,
    blocks: Vec<ParameterBlock>,
    components_list: Vec<String>,
    derivatives: Option<SparseMatrix>,
}

impl ActiveParameterManager {
    /// One model per refined dataset, keyed by its index in the joint table.
    pub fn new(models: Vec<(usize, Box<dyn ScaleModel>)>) -> ScaleResult<Self> {
        let mut x = Vec::new();
        let mut blocks: Vec<ParameterBlock> = Vec::with_capacity(models.len());
        let mut components_list: Vec<String> = Vec::new();

        for (dataset, model) in models {
            if blocks.iter().any(|b| b.dataset == dataset) {
                return Err(ScaleError::invalid(format!(
                    "dataset {dataset} has more than one scale model"
                )));
            }
            let initial = model.initial_parameters();
            for component in model.components() {
                if !components_list.contains(&component) {
                    components_list.push(component);
                }
            }
            blocks.push(ParameterBlock {
                dataset,
                offset: x.len(),
                n_params: initial.len(),
                model,
            });
            x.extend(initial);
        }

        Ok(Self {
            x: DVector::from_vec(x),
            blocks,
            components_list,
            derivatives: None,
        })
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn set_x(&mut self, x: &DVector<f64>) -> ScaleResult<()> {
        if x.len() != self.x.len() {
            return Err(ScaleError::invalid(format!(
                "expected {} parameters, got {}",
                self.x.len(),
                x.len()
            )));
        }
        self.x.copy_from(x);
        Ok(())
    }

    pub fn n_active_params(&self) -> usize {
        self.x.len()
    }

    pub fn components_list(&self) -> &[String] {
        &self.components_list
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components_list.iter().any(|c| c == name)
    }

    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    pub fn block_for_dataset(&self, dataset: usize) -> Option<&ParameterBlock> {
        self.blocks.iter().find(|b| b.dataset == dataset)
    }

    /// Parameter slice of one block.
    pub fn block_params(&self, block: &ParameterBlock) -> &[f64] {
        &self.x.as_slice()[block.range()]
    }

    /// Derivative matrix from the most recent scaler update.
    pub fn derivatives(&self) -> ScaleResult<&SparseMatrix> {
        self.derivatives.as_ref().ok_or_else(|| {
            ScaleError::invalid("derivatives requested before update_for_minimisation")
        })
    }

    pub fn set_derivatives(&mut self, derivatives: SparseMatrix) -> ScaleResult<()> {
        if derivatives.ncols() != self.n_active_params() {
            return Err(ScaleError::invalid(format!(
                "derivative matrix has {} columns, manager has {} parameters",
                derivatives.ncols(),
                self.n_active_params()
            )));
        }
        self.derivatives = Some(derivatives);
        Ok(())
    }

    /// Restraints of every block, mapped onto the global parameter vector.
    pub fn restraints(&self) -> Option<Restraint> {
        let n = self.n_active_params();
        let mut params = Vec::new();
        let mut values = Vec::new();
        let mut weights = Vec::new();
        let mut gradient = DVector::<f64>::zeros(n);

        for block in &self.blocks {
            let Some(r) = block.model.restraint(self.block_params(block)) else {
                continue;
            };
            params.extend(r.params.iter().map(|p| p + block.offset));
            values.extend(r.values.iter().copied());
            weights.extend(r.weights.iter().copied());
            gradient
                .rows_mut(block.offset, block.n_params)
                .iter_mut()
                .zip(r.gradient.iter())
                .for_each(|(g, v)| *g += v);
        }

        if params.is_empty() {
            return None;
        }
        Some(Restraint {
            params,
            values: DVector::from_vec(values),
            weights: DVector::from_vec(weights),
            gradient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PhysicalModel;

    fn boxed(model: PhysicalModel) -> Box<dyn ScaleModel> {
        Box::new(model)
    }

    fn manager() -> ActiveParameterManager {
        ActiveParameterManager::new(vec![
            (0, boxed(PhysicalModel::default())),
            (2, boxed(PhysicalModel::scale_only().with_absorption(2, 4.0))),
        ])
        .unwrap()
    }

    #[test]
    fn blocks_are_laid_out_contiguously() {
        let apm = manager();
        assert_eq!(apm.n_active_params(), 5);
        assert_eq!(apm.blocks()[1].range(), 2..5);
        assert_eq!(apm.block_for_dataset(2).unwrap().offset, 2);
        assert!(apm.block_for_dataset(1).is_none());
        assert_eq!(apm.components_list(), &["scale", "decay", "absorption"]);
        assert!(apm.has_component("absorption"));
    }

    #[test]
    fn duplicate_datasets_are_rejected() {
        let err = ActiveParameterManager::new(vec![
            (0, boxed(PhysicalModel::default())),
            (0, boxed(PhysicalModel::default())),
        ])
        .unwrap_err();
        assert!(matches!(err, ScaleError::InvalidInput(_)));
    }

    #[test]
    fn restraints_use_global_indices() {
        let mut apm = manager();
        apm.set_x(&DVector::from_row_slice(&[1.0, 0.0, 1.0, 0.5, -0.5])).unwrap();
        let r = apm.restraints().unwrap();
        assert_eq!(r.params, vec![3, 4]);
        assert!((r.functional() - 4.0 * 0.5).abs() < 1e-12);
        assert_eq!(r.gradient.as_slice(), &[0.0, 0.0, 0.0, 4.0, -4.0]);
    }

    #[test]
    fn derivatives_and_parameters_are_shape_checked() {
        let mut apm = manager();
        assert!(apm.derivatives().is_err());
        assert!(apm.set_x(&DVector::zeros(4)).is_err());
        assert!(apm.set_derivatives(crate::math::zeros(3, 4).unwrap()).is_err());
        apm.set_derivatives(crate::math::zeros(3, 5).unwrap()).unwrap();
        assert_eq!(apm.derivatives().unwrap().nrows(), 3);
    }
}
