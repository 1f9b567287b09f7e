//! Scaler composition layer.
//!
//! A `Scaler` owns the grouping table the target works on:
//!
//! - `Single`: one refined dataset, its own table
//! - `Null`: one fixed reference dataset, no parameters
//! - `Multi`: several refined datasets sharing one joint table
//! - `Target`: refined datasets scaled against fixed ones, one joint table
//!
//! Constituents of a composite keep their own per-dataset table; the joint
//! table is the only one rebuilt during minimisation. Joint dataset `i` is
//! the `i`-th entry of `constituents()`.

pub mod factory;
pub mod filter;

use faer::sparse::Triplet;
use tracing::debug;

use crate::domain::{Experiment, Observation, ReflectionTable, WeightingScheme};
use crate::error::{ScaleError, ScaleResult};
use crate::fit::ActiveParameterManager;
use crate::math::from_triplets;
use crate::models::{ScaleEvaluation, ScaleModel};
use crate::table::{IhTable, TableEntry};

pub use factory::*;
pub use filter::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetRole {
    Refined,
    Fixed,
}

/// One dataset with its preprocessed observations and grouping table.
#[derive(Debug, Clone)]
pub struct DatasetScaler {
    experiment: Experiment,
    reflections: ReflectionTable,
    role: DatasetRole,
    weighting: WeightingScheme,
    ih_table: IhTable,
}

impl DatasetScaler {
    pub fn new(
        experiment: Experiment,
        reflections: ReflectionTable,
        role: DatasetRole,
        weighting: WeightingScheme,
    ) -> ScaleResult<Self> {
        let ih_table = IhTable::from_observations(&[reflections.observations.as_slice()], weighting)?;
        Ok(Self {
            experiment,
            reflections,
            role,
            weighting,
            ih_table,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn reflections(&self) -> &ReflectionTable {
        &self.reflections
    }

    pub fn role(&self) -> DatasetRole {
        self.role
    }

    pub fn ih_table(&self) -> &IhTable {
        &self.ih_table
    }

    /// Entries for a joint table, carrying this dataset's current scale factors.
    pub fn table_entries(&self) -> Vec<TableEntry> {
        self.ih_table
            .source_rows()
            .iter()
            .zip(self.ih_table.scale_factors().iter())
            .map(|(&row, &g)| {
                let mut entry =
                    TableEntry::from_observation(&self.reflections.observations[row], row, self.weighting);
                entry.scale_factor = g;
                entry
            })
            .collect()
    }

    /// Mean of the current inverse scale factors over admissible rows.
    pub fn mean_scale_factor(&self) -> f64 {
        self.ih_table.scale_factors().mean()
    }

    /// Admissible observations in table order.
    fn table_observations(&self, source_rows: &[usize]) -> Vec<&Observation> {
        source_rows
            .iter()
            .map(|&row| &self.reflections.observations[row])
            .collect()
    }

    /// Write scale factors (table order) to the observations and the own
    /// table, then rebuild it.
    pub fn apply_scale_factors(&mut self, scale_factors: &[f64]) -> ScaleResult<()> {
        self.ih_table.set_scale_factors(scale_factors)?;
        for (&row, &g) in self.ih_table.source_rows().iter().zip(scale_factors) {
            self.reflections.observations[row].inverse_scale_factor = Some(g);
        }
        self.ih_table.rebuild();
        Ok(())
    }
}

fn joint_table(constituents: &[&DatasetScaler]) -> ScaleResult<IhTable> {
    let blocks: Vec<Vec<TableEntry>> = constituents.iter().map(|s| s.table_entries()).collect();
    IhTable::new(&blocks)
}

#[derive(Debug, Clone)]
pub struct MultiScaler {
    scalers: Vec<DatasetScaler>,
    joint: IhTable,
}

impl MultiScaler {
    pub fn new(scalers: Vec<DatasetScaler>) -> ScaleResult<Self> {
        let joint = joint_table(&scalers.iter().collect::<Vec<_>>())?;
        Ok(Self { scalers, joint })
    }
}

#[derive(Debug, Clone)]
pub struct TargetScaler {
    refined: Vec<DatasetScaler>,
    fixed: Vec<DatasetScaler>,
    joint: IhTable,
}

impl TargetScaler {
    /// Joint table order is refined datasets first, then fixed ones.
    pub fn new(refined: Vec<DatasetScaler>, fixed: Vec<DatasetScaler>) -> ScaleResult<Self> {
        let order: Vec<&DatasetScaler> = refined.iter().chain(fixed.iter()).collect();
        let joint = joint_table(&order)?;
        Ok(Self {
            refined,
            fixed,
            joint,
        })
    }

    pub fn refined(&self) -> &[DatasetScaler] {
        &self.refined
    }

    pub fn fixed(&self) -> &[DatasetScaler] {
        &self.fixed
    }
}

#[derive(Debug, Clone)]
pub enum Scaler {
    Single(DatasetScaler),
    Null(DatasetScaler),
    Multi(MultiScaler),
    Target(TargetScaler),
}

impl Scaler {
    pub fn kind(&self) -> &'static str {
        match self {
            Scaler::Single(_) => "single",
            Scaler::Null(_) => "null",
            Scaler::Multi(_) => "multi",
            Scaler::Target(_) => "target",
        }
    }

    /// The table residuals and derivatives are computed on.
    pub fn ih_table(&self) -> &IhTable {
        match self {
            Scaler::Single(s) | Scaler::Null(s) => &s.ih_table,
            Scaler::Multi(m) => &m.joint,
            Scaler::Target(t) => &t.joint,
        }
    }

    fn ih_table_mut(&mut self) -> &mut IhTable {
        match self {
            Scaler::Single(s) | Scaler::Null(s) => &mut s.ih_table,
            Scaler::Multi(m) => &mut m.joint,
            Scaler::Target(t) => &mut t.joint,
        }
    }

    /// Constituent datasets in joint-table order.
    pub fn constituents(&self) -> Vec<&DatasetScaler> {
        match self {
            Scaler::Single(s) | Scaler::Null(s) => vec![s],
            Scaler::Multi(m) => m.scalers.iter().collect(),
            Scaler::Target(t) => t.refined.iter().chain(t.fixed.iter()).collect(),
        }
    }

    pub fn n_constituents(&self) -> usize {
        match self {
            Scaler::Single(_) | Scaler::Null(_) => 1,
            Scaler::Multi(m) => m.scalers.len(),
            Scaler::Target(t) => t.refined.len() + t.fixed.len(),
        }
    }

    /// Joint dataset indices whose parameters may be refined.
    pub fn refined_datasets(&self) -> Vec<usize> {
        self.constituents()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == DatasetRole::Refined)
            .map(|(i, _)| i)
            .collect()
    }

    /// A parameter manager with one model per refined dataset.
    pub fn parameter_manager<F>(&self, mut model_for: F) -> ScaleResult<ActiveParameterManager>
    where
        F: FnMut(&DatasetScaler) -> Box<dyn ScaleModel>,
    {
        let constituents = self.constituents();
        let models = self
            .refined_datasets()
            .into_iter()
            .map(|i| (i, model_for(constituents[i])))
            .collect();
        ActiveParameterManager::new(models)
    }

    /// Recompute scale factors from the manager's parameters, rebuild `Ih`
    /// once and hand the derivative matrix back to the manager.
    pub fn update_for_minimisation(&mut self, apm: &mut ActiveParameterManager) -> ScaleResult<()> {
        let evaluations = self.evaluate_models(apm)?;

        let table = self.ih_table_mut();
        let mut triplets = Vec::new();
        for (dataset, offset, evaluation) in evaluations {
            let start = table.dataset_range(dataset)?.start;
            table.set_dataset_scale_factors(dataset, &evaluation.scales)?;
            triplets.extend(
                evaluation
                    .derivatives
                    .iter()
                    .map(|t| Triplet::new(t.row + start, t.col + offset, t.val)),
            );
        }
        table.rebuild();
        let derivatives = from_triplets(table.size(), apm.n_active_params(), &triplets)?;
        apm.set_derivatives(derivatives)
    }

    fn evaluate_models(&self, apm: &ActiveParameterManager) -> ScaleResult<Vec<(usize, usize, ScaleEvaluation)>> {
        let constituents = self.constituents();
        let table = self.ih_table();
        apm.blocks()
            .iter()
            .map(|block| {
                let scaler = constituents.get(block.dataset).ok_or_else(|| {
                    ScaleError::invalid(format!("no dataset {} in this scaler", block.dataset))
                })?;
                if scaler.role == DatasetRole::Fixed {
                    return Err(ScaleError::invalid(format!(
                        "dataset {} is a fixed reference and has no parameters",
                        block.dataset
                    )));
                }
                let range = table.dataset_range(block.dataset)?;
                let observations = scaler.table_observations(&table.source_rows()[range]);
                let evaluation = block.model.evaluate(apm.block_params(block), &observations)?;
                Ok((block.dataset, block.offset, evaluation))
            })
            .collect()
    }

    /// Copy the current scale factors back into every constituent's
    /// observations and own table.
    pub fn distribute_scales(&mut self) -> ScaleResult<()> {
        match self {
            Scaler::Single(s) | Scaler::Null(s) => {
                let g: Vec<f64> = s.ih_table.scale_factors().iter().copied().collect();
                s.apply_scale_factors(&g)
            }
            Scaler::Multi(m) => distribute(&m.joint, m.scalers.iter_mut()),
            Scaler::Target(t) => distribute(&t.joint, t.refined.iter_mut().chain(t.fixed.iter_mut())),
        }
    }

    /// Re-combine a target run's constituents as equal peers, refined first
    /// then fixed. The joint table and every constituent table carry over.
    pub fn into_multi(self) -> ScaleResult<Scaler> {
        match self {
            Scaler::Target(t) => {
                let mut scalers = t.refined;
                scalers.extend(t.fixed);
                for s in &mut scalers {
                    s.role = DatasetRole::Refined;
                }
                debug!("converted target scaler into a multi scaler over {} datasets", scalers.len());
                Ok(Scaler::Multi(MultiScaler {
                    scalers,
                    joint: t.joint,
                }))
            }
            multi @ Scaler::Multi(_) => Ok(multi),
            other => Err(ScaleError::invalid(format!(
                "a {} scaler cannot be converted into a multi scaler",
                other.kind()
            ))),
        }
    }

    pub fn experiments(&self) -> Vec<&Experiment> {
        self.constituents().into_iter().map(|s| &s.experiment).collect()
    }
}

fn distribute<'a>(joint: &IhTable, scalers: impl Iterator<Item = &'a mut DatasetScaler>) -> ScaleResult<()> {
    for (dataset, scaler) in scalers.enumerate() {
        let range = joint.dataset_range(dataset)?;
        let g: Vec<f64> = joint.scale_factors().rows(range.start, range.len()).iter().copied().collect();
        scaler.apply_scale_factors(&g)?;
    }
    Ok(())
}
