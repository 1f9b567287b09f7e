//! Grouping table: observations bucketed by symmetry-unique reflection.
//!
//! The table keeps the observation-indexed arrays the target needs
//! (intensities, weights, current inverse scale factors, expanded `Ih`) plus
//! two sparse incidence operators:
//!
//! - `h_index_matrix` (`n_obs x n_groups`): `reduce(v) = Hᵀ v` sums an
//!   observation vector per group
//! - `h_expand_matrix` (`n_groups x n_obs`): `expand(u) = Eᵀ u` broadcasts a
//!   group vector back to its members
//!
//! `E = Hᵀ` by construction. Rows from several datasets are stored as
//! contiguous blocks (`dataset_range`), so a joint table for a multi-dataset
//! run is just the concatenation of the per-dataset admissible rows.

use std::ops::Range;

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::domain::{GroupKey, Observation, WeightingScheme};
use crate::error::{ScaleError, ScaleResult};
use crate::math::{SparseMatrix, incidence_matrix, tr_mul_vec, transpose};

/// One admissible observation as seen by the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableEntry {
    pub group: GroupKey,
    pub intensity: f64,
    pub variance: f64,
    pub weight: f64,
    pub scale_factor: f64,
    /// Index of the observation within its dataset's reflection table.
    pub source_row: usize,
}

impl TableEntry {
    pub fn from_observation(obs: &Observation, source_row: usize, weighting: WeightingScheme) -> Self {
        Self {
            group: obs.group,
            intensity: obs.intensity,
            variance: obs.variance,
            weight: weighting.weight(obs.variance),
            scale_factor: obs.scale_factor(),
            source_row,
        }
    }
}

/// Position of `key` in the sorted, deduplicated key list.
fn group_index(keys: &[GroupKey], key: GroupKey) -> ScaleResult<usize> {
    keys.binary_search(&key)
        .map_err(|_| ScaleError::invalid(format!("reflection {key} has no group in this table")))
}

#[derive(Debug, Clone)]
pub struct IhTable {
    intensities: DVector<f64>,
    variances: DVector<f64>,
    weights: DVector<f64>,
    scale_factors: DVector<f64>,
    /// `Ih` expanded to observation level.
    ih_values: DVector<f64>,
    group_ih: DVector<f64>,
    /// Per-group `Σ w g²`, the denominator of the weighted mean.
    sum_gsq_weights: DVector<f64>,
    active_groups: Vec<bool>,
    group_of: Vec<usize>,
    group_keys: Vec<GroupKey>,
    h_index_matrix: SparseMatrix,
    h_expand_matrix: SparseMatrix,
    dataset_ranges: Vec<Range<usize>>,
    source_rows: Vec<usize>,
}

impl IhTable {
    /// Build a table from per-dataset blocks of admissible entries and compute
    /// the initial `Ih` estimates.
    pub fn new(blocks: &[Vec<TableEntry>]) -> ScaleResult<Self> {
        let n: usize = blocks.iter().map(Vec::len).sum();
        if n == 0 {
            return Err(ScaleError::NoAdmissibleObservations);
        }

        let mut group_keys: Vec<GroupKey> = blocks.iter().flatten().map(|e| e.group).collect();
        group_keys.sort_unstable();
        group_keys.dedup();

        let mut intensities = Vec::with_capacity(n);
        let mut variances = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        let mut scale_factors = Vec::with_capacity(n);
        let mut group_of = Vec::with_capacity(n);
        let mut source_rows = Vec::with_capacity(n);
        let mut dataset_ranges = Vec::with_capacity(blocks.len());

        for block in blocks {
            let start = intensities.len();
            for entry in block {
                if !(entry.intensity.is_finite()
                    && entry.weight.is_finite()
                    && entry.weight >= 0.0
                    && entry.scale_factor.is_finite())
                {
                    return Err(ScaleError::invalid(format!(
                        "non-finite or negative table entry for reflection {}",
                        entry.group
                    )));
                }
                let group = group_index(&group_keys, entry.group)?;
                intensities.push(entry.intensity);
                variances.push(entry.variance);
                weights.push(entry.weight);
                scale_factors.push(entry.scale_factor);
                group_of.push(group);
                source_rows.push(entry.source_row);
            }
            dataset_ranges.push(start..intensities.len());
        }

        let n_groups = group_keys.len();
        let h_index_matrix = incidence_matrix(&group_of, n_groups)?;
        let h_expand_matrix = transpose(&h_index_matrix)?;

        let mut table = Self {
            intensities: DVector::from_vec(intensities),
            variances: DVector::from_vec(variances),
            weights: DVector::from_vec(weights),
            scale_factors: DVector::from_vec(scale_factors),
            ih_values: DVector::zeros(n),
            group_ih: DVector::zeros(n_groups),
            sum_gsq_weights: DVector::zeros(n_groups),
            active_groups: vec![false; n_groups],
            group_of,
            group_keys,
            h_index_matrix,
            h_expand_matrix,
            dataset_ranges,
            source_rows,
        };
        table.rebuild();

        let inactive = table.n_groups() - table.n_active_groups();
        if inactive > 0 {
            warn!(
                "{inactive} of {} unique reflections carry zero total weight and are ignored",
                table.n_groups()
            );
        }
        Ok(table)
    }

    /// Build from per-dataset observation lists, keeping admissible rows only.
    pub fn from_observations(
        datasets: &[&[Observation]],
        weighting: WeightingScheme,
    ) -> ScaleResult<Self> {
        let blocks: Vec<Vec<TableEntry>> = datasets
            .iter()
            .map(|observations| {
                observations
                    .iter()
                    .enumerate()
                    .filter(|(_, obs)| obs.is_admissible())
                    .map(|(row, obs)| TableEntry::from_observation(obs, row, weighting))
                    .collect()
            })
            .collect();
        Self::new(&blocks)
    }

    /// Recompute every group's `Ih` from the current scale factors.
    ///
    /// `Ih = Σ w g I / Σ w g²`, the weighted mean of `I/g` with weight `w g²`.
    /// Groups whose denominator is zero get `Ih = 0` and are marked inactive.
    pub fn rebuild(&mut self) {
        let gsq_w = self
            .scale_factors
            .component_mul(&self.scale_factors)
            .component_mul(&self.weights);
        let numerator = self.reduce(
            &self
                .weights
                .component_mul(&self.scale_factors)
                .component_mul(&self.intensities),
        );
        self.sum_gsq_weights = self.reduce(&gsq_w);

        for h in 0..self.n_groups() {
            let denom = self.sum_gsq_weights[h];
            if denom > 0.0 && denom.is_finite() {
                self.group_ih[h] = numerator[h] / denom;
                self.active_groups[h] = true;
            } else {
                self.group_ih[h] = 0.0;
                self.active_groups[h] = false;
            }
        }
        self.ih_values = self.expand(&self.group_ih);
        debug!(
            "rebuilt Ih for {} groups over {} observations",
            self.n_groups(),
            self.size()
        );
    }

    /// Replace all scale factors. Call `rebuild` afterwards.
    pub fn set_scale_factors(&mut self, scale_factors: &[f64]) -> ScaleResult<()> {
        if scale_factors.len() != self.size() {
            return Err(ScaleError::invalid(format!(
                "expected {} scale factors, got {}",
                self.size(),
                scale_factors.len()
            )));
        }
        self.scale_factors.copy_from_slice(scale_factors);
        Ok(())
    }

    /// Replace the scale factors of one dataset block. Call `rebuild` afterwards.
    pub fn set_dataset_scale_factors(&mut self, dataset: usize, scale_factors: &[f64]) -> ScaleResult<()> {
        let range = self.dataset_range(dataset)?;
        if scale_factors.len() != range.len() {
            return Err(ScaleError::invalid(format!(
                "dataset {dataset} has {} table rows, got {} scale factors",
                range.len(),
                scale_factors.len()
            )));
        }
        self.scale_factors.rows_mut(range.start, range.len()).copy_from_slice(scale_factors);
        Ok(())
    }

    /// Sum an observation-indexed vector per group.
    pub fn reduce(&self, values: &DVector<f64>) -> DVector<f64> {
        tr_mul_vec(&self.h_index_matrix, values)
    }

    /// Broadcast a group-indexed vector to every member observation.
    pub fn expand(&self, values: &DVector<f64>) -> DVector<f64> {
        tr_mul_vec(&self.h_expand_matrix, values)
    }

    /// Number of observations per group.
    pub fn group_sizes(&self) -> DVector<f64> {
        self.reduce(&DVector::from_element(self.size(), 1.0))
    }

    /// Admissible observation count.
    pub fn size(&self) -> usize {
        self.intensities.len()
    }

    pub fn n_groups(&self) -> usize {
        self.group_keys.len()
    }

    pub fn n_active_groups(&self) -> usize {
        self.active_groups.iter().filter(|&&a| a).count()
    }

    pub fn n_datasets(&self) -> usize {
        self.dataset_ranges.len()
    }

    pub fn dataset_range(&self, dataset: usize) -> ScaleResult<Range<usize>> {
        self.dataset_ranges
            .get(dataset)
            .cloned()
            .ok_or_else(|| ScaleError::invalid(format!("table has no dataset block {dataset}")))
    }

    /// 1.0 for observations in groups with a defined `Ih`, else 0.0.
    pub fn active_mask(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.size(),
            self.group_of
                .iter()
                .map(|&h| if self.active_groups[h] { 1.0 } else { 0.0 }),
        )
    }

    pub fn is_group_active(&self, group: usize) -> bool {
        self.active_groups.get(group).copied().unwrap_or(false)
    }

    pub fn intensities(&self) -> &DVector<f64> {
        &self.intensities
    }

    pub fn variances(&self) -> &DVector<f64> {
        &self.variances
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    pub fn scale_factors(&self) -> &DVector<f64> {
        &self.scale_factors
    }

    pub fn ih_values(&self) -> &DVector<f64> {
        &self.ih_values
    }

    pub fn group_ih(&self) -> &DVector<f64> {
        &self.group_ih
    }

    pub fn sum_gsq_weights(&self) -> &DVector<f64> {
        &self.sum_gsq_weights
    }

    pub fn group_of(&self) -> &[usize] {
        &self.group_of
    }

    pub fn group_keys(&self) -> &[GroupKey] {
        &self.group_keys
    }

    pub fn source_rows(&self) -> &[usize] {
        &self.source_rows
    }

    pub fn h_index_matrix(&self) -> &SparseMatrix {
        &self.h_index_matrix
    }

    pub fn h_expand_matrix(&self) -> &SparseMatrix {
        &self.h_expand_matrix
    }
}
