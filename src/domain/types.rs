//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - built by an external reflection reader (or the synthetic generator)
//! - filtered and scaled in-memory
//! - exported to JSON after a run

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Symmetry-unique reflection key: Miller index already mapped to the
/// asymmetric unit by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub i32, pub i32, pub i32);

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.0, self.1, self.2)
    }
}

/// Which integrated intensity is used as the scaling intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IntensityChoice {
    /// Profile-fitted intensity, falling back to summation when absent.
    Profile,
    /// Summation intensity.
    Sum,
}

/// How observation weights are derived from variances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WeightingScheme {
    /// `w = 1 / variance`.
    InverseVariance,
    /// `w = 1` for every admissible observation.
    Unity,
}

impl WeightingScheme {
    pub fn weight(self, variance: f64) -> f64 {
        match self {
            WeightingScheme::InverseVariance => {
                if variance > 0.0 {
                    1.0 / variance
                } else {
                    0.0
                }
            }
            WeightingScheme::Unity => 1.0,
        }
    }
}

/// An integrated intensity with its variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intensity {
    pub value: f64,
    pub variance: f64,
}

impl Intensity {
    pub fn new(value: f64, variance: f64) -> Self {
        Self { value, variance }
    }

    /// `I / sigma(I)`, or `None` when the variance is not positive.
    pub fn i_over_sigma(&self) -> Option<f64> {
        (self.variance > 0.0).then(|| self.value / self.variance.sqrt())
    }
}

/// One measured reflection instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub group: GroupKey,
    pub intensity_sum: Option<Intensity>,
    pub intensity_prf: Option<Intensity>,
    pub partiality: f64,
    /// Resolution (d-spacing, Å).
    pub d: f64,
    /// Observed centroid `(x, y, z)` in pixels / image number.
    pub xyz: [f64; 3],
    /// Dataset-local experiment id (key into the table's identifier map).
    pub experiment_id: usize,
    /// Fragments of one split partial share this id.
    pub partial_id: Option<u64>,
    pub integrated: bool,
    pub excluded_for_scaling: bool,
    pub user_excluded: bool,
    /// Scaling intensity chosen during preprocessing.
    pub intensity: f64,
    pub variance: f64,
    pub inverse_scale_factor: Option<f64>,
    /// Externally computed absorption-surface basis values, if any.
    #[serde(default)]
    pub absorption_basis: Vec<f64>,
}

impl Observation {
    pub fn new(group: GroupKey, intensity: Intensity) -> Self {
        Self {
            group,
            intensity_sum: Some(intensity),
            intensity_prf: Some(intensity),
            partiality: 1.0,
            d: 2.0,
            xyz: [0.0; 3],
            experiment_id: 0,
            partial_id: None,
            integrated: true,
            excluded_for_scaling: false,
            user_excluded: false,
            intensity: intensity.value,
            variance: intensity.variance,
            inverse_scale_factor: None,
            absorption_basis: Vec::new(),
        }
    }

    /// Usable for scaling: not flagged by preprocessing and not excluded by the user.
    pub fn is_admissible(&self) -> bool {
        !(self.excluded_for_scaling || self.user_excluded)
    }

    pub fn scale_factor(&self) -> f64 {
        self.inverse_scale_factor.unwrap_or(1.0)
    }
}

/// All observations of one dataset plus the experiment identifiers they are
/// tagged with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionTable {
    pub experiment_identifiers: BTreeMap<usize, String>,
    pub observations: Vec<Observation>,
}

impl ReflectionTable {
    pub fn new(identifier: impl Into<String>, observations: Vec<Observation>) -> Self {
        let mut experiment_identifiers = BTreeMap::new();
        experiment_identifiers.insert(0, identifier.into());
        Self {
            experiment_identifiers,
            observations,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn n_admissible(&self) -> usize {
        self.observations.iter().filter(|o| o.is_admissible()).count()
    }

    pub fn has_profile_intensities(&self) -> bool {
        self.observations.iter().any(|o| o.intensity_prf.is_some())
    }

    pub fn has_sum_intensities(&self) -> bool {
        self.observations.iter().any(|o| o.intensity_sum.is_some())
    }
}

/// Scaling-model metadata attached to an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingModelInfo {
    pub id: String,
    /// Already on a reference scale from an earlier run.
    pub is_scaled: bool,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub identifier: String,
    pub scaling_model: ScalingModelInfo,
}

impl Experiment {
    pub fn new(identifier: impl Into<String>, is_scaled: bool) -> Self {
        Self {
            identifier: identifier.into(),
            scaling_model: ScalingModelInfo {
                id: "physical".to_string(),
                is_scaled,
                components: vec!["scale".to_string(), "decay".to_string()],
            },
        }
    }
}

/// Per-run preprocessing and composition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub partiality_cutoff: f64,
    pub min_isigi: f64,
    pub intensity_choice: IntensityChoice,
    pub weighting: WeightingScheme,
    /// Scale unscaled datasets against already-scaled ones first.
    pub target_cycle: bool,
    /// The last dataset is an external target (reference model or data).
    pub target_reference: bool,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            partiality_cutoff: 0.4,
            min_isigi: -5.0,
            intensity_choice: IntensityChoice::Profile,
            weighting: WeightingScheme::InverseVariance,
            target_cycle: true,
            target_reference: false,
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.partiality_cutoff.is_finite() && (0.0..=1.0).contains(&self.partiality_cutoff)) {
            return Err(format!(
                "partiality cutoff must lie in [0, 1], got {}",
                self.partiality_cutoff
            ));
        }
        if !self.min_isigi.is_finite() {
            return Err("min I/sigma must be finite".to_string());
        }
        Ok(())
    }
}

/// Counts of excluded observations keyed by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reasons {
    counts: BTreeMap<String, usize>,
}

impl Reasons {
    pub fn add_reason(&mut self, reason: impl Into<String>, count: usize) {
        *self.counts.entry(reason.into()).or_insert(0) += count;
    }

    pub fn count(&self, reason: &str) -> usize {
        self.counts.get(reason).copied().unwrap_or(0)
    }
}

impl Display for Reasons {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reflections excluded from scaling:")?;
        for (reason, count) in &self.counts {
            writeln!(f, "  {reason}: {count}")?;
        }
        Ok(())
    }
}
