//! Dataset preprocessing before a dataset may join a grouping table.
//!
//! Refined datasets go through `preprocess_for_refinement`:
//!
//! 1. identifier check (fatal on mismatch)
//! 2. split partials combined into one observation per event
//! 3. quality filter on every intensity type the table carries
//! 4. inverse scale factors initialised
//! 5. scaling intensity chosen, non-positive variances excluded
//!
//! and fail with `DatasetUnusable` when nothing admissible is left. Reference
//! datasets use `preprocess_reference`, which never fails that way.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::domain::{
    Experiment, Intensity, IntensityChoice, Observation, Reasons, ReflectionTable, ScalingConfig,
};
use crate::error::{ScaleError, ScaleResult};

/// The table must carry exactly one identifier and it must be the experiment's.
pub fn ensure_experiment_identifier(experiment: &Experiment, table: &ReflectionTable) -> ScaleResult<()> {
    let ids: Vec<&String> = table.experiment_identifiers.values().collect();
    if ids.len() != 1 || ids[0] != &experiment.identifier {
        return Err(ScaleError::IdentifierMismatch {
            expected: experiment.identifier.clone(),
            found: ids
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    if let Some(id) = table.experiment_identifiers.keys().next() {
        info!("The experiment id for this dataset is {id}.");
    }
    Ok(())
}

fn add_intensities(a: Option<Intensity>, b: Option<Intensity>) -> Option<Intensity> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Intensity::new(a.value + b.value, a.variance + b.variance)),
        _ => None,
    }
}

/// Merge fragments sharing a `partial_id`.
///
/// Intensities, variances and partialities are summed; everything else is
/// taken from the first fragment. Output keeps first-occurrence order.
pub fn sum_partial_reflections(observations: Vec<Observation>) -> Vec<Observation> {
    let n_in = observations.len();
    let mut out: Vec<Observation> = Vec::with_capacity(n_in);
    let mut seen: BTreeMap<u64, usize> = BTreeMap::new();

    for obs in observations {
        let Some(pid) = obs.partial_id else {
            out.push(obs);
            continue;
        };
        match seen.get(&pid) {
            Some(&idx) => {
                let merged = &mut out[idx];
                merged.intensity_sum = add_intensities(merged.intensity_sum, obs.intensity_sum);
                merged.intensity_prf = add_intensities(merged.intensity_prf, obs.intensity_prf);
                merged.partiality += obs.partiality;
            }
            None => {
                seen.insert(pid, out.len());
                out.push(obs);
            }
        }
    }

    if out.len() < n_in {
        debug!("combined {n_in} partial fragments into {} observations", out.len());
    }
    out
}

fn passes_quality(
    obs: &Observation,
    intensity: Option<Intensity>,
    partiality_cutoff: f64,
    min_isigi: f64,
) -> bool {
    let Some(intensity) = intensity else {
        return false;
    };
    let Some(isigi) = intensity.i_over_sigma() else {
        return false;
    };
    obs.integrated && obs.partiality > partiality_cutoff && isigi > min_isigi
}

/// Flag observations that fail the quality cuts on any intensity type the
/// table carries. Returns the number of newly flagged observations.
pub fn filter_bad_reflections(table: &mut ReflectionTable, partiality_cutoff: f64, min_isigi: f64) -> usize {
    let use_sum = table.has_sum_intensities();
    let use_prf = table.has_profile_intensities();
    if !(use_sum || use_prf) {
        return 0;
    }
    info!("Applying filter of min_isigi > {min_isigi}, partiality > {partiality_cutoff}");

    let mut flagged = 0;
    for obs in table.observations.iter_mut().filter(|o| !o.excluded_for_scaling) {
        let good = (!use_sum || passes_quality(obs, obs.intensity_sum, partiality_cutoff, min_isigi))
            && (!use_prf || passes_quality(obs, obs.intensity_prf, partiality_cutoff, min_isigi));
        if !good {
            obs.excluded_for_scaling = true;
            flagged += 1;
        }
    }
    flagged
}

/// Unit inverse scale factors when none were set, or all are zero.
pub fn initialise_scale_factors(observations: &mut [Observation]) {
    let unset = observations
        .iter()
        .all(|o| o.inverse_scale_factor.is_none_or(|g| g == 0.0));
    for obs in observations.iter_mut() {
        if unset || obs.inverse_scale_factor.is_none() {
            obs.inverse_scale_factor = Some(1.0);
        }
    }
}

/// Copy the configured intensity into the scaling `intensity`/`variance`.
///
/// Profile falls back to summation per observation. Observations with no
/// usable intensity, or a non-positive variance, are excluded. Returns the
/// number of newly excluded observations.
pub fn choose_scaling_intensities(observations: &mut [Observation], choice: IntensityChoice) -> usize {
    let mut excluded = 0;
    for obs in observations.iter_mut() {
        let chosen = match choice {
            IntensityChoice::Profile => obs.intensity_prf.or(obs.intensity_sum),
            IntensityChoice::Sum => obs.intensity_sum,
        };
        match chosen {
            Some(i) => {
                obs.intensity = i.value;
                obs.variance = i.variance;
            }
            None => {
                obs.intensity = 0.0;
                obs.variance = 0.0;
            }
        }
        if obs.variance <= 0.0 && !obs.excluded_for_scaling {
            obs.excluded_for_scaling = true;
            excluded += 1;
        }
    }
    excluded
}

pub fn exclude_non_positive_variance(observations: &mut [Observation]) -> usize {
    let mut excluded = 0;
    for obs in observations.iter_mut().filter(|o| !o.excluded_for_scaling) {
        if !(obs.variance > 0.0) {
            obs.excluded_for_scaling = true;
            excluded += 1;
        }
    }
    excluded
}

fn exclusion_reasons(observations: &[Observation]) -> (Reasons, usize) {
    let mut reasons = Reasons::default();
    reasons.add_reason("user excluded", observations.iter().filter(|o| o.user_excluded).count());
    reasons.add_reason(
        "excluded for scaling",
        observations.iter().filter(|o| o.excluded_for_scaling).count(),
    );
    let n_excluded = observations.iter().filter(|o| !o.is_admissible()).count();
    (reasons, n_excluded)
}

/// Full preprocessing for a dataset whose scale will be refined (or that
/// joins a target run as an already-scaled peer).
pub fn preprocess_for_refinement(
    config: &ScalingConfig,
    experiment: &Experiment,
    mut table: ReflectionTable,
) -> ScaleResult<ReflectionTable> {
    ensure_experiment_identifier(experiment, &table)?;
    info!(
        "The scaling model type being applied is {}.",
        experiment.scaling_model.id
    );

    table.observations = sum_partial_reflections(std::mem::take(&mut table.observations));
    filter_bad_reflections(&mut table, config.partiality_cutoff, config.min_isigi);
    initialise_scale_factors(&mut table.observations);
    choose_scaling_intensities(&mut table.observations, config.intensity_choice);

    let (reasons, n_excluded) = exclusion_reasons(&table.observations);
    if n_excluded == table.len() {
        info!("All reflections were determined to be unsuitable for scaling.");
        info!("{reasons}");
        return Err(ScaleError::DatasetUnusable { reasons });
    }
    info!("Excluding {n_excluded}/{} reflections\n{reasons}", table.len());
    Ok(table)
}

/// Preprocessing for a fixed reference dataset: default quality cuts and
/// exclusion of non-positive variances on the existing scaling intensities.
pub fn preprocess_reference(experiment: &Experiment, mut table: ReflectionTable) -> ScaleResult<ReflectionTable> {
    info!("Preprocessing target dataset for scaling.");
    let defaults = ScalingConfig::default();
    filter_bad_reflections(&mut table, defaults.partiality_cutoff, defaults.min_isigi);
    exclude_non_positive_variance(&mut table.observations);
    initialise_scale_factors(&mut table.observations);
    info!(
        "{} reflections not suitable for scaling",
        table.observations.iter().filter(|o| o.excluded_for_scaling).count()
    );
    ensure_experiment_identifier(experiment, &table)?;
    Ok(table)
}
