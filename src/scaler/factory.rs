//! Scaler factories.
//!
//! `create_scaler` picks the composition from the number of datasets, the
//! run configuration and each experiment's `is_scaled` flag:
//!
//! - one dataset: `Single`
//! - several, last one an external reference: `Target` against a `Null`
//! - several, target cycle with a strict scaled/unscaled mix: `Target`
//! - otherwise: `Multi`
//!
//! Datasets that turn out unusable are dropped from both input lists (highest
//! index first) and the run continues with the rest.

use tracing::info;

use crate::domain::{Experiment, ReflectionTable, ScalingConfig};
use crate::error::{ScaleError, ScaleResult};
use crate::scaler::filter::{preprocess_for_refinement, preprocess_reference};
use crate::scaler::{DatasetRole, DatasetScaler, MultiScaler, Scaler, TargetScaler};

pub fn create_scaler(
    config: &ScalingConfig,
    experiments: &mut Vec<Experiment>,
    reflections: &mut Vec<ReflectionTable>,
) -> ScaleResult<Scaler> {
    if reflections.is_empty() {
        return Err(ScaleError::NoReflectionTables);
    }
    if experiments.len() != reflections.len() {
        return Err(ScaleError::CountMismatch {
            experiments: experiments.len(),
            reflections: reflections.len(),
            scalers: 0,
        });
    }
    config.validate().map_err(ScaleError::InvalidInput)?;

    let scaler = if reflections.len() == 1 {
        create_single(config, &experiments[0], reflections[0].clone())?
    } else if config.target_reference {
        create_target_against_reference(config, experiments, reflections)?
    } else if config.target_cycle && is_scaled_mix(experiments) {
        create_target(config, experiments, reflections)?
    } else {
        create_multi(config, experiments, reflections)?
    };
    info!(
        "Created a {} scaler over {} dataset(s).",
        scaler.kind(),
        scaler.n_constituents()
    );
    Ok(scaler)
}

/// Exactly two distinct `is_scaled` states among the experiments.
fn is_scaled_mix(experiments: &[Experiment]) -> bool {
    let scaled = experiments.iter().filter(|e| e.scaling_model.is_scaled).count();
    scaled > 0 && scaled < experiments.len()
}

pub fn create_single(
    config: &ScalingConfig,
    experiment: &Experiment,
    reflections: ReflectionTable,
) -> ScaleResult<Scaler> {
    Ok(Scaler::Single(single_dataset(config, experiment, reflections, DatasetRole::Refined)?))
}

/// A fixed reference on its own; nothing is refined.
pub fn create_null(
    config: &ScalingConfig,
    experiment: &Experiment,
    reflections: ReflectionTable,
) -> ScaleResult<Scaler> {
    Ok(Scaler::Null(reference_dataset(config, experiment, reflections)?))
}

fn single_dataset(
    config: &ScalingConfig,
    experiment: &Experiment,
    reflections: ReflectionTable,
    role: DatasetRole,
) -> ScaleResult<DatasetScaler> {
    let reflections = preprocess_for_refinement(config, experiment, reflections)?;
    DatasetScaler::new(experiment.clone(), reflections, role, config.weighting)
}

fn reference_dataset(
    config: &ScalingConfig,
    experiment: &Experiment,
    reflections: ReflectionTable,
) -> ScaleResult<DatasetScaler> {
    let reflections = preprocess_reference(experiment, reflections)?;
    DatasetScaler::new(experiment.clone(), reflections, DatasetRole::Fixed, config.weighting)
}

/// Build one dataset scaler per input, collecting the indices of unusable
/// datasets instead of failing.
fn build_datasets(
    config: &ScalingConfig,
    experiments: &[Experiment],
    reflections: &[ReflectionTable],
    role_for: impl Fn(&Experiment) -> DatasetRole,
) -> ScaleResult<(Vec<DatasetScaler>, Vec<usize>)> {
    let mut scalers = Vec::with_capacity(experiments.len());
    let mut to_remove = Vec::new();
    for (i, (expt, refl)) in experiments.iter().zip(reflections).enumerate() {
        match single_dataset(config, expt, refl.clone(), role_for(expt)) {
            Ok(scaler) => scalers.push(scaler),
            Err(err) if err.is_recoverable() => {
                info!("{err}");
                to_remove.push(i);
            }
            Err(err) => return Err(err),
        }
    }
    Ok((scalers, to_remove))
}

fn remove_datasets(experiments: &mut Vec<Experiment>, reflections: &mut Vec<ReflectionTable>, indices: &[usize]) {
    if indices.is_empty() {
        return;
    }
    for &j in indices.iter().rev() {
        experiments.remove(j);
        reflections.remove(j);
    }
    let removed: Vec<String> = indices.iter().map(usize::to_string).collect();
    info!("Removed experiments {}", removed.join(" "));
}

fn check_counts(experiments: usize, reflections: usize, scalers: usize) -> ScaleResult<()> {
    if experiments != scalers || experiments != reflections {
        return Err(ScaleError::CountMismatch {
            experiments,
            reflections,
            scalers,
        });
    }
    Ok(())
}

pub fn create_multi(
    config: &ScalingConfig,
    experiments: &mut Vec<Experiment>,
    reflections: &mut Vec<ReflectionTable>,
) -> ScaleResult<Scaler> {
    let (scalers, to_remove) = build_datasets(config, experiments, reflections, |_| DatasetRole::Refined)?;
    remove_datasets(experiments, reflections, &to_remove);
    check_counts(experiments.len(), reflections.len(), scalers.len())?;
    if scalers.is_empty() {
        return Err(ScaleError::NoUsableDatasets);
    }
    Ok(Scaler::Multi(MultiScaler::new(scalers)?))
}

/// Already-scaled datasets become fixed references, unscaled ones are refined.
pub fn create_target(
    config: &ScalingConfig,
    experiments: &mut Vec<Experiment>,
    reflections: &mut Vec<ReflectionTable>,
) -> ScaleResult<Scaler> {
    let (scalers, to_remove) = build_datasets(config, experiments, reflections, |e| {
        if e.scaling_model.is_scaled {
            DatasetRole::Fixed
        } else {
            DatasetRole::Refined
        }
    })?;
    remove_datasets(experiments, reflections, &to_remove);
    check_counts(experiments.len(), reflections.len(), scalers.len())?;
    if scalers.is_empty() {
        return Err(ScaleError::NoUsableDatasets);
    }
    let (refined, fixed): (Vec<_>, Vec<_>) = scalers
        .into_iter()
        .partition(|s| s.role() == DatasetRole::Refined);
    if refined.is_empty() {
        return Err(ScaleError::NoUsableDatasets);
    }
    Ok(Scaler::Target(TargetScaler::new(refined, fixed)?))
}

/// The last dataset is an external reference; every other one is refined
/// against it.
pub fn create_target_against_reference(
    config: &ScalingConfig,
    experiments: &mut Vec<Experiment>,
    reflections: &mut Vec<ReflectionTable>,
) -> ScaleResult<Scaler> {
    let n = experiments.len();
    if n < 2 || reflections.len() != n {
        return Err(ScaleError::invalid(
            "targeted scaling needs at least one dataset besides the reference",
        ));
    }
    let (refined, to_remove) = build_datasets(
        config,
        &experiments[..n - 1],
        &reflections[..n - 1],
        |_| DatasetRole::Refined,
    )?;
    remove_datasets(experiments, reflections, &to_remove);
    if refined.is_empty() {
        return Err(ScaleError::NoUsableDatasets);
    }

    let last = experiments.len() - 1;
    let reference = reference_dataset(config, &experiments[last], reflections[last].clone())?;
    let fixed = vec![reference];

    check_counts(experiments.len(), reflections.len(), refined.len() + fixed.len())?;
    Ok(Scaler::Target(TargetScaler::new(refined, fixed)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GroupKey, Intensity, Observation};

    fn table(id: &str, intensities: &[(i32, f64, f64)]) -> ReflectionTable {
        ReflectionTable::new(
            id,
            intensities
                .iter()
                .map(|&(h, i, v)| Observation::new(GroupKey(h, 0, 0), Intensity::new(i, v)))
                .collect(),
        )
    }

    fn good(id: &str, n: i32) -> ReflectionTable {
        table(id, &(0..n).map(|h| (h, 100.0 + h as f64, 10.0)).collect::<Vec<_>>())
    }

    fn unusable(id: &str) -> ReflectionTable {
        table(id, &[(1, 100.0, 0.0), (2, 50.0, -1.0)])
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = create_scaler(&ScalingConfig::default(), &mut vec![], &mut vec![]).unwrap_err();
        assert!(matches!(err, ScaleError::NoReflectionTables));
    }

    #[test]
    fn single_dataset_makes_single_scaler() {
        let mut experiments = vec![Experiment::new("a", false)];
        let mut reflections = vec![good("a", 4)];
        let scaler = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap();
        assert_eq!(scaler.kind(), "single");
        assert_eq!(scaler.ih_table().size(), 4);
    }

    #[test]
    fn sole_unusable_dataset_is_reported() {
        let mut experiments = vec![Experiment::new("a", false)];
        let mut reflections = vec![unusable("a")];
        let err = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::DatasetUnusable { .. }));
    }

    #[test]
    fn identifier_mismatch_is_fatal() {
        let mut experiments = vec![Experiment::new("a", false), Experiment::new("b", false)];
        let mut reflections = vec![good("a", 3), good("x", 3)];
        let err = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::IdentifierMismatch { .. }));
    }

    #[test]
    fn target_cycle_fixes_scaled_datasets() {
        let mut experiments = vec![
            Experiment::new("a", true),
            Experiment::new("b", false),
            Experiment::new("c", true),
        ];
        let mut reflections = vec![good("a", 3), good("b", 4), good("c", 5)];
        let scaler = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap();

        let Scaler::Target(target) = &scaler else {
            panic!("expected a target scaler, got {}", scaler.kind());
        };
        assert_eq!(target.fixed().len(), 2);
        assert_eq!(target.refined().len(), 1);
        assert_eq!(target.refined()[0].experiment().identifier, "b");
        assert_eq!(scaler.ih_table().size(), 3 + 4 + 5);
        assert_eq!(scaler.refined_datasets(), vec![0]);
    }

    #[test]
    fn uniform_scaled_state_makes_multi_scaler() {
        let mut experiments = vec![Experiment::new("a", true), Experiment::new("b", true)];
        let mut reflections = vec![good("a", 3), good("b", 3)];
        let scaler = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap();
        assert_eq!(scaler.kind(), "multi");

        let config = ScalingConfig {
            target_cycle: false,
            ..ScalingConfig::default()
        };
        let mut experiments = vec![Experiment::new("a", true), Experiment::new("b", false)];
        let mut reflections = vec![good("a", 3), good("b", 3)];
        let scaler = create_scaler(&config, &mut experiments, &mut reflections).unwrap();
        assert_eq!(scaler.kind(), "multi");
    }

    #[test]
    fn unusable_datasets_are_removed_from_both_lists() {
        let mut experiments = vec![
            Experiment::new("a", false),
            Experiment::new("b", false),
            Experiment::new("c", false),
            Experiment::new("d", false),
        ];
        let mut reflections = vec![good("a", 3), unusable("b"), good("c", 2), unusable("d")];
        let scaler = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap();

        let ids: Vec<&str> = experiments.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(reflections.len(), 2);
        assert_eq!(reflections[1].experiment_identifiers[&0], "c");
        assert_eq!(scaler.n_constituents(), 2);
        assert_eq!(scaler.ih_table().size(), 5);
    }

    #[test]
    fn all_unusable_datasets_is_an_error() {
        let mut experiments = vec![Experiment::new("a", false), Experiment::new("b", false)];
        let mut reflections = vec![unusable("a"), unusable("b")];
        let err = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::NoUsableDatasets));
        assert!(experiments.is_empty());
    }

    #[test]
    fn external_reference_is_the_last_dataset() {
        let config = ScalingConfig {
            target_reference: true,
            ..ScalingConfig::default()
        };
        let mut experiments = vec![
            Experiment::new("a", false),
            Experiment::new("b", false),
            Experiment::new("ref", true),
        ];
        let mut reflections = vec![good("a", 3), unusable("b"), good("ref", 6)];
        let scaler = create_scaler(&config, &mut experiments, &mut reflections).unwrap();

        let Scaler::Target(target) = &scaler else {
            panic!("expected a target scaler");
        };
        assert_eq!(target.fixed()[0].experiment().identifier, "ref");
        assert_eq!(target.refined().len(), 1);
        assert_eq!(experiments.len(), 2);
        assert_eq!(scaler.ih_table().size(), 9);
    }

    #[test]
    fn target_with_nothing_left_to_refine_is_an_error() {
        let mut experiments = vec![Experiment::new("a", true), Experiment::new("b", false)];
        let mut reflections = vec![good("a", 3), unusable("b")];
        let err = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::NoUsableDatasets));
        assert_eq!(experiments.len(), 1);

        let config = ScalingConfig {
            target_reference: true,
            ..ScalingConfig::default()
        };
        let mut experiments = vec![Experiment::new("a", false), Experiment::new("ref", true)];
        let mut reflections = vec![unusable("a"), good("ref", 4)];
        let err = create_scaler(&config, &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::NoUsableDatasets));
    }

    #[test]
    fn null_scaler_has_no_refined_datasets() {
        let mut bad = Observation::new(GroupKey(1, 0, 0), Intensity::new(10.0, 1.0));
        bad.variance = 0.0;
        let mut refl = good("ref", 2);
        refl.observations.push(bad);
        let scaler = create_null(&ScalingConfig::default(), &Experiment::new("ref", true), refl).unwrap();
        assert_eq!(scaler.kind(), "null");
        assert!(scaler.refined_datasets().is_empty());
        assert_eq!(scaler.ih_table().size(), 2);
    }

    #[test]
    fn mismatched_input_lengths_are_fatal() {
        let mut experiments = vec![Experiment::new("a", false)];
        let mut reflections = vec![good("a", 2), good("b", 2)];
        let err = create_scaler(&ScalingConfig::default(), &mut experiments, &mut reflections).unwrap_err();
        assert!(matches!(err, ScaleError::CountMismatch { .. }));
    }
}
