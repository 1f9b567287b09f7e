//! Shared scaling pipeline used by the `scale` and `gradcheck` commands.
//!
//! sample generation -> scaler creation -> parameter manager -> refinement
//! -> (optional) joint cycle -> scale distribution -> per-dataset summary

use nalgebra::DVector;
use serde::Serialize;
use tracing::info;

use crate::data::{SampleConfig, SampleData, TrueScale, generate_sample};
use crate::domain::ScalingConfig;
use crate::error::{ScaleError, ScaleResult};
use crate::fit::{ActiveParameterManager, RefineOptions, RefineReport, ScalingTarget, refine};
use crate::models::{DECAY_COMPONENT, PhysicalModel, ScaleModel};
use crate::scaler::{DatasetRole, DatasetScaler, Scaler, create_scaler};

/// Scale model settings applied to every refined dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelOptions {
    pub decay: bool,
    pub absorption_terms: usize,
    pub surface_weight: f64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            decay: true,
            absorption_terms: 0,
            surface_weight: 1e3,
        }
    }
}

impl ModelOptions {
    fn model(&self) -> PhysicalModel {
        let base = PhysicalModel {
            decay: self.decay,
            ..PhysicalModel::default()
        };
        base.with_absorption(self.absorption_terms, self.surface_weight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub sample: SampleConfig,
    pub scaling: ScalingConfig,
    pub model: ModelOptions,
    pub refine: RefineOptions,
    /// Follow a targeted cycle with a joint refinement of every dataset.
    pub joint_cycle: bool,
}

/// One refinement cycle as reported.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub scaler_kind: String,
    pub n_observations: usize,
    pub n_groups: usize,
    pub report: RefineReport,
}

/// Final state of one dataset.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub identifier: String,
    pub refined: bool,
    pub n_reflections: usize,
    pub n_admissible: usize,
    pub fitted_scale: f64,
    pub fitted_b: Option<f64>,
    pub true_scale: Option<f64>,
    pub true_b: Option<f64>,
    /// `fitted / true` scale, normalised so the first dataset is 1.
    pub relative_scale: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub scaler_kind: String,
    pub cycles: Vec<CycleSummary>,
    pub datasets: Vec<DatasetSummary>,
    pub removed: Vec<String>,
}

/// Execute the full scaling pipeline on freshly generated data.
pub fn run_scale(config: &RunConfig) -> ScaleResult<RunOutput> {
    let sample = generate_sample(&config.sample)?;
    run_scale_with_sample(config, sample)
}

/// Execute the scaling pipeline on pre-generated data.
pub fn run_scale_with_sample(config: &RunConfig, sample: SampleData) -> ScaleResult<RunOutput> {
    let SampleData {
        mut experiments,
        mut reflections,
        truth,
    } = sample;
    let input_ids: Vec<String> = experiments.iter().map(|e| e.identifier.clone()).collect();

    let mut scaler = create_scaler(&config.scaling, &mut experiments, &mut reflections)?;
    let removed: Vec<String> = input_ids
        .into_iter()
        .filter(|id| !experiments.iter().any(|e| &e.identifier == id))
        .collect();
    let first_kind = scaler.kind().to_string();

    let model = config.model.model();
    let mut apm = scaler.parameter_manager(|_| Box::new(model.clone()) as Box<dyn ScaleModel>)?;
    let mut cycles = vec![run_cycle(&mut scaler, &mut apm, &config.refine)?];

    let joint = config.joint_cycle && !config.scaling.target_reference;
    if joint && matches!(scaler, Scaler::Target(_)) {
        info!("Performing a joint refinement of all datasets.");
        scaler.distribute_scales()?;
        scaler = scaler.into_multi()?;
        // Former references start from the scale they were fixed at.
        let mut joint_apm = scaler.parameter_manager(|s| {
            Box::new(PhysicalModel {
                initial_scale: s.mean_scale_factor(),
                ..model.clone()
            }) as Box<dyn ScaleModel>
        })?;
        // Previously refined datasets lead the joint order, so their
        // parameters are a prefix of the new vector.
        let mut x = joint_apm.x().clone();
        x.rows_mut(0, apm.x().len()).copy_from(apm.x());
        joint_apm.set_x(&x)?;
        apm = joint_apm;
        cycles.push(run_cycle(&mut scaler, &mut apm, &config.refine)?);
    }

    scaler.distribute_scales()?;
    let datasets = summarise_datasets(&scaler, &apm, &truth);

    Ok(RunOutput {
        scaler_kind: first_kind,
        cycles,
        datasets,
        removed,
    })
}

fn run_cycle(
    scaler: &mut Scaler,
    apm: &mut ActiveParameterManager,
    opts: &RefineOptions,
) -> ScaleResult<CycleSummary> {
    let scaler_kind = scaler.kind().to_string();
    let mut target = ScalingTarget::new(scaler, apm);
    let report = refine(&mut target, opts)?;
    let table = target.scaler().ih_table();
    Ok(CycleSummary {
        scaler_kind,
        n_observations: table.size(),
        n_groups: table.n_active_groups(),
        report,
    })
}

fn summarise_datasets(scaler: &Scaler, apm: &ActiveParameterManager, truth: &[TrueScale]) -> Vec<DatasetSummary> {
    let mut out: Vec<DatasetSummary> = scaler
        .constituents()
        .into_iter()
        .enumerate()
        .map(|(i, s)| dataset_summary(i, s, apm, truth))
        .collect();

    let ratio = |d: &DatasetSummary| d.true_scale.map(|t| d.fitted_scale / t);
    if let Some(first) = out.first().and_then(ratio) {
        for d in &mut out {
            d.relative_scale = ratio(d).map(|r| r / first);
        }
    }
    out
}

fn dataset_summary(
    index: usize,
    scaler: &DatasetScaler,
    apm: &ActiveParameterManager,
    truth: &[TrueScale],
) -> DatasetSummary {
    let identifier = scaler.experiment().identifier.clone();
    let block = apm.block_for_dataset(index);
    let params = block.map(|b| apm.block_params(b));
    let decay = block.is_some_and(|b| b.model.components().iter().any(|c| c == DECAY_COMPONENT));

    let fitted_scale = params.and_then(|p| p.first().copied()).unwrap_or(1.0);
    let fitted_b = params.filter(|_| decay).and_then(|p| p.get(1).copied());
    let true_values = truth.iter().find(|t| t.identifier == identifier);

    DatasetSummary {
        refined: scaler.role() == DatasetRole::Refined,
        n_reflections: scaler.reflections().len(),
        n_admissible: scaler.reflections().n_admissible(),
        fitted_scale,
        fitted_b,
        true_scale: true_values.map(|t| t.scale),
        true_b: true_values.map(|t| t.b_factor),
        relative_scale: None,
        identifier,
    }
}

/// One row of a gradient check.
#[derive(Debug, Clone, Serialize)]
pub struct GradientCheckRow {
    pub parameter: usize,
    pub analytic: f64,
    pub finite_difference: f64,
    pub relative_error: f64,
}

/// Compare the analytic gradient of the functional with central differences
/// at the models' starting parameters.
pub fn gradient_check(
    sample: &SampleConfig,
    scaling: &ScalingConfig,
    model: &ModelOptions,
    step: f64,
) -> ScaleResult<Vec<GradientCheckRow>> {
    if !(step.is_finite() && step > 0.0) {
        return Err(ScaleError::invalid(format!("finite-difference step must be positive, got {step}")));
    }
    let data = generate_sample(sample)?;
    let (mut experiments, mut reflections) = (data.experiments, data.reflections);
    let mut scaler = create_scaler(scaling, &mut experiments, &mut reflections)?;
    let model = model.model();
    let mut apm = scaler.parameter_manager(|_| Box::new(model.clone()) as Box<dyn ScaleModel>)?;
    let mut target = ScalingTarget::new(&mut scaler, &mut apm);
    target.predict()?;

    let x0: DVector<f64> = target.apm().x().clone();
    let (_, analytic) = target.compute_functional_gradients()?;

    let mut rows = Vec::with_capacity(x0.len());
    for i in 0..x0.len() {
        let mut x = x0.clone();
        x[i] = x0[i] + step;
        target.update_for_minimisation(&x)?;
        let (f_plus, _) = target.compute_functional_gradients()?;
        x[i] = x0[i] - step;
        target.update_for_minimisation(&x)?;
        let (f_minus, _) = target.compute_functional_gradients()?;

        let finite_difference = (f_plus - f_minus) / (2.0 * step);
        let scale = analytic[i].abs().max(finite_difference.abs()).max(1.0);
        rows.push(GradientCheckRow {
            parameter: i,
            analytic: analytic[i],
            finite_difference,
            relative_error: (analytic[i] - finite_difference).abs() / scale,
        });
    }
    target.update_for_minimisation(&x0)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_sample() -> SampleConfig {
        SampleConfig {
            n_unique: 60,
            n_datasets: 3,
            multiplicity: 2,
            noise: 0.01,
            ..SampleConfig::default()
        }
    }

    fn run_config(sample: SampleConfig) -> RunConfig {
        RunConfig {
            sample,
            scaling: ScalingConfig::default(),
            model: ModelOptions::default(),
            refine: RefineOptions::default(),
            joint_cycle: true,
        }
    }

    #[test]
    fn multi_run_recovers_relative_scales() {
        let output = run_scale(&run_config(small_sample())).unwrap();
        assert_eq!(output.scaler_kind, "multi");
        assert_eq!(output.cycles.len(), 1);
        assert_eq!(output.datasets.len(), 3);
        let first = &output.cycles[0].report.rmsd_history;
        assert!(first.last().unwrap() < &first[0]);
        for d in &output.datasets {
            let relative = d.relative_scale.unwrap();
            assert!((relative - 1.0).abs() < 0.1, "{}: {relative}", d.identifier);
        }
    }

    #[test]
    fn targeted_run_adds_a_joint_cycle() {
        let sample = SampleConfig {
            n_scaled: 1,
            ..small_sample()
        };
        let output = run_scale(&run_config(sample.clone())).unwrap();
        assert_eq!(output.scaler_kind, "target");
        assert_eq!(output.cycles.len(), 2);
        assert_eq!(output.cycles[1].scaler_kind, "multi");
        assert!(output.datasets.iter().all(|d| d.refined));

        let config = RunConfig {
            joint_cycle: false,
            ..run_config(sample)
        };
        let output = run_scale(&config).unwrap();
        assert_eq!(output.cycles.len(), 1);
        assert_eq!(output.datasets.iter().filter(|d| !d.refined).count(), 1);
    }

    #[test]
    fn joint_cycle_keeps_the_reference_scale() {
        use crate::domain::{Experiment, GroupKey, Intensity, Observation, ReflectionTable};

        let truth = [50.0, 80.0, 120.0, 200.0, 310.0];
        let table = |id: &str, factor: f64, stored: Option<f64>| {
            let observations = truth
                .iter()
                .enumerate()
                .map(|(h, &t)| {
                    let mut o = Observation::new(GroupKey(h as i32, 0, 0), Intensity::new(factor * t, 10.0));
                    o.inverse_scale_factor = stored;
                    o
                })
                .collect();
            ReflectionTable::new(id, observations)
        };
        let sample = SampleData {
            experiments: vec![Experiment::new("a", true), Experiment::new("b", false)],
            reflections: vec![table("a", 2.0, Some(2.0)), table("b", 3.0, None)],
            truth: vec![],
        };
        let config = RunConfig {
            model: ModelOptions {
                decay: false,
                ..ModelOptions::default()
            },
            ..run_config(small_sample())
        };

        let output = run_scale_with_sample(&config, sample).unwrap();
        assert_eq!(output.scaler_kind, "target");
        assert_eq!(output.cycles.len(), 2);
        assert!(output.cycles[1].report.rmsd_history[0] < 1e-6);

        let scale_of = |id: &str| {
            output
                .datasets
                .iter()
                .find(|d| d.identifier == id)
                .map(|d| d.fitted_scale)
                .unwrap()
        };
        assert!((scale_of("a") - 2.0).abs() < 1e-6, "a: {}", scale_of("a"));
        assert!((scale_of("b") - 3.0).abs() < 1e-6, "b: {}", scale_of("b"));
    }

    #[test]
    fn reference_run_keeps_the_reference_fixed() {
        let mut config = run_config(small_sample());
        config.scaling.target_reference = true;
        let output = run_scale(&config).unwrap();
        assert_eq!(output.cycles.len(), 1);
        let last = output.datasets.last().unwrap();
        assert!(!last.refined);
        assert_eq!(last.fitted_scale, 1.0);
        assert!(last.fitted_b.is_none());
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let rows = gradient_check(
            &small_sample(),
            &ScalingConfig::default(),
            &ModelOptions::default(),
            1e-6,
        )
        .unwrap();
        assert_eq!(rows.len(), 6);
        for row in &rows {
            assert!(row.relative_error < 1e-4, "{row:?}");
        }
    }

    #[test]
    fn non_positive_step_is_rejected() {
        let err = gradient_check(&small_sample(), &ScalingConfig::default(), &ModelOptions::default(), 0.0)
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
