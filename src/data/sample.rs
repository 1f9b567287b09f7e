//! Synthetic multi-dataset generation.
//!
//! Every dataset observes the same set of unique reflections. Each unscaled
//! dataset applies its own true scale `k` and B-factor `B`, so an observation of
//! group `h` at resolution `d` has expected intensity
//!
//! ```text
//! k · exp(B / (2 d²)) · I_h
//! ```
//!
//! Already-scaled datasets use `k = 1, B = 0` and carry unit inverse scale
//! factors. A fraction of observations is split into two partial fragments and
//! a fraction gets a non-positive variance, to exercise preprocessing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Exp, Normal};
use serde::Serialize;

use crate::domain::{Experiment, GroupKey, Intensity, Observation, ReflectionTable};
use crate::error::{ScaleError, ScaleResult};

/// Range of d-spacings (Å) unique reflections are drawn from.
const D_MIN: f64 = 1.2;
const D_MAX: f64 = 6.0;

/// Images per dataset; sets the `z` range of centroids.
const N_IMAGES: f64 = 360.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleConfig {
    pub seed: u64,
    pub n_datasets: usize,
    pub n_unique: usize,
    /// Mean observations per unique reflection per dataset.
    pub multiplicity: usize,
    /// The first `n_scaled` datasets are already on the reference scale.
    pub n_scaled: usize,
    /// Relative intensity noise.
    pub noise: f64,
    pub partial_fraction: f64,
    pub bad_variance_fraction: f64,
    pub absorption_terms: usize,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            n_datasets: 3,
            n_unique: 200,
            multiplicity: 3,
            n_scaled: 0,
            noise: 0.03,
            partial_fraction: 0.05,
            bad_variance_fraction: 0.01,
            absorption_terms: 0,
        }
    }
}

impl SampleConfig {
    pub fn validate(&self) -> ScaleResult<()> {
        if self.n_datasets == 0 || self.n_unique == 0 || self.multiplicity == 0 {
            return Err(ScaleError::invalid(
                "sample needs at least one dataset, reflection and observation",
            ));
        }
        if self.n_scaled > self.n_datasets {
            return Err(ScaleError::invalid(format!(
                "{} scaled datasets requested out of {}",
                self.n_scaled, self.n_datasets
            )));
        }
        for (name, v) in [
            ("partial fraction", self.partial_fraction),
            ("bad variance fraction", self.bad_variance_fraction),
        ] {
            if !(v.is_finite() && (0.0..1.0).contains(&v)) {
                return Err(ScaleError::invalid(format!("{name} must lie in [0, 1), got {v}")));
            }
        }
        if !(self.noise.is_finite() && self.noise >= 0.0) {
            return Err(ScaleError::invalid(format!("noise must be non-negative, got {}", self.noise)));
        }
        Ok(())
    }
}

/// True per-dataset parameters the generator applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrueScale {
    pub identifier: String,
    pub scale: f64,
    pub b_factor: f64,
}

#[derive(Debug, Clone)]
pub struct SampleData {
    pub experiments: Vec<Experiment>,
    pub reflections: Vec<ReflectionTable>,
    pub truth: Vec<TrueScale>,
}

pub fn generate_sample(config: &SampleConfig) -> ScaleResult<SampleData> {
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(sample_seed(config));
    let normal = Normal::new(0.0, 1.0).map_err(|e| ScaleError::invalid(format!("noise distribution: {e}")))?;
    let intensity_dist =
        Exp::new(1.0 / 500.0).map_err(|e| ScaleError::invalid(format!("intensity distribution: {e}")))?;

    // Unique reflections: key, true intensity, resolution.
    let uniques: Vec<(GroupKey, f64, f64)> = (0..config.n_unique)
        .map(|i| {
            let i = i as i32;
            let key = GroupKey(i % 17, (i / 17) % 13, i / 221);
            let intensity = intensity_dist.sample(&mut rng) + 5.0;
            let d = rng.gen_range(D_MIN..D_MAX);
            (key, intensity, d)
        })
        .collect();

    let mut experiments = Vec::with_capacity(config.n_datasets);
    let mut reflections = Vec::with_capacity(config.n_datasets);
    let mut truth = Vec::with_capacity(config.n_datasets);
    let mut next_partial_id = 0u64;

    for dataset in 0..config.n_datasets {
        let identifier = format!("dataset-{dataset}");
        let is_scaled = dataset < config.n_scaled;
        let (scale, b_factor) = if is_scaled {
            (1.0, 0.0)
        } else {
            (rng.gen_range(0.4..2.5), rng.gen_range(-8.0..0.0))
        };

        let mut observations = Vec::with_capacity(config.n_unique * config.multiplicity);
        for &(key, true_intensity, d) in &uniques {
            // Multiplicity varies between 1 and 2x the mean.
            let n_obs = rng.gen_range(1..=2 * config.multiplicity);
            for _ in 0..n_obs {
                let basis: Vec<f64> = (0..config.absorption_terms).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let expected = scale * (b_factor / (2.0 * d * d)).exp() * true_intensity;
                let sigma = (config.noise * expected).hypot(expected.abs().sqrt()).max(1e-3);
                let value = expected + sigma * normal.sample(&mut rng);
                let variance = if rng.r#gen::<f64>() < config.bad_variance_fraction {
                    0.0
                } else {
                    sigma * sigma
                };
                let xyz = [
                    rng.gen_range(0.0..2048.0),
                    rng.gen_range(0.0..2048.0),
                    rng.gen_range(0.0..N_IMAGES),
                ];

                let mut base = Observation::new(key, Intensity::new(value, variance));
                base.d = d;
                base.xyz = xyz;
                base.absorption_basis = basis;
                if is_scaled {
                    base.inverse_scale_factor = Some(1.0);
                }

                if rng.r#gen::<f64>() < config.partial_fraction {
                    let split = rng.gen_range(0.45..0.55);
                    let partial_id = next_partial_id;
                    next_partial_id += 1;
                    for fraction in [split, 1.0 - split] {
                        let mut fragment = base.clone();
                        let part = Intensity::new(value * fraction, variance * fraction);
                        fragment.intensity_sum = Some(part);
                        fragment.intensity_prf = Some(part);
                        fragment.intensity = part.value;
                        fragment.variance = part.variance;
                        fragment.partiality = fraction;
                        fragment.partial_id = Some(partial_id);
                        observations.push(fragment);
                    }
                } else {
                    observations.push(base);
                }
            }
        }

        experiments.push(Experiment::new(identifier.clone(), is_scaled));
        reflections.push(ReflectionTable::new(identifier.clone(), observations));
        truth.push(TrueScale {
            identifier,
            scale,
            b_factor,
        });
    }

    Ok(SampleData {
        experiments,
        reflections,
        truth,
    })
}

fn sample_seed(config: &SampleConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.seed.hash(&mut hasher);
    config.n_datasets.hash(&mut hasher);
    config.n_unique.hash(&mut hasher);
    config.multiplicity.hash(&mut hasher);
    config.n_scaled.hash(&mut hasher);
    config.noise.to_bits().hash(&mut hasher);
    config.partial_fraction.to_bits().hash(&mut hasher);
    config.bad_variance_fraction.to_bits().hash(&mut hasher);
    config.absorption_terms.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let config = SampleConfig {
            n_unique: 20,
            ..SampleConfig::default()
        };
        let a = generate_sample(&config).unwrap();
        let b = generate_sample(&config).unwrap();
        assert_eq!(a.reflections, b.reflections);
        assert_eq!(a.truth, b.truth);
    }

    #[test]
    fn scaled_datasets_carry_unit_scales() {
        let config = SampleConfig {
            n_unique: 10,
            n_datasets: 3,
            n_scaled: 2,
            ..SampleConfig::default()
        };
        let sample = generate_sample(&config).unwrap();
        assert!(sample.experiments[0].scaling_model.is_scaled);
        assert!(!sample.experiments[2].scaling_model.is_scaled);
        assert_eq!(sample.truth[1].scale, 1.0);
        assert!(
            sample.reflections[0]
                .observations
                .iter()
                .all(|o| o.inverse_scale_factor == Some(1.0))
        );
        assert_eq!(sample.reflections[2].experiment_identifiers[&0], "dataset-2");
    }

    #[test]
    fn split_partials_share_an_id() {
        let config = SampleConfig {
            n_unique: 50,
            partial_fraction: 0.5,
            ..SampleConfig::default()
        };
        let sample = generate_sample(&config).unwrap();
        let obs = &sample.reflections[0].observations;
        let first = obs.iter().position(|o| o.partial_id.is_some()).unwrap();
        assert_eq!(obs[first].partial_id, obs[first + 1].partial_id);
        assert!((obs[first].partiality + obs[first + 1].partiality - 1.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let config = SampleConfig {
            n_scaled: 5,
            ..SampleConfig::default()
        };
        assert!(generate_sample(&config).is_err());
        let config = SampleConfig {
            partial_fraction: 1.5,
            ..SampleConfig::default()
        };
        assert!(generate_sample(&config).is_err());
    }
}
