//! Command-line parsing for the `rscale` scaling driver.
//!
//! Argument parsing and command dispatch stay separate from the engine; the
//! app layer turns these structs into a `ScalingConfig` and a run config.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{IntensityChoice, WeightingScheme};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "rscale", version, about = "Scale symmetry-related diffraction intensities onto a common scale")]
pub struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate synthetic datasets, build a scaler and refine the scale models.
    Scale(ScaleArgs),
    /// Compare analytic and finite-difference gradients on synthetic data.
    Gradcheck(GradcheckArgs),
}

/// Synthetic data options shared by both commands.
#[derive(Debug, Args, Clone)]
pub struct SampleArgs {
    /// Random seed for data generation.
    #[arg(long, default_value_t = 7)]
    pub seed: u64,

    /// Number of datasets.
    #[arg(short = 'n', long, default_value_t = 3)]
    pub datasets: usize,

    /// Number of unique reflections shared by all datasets.
    #[arg(long, default_value_t = 300)]
    pub unique: usize,

    /// Mean observations per unique reflection per dataset.
    #[arg(long, default_value_t = 3)]
    pub multiplicity: usize,

    /// Number of datasets already on the reference scale (taken from the front).
    #[arg(long, default_value_t = 0)]
    pub scaled: usize,

    /// Relative intensity noise.
    #[arg(long, default_value_t = 0.03)]
    pub noise: f64,

    /// Fraction of observations split into two partial fragments.
    #[arg(long, default_value_t = 0.05)]
    pub partial_fraction: f64,

    /// Fraction of observations given a non-positive variance.
    #[arg(long, default_value_t = 0.01)]
    pub bad_variance_fraction: f64,

    /// Absorption basis terms per observation (0 disables the component).
    #[arg(long, default_value_t = 0)]
    pub absorption_terms: usize,
}

#[derive(Debug, Args, Clone)]
pub struct ScaleArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// JSON file with scaling options; flags below override it.
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Exclude observations with partiality at or below this value.
    #[arg(long)]
    pub partiality_cutoff: Option<f64>,

    /// Exclude observations with I/sigma at or below this value.
    #[arg(long)]
    pub min_isigi: Option<f64>,

    /// Intensity used for scaling.
    #[arg(long, value_enum)]
    pub intensity_choice: Option<IntensityChoice>,

    /// Observation weighting.
    #[arg(long, value_enum)]
    pub weighting: Option<WeightingScheme>,

    /// Refine all datasets jointly even when some are already scaled.
    #[arg(long)]
    pub no_target_cycle: bool,

    /// Treat the last dataset as an external reference.
    #[arg(long)]
    pub target_reference: bool,

    /// After a targeted cycle, skip the joint refinement of all datasets.
    #[arg(long)]
    pub no_joint_cycle: bool,

    /// Disable the B-factor decay component.
    #[arg(long)]
    pub no_decay: bool,

    /// Restraint weight on absorption coefficients.
    #[arg(long, default_value_t = 1e3)]
    pub surface_weight: f64,

    /// Maximum refinement iterations per cycle.
    #[arg(long, default_value_t = 30)]
    pub max_iterations: usize,

    /// Relative convergence tolerance.
    #[arg(long, default_value_t = 1e-8)]
    pub tolerance: f64,

    /// Write the run summary to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct GradcheckArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Central-difference step.
    #[arg(long, default_value_t = 1e-6)]
    pub step: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_flags_parse() {
        let cli = Cli::parse_from([
            "rscale",
            "scale",
            "-n",
            "4",
            "--scaled",
            "1",
            "--weighting",
            "unity",
            "--intensity-choice",
            "sum",
            "--target-reference",
        ]);
        let Command::Scale(args) = cli.command else {
            panic!("expected the scale command");
        };
        assert_eq!(args.sample.datasets, 4);
        assert_eq!(args.sample.scaled, 1);
        assert_eq!(args.weighting, Some(WeightingScheme::Unity));
        assert_eq!(args.intensity_choice, Some(IntensityChoice::Sum));
        assert!(args.target_reference);
        assert!(args.partiality_cutoff.is_none());
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::parse_from(["rscale", "gradcheck", "--verbose", "--unique", "20"]);
        assert!(cli.verbose);
        let Command::Gradcheck(args) = cli.command else {
            panic!("expected the gradcheck command");
        };
        assert_eq!(args.sample.unique, 20);
    }
}
