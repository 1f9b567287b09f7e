//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the real main that:
//! - parses CLI arguments and installs logging
//! - merges the JSON config file with flag overrides
//! - runs the scaling pipeline or the gradient check
//! - prints reports and writes the optional export

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, GradcheckArgs, SampleArgs, ScaleArgs};
use crate::data::SampleConfig;
use crate::domain::ScalingConfig;
use crate::error::{ScaleError, ScaleResult};
use crate::fit::RefineOptions;

pub mod pipeline;

use pipeline::{ModelOptions, RunConfig};

/// Entry point for the `rscale` binary.
pub fn run() -> ScaleResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Scale(args) => handle_scale(&args),
        Command::Gradcheck(args) => handle_gradcheck(&args),
    }
}

/// `RUST_LOG` wins over `--verbose`. Logs go to stderr so reports stay
/// pipeable.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_scale(args: &ScaleArgs) -> ScaleResult<()> {
    let config = run_config_from_args(args)?;
    let run = pipeline::run_scale(&config)?;

    println!("{}", crate::report::format_run_summary(&run, &config.scaling));

    if let Some(path) = &args.export {
        crate::io::write_run_json(path, &run, &config.scaling)?;
        tracing::info!("Wrote run summary to {}", path.display());
    }
    Ok(())
}

fn handle_gradcheck(args: &GradcheckArgs) -> ScaleResult<()> {
    let sample = sample_config_from_args(&args.sample);
    let model = ModelOptions {
        absorption_terms: sample.absorption_terms,
        ..ModelOptions::default()
    };
    let rows = pipeline::gradient_check(&sample, &ScalingConfig::default(), &model, args.step)?;
    println!("{}", crate::report::format_gradient_check(&rows));
    Ok(())
}

pub fn sample_config_from_args(args: &SampleArgs) -> SampleConfig {
    SampleConfig {
        seed: args.seed,
        n_datasets: args.datasets,
        n_unique: args.unique,
        multiplicity: args.multiplicity,
        n_scaled: args.scaled,
        noise: args.noise,
        partial_fraction: args.partial_fraction,
        bad_variance_fraction: args.bad_variance_fraction,
        absorption_terms: args.absorption_terms,
    }
}

/// File options first, then explicit flags on top.
pub fn scaling_config_from_args(args: &ScaleArgs) -> ScaleResult<ScalingConfig> {
    let mut config = match &args.config {
        Some(path) => crate::io::read_scaling_config(path)?,
        None => ScalingConfig::default(),
    };
    if let Some(v) = args.partiality_cutoff {
        config.partiality_cutoff = v;
    }
    if let Some(v) = args.min_isigi {
        config.min_isigi = v;
    }
    if let Some(v) = args.intensity_choice {
        config.intensity_choice = v;
    }
    if let Some(v) = args.weighting {
        config.weighting = v;
    }
    if args.no_target_cycle {
        config.target_cycle = false;
    }
    if args.target_reference {
        config.target_reference = true;
    }
    config.validate().map_err(ScaleError::InvalidInput)?;
    Ok(config)
}

pub fn run_config_from_args(args: &ScaleArgs) -> ScaleResult<RunConfig> {
    let sample = sample_config_from_args(&args.sample);
    let model = ModelOptions {
        decay: !args.no_decay,
        absorption_terms: sample.absorption_terms,
        surface_weight: args.surface_weight,
    };
    Ok(RunConfig {
        scaling: scaling_config_from_args(args)?,
        model,
        refine: RefineOptions {
            max_iterations: args.max_iterations,
            tolerance: args.tolerance,
            ..RefineOptions::default()
        },
        joint_cycle: !args.no_joint_cycle,
        sample,
    })
}
