//! Export a run summary to JSON.
//!
//! The export carries the options the run used, every refinement cycle and
//! the final per-dataset scales, so it can be diffed between runs.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::pipeline::{CycleSummary, DatasetSummary, RunOutput};
use crate::domain::ScalingConfig;
use crate::error::{ScaleError, ScaleResult};

#[derive(Debug, Serialize)]
pub struct RunExport<'a> {
    pub tool: &'static str,
    pub created: DateTime<Utc>,
    pub config: &'a ScalingConfig,
    pub scaler_kind: &'a str,
    pub removed: &'a [String],
    pub cycles: &'a [CycleSummary],
    pub datasets: &'a [DatasetSummary],
}

impl<'a> RunExport<'a> {
    pub fn new(run: &'a RunOutput, config: &'a ScalingConfig) -> Self {
        Self {
            tool: "rscale",
            created: Utc::now(),
            config,
            scaler_kind: &run.scaler_kind,
            removed: &run.removed,
            cycles: &run.cycles,
            datasets: &run.datasets,
        }
    }
}

pub fn write_run_json(path: &Path, run: &RunOutput, config: &ScalingConfig) -> ScaleResult<()> {
    let file = File::create(path)
        .map_err(|e| ScaleError::Io(format!("failed to create export '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &RunExport::new(run, config))
        .map_err(|e| ScaleError::Json(format!("failed to write export: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::RefineReport;

    #[test]
    fn export_round_trips_through_serde_json() {
        let run = RunOutput {
            scaler_kind: "multi".to_string(),
            cycles: vec![CycleSummary {
                scaler_kind: "multi".to_string(),
                n_observations: 10,
                n_groups: 4,
                report: RefineReport {
                    iterations: 2,
                    converged: true,
                    rmsd_history: vec![2.0, 0.5],
                    objective: 1.0,
                    parameters: vec![1.1],
                },
            }],
            datasets: Vec::new(),
            removed: Vec::new(),
        };
        let path = std::env::temp_dir().join(format!("rscale-export-{}.json", std::process::id()));
        write_run_json(&path, &run, &ScalingConfig::default()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["tool"], "rscale");
        assert_eq!(value["scaler_kind"], "multi");
        assert_eq!(value["cycles"][0]["report"]["iterations"], 2);
        assert_eq!(value["config"]["weighting"], "inverse_variance");
        assert!(value["created"].is_string());
    }
}
