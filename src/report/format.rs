//! Plain-text summaries of a scaling run and of a gradient check.

use crate::app::pipeline::{GradientCheckRow, RunOutput};
use crate::domain::ScalingConfig;
use crate::fit::RMSD_UNITS;

/// Format the full run summary (settings, cycles, per-dataset scales).
pub fn format_run_summary(run: &RunOutput, config: &ScalingConfig) -> String {
    let mut out = String::new();

    out.push_str("=== rscale - multi-dataset intensity scaling ===\n");
    out.push_str(&format!(
        "Intensities: {:?} | weighting: {:?}\n",
        config.intensity_choice, config.weighting
    ));
    out.push_str(&format!(
        "Cuts: partiality > {:.2} | I/sigma > {:.2}\n",
        config.partiality_cutoff, config.min_isigi
    ));
    out.push_str(&format!("Scaler: {}\n", run.scaler_kind));
    if !run.removed.is_empty() {
        out.push_str(&format!("Removed datasets: {}\n", run.removed.join(", ")));
    }

    out.push_str("\nRefinement cycles:\n");
    for (i, cycle) in run.cycles.iter().enumerate() {
        let report = &cycle.report;
        out.push_str(&format!(
            "{} {:<7} obs={} groups={} iterations={} converged={} objective={:.6e}\n",
            i + 1,
            cycle.scaler_kind,
            cycle.n_observations,
            cycle.n_groups,
            report.iterations,
            report.converged,
            report.objective,
        ));
        out.push_str(&format!(
            "  rmsd ({}): {}\n",
            RMSD_UNITS[0],
            fmt_history(&report.rmsd_history)
        ));
    }

    out.push_str("\nDatasets:\n");
    out.push_str(&format!(
        "{:<16} {:>7} {:>7} {:>7} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "id", "role", "refl", "used", "scale", "B", "true k", "true B", "rel"
    ));
    for d in &run.datasets {
        out.push_str(&format!(
            "{:<16} {:>7} {:>7} {:>7} {:>9.4} {:>9} {:>9} {:>9} {:>9}\n",
            truncate(&d.identifier, 16),
            if d.refined { "refined" } else { "fixed" },
            d.n_reflections,
            d.n_admissible,
            d.fitted_scale,
            fmt_opt(d.fitted_b, 3),
            fmt_opt(d.true_scale, 4),
            fmt_opt(d.true_b, 3),
            fmt_opt(d.relative_scale, 4),
        ));
    }

    out
}

/// Format a gradient check as a table, worst row last.
pub fn format_gradient_check(rows: &[GradientCheckRow]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:>5} {:>16} {:>16} {:>12}\n",
        "param", "analytic", "finite diff", "rel error"
    ));
    for row in rows {
        out.push_str(&format!(
            "{:>5} {:>16.8e} {:>16.8e} {:>12.3e}\n",
            row.parameter, row.analytic, row.finite_difference, row.relative_error
        ));
    }
    let worst = rows.iter().map(|r| r.relative_error).fold(0.0, f64::max);
    out.push_str(&format!("max relative error: {worst:.3e}\n"));
    out
}

fn fmt_history(v: &[f64]) -> String {
    match v {
        [] => "[]".to_string(),
        [only] => format!("[{only:.6}]"),
        [first, .., last] => format!("{first:.6} -> {last:.6} ({} steps)", v.len() - 1),
    }
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    v.map(|x| format!("{x:.precision$}")).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('~');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::pipeline::{CycleSummary, DatasetSummary};
    use crate::fit::RefineReport;

    fn run() -> RunOutput {
        RunOutput {
            scaler_kind: "target".to_string(),
            cycles: vec![CycleSummary {
                scaler_kind: "target".to_string(),
                n_observations: 120,
                n_groups: 40,
                report: RefineReport {
                    iterations: 4,
                    converged: true,
                    rmsd_history: vec![3.5, 1.2, 0.9],
                    objective: 12.5,
                    parameters: vec![1.5, -2.0],
                },
            }],
            datasets: vec![
                DatasetSummary {
                    identifier: "dataset-1".to_string(),
                    refined: true,
                    n_reflections: 60,
                    n_admissible: 58,
                    fitted_scale: 1.5,
                    fitted_b: Some(-2.0),
                    true_scale: Some(1.5),
                    true_b: Some(-2.0),
                    relative_scale: Some(1.0),
                },
                DatasetSummary {
                    identifier: "a-rather-long-dataset-name".to_string(),
                    refined: false,
                    n_reflections: 62,
                    n_admissible: 62,
                    fitted_scale: 1.0,
                    fitted_b: None,
                    true_scale: None,
                    true_b: None,
                    relative_scale: None,
                },
            ],
            removed: vec!["dataset-3".to_string()],
        }
    }

    #[test]
    fn run_summary_lists_cycles_and_datasets() {
        let text = format_run_summary(&run(), &ScalingConfig::default());
        assert!(text.contains("Scaler: target"));
        assert!(text.contains("Removed datasets: dataset-3"));
        assert!(text.contains("rmsd (a.u): 3.500000 -> 0.900000 (2 steps)"));
        assert!(text.contains("refined"));
        assert!(text.contains("a-rather-long-d~"));
        assert!(!text.contains("a-rather-long-dataset-name"));
    }

    #[test]
    fn gradient_check_reports_worst_error() {
        let rows = vec![
            GradientCheckRow {
                parameter: 0,
                analytic: 2.0,
                finite_difference: 2.0,
                relative_error: 1e-9,
            },
            GradientCheckRow {
                parameter: 1,
                analytic: -4.0,
                finite_difference: -4.0001,
                relative_error: 2.5e-5,
            },
        ];
        let text = format_gradient_check(&rows);
        assert!(text.contains("max relative error: 2.500e-5"));
    }

    #[test]
    fn history_formats() {
        assert_eq!(fmt_history(&[]), "[]");
        assert_eq!(fmt_history(&[0.5]), "[0.500000]");
        assert_eq!(fmt_opt(None, 3), "-");
        assert_eq!(fmt_opt(Some(1.23456), 2), "1.23");
    }
}
