//! Sweep driver
//!
//! Iterates (window size, central layer) pairs, derives the per-point
//! hyperparameter overrides, runs the case loop (unless in aggregate-only
//! mode), and folds all per-point tables into one tagged summary CSV.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::aggregate::{aggregate, SweepTable};
use crate::editors::Alg;
use crate::hparams::{EMBED_LAYER, SWEEP_ALL_LAYERS};
use crate::model::EditableModel;
use crate::objective::ObjectiveMode;
use crate::runner::{resolve_experiment_name, run_sweep_point, sweep_csv_name, RunConfig};
use crate::upload::upload_results;
use crate::windows::select_overrides;

/// Fallback case-file scan depth when no dataset limit is set
const DEFAULT_AGGREGATE_DEPTH: usize = 1000;

/// Metrics printed when the sweep collapses to a single point
const SUMMARY_METRICS: [&str; 8] = [
    "post_rewrite_success",
    "post_rewrite_diff",
    "post_neighborhood_success",
    "post_neighborhood_diff",
    "post_paraphrase_success",
    "post_paraphrase_diff",
    "essence_ppl_diff",
    "post_score",
];

/// Full sweep configuration
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub run: RunConfig,
    pub window_sizes: Vec<usize>,
    /// Pinned central layer, or [`SWEEP_ALL_LAYERS`] to use the grid
    pub edit_layer: i64,
    /// When false, skip the case loop and only aggregate existing results
    pub run_experiments: bool,
    /// Object-storage endpoint for the summary CSV; `None` skips upload
    pub upload_endpoint: Option<String>,
}

/// Default central-layer grid: every fourth layer plus the last, with the
/// embedding sentinel prepended for window-1 fine-tuning outside the
/// fact-forcing objective
pub fn central_layer_grid(
    alg: Alg,
    objective: ObjectiveMode,
    n_layers: usize,
    window_sizes: &[usize],
) -> Vec<i64> {
    let last = n_layers as i64 - 1;
    let mut layers: Vec<i64> = (0..n_layers as i64).step_by(4).collect();
    if !layers.contains(&last) {
        layers.push(last);
    }
    if alg == Alg::FineTune
        && window_sizes.contains(&1)
        && objective != ObjectiveMode::FactForcing
    {
        layers.insert(0, EMBED_LAYER);
    }
    layers
}

/// Run the whole sweep and write the combined summary CSV
pub fn run_sweep(model: &mut EditableModel, cfg: &SweepConfig) -> Result<(SweepTable, PathBuf)> {
    let n_layers = model.n_layers();
    let central_layers = if cfg.edit_layer > SWEEP_ALL_LAYERS {
        vec![cfg.edit_layer]
    } else {
        central_layer_grid(cfg.run.alg, cfg.run.objective, n_layers, &cfg.window_sizes)
    };

    println!("Starting sweep with hparams:");
    println!("- window_sizes:   {:?}", cfg.window_sizes);
    println!("- central_layers: {central_layers:?}");

    let aggregate_depth = cfg
        .run
        .dataset_size_limit
        .unwrap_or(DEFAULT_AGGREGATE_DEPTH);

    let mut combined = SweepTable::default();
    for &window_size in &cfg.window_sizes {
        for &central_layer in &central_layers {
            let overrides = select_overrides(
                window_size,
                central_layer,
                cfg.run.alg,
                n_layers,
                cfg.run.objective,
            )?;

            let exp_name = if cfg.run_experiments {
                run_sweep_point(model, &cfg.run, &overrides)?.experiment_name
            } else {
                resolve_experiment_name(&cfg.run, &overrides)?
            };

            let mut table = aggregate(&cfg.run.results_dir, &exp_name, aggregate_depth)?;
            info!(
                "sweep point ws={window_size} layer={central_layer}: {} row(s)",
                table.len()
            );
            table.tag(cfg.run.alg.name(), central_layer, window_size);
            combined.extend(table);
        }
    }

    let file_name = sweep_csv_name(&cfg.run, &cfg.window_sizes, cfg.edit_layer);
    let save_path = cfg.run.results_dir.join(&file_name);
    combined.write_csv(&save_path)?;
    println!("saving csv at {}...", save_path.display());

    if let Some(endpoint) = &cfg.upload_endpoint {
        // the local CSV already exists; a failed upload is not fatal
        if let Err(err) = upload_results(endpoint, &format!("output/{file_name}"), &save_path) {
            warn!("upload failed: {err:#}");
        }
    }

    if cfg.window_sizes.len() == 1 && central_layers.len() == 1 {
        println!("\nfinal metrics:");
        for metric in SUMMARY_METRICS {
            match combined.column_mean(metric) {
                Some(mean) => println!(" {metric:<26} {mean:.3}"),
                None => println!(" missing {metric}"),
            }
        }
    }

    Ok((combined, save_path))
}
