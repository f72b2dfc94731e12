//! Case loop with idempotent checkpointing
//!
//! One result file per case inside a run directory whose name is derived
//! deterministically from the configuration; the file's presence is the
//! sole resume signal. Cases are processed strictly sequentially because
//! every edit mutates the shared model state, which must be restored
//! before the next case starts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::dataset::{Dataset, SnippetStore};
use crate::editors::{apply_edit, restore_weights, Alg, EditTask, MemoryPolicy};
use crate::eval::{evaluate_case, MetricsRecord, TfIdfVectorizer};
use crate::hparams::{HyperParams, Overrides};
use crate::model::EditableModel;
use crate::objective::ObjectiveMode;
use crate::trace::construct_target;

/// Continuation length for the correctness pre-filter gate
const CORRECTNESS_DECODE_STEPS: usize = 48;

/// Generations per subject for essence references
const ESSENCE_SAMPLES: usize = 5;
const ESSENCE_MAX_TOKENS: usize = 100;

/// Configuration for one run (fixed across all sweep points)
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub alg: Alg,
    pub model_name: String,
    pub ds_name: String,
    pub data_path: PathBuf,
    pub snippet_path: Option<PathBuf>,
    pub dataset_size_limit: Option<usize>,
    pub do_essence_tests: bool,
    pub skip_generation_tests: bool,
    pub conserve_memory: bool,
    pub verbose: bool,
    pub overwrite: bool,
    pub correctness_check: bool,
    /// Minimum unedited probability of the true target; `0` disables
    pub target_prob_check: f64,
    pub objective: ObjectiveMode,
    pub results_dir: PathBuf,
    pub hparams_dir: PathBuf,
}

/// What one sweep point did
#[derive(Debug)]
pub struct RunOutcome {
    pub experiment_name: String,
    pub run_dir: PathBuf,
    /// Cases actually edited in this invocation
    pub cases_edited: usize,
    /// Cases skipped because their result file already existed
    pub cases_skipped_existing: usize,
    /// Cases skipped by the pre-filter gates (no file written)
    pub cases_gated: usize,
}

/// Deterministic experiment name from configuration + resolved overrides
///
/// Layer sentinels read as `embeds` / `all`; objective tags are folded in
/// as extra key-value pairs; keys are truncated to five characters.
pub fn experiment_name(
    cfg: &RunConfig,
    important_hparams: &[(String, String)],
) -> String {
    let model_short = cfg
        .model_name
        .rsplit('/')
        .next()
        .unwrap_or(&cfg.model_name);
    let mut name = format!("{}/{}_outputs_{}", model_short, cfg.alg.name(), cfg.ds_name);
    let mut params = important_hparams.to_vec();
    params.extend(cfg.objective.name_params());
    for (k, v) in params {
        let key = &k[..k.len().min(5)];
        name.push_str(&format!("_{key}-{v}"));
    }
    name
}

/// Result-file path for a case inside a run directory
pub fn case_result_path(run_dir: &Path, case_id: &str) -> PathBuf {
    run_dir.join(format!("case_{case_id}.json"))
}

/// Resolve the experiment name a sweep point would use, without running it
///
/// Used by aggregate-only mode: loads the hyperparameter artifact, applies
/// the overrides, and derives the same name `run_sweep_point` would.
pub fn resolve_experiment_name(cfg: &RunConfig, overrides: &Overrides) -> Result<String> {
    let params_path = HyperParams::artifact_path(&cfg.hparams_dir, cfg.alg, &cfg.model_name);
    let mut hparams = HyperParams::from_json(&params_path)?;
    hparams.apply_overrides(overrides);
    Ok(experiment_name(cfg, &hparams.important(overrides)))
}

/// Whole-file atomic write: temp file in the same directory, then rename
fn write_record_atomically(path: &Path, record: &MetricsRecord) -> Result<()> {
    let payload = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, payload)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move record into place at {}", path.display()))?;
    Ok(())
}

/// Run the case loop for one sweep point
///
/// Fatal conditions (missing hyperparameter file, unknown dataset,
/// unlocatable subject span, editor failure) abort the whole run; gated
/// cases are skipped without leaving any trace so a rerun revisits them.
pub fn run_sweep_point(
    model: &mut EditableModel,
    cfg: &RunConfig,
    overrides: &Overrides,
) -> Result<RunOutcome> {
    let params_path = HyperParams::artifact_path(&cfg.hparams_dir, cfg.alg, &cfg.model_name);
    let mut hparams = HyperParams::from_json(&params_path)?;
    hparams.apply_overrides(overrides);
    let important = hparams.important(overrides);
    println!(
        "Executing {} with layers {:?}",
        cfg.alg.name(),
        hparams.layers
    );

    let exp_name = experiment_name(cfg, &important);
    let run_dir = cfg.results_dir.join(&exp_name);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;
    println!("Results will be stored at {}", run_dir.display());

    // keep a copy of the source hyperparameters next to the results
    let hparams_copy = run_dir.join("hparams.json");
    if !hparams_copy.exists() {
        std::fs::copy(&params_path, &hparams_copy)
            .with_context(|| format!("failed to copy hparams into {}", run_dir.display()))?;
    }

    let dataset = Dataset::load(&cfg.ds_name, &cfg.data_path, cfg.dataset_size_limit)?;
    let mut snips = SnippetStore::load(cfg.snippet_path.as_deref())?;
    info!("loaded {} cases", dataset.len());

    let policy = MemoryPolicy::from_conserve_flag(cfg.conserve_memory);
    let mut outcome = RunOutcome {
        experiment_name: exp_name,
        run_dir: run_dir.clone(),
        cases_edited: 0,
        cases_skipped_existing: 0,
        cases_gated: 0,
    };

    for case in dataset.cases() {
        let case_id = case.case_id_string();
        let result_path = case_result_path(&run_dir, &case_id);
        if result_path.exists() && !cfg.overwrite {
            if cfg.verbose {
                println!("skipping {}, already run", result_path.display());
            }
            outcome.cases_skipped_existing += 1;
            continue;
        }

        println!("Starting point: {case_id}");
        let mut case = case.clone();
        let prompt = case.requested_rewrite.full_prompt();
        let target_true = case.requested_rewrite.target_true.str.clone();
        if cfg.verbose {
            println!(
                "Updating point: [{prompt}] -> [{}]\n True label: {target_true}",
                case.requested_rewrite.target_new.str
            );
        }

        // pre-filter gates: a case must pass at least one active gate;
        // gated-out cases leave no file and are retried on the next run
        if cfg.correctness_check || cfg.target_prob_check > 0.0 {
            let mut pass = false;
            if cfg.correctness_check {
                let continuation =
                    model.greedy_continuation(&prompt, CORRECTNESS_DECODE_STEPS)?;
                if continuation.contains(target_true.trim()) {
                    pass = true;
                }
            }
            if !pass && cfg.target_prob_check > 0.0 {
                let prob = model.score_target_prob(&prompt, &target_true)?;
                if prob > cfg.target_prob_check {
                    pass = true;
                }
            }
            if !pass {
                if cfg.verbose {
                    println!(" Skipping this point: incorrect and below the minimum target prob");
                }
                outcome.cases_gated += 1;
                continue;
            }
        }

        // make sure essence references exist before the model is edited
        let subject = case.requested_rewrite.subject.clone();
        if (cfg.do_essence_tests || !cfg.skip_generation_tests)
            && snips.get(&subject).map_or(true, |texts| texts.is_empty())
        {
            let essence_prompt = format!("{subject} is a");
            let texts =
                model.generate_texts(&essence_prompt, ESSENCE_SAMPLES, ESSENCE_MAX_TOKENS)?;
            snips.insert(subject.clone(), texts);
        }

        // decide what success means for this case under the active objective
        let prior_prob =
            construct_target(cfg.objective, model, &mut case.requested_rewrite, &hparams)?;
        if cfg.verbose {
            println!(
                " request baseline: {:?}",
                case.requested_rewrite.request_baseline
            );
        }

        let task = EditTask {
            objective: cfg.objective,
            prior_prob,
        };
        let requests = vec![case.requested_rewrite.clone()];
        let (backup, exec_time) = apply_edit(model, cfg.alg, &requests, &hparams, policy, &task)?;
        println!("Execution took {exec_time:.2}s");

        let fast_mode = cfg.skip_generation_tests && !cfg.do_essence_tests;
        let vectorizer = if cfg.skip_generation_tests {
            None
        } else {
            snips.get(&subject).map(|refs| TfIdfVectorizer::fit(refs))
        };

        // post-edit metrics first, then restore, then pre-edit metrics on
        // the restored model: the ordering avoids a redundant model copy
        // and says nothing about edit chronology
        let eval_start = std::time::Instant::now();
        let post = evaluate_case(model, &case, &snips, vectorizer.as_ref(), fast_mode);
        let restored = restore_weights(model, &backup);
        let post = match (post, restored) {
            (Ok(post), Ok(())) => post,
            (post, restored) => {
                // surface the first failure; restoration already ran
                restored?;
                post?;
                unreachable!("one of the two results must be an error");
            }
        };
        let pre = evaluate_case(model, &case, &snips, vectorizer.as_ref(), fast_mode)?;
        println!("Evaluation took {:.2}s", eval_start.elapsed().as_secs_f64());

        let record = MetricsRecord {
            case_id: case.case_id.clone(),
            requested_rewrite: case.requested_rewrite.clone(),
            time: exec_time,
            pre,
            post,
        };
        write_record_atomically(&result_path, &record)?;
        outcome.cases_edited += 1;
        println!();
    }

    if outcome.cases_gated > 0 {
        warn!(
            "{} case(s) were gated out and left unrecorded",
            outcome.cases_gated
        );
    }
    Ok(outcome)
}

/// File name of the final sweep summary CSV
pub fn sweep_csv_name(
    cfg: &RunConfig,
    window_sizes: &[usize],
    edit_layer: i64,
) -> String {
    let model_short = cfg
        .model_name
        .rsplit('/')
        .next()
        .unwrap_or(&cfg.model_name);
    let ws = window_sizes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-");
    let layer = match edit_layer {
        crate::hparams::EMBED_LAYER => "embeds".to_string(),
        crate::hparams::SWEEP_ALL_LAYERS => "all".to_string(),
        other => other.to_string(),
    };
    let n = cfg
        .dataset_size_limit
        .map_or_else(|| "all".to_string(), |n| n.to_string());
    format!(
        "{model_short}_{}_outputs_{}_editing_sweep_ws-{ws}_layer-{layer}{}_n{n}.csv",
        cfg.alg.name(),
        cfg.ds_name,
        cfg.objective.tag()
    )
}
