//! Per-case readback and sweep-level aggregation
//!
//! Reads the per-case result files back into flat rows, derives the
//! success/diff sub-scores per prompt group, and combines the three
//! success rates into a harmonic-mean composite. Missing case files are
//! logged and skipped; missing optional metrics simply leave their
//! column (and any composite depending on them) absent.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::eval::{MetricsRecord, ProbPair};

/// One flattened case × sweep-point row
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaseRow {
    pub case_id: String,
    pub prompt: String,
    pub subject: String,
    /// True target string
    pub target: String,
    /// Requested new target string
    pub request: String,
    pub request_baseline: String,

    pub pre_rewrite_success: Option<f64>,
    pub pre_rewrite_diff: Option<f64>,
    pub pre_paraphrase_success: Option<f64>,
    pub pre_paraphrase_diff: Option<f64>,
    pub pre_neighborhood_success: Option<f64>,
    pub pre_neighborhood_diff: Option<f64>,
    pub pre_essence_ppl: Option<f64>,
    pub pre_score: Option<f64>,

    pub post_rewrite_success: Option<f64>,
    pub post_rewrite_diff: Option<f64>,
    pub post_paraphrase_success: Option<f64>,
    pub post_paraphrase_diff: Option<f64>,
    pub post_neighborhood_success: Option<f64>,
    pub post_neighborhood_diff: Option<f64>,
    pub post_essence_ppl: Option<f64>,
    pub post_score: Option<f64>,

    /// Post-minus-pre essence perplexity; lower is better
    pub essence_ppl_diff: Option<f64>,

    /// Edit wall-clock seconds reported by the applicator
    pub edit_time: Option<f64>,

    // sweep coordinates, stamped by the sweep driver
    pub edit_method: String,
    pub edit_central_layer: i64,
    pub edit_window_size: usize,
}

/// Sub-scores for the pre or post bundle of one record
struct PrefixScores {
    rewrite_success: Option<f64>,
    rewrite_diff: Option<f64>,
    paraphrase_success: Option<f64>,
    paraphrase_diff: Option<f64>,
    neighborhood_success: Option<f64>,
    neighborhood_diff: Option<f64>,
    essence_ppl: Option<f64>,
    score: Option<f64>,
}

/// Harmonic mean with pinned zero semantics: any zero component makes the
/// mean exactly zero (a failed axis zeroes the composite)
pub fn harmonic_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.iter().any(|&v| v <= 0.0) {
        return 0.0;
    }
    values.len() as f64 / values.iter().map(|v| 1.0 / v).sum::<f64>()
}

/// Success rate and probability differential for one prompt group
///
/// Stored values are mean per-token log-probabilities. For rewrite and
/// paraphrase prompts success means the new target is more probable than
/// the baseline; neighborhood prompts invert both the flag and the diff.
fn group_scores(pairs: &[ProbPair], neighborhood: bool) -> (Option<f64>, Option<f64>) {
    if pairs.is_empty() {
        return (None, None);
    }
    let n = pairs.len() as f64;
    let success = pairs
        .iter()
        .map(|p| {
            let ok = if neighborhood {
                p.request_baseline > p.target_new
            } else {
                p.target_new > p.request_baseline
            };
            if ok {
                1.0
            } else {
                0.0
            }
        })
        .sum::<f64>()
        / n;
    let diff = pairs
        .iter()
        .map(|p| {
            if neighborhood {
                (-p.target_new).exp() - (-p.request_baseline).exp()
            } else {
                (-p.request_baseline).exp() - (-p.target_new).exp()
            }
        })
        .sum::<f64>()
        / n;
    (Some(success), Some(diff))
}

fn prefix_scores(bundle: &crate::eval::MetricsBundle) -> PrefixScores {
    let (rewrite_success, rewrite_diff) = group_scores(&bundle.rewrite_prompts_probs, false);
    let (paraphrase_success, paraphrase_diff) =
        group_scores(&bundle.paraphrase_prompts_probs, false);
    let (neighborhood_success, neighborhood_diff) =
        group_scores(&bundle.neighborhood_prompts_probs, true);

    // composite is defined only when all three axes are present
    let score = match (rewrite_success, paraphrase_success, neighborhood_success) {
        (Some(e), Some(g), Some(s)) => Some(harmonic_mean(&[e, g, s])),
        _ => None,
    };

    PrefixScores {
        rewrite_success,
        rewrite_diff,
        paraphrase_success,
        paraphrase_diff,
        neighborhood_success,
        neighborhood_diff,
        essence_ppl: bundle.essence_score,
        score,
    }
}

/// Flatten one persisted record into a row (sweep tags left blank)
pub fn row_from_record(record: &MetricsRecord) -> CaseRow {
    let rewrite = &record.requested_rewrite;
    let pre = prefix_scores(&record.pre);
    let post = prefix_scores(&record.post);
    let essence_ppl_diff = match (post.essence_ppl, pre.essence_ppl) {
        (Some(post_ppl), Some(pre_ppl)) => Some(post_ppl - pre_ppl),
        _ => None,
    };

    CaseRow {
        case_id: match &record.case_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        prompt: rewrite.full_prompt(),
        subject: rewrite.subject.clone(),
        target: rewrite.target_true.str.clone(),
        request: rewrite.target_new.str.clone(),
        request_baseline: rewrite.request_baseline.clone().unwrap_or_default(),

        pre_rewrite_success: pre.rewrite_success,
        pre_rewrite_diff: pre.rewrite_diff,
        pre_paraphrase_success: pre.paraphrase_success,
        pre_paraphrase_diff: pre.paraphrase_diff,
        pre_neighborhood_success: pre.neighborhood_success,
        pre_neighborhood_diff: pre.neighborhood_diff,
        pre_essence_ppl: pre.essence_ppl,
        pre_score: pre.score,

        post_rewrite_success: post.rewrite_success,
        post_rewrite_diff: post.rewrite_diff,
        post_paraphrase_success: post.paraphrase_success,
        post_paraphrase_diff: post.paraphrase_diff,
        post_neighborhood_success: post.neighborhood_success,
        post_neighborhood_diff: post.neighborhood_diff,
        post_essence_ppl: post.essence_ppl,
        post_score: post.score,

        essence_ppl_diff,
        edit_time: Some(record.time),

        edit_method: String::new(),
        edit_central_layer: 0,
        edit_window_size: 0,
    }
}

/// Read up to `n` case files from a run directory into rows
///
/// Missing files are logged and contribute no row; they are not errors.
pub fn aggregate(results_dir: &Path, experiment_name: &str, n: usize) -> Result<SweepTable> {
    let run_dir = results_dir.join(experiment_name);
    let mut rows = Vec::new();
    for case_id in 0..n {
        let path = crate::runner::case_result_path(&run_dir, &case_id.to_string());
        if !path.exists() {
            info!("skipping {}, does not exist", path.display());
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record: MetricsRecord = serde_json::from_str(&content)
            .with_context(|| format!("invalid record {}", path.display()))?;
        rows.push(row_from_record(&record));
    }
    Ok(SweepTable { rows })
}

/// Flat table of case rows across one or more sweep points
#[derive(Debug, Default)]
pub struct SweepTable {
    pub rows: Vec<CaseRow>,
}

impl SweepTable {
    /// Stamp every row with its sweep coordinates
    pub fn tag(&mut self, edit_method: &str, central_layer: i64, window_size: usize) {
        for row in &mut self.rows {
            row.edit_method = edit_method.to_string();
            row.edit_central_layer = central_layer;
            row.edit_window_size = window_size;
        }
    }

    /// Append all rows of `other`
    pub fn extend(&mut self, other: SweepTable) {
        self.rows.extend(other.rows);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Mean of a metric column over rows where it is present
    pub fn column_mean(&self, column: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|row| row.metric(column))
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Render the table as CSV
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        out.push_str(&COLUMNS.join(","));
        out.push('\n');
        for row in &self.rows {
            let fields: Vec<String> = COLUMNS.iter().map(|c| row.render(c)).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_csv())
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

const COLUMNS: [&str; 27] = [
    "case_id",
    "prompt",
    "subject",
    "target",
    "request",
    "request_baseline",
    "pre_rewrite_success",
    "pre_rewrite_diff",
    "pre_paraphrase_success",
    "pre_paraphrase_diff",
    "pre_neighborhood_success",
    "pre_neighborhood_diff",
    "pre_essence_ppl",
    "pre_score",
    "post_rewrite_success",
    "post_rewrite_diff",
    "post_paraphrase_success",
    "post_paraphrase_diff",
    "post_neighborhood_success",
    "post_neighborhood_diff",
    "post_essence_ppl",
    "post_score",
    "essence_ppl_diff",
    "edit_time",
    "edit_method",
    "edit_central_layer",
    "edit_window_size",
];

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_opt(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

impl CaseRow {
    /// Numeric metric by column name, when present
    pub fn metric(&self, column: &str) -> Option<f64> {
        match column {
            "pre_rewrite_success" => self.pre_rewrite_success,
            "pre_rewrite_diff" => self.pre_rewrite_diff,
            "pre_paraphrase_success" => self.pre_paraphrase_success,
            "pre_paraphrase_diff" => self.pre_paraphrase_diff,
            "pre_neighborhood_success" => self.pre_neighborhood_success,
            "pre_neighborhood_diff" => self.pre_neighborhood_diff,
            "pre_essence_ppl" => self.pre_essence_ppl,
            "pre_score" => self.pre_score,
            "post_rewrite_success" => self.post_rewrite_success,
            "post_rewrite_diff" => self.post_rewrite_diff,
            "post_paraphrase_success" => self.post_paraphrase_success,
            "post_paraphrase_diff" => self.post_paraphrase_diff,
            "post_neighborhood_success" => self.post_neighborhood_success,
            "post_neighborhood_diff" => self.post_neighborhood_diff,
            "post_essence_ppl" => self.post_essence_ppl,
            "post_score" => self.post_score,
            "essence_ppl_diff" => self.essence_ppl_diff,
            "edit_time" => self.edit_time,
            _ => None,
        }
    }

    fn render(&self, column: &str) -> String {
        match column {
            "case_id" => csv_escape(&self.case_id),
            "prompt" => csv_escape(&self.prompt),
            "subject" => csv_escape(&self.subject),
            "target" => csv_escape(&self.target),
            "request" => csv_escape(&self.request),
            "request_baseline" => csv_escape(&self.request_baseline),
            "edit_method" => csv_escape(&self.edit_method),
            "edit_central_layer" => self.edit_central_layer.to_string(),
            "edit_window_size" => self.edit_window_size.to_string(),
            metric => render_opt(self.metric(metric)),
        }
    }
}
