//! Edit-quality evaluation
//!
//! One [`MetricsBundle`] per (case, edit state). Prompt groups are scored
//! as pairs of mean per-token log-probabilities for the injected target
//! and the baseline request. Sign conventions:
//!
//! - rewrite / paraphrase prompts: the edit succeeded when the *new*
//!   target is more probable than the baseline;
//! - neighborhood prompts: the model is undamaged when the *baseline*
//!   stays more probable than the injected target — the inverse.
//!
//! The essence test scores the perplexity of reference texts about the
//! subject under the current model, catching collateral fluency damage.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use candle_core::IndexOp;
use serde::{Deserialize, Serialize};

use crate::dataset::{CaseRecord, EditRequest, SnippetStore};
use crate::model::EditableModel;

/// Mean per-token log-probabilities for one prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbPair {
    pub target_new: f64,
    pub request_baseline: f64,
}

/// Raw metrics for one case in one edit state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub rewrite_prompts_probs: Vec<ProbPair>,
    pub paraphrase_prompts_probs: Vec<ProbPair>,
    pub neighborhood_prompts_probs: Vec<ProbPair>,
    /// Mean perplexity of the subject's reference texts; absent in fast mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essence_score: Option<f64>,
    /// Tf-idf similarity of generated continuations to the references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_score: Option<f64>,
}

/// Persisted per-case result artifact; written once, immutable afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub case_id: serde_json::Value,
    pub requested_rewrite: EditRequest,
    /// Edit wall-clock time in seconds
    pub time: f64,
    pub pre: MetricsBundle,
    pub post: MetricsBundle,
}

/// Compute the metrics bundle for one case against the current model state
///
/// `fast_mode` skips the essence and consistency tests entirely; the
/// consistency test additionally requires a fitted `vectorizer`.
pub fn evaluate_case(
    model: &EditableModel,
    case: &CaseRecord,
    snips: &SnippetStore,
    vectorizer: Option<&TfIdfVectorizer>,
    fast_mode: bool,
) -> Result<MetricsBundle> {
    let request = &case.requested_rewrite;
    let baseline = request
        .request_baseline
        .as_ref()
        .context("request_baseline must be populated before evaluation")?;
    let target_new = &request.target_new.str;

    let score_group = |prompts: &[String]| -> Result<Vec<ProbPair>> {
        prompts
            .iter()
            .map(|prompt| {
                Ok(ProbPair {
                    target_new: model.score_target(prompt, target_new, None)?,
                    request_baseline: model.score_target(prompt, baseline, None)?,
                })
            })
            .collect()
    };

    let rewrite_prompts = vec![request.full_prompt()];
    let mut bundle = MetricsBundle {
        rewrite_prompts_probs: score_group(&rewrite_prompts)?,
        paraphrase_prompts_probs: score_group(&case.paraphrase_prompts)?,
        neighborhood_prompts_probs: score_group(&case.neighborhood_prompts)?,
        essence_score: None,
        consistency_score: None,
    };

    if !fast_mode {
        if let Some(references) = snips.get(&request.subject) {
            if !references.is_empty() {
                bundle.essence_score = Some(mean_perplexity(model, references)?);
                if let Some(vectorizer) = vectorizer {
                    let essence_prompt = format!("{} is a", request.subject);
                    let generated = model.generate_texts(&essence_prompt, 1, 50)?;
                    let reference_text = references.join(" ");
                    bundle.consistency_score =
                        Some(vectorizer.cosine(&generated.join(" "), &reference_text));
                }
            }
        }
    }

    Ok(bundle)
}

/// Perplexity of `text` under the model (exp of mean next-token NLL)
pub fn perplexity(model: &EditableModel, text: &str) -> Result<f64> {
    let mut ids = model.encode(text)?;
    ids.truncate(model.backend().max_positions());
    if ids.len() < 2 {
        bail!("text too short for perplexity: {text:?}");
    }
    let logits = model.forward_ids(&[ids.clone()], None)?;
    let log_probs = candle_nn::ops::log_softmax(
        &logits.to_dtype(candle_core::DType::F32)?,
        candle_core::D::Minus1,
    )?;
    let mut total = 0.0f64;
    for pos in 1..ids.len() {
        let lp: f32 = log_probs
            .i((0, pos - 1, ids[pos] as usize))
            .map_err(anyhow::Error::from)?
            .to_scalar()?;
        total += f64::from(lp);
    }
    Ok((-total / (ids.len() - 1) as f64).exp())
}

fn mean_perplexity(model: &EditableModel, texts: &[String]) -> Result<f64> {
    let mut values = Vec::with_capacity(texts.len());
    for text in texts {
        match perplexity(model, text) {
            Ok(ppl) => values.push(ppl),
            // short or degenerate references contribute nothing
            Err(_) => continue,
        }
    }
    if values.is_empty() {
        bail!("no scoreable reference texts");
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Minimal tf-idf vectorizer over whitespace tokens
///
/// Narrow stand-in for the reference-text similarity collaborator; fitted
/// once on the snippet corpus and reused across cases.
#[derive(Debug, Clone)]
pub struct TfIdfVectorizer {
    idf: HashMap<String, f64>,
    n_docs: usize,
}

impl TfIdfVectorizer {
    /// Fit document frequencies on a reference corpus
    pub fn fit(documents: &[String]) -> Self {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for doc in documents {
            let mut seen: Vec<&str> = doc.split_whitespace().collect();
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *doc_freq.entry(term.to_lowercase()).or_insert(0) += 1;
            }
        }
        let n_docs = documents.len().max(1);
        let idf = doc_freq
            .into_iter()
            .map(|(term, df)| (term, ((n_docs as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0))
            .collect();
        Self { idf, n_docs }
    }

    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    fn vectorize(&self, text: &str) -> HashMap<String, f64> {
        let mut tf: HashMap<String, f64> = HashMap::new();
        for term in text.split_whitespace() {
            *tf.entry(term.to_lowercase()).or_insert(0.0) += 1.0;
        }
        // unseen terms get the maximum idf (df = 0 smoothing)
        let default_idf = ((self.n_docs as f64 + 1.0) / 1.0).ln() + 1.0;
        tf.into_iter()
            .map(|(term, count)| {
                let idf = self.idf.get(&term).copied().unwrap_or(default_idf);
                (term, count * idf)
            })
            .collect()
    }

    /// Cosine similarity of the tf-idf vectors of two texts
    pub fn cosine(&self, a: &str, b: &str) -> f64 {
        let va = self.vectorize(a);
        let vb = self.vectorize(b);
        let dot: f64 = va
            .iter()
            .filter_map(|(term, x)| vb.get(term).map(|y| x * y))
            .sum();
        let na: f64 = va.values().map(|x| x * x).sum::<f64>().sqrt();
        let nb: f64 = vb.values().map(|x| x * x).sum::<f64>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TargetToken;

    const VOCAB: &[&str] = &[
        "The", "Eiffel", "Tower", "is", "located", "in", "Paris", "Rome", "a",
    ];

    fn case() -> CaseRecord {
        CaseRecord {
            case_id: serde_json::json!(0),
            requested_rewrite: EditRequest {
                subject: "Eiffel Tower".into(),
                prompt: "The {} is located in".into(),
                target_true: TargetToken {
                    str: " Paris".into(),
                    id: "Q90".into(),
                },
                target_new: TargetToken {
                    str: " Rome".into(),
                    id: "Q220".into(),
                },
                request_baseline: Some(" Paris".into()),
            },
            paraphrase_prompts: vec!["The Tower is in".into()],
            neighborhood_prompts: vec!["Paris is located in".into()],
        }
    }

    #[test]
    fn bundle_scores_every_prompt_group() {
        let model = EditableModel::synthetic(VOCAB, 13).unwrap();
        let bundle =
            evaluate_case(&model, &case(), &SnippetStore::new(), None, true).unwrap();
        assert_eq!(bundle.rewrite_prompts_probs.len(), 1);
        assert_eq!(bundle.paraphrase_prompts_probs.len(), 1);
        assert_eq!(bundle.neighborhood_prompts_probs.len(), 1);
        assert!(bundle.essence_score.is_none());
        let pair = &bundle.rewrite_prompts_probs[0];
        assert!(pair.target_new < 0.0 && pair.request_baseline < 0.0);
    }

    #[test]
    fn missing_baseline_is_an_error() {
        let model = EditableModel::synthetic(VOCAB, 13).unwrap();
        let mut c = case();
        c.requested_rewrite.request_baseline = None;
        assert!(evaluate_case(&model, &c, &SnippetStore::new(), None, true).is_err());
    }

    #[test]
    fn essence_uses_stored_references() {
        let model = EditableModel::synthetic(VOCAB, 13).unwrap();
        let mut snips = SnippetStore::new();
        snips.insert(
            "Eiffel Tower".into(),
            vec!["The Eiffel Tower is located in Paris".into()],
        );
        let bundle = evaluate_case(&model, &case(), &snips, None, false).unwrap();
        let ppl = bundle.essence_score.unwrap();
        assert!(ppl.is_finite() && ppl > 0.0);
    }

    #[test]
    fn tfidf_cosine_bounds() {
        let docs = vec![
            "the tower is in paris".to_string(),
            "rome has a colosseum".to_string(),
        ];
        let vec = TfIdfVectorizer::fit(&docs);
        let same = vec.cosine("the tower is in paris", "the tower is in paris");
        assert!((same - 1.0).abs() < 1e-9);
        let disjoint = vec.cosine("tower paris", "colosseum rome");
        assert!(disjoint.abs() < 1e-9);
        let partial = vec.cosine("tower in paris", "tower in rome");
        assert!(partial > 0.0 && partial < 1.0);
    }
}
