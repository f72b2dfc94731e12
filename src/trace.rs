//! Target construction via noised forward passes
//!
//! The causal-forcing objectives derive their counterfactual edit targets
//! by corrupting the subject span's token embeddings with seeded Gaussian
//! noise and reading off what the model then predicts (or how much
//! probability it retains on a given target). The same noise transform is
//! re-registered for the duration of the edit itself in the fact-forcing
//! modes, so the editor genuinely optimizes over corrupted inputs.

use std::cell::RefCell;

use anyhow::{bail, Context, Result};
use candle_core::{DType, IndexOp, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::dataset::{EditRequest, TargetToken};
use crate::hooks::{EditFn, TraceHooks};
use crate::hparams::HyperParams;
use crate::model::EditableModel;
use crate::objective::ObjectiveMode;

/// Repeated prompts per noised forward pass
pub const NUM_NOISE_SAMPLES: usize = 10;

/// Seed for the noise stream; fixed so edit-time corruption matches the
/// corruption used during target construction
pub const NOISE_SEED: u64 = 1;

/// Benchmark id recorded on targets that came from a noised prediction
pub const NOISED_INPUT_ID: &str = "noised-input";

/// Locate the subject's token range inside a prompt
///
/// Exact substring match on the prompt, then mapped to the covering token
/// range through the tokenizer's offsets. Failure to locate the subject is
/// a fatal per-case error and must surface, never be skipped.
pub fn find_token_range(
    model: &EditableModel,
    prompt: &str,
    subject: &str,
) -> Result<(usize, usize)> {
    let byte_start = prompt
        .find(subject)
        .with_context(|| format!("subject {subject:?} does not occur in prompt {prompt:?}"))?;
    let encoding = model.tokenize_with_offsets(prompt)?;
    let tokens = encoding.char_range_to_tokens(byte_start, byte_start + subject.len());
    let (first, last) = match (tokens.first(), tokens.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => bail!("subject {subject:?} maps to no tokens in prompt {prompt:?}"),
    };
    Ok((first, last + 1))
}

/// Gaussian draws via Box–Muller from a seeded generator
fn gaussian_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n + 1);
    while out.len() < n {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        out.push(r * theta.cos());
        out.push(r * theta.sin());
    }
    out.truncate(n);
    out
}

/// Embedding-output transform corrupting the subject span
///
/// No-ops when the input is a single token (the per-step decode case) and
/// when the span falls outside the sequence. Register it on the embedding
/// layer only; other layers must pass through unmodified.
pub fn noise_hook(range: (usize, usize), scale: f64, seed: u64) -> EditFn {
    let rng = RefCell::new(StdRng::seed_from_u64(seed));
    Box::new(move |x: &Tensor| {
        let (b, seq_len, d) = x.dims3()?;
        if seq_len == 1 {
            return Ok(x.clone());
        }
        let (start, end) = range;
        let end = end.min(seq_len);
        if start >= end {
            return Ok(x.clone());
        }
        let span_len = end - start;
        let noise = gaussian_vec(&mut rng.borrow_mut(), b * span_len * d);
        let noise = Tensor::from_vec(noise, (b, span_len, d), x.device())?
            .to_dtype(x.dtype())?;
        let before = x.narrow(1, 0, start)?;
        let span = (x.narrow(1, start, span_len)? + (noise * scale)?)?;
        let after = x.narrow(1, end, seq_len - end)?;
        let parts: Vec<Tensor> = [before, span, after]
            .into_iter()
            .filter(|t| t.dim(1).map(|d| d > 0).unwrap_or(false))
            .collect();
        Ok(Tensor::cat(&parts, 1)?)
    })
}

/// Hook table noising the subject span on the embedding layer
pub fn subject_noise_hooks(
    model: &EditableModel,
    range: (usize, usize),
    scale: f64,
) -> TraceHooks {
    TraceHooks::new().edit_output(
        model.backend().embed_layer_name(),
        noise_hook(range, scale, NOISE_SEED),
    )
}

/// Argmax next-token prediction under subject-span corruption
///
/// Probabilities are averaged over a batch of identically corrupted
/// repeats before the argmax.
pub fn corrupted_prediction(
    model: &EditableModel,
    prompt: &str,
    range: (usize, usize),
    noise: f64,
) -> Result<u32> {
    let ids = model.encode(prompt)?;
    if ids.is_empty() {
        bail!("prompt {prompt:?} tokenized to nothing");
    }
    let rows: Vec<Vec<u32>> = std::iter::repeat(ids.clone())
        .take(NUM_NOISE_SAMPLES)
        .collect();
    let hooks = subject_noise_hooks(model, range, noise);
    let logits = model.forward_ids(&rows, Some(&hooks))?;
    let last = logits
        .i((.., ids.len() - 1))?
        .to_dtype(DType::F32)?
        .contiguous()?;
    let probs = candle_nn::ops::softmax_last_dim(&last)?;
    let mean: Vec<f32> = probs.mean(0)?.flatten_all()?.to_vec1()?;
    let (idx, _) = mean
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("empty vocabulary distribution"))?;
    Ok(idx as u32)
}

/// Mean probability the corrupted model assigns to `target` after `prompt`
pub fn corrupted_target_prob(
    model: &EditableModel,
    prompt: &str,
    target: &str,
    range: (usize, usize),
    noise: f64,
) -> Result<f64> {
    let (prompt_ids, target_ids) = model.target_token_ids(prompt, target)?;
    let mut row = prompt_ids.clone();
    row.extend_from_slice(&target_ids);
    let rows: Vec<Vec<u32>> = std::iter::repeat(row).take(NUM_NOISE_SAMPLES).collect();
    let hooks = subject_noise_hooks(model, range, noise);
    let logits = model.forward_ids(&rows, Some(&hooks))?;
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

    let mut total = 0.0f64;
    for sample in 0..NUM_NOISE_SAMPLES {
        let mut sample_lp = 0.0f64;
        for (j, &tid) in target_ids.iter().enumerate() {
            let pos = prompt_ids.len() + j;
            let lp: f32 = log_probs.i((sample, pos - 1, tid as usize))?.to_scalar()?;
            sample_lp += f64::from(lp);
        }
        total += sample_lp.exp();
    }
    Ok(total / NUM_NOISE_SAMPLES as f64)
}

/// Fill `target_new` / `request_baseline` for the active objective
///
/// Returns the noised prior probability for the erasure objective (the
/// editor needs it as its optimization floor); `None` otherwise.
pub fn construct_target(
    mode: ObjectiveMode,
    model: &EditableModel,
    request: &mut EditRequest,
    hparams: &HyperParams,
) -> Result<Option<f64>> {
    let prompt = request.full_prompt();
    let noise = hparams.editing_noise;

    match mode {
        ObjectiveMode::Default => {
            request.request_baseline = Some(request.target_true.str.clone());
            Ok(None)
        }
        ObjectiveMode::TraceReversal => {
            let range = find_token_range(model, &prompt, &request.subject)?;
            let pred_id = corrupted_prediction(model, &prompt, range, noise)?;
            let token = model.decode_token(pred_id);
            info!("noised prediction for {:?}: {token:?}", request.subject);
            request.request_baseline = Some(request.target_true.str.clone());
            request.target_new = TargetToken {
                str: token,
                id: NOISED_INPUT_ID.to_string(),
            };
            Ok(None)
        }
        ObjectiveMode::FactErasure => {
            let range = find_token_range(model, &prompt, &request.subject)?;
            let prior =
                corrupted_target_prob(model, &prompt, &request.target_true.str, range, noise)?;
            debug!("noised prior for {:?}: {prior:.4}", request.subject);
            // arbitrary placeholder; erasure metrics never read the baseline
            let placeholder = model
                .eos_token_id()
                .map(|id| model.decode_token(id))
                .unwrap_or_else(|| "<unk>".to_string());
            request.request_baseline = Some(placeholder);
            request.target_new = request.target_true.clone();
            Ok(Some(prior))
        }
        ObjectiveMode::FactForcing | ObjectiveMode::WeightBasedTracing => {
            let range = find_token_range(model, &prompt, &request.subject)?;
            let pred_id = corrupted_prediction(model, &prompt, range, noise)?;
            let token = model.decode_token(pred_id);
            info!("noised prediction for {:?}: {token:?}", request.subject);
            request.request_baseline = Some(token);
            request.target_new = request.target_true.clone();
            Ok(None)
        }
    }
}

/// Edit-time hook table for modes that keep the subject corrupted while
/// the editor optimizes
pub fn edit_time_hooks(
    mode: ObjectiveMode,
    model: &EditableModel,
    range: (usize, usize),
    hparams: &HyperParams,
) -> Option<TraceHooks> {
    if mode.noises_edit() {
        Some(subject_noise_hooks(model, range, hparams.editing_noise))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const VOCAB: &[&str] = &[
        "The", "Eiffel", "Tower", "is", "located", "in", "Paris", "Rome", "a",
    ];

    fn model() -> EditableModel {
        EditableModel::synthetic(VOCAB, 11).unwrap()
    }

    #[test]
    fn subject_span_resolves_to_token_range() {
        let m = model();
        let range = find_token_range(&m, "The Eiffel Tower is located in", "Eiffel Tower").unwrap();
        assert_eq!(range, (1, 3));
    }

    #[test]
    fn missing_subject_is_fatal() {
        let m = model();
        let err = find_token_range(&m, "The Eiffel Tower is located in", "Colosseum");
        assert!(err.is_err());
    }

    #[test]
    fn noise_hook_skips_single_token_inputs() {
        let hook = noise_hook((0, 2), 5.0, NOISE_SEED);
        let x = Tensor::from_vec(vec![1.0f32; 4], (1, 1, 4), &Device::Cpu).unwrap();
        let y = hook(&x).unwrap();
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0; 4]
        );
    }

    #[test]
    fn noise_hook_perturbs_only_the_span() {
        let hook = noise_hook((1, 3), 1.0, NOISE_SEED);
        let x = Tensor::zeros((2, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let y = hook(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 8]);
        let y0: Vec<f32> = y.i((0, 0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let y3: Vec<f32> = y.i((0, 3))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(y0.iter().all(|&v| v == 0.0), "pre-span row changed");
        assert!(y3.iter().all(|&v| v == 0.0), "post-span row changed");
        let span: Vec<f32> = y.i((0, 1))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(span.iter().any(|&v| v != 0.0), "span row unchanged");
    }

    #[test]
    fn default_mode_sets_baseline_to_truth() {
        let m = model();
        let mut request = EditRequest {
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
            request_baseline: None,
        };
        let hp = HyperParams {
            layers: vec![0],
            editing_noise: 0.1,
            lr: None,
            num_steps: None,
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        let prior = construct_target(ObjectiveMode::Default, &m, &mut request, &hp).unwrap();
        assert!(prior.is_none());
        assert_eq!(request.request_baseline.as_deref(), Some(" Paris"));
        assert_eq!(request.target_new.str, " Rome");
    }

    #[test]
    fn forcing_mode_points_target_back_at_truth() {
        let m = model();
        let mut request = EditRequest {
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
            request_baseline: None,
        };
        let hp = HyperParams {
            layers: vec![0],
            editing_noise: 0.5,
            lr: None,
            num_steps: None,
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        construct_target(ObjectiveMode::FactForcing, &m, &mut request, &hp).unwrap();
        assert_eq!(request.target_new, request.target_true);
        assert!(request.request_baseline.is_some());
    }

    #[test]
    fn erasure_mode_returns_a_prior() {
        let m = model();
        let mut request = EditRequest {
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
            request_baseline: None,
        };
        let hp = HyperParams {
            layers: vec![0],
            editing_noise: 0.5,
            lr: None,
            num_steps: None,
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        let prior = construct_target(ObjectiveMode::FactErasure, &m, &mut request, &hp)
            .unwrap()
            .unwrap();
        assert!(prior > 0.0 && prior < 1.0);
        assert_eq!(request.target_new, request.target_true);
    }
}
