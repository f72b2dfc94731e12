//! Editable model handle
//!
//! [`EditableModel`] owns the process-wide mutable model state: one backend
//! holding the parameter table, plus the tokenizer and device. The case
//! loop passes it by reference; editors mutate parameters in place and the
//! runner restores them from a backup before the next case starts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::forward_gpt2::{Gpt2Backend, Gpt2Config};
use crate::hooks::TraceHooks;
use crate::positioning::EncodingWithOffsets;

/// Backend contract for editable causal LMs
///
/// Implementing this trait is the only requirement for adding a new model
/// family. Parameters are addressed by name so that editing algorithms can
/// capture, swap, and restore individual weight tensors.
pub trait EditBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    /// Maximum sequence length the backend accepts
    fn max_positions(&self) -> usize;
    fn device(&self) -> &Device;
    fn dtype(&self) -> DType;

    /// Forward pass to vocabulary logits `[batch, seq, vocab]`, consulting
    /// the hook table at each named layer output
    fn forward(&self, input_ids: &Tensor, hooks: Option<&TraceHooks>) -> Result<Tensor>;

    // --- Named-parameter access ---
    fn parameter_names(&self) -> Vec<String>;
    fn get_parameter(&self, name: &str) -> Result<Tensor>;
    fn set_parameter(&mut self, name: &str, value: Tensor) -> Result<()>;

    // --- Layer naming ---
    /// Hook name of the token-embedding output
    fn embed_layer_name(&self) -> String;
    /// Parameter edited at `layer` (the embedding matrix for the sentinel)
    fn edit_weight_name(&self, layer: i64) -> String;
    /// Hook name of the mid-MLP activation at `layer`
    fn mlp_act_hook_name(&self, layer: i64) -> String;
}

/// High-level wrapper owning backend + tokenizer + device
pub struct EditableModel {
    backend: Box<dyn EditBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl EditableModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        // editing needs gradients; F32 keeps the optimizer paths stable
        let dtype = DType::F32;

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = Gpt2Backend::load(model_id, &device, dtype)?;

        Ok(Self {
            backend: Box::new(backend),
            tokenizer,
            device,
            model_id: model_id.to_string(),
        })
    }

    /// Tiny seeded model with a word-level tokenizer over `vocab`
    ///
    /// Runs entirely on CPU with no downloads; used by tests and smoke
    /// runs. Word ids follow the order of `vocab`.
    pub fn synthetic(vocab: &[&str], seed: u64) -> Result<Self> {
        let mut vocab_map = serde_json::Map::new();
        vocab_map.insert("<unk>".to_string(), serde_json::json!(0));
        for (i, word) in vocab.iter().enumerate() {
            vocab_map.insert((*word).to_string(), serde_json::json!(i + 1));
        }
        let tokenizer_json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": serde_json::Value::Object(vocab_map),
                "unk_token": "<unk>"
            }
        });
        let tokenizer = Tokenizer::from_bytes(serde_json::to_vec(&tokenizer_json)?)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let device = Device::Cpu;
        let backend = Gpt2Backend::seeded(Gpt2Config::tiny(vocab.len() + 1), seed, &device)?;
        Ok(Self {
            backend: Box::new(backend),
            tokenizer,
            device,
            model_id: "synthetic".to_string(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backend(&self) -> &dyn EditBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn EditBackend {
        self.backend.as_mut()
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    // --- Tokenization ---

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenize with byte offsets for subject-span resolution
    pub fn tokenize_with_offsets(&self, text: &str) -> Result<EncodingWithOffsets> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let ids = encoding.get_ids().to_vec();
        let tokens: Vec<String> = ids.iter().map(|&id| self.decode_token(id)).collect();
        let offsets = encoding.get_offsets().to_vec();
        Ok(EncodingWithOffsets::new(ids, tokens, offsets))
    }

    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Detokenization error: {e}"))
    }

    /// End-of-sequence id when the tokenizer defines one
    pub fn eos_token_id(&self) -> Option<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        vocab
            .get("<|endoftext|>")
            .or_else(|| vocab.get("</s>"))
            .copied()
    }

    /// Token ids of `prompt` and of the continuation `target`
    ///
    /// The target ids are recovered by encoding `prompt + target` and
    /// splitting at the prompt's token count, so boundary merges follow
    /// the tokenizer's own behavior.
    pub fn target_token_ids(&self, prompt: &str, target: &str) -> Result<(Vec<u32>, Vec<u32>)> {
        let full = join_prompt_target(prompt, target);
        let prompt_ids = self.encode(prompt)?;
        if prompt_ids.is_empty() {
            bail!("prompt {prompt:?} tokenized to nothing");
        }
        let full_ids = self.encode(&full)?;
        if full_ids.len() <= prompt_ids.len() {
            bail!("target {target:?} contributes no tokens after {prompt:?}");
        }
        let target_ids = full_ids[prompt_ids.len()..].to_vec();
        Ok((full_ids[..prompt_ids.len()].to_vec(), target_ids))
    }

    // --- Forward passes and scoring ---

    /// Forward a batch of equal-length token rows
    pub fn forward_ids(&self, rows: &[Vec<u32>], hooks: Option<&TraceHooks>) -> Result<Tensor> {
        if rows.is_empty() {
            bail!("empty batch");
        }
        let seq_len = rows[0].len();
        if rows.iter().any(|r| r.len() != seq_len) {
            bail!("rows in a batch must share one length");
        }
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        let input = Tensor::from_vec(flat, (rows.len(), seq_len), &self.device)?;
        self.backend.forward(&input, hooks)
    }

    /// Mean log-probability of `target` as a continuation of `prompt`
    pub fn score_target(
        &self,
        prompt: &str,
        target: &str,
        hooks: Option<&TraceHooks>,
    ) -> Result<f64> {
        let (prompt_ids, target_ids) = self.target_token_ids(prompt, target)?;
        let mut row = prompt_ids.clone();
        row.extend_from_slice(&target_ids);
        let logits = self.forward_ids(&[row.clone()], hooks)?;
        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

        let mut total = 0.0f64;
        for (j, &tid) in target_ids.iter().enumerate() {
            let pos = prompt_ids.len() + j;
            let lp: f32 = log_probs
                .i((0, pos - 1, tid as usize))
                .context("target position out of range")?
                .to_scalar()?;
            total += f64::from(lp);
        }
        Ok(total / target_ids.len() as f64)
    }

    /// Probability of the full target continuation (product over tokens)
    pub fn score_target_prob(&self, prompt: &str, target: &str) -> Result<f64> {
        let (prompt_ids, target_ids) = self.target_token_ids(prompt, target)?;
        let mut row = prompt_ids.clone();
        row.extend_from_slice(&target_ids);
        let logits = self.forward_ids(&[row], None)?;
        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let mut total = 0.0f64;
        for (j, &tid) in target_ids.iter().enumerate() {
            let pos = prompt_ids.len() + j;
            let lp: f32 = log_probs.i((0, pos - 1, tid as usize))?.to_scalar()?;
            total += f64::from(lp);
        }
        Ok(total.exp())
    }

    /// Greedy next-token prediction for `prompt`
    pub fn predict_next(&self, prompt: &str) -> Result<u32> {
        let ids = self.encode(prompt)?;
        if ids.is_empty() {
            bail!("prompt {prompt:?} tokenized to nothing");
        }
        let logits = self.forward_ids(&[ids.clone()], None)?;
        let last = logits.i((0, ids.len() - 1))?.to_dtype(DType::F32)?;
        argmax_f32(&last)
    }

    /// Greedy continuation decoded to text
    pub fn greedy_continuation(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let prompt_ids = self.encode(prompt)?;
        let mut ids = prompt_ids.clone();
        let eos = self.eos_token_id();
        for _ in 0..max_tokens {
            if ids.len() >= self.backend.max_positions() {
                break;
            }
            let logits = self.forward_ids(&[ids.clone()], None)?;
            let last = logits.i((0, ids.len() - 1))?.to_dtype(DType::F32)?;
            let next = argmax_f32(&last)?;
            if Some(next) == eos {
                break;
            }
            ids.push(next);
        }
        self.decode(&ids[prompt_ids.len()..])
    }

    /// Sample `n` free-text continuations of `prompt`
    ///
    /// The prefix is recomputed each step; essence generation is short
    /// enough that a KV cache would not pay for itself here.
    pub fn generate_texts(&self, prompt: &str, n: usize, max_tokens: usize) -> Result<Vec<String>> {
        let prompt_ids = self.encode(prompt)?;
        let eos = self.eos_token_id();
        let mut texts = Vec::with_capacity(n);
        for _ in 0..n {
            let mut ids = prompt_ids.clone();
            for _ in 0..max_tokens {
                if ids.len() >= self.backend.max_positions() {
                    break;
                }
                let logits = self.forward_ids(&[ids.clone()], None)?;
                let last = logits.i((0, ids.len() - 1))?.to_dtype(DType::F32)?;
                let next = sample_from_logits(&last, 1.0)?;
                if Some(next) == eos {
                    break;
                }
                ids.push(next);
            }
            let text = self.decode(&ids)?;
            texts.push(text);
        }
        Ok(texts)
    }

    /// Differentiable mean negative log-likelihood of `target` after `prompt`
    ///
    /// Returns a scalar tensor connected to any `Var`-backed parameters in
    /// the backend table; editors drive their optimizers with this.
    pub fn target_nll_loss(
        &self,
        prompt: &str,
        target: &str,
        hooks: Option<&TraceHooks>,
    ) -> Result<Tensor> {
        let (prompt_ids, target_ids) = self.target_token_ids(prompt, target)?;
        let mut row = prompt_ids.clone();
        row.extend_from_slice(&target_ids);
        let logits = self.forward_ids(&[row], hooks)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        let mut terms = Vec::with_capacity(target_ids.len());
        for (j, &tid) in target_ids.iter().enumerate() {
            let pos = prompt_ids.len() + j;
            terms.push(log_probs.i((0, pos - 1, tid as usize))?);
        }
        let stacked = Tensor::stack(&terms, 0)?;
        Ok(stacked.mean(0)?.neg()?)
    }

    /// Order-independent fingerprint of every parameter tensor
    ///
    /// Bit-exact: two models compare equal iff all tensors match exactly.
    pub fn parameter_checksum(&self) -> Result<u64> {
        let mut hasher = DefaultHasher::new();
        for name in self.backend.parameter_names() {
            name.hash(&mut hasher);
            let values: Vec<f32> = self
                .backend
                .get_parameter(&name)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            for v in values {
                v.to_bits().hash(&mut hasher);
            }
        }
        Ok(hasher.finish())
    }
}

/// Join a prompt and its continuation, inserting a space when the target
/// does not bring its own
pub fn join_prompt_target(prompt: &str, target: &str) -> String {
    if target.starts_with(char::is_whitespace) {
        format!("{prompt}{target}")
    } else {
        format!("{prompt} {target}")
    }
}

fn argmax_f32(logits: &Tensor) -> Result<u32> {
    let values: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    let (idx, _) = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
    Ok(idx as u32)
}

/// Greedy for `temperature <= 0`, otherwise softmax sampling
fn sample_from_logits(logits: &Tensor, temperature: f32) -> Result<u32> {
    use rand::Rng;

    if temperature <= 0.0 {
        return argmax_f32(logits);
    }
    let values: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    let scaled: Vec<f32> = values.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let mut rng = rand::thread_rng();
    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }
    Ok((exp_vals.len() - 1) as u32)
}
