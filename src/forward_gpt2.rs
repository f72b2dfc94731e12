//! GPT-2-style forward pass with named-parameter editing support
//!
//! Unlike a fixed module tree, parameters live in a name → tensor table so
//! that editing algorithms can capture and swap individual weight tensors
//! in place and restore them later. Light `candle_nn` wrappers are rebuilt
//! from the table on each forward (shallow Arc clones, no data copy), which
//! also keeps gradient graphs intact when an editor substitutes a
//! `Var`-backed tensor for a weight.
//!
//! Hook points (see `hooks.rs`): `wte` fires on the token-embedding output
//! before position embeddings are added, `h.{i}` on each block output, and
//! `h.{i}.mlp.act` on the post-GELU MLP activation (the rank-one editor's
//! key readout).

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module};
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::hooks::TraceHooks;
use crate::model::EditBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub vocab_size: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_n_positions() -> usize {
    1024
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// Tiny configuration for synthetic models in tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            n_layer: 2,
            n_head: 2,
            n_embd: 16,
            vocab_size,
            n_positions: 64,
            layer_norm_epsilon: 1e-5,
        }
    }
}

/// Index file for sharded safetensors checkpoints
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// GPT-2-style decoder backend with a named-parameter table
pub struct Gpt2Backend {
    params: HashMap<String, Tensor>,
    config: Gpt2Config,
    device: Device,
    dtype: DType,
}

/// HF GPT-2 checkpoints store the Conv1D projections transposed relative
/// to the Linear convention used here.
fn is_conv1d_weight(name: &str) -> bool {
    name.ends_with("attn.c_attn.weight")
        || name.ends_with("attn.c_proj.weight")
        || name.ends_with("mlp.c_fc.weight")
        || name.ends_with("mlp.c_proj.weight")
}

impl Gpt2Backend {
    /// Load from the HuggingFace hub (single-file or sharded safetensors)
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading GPT-2 weights from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, config.vocab_size
        );

        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            let mut paths = Vec::new();
            for shard_name in &shard_names {
                let path = repo
                    .get(shard_name)
                    .with_context(|| format!("Failed to download {shard_name}"))?;
                paths.push(path);
            }
            paths
        } else {
            let path = repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        let mut params = HashMap::new();
        for path in &weights_paths {
            let tensors = candle_core::safetensors::load(path, device)?;
            for (name, tensor) in tensors {
                // LM-head checkpoints prefix the decoder weights
                let name = name
                    .strip_prefix("transformer.")
                    .unwrap_or(&name)
                    .to_string();
                let tensor = if is_conv1d_weight(&name) {
                    tensor.t()?.contiguous()?
                } else {
                    tensor
                };
                params.insert(name, tensor.to_dtype(dtype)?);
            }
        }

        info!("Loaded {} parameter tensors", params.len());
        let backend = Self {
            params,
            config,
            device: device.clone(),
            dtype,
        };
        backend.check_parameters()?;
        Ok(backend)
    }

    /// Build a small seeded model with random weights
    ///
    /// Used by tests and smoke runs; the weight scale keeps early logits
    /// in a numerically tame range so greedy decoding is deterministic.
    pub fn seeded(config: Gpt2Config, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let e = config.n_embd;
        let mut params = HashMap::new();

        let insert_rand = |params: &mut HashMap<String, Tensor>,
                               rng: &mut StdRng,
                               name: String,
                               shape: (usize, usize)|
         -> Result<()> {
            let n = shape.0 * shape.1;
            let data: Vec<f32> = (0..n).map(|_| (rng.gen::<f32>() - 0.5) * 0.2).collect();
            params.insert(name, Tensor::from_vec(data, shape, device)?);
            Ok(())
        };
        let insert_const = |params: &mut HashMap<String, Tensor>,
                            name: String,
                            len: usize,
                            value: f32|
         -> Result<()> {
            params.insert(name, Tensor::from_vec(vec![value; len], len, device)?);
            Ok(())
        };

        insert_rand(&mut params, &mut rng, "wte.weight".into(), (config.vocab_size, e))?;
        insert_rand(&mut params, &mut rng, "wpe.weight".into(), (config.n_positions, e))?;
        for i in 0..config.n_layer {
            let p = format!("h.{i}");
            insert_const(&mut params, format!("{p}.ln_1.weight"), e, 1.0)?;
            insert_const(&mut params, format!("{p}.ln_1.bias"), e, 0.0)?;
            insert_rand(&mut params, &mut rng, format!("{p}.attn.c_attn.weight"), (3 * e, e))?;
            insert_const(&mut params, format!("{p}.attn.c_attn.bias"), 3 * e, 0.0)?;
            insert_rand(&mut params, &mut rng, format!("{p}.attn.c_proj.weight"), (e, e))?;
            insert_const(&mut params, format!("{p}.attn.c_proj.bias"), e, 0.0)?;
            insert_const(&mut params, format!("{p}.ln_2.weight"), e, 1.0)?;
            insert_const(&mut params, format!("{p}.ln_2.bias"), e, 0.0)?;
            insert_rand(&mut params, &mut rng, format!("{p}.mlp.c_fc.weight"), (4 * e, e))?;
            insert_const(&mut params, format!("{p}.mlp.c_fc.bias"), 4 * e, 0.0)?;
            insert_rand(&mut params, &mut rng, format!("{p}.mlp.c_proj.weight"), (e, 4 * e))?;
            insert_const(&mut params, format!("{p}.mlp.c_proj.bias"), e, 0.0)?;
        }
        insert_const(&mut params, "ln_f.weight".into(), e, 1.0)?;
        insert_const(&mut params, "ln_f.bias".into(), e, 0.0)?;

        let backend = Self {
            params,
            config,
            device: device.clone(),
            dtype: DType::F32,
        };
        backend.check_parameters()?;
        Ok(backend)
    }

    /// Verify the table holds every tensor the forward pass will read
    fn check_parameters(&self) -> Result<()> {
        let mut required = vec![
            "wte.weight".to_string(),
            "wpe.weight".to_string(),
            "ln_f.weight".to_string(),
            "ln_f.bias".to_string(),
        ];
        for i in 0..self.config.n_layer {
            let p = format!("h.{i}");
            for suffix in [
                "ln_1.weight",
                "ln_1.bias",
                "attn.c_attn.weight",
                "attn.c_attn.bias",
                "attn.c_proj.weight",
                "attn.c_proj.bias",
                "ln_2.weight",
                "ln_2.bias",
                "mlp.c_fc.weight",
                "mlp.c_fc.bias",
                "mlp.c_proj.weight",
                "mlp.c_proj.bias",
            ] {
                required.push(format!("{p}.{suffix}"));
            }
        }
        for name in required {
            if !self.params.contains_key(&name) {
                bail!("checkpoint is missing parameter {name}");
            }
        }
        Ok(())
    }

    fn p(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .cloned()
            .with_context(|| format!("unknown parameter {name}"))
    }

    fn linear(&self, prefix: &str) -> Result<Linear> {
        Ok(Linear::new(
            self.p(&format!("{prefix}.weight"))?,
            Some(self.p(&format!("{prefix}.bias"))?),
        ))
    }

    /// Layer norm from primitive ops so the editors can backpropagate
    /// through it (fused norm kernels have no backward pass)
    fn layer_norm(&self, prefix: &str, x: &Tensor) -> Result<Tensor> {
        let weight = self.p(&format!("{prefix}.weight"))?;
        let bias = self.p(&format!("{prefix}.bias"))?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.config.layer_norm_epsilon)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
            .collect();
        Tensor::from_vec(mask, (1, 1, seq_len, seq_len), &self.device)?
            .to_dtype(self.dtype)
            .map_err(Into::into)
    }

    fn attn_forward(&self, layer: usize, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let e = self.config.n_embd;
        let n_head = self.config.n_head;
        let head_dim = e / n_head;

        let qkv = self.linear(&format!("h.{layer}.attn.c_attn"))?.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, e)?;
        let k = qkv.narrow(D::Minus1, e, e)?;
        let v = qkv.narrow(D::Minus1, 2 * e, e)?;

        let q = q.reshape((b, seq_len, n_head, head_dim))?.transpose(1, 2)?;
        let k = k.reshape((b, seq_len, n_head, head_dim))?.transpose(1, 2)?;
        let v = v.reshape((b, seq_len, n_head, head_dim))?.transpose(1, 2)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        // composed softmax keeps the op graph differentiable for editing
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v.contiguous()?)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, e))?;
        Ok(self
            .linear(&format!("h.{layer}.attn.c_proj"))?
            .forward(&attn_output)?)
    }

    fn mlp_forward(&self, layer: usize, x: &Tensor, hooks: Option<&TraceHooks>) -> Result<Tensor> {
        let hidden = self
            .linear(&format!("h.{layer}.mlp.c_fc"))?
            .forward(x)?
            .gelu()?;
        let hidden = match hooks {
            Some(h) => h.apply(&format!("h.{layer}.mlp.act"), &hidden)?,
            None => hidden,
        };
        Ok(self
            .linear(&format!("h.{layer}.mlp.c_proj"))?
            .forward(&hidden)?)
    }

    fn block_forward(
        &self,
        layer: usize,
        x: &Tensor,
        mask: &Tensor,
        hooks: Option<&TraceHooks>,
    ) -> Result<Tensor> {
        let normed = self.layer_norm(&format!("h.{layer}.ln_1"), x)?;
        let x = (x + self.attn_forward(layer, &normed, mask)?)?;
        let normed = self.layer_norm(&format!("h.{layer}.ln_2"), &x)?;
        Ok((&x + self.mlp_forward(layer, &normed, hooks)?)?)
    }
}

impl EditBackend for Gpt2Backend {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.config.n_positions
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn forward(&self, input_ids: &Tensor, hooks: Option<&TraceHooks>) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len == 0 {
            bail!("empty input sequence");
        }
        if seq_len > self.config.n_positions {
            bail!(
                "sequence length {seq_len} exceeds model context {}",
                self.config.n_positions
            );
        }

        let wte_weight = self.p("wte.weight")?;
        let tok = Embedding::new(wte_weight.clone(), self.config.n_embd).forward(input_ids)?;
        let tok = match hooks {
            Some(h) => h.apply("wte", &tok)?,
            None => tok,
        };

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let pos = Embedding::new(self.p("wpe.weight")?, self.config.n_embd).forward(&positions)?;
        let mut hidden = tok.broadcast_add(&pos)?;

        let mask = self.causal_mask(seq_len)?;
        for i in 0..self.config.n_layer {
            hidden = self.block_forward(i, &hidden, &mask, hooks)?;
            if let Some(h) = hooks {
                hidden = h.apply(&format!("h.{i}"), &hidden)?;
            }
        }

        let hidden = self.layer_norm("ln_f", &hidden)?;

        // weight-tied LM head: logits = hidden @ wte^T
        let (b, seq_len, e) = hidden.dims3()?;
        let flat = hidden.reshape((b * seq_len, e))?;
        let logits = flat.matmul(&wte_weight.t()?)?;
        Ok(logits.reshape((b, seq_len, self.config.vocab_size))?)
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.keys().cloned().collect();
        names.sort();
        names
    }

    fn get_parameter(&self, name: &str) -> Result<Tensor> {
        self.p(name)
    }

    fn set_parameter(&mut self, name: &str, value: Tensor) -> Result<()> {
        let current = self
            .params
            .get(name)
            .with_context(|| format!("unknown parameter {name}"))?;
        if current.dims() != value.dims() {
            bail!(
                "shape mismatch for {name}: {:?} vs {:?}",
                current.dims(),
                value.dims()
            );
        }
        self.params.insert(name.to_string(), value);
        Ok(())
    }

    fn embed_layer_name(&self) -> String {
        "wte".to_string()
    }

    fn edit_weight_name(&self, layer: i64) -> String {
        if layer == crate::hparams::EMBED_LAYER {
            "wte.weight".to_string()
        } else {
            format!("h.{layer}.mlp.c_proj.weight")
        }
    }

    fn mlp_act_hook_name(&self, layer: i64) -> String {
        format!("h.{layer}.mlp.act")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_backend() -> Gpt2Backend {
        Gpt2Backend::seeded(Gpt2Config::tiny(32), 7, &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_produces_vocab_logits() {
        let backend = tiny_backend();
        let ids = Tensor::new(&[1u32, 5, 9], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let logits = backend.forward(&ids, None).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 32]);
    }

    #[test]
    fn seeded_backend_is_deterministic() {
        let a = tiny_backend();
        let b = tiny_backend();
        let ids = Tensor::new(&[2u32, 3], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let la: Vec<f32> = a
            .forward(&ids, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let lb: Vec<f32> = b
            .forward(&ids, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn set_parameter_rejects_shape_mismatch() {
        let mut backend = tiny_backend();
        let wrong = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(backend.set_parameter("wte.weight", wrong).is_err());
        assert!(backend
            .set_parameter("nope.weight", Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap())
            .is_err());
    }

    #[test]
    fn embedding_hook_changes_logits() {
        let backend = tiny_backend();
        let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let clean = backend.forward(&ids, None).unwrap();
        let hooks = TraceHooks::new().edit_output(
            "wte",
            Box::new(|x: &Tensor| Ok((x + 1.0)?)),
        );
        let hooked = backend.forward(&ids, Some(&hooks)).unwrap();
        let diff = (clean - hooked)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }
}
