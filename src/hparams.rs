//! Hyperparameter artifacts for editing algorithms
//!
//! One JSON file per (algorithm, model) pair under
//! `<hparams_dir>/<ALG>/<model>.json`. The fine-tuning algorithm reads the
//! norm-constrained variant (`<model>_constr.json`). Sweep points override
//! individual fields via [`Overrides`]; hyperparameters never change once
//! an edit has begun.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::editors::Alg;

/// Layer index meaning "edit the token embedding" rather than a block
pub const EMBED_LAYER: i64 = -1;

/// Sentinel on the CLI meaning "defer to the sweep grid"
pub const SWEEP_ALL_LAYERS: i64 = -2;

fn default_editing_noise() -> f64 {
    0.1
}

/// Recognized editing knobs, deserialized from the per-(algorithm, model)
/// JSON artifact. Algorithm-specific fields are optional so one schema
/// covers the whole family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParams {
    /// Layer indices to edit; `-1` is the embedding sentinel
    pub layers: Vec<i64>,
    /// Gaussian noise scale for the causal-forcing objectives
    #[serde(default = "default_editing_noise")]
    pub editing_noise: f64,
    /// Fine-tuning learning rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f64>,
    /// Fine-tuning step count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_steps: Option<usize>,
    /// L-infinity constraint on fine-tuned weight deltas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub norm_constraint: Option<f64>,
    /// Rank-one value-optimization learning rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_lr: Option<f64>,
    /// Rank-one value-optimization step count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_num_grad_steps: Option<usize>,
}

impl HyperParams {
    /// Path of the artifact for this (algorithm, model) pair
    pub fn artifact_path(hparams_dir: &Path, alg: Alg, model_name: &str) -> PathBuf {
        let model_file = model_name.replace('/', "_");
        let file = match alg {
            Alg::FineTune => format!("{model_file}_constr.json"),
            Alg::RankOne => format!("{model_file}.json"),
        };
        hparams_dir.join(alg.name()).join(file)
    }

    /// Load the artifact; a missing or malformed file is fatal
    pub fn from_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("missing hyperparameter file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid hyperparameter file {}", path.display()))
    }

    /// Apply sweep-point overrides in place
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(layers) = &overrides.layers {
            self.layers = layers.clone();
        }
        if let Some(lr) = overrides.lr {
            self.lr = Some(lr);
        }
        if let Some(num_steps) = overrides.num_steps {
            self.num_steps = Some(num_steps);
        }
        if let Some(c) = overrides.norm_constraint {
            self.norm_constraint = Some(c);
        }
        if let Some(v_lr) = overrides.v_lr {
            self.v_lr = Some(v_lr);
        }
        if let Some(steps) = overrides.v_num_grad_steps {
            self.v_num_grad_steps = Some(steps);
        }
    }

    /// Resolved (key, value) pairs for the fields an override touched,
    /// formatted for run-directory names
    pub fn important(&self, overrides: &Overrides) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if overrides.layers.is_some() {
            out.push(("layers".to_string(), format_layers(&self.layers)));
        }
        if overrides.lr.is_some() {
            if let Some(lr) = self.lr {
                out.push(("lr".to_string(), format!("{lr}")));
            }
        }
        if overrides.num_steps.is_some() {
            if let Some(n) = self.num_steps {
                out.push(("num_steps".to_string(), format!("{n}")));
            }
        }
        if overrides.norm_constraint.is_some() {
            if let Some(c) = self.norm_constraint {
                out.push(("norm_constraint".to_string(), format!("{c}")));
            }
        }
        if overrides.v_lr.is_some() {
            if let Some(v) = self.v_lr {
                out.push(("v_lr".to_string(), format!("{v}")));
            }
        }
        if overrides.v_num_grad_steps.is_some() {
            if let Some(n) = self.v_num_grad_steps {
                out.push(("v_num_grad_steps".to_string(), format!("{n}")));
            }
        }
        out
    }
}

/// Format a layer list for run names: `-1` reads as `embeds`, `-2` as `all`
pub fn format_layers(layers: &[i64]) -> String {
    if layers == [EMBED_LAYER] {
        return "embeds".to_string();
    }
    if layers == [SWEEP_ALL_LAYERS] {
        return "all".to_string();
    }
    layers
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Per-sweep-point hyperparameter overrides produced by the layer-window
/// selector. Only set fields replace artifact values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub layers: Option<Vec<i64>>,
    pub lr: Option<f64>,
    pub num_steps: Option<usize>,
    pub norm_constraint: Option<f64>,
    pub v_lr: Option<f64>,
    pub v_num_grad_steps: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_set_fields() {
        let mut hp = HyperParams {
            layers: vec![0],
            editing_noise: 0.1,
            lr: Some(5e-4),
            num_steps: Some(25),
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        let ov = Overrides {
            layers: Some(vec![3, 4, 5]),
            norm_constraint: Some(2e-4),
            ..Default::default()
        };
        hp.apply_overrides(&ov);
        assert_eq!(hp.layers, vec![3, 4, 5]);
        assert_eq!(hp.norm_constraint, Some(2e-4));
        assert_eq!(hp.lr, Some(5e-4));
        assert_eq!(hp.num_steps, Some(25));
    }

    #[test]
    fn layer_formatting_uses_sentinel_names() {
        assert_eq!(format_layers(&[EMBED_LAYER]), "embeds");
        assert_eq!(format_layers(&[SWEEP_ALL_LAYERS]), "all");
        assert_eq!(format_layers(&[3, 4, 5]), "3-4-5");
    }

    #[test]
    fn artifact_path_picks_constrained_variant_for_ft() {
        let dir = Path::new("hparams");
        let ft = HyperParams::artifact_path(dir, Alg::FineTune, "gpt2-xl");
        let rome = HyperParams::artifact_path(dir, Alg::RankOne, "org/gpt2-xl");
        assert!(ft.ends_with("FT/gpt2-xl_constr.json"));
        assert!(rome.ends_with("ROME/org_gpt2-xl.json"));
    }
}
