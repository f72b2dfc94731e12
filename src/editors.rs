//! Edit applicator and the closed editing-algorithm family
//!
//! Algorithms live behind one uniform contract: capture the original
//! tensors for every weight the editor will touch, mutate the model in
//! place, and hand the backup to the caller for restoration. No defensive
//! model copy is ever taken; the backup is the only undo mechanism.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::dataset::EditRequest;
use crate::hooks::TraceHooks;
use crate::hparams::{HyperParams, EMBED_LAYER};
use crate::model::EditableModel;
use crate::objective::ObjectiveMode;
use crate::trace;

/// The editing-algorithm family (closed set; unknown names are fatal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alg {
    /// Rank-one weight rewriting at the MLP output projection
    RankOne,
    /// Constrained gradient fine-tuning of selected weights
    FineTune,
}

impl Alg {
    /// Resolve a registry name; lookup failure aborts the run
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "ROME" => Ok(Self::RankOne),
            "FT" => Ok(Self::FineTune),
            other => bail!("unknown editing algorithm {other:?} (expected one of: ROME, FT)"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RankOne => "ROME",
            Self::FineTune => "FT",
        }
    }
}

/// Where original weight tensors are parked during an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Keep backups on the model's device (default, fastest restore)
    Accelerator,
    /// Park backups in host memory at a small transfer cost
    Host,
}

impl MemoryPolicy {
    pub fn from_conserve_flag(conserve_memory: bool) -> Self {
        if conserve_memory {
            Self::Host
        } else {
            Self::Accelerator
        }
    }
}

/// Original tensors captured before an edit, keyed by parameter name
pub type WeightBackup = HashMap<String, Tensor>;

/// Per-case editing context shared by all algorithms
#[derive(Debug, Clone, Copy)]
pub struct EditTask {
    pub objective: ObjectiveMode,
    /// Noised prior probability; present only for the erasure objective
    pub prior_prob: Option<f64>,
}

/// Names of the weights `alg` will modify under `hparams`
pub fn target_weight_names(
    model: &EditableModel,
    alg: Alg,
    hparams: &HyperParams,
) -> Result<Vec<String>> {
    if hparams.layers.is_empty() {
        bail!("hyperparameters select no layers to edit");
    }
    if alg == Alg::RankOne && hparams.layers.contains(&EMBED_LAYER) {
        bail!("the rank-one editor cannot edit the embedding layer");
    }
    let mut names: Vec<String> = hparams
        .layers
        .iter()
        .map(|&l| model.backend().edit_weight_name(l))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Apply an edit in place and return the weight backup plus elapsed seconds
///
/// The backup is captured before any mutation; every parameter named in it
/// must be written back via [`restore_weights`] before the next case may
/// start.
pub fn apply_edit(
    model: &mut EditableModel,
    alg: Alg,
    requests: &[EditRequest],
    hparams: &HyperParams,
    policy: MemoryPolicy,
    task: &EditTask,
) -> Result<(WeightBackup, f64)> {
    let names = target_weight_names(model, alg, hparams)?;
    let mut backup = WeightBackup::new();
    for name in &names {
        let tensor = model.backend().get_parameter(name)?;
        let snapshot = match policy {
            MemoryPolicy::Accelerator => tensor,
            MemoryPolicy::Host => tensor.to_device(&Device::Cpu)?,
        };
        backup.insert(name.clone(), snapshot);
    }
    info!(
        "applying {} to {} weight(s): {:?}",
        alg.name(),
        names.len(),
        names
    );

    let start = Instant::now();
    let applied = match alg {
        Alg::FineTune => crate::editor_ft::apply(model, requests, hparams, task),
        Alg::RankOne => crate::editor_rome::apply(model, requests, hparams, task),
    };
    if let Err(err) = applied {
        // a failed edit may have partially mutated weights; undo before
        // surfacing the error so the abort path leaves the model clean
        restore_weights(model, &backup)?;
        return Err(err);
    }
    let elapsed = start.elapsed().as_secs_f64();
    debug!("edit took {elapsed:.2}s");

    Ok((backup, elapsed))
}

/// Write every backed-up tensor back into the model
pub fn restore_weights(model: &mut EditableModel, backup: &WeightBackup) -> Result<()> {
    let device = model.device().clone();
    for (name, tensor) in backup {
        let restored = tensor.to_device(&device)?;
        model.backend_mut().set_parameter(name, restored)?;
    }
    Ok(())
}

/// Edit-time noise hooks for one request, or `None` when the objective
/// does not corrupt the edit
pub(crate) fn build_edit_hooks(
    model: &EditableModel,
    request: &EditRequest,
    hparams: &HyperParams,
    objective: ObjectiveMode,
) -> Result<Option<TraceHooks>> {
    if !objective.noises_edit() {
        return Ok(None);
    }
    let prompt = request.full_prompt();
    let range = trace::find_token_range(model, &prompt, &request.subject)?;
    Ok(Some(TraceHooks::new().edit_output(
        model.backend().embed_layer_name(),
        trace::noise_hook(range, hparams.editing_noise, trace::NOISE_SEED),
    )))
}

/// Optimization loss for one request under the active objective
///
/// Plain target NLL for directional objectives; for erasure, the squared
/// distance between the true target's log-probability and its noised
/// prior, which pushes the fact down without a replacement target.
pub(crate) fn objective_loss(
    model: &EditableModel,
    request: &EditRequest,
    hooks: Option<&TraceHooks>,
    task: &EditTask,
) -> Result<Tensor> {
    let prompt = request.full_prompt();
    let nll = model.target_nll_loss(&prompt, &request.target_new.str, hooks)?;
    match task.objective {
        ObjectiveMode::FactErasure => {
            let prior = task
                .prior_prob
                .context("erasure objective requires a noised prior probability")?;
            let log_prior = prior.max(f64::MIN_POSITIVE).ln();
            let log_prob = nll.neg()?;
            Ok((log_prob - log_prior)?.sqr()?)
        }
        _ => Ok(nll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_closed() {
        assert_eq!(Alg::from_name("ROME").unwrap(), Alg::RankOne);
        assert_eq!(Alg::from_name("FT").unwrap(), Alg::FineTune);
        assert!(Alg::from_name("MEND").is_err());
        assert!(Alg::from_name("rome").is_err());
    }

    #[test]
    fn memory_policy_follows_conserve_flag() {
        assert_eq!(MemoryPolicy::from_conserve_flag(true), MemoryPolicy::Host);
        assert_eq!(
            MemoryPolicy::from_conserve_flag(false),
            MemoryPolicy::Accelerator
        );
    }

    #[test]
    fn rank_one_rejects_embedding_sentinel() {
        let model = EditableModel::synthetic(&["a", "b"], 3).unwrap();
        let hp = HyperParams {
            layers: vec![EMBED_LAYER],
            editing_noise: 0.1,
            lr: None,
            num_steps: None,
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        assert!(target_weight_names(&model, Alg::RankOne, &hp).is_err());
        assert_eq!(
            target_weight_names(&model, Alg::FineTune, &hp).unwrap(),
            vec!["wte.weight".to_string()]
        );
    }

    #[test]
    fn duplicate_layers_collapse_to_one_weight() {
        let model = EditableModel::synthetic(&["a", "b"], 3).unwrap();
        let hp = HyperParams {
            layers: vec![1, 1, 0],
            editing_noise: 0.1,
            lr: None,
            num_steps: None,
            norm_constraint: None,
            v_lr: None,
            v_num_grad_steps: None,
        };
        let names = target_weight_names(&model, Alg::RankOne, &hp).unwrap();
        assert_eq!(names.len(), 2);
    }
}
