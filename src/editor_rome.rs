//! Rank-one editor
//!
//! For each selected layer, reads the mid-MLP activation at the subject's
//! last token as the key `k`, optimizes a value direction `u` by gradient
//! descent on the objective loss, and commits the update
//! `W' = W + u k̂ᵀ` with `k̂ = k / (kᵀk)`. The update is rank-one by
//! construction, so only the association keyed by the subject moves.

use anyhow::{bail, Context, Result};
use candle_core::{IndexOp, Var};
use candle_nn::{Optimizer, SGD};
use tracing::debug;

use crate::dataset::EditRequest;
use crate::editors::{build_edit_hooks, objective_loss, EditTask};
use crate::hooks::TraceHooks;
use crate::hparams::{HyperParams, EMBED_LAYER};
use crate::model::EditableModel;
use crate::trace;

/// Apply the rank-one edit in place, layer by layer
pub fn apply(
    model: &mut EditableModel,
    requests: &[EditRequest],
    hparams: &HyperParams,
    task: &EditTask,
) -> Result<()> {
    let v_lr = hparams.v_lr.context("rank-one editing requires v_lr")?;
    let v_steps = hparams
        .v_num_grad_steps
        .context("rank-one editing requires v_num_grad_steps")?;

    for &layer in &hparams.layers {
        if layer == EMBED_LAYER {
            bail!("the rank-one editor cannot edit the embedding layer");
        }
        for request in requests {
            edit_layer(model, layer, request, v_lr, v_steps, hparams, task)?;
        }
    }
    Ok(())
}

fn edit_layer(
    model: &mut EditableModel,
    layer: i64,
    request: &EditRequest,
    v_lr: f64,
    v_steps: usize,
    hparams: &HyperParams,
    task: &EditTask,
) -> Result<()> {
    let prompt = request.full_prompt();
    let range = trace::find_token_range(model, &prompt, &request.subject)?;
    let act_name = model.backend().mlp_act_hook_name(layer);

    // capture the key under the same corruption the edit will see
    let mut hooks = match build_edit_hooks(model, request, hparams, task.objective)? {
        Some(h) => h,
        None => TraceHooks::new(),
    };
    hooks = hooks.capture(&act_name);

    let ids = model.encode(&prompt)?;
    model.forward_ids(&[ids], Some(&hooks))?;
    let act = hooks
        .captured(&act_name)
        .with_context(|| format!("no activation captured at {act_name}"))?;
    let key = act.i((0, range.1 - 1))?.detach();

    let key_norm_sq = f64::from(key.sqr()?.sum_all()?.to_scalar::<f32>()?);
    if key_norm_sq < 1e-12 {
        bail!("degenerate key at layer {layer}: zero activation norm");
    }
    let key_hat = (key / key_norm_sq)?;

    let weight_name = model.backend().edit_weight_name(layer);
    let original = model.backend().get_parameter(&weight_name)?;

    let value = Var::zeros(model.d_model(), original.dtype(), model.device())?;
    let mut optimizer = SGD::new(vec![value.clone()], v_lr)?;

    for step in 0..v_steps {
        let delta = value
            .as_tensor()
            .unsqueeze(1)?
            .matmul(&key_hat.unsqueeze(0)?)?;
        model
            .backend_mut()
            .set_parameter(&weight_name, (&original + delta)?)?;

        let loss = objective_loss(model, request, Some(&hooks), task)?;
        optimizer.backward_step(&loss)?;

        if step % 10 == 0 {
            let l: f32 = loss.to_dtype(candle_core::DType::F32)?.to_scalar()?;
            debug!("rank-one layer {layer} step {step}: loss {l:.4}");
        }
    }

    // commit the optimized rank-one update, detached from the graph
    let delta = value
        .as_tensor()
        .unsqueeze(1)?
        .matmul(&key_hat.unsqueeze(0)?)?;
    model
        .backend_mut()
        .set_parameter(&weight_name, (&original + delta)?.detach())?;
    Ok(())
}
