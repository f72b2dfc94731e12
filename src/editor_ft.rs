//! Constrained fine-tuning editor
//!
//! Gradient-descends the selected weights (the MLP output projections of
//! the listed layers, or the token embedding for the sentinel) on the
//! objective loss, projecting the accumulated delta back into an
//! L-infinity ball around the original values after every step.

use anyhow::{Context, Result};
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, SGD};
use tracing::debug;

use crate::dataset::EditRequest;
use crate::editors::{build_edit_hooks, objective_loss, target_weight_names, Alg, EditTask};
use crate::hparams::HyperParams;
use crate::model::EditableModel;

/// Apply the fine-tuning edit in place
pub fn apply(
    model: &mut EditableModel,
    requests: &[EditRequest],
    hparams: &HyperParams,
    task: &EditTask,
) -> Result<()> {
    let lr = hparams.lr.context("fine-tuning requires lr")?;
    let num_steps = hparams.num_steps.context("fine-tuning requires num_steps")?;
    let norm_constraint = hparams.norm_constraint;

    let names = target_weight_names(model, Alg::FineTune, hparams)?;

    // swap each weight for a Var-backed tensor so gradients reach it
    let mut tracked: Vec<(String, Tensor, Var)> = Vec::with_capacity(names.len());
    for name in &names {
        let original = model.backend().get_parameter(name)?;
        let var = Var::from_tensor(&original)?;
        model
            .backend_mut()
            .set_parameter(name, var.as_tensor().clone())?;
        tracked.push((name.clone(), original, var));
    }

    // one hook table per request so the noise stream advances across steps
    let mut request_hooks = Vec::with_capacity(requests.len());
    for request in requests {
        request_hooks.push(build_edit_hooks(model, request, hparams, task.objective)?);
    }

    let vars: Vec<Var> = tracked.iter().map(|(_, _, v)| v.clone()).collect();
    let mut optimizer = SGD::new(vars, lr)?;

    for step in 0..num_steps {
        let mut losses = Vec::with_capacity(requests.len());
        for (request, hooks) in requests.iter().zip(&request_hooks) {
            losses.push(objective_loss(model, request, hooks.as_ref(), task)?);
        }
        let loss = Tensor::stack(&losses, 0)?.mean(0)?;
        optimizer.backward_step(&loss)?;

        if let Some(c) = norm_constraint {
            for (_, original, var) in &tracked {
                let delta = (var.as_tensor() - original)?.clamp(-c, c)?;
                var.set(&(original + delta)?)?;
            }
        }

        if step % 10 == 0 {
            debug!("ft step {step}: loss {:.4}", scalar(&loss)?);
        }
    }

    // detach so later forwards stop building graphs through the edit
    for (name, _, var) in tracked {
        model
            .backend_mut()
            .set_parameter(&name, var.as_tensor().detach())?;
    }
    Ok(())
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(
        t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?,
    ))
}
