//! Layer-window selection for editing sweeps
//!
//! Turns a sweep point (window size, central layer) into concrete
//! hyperparameter overrides for the chosen algorithm. Two edge behaviors
//! coexist on purpose: the width-3 rank-one window is *translated* inward
//! so it always keeps exactly three layers, while every other multi-layer
//! window is *clipped* at the network edges and may come back narrower —
//! the same edge logic used for diagnostic layer scans.

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::editors::Alg;
use crate::hparams::{Overrides, EMBED_LAYER};
use crate::objective::ObjectiveMode;

/// Compute hyperparameter overrides for one sweep point
///
/// `central_layer == EMBED_LAYER` selects embedding fine-tuning; only the
/// fine-tuning algorithm may take that path.
pub fn select_overrides(
    window_size: usize,
    central_layer: i64,
    alg: Alg,
    n_layers: usize,
    objective: ObjectiveMode,
) -> Result<Overrides> {
    let mut overrides = if central_layer == EMBED_LAYER {
        if alg != Alg::FineTune {
            bail!(
                "the embedding layer can only be edited by {}, not {}",
                Alg::FineTune.name(),
                alg.name()
            );
        }
        if window_size > 1 {
            warn!("ignoring window size {window_size} for embedding tuning");
        }
        Overrides {
            layers: Some(vec![EMBED_LAYER]),
            lr: Some(1e-3),
            num_steps: Some(100),
            norm_constraint: Some(0.01),
            ..Default::default()
        }
    } else if window_size == 1 {
        let mut o = Overrides {
            layers: Some(vec![central_layer]),
            ..Default::default()
        };
        if alg == Alg::FineTune {
            o.norm_constraint = Some(1e-4);
        }
        o
    } else if window_size == 3 && alg == Alg::RankOne {
        // keep exactly three layers: translate the window inward at edges
        let mut layers = [central_layer - 1, central_layer, central_layer + 1];
        let lo = layers[0];
        if lo < 0 {
            for l in &mut layers {
                *l -= lo;
            }
        }
        let hi = layers[2];
        let last = n_layers as i64 - 1;
        if hi > last {
            for l in &mut layers {
                *l -= hi - last;
            }
        }
        Overrides {
            layers: Some(layers.to_vec()),
            v_num_grad_steps: Some(4),
            v_lr: Some(0.1),
            ..Default::default()
        }
    } else {
        // symmetric window, clipped at the network edges
        let half = (window_size / 2) as i64;
        let half_up = window_size as i64 - half;
        let start = (central_layer - half).max(0);
        let end = (central_layer + half_up).min(n_layers as i64);
        let mut o = Overrides {
            layers: Some((start..end).collect()),
            ..Default::default()
        };
        if alg == Alg::FineTune {
            o.norm_constraint = Some(2e-4);
        }
        o
    };

    // the noised objective needs a larger optimization budget
    if objective == ObjectiveMode::FactForcing {
        match alg {
            Alg::FineTune => overrides.num_steps = Some(50),
            Alg::RankOne => overrides.v_num_grad_steps = Some(50),
        }
    }

    info!(
        "sweep point ws={window_size} layer={central_layer}: layers {:?}",
        overrides.layers
    );
    Ok(overrides)
}
