//! Layer-output interception for forward passes
//!
//! A [`TraceHooks`] table registers transforms and captures against named
//! layers for the duration of one forward (or one edit call). The backend
//! consults the table at each hook point; layers without an entry pass
//! through unmodified.
//!
//! Hook names follow the parameter-table convention of the backend:
//! `wte` for the token-embedding output, `h.{i}` for block outputs, and
//! `h.{i}.mlp.act` for the mid-MLP activation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use candle_core::Tensor;

/// Transform applied to one layer's output tensor
pub type EditFn = Box<dyn Fn(&Tensor) -> Result<Tensor>>;

/// Callback table consulted by backends at named hook points
#[derive(Default)]
pub struct TraceHooks {
    edits: HashMap<String, EditFn>,
    capture_set: HashSet<String>,
    captured: RefCell<HashMap<String, Tensor>>,
}

impl TraceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform on the output of exactly one named layer
    pub fn edit_output(mut self, layer: impl Into<String>, f: EditFn) -> Self {
        self.edits.insert(layer.into(), f);
        self
    }

    /// Record the output of a named layer during the next forward
    pub fn capture(mut self, layer: impl Into<String>) -> Self {
        self.capture_set.insert(layer.into());
        self
    }

    /// Called by the backend at each hook point
    ///
    /// Capture happens before the edit, so a captured tensor is always the
    /// unmodified layer output.
    pub fn apply(&self, layer: &str, x: &Tensor) -> Result<Tensor> {
        if self.capture_set.contains(layer) {
            self.captured
                .borrow_mut()
                .insert(layer.to_string(), x.clone());
        }
        match self.edits.get(layer) {
            Some(f) => f(x),
            None => Ok(x.clone()),
        }
    }

    /// Tensor captured at `layer` during the most recent forward, if any
    pub fn captured(&self, layer: &str) -> Option<Tensor> {
        self.captured.borrow().get(layer).cloned()
    }

    /// True when neither edits nor captures are registered
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty() && self.capture_set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn untouched_layers_pass_through() {
        let device = Device::Cpu;
        let hooks = TraceHooks::new().edit_output(
            "h.3",
            Box::new(|x: &Tensor| Ok((x * 2.0)?)),
        );

        let x = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        let same = hooks.apply("h.0", &x).unwrap();
        let doubled = hooks.apply("h.3", &x).unwrap();

        assert_eq!(same.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(doubled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn capture_records_pre_edit_output() {
        let device = Device::Cpu;
        let hooks = TraceHooks::new()
            .capture("wte")
            .edit_output("wte", Box::new(|x: &Tensor| Ok((x + 1.0)?)));

        let x = Tensor::new(&[5.0f32], &device).unwrap();
        let edited = hooks.apply("wte", &x).unwrap();

        assert_eq!(edited.to_vec1::<f32>().unwrap(), vec![6.0]);
        let captured = hooks.captured("wte").unwrap();
        assert_eq!(captured.to_vec1::<f32>().unwrap(), vec![5.0]);
    }
}
