//! Editing objectives
//!
//! Exactly one objective is active per run. The CLI exposes them as
//! mutually exclusive flags; [`ObjectiveMode::from_flags`] collapses the
//! flags into a single enum once at startup so no downstream code ever
//! branches on raw booleans.

use anyhow::{bail, Result};

/// What "success" means for an edit in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectiveMode {
    /// Benchmark-supplied false target, true answer as baseline
    #[default]
    Default,
    /// Push the model toward the token it predicts under subject noise
    TraceReversal,
    /// Restore the true answer while the subject stays corrupted
    FactForcing,
    /// Erase the fact: drive the true answer toward its noised prior
    FactErasure,
    /// Fact-forcing attributed to weight-level causal tracing
    WeightBasedTracing,
}

impl ObjectiveMode {
    /// Collapse the CLI flags into one mode; more than one set flag is fatal
    pub fn from_flags(
        tracing_reversal: bool,
        fact_forcing: bool,
        fact_erasure: bool,
        weight_based_tracing: bool,
    ) -> Result<Self> {
        let set = [
            tracing_reversal,
            fact_forcing,
            fact_erasure,
            weight_based_tracing,
        ]
        .iter()
        .filter(|&&f| f)
        .count();
        if set > 1 {
            bail!("objective flags are mutually exclusive; {set} were set");
        }
        Ok(if tracing_reversal {
            Self::TraceReversal
        } else if fact_forcing {
            Self::FactForcing
        } else if fact_erasure {
            Self::FactErasure
        } else if weight_based_tracing {
            Self::WeightBasedTracing
        } else {
            Self::Default
        })
    }

    /// Suffix appended to experiment names
    pub fn tag(self) -> &'static str {
        match self {
            Self::Default => "",
            Self::TraceReversal => "_trace-reverse",
            Self::FactForcing => "_fact-forcing",
            Self::FactErasure => "_fact-erasure",
            Self::WeightBasedTracing => "_weight-tracing",
        }
    }

    /// (key, value) pairs folded into the run-directory name
    pub fn name_params(self) -> Vec<(String, String)> {
        match self {
            Self::Default => vec![],
            Self::TraceReversal => vec![("trace-reverse".into(), "T".into())],
            Self::FactForcing => vec![("fact-forcing".into(), "T".into())],
            Self::FactErasure => vec![("erase".into(), "T".into())],
            Self::WeightBasedTracing => vec![("weight-based".into(), "T".into())],
        }
    }

    /// Does target construction run a noised forward pass?
    pub fn needs_noised_prediction(self) -> bool {
        matches!(self, Self::TraceReversal | Self::FactForcing | Self::WeightBasedTracing)
    }

    /// Is the subject span kept corrupted during the edit itself?
    pub fn noises_edit(self) -> bool {
        matches!(self, Self::FactForcing | Self::WeightBasedTracing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_is_default_mode() {
        let mode = ObjectiveMode::from_flags(false, false, false, false).unwrap();
        assert_eq!(mode, ObjectiveMode::Default);
        assert_eq!(mode.tag(), "");
        assert!(!mode.needs_noised_prediction());
    }

    #[test]
    fn single_flag_selects_its_mode() {
        assert_eq!(
            ObjectiveMode::from_flags(true, false, false, false).unwrap(),
            ObjectiveMode::TraceReversal
        );
        assert_eq!(
            ObjectiveMode::from_flags(false, false, true, false).unwrap(),
            ObjectiveMode::FactErasure
        );
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(ObjectiveMode::from_flags(true, true, false, false).is_err());
        assert!(ObjectiveMode::from_flags(false, true, false, true).is_err());
    }

    #[test]
    fn only_forcing_modes_noise_the_edit() {
        assert!(ObjectiveMode::FactForcing.noises_edit());
        assert!(ObjectiveMode::WeightBasedTracing.noises_edit());
        assert!(!ObjectiveMode::TraceReversal.noises_edit());
        assert!(!ObjectiveMode::FactErasure.noises_edit());
    }
}
