//! Auxiliary sources: per-population injected contributions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{AuxModel, VarInit};

/// An auxiliary source attached to one population, e.g. a constant or noisy
/// drive injected into every unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxSourceDescriptor {
    pub name: String,
    pub model: Arc<AuxModel>,
    pub params: Vec<f64>,
    pub derived_param_values: Vec<f64>,
    pub var_inits: Vec<VarInit>,
}

impl AuxSourceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Update-role equivalence: identical model content. Values excluded.
    pub fn can_be_merged(&self, other: &AuxSourceDescriptor) -> bool {
        self.model == other.model
    }

    /// Init-role equivalence: identical variable declarations and pairwise
    /// mergeable initialiser snippets.
    pub fn can_init_be_merged(&self, other: &AuxSourceDescriptor) -> bool {
        self.model.vars == other.model.vars
            && self.var_inits.len() == other.var_inits.len()
            && self
                .var_inits
                .iter()
                .zip(&other.var_inits)
                .all(|(a, b)| a.can_be_merged(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuxModel;

    fn source(name: &str, inject_code: &str, params: Vec<f64>) -> AuxSourceDescriptor {
        AuxSourceDescriptor {
            name: name.into(),
            model: Arc::new(AuxModel {
                name: "drive".into(),
                param_names: vec!["amp".into()],
                inject_code: inject_code.into(),
                ..Default::default()
            }),
            params,
            derived_param_values: vec![],
            var_inits: vec![],
        }
    }

    #[test]
    fn merge_ignores_param_values() {
        let a = source("a", "$(inject, $(amp));", vec![1.0]);
        let b = source("b", "$(inject, $(amp));", vec![7.5]);
        assert!(a.can_be_merged(&b));
    }

    #[test]
    fn merge_rejects_different_code() {
        let a = source("a", "$(inject, $(amp));", vec![1.0]);
        let b = source("b", "$(inject, 2.0 * $(amp));", vec![1.0]);
        assert!(!a.can_be_merged(&b));
    }
}
