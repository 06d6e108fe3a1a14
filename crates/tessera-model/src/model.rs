//! Equation-model descriptors.
//!
//! A model is the named bundle of code snippets, parameter-name lists and
//! declarations shared by every entity instantiating it. Model *content*
//! (code text, names, declarations) defines structural identity for merging;
//! numeric values live on the descriptors that reference a model.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A declared per-instance state variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    /// Element type text in the generated language, e.g. `"scalar"`.
    pub ty: String,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// A declared external buffer: a runtime-resident value or array supplied by
/// the model author, not built-in per-instance state.
///
/// Pointer-typed buffers (`ty` ending in `*`) live on the device and are
/// name-templated per entity; value-typed buffers are plain per-instance
/// scalars in the merged layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDecl {
    pub name: String,
    pub ty: String,
}

impl BufferDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// True if a type text denotes a device pointer.
pub fn is_pointer_ty(ty: &str) -> bool {
    ty.trim_end().ends_with('*')
}

/// A derived parameter: named, with a host-side formula. Values are computed
/// by the front end and arrive on descriptors alongside the raw parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedParam {
    pub name: String,
    pub formula: String,
}

impl DerivedParam {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }
}

/// An initialiser snippet: code writing `$(value)`, plus the parameters the
/// code may reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSnippet {
    pub code: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub extra_buffers: Vec<BufferDecl>,
}

/// One state variable's initialiser: a shared snippet plus this entity's
/// numeric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarInit {
    pub snippet: Arc<InitSnippet>,
    pub params: Vec<f64>,
    pub derived_param_values: Vec<f64>,
    /// Set when the initialiser reduces to a plain constant. Required by
    /// projections with [`Weights::Global`](crate::Weights), where the shared
    /// value is embedded rather than stored.
    pub constant_value: Option<f64>,
}

impl VarInit {
    pub fn new(snippet: Arc<InitSnippet>, params: Vec<f64>, derived: Vec<f64>) -> Self {
        Self {
            snippet,
            params,
            derived_param_values: derived,
            constant_value: None,
        }
    }

    /// A constant initialiser, `$(value) = c`.
    pub fn constant(value: f64) -> Self {
        Self {
            snippet: Arc::new(InitSnippet {
                code: "$(value) = $(constant);".into(),
                param_names: vec!["constant".into()],
                ..Default::default()
            }),
            params: vec![value],
            derived_param_values: vec![],
            constant_value: Some(value),
        }
    }

    /// Structural equivalence: same snippet content. Values are excluded.
    pub fn can_be_merged(&self, other: &VarInit) -> bool {
        self.snippet.code == other.snippet.code
            && self.snippet.param_names == other.snippet.param_names
            && self.snippet.derived_params == other.snippet.derived_params
    }
}

/// The model governing a population of computational units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitModel {
    pub name: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<VarDecl>,
    pub extra_buffers: Vec<BufferDecl>,
    /// Per-unit update statements, run every step.
    pub update_code: String,
    /// Boolean expression; true emits an event on the population's channel.
    pub event_condition_code: String,
}

/// The model governing an auxiliary source attached to a population
/// (e.g. an injected drive).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxModel {
    pub name: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<VarDecl>,
    pub extra_buffers: Vec<BufferDecl>,
    /// Per-target-unit injection statements, run inside the population body.
    pub inject_code: String,
}

/// The model governing a projection's per-connection equations.
///
/// Code snippets are consumed by different compilation roles: `transmit_code`
/// and `event_code` by the forward pass, `learn_code` by the backward pass,
/// `dynamics_code` by the continuous pass. `src_update_code` /
/// `tgt_update_code` run per end-unit inside the population kernels and
/// consume `src_vars` / `tgt_vars`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CouplingModel {
    pub name: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    /// Per-connection state variables (the weights, and friends).
    pub vars: Vec<VarDecl>,
    pub src_vars: Vec<VarDecl>,
    pub tgt_vars: Vec<VarDecl>,
    pub extra_buffers: Vec<BufferDecl>,
    pub transmit_code: String,
    pub event_code: String,
    pub learn_code: String,
    pub dynamics_code: String,
    pub src_update_code: String,
    pub tgt_update_code: String,
    /// Applied per target unit to turn the accumulated input into drive.
    pub acc_code: String,
    pub src_event_times_required: bool,
    pub tgt_event_times_required: bool,
}

impl CouplingModel {
    /// The code consumed by an update role, concatenated so reference checks
    /// cover both the transmit and sub-threshold event paths.
    pub fn forward_code(&self) -> String {
        format!("{}{}", self.transmit_code, self.event_code)
    }
}

/// A projection's connectivity initialiser: snippet plus this projection's
/// values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityInit {
    pub snippet: Arc<InitSnippet>,
    pub params: Vec<f64>,
    pub derived_param_values: Vec<f64>,
}

impl ConnectivityInit {
    /// Structural equivalence on snippet content only.
    pub fn can_be_merged(&self, other: &ConnectivityInit) -> bool {
        self.snippet.code == other.snippet.code
            && self.snippet.param_names == other.snippet.param_names
            && self.snippet.derived_params == other.snippet.derived_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_ty_detection() {
        assert!(is_pointer_ty("scalar*"));
        assert!(is_pointer_ty("unsigned int *"));
        assert!(!is_pointer_ty("scalar"));
    }

    #[test]
    fn var_init_merges_on_snippet_content_not_values() {
        let snippet = Arc::new(InitSnippet {
            code: "$(value) = $(mean);".into(),
            param_names: vec!["mean".into()],
            ..Default::default()
        });
        let a = VarInit::new(snippet.clone(), vec![1.0], vec![]);
        let b = VarInit::new(snippet.clone(), vec![2.0], vec![]);
        assert!(a.can_be_merged(&b));

        let other = Arc::new(InitSnippet {
            code: "$(value) = 0.0;".into(),
            ..Default::default()
        });
        let c = VarInit::new(other, vec![], vec![]);
        assert!(!a.can_be_merged(&c));
    }
}
