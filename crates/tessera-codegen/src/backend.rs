//! The backend capability boundary and the dispatch-strategy registry.
//!
//! The merging engine depends on this narrow interface only; concrete
//! backends (one per compute target) live in their own crates and never hold
//! engine state.

use crate::emit::CodeWriter;
use crate::error::{CodegenError, Result};

use tessera_model::{Connectivity, ProjectionDescriptor};

/// The generated kernel bodies, one per compilation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelPhase {
    /// Advance population delay queues and reset event counts.
    PopulationQueueUpdate,
    /// Advance target-side accumulation delay queues.
    AccQueueUpdate,
    PopulationUpdate,
    ProjectionForward,
    ProjectionBackward,
    ProjectionDynamics,
    Init,
    InitSparse,
}

impl KernelPhase {
    /// Generated kernel entry-point name.
    pub fn kernel_name(&self) -> &'static str {
        match self {
            KernelPhase::PopulationQueueUpdate => "advancePopulationQueues",
            KernelPhase::AccQueueUpdate => "advanceAccQueues",
            KernelPhase::PopulationUpdate => "updatePopulations",
            KernelPhase::ProjectionForward => "updateProjectionsForward",
            KernelPhase::ProjectionBackward => "updateProjectionsBackward",
            KernelPhase::ProjectionDynamics => "updateProjectionDynamics",
            KernelPhase::Init => "initialize",
            KernelPhase::InitSparse => "initializeSparse",
        }
    }

    pub const ALL: [KernelPhase; 8] = [
        KernelPhase::PopulationQueueUpdate,
        KernelPhase::AccQueueUpdate,
        KernelPhase::PopulationUpdate,
        KernelPhase::ProjectionForward,
        KernelPhase::ProjectionBackward,
        KernelPhase::ProjectionDynamics,
        KernelPhase::Init,
        KernelPhase::InitSparse,
    ];
}

/// Capabilities a compute backend supplies to the engine: execution-width
/// rounding, naming conventions and code fragments. Implementations are
/// stateless with respect to the engine.
pub trait Backend {
    /// Lanes per execution block for `phase`.
    fn execution_width(&self, phase: KernelPhase) -> usize;

    /// `n` rounded up to a whole number of execution blocks.
    fn padded_size(&self, phase: KernelPhase, n: usize) -> usize {
        let w = self.execution_width(phase);
        n.div_ceil(w) * w
    }

    /// Prefix of device-resident buffer names, e.g. `d_`.
    fn device_buffer_prefix(&self) -> &str;

    /// Prefix of device-resident scalar symbols (queue cursors and such).
    fn device_scalar_prefix(&self) -> &str;

    /// Regex matching device-buffer tokens inside emitted code, used by the
    /// fallback scan over author-supplied fragments.
    fn buffer_token_pattern(&self) -> String {
        format!(r"\b{}\w+\b", regex::escape(self.device_buffer_prefix()))
    }

    /// Whether populations flagged `rng_required` get a device RNG state
    /// field.
    fn population_rng_required(&self) -> bool {
        false
    }

    /// Element type of per-unit RNG state.
    fn rng_state_ty(&self) -> &str {
        "rngState"
    }

    /// Whether backward passes over sparse connectivity read through the
    /// column-major remap tables.
    fn backward_remap_required(&self) -> bool {
        true
    }

    /// Whether dynamics passes over sparse connectivity read through the
    /// flat connection remap.
    fn dynamics_remap_required(&self) -> bool {
        true
    }

    /// Name of the atomic add function for `ty`.
    fn atomic_add_fn(&self, ty: &str) -> String;

    /// Name of the atomic bitwise-or function for mask words.
    fn atomic_or_fn(&self) -> String {
        "atomic_or".into()
    }

    /// Expression yielding the global lane id.
    fn lane_id_expr(&self) -> String;

    /// Kernel entry-point qualifier, e.g. `__kernel`.
    fn kernel_qualifier(&self) -> &str;

    /// Qualifier applied to device-memory pointer parameters.
    fn global_qualifier(&self) -> &str;

    /// Emit host code pushing `count` elements of buffer `name` to the
    /// device.
    fn gen_push(&self, w: &mut CodeWriter, name: &str, ty: &str, count: usize);

    /// Emit host code pulling `count` elements of buffer `name` from the
    /// device.
    fn gen_pull(&self, w: &mut CodeWriter, name: &str, ty: &str, count: usize);
}

/// How a forward-pass strategy maps lanes onto a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneRole {
    /// One lane per target unit; events iterated per lane.
    TargetUnit,
    /// One lane per source unit row.
    SourceRow,
}

/// An interchangeable forward-dispatch strategy.
pub trait ForwardStrategy: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether this strategy can drive the projection.
    fn applicable(&self, proj: &ProjectionDescriptor) -> bool;

    /// Unpadded lane requirement for one projection.
    fn lanes(&self, proj: &ProjectionDescriptor) -> usize;

    fn lane_role(&self) -> LaneRole;
}

/// One lane per target unit. Applicable to every connectivity kind; the
/// fallback when nothing more specific matches.
#[derive(Debug, Default)]
pub struct TargetSpanStrategy;

impl ForwardStrategy for TargetSpanStrategy {
    fn name(&self) -> &'static str {
        "target-span"
    }

    fn applicable(&self, _proj: &ProjectionDescriptor) -> bool {
        true
    }

    fn lanes(&self, proj: &ProjectionDescriptor) -> usize {
        match &proj.connectivity {
            Connectivity::Sparse { .. } => proj.max_row_length as usize,
            _ => proj.target_count as usize,
        }
    }

    fn lane_role(&self) -> LaneRole {
        LaneRole::TargetUnit
    }
}

/// One lane per source row. Pays off for very sparse rows; only applicable
/// to sparse connectivity.
#[derive(Debug, Default)]
pub struct SourceSpanStrategy;

impl ForwardStrategy for SourceSpanStrategy {
    fn name(&self) -> &'static str {
        "source-span"
    }

    fn applicable(&self, proj: &ProjectionDescriptor) -> bool {
        matches!(proj.connectivity, Connectivity::Sparse { .. })
    }

    fn lanes(&self, proj: &ProjectionDescriptor) -> usize {
        proj.source_count as usize
    }

    fn lane_role(&self) -> LaneRole {
        LaneRole::SourceRow
    }
}

/// Preference-ordered collection of forward strategies, owned by the
/// compilation context and passed into the engine; selection picks the first
/// applicable entry in registration order.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn ForwardStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// The stock registry: target-span only. Register more specific
    /// strategies ahead of it to take precedence.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(Box::new(TargetSpanStrategy));
        r
    }

    /// Append a strategy; earlier registrations are preferred.
    pub fn register(&mut self, strategy: Box<dyn ForwardStrategy>) {
        self.strategies.push(strategy);
    }

    /// First applicable strategy in registration order.
    pub fn select(&self, proj: &ProjectionDescriptor) -> Result<&dyn ForwardStrategy> {
        self.strategies
            .iter()
            .find(|s| s.applicable(proj))
            .map(|s| s.as_ref())
            .ok_or_else(|| CodegenError::NoApplicableStrategy {
                projection: proj.name.clone(),
            })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_model::{ConnectivityInit, CouplingModel, Weights};

    fn sparse_projection() -> ProjectionDescriptor {
        ProjectionDescriptor {
            name: "p".into(),
            source: "a".into(),
            source_count: 100,
            target: "b".into(),
            target_count: 50,
            model: Arc::new(CouplingModel::default()),
            params: vec![],
            derived_param_values: vec![],
            var_inits: vec![],
            src_var_inits: vec![],
            tgt_var_inits: vec![],
            connectivity: Connectivity::Sparse {
                ind_ty: "unsigned int".into(),
            },
            weights: Weights::Individual,
            delay_steps: 0,
            back_delay_steps: 0,
            max_target_delay_slots: 1,
            max_row_length: 8,
            max_col_length: 16,
            connectivity_init: ConnectivityInit::default(),
            acc_fused_with: None,
        }
    }

    #[test]
    fn selection_follows_registration_order() {
        let mut registry = StrategyRegistry::new();
        registry.register(Box::new(SourceSpanStrategy));
        registry.register(Box::new(TargetSpanStrategy));

        let proj = sparse_projection();
        assert_eq!(registry.select(&proj).unwrap().name(), "source-span");

        let mut dense = proj.clone();
        dense.connectivity = Connectivity::Dense;
        assert_eq!(registry.select(&dense).unwrap().name(), "target-span");
    }

    #[test]
    fn empty_registry_is_a_fatal_config_error() {
        let registry = StrategyRegistry::new();
        let err = registry.select(&sparse_projection()).unwrap_err();
        assert_eq!(
            err,
            CodegenError::NoApplicableStrategy {
                projection: "p".into()
            }
        );
    }
}
