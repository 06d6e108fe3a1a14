//! Projections: directed connections between two populations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{ConnectivityInit, CouplingModel, VarInit};

/// How a projection's connectivity is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// Full source × target matrix.
    Dense,
    /// Ragged row-length + index arrays; `ind_ty` is the index element type.
    Sparse { ind_ty: String },
    /// One bit per possible connection.
    Bitmask,
}

/// How a projection's per-connection weights are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weights {
    /// One value per connection, resident in device memory.
    Individual,
    /// Recomputed from the variable initialisers inside the kernel.
    Procedural,
    /// A single shared value per projection.
    Global,
}

/// A directed connection group between a source and a target population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDescriptor {
    pub name: String,
    pub source: String,
    pub source_count: u32,
    pub target: String,
    pub target_count: u32,
    pub model: Arc<CouplingModel>,
    pub params: Vec<f64>,
    pub derived_param_values: Vec<f64>,
    /// Initialisers for the per-connection variables, one per `model.vars`.
    pub var_inits: Vec<VarInit>,
    pub src_var_inits: Vec<VarInit>,
    pub tgt_var_inits: Vec<VarInit>,
    pub connectivity: Connectivity,
    pub weights: Weights,
    /// Source-side axonal delay, in steps.
    pub delay_steps: u32,
    /// Target-to-source backpropagation delay, in steps.
    pub back_delay_steps: u32,
    /// Target-side delay slots for accumulated input; 1 means none.
    pub max_target_delay_slots: u32,
    /// Upper bound on connections per source row.
    pub max_row_length: u32,
    /// Upper bound on connections per target column.
    pub max_col_length: u32,
    pub connectivity_init: ConnectivityInit,
    /// When several projections accumulate into one shared buffer, the name
    /// of the projection owning that buffer.
    pub acc_fused_with: Option<String>,
}

impl ProjectionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the buffer this projection's transmitted quantity accumulates
    /// into. Fused projections share their owner's buffer.
    pub fn acc_target_name(&self) -> &str {
        self.acc_fused_with.as_deref().unwrap_or(&self.name)
    }

    pub fn target_delay_required(&self) -> bool {
        self.max_target_delay_slots > 1
    }

    /// Elements per source row in the connectivity matrix.
    pub fn row_stride(&self) -> u32 {
        match &self.connectivity {
            Connectivity::Sparse { .. } => self.max_row_length,
            _ => self.target_count,
        }
    }

    fn storage_eq(&self, other: &ProjectionDescriptor) -> bool {
        self.connectivity == other.connectivity && self.weights == other.weights
    }

    fn delay_structure_eq(&self, other: &ProjectionDescriptor) -> bool {
        self.delay_steps == other.delay_steps
            && self.back_delay_steps == other.back_delay_steps
            && self.max_target_delay_slots == other.max_target_delay_slots
    }

    /// Update-role equivalence for the projection kernels (forward, backward,
    /// dynamics): identical coupling-model content, storage kinds and delay
    /// structure. Parameter values excluded.
    pub fn can_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model == other.model && self.storage_eq(other) && self.delay_structure_eq(other)
    }

    /// Init-role equivalence: storage kinds, variable declarations and
    /// pairwise-mergeable initialisers.
    pub fn can_init_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.storage_eq(other)
            && self.delay_structure_eq(other)
            && self.model.vars == other.model.vars
            && var_inits_mergeable(&self.var_inits, &other.var_inits)
    }

    /// Equivalence for the connectivity-build kernel: same storage kind and
    /// same initialiser snippet content.
    pub fn can_connectivity_init_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.connectivity == other.connectivity
            && self.connectivity_init.can_be_merged(&other.connectivity_init)
    }

    // Child-level predicates, used when projections appear as children of a
    // population's merged group.

    /// Accumulation-side equivalence: same per-target application code and
    /// the same target-delay shape.
    pub fn can_acc_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model.acc_code == other.model.acc_code
            && self.max_target_delay_slots == other.max_target_delay_slots
    }

    pub fn can_acc_init_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.max_target_delay_slots == other.max_target_delay_slots
    }

    /// Source-side equivalence: code and declarations consumed per source
    /// unit inside the source population's kernel.
    pub fn can_src_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model.src_update_code == other.model.src_update_code
            && self.model.src_vars == other.model.src_vars
    }

    pub fn can_src_init_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model.src_vars == other.model.src_vars
            && var_inits_mergeable(&self.src_var_inits, &other.src_var_inits)
    }

    /// Target-side equivalence.
    pub fn can_tgt_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model.tgt_update_code == other.model.tgt_update_code
            && self.model.tgt_vars == other.model.tgt_vars
    }

    pub fn can_tgt_init_be_merged(&self, other: &ProjectionDescriptor) -> bool {
        self.model.tgt_vars == other.model.tgt_vars
            && var_inits_mergeable(&self.tgt_var_inits, &other.tgt_var_inits)
    }
}

fn var_inits_mergeable(ours: &[VarInit], theirs: &[VarInit]) -> bool {
    ours.len() == theirs.len()
        && ours
            .iter()
            .zip(theirs)
            .all(|(a, b)| a.can_be_merged(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(name: &str, params: Vec<f64>) -> ProjectionDescriptor {
        ProjectionDescriptor {
            name: name.into(),
            source: "src".into(),
            source_count: 10,
            target: "tgt".into(),
            target_count: 10,
            model: Arc::new(CouplingModel {
                name: "static".into(),
                param_names: vec!["g".into()],
                transmit_code: "$(add_acc, $(g));".into(),
                ..Default::default()
            }),
            params,
            derived_param_values: vec![],
            var_inits: vec![],
            src_var_inits: vec![],
            tgt_var_inits: vec![],
            connectivity: Connectivity::Sparse {
                ind_ty: "unsigned int".into(),
            },
            weights: Weights::Global,
            delay_steps: 0,
            back_delay_steps: 0,
            max_target_delay_slots: 1,
            max_row_length: 10,
            max_col_length: 10,
            connectivity_init: ConnectivityInit::default(),
            acc_fused_with: None,
        }
    }

    #[test]
    fn merge_is_structural_only() {
        let a = projection("a", vec![0.1]);
        let b = projection("b", vec![0.9]);
        assert!(a.can_be_merged(&b));

        let mut c = projection("c", vec![0.1]);
        c.connectivity = Connectivity::Dense;
        assert!(!a.can_be_merged(&c));
    }

    #[test]
    fn fused_projections_share_the_owners_acc_buffer() {
        let mut p = projection("follower", vec![0.1]);
        p.acc_fused_with = Some("owner".into());
        assert_eq!(p.acc_target_name(), "owner");
        assert_eq!(projection("solo", vec![0.1]).acc_target_name(), "solo");
    }
}
