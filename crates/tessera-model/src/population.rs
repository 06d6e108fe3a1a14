//! Populations of computational units.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aux_source::AuxSourceDescriptor;
use crate::catalog::Catalog;
use crate::compatible_unordered;
use crate::model::{UnitModel, VarInit};

/// A population: `count` units sharing one [`UnitModel`], with per-population
/// parameter values, initialisers and structural flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationDescriptor {
    pub name: String,
    pub count: u32,
    pub model: Arc<UnitModel>,
    pub params: Vec<f64>,
    pub derived_param_values: Vec<f64>,
    /// One initialiser per `model.vars` entry.
    pub var_inits: Vec<VarInit>,
    /// Delay-buffer depth for event queues and delayed variables; 1 = none.
    pub delay_slots: u32,
    /// Whether the population carries an event channel.
    pub events_required: bool,
    /// Whether per-unit event timestamps are recorded.
    pub event_times_required: bool,
    /// Whether units draw from a per-unit RNG stream during update.
    pub rng_required: bool,
    /// Per-var flag: true if the variable is read at a delay and therefore
    /// buffered across `delay_slots` slots.
    pub var_delayed: Vec<bool>,
    /// Auxiliary sources injecting into this population.
    pub aux_sources: Vec<AuxSourceDescriptor>,
}

impl PopulationDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay_required(&self) -> bool {
        self.delay_slots > 1
    }

    pub fn is_var_delayed(&self, index: usize) -> bool {
        self.var_delayed.get(index).copied().unwrap_or(false)
    }

    fn flags_eq(&self, other: &PopulationDescriptor) -> bool {
        self.delay_slots == other.delay_slots
            && self.events_required == other.events_required
            && self.event_times_required == other.event_times_required
            && self.rng_required == other.rng_required
            && self.var_delayed == other.var_delayed
    }

    fn aux_sources_ref(&self) -> Vec<&AuxSourceDescriptor> {
        self.aux_sources.iter().collect()
    }

    /// Update-role equivalence: identical model content and structural flags,
    /// and children matchable (unordered) under the child update predicates.
    /// Parameter values excluded throughout.
    pub fn can_be_merged(&self, other: &PopulationDescriptor, catalog: &Catalog) -> bool {
        self.model == other.model
            && self.flags_eq(other)
            && compatible_unordered(
                &self.aux_sources_ref(),
                &other.aux_sources_ref(),
                |a, b| a.can_be_merged(b),
            )
            && compatible_unordered(&catalog.inflows(self), &catalog.inflows(other), |a, b| {
                a.can_acc_be_merged(b)
            })
            && compatible_unordered(
                &catalog.incoming_with_tgt_code(self),
                &catalog.incoming_with_tgt_code(other),
                |a, b| a.can_tgt_be_merged(b),
            )
            && compatible_unordered(
                &catalog.outgoing_with_src_code(self),
                &catalog.outgoing_with_src_code(other),
                |a, b| a.can_src_be_merged(b),
            )
    }

    /// Init-role equivalence: identical flags and variable declarations,
    /// pairwise-mergeable initialisers, children matchable under the child
    /// init predicates.
    pub fn can_init_be_merged(&self, other: &PopulationDescriptor, catalog: &Catalog) -> bool {
        self.flags_eq(other)
            && self.model.vars == other.model.vars
            && self.var_inits.len() == other.var_inits.len()
            && self
                .var_inits
                .iter()
                .zip(&other.var_inits)
                .all(|(a, b)| a.can_be_merged(b))
            && compatible_unordered(
                &self.aux_sources_ref(),
                &other.aux_sources_ref(),
                |a, b| a.can_init_be_merged(b),
            )
            && compatible_unordered(&catalog.inflows(self), &catalog.inflows(other), |a, b| {
                a.can_acc_init_be_merged(b)
            })
            && compatible_unordered(
                &catalog.incoming_with_tgt_vars(self),
                &catalog.incoming_with_tgt_vars(other),
                |a, b| a.can_tgt_init_be_merged(b),
            )
            && compatible_unordered(
                &catalog.outgoing_with_src_vars(self),
                &catalog.outgoing_with_src_vars(other),
                |a, b| a.can_src_init_be_merged(b),
            )
    }
}
