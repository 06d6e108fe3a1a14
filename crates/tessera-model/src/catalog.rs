//! The immutable entity catalog consumed by one compilation pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::population::PopulationDescriptor;
use crate::projection::ProjectionDescriptor;

/// All entities of one model description, held in canonical name-sorted
/// order. Built once by the front end; read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    populations: BTreeMap<String, PopulationDescriptor>,
    projections: BTreeMap<String, ProjectionDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_population(&mut self, pop: PopulationDescriptor) {
        self.populations.insert(pop.name.clone(), pop);
    }

    pub fn add_projection(&mut self, proj: ProjectionDescriptor) {
        self.projections.insert(proj.name.clone(), proj);
    }

    pub fn population(&self, name: &str) -> Option<&PopulationDescriptor> {
        self.populations.get(name)
    }

    pub fn projection(&self, name: &str) -> Option<&ProjectionDescriptor> {
        self.projections.get(name)
    }

    /// Populations in canonical name order.
    pub fn populations(&self) -> impl Iterator<Item = &PopulationDescriptor> {
        self.populations.values()
    }

    /// Projections in canonical name order.
    pub fn projections(&self) -> impl Iterator<Item = &ProjectionDescriptor> {
        self.projections.values()
    }

    /// Incident projections contributing accumulated input to `pop`, one per
    /// distinct accumulation buffer (fused projections collapse onto their
    /// owner), in canonical order.
    pub fn inflows(&self, pop: &PopulationDescriptor) -> Vec<&ProjectionDescriptor> {
        let mut seen: Vec<&str> = Vec::new();
        self.projections
            .values()
            .filter(|p| p.target == pop.name)
            .filter(|p| {
                let acc = p.acc_target_name();
                if seen.contains(&acc) {
                    false
                } else {
                    seen.push(acc);
                    true
                }
            })
            .collect()
    }

    /// Incoming projections whose target-side update code runs inside `pop`'s
    /// kernel body.
    pub fn incoming_with_tgt_code(&self, pop: &PopulationDescriptor) -> Vec<&ProjectionDescriptor> {
        self.projections
            .values()
            .filter(|p| p.target == pop.name && !p.model.tgt_update_code.is_empty())
            .collect()
    }

    /// Incoming projections carrying target-side state that `pop`'s init
    /// kernel must seed.
    pub fn incoming_with_tgt_vars(&self, pop: &PopulationDescriptor) -> Vec<&ProjectionDescriptor> {
        self.projections
            .values()
            .filter(|p| p.target == pop.name && !p.model.tgt_vars.is_empty())
            .collect()
    }

    /// Outgoing projections whose source-side update code runs inside `pop`'s
    /// kernel body.
    pub fn outgoing_with_src_code(&self, pop: &PopulationDescriptor) -> Vec<&ProjectionDescriptor> {
        self.projections
            .values()
            .filter(|p| p.source == pop.name && !p.model.src_update_code.is_empty())
            .collect()
    }

    /// Outgoing projections carrying source-side state.
    pub fn outgoing_with_src_vars(&self, pop: &PopulationDescriptor) -> Vec<&ProjectionDescriptor> {
        self.projections
            .values()
            .filter(|p| p.source == pop.name && !p.model.src_vars.is_empty())
            .collect()
    }

    /// Projections that own a target-side delay buffer, one per distinct
    /// accumulation target, in canonical order.
    pub fn delayed_acc_owners(&self) -> Vec<&ProjectionDescriptor> {
        let mut seen: Vec<&str> = Vec::new();
        self.projections
            .values()
            .filter(|p| p.target_delay_required())
            .filter(|p| {
                let acc = p.acc_target_name();
                if seen.contains(&acc) {
                    false
                } else {
                    seen.push(acc);
                    true
                }
            })
            .collect()
    }
}
