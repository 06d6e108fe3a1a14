//! Projection merged groups: role-gated field recipes, connectivity-build
//! groups and the accumulation delay-queue advance group.

use tessera_model::{
    Catalog, Connectivity, PopulationDescriptor, ProjectionDescriptor, Weights,
};

use crate::backend::Backend;
use crate::error::{CodegenError, Result};
use crate::fields::{LayoutBuilder, StructLayout};
use crate::hetero::is_referenced;
use crate::merge::MergedGroup;

/// Compilation roles a projection merged group can be generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionRole {
    /// Source events drive per-connection transmission.
    Forward,
    /// Target events drive per-connection updates.
    Backward,
    /// Continuous per-connection dynamics.
    Dynamics,
    /// Seed per-connection state (dense / bitmask storage).
    Init,
    /// Seed per-connection state over sparse storage, and build remaps.
    SparseInit,
}

impl ProjectionRole {
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            ProjectionRole::Forward | ProjectionRole::Backward | ProjectionRole::Dynamics
        )
    }
}

/// A merged projection group for one role.
pub struct ProjectionGroup<'g, 'a> {
    group: &'g MergedGroup<'a, ProjectionDescriptor>,
    role: ProjectionRole,
    catalog: &'a Catalog,
}

impl<'g, 'a> ProjectionGroup<'g, 'a> {
    pub fn new(
        group: &'g MergedGroup<'a, ProjectionDescriptor>,
        role: ProjectionRole,
        catalog: &'a Catalog,
    ) -> Self {
        Self {
            group,
            role,
            catalog,
        }
    }

    pub fn group(&self) -> &'g MergedGroup<'a, ProjectionDescriptor> {
        self.group
    }

    pub fn role(&self) -> ProjectionRole {
        self.role
    }

    pub fn archetype(&self) -> &'a ProjectionDescriptor {
        self.group.archetype()
    }

    pub fn struct_name(&self) -> String {
        let role = match self.role {
            ProjectionRole::Forward => "Forward",
            ProjectionRole::Backward => "Backward",
            ProjectionRole::Dynamics => "Dynamics",
            ProjectionRole::Init => "Init",
            ProjectionRole::SparseInit => "SparseInit",
        };
        format!("MergedProjection{}Group{}", role, self.group.index())
    }

    /// The code consumed by this role, used for reference checks.
    pub fn consumed_code(&self) -> String {
        let m = &self.archetype().model;
        match self.role {
            ProjectionRole::Forward => m.forward_code(),
            ProjectionRole::Backward => m.learn_code.clone(),
            ProjectionRole::Dynamics => m.dynamics_code.clone(),
            ProjectionRole::Init | ProjectionRole::SparseInit => String::new(),
        }
    }

    fn pop(&self, name: &str) -> Result<&'a PopulationDescriptor> {
        self.catalog
            .population(name)
            .ok_or_else(|| CodegenError::UnknownEntity {
                kind: "population".into(),
                name: name.to_string(),
            })
    }

    pub fn src_pop(&self) -> Result<&'a PopulationDescriptor> {
        self.pop(&self.archetype().source)
    }

    pub fn tgt_pop(&self) -> Result<&'a PopulationDescriptor> {
        self.pop(&self.archetype().target)
    }

    /// Queue slot events are read from on the source side, honoring the
    /// projection's axonal delay.
    pub fn src_delay_slot(&self) -> Result<String> {
        let src = self.src_pop()?;
        let steps = self.archetype().delay_steps;
        if steps == 0 {
            Ok("(*group.srcQueuePtr)".to_string())
        } else {
            let slots = src.delay_slots;
            Ok(format!(
                "((*group.srcQueuePtr + {}) % {})",
                slots - steps,
                slots
            ))
        }
    }

    /// Queue slot events are read from on the target side.
    pub fn tgt_delay_slot(&self) -> Result<String> {
        let tgt = self.tgt_pop()?;
        let steps = self.archetype().back_delay_steps;
        if steps == 0 {
            Ok("(*group.tgtQueuePtr)".to_string())
        } else {
            let slots = tgt.delay_slots;
            Ok(format!(
                "((*group.tgtQueuePtr + {}) % {})",
                slots - steps,
                slots
            ))
        }
    }

    /// Offset into the target-side accumulation delay buffer. `offset` of
    /// `None` addresses the current slot.
    pub fn acc_delay_offset(&self, offset: Option<&str>) -> String {
        match offset {
            None => "(*group.delayAccPtr * group.numTgtUnits) + ".to_string(),
            Some(o) => format!(
                "(((*group.delayAccPtr + {}) % {}) * group.numTgtUnits) + ",
                o,
                self.archetype().max_target_delay_slots
            ),
        }
    }

    pub fn build_layout(
        &self,
        backend: &dyn Backend,
        scalar_ty: &str,
        time_ty: &str,
    ) -> Result<StructLayout> {
        let arch = self.archetype();
        let model = arch.model.clone();
        let buf = backend.device_buffer_prefix().to_string();
        let sym = backend.device_scalar_prefix().to_string();
        let code = self.consumed_code();
        let role = self.role;
        let is_update = role.is_update();

        let mut b = LayoutBuilder::new(self.group, self.struct_name(), scalar_ty);
        b.add_field("unsigned int", "rowStride", |p, _| {
            p.row_stride().to_string()
        })?;
        if matches!(role, ProjectionRole::Backward | ProjectionRole::SparseInit) {
            b.add_field("unsigned int", "colStride", |p, _| {
                p.max_col_length.to_string()
            })?;
        }
        b.add_field("unsigned int", "numSrcUnits", |p, _| {
            p.source_count.to_string()
        })?;
        b.add_field("unsigned int", "numTgtUnits", |p, _| {
            p.target_count.to_string()
        })?;

        // Accumulation output for roles that feed the target population.
        if matches!(role, ProjectionRole::Forward | ProjectionRole::Dynamics) {
            if arch.target_delay_required() {
                b.add_field(&format!("{}*", scalar_ty), "delayAcc", |p, _| {
                    format!("{}delayAcc{}", buf, p.acc_target_name())
                })?;
                b.add_field("volatile unsigned int*", "delayAccPtr", |p, _| {
                    format!("{}delayAccPtr{}", sym, p.acc_target_name())
                })?;
            } else {
                b.add_field(&format!("{}*", scalar_ty), "acc", |p, _| {
                    format!("{}acc{}", buf, p.acc_target_name())
                })?;
            }
        }

        if role == ProjectionRole::Forward {
            b.add_field("unsigned int*", "srcEvtCnt", |p, _| {
                format!("{}evtCnt{}", buf, p.source)
            })?;
            b.add_field("unsigned int*", "srcEvt", |p, _| {
                format!("{}evt{}", buf, p.source)
            })?;
        } else if role == ProjectionRole::Backward {
            b.add_field("unsigned int*", "tgtEvtCnt", |p, _| {
                format!("{}evtCnt{}", buf, p.target)
            })?;
            b.add_field("unsigned int*", "tgtEvt", |p, _| {
                format!("{}evt{}", buf, p.target)
            })?;
        }

        if is_update {
            let src_pops: Vec<&PopulationDescriptor> = self
                .group
                .members()
                .iter()
                .map(|m| self.pop(&m.source))
                .collect::<Result<_>>()?;
            let tgt_pops: Vec<&PopulationDescriptor> = self
                .group
                .members()
                .iter()
                .map(|m| self.pop(&m.target))
                .collect::<Result<_>>()?;

            if src_pops[0].delay_required() {
                b.add_field("volatile unsigned int*", "srcQueuePtr", |p, _| {
                    format!("{}queuePtr{}", sym, p.source)
                })?;
            }
            if tgt_pops[0].delay_required() {
                b.add_field("volatile unsigned int*", "tgtQueuePtr", |p, _| {
                    format!("{}queuePtr{}", sym, p.target)
                })?;
            }

            // End-population state, materialized only where the role's code
            // actually reaches across the projection.
            for v in &src_pops[0].model.vars {
                if is_referenced(&code, &format!("{}_src", v.name)) {
                    b.add_field(&format!("{}*", v.ty), &format!("{}Src", v.name), |p, _| {
                        format!("{}{}{}", buf, v.name, p.source)
                    })?;
                }
            }
            for v in &tgt_pops[0].model.vars {
                if is_referenced(&code, &format!("{}_tgt", v.name)) {
                    b.add_field(&format!("{}*", v.ty), &format!("{}Tgt", v.name), |p, _| {
                        format!("{}{}{}", buf, v.name, p.target)
                    })?;
                }
            }
            for (i, pname) in src_pops[0].model.param_names.iter().enumerate() {
                b.add_scalar_field(
                    &format!("{}Src", pname),
                    &format!("{}_src", pname),
                    &code,
                    |_, gi| src_pops[gi].params[i],
                )?;
            }
            for (i, pname) in tgt_pops[0].model.param_names.iter().enumerate() {
                b.add_scalar_field(
                    &format!("{}Tgt", pname),
                    &format!("{}_tgt", pname),
                    &code,
                    |_, gi| tgt_pops[gi].params[i],
                )?;
            }
            for e in &src_pops[0].model.extra_buffers {
                if is_referenced(&code, &format!("{}_src", e.name)) {
                    b.add_field(&e.ty, &format!("{}Src", e.name), |p, _| {
                        format!("{}{}{}", buf, e.name, p.source)
                    })?;
                }
            }
            for e in &tgt_pops[0].model.extra_buffers {
                if is_referenced(&code, &format!("{}_tgt", e.name)) {
                    b.add_field(&e.ty, &format!("{}Tgt", e.name), |p, _| {
                        format!("{}{}{}", buf, e.name, p.target)
                    })?;
                }
            }

            if model.src_event_times_required {
                b.add_field(&format!("{}*", time_ty), "srcEvtTimes", |p, _| {
                    format!("{}evtTimes{}", buf, p.source)
                })?;
            }
            if model.tgt_event_times_required {
                b.add_field(&format!("{}*", time_ty), "tgtEvtTimes", |p, _| {
                    format!("{}evtTimes{}", buf, p.target)
                })?;
            }
        }

        // Connectivity storage.
        match &arch.connectivity {
            Connectivity::Sparse { ind_ty } => {
                b.add_pointer_field("unsigned int", "rowLength", &format!("{}rowLength", buf))?;
                b.add_pointer_field(ind_ty, "ind", &format!("{}ind", buf))?;

                if backend.backward_remap_required()
                    && !model.learn_code.is_empty()
                    && matches!(role, ProjectionRole::Backward | ProjectionRole::SparseInit)
                {
                    b.add_pointer_field("unsigned int", "colLength", &format!("{}colLength", buf))?;
                    b.add_pointer_field("unsigned int", "remap", &format!("{}remap", buf))?;
                }
                if backend.dynamics_remap_required()
                    && !model.dynamics_code.is_empty()
                    && matches!(role, ProjectionRole::Dynamics | ProjectionRole::SparseInit)
                {
                    b.add_pointer_field("unsigned int", "synRemap", &format!("{}synRemap", buf))?;
                }
            }
            Connectivity::Bitmask => {
                b.add_pointer_field("uint32_t", "mask", &format!("{}mask", buf))?;
            }
            Connectivity::Dense => {}
        }

        // Per-connection state.
        if arch.weights == Weights::Individual {
            b.add_vars(&model.vars, &buf)?;
        }
        if arch.weights == Weights::Procedural
            || (!is_update && arch.weights == Weights::Individual)
        {
            b.add_var_init_params(&model.vars, |p| &p.var_inits)?;
        }
        if is_update && arch.weights == Weights::Global {
            // Front end guarantees constant initialisers for global weights.
            for (i, v) in model.vars.iter().enumerate() {
                b.add_scalar_field(&v.name, &v.name, &code, |m, _| {
                    m.var_inits[i].constant_value.unwrap_or(0.0)
                })?;
            }
        }

        if is_update {
            b.add_external_buffers(&model.extra_buffers, &buf)?;
        }

        Ok(b.finish())
    }
}

/// Merged group building connectivity storage from initialiser snippets,
/// dispatched inside the init kernel.
pub struct ConnectivityInitGroup<'g, 'a> {
    group: &'g MergedGroup<'a, ProjectionDescriptor>,
}

impl<'g, 'a> ConnectivityInitGroup<'g, 'a> {
    pub fn new(group: &'g MergedGroup<'a, ProjectionDescriptor>) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &'g MergedGroup<'a, ProjectionDescriptor> {
        self.group
    }

    pub fn archetype(&self) -> &'a ProjectionDescriptor {
        self.group.archetype()
    }

    pub fn struct_name(&self) -> String {
        format!("MergedConnectivityInitGroup{}", self.group.index())
    }

    pub fn build_layout(&self, backend: &dyn Backend, scalar_ty: &str) -> Result<StructLayout> {
        let arch = self.archetype();
        let buf = backend.device_buffer_prefix().to_string();
        let snippet = arch.connectivity_init.snippet.clone();

        let mut b = LayoutBuilder::new(self.group, self.struct_name(), scalar_ty);
        b.add_field("unsigned int", "rowStride", |p, _| {
            p.row_stride().to_string()
        })?;
        b.add_field("unsigned int", "numSrcUnits", |p, _| {
            p.source_count.to_string()
        })?;
        b.add_field("unsigned int", "numTgtUnits", |p, _| {
            p.target_count.to_string()
        })?;

        match &arch.connectivity {
            Connectivity::Sparse { ind_ty } => {
                b.add_pointer_field("unsigned int", "rowLength", &format!("{}rowLength", buf))?;
                b.add_pointer_field(ind_ty, "ind", &format!("{}ind", buf))?;
            }
            Connectivity::Bitmask => {
                b.add_pointer_field("uint32_t", "mask", &format!("{}mask", buf))?;
            }
            Connectivity::Dense => {}
        }

        b.add_heterogeneous_params(&snippet.param_names, &snippet.code, |p| {
            &p.connectivity_init.params
        })?;
        let derived: Vec<_> = snippet.derived_params.clone();
        b.add_heterogeneous_derived_params(&derived, &snippet.code, |p| {
            &p.connectivity_init.derived_param_values
        })?;
        b.add_external_buffers(&snippet.extra_buffers, &buf)?;

        Ok(b.finish())
    }
}

/// Merged group advancing target-side accumulation delay queues, one
/// member per distinct delayed accumulation buffer.
pub struct InflowDelayAdvanceGroup<'g, 'a> {
    group: &'g MergedGroup<'a, ProjectionDescriptor>,
}

impl<'g, 'a> InflowDelayAdvanceGroup<'g, 'a> {
    pub fn new(group: &'g MergedGroup<'a, ProjectionDescriptor>) -> Self {
        Self { group }
    }

    /// All delayed accumulation queues advance the same way; every owner
    /// merges into one group.
    pub fn can_be_merged(_a: &ProjectionDescriptor, _b: &ProjectionDescriptor) -> bool {
        true
    }

    pub fn group(&self) -> &'g MergedGroup<'a, ProjectionDescriptor> {
        self.group
    }

    pub fn struct_name(&self) -> String {
        format!("MergedAccQueueAdvanceGroup{}", self.group.index())
    }

    pub fn build_layout(&self, backend: &dyn Backend, scalar_ty: &str) -> Result<StructLayout> {
        let sym = backend.device_scalar_prefix().to_string();
        let mut b = LayoutBuilder::new(self.group, self.struct_name(), scalar_ty);
        b.add_field("unsigned int", "numDelaySlots", |p, _| {
            p.max_target_delay_slots.to_string()
        })?;
        b.add_field("volatile unsigned int*", "delayAccPtr", |p, _| {
            format!("{}delayAccPtr{}", sym, p.acc_target_name())
        })?;
        Ok(b.finish())
    }

    pub fn emit_advance(&self, w: &mut crate::emit::CodeWriter) {
        w.line("*group.delayAccPtr = (*group.delayAccPtr + 1) % group.numDelaySlots;");
    }
}
