//! Population merged groups: update/init field recipes and the delay-queue
//! advance group.

use tessera_model::{AuxSourceDescriptor, Catalog, PopulationDescriptor, ProjectionDescriptor};

use crate::backend::Backend;
use crate::emit::CodeWriter;
use crate::error::Result;
use crate::fields::{LayoutBuilder, StructLayout};
use crate::merge::MergedGroup;
use crate::order::order_children;

/// A merged population group for the update or init role, with every
/// member's children aligned to the archetype's slots.
pub struct PopulationGroup<'g, 'a> {
    group: &'g MergedGroup<'a, PopulationDescriptor>,
    init: bool,
    sorted_inflows: Vec<Vec<&'a ProjectionDescriptor>>,
    sorted_aux: Vec<Vec<&'a AuxSourceDescriptor>>,
    sorted_in_tgt: Vec<Vec<&'a ProjectionDescriptor>>,
    sorted_out_src: Vec<Vec<&'a ProjectionDescriptor>>,
}

impl<'g, 'a> PopulationGroup<'g, 'a> {
    pub fn new(
        group: &'g MergedGroup<'a, PopulationDescriptor>,
        catalog: &'a Catalog,
        init: bool,
    ) -> Result<Self> {
        let sorted_inflows = order_children(
            group,
            "inflow",
            |p| catalog.inflows(p),
            |a, b| {
                if init {
                    a.can_acc_init_be_merged(b)
                } else {
                    a.can_acc_be_merged(b)
                }
            },
        )?;
        let sorted_aux = order_children(
            group,
            "aux-source",
            |p| p.aux_sources.iter().collect(),
            |a: &AuxSourceDescriptor, b| {
                if init {
                    a.can_init_be_merged(b)
                } else {
                    a.can_be_merged(b)
                }
            },
        )?;
        let sorted_in_tgt = order_children(
            group,
            "incoming-target-coupling",
            |p| {
                if init {
                    catalog.incoming_with_tgt_vars(p)
                } else {
                    catalog.incoming_with_tgt_code(p)
                }
            },
            |a, b| {
                if init {
                    a.can_tgt_init_be_merged(b)
                } else {
                    a.can_tgt_be_merged(b)
                }
            },
        )?;
        let sorted_out_src = order_children(
            group,
            "outgoing-source-coupling",
            |p| {
                if init {
                    catalog.outgoing_with_src_vars(p)
                } else {
                    catalog.outgoing_with_src_code(p)
                }
            },
            |a, b| {
                if init {
                    a.can_src_init_be_merged(b)
                } else {
                    a.can_src_be_merged(b)
                }
            },
        )?;
        Ok(Self {
            group,
            init,
            sorted_inflows,
            sorted_aux,
            sorted_in_tgt,
            sorted_out_src,
        })
    }

    pub fn group(&self) -> &'g MergedGroup<'a, PopulationDescriptor> {
        self.group
    }

    pub fn archetype(&self) -> &'a PopulationDescriptor {
        self.group.archetype()
    }

    pub fn struct_name(&self) -> String {
        if self.init {
            format!("MergedPopulationInitGroup{}", self.group.index())
        } else {
            format!("MergedPopulationUpdateGroup{}", self.group.index())
        }
    }

    /// The archetype's children, slot-aligned tables per member.
    pub fn sorted_inflows(&self) -> &[Vec<&'a ProjectionDescriptor>] {
        &self.sorted_inflows
    }

    pub fn sorted_aux(&self) -> &[Vec<&'a AuxSourceDescriptor>] {
        &self.sorted_aux
    }

    pub fn sorted_in_tgt(&self) -> &[Vec<&'a ProjectionDescriptor>] {
        &self.sorted_in_tgt
    }

    pub fn sorted_out_src(&self) -> &[Vec<&'a ProjectionDescriptor>] {
        &self.sorted_out_src
    }

    /// Code consumed by the update role, concatenated for reference checks.
    pub fn consumed_code(&self) -> String {
        let m = &self.archetype().model;
        format!("{}{}", m.update_code, m.event_condition_code)
    }

    /// Read offset into delayed per-unit buffers at the current queue slot.
    pub fn current_queue_offset(&self) -> String {
        "(*group.queuePtr * group.numUnits)".to_string()
    }

    /// Read offset at the previous queue slot.
    pub fn prev_queue_offset(&self) -> String {
        let slots = self.archetype().delay_slots;
        format!(
            "(((*group.queuePtr + {}) % {}) * group.numUnits)",
            slots - 1,
            slots
        )
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

        let mut b = LayoutBuilder::new(self.group, self.struct_name(), scalar_ty);
        b.add_field("unsigned int", "numUnits", |p, _| p.count.to_string())?;

        if arch.events_required {
            b.add_pointer_field("unsigned int", "evtCnt", &format!("{}evtCnt", buf))?;
            b.add_pointer_field("unsigned int", "evt", &format!("{}evt", buf))?;
        }
        if arch.delay_required() {
            b.add_field("volatile unsigned int*", "queuePtr", |p, _| {
                format!("{}queuePtr{}", sym, p.name)
            })?;
        }
        if arch.event_times_required {
            b.add_pointer_field(time_ty, "evtTimes", &format!("{}evtTimes", buf))?;
        }
        if backend.population_rng_required() && arch.rng_required {
            b.add_pointer_field(backend.rng_state_ty(), "rng", &format!("{}rng", buf))?;
        }

        b.add_vars(&model.vars, &buf)?;

        if self.init {
            b.add_var_init_params(&model.vars, |p| &p.var_inits)?;
        } else {
            b.add_external_buffers(&model.extra_buffers, &buf)?;
            b.add_heterogeneous_params(&model.param_names, &code, |p| &p.params)?;
            b.add_heterogeneous_derived_params(&model.derived_params, &code, |p| {
                &p.derived_param_values
            })?;
        }

        // Incident projections: one accumulation buffer per archetype slot,
        // names resolved through each member's slot-aligned child.
        let archetype_inflows = self.sorted_inflows[0].clone();
        for (i, proj) in archetype_inflows.iter().enumerate() {
            let sorted = &self.sorted_inflows;
            b.add_field(
                &format!("{}*", scalar_ty),
                &format!("acc{}", i),
                |_, gi| format!("{}acc{}", buf, sorted[gi][i].acc_target_name()),
            )?;
            if proj.target_delay_required() {
                b.add_field(
                    &format!("{}*", scalar_ty),
                    &format!("delayAcc{}", i),
                    |_, gi| format!("{}delayAcc{}", buf, sorted[gi][i].acc_target_name()),
                )?;
                b.add_field(
                    "volatile unsigned int*",
                    &format!("delayAccPtr{}", i),
                    |_, gi| format!("{}delayAccPtr{}", sym, sorted[gi][i].acc_target_name()),
                )?;
            }
        }

        // Auxiliary sources, suffix-indexed per archetype slot.
        let archetype_aux = self.sorted_aux[0].clone();
        for (i, aux) in archetype_aux.iter().enumerate() {
            let sorted = &self.sorted_aux;
            let inject = aux.model.inject_code.clone();
            for (pi, pname) in aux.model.param_names.iter().enumerate() {
                b.add_scalar_field(
                    &format!("{}AS{}", pname, i),
                    pname,
                    &inject,
                    |_, gi| sorted[gi][i].params[pi],
                )?;
            }
            for (pi, dp) in aux.model.derived_params.iter().enumerate() {
                b.add_scalar_field(
                    &format!("{}AS{}", dp.name, i),
                    &dp.name,
                    &inject,
                    |_, gi| sorted[gi][i].derived_param_values[pi],
                )?;
            }
            for v in &aux.model.vars {
                b.add_field(
                    &format!("{}*", v.ty),
                    &format!("{}AS{}", v.name, i),
                    |_, gi| format!("{}{}{}", buf, v.name, sorted[gi][i].name),
                )?;
            }
            if self.init {
                for (vi, v) in aux.model.vars.iter().enumerate() {
                    let snippet = aux.var_inits[vi].snippet.clone();
                    for (pi, pname) in snippet.param_names.iter().enumerate() {
                        b.add_scalar_field(
                            &format!("{}{}AS{}", pname, v.name, i),
                            pname,
                            &snippet.code,
                            |_, gi| sorted[gi][i].var_inits[vi].params[pi],
                        )?;
                    }
                }
            } else {
                for e in &aux.model.extra_buffers {
                    b.add_field(&e.ty, &format!("{}AS{}", e.name, i), |_, gi| {
                        format!("{}{}{}", buf, e.name, sorted[gi][i].name)
                    })?;
                }
            }
        }

        // Target-side coupling state of incoming projections.
        let archetype_in_tgt = self.sorted_in_tgt[0].clone();
        for (i, proj) in archetype_in_tgt.iter().enumerate() {
            let sorted = &self.sorted_in_tgt;
            for v in &proj.model.tgt_vars {
                b.add_field(
                    &format!("{}*", v.ty),
                    &format!("{}Tgt{}", v.name, i),
                    |_, gi| format!("{}{}{}", buf, v.name, sorted[gi][i].name),
                )?;
            }
            if self.init {
                for (vi, v) in proj.model.tgt_vars.iter().enumerate() {
                    let snippet = proj.tgt_var_inits[vi].snippet.clone();
                    for (pi, pname) in snippet.param_names.iter().enumerate() {
                        b.add_scalar_field(
                            &format!("{}{}Tgt{}", pname, v.name, i),
                            pname,
                            &snippet.code,
                            |_, gi| sorted[gi][i].tgt_var_inits[vi].params[pi],
                        )?;
                    }
                }
            } else {
                let tgt_code = proj.model.tgt_update_code.clone();
                for (pi, pname) in proj.model.param_names.iter().enumerate() {
                    b.add_scalar_field(
                        &format!("{}InTgt{}", pname, i),
                        pname,
                        &tgt_code,
                        |_, gi| sorted[gi][i].params[pi],
                    )?;
                }
                for (pi, dp) in proj.model.derived_params.iter().enumerate() {
                    b.add_scalar_field(
                        &format!("{}InTgt{}", dp.name, i),
                        &dp.name,
                        &tgt_code,
                        |_, gi| sorted[gi][i].derived_param_values[pi],
                    )?;
                }
            }
        }

        // Source-side coupling state of outgoing projections.
        let archetype_out_src = self.sorted_out_src[0].clone();
        for (i, proj) in archetype_out_src.iter().enumerate() {
            let sorted = &self.sorted_out_src;
            for v in &proj.model.src_vars {
                b.add_field(
                    &format!("{}*", v.ty),
                    &format!("{}Src{}", v.name, i),
                    |_, gi| format!("{}{}{}", buf, v.name, sorted[gi][i].name),
                )?;
            }
            if self.init {
                for (vi, v) in proj.model.src_vars.iter().enumerate() {
                    let snippet = proj.src_var_inits[vi].snippet.clone();
                    for (pi, pname) in snippet.param_names.iter().enumerate() {
                        b.add_scalar_field(
                            &format!("{}{}Src{}", pname, v.name, i),
                            pname,
                            &snippet.code,
                            |_, gi| sorted[gi][i].src_var_inits[vi].params[pi],
                        )?;
                    }
                }
            } else {
                let src_code = proj.model.src_update_code.clone();
                for (pi, pname) in proj.model.param_names.iter().enumerate() {
                    b.add_scalar_field(
                        &format!("{}OutSrc{}", pname, i),
                        pname,
                        &src_code,
                        |_, gi| sorted[gi][i].params[pi],
                    )?;
                }
                for (pi, dp) in proj.model.derived_params.iter().enumerate() {
                    b.add_scalar_field(
                        &format!("{}OutSrc{}", dp.name, i),
                        &dp.name,
                        &src_code,
                        |_, gi| sorted[gi][i].derived_param_values[pi],
                    )?;
                }
            }
        }

        Ok(b.finish())
    }
}

/// Merged group advancing population delay queues and resetting event
/// counts at the start of each step.
pub struct DelayAdvanceGroup<'g, 'a> {
    group: &'g MergedGroup<'a, PopulationDescriptor>,
}

impl<'g, 'a> DelayAdvanceGroup<'g, 'a> {
    pub fn new(group: &'g MergedGroup<'a, PopulationDescriptor>) -> Self {
        Self { group }
    }

    /// Queue-advance merge predicate: only the flags shaping the emitted
    /// statements matter; slot counts are per-instance data.
    pub fn can_be_merged(a: &PopulationDescriptor, b: &PopulationDescriptor) -> bool {
        a.delay_required() == b.delay_required() && a.events_required == b.events_required
    }

    /// Whether the population contributes any statement to this kernel.
    pub fn eligible(pop: &PopulationDescriptor) -> bool {
        pop.delay_required() || pop.events_required
    }

    pub fn group(&self) -> &'g MergedGroup<'a, PopulationDescriptor> {
        self.group
    }

    pub fn struct_name(&self) -> String {
        format!("MergedDelayAdvanceGroup{}", self.group.index())
    }

    pub fn build_layout(&self, backend: &dyn Backend, scalar_ty: &str) -> Result<StructLayout> {
        let arch = self.group.archetype();
        let buf = backend.device_buffer_prefix().to_string();
        let sym = backend.device_scalar_prefix().to_string();

        let mut b = LayoutBuilder::new(self.group, self.struct_name(), scalar_ty);
        if arch.delay_required() {
            b.add_field("unsigned int", "numDelaySlots", |p, _| {
                p.delay_slots.to_string()
            })?;
            b.add_field("volatile unsigned int*", "queuePtr", |p, _| {
                format!("{}queuePtr{}", sym, p.name)
            })?;
        }
        if arch.events_required {
            b.add_pointer_field("unsigned int", "evtCnt", &format!("{}evtCnt", buf))?;
        }
        Ok(b.finish())
    }

    /// Per-member queue advance and event-count reset statements.
    pub fn emit_advance(&self, w: &mut CodeWriter) {
        let arch = self.group.archetype();
        if arch.delay_required() {
            w.line("*group.queuePtr = (*group.queuePtr + 1) % group.numDelaySlots;");
            if arch.events_required {
                w.line("group.evtCnt[*group.queuePtr] = 0;");
            }
        } else if arch.events_required {
            w.line("group.evtCnt[0] = 0;");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_groups;
    use std::sync::Arc;
    use tessera_model::{UnitModel, VarDecl, VarInit};

    fn pop(name: &str, count: u32, tau: f64, code: &str) -> PopulationDescriptor {
        PopulationDescriptor {
            name: name.into(),
            count,
            model: Arc::new(UnitModel {
                name: "unit".into(),
                param_names: vec!["tau".into()],
                vars: vec![VarDecl::new("V", "scalar")],
                update_code: code.into(),
                ..Default::default()
            }),
            params: vec![tau],
            derived_param_values: vec![],
            var_inits: vec![VarInit::constant(0.0)],
            delay_slots: 1,
            events_required: false,
            event_times_required: false,
            rng_required: false,
            var_delayed: vec![false],
            aux_sources: vec![],
        }
    }

    struct TestBackend;

    impl Backend for TestBackend {
        fn execution_width(&self, _phase: crate::backend::KernelPhase) -> usize {
            32
        }
        fn device_buffer_prefix(&self) -> &str {
            "d_"
        }
        fn device_scalar_prefix(&self) -> &str {
            "d_"
        }
        fn atomic_add_fn(&self, _ty: &str) -> String {
            "atomic_add".into()
        }
        fn lane_id_expr(&self) -> String {
            "get_global_id(0)".into()
        }
        fn kernel_qualifier(&self) -> &str {
            "__kernel"
        }
        fn global_qualifier(&self) -> &str {
            "__global"
        }
        fn gen_push(&self, _w: &mut CodeWriter, _n: &str, _t: &str, _c: usize) {}
        fn gen_pull(&self, _w: &mut CodeWriter, _n: &str, _t: &str, _c: usize) {}
    }

    #[test]
    fn update_layout_carries_count_vars_and_referenced_params() {
        let catalog = Catalog::new();
        let pops = [
            pop("a", 10, 20.0, "$(V) += $(dt) / $(tau);"),
            pop("b", 20, 10.0, "$(V) += $(dt) / $(tau);"),
        ];
        let groups = merge_groups("population", pops.iter(), |x, y| {
            x.can_be_merged(y, &catalog)
        });
        assert_eq!(groups.len(), 1);

        let pg = PopulationGroup::new(&groups[0], &catalog, false).unwrap();
        let layout = pg.build_layout(&TestBackend, "scalar", "float").unwrap();

        let names: Vec<_> = layout.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["numUnits", "V", "tau"]);
        // tau differs across members: per-instance storage.
        assert_eq!(layout.instances[0].values, ["10", "d_Va", "20.0"]);
        assert_eq!(layout.instances[1].values, ["20", "d_Vb", "10.0"]);
    }

    #[test]
    fn delay_advance_resets_at_the_new_slot() {
        let mut p = pop("a", 10, 20.0, "");
        p.delay_slots = 4;
        p.events_required = true;
        let pops = [p];
        let groups = merge_groups("delay-advance", pops.iter(), |a, b| {
            DelayAdvanceGroup::can_be_merged(a, b)
        });
        let g = DelayAdvanceGroup::new(&groups[0]);
        let mut w = CodeWriter::new();
        g.emit_advance(&mut w);
        let code = w.into_string();
        assert!(code.contains("*group.queuePtr = (*group.queuePtr + 1) % group.numDelaySlots;"));
        assert!(code.contains("group.evtCnt[*group.queuePtr] = 0;"));
    }
}
