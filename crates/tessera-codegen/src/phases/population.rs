//! Population kernel drivers: update, init and delay-queue advance.

use tessera_model::PopulationDescriptor;

use crate::backend::KernelPhase;
use crate::dispatch::DispatchPlanner;
use crate::emit::{check_unreplaced, CodeWriter, Substitutions};
use crate::error::Result;
use crate::groups::{DelayAdvanceGroup, PopulationGroup};
use crate::hetero::is_referenced;
use crate::merge::merge_groups;

use super::{Backend, Engine, GeneratedKernel, GroupPlan};

impl<'a, B: Backend> Engine<'a, B> {
    pub(super) fn generate_population_update(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::PopulationUpdate;
        let groups = merge_groups("population-update", self.catalog.populations(), |a, b| {
            a.can_be_merged(b, self.catalog)
        });
        let pgs: Vec<PopulationGroup> = groups
            .iter()
            .map(|g| PopulationGroup::new(g, self.catalog, false))
            .collect::<Result<_>>()?;

        let mut plans = Vec::with_capacity(pgs.len());
        for pg in &pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            plans.push(self.group_plan(phase, pg.group(), layout, |p| p.count as usize, true));
        }

        let registry = self.kernel_registry(&plans);
        let subs = self.kernel_subs();
        let mut body = CodeWriter::new();
        let mut planner = DispatchPlanner::new(self.backend, phase);
        planner.plan(
            &mut body,
            &subs,
            &groups,
            &registry,
            |g| plans[g.index()].total,
            |_| true,
            |w, g, s| self.population_update_body(w, &pgs[g.index()], &plans[g.index()], s),
        )?;

        let total = planner.total_lanes();
        let refs = planner.into_buffer_refs();
        Ok(self.assemble(phase, plans, body.into_string(), refs, total))
    }

    fn population_update_body(
        &self,
        w: &mut CodeWriter,
        pg: &PopulationGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let layout = &plan.layout;
        let arch = pg.archetype();
        let model = arch.model.clone();
        let sc = self.config.scalar_ty.clone();
        let label = format!("{} body", layout.struct_name);

        self.emit_member_resolution(w, subs, plan, pg.group().len());
        w.block("if (uid < group.numUnits)", |w| -> Result<()> {
            let inflow_slots = pg.sorted_inflows()[0].len();
            let aux_slots = pg.sorted_aux()[0].len();
            let needs_inflow = inflow_slots > 0
                || aux_slots > 0
                || is_referenced(&model.update_code, "inflow");
            if needs_inflow {
                w.line(&format!("{} inflow = 0.0;", sc));
            }

            for (i, proj) in pg.sorted_inflows()[0].iter().enumerate() {
                w.line(&format!("// accumulated input via '{}'", proj.name));
                let delayed = proj.target_delay_required();
                let slot_expr = format!("(*group.delayAccPtr{} * group.numUnits) + uid", i);
                if delayed {
                    w.line(&format!(
                        "{} acc{} = group.delayAcc{}[{}];",
                        sc, i, i, slot_expr
                    ));
                } else {
                    w.line(&format!("{} acc{} = group.acc{}[uid];", sc, i, i));
                }
                let mut s = Substitutions::with_parent(subs);
                s.add_var("id", "uid");
                s.add_var("inflow", "inflow");
                s.add_var("acc", format!("acc{}", i));
                let text = s.apply(&proj.model.acc_code);
                check_unreplaced(&text, &label)?;
                w.lines(&text);
                if delayed {
                    w.line(&format!("group.delayAcc{}[{}] = acc{};", i, slot_expr, i));
                } else {
                    w.line(&format!("group.acc{}[uid] = acc{};", i, i));
                }
            }

            for (i, aux) in pg.sorted_aux()[0].iter().enumerate() {
                w.line(&format!("// auxiliary source '{}'", aux.name));
                let mut s = Substitutions::with_parent(subs);
                s.add_var("id", "uid");
                s.add_var("inflow", "inflow");
                for p in &aux.model.param_names {
                    if let Some(a) = layout.accessor(&format!("{}AS{}", p, i)) {
                        s.add_var(p.clone(), a);
                    }
                }
                for dp in &aux.model.derived_params {
                    if let Some(a) = layout.accessor(&format!("{}AS{}", dp.name, i)) {
                        s.add_var(dp.name.clone(), a);
                    }
                }
                for v in &aux.model.vars {
                    s.add_var(v.name.clone(), format!("group.{}AS{}[uid]", v.name, i));
                }
                for e in &aux.model.extra_buffers {
                    if layout.has_field(&format!("{}AS{}", e.name, i)) {
                        s.add_var(e.name.clone(), format!("group.{}AS{}", e.name, i));
                    }
                }
                let text = s.apply(&aux.model.inject_code);
                check_unreplaced(&text, &label)?;
                w.lines(&text);
            }

            let mut s = Substitutions::with_parent(subs);
            s.add_var("id", "uid");
            if needs_inflow {
                s.add_var("inflow", "inflow");
            }
            for (vi, v) in model.vars.iter().enumerate() {
                let ix = if arch.delay_required() && arch.is_var_delayed(vi) {
                    format!("{} + uid", pg.current_queue_offset())
                } else {
                    "uid".to_string()
                };
                s.add_var(v.name.clone(), format!("group.{}[{}]", v.name, ix));
            }
            for p in &model.param_names {
                if let Some(a) = layout.accessor(p) {
                    s.add_var(p.clone(), a);
                }
            }
            for dp in &model.derived_params {
                if let Some(a) = layout.accessor(&dp.name) {
                    s.add_var(dp.name.clone(), a);
                }
            }
            for e in &model.extra_buffers {
                if layout.has_field(&e.name) {
                    s.add_var(e.name.clone(), format!("group.{}", e.name));
                }
            }
            let text = s.apply(&model.update_code);
            check_unreplaced(&text, &label)?;
            w.lines(&text);

            if arch.events_required && !model.event_condition_code.is_empty() {
                let cond = s.apply(&model.event_condition_code);
                check_unreplaced(&cond, &label)?;
                w.block(&format!("if ({})", cond.trim()), |w| {
                    let slot = if arch.delay_required() {
                        "*group.queuePtr"
                    } else {
                        "0"
                    };
                    w.line(&format!(
                        "const unsigned int evtIdx = {}(&group.evtCnt[{}], 1);",
                        self.backend.atomic_add_fn("unsigned int"),
                        slot
                    ));
                    if arch.delay_required() {
                        w.line("group.evt[(*group.queuePtr * group.numUnits) + evtIdx] = uid;");
                        if arch.event_times_required {
                            w.line(
                                "group.evtTimes[(*group.queuePtr * group.numUnits) + uid] = t;",
                            );
                        }
                    } else {
                        w.line("group.evt[evtIdx] = uid;");
                        if arch.event_times_required {
                            w.line("group.evtTimes[uid] = t;");
                        }
                    }
                });
            }

            for (i, proj) in pg.sorted_out_src()[0].iter().enumerate() {
                w.line(&format!("// source-side coupling of '{}'", proj.name));
                let mut s = Substitutions::with_parent(subs);
                s.add_var("id", "uid");
                for v in &proj.model.src_vars {
                    s.add_var(v.name.clone(), format!("group.{}Src{}[uid]", v.name, i));
                }
                for p in &proj.model.param_names {
                    if let Some(a) = layout.accessor(&format!("{}OutSrc{}", p, i)) {
                        s.add_var(p.clone(), a);
                    }
                }
                for dp in &proj.model.derived_params {
                    if let Some(a) = layout.accessor(&format!("{}OutSrc{}", dp.name, i)) {
                        s.add_var(dp.name.clone(), a);
                    }
                }
                let text = s.apply(&proj.model.src_update_code);
                check_unreplaced(&text, &label)?;
                w.lines(&text);
            }

            for (i, proj) in pg.sorted_in_tgt()[0].iter().enumerate() {
                w.line(&format!("// target-side coupling of '{}'", proj.name));
                let mut s = Substitutions::with_parent(subs);
                s.add_var("id", "uid");
                for v in &proj.model.tgt_vars {
                    s.add_var(v.name.clone(), format!("group.{}Tgt{}[uid]", v.name, i));
                }
                for p in &proj.model.param_names {
                    if let Some(a) = layout.accessor(&format!("{}InTgt{}", p, i)) {
                        s.add_var(p.clone(), a);
                    }
                }
                for dp in &proj.model.derived_params {
                    if let Some(a) = layout.accessor(&format!("{}InTgt{}", dp.name, i)) {
                        s.add_var(dp.name.clone(), a);
                    }
                }
                let text = s.apply(&proj.model.tgt_update_code);
                check_unreplaced(&text, &label)?;
                w.lines(&text);
            }

            Ok(())
        })
    }

    /// Seed one population merged group's state inside the init kernel.
    pub(super) fn population_init_body(
        &self,
        w: &mut CodeWriter,
        pg: &PopulationGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let layout = &plan.layout;
        let arch = pg.archetype();
        let model = arch.model.clone();
        let label = format!("{} body", layout.struct_name);

        self.emit_member_resolution(w, subs, plan, pg.group().len());
        w.block("if (uid < group.numUnits)", |w| -> Result<()> {
            for (vi, v) in model.vars.iter().enumerate() {
                let init = &arch.var_inits[vi];
                if init.snippet.code.is_empty() {
                    continue;
                }
                let mut s = Substitutions::with_parent(subs);
                s.add_var("id", "uid");
                for p in &init.snippet.param_names {
                    if let Some(a) = layout.accessor(&format!("{}{}", p, v.name)) {
                        s.add_var(p.clone(), a);
                    }
                }
                for dp in &init.snippet.derived_params {
                    if let Some(a) = layout.accessor(&format!("{}{}", dp.name, v.name)) {
                        s.add_var(dp.name.clone(), a);
                    }
                }
                if arch.delay_required() && arch.is_var_delayed(vi) {
                    // Delayed variables are buffered per slot; seed them all.
                    s.add_var(
                        "value",
                        format!("group.{}[(d * group.numUnits) + uid]", v.name),
                    );
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.block(
                        &format!("for (unsigned int d = 0; d < {}; d++)", arch.delay_slots),
                        |w| w.lines(&text),
                    );
                } else {
                    s.add_var("value", format!("group.{}[uid]", v.name));
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.lines(&text);
                }
            }

            for (i, proj) in pg.sorted_inflows()[0].iter().enumerate() {
                if proj.target_delay_required() {
                    w.block(
                        &format!(
                            "for (unsigned int d = 0; d < {}; d++)",
                            proj.max_target_delay_slots
                        ),
                        |w| {
                            w.line(&format!(
                                "group.delayAcc{}[(d * group.numUnits) + uid] = 0.0;",
                                i
                            ));
                        },
                    );
                } else {
                    w.line(&format!("group.acc{}[uid] = 0.0;", i));
                }
            }

            for (i, aux) in pg.sorted_aux()[0].iter().enumerate() {
                for (vi, v) in aux.model.vars.iter().enumerate() {
                    let init = &aux.var_inits[vi];
                    if init.snippet.code.is_empty() {
                        continue;
                    }
                    let mut s = Substitutions::with_parent(subs);
                    s.add_var("id", "uid");
                    s.add_var("value", format!("group.{}AS{}[uid]", v.name, i));
                    for p in &init.snippet.param_names {
                        if let Some(a) = layout.accessor(&format!("{}{}AS{}", p, v.name, i)) {
                            s.add_var(p.clone(), a);
                        }
                    }
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.lines(&text);
                }
            }

            for (i, proj) in pg.sorted_in_tgt()[0].iter().enumerate() {
                for (vi, v) in proj.model.tgt_vars.iter().enumerate() {
                    let init = &proj.tgt_var_inits[vi];
                    if init.snippet.code.is_empty() {
                        continue;
                    }
                    let mut s = Substitutions::with_parent(subs);
                    s.add_var("id", "uid");
                    s.add_var("value", format!("group.{}Tgt{}[uid]", v.name, i));
                    for p in &init.snippet.param_names {
                        if let Some(a) = layout.accessor(&format!("{}{}Tgt{}", p, v.name, i)) {
                            s.add_var(p.clone(), a);
                        }
                    }
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.lines(&text);
                }
            }

            for (i, proj) in pg.sorted_out_src()[0].iter().enumerate() {
                for (vi, v) in proj.model.src_vars.iter().enumerate() {
                    let init = &proj.src_var_inits[vi];
                    if init.snippet.code.is_empty() {
                        continue;
                    }
                    let mut s = Substitutions::with_parent(subs);
                    s.add_var("id", "uid");
                    s.add_var("value", format!("group.{}Src{}[uid]", v.name, i));
                    for p in &init.snippet.param_names {
                        if let Some(a) = layout.accessor(&format!("{}{}Src{}", p, v.name, i)) {
                            s.add_var(p.clone(), a);
                        }
                    }
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.lines(&text);
                }
            }

            if arch.events_required {
                let slots = if arch.delay_required() {
                    arch.delay_slots
                } else {
                    1
                };
                w.block("if (uid == 0)", |w| {
                    for s in 0..slots {
                        w.line(&format!("group.evtCnt[{}] = 0;", s));
                    }
                });
            }

            Ok(())
        })
    }

    pub(super) fn generate_population_queue_update(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::PopulationQueueUpdate;
        let eligible: Vec<&PopulationDescriptor> = self
            .catalog
            .populations()
            .filter(|p| DelayAdvanceGroup::eligible(p))
            .collect();
        let groups = merge_groups("population-queue-update", eligible, |a, b| {
            DelayAdvanceGroup::can_be_merged(a, b)
        });
        let dgs: Vec<DelayAdvanceGroup> = groups.iter().map(DelayAdvanceGroup::new).collect();

        let mut plans = Vec::with_capacity(dgs.len());
        for dg in &dgs {
            let layout = dg.build_layout(self.backend, &self.config.scalar_ty)?;
            plans.push(self.group_plan(phase, dg.group(), layout, |_| 1, false));
        }

        let registry = self.kernel_registry(&plans);
        let subs = self.kernel_subs();
        let mut body = CodeWriter::new();
        let mut planner = DispatchPlanner::new(self.backend, phase);
        planner.plan(
            &mut body,
            &subs,
            &groups,
            &registry,
            |g| plans[g.index()].total,
            |_| true,
            |w, g, s| {
                let plan = &plans[g.index()];
                let id = s.lookup("id").unwrap_or("id").to_string();
                w.block(&format!("if ({} < {})", id, g.len()), |w| {
                    w.line(&format!(
                        "const struct {} group = {}[{}];",
                        plan.layout.struct_name, plan.data_buffer, id
                    ));
                    dgs[g.index()].emit_advance(w);
                });
                Ok(())
            },
        )?;

        let total = planner.total_lanes();
        let refs = planner.into_buffer_refs();
        Ok(self.assemble(phase, plans, body.into_string(), refs, total))
    }
}
