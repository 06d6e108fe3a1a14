//! Projection kernel drivers: forward, backward, dynamics, init phases and
//! the accumulation-queue advance.

use tessera_model::{Connectivity, ProjectionDescriptor, Weights};

use crate::backend::{KernelPhase, LaneRole};
use crate::dispatch::DispatchPlanner;
use crate::emit::{check_unreplaced, function_substitute, CodeWriter, Substitutions};
use crate::error::Result;
use crate::groups::{
    ConnectivityInitGroup, InflowDelayAdvanceGroup, PopulationGroup, ProjectionGroup,
    ProjectionRole,
};
use crate::merge::{merge_groups, MergedGroup};

use super::{Backend, Engine, GeneratedKernel, GroupPlan};

impl<'a, B: Backend> Engine<'a, B> {
    pub(super) fn generate_projection_forward(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::ProjectionForward;
        let eligible: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| !p.model.transmit_code.is_empty() || !p.model.event_code.is_empty())
            .collect();
        let groups = merge_groups("projection-forward", eligible, |a, b| a.can_be_merged(b));
        let pgs: Vec<ProjectionGroup> = groups
            .iter()
            .map(|g| ProjectionGroup::new(g, ProjectionRole::Forward, self.catalog))
            .collect();

        let mut plans = Vec::with_capacity(pgs.len());
        for pg in &pgs {
            let strategy = self.strategies.select(pg.archetype())?;
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            plans.push(self.group_plan(
                phase,
                pg.group(),
                layout,
                |m| strategy.lanes(m),
                true,
            ));
        }

        self.finish_projection_kernel(phase, &groups, plans, |w, idx, plan, s| {
            let pg = &pgs[idx];
            let role = self.strategies.select(pg.archetype())?.lane_role();
            self.projection_forward_body(w, pg, plan, s, role)
        })
    }

    pub(super) fn generate_projection_backward(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::ProjectionBackward;
        let eligible: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| !p.model.learn_code.is_empty())
            .collect();
        let groups = merge_groups("projection-backward", eligible, |a, b| a.can_be_merged(b));
        let pgs: Vec<ProjectionGroup> = groups
            .iter()
            .map(|g| ProjectionGroup::new(g, ProjectionRole::Backward, self.catalog))
            .collect();

        let mut plans = Vec::with_capacity(pgs.len());
        for pg in &pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            plans.push(self.group_plan(
                phase,
                pg.group(),
                layout,
                |m| match m.connectivity {
                    Connectivity::Sparse { .. } => m.max_col_length as usize,
                    _ => m.source_count as usize,
                },
                true,
            ));
        }

        self.finish_projection_kernel(phase, &groups, plans, |w, idx, plan, s| {
            self.projection_backward_body(w, &pgs[idx], plan, s)
        })
    }

    pub(super) fn generate_projection_dynamics(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::ProjectionDynamics;
        let eligible: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| !p.model.dynamics_code.is_empty())
            .collect();
        let groups = merge_groups("projection-dynamics", eligible, |a, b| a.can_be_merged(b));
        let pgs: Vec<ProjectionGroup> = groups
            .iter()
            .map(|g| ProjectionGroup::new(g, ProjectionRole::Dynamics, self.catalog))
            .collect();

        let mut plans = Vec::with_capacity(pgs.len());
        for pg in &pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            plans.push(self.group_plan(
                phase,
                pg.group(),
                layout,
                |m| match m.connectivity {
                    Connectivity::Sparse { .. } => {
                        (m.source_count * m.max_row_length) as usize
                    }
                    _ => (m.source_count * m.row_stride()) as usize,
                },
                true,
            ));
        }

        self.finish_projection_kernel(phase, &groups, plans, |w, idx, plan, s| {
            self.projection_dynamics_body(w, &pgs[idx], plan, s)
        })
    }

    fn finish_projection_kernel<E>(
        &self,
        phase: KernelPhase,
        groups: &[MergedGroup<'a, ProjectionDescriptor>],
        plans: Vec<GroupPlan>,
        emit: E,
    ) -> Result<GeneratedKernel>
    where
        E: Fn(&mut CodeWriter, usize, &GroupPlan, &Substitutions<'_>) -> Result<()>,
    {
        let registry = self.kernel_registry(&plans);
        let subs = self.kernel_subs();
        let mut body = CodeWriter::new();
        let mut planner = DispatchPlanner::new(self.backend, phase);
        planner.plan(
            &mut body,
            &subs,
            groups,
            &registry,
            |g| plans[g.index()].total,
            |_| true,
            |w, g, s| emit(w, g.index(), &plans[g.index()], s),
        )?;
        let total = planner.total_lanes();
        let refs = planner.into_buffer_refs();
        Ok(self.assemble(phase, plans, body.into_string(), refs, total))
    }

    /// Substitution scope for per-connection code: weights, model params,
    /// and referenced-only cross-entity state. Local names `srcUnit`,
    /// `tgtUnit` and `synIdx` must be bound by the surrounding body.
    fn connection_subs<'p>(
        &self,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        parent: &'p Substitutions<'p>,
    ) -> Result<Substitutions<'p>> {
        let layout = &plan.layout;
        let arch = pg.archetype();
        let model = arch.model.clone();
        let mut s = Substitutions::with_parent(parent);
        s.add_var("id_src", "srcUnit");
        s.add_var("id_tgt", "tgtUnit");

        for v in &model.vars {
            match arch.weights {
                Weights::Individual => {
                    s.add_var(v.name.clone(), format!("group.{}[synIdx]", v.name));
                }
                Weights::Procedural => {
                    // Locals materialized by the caller from the initialiser.
                    s.add_var(v.name.clone(), v.name.clone());
                }
                Weights::Global => {
                    if let Some(a) = layout.accessor(&v.name) {
                        s.add_var(v.name.clone(), a);
                    }
                }
            }
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

        let src_pop = pg.src_pop()?;
        let src_delayed = src_pop.delay_required();
        let src_slot_base = if src_delayed {
            Some(format!("({} * group.numSrcUnits) + ", pg.src_delay_slot()?))
        } else {
            None
        };
        for (vi, v) in src_pop.model.vars.iter().enumerate() {
            let field = format!("{}Src", v.name);
            if layout.has_field(&field) {
                let ix = match (&src_slot_base, src_pop.is_var_delayed(vi)) {
                    (Some(base), true) => format!("{}srcUnit", base),
                    _ => "srcUnit".to_string(),
                };
                s.add_var(format!("{}_src", v.name), format!("group.{}[{}]", field, ix));
            }
        }
        for p in &src_pop.model.param_names {
            if let Some(a) = layout.accessor(&format!("{}Src", p)) {
                s.add_var(format!("{}_src", p), a);
            }
        }
        for e in &src_pop.model.extra_buffers {
            let field = format!("{}Src", e.name);
            if layout.has_field(&field) {
                s.add_var(format!("{}_src", e.name), format!("group.{}", field));
            }
        }
        if layout.has_field("srcEvtTimes") {
            let ix = match &src_slot_base {
                Some(base) => format!("{}srcUnit", base),
                None => "srcUnit".to_string(),
            };
            s.add_var("evtTime_src", format!("group.srcEvtTimes[{}]", ix));
        }

        let tgt_pop = pg.tgt_pop()?;
        let tgt_delayed = tgt_pop.delay_required();
        let tgt_slot_base = if tgt_delayed {
            Some(format!("({} * group.numTgtUnits) + ", pg.tgt_delay_slot()?))
        } else {
            None
        };
        for (vi, v) in tgt_pop.model.vars.iter().enumerate() {
            let field = format!("{}Tgt", v.name);
            if layout.has_field(&field) {
                let ix = match (&tgt_slot_base, tgt_pop.is_var_delayed(vi)) {
                    (Some(base), true) => format!("{}tgtUnit", base),
                    _ => "tgtUnit".to_string(),
                };
                s.add_var(format!("{}_tgt", v.name), format!("group.{}[{}]", field, ix));
            }
        }
        for p in &tgt_pop.model.param_names {
            if let Some(a) = layout.accessor(&format!("{}Tgt", p)) {
                s.add_var(format!("{}_tgt", p), a);
            }
        }
        for e in &tgt_pop.model.extra_buffers {
            let field = format!("{}Tgt", e.name);
            if layout.has_field(&field) {
                s.add_var(format!("{}_tgt", e.name), format!("group.{}", field));
            }
        }
        if layout.has_field("tgtEvtTimes") {
            let ix = match &tgt_slot_base {
                Some(base) => format!("{}tgtUnit", base),
                None => "tgtUnit".to_string(),
            };
            s.add_var("evtTime_tgt", format!("group.tgtEvtTimes[{}]", ix));
        }

        Ok(s)
    }

    /// Emit per-connection code: procedural-weight locals, substitution,
    /// accumulation-call expansion and the unreplaced-token check.
    fn emit_connection_code(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        parent: &Substitutions<'_>,
        code: &str,
    ) -> Result<()> {
        let arch = pg.archetype();
        let label = format!("{} body", plan.layout.struct_name);

        if arch.weights == Weights::Procedural {
            for (vi, v) in arch.model.vars.iter().enumerate() {
                let init = &arch.var_inits[vi];
                w.line(&format!("{} {};", v.ty, v.name));
                let mut s = Substitutions::with_parent(parent);
                s.add_var("id", "synIdx");
                s.add_var("value", v.name.clone());
                for p in &init.snippet.param_names {
                    if let Some(a) = plan.layout.accessor(&format!("{}{}", p, v.name)) {
                        s.add_var(p.clone(), a);
                    }
                }
                for dp in &init.snippet.derived_params {
                    if let Some(a) = plan.layout.accessor(&format!("{}{}", dp.name, v.name)) {
                        s.add_var(dp.name.clone(), a);
                    }
                }
                let text = s.apply(&init.snippet.code);
                check_unreplaced(&text, &label)?;
                w.lines(&text);
            }
        }

        let s = self.connection_subs(pg, plan, parent)?;
        let mut text = s.apply(code);

        let atomic = self.backend.atomic_add_fn(&self.config.scalar_ty);
        let template = if arch.target_delay_required() {
            format!(
                "{}(&group.delayAcc[{}tgtUnit], $(0))",
                atomic,
                pg.acc_delay_offset(None)
            )
        } else {
            format!("{}(&group.acc[tgtUnit], $(0))", atomic)
        };
        text = function_substitute(&text, "add_acc", 1, &template);

        check_unreplaced(&text, &label)?;
        w.lines(&text);
        Ok(())
    }

    fn projection_forward_body(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
        lane_role: LaneRole,
    ) -> Result<()> {
        let arch = pg.archetype();
        let model = arch.model.clone();
        let code = format!("{}\n{}", model.transmit_code, model.event_code);

        self.emit_member_resolution(w, subs, plan, pg.group().len());

        let src_delayed = pg.src_pop()?.delay_required();
        let (cnt_ix, evt_base) = if src_delayed {
            let slot = pg.src_delay_slot()?;
            (slot.clone(), format!("({} * group.numSrcUnits) + ", slot))
        } else {
            ("0".to_string(), String::new())
        };

        match lane_role {
            LaneRole::TargetUnit => {
                let guard = match &arch.connectivity {
                    Connectivity::Sparse { .. } => "uid < group.rowStride",
                    _ => "uid < group.numTgtUnits",
                };
                w.block(&format!("if ({})", guard), |w| -> Result<()> {
                    w.line(&format!(
                        "const unsigned int numEvents = group.srcEvtCnt[{}];",
                        cnt_ix
                    ));
                    w.block("for (unsigned int j = 0; j < numEvents; j++)", |w| {
                        w.line(&format!(
                            "const unsigned int srcUnit = group.srcEvt[{}j];",
                            evt_base
                        ));
                        match &arch.connectivity {
                            Connectivity::Dense => {
                                w.line("const unsigned int tgtUnit = uid;");
                                w.line(
                                    "const unsigned int synIdx = (srcUnit * group.rowStride) + uid;",
                                );
                                self.emit_connection_code(w, pg, plan, subs, &code)
                            }
                            Connectivity::Sparse { .. } => {
                                w.block("if (uid < group.rowLength[srcUnit])", |w| {
                                    w.line("const unsigned int synIdx = (srcUnit * group.rowStride) + uid;");
                                    w.line("const unsigned int tgtUnit = group.ind[synIdx];");
                                    self.emit_connection_code(w, pg, plan, subs, &code)
                                })
                            }
                            Connectivity::Bitmask => {
                                w.line("const unsigned int tgtUnit = uid;");
                                w.line(
                                    "const unsigned int synIdx = (srcUnit * group.numTgtUnits) + uid;",
                                );
                                w.block(
                                    "if (group.mask[synIdx / 32] & (0x1 << (synIdx % 32)))",
                                    |w| self.emit_connection_code(w, pg, plan, subs, &code),
                                )
                            }
                        }
                    })
                })
            }
            LaneRole::SourceRow => {
                w.block("if (uid < group.numSrcUnits)", |w| -> Result<()> {
                    w.line(&format!(
                        "const unsigned int numEvents = group.srcEvtCnt[{}];",
                        cnt_ix
                    ));
                    w.block("for (unsigned int j = 0; j < numEvents; j++)", |w| {
                        w.block(
                            &format!("if (group.srcEvt[{}j] == uid)", evt_base),
                            |w| {
                                w.line("const unsigned int srcUnit = uid;");
                                w.block(
                                    "for (unsigned int k = 0; k < group.rowLength[srcUnit]; k++)",
                                    |w| {
                                        w.line("const unsigned int synIdx = (srcUnit * group.rowStride) + k;");
                                        w.line("const unsigned int tgtUnit = group.ind[synIdx];");
                                        self.emit_connection_code(w, pg, plan, subs, &code)
                                    },
                                )
                            },
                        )
                    })
                })
            }
        }
    }

    fn projection_backward_body(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let arch = pg.archetype();
        let code = arch.model.learn_code.clone();

        self.emit_member_resolution(w, subs, plan, pg.group().len());

        let tgt_delayed = pg.tgt_pop()?.delay_required();
        let (cnt_ix, evt_base) = if tgt_delayed {
            let slot = pg.tgt_delay_slot()?;
            (slot.clone(), format!("({} * group.numTgtUnits) + ", slot))
        } else {
            ("0".to_string(), String::new())
        };

        match &arch.connectivity {
            Connectivity::Sparse { .. } => {
                w.block("if (uid < group.colStride)", |w| -> Result<()> {
                    w.line(&format!(
                        "const unsigned int numEvents = group.tgtEvtCnt[{}];",
                        cnt_ix
                    ));
                    w.block("for (unsigned int j = 0; j < numEvents; j++)", |w| {
                        w.line(&format!(
                            "const unsigned int tgtUnit = group.tgtEvt[{}j];",
                            evt_base
                        ));
                        w.block("if (uid < group.colLength[tgtUnit])", |w| {
                            w.line("const unsigned int synIdx = group.remap[(tgtUnit * group.colStride) + uid];");
                            w.line("const unsigned int srcUnit = synIdx / group.rowStride;");
                            self.emit_connection_code(w, pg, plan, subs, &code)
                        })
                    })
                })
            }
            Connectivity::Dense => {
                w.block("if (uid < group.numSrcUnits)", |w| -> Result<()> {
                    w.line(&format!(
                        "const unsigned int numEvents = group.tgtEvtCnt[{}];",
                        cnt_ix
                    ));
                    w.block("for (unsigned int j = 0; j < numEvents; j++)", |w| {
                        w.line(&format!(
                            "const unsigned int tgtUnit = group.tgtEvt[{}j];",
                            evt_base
                        ));
                        w.line("const unsigned int srcUnit = uid;");
                        w.line("const unsigned int synIdx = (uid * group.rowStride) + tgtUnit;");
                        self.emit_connection_code(w, pg, plan, subs, &code)
                    })
                })
            }
            Connectivity::Bitmask => {
                w.block("if (uid < group.numSrcUnits)", |w| -> Result<()> {
                    w.line(&format!(
                        "const unsigned int numEvents = group.tgtEvtCnt[{}];",
                        cnt_ix
                    ));
                    w.block("for (unsigned int j = 0; j < numEvents; j++)", |w| {
                        w.line(&format!(
                            "const unsigned int tgtUnit = group.tgtEvt[{}j];",
                            evt_base
                        ));
                        w.line("const unsigned int srcUnit = uid;");
                        w.line("const unsigned int synIdx = (uid * group.numTgtUnits) + tgtUnit;");
                        w.block(
                            "if (group.mask[synIdx / 32] & (0x1 << (synIdx % 32)))",
                            |w| self.emit_connection_code(w, pg, plan, subs, &code),
                        )
                    })
                })
            }
        }
    }

    fn projection_dynamics_body(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let arch = pg.archetype();
        let code = arch.model.dynamics_code.clone();

        self.emit_member_resolution(w, subs, plan, pg.group().len());

        match &arch.connectivity {
            Connectivity::Sparse { .. } => {
                w.block("if (uid < group.synRemap[0])", |w| -> Result<()> {
                    w.line("const unsigned int synIdx = group.synRemap[1 + uid];");
                    w.line("const unsigned int srcUnit = synIdx / group.rowStride;");
                    w.line("const unsigned int tgtUnit = group.ind[synIdx];");
                    self.emit_connection_code(w, pg, plan, subs, &code)
                })
            }
            Connectivity::Dense => {
                w.block(
                    "if (uid < (group.numSrcUnits * group.rowStride))",
                    |w| -> Result<()> {
                        w.line("const unsigned int synIdx = uid;");
                        w.line("const unsigned int srcUnit = uid / group.rowStride;");
                        w.line("const unsigned int tgtUnit = uid % group.rowStride;");
                        self.emit_connection_code(w, pg, plan, subs, &code)
                    },
                )
            }
            Connectivity::Bitmask => {
                w.block(
                    "if (uid < (group.numSrcUnits * group.numTgtUnits))",
                    |w| -> Result<()> {
                        w.line("const unsigned int synIdx = uid;");
                        w.line("const unsigned int srcUnit = uid / group.numTgtUnits;");
                        w.line("const unsigned int tgtUnit = uid % group.numTgtUnits;");
                        w.block(
                            "if (group.mask[synIdx / 32] & (0x1 << (synIdx % 32)))",
                            |w| self.emit_connection_code(w, pg, plan, subs, &code),
                        )
                    },
                )
            }
        }
    }

    pub(super) fn generate_init(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::Init;

        // Populations.
        let pop_groups = merge_groups("population-init", self.catalog.populations(), |a, b| {
            a.can_init_be_merged(b, self.catalog)
        });
        let pop_pgs: Vec<PopulationGroup> = pop_groups
            .iter()
            .map(|g| PopulationGroup::new(g, self.catalog, true))
            .collect::<Result<_>>()?;
        let mut pop_plans = Vec::with_capacity(pop_pgs.len());
        for pg in &pop_pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            pop_plans.push(self.group_plan(phase, pg.group(), layout, |p| p.count as usize, true));
        }

        // Dense projections with per-connection state.
        let dense: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| {
                p.connectivity == Connectivity::Dense
                    && p.weights == Weights::Individual
                    && !p.model.vars.is_empty()
            })
            .collect();
        let proj_groups = merge_groups("projection-init", dense, |a, b| a.can_init_be_merged(b));
        let proj_pgs: Vec<ProjectionGroup> = proj_groups
            .iter()
            .map(|g| ProjectionGroup::new(g, ProjectionRole::Init, self.catalog))
            .collect();
        let mut proj_plans = Vec::with_capacity(proj_pgs.len());
        for pg in &proj_pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            proj_plans.push(self.group_plan(
                phase,
                pg.group(),
                layout,
                |p| p.target_count as usize,
                true,
            ));
        }

        // Connectivity builds.
        let with_conn_init: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| {
                !matches!(p.connectivity, Connectivity::Dense)
                    && !p.connectivity_init.snippet.code.is_empty()
            })
            .collect();
        let conn_groups = merge_groups("connectivity-init", with_conn_init, |a, b| {
            a.can_connectivity_init_be_merged(b)
        });
        let cgs: Vec<ConnectivityInitGroup> =
            conn_groups.iter().map(ConnectivityInitGroup::new).collect();
        let mut conn_plans = Vec::with_capacity(cgs.len());
        for cg in &cgs {
            let layout = cg.build_layout(self.backend, &self.config.scalar_ty)?;
            conn_plans.push(self.group_plan(
                phase,
                cg.group(),
                layout,
                |p| p.source_count as usize,
                true,
            ));
        }

        let mut registry = self.kernel_registry(&pop_plans);
        registry.merge(&self.kernel_registry(&proj_plans));
        registry.merge(&self.kernel_registry(&conn_plans));

        let subs = self.kernel_subs();
        let mut body = CodeWriter::new();
        let mut planner = DispatchPlanner::new(self.backend, phase);

        // The three logical phases multiplex into one body; the cursor is
        // shared across the sequential plan calls.
        planner.plan(
            &mut body,
            &subs,
            &pop_groups,
            &registry,
            |g| pop_plans[g.index()].total,
            |_| true,
            |w, g, s| self.population_init_body(w, &pop_pgs[g.index()], &pop_plans[g.index()], s),
        )?;
        planner.plan(
            &mut body,
            &subs,
            &proj_groups,
            &registry,
            |g| proj_plans[g.index()].total,
            |_| true,
            |w, g, s| self.projection_init_body(w, &proj_pgs[g.index()], &proj_plans[g.index()], s),
        )?;
        planner.plan(
            &mut body,
            &subs,
            &conn_groups,
            &registry,
            |g| conn_plans[g.index()].total,
            |_| true,
            |w, g, s| self.connectivity_init_body(w, &cgs[g.index()], &conn_plans[g.index()], s),
        )?;

        let total = planner.total_lanes();
        let refs = planner.into_buffer_refs();
        let mut plans = pop_plans;
        plans.extend(proj_plans);
        plans.extend(conn_plans);
        Ok(self.assemble(phase, plans, body.into_string(), refs, total))
    }

    fn projection_init_body(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let arch = pg.archetype();
        let label = format!("{} body", plan.layout.struct_name);

        self.emit_member_resolution(w, subs, plan, pg.group().len());
        w.block("if (uid < group.numTgtUnits)", |w| -> Result<()> {
            w.block("for (unsigned int i = 0; i < group.numSrcUnits; i++)", |w| {
                w.line("const unsigned int synIdx = (i * group.rowStride) + uid;");
                for (vi, v) in arch.model.vars.iter().enumerate() {
                    let init = &arch.var_inits[vi];
                    if init.snippet.code.is_empty() {
                        continue;
                    }
                    let mut s = Substitutions::with_parent(subs);
                    s.add_var("id", "synIdx");
                    s.add_var("id_src", "i");
                    s.add_var("id_tgt", "uid");
                    s.add_var("value", format!("group.{}[synIdx]", v.name));
                    for p in &init.snippet.param_names {
                        if let Some(a) = plan.layout.accessor(&format!("{}{}", p, v.name)) {
                            s.add_var(p.clone(), a);
                        }
                    }
                    for dp in &init.snippet.derived_params {
                        if let Some(a) = plan.layout.accessor(&format!("{}{}", dp.name, v.name)) {
                            s.add_var(dp.name.clone(), a);
                        }
                    }
                    let text = s.apply(&init.snippet.code);
                    check_unreplaced(&text, &label)?;
                    w.lines(&text);
                }
                Ok(())
            })
        })
    }

    fn connectivity_init_body(
        &self,
        w: &mut CodeWriter,
        cg: &ConnectivityInitGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let arch = cg.archetype();
        let snippet = arch.connectivity_init.snippet.clone();
        let label = format!("{} body", plan.layout.struct_name);

        self.emit_member_resolution(w, subs, plan, cg.group().len());
        w.block("if (uid < group.numSrcUnits)", |w| -> Result<()> {
            if matches!(arch.connectivity, Connectivity::Sparse { .. }) {
                w.line("group.rowLength[uid] = 0;");
            }
            let mut s = Substitutions::with_parent(subs);
            s.add_var("id", "uid");
            s.add_var("id_src", "uid");
            s.add_var("numTgtUnits", "group.numTgtUnits");
            for p in &snippet.param_names {
                if let Some(a) = plan.layout.accessor(p) {
                    s.add_var(p.clone(), a);
                }
            }
            for dp in &snippet.derived_params {
                if let Some(a) = plan.layout.accessor(&dp.name) {
                    s.add_var(dp.name.clone(), a);
                }
            }
            for e in &snippet.extra_buffers {
                if plan.layout.has_field(&e.name) {
                    s.add_var(e.name.clone(), format!("group.{}", e.name));
                }
            }
            let mut text = s.apply(&snippet.code);
            let template = match &arch.connectivity {
                Connectivity::Sparse { .. } => {
                    "group.ind[(uid * group.rowStride) + (group.rowLength[uid]++)] = $(0)"
                        .to_string()
                }
                Connectivity::Bitmask => format!(
                    "{{ const unsigned int gid = (uid * group.numTgtUnits) + ($(0)); {}(&group.mask[gid / 32], 0x1 << (gid % 32)); }}",
                    self.backend.atomic_or_fn()
                ),
                Connectivity::Dense => String::new(),
            };
            text = function_substitute(&text, "add_connection", 1, &template);
            check_unreplaced(&text, &label)?;
            w.lines(&text);
            Ok(())
        })
    }

    pub(super) fn generate_init_sparse(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::InitSparse;
        let eligible: Vec<&ProjectionDescriptor> = self
            .catalog
            .projections()
            .filter(|p| {
                matches!(p.connectivity, Connectivity::Sparse { .. })
                    && ((p.weights == Weights::Individual && !p.model.vars.is_empty())
                        || !p.model.learn_code.is_empty()
                        || !p.model.dynamics_code.is_empty())
            })
            .collect();
        let groups = merge_groups("projection-sparse-init", eligible, |a, b| {
            a.can_init_be_merged(b)
        });
        let pgs: Vec<ProjectionGroup> = groups
            .iter()
            .map(|g| ProjectionGroup::new(g, ProjectionRole::SparseInit, self.catalog))
            .collect();

        let mut plans = Vec::with_capacity(pgs.len());
        for pg in &pgs {
            let layout =
                pg.build_layout(self.backend, &self.config.scalar_ty, &self.config.time_ty)?;
            plans.push(self.group_plan(
                phase,
                pg.group(),
                layout,
                |p| p.max_row_length as usize,
                true,
            ));
        }

        self.finish_projection_kernel(phase, &groups, plans, |w, idx, plan, s| {
            self.projection_sparse_init_body(w, &pgs[idx], plan, s)
        })
    }

    fn projection_sparse_init_body(
        &self,
        w: &mut CodeWriter,
        pg: &ProjectionGroup<'_, '_>,
        plan: &GroupPlan,
        subs: &Substitutions<'_>,
    ) -> Result<()> {
        let arch = pg.archetype();
        let label = format!("{} body", plan.layout.struct_name);
        let atomic = self.backend.atomic_add_fn("unsigned int");

        self.emit_member_resolution(w, subs, plan, pg.group().len());
        w.block("if (uid < group.rowStride)", |w| -> Result<()> {
            w.block("for (unsigned int i = 0; i < group.numSrcUnits; i++)", |w| {
                w.block("if (uid < group.rowLength[i])", |w| -> Result<()> {
                    w.line("const unsigned int synIdx = (i * group.rowStride) + uid;");
                    if arch.weights == Weights::Individual {
                        for (vi, v) in arch.model.vars.iter().enumerate() {
                            let init = &arch.var_inits[vi];
                            if init.snippet.code.is_empty() {
                                continue;
                            }
                            let mut s = Substitutions::with_parent(subs);
                            s.add_var("id", "synIdx");
                            s.add_var("id_src", "i");
                            s.add_var("value", format!("group.{}[synIdx]", v.name));
                            for p in &init.snippet.param_names {
                                if let Some(a) =
                                    plan.layout.accessor(&format!("{}{}", p, v.name))
                                {
                                    s.add_var(p.clone(), a);
                                }
                            }
                            for dp in &init.snippet.derived_params {
                                if let Some(a) =
                                    plan.layout.accessor(&format!("{}{}", dp.name, v.name))
                                {
                                    s.add_var(dp.name.clone(), a);
                                }
                            }
                            let text = s.apply(&init.snippet.code);
                            check_unreplaced(&text, &label)?;
                            w.lines(&text);
                        }
                    }
                    if plan.layout.has_field("colLength") {
                        w.line("const unsigned int tgtUnit = group.ind[synIdx];");
                        w.line(&format!(
                            "const unsigned int colIdx = {}(&group.colLength[tgtUnit], 1);",
                            atomic
                        ));
                        w.line("group.remap[(tgtUnit * group.colStride) + colIdx] = synIdx;");
                    }
                    if plan.layout.has_field("synRemap") {
                        w.line(&format!(
                            "const unsigned int remapIdx = {}(&group.synRemap[0], 1);",
                            atomic
                        ));
                        w.line("group.synRemap[1 + remapIdx] = synIdx;");
                    }
                    Ok(())
                })
            })
        })
    }

    pub(super) fn generate_acc_queue_update(&self) -> Result<GeneratedKernel> {
        let phase = KernelPhase::AccQueueUpdate;
        let owners = self.catalog.delayed_acc_owners();
        let groups = merge_groups("acc-queue-update", owners, |a, b| {
            InflowDelayAdvanceGroup::can_be_merged(a, b)
        });
        let dgs: Vec<InflowDelayAdvanceGroup> =
            groups.iter().map(InflowDelayAdvanceGroup::new).collect();

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
