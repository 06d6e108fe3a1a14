//! Per-phase kernel drivers.
//!
//! Each driver runs the full engine flow for one kernel body: merge catalog
//! entities, align children, build merged-struct layouts, plan dispatch and
//! emit the body text. The output bundles everything the host glue needs to
//! instantiate the layouts at run time.

mod population;
mod projection;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::info;

use tessera_model::{is_pointer_ty, Catalog, Named};

use crate::backend::{Backend, KernelPhase, StrategyRegistry};
use crate::emit::{precise_literal, CodeWriter, Substitutions};
use crate::error::Result;
use crate::fields::{BufferRegistry, MemberValues, StructLayout};
use crate::merge::MergedGroup;

/// Engine-wide code-generation settings.
#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Element type of model state in the generated language.
    pub scalar_ty: String,
    /// Element type of timestamps.
    pub time_ty: String,
    /// Integration step, embedded as a literal.
    pub dt: f64,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            scalar_ty: "float".into(),
            time_ty: "float".into(),
            dt: 0.1,
        }
    }
}

/// Host-side instantiation data for one merged group.
#[derive(Debug, Clone, Serialize)]
pub struct HostGroupData {
    pub struct_name: String,
    pub definition: String,
    /// Runtime struct field names, in declaration order.
    pub fields: Vec<String>,
    /// Per-member field value tables, in struct field order.
    pub instances: Vec<MemberValues>,
    /// Lane offset of each member within the group's dispatch range; empty
    /// for kernels addressing one member per lane.
    pub start_ids: Vec<usize>,
}

/// One generated kernel body with its dispatch and host metadata.
#[derive(Debug)]
pub struct GeneratedKernel {
    pub phase: KernelPhase,
    pub name: String,
    pub code: String,
    /// Deduplicated external buffers referenced by the body, for signature
    /// construction: name → declared type.
    pub buffer_args: IndexMap<String, String>,
    pub total_lanes: usize,
    pub groups: Vec<HostGroupData>,
    /// Host statements pushing the merged-group instance tables to the
    /// device, emitted through the backend's transfer generator.
    pub host_upload: String,
}

/// The merging and code-generation engine for one compilation pass.
pub struct Engine<'a, B: Backend> {
    pub(crate) catalog: &'a Catalog,
    pub(crate) backend: &'a B,
    pub(crate) config: CodegenConfig,
    pub(crate) strategies: StrategyRegistry,
}

/// Dispatch-and-layout plan for one merged group within a kernel.
pub(crate) struct GroupPlan {
    pub(crate) layout: StructLayout,
    pub(crate) start_ids: Vec<usize>,
    pub(crate) total: usize,
    pub(crate) data_buffer: String,
    pub(crate) start_buffer: String,
}

impl<'a, B: Backend> Engine<'a, B> {
    pub fn new(
        catalog: &'a Catalog,
        backend: &'a B,
        config: CodegenConfig,
        strategies: StrategyRegistry,
    ) -> Self {
        Self {
            catalog,
            backend,
            config,
            strategies,
        }
    }

    /// Generate the body for one kernel phase.
    pub fn generate(&self, phase: KernelPhase) -> Result<GeneratedKernel> {
        match phase {
            KernelPhase::PopulationQueueUpdate => self.generate_population_queue_update(),
            KernelPhase::AccQueueUpdate => self.generate_acc_queue_update(),
            KernelPhase::PopulationUpdate => self.generate_population_update(),
            KernelPhase::ProjectionForward => self.generate_projection_forward(),
            KernelPhase::ProjectionBackward => self.generate_projection_backward(),
            KernelPhase::ProjectionDynamics => self.generate_projection_dynamics(),
            KernelPhase::Init => self.generate_init(),
            KernelPhase::InitSparse => self.generate_init_sparse(),
        }
    }

    /// Generate every phase that has work, in canonical phase order.
    pub fn generate_all(&self) -> Result<Vec<GeneratedKernel>> {
        let mut kernels = Vec::new();
        for phase in KernelPhase::ALL {
            let k = self.generate(phase)?;
            if k.total_lanes > 0 {
                info!(phase = ?phase, lanes = k.total_lanes, groups = k.groups.len(), "kernel generated");
                kernels.push(k);
            }
        }
        Ok(kernels)
    }

    /// Kernel-wide substitutions available to every group body.
    pub(crate) fn kernel_subs(&self) -> Substitutions<'static> {
        let mut s = Substitutions::new();
        s.add_var("t", "t");
        s.add_var("dt", precise_literal(self.config.dt));
        s
    }

    /// Build the dispatch plan for one merged group: member lane offsets,
    /// total unpadded size and the device names of the struct-instance and
    /// start-id tables.
    pub(crate) fn group_plan<T: Named>(
        &self,
        phase: KernelPhase,
        group: &MergedGroup<'_, T>,
        layout: StructLayout,
        lanes: impl Fn(&T) -> usize,
        with_start_ids: bool,
    ) -> GroupPlan {
        let stripped = layout
            .struct_name
            .strip_prefix("Merged")
            .unwrap_or(&layout.struct_name)
            .to_string();
        let buf = self.backend.device_buffer_prefix();
        let data_buffer = format!("{}merged{}", buf, stripped);
        let start_buffer = format!("{}merged{}StartID", buf, stripped);

        let (start_ids, total) = if with_start_ids {
            let mut starts = Vec::with_capacity(group.len());
            let mut cursor = 0usize;
            for m in group.members() {
                starts.push(cursor);
                cursor += self.backend.padded_size(phase, lanes(m));
            }
            (starts, cursor)
        } else {
            (Vec::new(), group.len())
        };

        GroupPlan {
            layout,
            start_ids,
            total,
            data_buffer,
            start_buffer,
        }
    }

    /// Declare every buffer the plans introduce, including the merged-group
    /// instance tables themselves.
    pub(crate) fn kernel_registry(&self, plans: &[GroupPlan]) -> BufferRegistry {
        let mut registry = BufferRegistry::new();
        for p in plans {
            registry.merge(&p.layout.buffers);
            registry.declare(
                p.data_buffer.clone(),
                format!("struct {}*", p.layout.struct_name),
            );
            if !p.start_ids.is_empty() {
                registry.declare(p.start_buffer.clone(), "unsigned int*");
            }
        }
        registry
    }

    /// Emit the member-resolution preamble: locate the member owning this
    /// lane, load its struct instance as `group` and bind the member-local
    /// id `uid`.
    pub(crate) fn emit_member_resolution(
        &self,
        w: &mut CodeWriter,
        subs: &Substitutions<'_>,
        plan: &GroupPlan,
        members: usize,
    ) {
        let id = subs.lookup("id").unwrap_or("id").to_string();
        if members == 1 {
            w.line(&format!(
                "const struct {} group = {}[0];",
                plan.layout.struct_name, plan.data_buffer
            ));
            w.line(&format!("const unsigned int uid = {};", id));
        } else {
            w.line("unsigned int lo = 0;");
            w.line(&format!("unsigned int hi = {};", members));
            w.block("while (lo + 1 < hi)", |w| {
                w.line("const unsigned int mid = (lo + hi) / 2;");
                w.line(&format!("if ({} >= {}[mid]) {{", id, plan.start_buffer));
                w.line("    lo = mid;");
                w.line("}");
                w.line("else {");
                w.line("    hi = mid;");
                w.line("}");
            });
            w.line(&format!(
                "const struct {} group = {}[lo];",
                plan.layout.struct_name, plan.data_buffer
            ));
            w.line(&format!(
                "const unsigned int uid = {} - {}[lo];",
                id, plan.start_buffer
            ));
        }
    }

    /// Assemble the final kernel text: struct declarations, signature built
    /// from the referenced buffers, lane-id binding and the planned body.
    pub(crate) fn assemble(
        &self,
        phase: KernelPhase,
        plans: Vec<GroupPlan>,
        body: String,
        buffer_args: IndexMap<String, String>,
        total_lanes: usize,
    ) -> GeneratedKernel {
        let mut w = CodeWriter::new();
        for p in &plans {
            w.raw(&p.layout.definition(self.backend.global_qualifier()));
            w.blank();
        }

        let mut params: Vec<String> = Vec::new();
        if matches!(
            phase,
            KernelPhase::PopulationUpdate
                | KernelPhase::ProjectionForward
                | KernelPhase::ProjectionBackward
                | KernelPhase::ProjectionDynamics
        ) {
            params.push(format!("const {} t", self.config.time_ty));
        }
        for (n, t) in &buffer_args {
            if is_pointer_ty(t) {
                params.push(format!("{} {} {}", self.backend.global_qualifier(), t, n));
            } else {
                params.push(format!("const {} {}", t, n));
            }
        }

        w.block(
            &format!(
                "{} void {}({})",
                self.backend.kernel_qualifier(),
                phase.kernel_name(),
                params.join(", ")
            ),
            |w| {
                w.line(&format!(
                    "const unsigned int id = {};",
                    self.backend.lane_id_expr()
                ));
                w.raw(&crate::dispatch::indent_fragment(&body));
            },
        );

        let groups: Vec<HostGroupData> = plans
            .into_iter()
            .map(|p| HostGroupData {
                definition: p.layout.definition(self.backend.global_qualifier()),
                fields: p
                    .layout
                    .runtime_fields()
                    .map(|f| f.name.clone())
                    .collect(),
                struct_name: p.layout.struct_name,
                instances: p.layout.instances,
                start_ids: p.start_ids,
            })
            .collect();

        let mut host = CodeWriter::new();
        for g in &groups {
            let stripped = g
                .struct_name
                .strip_prefix("Merged")
                .unwrap_or(&g.struct_name);
            self.backend.gen_push(
                &mut host,
                &format!("merged{}", stripped),
                &format!("struct {}", g.struct_name),
                g.instances.len(),
            );
            if !g.start_ids.is_empty() {
                self.backend.gen_push(
                    &mut host,
                    &format!("merged{}StartID", stripped),
                    "unsigned int",
                    g.start_ids.len(),
                );
            }
        }

        GeneratedKernel {
            phase,
            name: phase.kernel_name().to_string(),
            code: w.into_string(),
            buffer_args,
            total_lanes,
            groups,
            host_upload: host.into_string(),
        }
    }
}
