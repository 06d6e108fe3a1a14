//! Integration test harness for the tessera engine.
//!
//! Provides catalog builders for small networks and a thin wrapper running
//! the full flow: Catalog → merge → layout → dispatch → generated kernels.

use std::sync::Arc;

use tessera_codegen::{CodegenConfig, Engine, GeneratedKernel, KernelPhase, StrategyRegistry};
use tessera_model::{
    AuxModel, AuxSourceDescriptor, Catalog, Connectivity, ConnectivityInit, CouplingModel,
    InitSnippet, PopulationDescriptor, ProjectionDescriptor, UnitModel, VarDecl, VarInit, Weights,
};
use tessera_simt::SimtBackend;

/// A leaky-integrator unit model with one state variable and referenced
/// parameters.
pub fn leaky_model() -> Arc<UnitModel> {
    Arc::new(UnitModel {
        name: "leaky".into(),
        param_names: vec!["tau".into(), "rest".into()],
        derived_params: vec![],
        vars: vec![VarDecl::new("V", "scalar")],
        extra_buffers: vec![],
        update_code: "$(V) += (($(rest) - $(V)) / $(tau) + $(inflow)) * $(dt);".into(),
        event_condition_code: "$(V) > 1.0".into(),
    })
}

/// A population of `count` leaky units with events enabled.
pub fn population(name: &str, count: u32, tau: f64) -> PopulationDescriptor {
    PopulationDescriptor {
        name: name.into(),
        count,
        model: leaky_model(),
        params: vec![tau, 0.0],
        derived_param_values: vec![],
        var_inits: vec![VarInit::constant(0.0)],
        delay_slots: 1,
        events_required: true,
        event_times_required: false,
        rng_required: false,
        var_delayed: vec![false],
        aux_sources: vec![],
    }
}

/// A constant-drive auxiliary source.
pub fn drive_source(name: &str, amp: f64) -> AuxSourceDescriptor {
    AuxSourceDescriptor {
        name: name.into(),
        model: Arc::new(AuxModel {
            name: "drive".into(),
            param_names: vec!["amp".into()],
            derived_params: vec![],
            vars: vec![],
            extra_buffers: vec![],
            inject_code: "$(inflow) += $(amp);".into(),
        }),
        params: vec![amp],
        derived_param_values: vec![],
        var_inits: vec![],
    }
}

/// A static coupling model: a single weight transmitted on source events.
pub fn static_coupling() -> Arc<CouplingModel> {
    Arc::new(CouplingModel {
        name: "static".into(),
        param_names: vec![],
        derived_params: vec![],
        vars: vec![VarDecl::new("g", "scalar")],
        src_vars: vec![],
        tgt_vars: vec![],
        extra_buffers: vec![],
        transmit_code: "$(add_acc, $(g));".into(),
        event_code: String::new(),
        learn_code: String::new(),
        dynamics_code: String::new(),
        src_update_code: String::new(),
        tgt_update_code: String::new(),
        acc_code: "$(inflow) += $(acc); $(acc) = 0.0;".into(),
        src_event_times_required: false,
        tgt_event_times_required: false,
    })
}

/// A sparse projection with individual weights.
pub fn projection(name: &str, source: &str, target: &str, weight: f64) -> ProjectionDescriptor {
    ProjectionDescriptor {
        name: name.into(),
        source: source.into(),
        source_count: 0,
        target: target.into(),
        target_count: 0,
        model: static_coupling(),
        params: vec![],
        derived_param_values: vec![],
        var_inits: vec![VarInit::constant(weight)],
        src_var_inits: vec![],
        tgt_var_inits: vec![],
        connectivity: Connectivity::Sparse {
            ind_ty: "unsigned int".into(),
        },
        weights: Weights::Individual,
        delay_steps: 0,
        back_delay_steps: 0,
        max_target_delay_slots: 1,
        max_row_length: 16,
        max_col_length: 16,
        connectivity_init: fixed_row_connectivity(),
        acc_fused_with: None,
    }
}

/// Connectivity initialiser wiring each row to a fixed number of targets.
pub fn fixed_row_connectivity() -> ConnectivityInit {
    ConnectivityInit {
        snippet: Arc::new(InitSnippet {
            code: "for (unsigned int c = 0; c < $(rowLen); c++) { $(add_connection, (($(id_src) + c) % $(numTgtUnits))); }".into(),
            param_names: vec!["rowLen".into()],
            derived_params: vec![],
            extra_buffers: vec![],
        }),
        params: vec![8.0],
        derived_param_values: vec![],
    }
}

/// Wire a projection's endpoint counts from the catalog's populations.
pub fn add_projection(catalog: &mut Catalog, mut proj: ProjectionDescriptor) {
    proj.source_count = catalog
        .population(&proj.source)
        .map(|p| p.count)
        .unwrap_or(0);
    proj.target_count = catalog
        .population(&proj.target)
        .map(|p| p.count)
        .unwrap_or(0);
    catalog.add_projection(proj);
}

/// Run the engine over `catalog` with the stock SIMT backend.
pub fn generate(catalog: &Catalog, phase: KernelPhase) -> GeneratedKernel {
    let backend = SimtBackend::new();
    let engine = Engine::new(
        catalog,
        &backend,
        CodegenConfig::default(),
        StrategyRegistry::with_defaults(),
    );
    engine
        .generate(phase)
        .expect("kernel generation should succeed")
}

/// Generate every non-empty kernel.
pub fn generate_all(catalog: &Catalog) -> Vec<GeneratedKernel> {
    let backend = SimtBackend::new();
    let engine = Engine::new(
        catalog,
        &backend,
        CodegenConfig::default(),
        StrategyRegistry::with_defaults(),
    );
    engine.generate_all().expect("generation should succeed")
}
