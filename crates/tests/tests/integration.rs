//! End-to-end tests for the merging and code-generation engine.
//!
//! These run the full flow (catalog -> merge -> child ordering -> layout ->
//! dispatch -> emitted text) and pin down the externally observable
//! properties: dispatch partitioning, literal vs. per-instance storage,
//! reference-gated materialization and byte-level determinism.

use std::sync::Arc;

use tessera_codegen::{
    CodegenConfig, CodegenError, Engine, KernelPhase, StrategyRegistry,
};
use tessera_model::{Catalog, PopulationDescriptor, UnitModel, VarDecl, VarInit};
use tessera_simt::SimtBackend;
use tessera_tests::{
    add_projection, drive_source, generate, generate_all, population, projection,
};

/// A population whose model code is unique to `tag`, so it never merges
/// with anything else.
fn distinct_population(name: &str, count: u32, tag: u32) -> PopulationDescriptor {
    let mut pop = population(name, count, 20.0);
    pop.model = Arc::new(UnitModel {
        name: format!("unit{}", tag),
        param_names: vec![],
        derived_params: vec![],
        vars: vec![VarDecl::new("V", "scalar")],
        extra_buffers: vec![],
        update_code: format!("$(V) += {}.0;", tag),
        event_condition_code: "$(V) > 1.0".into(),
    });
    pop.params = vec![];
    pop
}

#[test]
fn dispatch_ranges_partition_the_lane_axis() {
    // Three unmergeable groups of sizes 10, 17, 5; width 32 gives padded
    // sizes 32 each: ranges [0,32), [32,64), [64,96), final cursor 96.
    let mut catalog = Catalog::new();
    catalog.add_population(distinct_population("a", 10, 1));
    catalog.add_population(distinct_population("b", 17, 2));
    catalog.add_population(distinct_population("c", 5, 3));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.total_lanes, 96);
    assert_eq!(kernel.groups.len(), 3);
    assert!(kernel.code.contains("if (id < 32) {"));
    assert!(kernel.code.contains("if (id >= 32 && id < 64) {"));
    assert!(kernel.code.contains("if (id >= 64 && id < 96) {"));
}

#[test]
fn first_dispatch_block_is_branch_free() {
    let mut catalog = Catalog::new();
    catalog.add_population(distinct_population("a", 10, 1));
    catalog.add_population(distinct_population("b", 17, 2));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    // First group: local id IS the lane id, no subtraction.
    assert!(kernel.code.contains("const unsigned int uid = id;"));
    assert!(!kernel.code.contains("id - 0"));
    // Second group rebinds through lid.
    assert!(kernel.code.contains("const unsigned int lid = id - 32;"));
    assert!(kernel.code.contains("const unsigned int uid = lid;"));
}

#[test]
fn homogeneous_parameter_embeds_as_literal() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("p0", 10, 1.0));
    catalog.add_population(population("p1", 20, 1.0));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.groups.len(), 1, "equal populations must merge");
    let group = &kernel.groups[0];
    assert_eq!(group.instances.len(), 2);
    // tau is identical across members: no struct slot, literal text "1.0".
    assert!(!group.fields.iter().any(|f| f == "tau"));
    assert!(kernel.code.contains("(1.0)"));
    assert!(!kernel.code.contains("group.tau"));
}

#[test]
fn heterogeneous_parameter_gets_per_member_storage() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("p0", 10, 1.0));
    catalog.add_population(population("p1", 20, 2.0));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.groups.len(), 1);
    let group = &kernel.groups[0];
    let tau_ix = group
        .fields
        .iter()
        .position(|f| f == "tau")
        .expect("tau must occupy a struct slot");
    // Member order is group order; contents are the member values.
    assert_eq!(group.instances[0].values[tau_ix], "1.0");
    assert_eq!(group.instances[1].values[tau_ix], "2.0");
    assert!(kernel.code.contains("group.tau"));
}

#[test]
fn unreferenced_parameter_is_never_materialized() {
    // "ghost" differs across members but no code references it.
    let model = Arc::new(UnitModel {
        name: "ghostly".into(),
        param_names: vec!["ghost".into()],
        derived_params: vec![],
        vars: vec![VarDecl::new("V", "scalar")],
        extra_buffers: vec![],
        update_code: "$(V) += 1.0;".into(),
        event_condition_code: String::new(),
    });
    let mut catalog = Catalog::new();
    for (name, v) in [("p0", 1.0), ("p1", 2.0)] {
        let mut pop = population(name, 10, 0.0);
        pop.model = model.clone();
        pop.params = vec![v];
        pop.events_required = false;
        catalog.add_population(pop);
    }

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.groups.len(), 1);
    assert!(!kernel.groups[0].fields.iter().any(|f| f == "ghost"));
    assert!(!kernel.code.contains("ghost"));
}

#[test]
fn member_children_align_to_archetype_slots() {
    // Archetype children [drive, noise]; the second member supplies them in
    // the opposite order and must be realigned.
    let noise_source = |name: &str, sigma: f64| {
        let mut s = drive_source(name, sigma);
        s.model = Arc::new(tessera_model::AuxModel {
            name: "noise".into(),
            param_names: vec!["sigma".into()],
            derived_params: vec![],
            vars: vec![],
            extra_buffers: vec![],
            inject_code: "$(inflow) += $(sigma) * 0.5;".into(),
        });
        s
    };

    let mut p0 = population("p0", 10, 1.0);
    p0.aux_sources = vec![drive_source("p0drive", 1.0), noise_source("p0noise", 5.0)];
    let mut p1 = population("p1", 10, 1.0);
    p1.aux_sources = vec![noise_source("p1noise", 6.0), drive_source("p1drive", 2.0)];

    let mut catalog = Catalog::new();
    catalog.add_population(p0);
    catalog.add_population(p1);

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.groups.len(), 1, "reordered children must still merge");
    let group = &kernel.groups[0];
    // Slot 0 is the drive source: amp values in member order, drawn from
    // each member's own (reordered) child.
    let amp_ix = group
        .fields
        .iter()
        .position(|f| f == "ampAS0")
        .expect("slot-0 amp field");
    assert_eq!(group.instances[0].values[amp_ix], "1.0");
    assert_eq!(group.instances[1].values[amp_ix], "2.0");
    // Slot 1 is the noise source.
    let sigma_ix = group
        .fields
        .iter()
        .position(|f| f == "sigmaAS1")
        .expect("slot-1 sigma field");
    assert_eq!(group.instances[0].values[sigma_ix], "5.0");
    assert_eq!(group.instances[1].values[sigma_ix], "6.0");
}

#[test]
fn missing_child_prevents_merging() {
    // A member that cannot supply a compatible child for every archetype
    // slot must not share the archetype's group.
    let mut p0 = population("p0", 10, 1.0);
    p0.aux_sources = vec![drive_source("p0drive", 1.0), drive_source("p0extra", 3.0)];
    let mut p1 = population("p1", 10, 1.0);
    p1.aux_sources = vec![drive_source("p1drive", 2.0)];

    let mut catalog = Catalog::new();
    catalog.add_population(p0);
    catalog.add_population(p1);

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);
    assert_eq!(kernel.groups.len(), 2);
}

#[test]
fn duplicate_field_names_are_fatal() {
    // A state variable colliding with the built-in count field.
    let mut pop = population("p0", 10, 1.0);
    pop.model = Arc::new(UnitModel {
        name: "clash".into(),
        param_names: vec![],
        derived_params: vec![],
        vars: vec![VarDecl::new("numUnits", "scalar")],
        extra_buffers: vec![],
        update_code: "$(numUnits) += 1.0;".into(),
        event_condition_code: String::new(),
    });
    pop.events_required = false;
    pop.var_inits = vec![VarInit::constant(0.0)];
    pop.var_delayed = vec![false];

    let mut catalog = Catalog::new();
    catalog.add_population(pop);

    let backend = SimtBackend::new();
    let engine = Engine::new(
        &catalog,
        &backend,
        CodegenConfig::default(),
        StrategyRegistry::with_defaults(),
    );
    let err = engine.generate(KernelPhase::PopulationUpdate).unwrap_err();
    match err {
        CodegenError::DuplicateFieldName { field, .. } => assert_eq!(field, "numUnits"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn forward_kernel_reads_events_and_accumulates_atomically() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("src", 64, 1.0));
    catalog.add_population(population("tgt", 32, 1.0));
    add_projection(&mut catalog, projection("fwd", "src", "tgt", 0.5));

    let kernel = generate(&catalog, KernelPhase::ProjectionForward);

    assert_eq!(kernel.groups.len(), 1);
    assert!(kernel.code.contains("group.srcEvtCnt[0]"));
    assert!(kernel.code.contains("group.ind[synIdx]"));
    assert!(kernel
        .code
        .contains("atomicAddScalar(&group.acc[tgtUnit], group.g[synIdx]);"));
    // The body reaches buffers through the merged struct, so the kernel's
    // only argument is the struct-instance table.
    assert!(kernel.buffer_args.contains_key("d_mergedProjectionForwardGroup0"));
    assert_eq!(
        kernel.buffer_args.get("d_mergedProjectionForwardGroup0").map(String::as_str),
        Some("struct MergedProjectionForwardGroup0*")
    );
    // Per-member buffer addresses land in the host instantiation table.
    let row = &kernel.groups[0].instances[0];
    assert!(row.values.iter().any(|v| v == "d_accfwd"));
    assert!(row.values.iter().any(|v| v == "d_indfwd"));
    assert!(row.values.iter().any(|v| v == "d_gfwd"));
}

#[test]
fn update_kernel_emits_events_through_the_backend_atomic() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("p0", 10, 1.0));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert!(kernel
        .code
        .contains("const unsigned int evtIdx = atomic_add(&group.evtCnt[0], 1);"));
    assert!(kernel.code.contains("group.evt[evtIdx] = uid;"));
}

#[test]
fn init_kernel_multiplexes_population_and_connectivity_phases() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("src", 40, 1.0));
    catalog.add_population(population("tgt", 30, 1.0));
    add_projection(&mut catalog, projection("fwd", "src", "tgt", 0.5));

    let kernel = generate(&catalog, KernelPhase::Init);

    // Population seeding. The two populations do not merge for init (only
    // one has an inflow), so they dispatch as two blocks: pad(40) + pad(30).
    assert!(kernel.code.contains("group.V["));
    assert!(kernel.code.contains("= (0.0);"));
    // Connectivity build for the sparse projection follows in the same
    // body, after the population ranges: pad(40) source rows.
    assert!(kernel.code.contains("group.rowLength[uid] = 0;"));
    assert!(kernel.code.contains("group.ind[(uid * group.rowStride) + (group.rowLength[uid]++)]"));
    assert_eq!(kernel.total_lanes, 64 + 32 + 64);
}

#[test]
fn sparse_init_kernel_seeds_weights_row_wise() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("src", 40, 1.0));
    catalog.add_population(population("tgt", 30, 1.0));
    add_projection(&mut catalog, projection("fwd", "src", "tgt", 2.5));

    let kernel = generate(&catalog, KernelPhase::InitSparse);

    assert!(kernel.code.contains("if (uid < group.rowLength[i])"));
    assert!(kernel.code.contains("group.g[synIdx] = (2.5);"));
}

#[test]
fn generation_is_deterministic_byte_for_byte() {
    let build = || {
        let mut catalog = Catalog::new();
        let mut p0 = population("p0", 10, 1.0);
        p0.aux_sources = vec![drive_source("d0", 1.5)];
        catalog.add_population(p0);
        catalog.add_population(population("p1", 20, 2.0));
        catalog.add_population(population("src", 64, 1.0));
        add_projection(&mut catalog, projection("fwd", "src", "p1", 0.5));
        catalog
    };

    let a = generate_all(&build());
    let b = generate_all(&build());

    assert_eq!(a.len(), b.len());
    for (ka, kb) in a.iter().zip(&b) {
        assert_eq!(ka.code, kb.code);
        assert_eq!(ka.total_lanes, kb.total_lanes);
        assert_eq!(ka.buffer_args, kb.buffer_args);
        for (ga, gb) in ka.groups.iter().zip(&kb.groups) {
            assert_eq!(ga.definition, gb.definition);
            assert_eq!(ga.start_ids, gb.start_ids);
            for (ia, ib) in ga.instances.iter().zip(&gb.instances) {
                assert_eq!(ia.values, ib.values);
            }
        }
    }
}

#[test]
fn merged_members_pack_with_padded_start_ids() {
    let mut catalog = Catalog::new();
    catalog.add_population(population("p0", 10, 1.0));
    catalog.add_population(population("p1", 40, 1.0));

    let kernel = generate(&catalog, KernelPhase::PopulationUpdate);

    assert_eq!(kernel.groups.len(), 1);
    // p0 occupies [0,32), p1 [32,96); the group block spans 96 lanes.
    assert_eq!(kernel.groups[0].start_ids, vec![0, 32]);
    assert_eq!(kernel.total_lanes, 96);
    // Member resolution searches the start-id table.
    assert!(kernel
        .buffer_args
        .contains_key("d_mergedPopulationUpdateGroup0StartID"));
}
