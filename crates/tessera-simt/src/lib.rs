//! Reference SIMT backend.
//!
//! Implements the engine's capability interface for an OpenCL-flavoured
//! compute target: per-phase work-group sizes, `d_` device naming, an
//! emulated floating-point atomic add and clEnqueue transfer snippets.

use tessera_codegen::backend::{Backend, KernelPhase};
use tessera_codegen::emit::CodeWriter;

/// Work-group sizing and naming preferences for the SIMT backend.
#[derive(Debug, Clone)]
pub struct SimtConfig {
    /// Lanes per execution block, per kernel phase.
    pub work_group_sizes: [usize; 8],
    /// Prefix of device-resident array names.
    pub buffer_prefix: String,
    /// Prefix of device-resident scalar symbols.
    pub scalar_prefix: String,
    /// Whether generated population bodies may draw from per-unit RNG
    /// streams.
    pub population_rng: bool,
}

impl Default for SimtConfig {
    fn default() -> Self {
        Self {
            work_group_sizes: [32; 8],
            buffer_prefix: "d_".into(),
            scalar_prefix: "d_".into(),
            population_rng: true,
        }
    }
}

/// The reference SIMT backend.
#[derive(Debug, Clone, Default)]
pub struct SimtBackend {
    config: SimtConfig,
}

impl SimtBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SimtConfig) -> Self {
        Self { config }
    }

    fn phase_index(phase: KernelPhase) -> usize {
        match phase {
            KernelPhase::PopulationQueueUpdate => 0,
            KernelPhase::AccQueueUpdate => 1,
            KernelPhase::PopulationUpdate => 2,
            KernelPhase::ProjectionForward => 3,
            KernelPhase::ProjectionBackward => 4,
            KernelPhase::ProjectionDynamics => 5,
            KernelPhase::Init => 6,
            KernelPhase::InitSparse => 7,
        }
    }
}

impl Backend for SimtBackend {
    fn execution_width(&self, phase: KernelPhase) -> usize {
        self.config.work_group_sizes[Self::phase_index(phase)]
    }

    fn device_buffer_prefix(&self) -> &str {
        &self.config.buffer_prefix
    }

    fn device_scalar_prefix(&self) -> &str {
        &self.config.scalar_prefix
    }

    fn population_rng_required(&self) -> bool {
        self.config.population_rng
    }

    fn rng_state_ty(&self) -> &str {
        "clrngLfsr113Stream"
    }

    fn atomic_add_fn(&self, ty: &str) -> String {
        match ty {
            "float" | "double" | "scalar" => "atomicAddScalar".to_string(),
            _ => "atomic_add".to_string(),
        }
    }

    fn lane_id_expr(&self) -> String {
        "get_global_id(0)".to_string()
    }

    fn kernel_qualifier(&self) -> &str {
        "__kernel"
    }

    fn global_qualifier(&self) -> &str {
        "__global"
    }

    fn gen_push(&self, w: &mut CodeWriter, name: &str, ty: &str, count: usize) {
        w.line(&format!(
            "CHECK_CL(clEnqueueWriteBuffer(queue, {}{}, CL_TRUE, 0, {} * sizeof({}), {}, 0, NULL, NULL));",
            self.config.buffer_prefix, name, count, ty, name
        ));
    }

    fn gen_pull(&self, w: &mut CodeWriter, name: &str, ty: &str, count: usize) {
        w.line(&format!(
            "CHECK_CL(clEnqueueReadBuffer(queue, {}{}, CL_TRUE, 0, {} * sizeof({}), {}, 0, NULL, NULL));",
            self.config.buffer_prefix, name, count, ty, name
        ));
    }
}

/// The emulated floating-point atomic add the generated kernels call.
pub const ATOMIC_ADD_SCALAR: &str = r#"
inline void atomicAddScalar(volatile __global float *addr, float val) {
    union {
        unsigned int u32;
        float f32;
    } next, expected, current;
    current.f32 = *addr;
    do {
        expected.f32 = current.f32;
        next.f32 = expected.f32 + val;
        current.u32 = atomic_cmpxchg((volatile __global unsigned int *)addr,
                                     expected.u32, next.u32);
    } while (current.u32 != expected.u32);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_the_phase_width() {
        let backend = SimtBackend::new();
        let phase = KernelPhase::PopulationUpdate;
        assert_eq!(backend.padded_size(phase, 10), 32);
        assert_eq!(backend.padded_size(phase, 32), 32);
        assert_eq!(backend.padded_size(phase, 33), 64);
        assert_eq!(backend.padded_size(phase, 0), 0);
    }

    #[test]
    fn per_phase_widths_are_independent() {
        let mut config = SimtConfig::default();
        config.work_group_sizes[2] = 64;
        let backend = SimtBackend::with_config(config);
        assert_eq!(backend.execution_width(KernelPhase::PopulationUpdate), 64);
        assert_eq!(backend.execution_width(KernelPhase::Init), 32);
    }

    #[test]
    fn float_atomics_use_the_emulated_add() {
        let backend = SimtBackend::new();
        assert_eq!(backend.atomic_add_fn("float"), "atomicAddScalar");
        assert_eq!(backend.atomic_add_fn("unsigned int"), "atomic_add");
    }
}
