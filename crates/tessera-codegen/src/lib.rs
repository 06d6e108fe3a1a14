//! Tessera code generation: the merging and heterogeneous-field engine.
//!
//! Turns an immutable entity catalog into merged kernel bodies for a SIMT
//! backend:
//!
//! Catalog → merge (structural equivalence) → child ordering → heterogeneity
//! analysis + field layout → dispatch planning → emitted text + host
//! instantiation tables.
//!
//! The engine is single-pass and purely functional over the catalog; a
//! compilation either completes or fails with a [`CodegenError`] carrying
//! the offending entity. Two runs over the same catalog produce byte-equal
//! output.

pub mod backend;
pub mod dispatch;
pub mod emit;
pub mod error;
pub mod fields;
pub mod groups;
pub mod hetero;
pub mod merge;
pub mod order;
pub mod phases;

pub use backend::{
    Backend, ForwardStrategy, KernelPhase, LaneRole, SourceSpanStrategy, StrategyRegistry,
    TargetSpanStrategy,
};
pub use dispatch::DispatchPlanner;
pub use emit::{precise_literal, CodeWriter, Substitutions};
pub use error::{CodegenError, Result};
pub use fields::{BufferRegistry, Field, FieldStorage, LayoutBuilder, MemberValues, StructLayout};
pub use hetero::Heterogeneity;
pub use merge::{merge_groups, MergedGroup};
pub use order::order_children;
pub use phases::{CodegenConfig, Engine, GeneratedKernel, HostGroupData};
