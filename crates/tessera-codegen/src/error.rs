//! Code-generation errors.
//!
//! All failures are fatal: the compiler is deterministic, so identical input
//! reproduces the identical failure. Every variant carries enough context
//! for the model author to locate the offending entity.

use thiserror::Error;

/// Codegen result type.
pub type Result<T> = std::result::Result<T, CodegenError>;

/// Errors raised while merging groups, building layouts or planning dispatch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    /// A member of a merged group cannot supply a child compatible with the
    /// archetype's child at `slot`.
    #[error("{kind} child mismatch in group of '{archetype}': member '{member}' has no child compatible with archetype slot {slot}")]
    StructuralMismatch {
        kind: String,
        archetype: String,
        member: String,
        slot: usize,
    },

    /// Two fields with the same name were added to one merged layout.
    #[error("duplicate field '{field}' in merged layout '{group}'")]
    DuplicateFieldName { field: String, group: String },

    /// Generated code references an external buffer that no field or backend
    /// declared.
    #[error("unresolved external reference '{token}' in '{group}': {fragment}")]
    UnresolvedExternalReference {
        token: String,
        fragment: String,
        group: String,
    },

    /// No registered dispatch strategy accepts the projection.
    #[error("no dispatch strategy applicable to projection '{projection}'")]
    NoApplicableStrategy { projection: String },

    /// The catalog contract was violated: an entity references a name the
    /// catalog does not hold.
    #[error("unknown {kind} '{name}' referenced from the catalog")]
    UnknownEntity { kind: String, name: String },
}
