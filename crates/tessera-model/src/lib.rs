//! Tessera entity catalog: the immutable model contract.
//!
//! The front end produces a [`Catalog`] of populations, projections and
//! auxiliary sources; the code generator consumes it read-only. Descriptors
//! carry the structural attributes (model content, flags, connectivity
//! storage) that decide whether two entities can share one generated kernel
//! body, and the numeric parameter values that populate the shared body's
//! per-instance data.
//!
//! Merge predicates live here, next to the data they inspect. They are
//! equivalence tests over structural attributes only; parameter *values*
//! never participate.

mod aux_source;
mod catalog;
mod model;
mod population;
mod projection;

pub use aux_source::AuxSourceDescriptor;
pub use catalog::Catalog;
pub use model::{
    is_pointer_ty, AuxModel, BufferDecl, ConnectivityInit, CouplingModel, DerivedParam,
    InitSnippet, UnitModel, VarDecl, VarInit,
};
pub use population::PopulationDescriptor;
pub use projection::{Connectivity, ProjectionDescriptor, Weights};

/// Entities addressable by unique name. Names drive canonical ordering,
/// generated buffer naming and diagnostics.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for PopulationDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ProjectionDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for AuxSourceDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
}

/// True iff every element of `ours` can be matched against a distinct,
/// predicate-compatible element of `theirs`.
///
/// Children of composite entities are unordered at the catalog level; two
/// parents are mergeable only if such a matching exists for every child kind.
pub fn compatible_unordered<T, F>(ours: &[&T], theirs: &[&T], can_merge: F) -> bool
where
    F: Fn(&T, &T) -> bool,
{
    if ours.len() != theirs.len() {
        return false;
    }
    let mut remaining: Vec<&T> = theirs.to_vec();
    for a in ours {
        match remaining.iter().position(|b| can_merge(a, b)) {
            Some(i) => {
                remaining.swap_remove(i);
            }
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::compatible_unordered;

    #[test]
    fn compatible_unordered_matches_permutations() {
        let ours = [&1, &2, &3];
        let theirs = [&3, &1, &2];
        assert!(compatible_unordered(&ours, &theirs, |a, b| a == b));
    }

    #[test]
    fn compatible_unordered_rejects_length_mismatch() {
        let ours = [&1, &2];
        let theirs = [&1];
        assert!(!compatible_unordered(&ours, &theirs, |a, b| a == b));
    }

    #[test]
    fn compatible_unordered_consumes_each_match_once() {
        // Two of ours both match the single 1 in theirs; the second must fail.
        let ours = [&1, &1];
        let theirs = [&1, &2];
        assert!(!compatible_unordered(&ours, &theirs, |a, b| a == b));
    }
}
