//! Child ordering: aligning each member's children with the archetype's.
//!
//! A composite entity's children (a population's incident projections, its
//! auxiliary sources) are unordered at the catalog level. The shared body is
//! laid out against the archetype's child order, so every member's child
//! list must be permuted to put a compatible child at every archetype slot.

use crate::error::{CodegenError, Result};
use crate::merge::MergedGroup;

use tessera_model::Named;

/// For each member of `group`, the member's children reordered so slot `i`
/// is predicate-compatible with the archetype's child `i`.
///
/// Children are individually identifiable (by target-entity name and model),
/// so a greedy first-unused-compatible match suffices; no backtracking
/// search is performed. Fails if any member cannot fill a slot; slots are
/// never dropped or left unmatched.
pub fn order_children<'a, T, C, A, P>(
    group: &MergedGroup<'a, T>,
    kind: &str,
    accessor: A,
    can_merge: P,
) -> Result<Vec<Vec<&'a C>>>
where
    T: Named,
    C: Named,
    A: Fn(&'a T) -> Vec<&'a C>,
    P: Fn(&C, &C) -> bool,
{
    let archetype_children = accessor(group.archetype());
    let mut sorted = Vec::with_capacity(group.len());

    for member in group.members().iter().copied() {
        let children = accessor(member);
        if children.len() != archetype_children.len() {
            return Err(CodegenError::StructuralMismatch {
                kind: kind.to_string(),
                archetype: group.archetype().name().to_string(),
                member: member.name().to_string(),
                slot: children.len().min(archetype_children.len()),
            });
        }

        let mut used = vec![false; children.len()];
        let mut row = Vec::with_capacity(archetype_children.len());
        for (slot, archetype_child) in archetype_children.iter().enumerate() {
            let found = children
                .iter()
                .enumerate()
                .find(|(i, c)| !used[*i] && can_merge(archetype_child, c));
            match found {
                Some((i, c)) => {
                    used[i] = true;
                    row.push(*c);
                }
                None => {
                    return Err(CodegenError::StructuralMismatch {
                        kind: kind.to_string(),
                        archetype: group.archetype().name().to_string(),
                        member: member.name().to_string(),
                        slot,
                    });
                }
            }
        }
        sorted.push(row);
    }

    Ok(sorted)
}
