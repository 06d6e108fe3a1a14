//! Group merging: partitioning catalog entities into merged groups.
//!
//! Entities arrive in canonical name order. Each is tested against the
//! archetype of every open group under the role's merge predicate and joins
//! the first match, else opens a new group. The result is index-stable
//! across runs on identical input, which the generated text depends on.

use tracing::debug;

use tessera_model::Named;

/// A set of structurally-equivalent entities sharing one generated body.
///
/// The first member is the archetype: the structural template every other
/// member was tested against. Member order is fixed at creation.
#[derive(Debug)]
pub struct MergedGroup<'a, T> {
    index: usize,
    members: Vec<&'a T>,
}

impl<'a, T> MergedGroup<'a, T> {
    fn new(index: usize, first: &'a T) -> Self {
        Self {
            index,
            members: vec![first],
        }
    }

    /// Position of this group in the merged-group list for its kind/role.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The canonical member whose configuration shapes the shared body.
    pub fn archetype(&self) -> &'a T {
        self.members[0]
    }

    pub fn members(&self) -> &[&'a T] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True if `extract` yields a value differing from the archetype's for
    /// any member. Exact equality; no tolerance.
    pub fn is_param_value_heterogeneous(&self, extract: impl Fn(&T, usize) -> f64) -> bool {
        let first = extract(self.archetype(), 0);
        self.members
            .iter()
            .enumerate()
            .any(|(i, m)| extract(m, i) != first)
    }
}

/// Partition `entities` (already in canonical order) into merged groups.
pub fn merge_groups<'a, T, I, F>(kind: &str, entities: I, can_merge: F) -> Vec<MergedGroup<'a, T>>
where
    T: Named,
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T, &T) -> bool,
{
    let mut groups: Vec<MergedGroup<'a, T>> = Vec::new();
    for entity in entities {
        match groups
            .iter_mut()
            .find(|g| can_merge(entity, g.archetype()))
        {
            Some(group) => group.members.push(entity),
            None => groups.push(MergedGroup::new(groups.len(), entity)),
        }
    }
    for g in &groups {
        debug!(
            kind,
            group = g.index(),
            archetype = %g.archetype().name(),
            members = g.len(),
            "merged group formed"
        );
    }
    groups
}
