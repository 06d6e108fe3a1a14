//! Heterogeneity analysis for merged-group parameters.
//!
//! A parameter only earns per-instance storage when two things hold: the
//! consumed code actually references it, and its value differs across the
//! group's members. Unreferenced parameters are never materialized at all,
//! whatever their values.

use crate::merge::MergedGroup;

/// Classification of one (group, parameter) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Heterogeneity {
    /// The placeholder token is absent from the consumed code; no field.
    NotReferenced,
    /// Every member extracts the identical value; eligible for literal
    /// embedding.
    Homogeneous(f64),
    /// Values differ; requires one slot per member.
    Heterogeneous,
}

/// True iff `code` contains the exact placeholder token for `name`.
///
/// The token form is `$(name)`; suffixed cross-entity tokens are distinct
/// names (`name_src`, `name_tgt`) and must be checked under the suffixed
/// spelling.
pub fn is_referenced(code: &str, name: &str) -> bool {
    code.contains(&format!("$({})", name))
}

/// Classify a parameter across a merged group's members.
///
/// `extract` receives each member together with its position in the group.
/// Values compare by exact equality only.
pub fn analyze<T>(
    group: &MergedGroup<'_, T>,
    name: &str,
    code: &str,
    extract: impl Fn(&T, usize) -> f64,
) -> Heterogeneity {
    if !is_referenced(code, name) {
        return Heterogeneity::NotReferenced;
    }
    let first = extract(group.archetype(), 0);
    let varies = group
        .members()
        .iter()
        .enumerate()
        .any(|(i, m)| extract(m, i) != first);
    if varies {
        Heterogeneity::Heterogeneous
    } else {
        Heterogeneity::Homogeneous(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_groups;
    use tessera_model::Named;

    struct Ent {
        name: String,
        tau: f64,
    }

    impl Named for Ent {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn group_of(taus: &[f64]) -> Vec<Ent> {
        taus.iter()
            .enumerate()
            .map(|(i, t)| Ent {
                name: format!("p{}", i),
                tau: *t,
            })
            .collect()
    }

    #[test]
    fn unreferenced_param_is_never_materialized() {
        let ents = group_of(&[1.0, 2.0]);
        let groups = merge_groups("test", ents.iter(), |_, _| true);
        let h = analyze(&groups[0], "tau", "$(V) += 1.0;", |e, _| e.tau);
        assert_eq!(h, Heterogeneity::NotReferenced);
    }

    #[test]
    fn identical_values_are_homogeneous() {
        let ents = group_of(&[1.0, 1.0]);
        let groups = merge_groups("test", ents.iter(), |_, _| true);
        let h = analyze(&groups[0], "tau", "$(V) /= $(tau);", |e, _| e.tau);
        assert_eq!(h, Heterogeneity::Homogeneous(1.0));
    }

    #[test]
    fn differing_values_are_heterogeneous() {
        let ents = group_of(&[1.0, 2.0]);
        let groups = merge_groups("test", ents.iter(), |_, _| true);
        let h = analyze(&groups[0], "tau", "$(V) /= $(tau);", |e, _| e.tau);
        assert_eq!(h, Heterogeneity::Heterogeneous);
    }

    #[test]
    fn reference_check_is_exact_token_match() {
        // "tau" appearing inside another token is not a reference.
        assert!(!is_referenced("$(tauRise)", "tau"));
        assert!(is_referenced("$(tau)", "tau"));
        // Suffixed access is a distinct token.
        assert!(!is_referenced("$(V_src)", "V"));
        assert!(is_referenced("$(V_src)", "V_src"));
    }
}
