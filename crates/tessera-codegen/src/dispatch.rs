//! Parallel dispatch planning: packing merged groups into one kernel body.
//!
//! Groups are laid back-to-back along the lane axis, each padded to the
//! backend's execution width. Packing variable-sized groups contiguously
//! (rather than one fixed-size block per group) wastes no lanes on small
//! groups and confines per-group divergence to a single entry predicate per
//! lane.

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use tessera_model::Named;

use crate::backend::{Backend, KernelPhase};
use crate::emit::{CodeWriter, Substitutions};
use crate::error::{CodegenError, Result};
use crate::fields::BufferRegistry;
use crate::merge::MergedGroup;

/// Owns the running lane cursor and the kernel-wide external-buffer map for
/// one generated body. Several logical phases may multiplex into the body
/// through sequential [`plan`](DispatchPlanner::plan) calls.
pub struct DispatchPlanner<'b, B: Backend + ?Sized> {
    backend: &'b B,
    phase: KernelPhase,
    id_start: usize,
    buffer_refs: IndexMap<String, String>,
    token_pattern: Regex,
}

impl<'b, B: Backend + ?Sized> DispatchPlanner<'b, B> {
    pub fn new(backend: &'b B, phase: KernelPhase) -> Self {
        let token_pattern =
            Regex::new(&backend.buffer_token_pattern()).expect("backend token pattern is valid");
        Self {
            backend,
            phase,
            id_start: 0,
            buffer_refs: IndexMap::new(),
            token_pattern,
        }
    }

    /// Total lane requirement so far: the final cursor equals the sum of the
    /// padded group sizes.
    pub fn total_lanes(&self) -> usize {
        self.id_start
    }

    /// Deduplicated name → declared-type map of every external buffer the
    /// emitted bodies referenced.
    pub fn buffer_refs(&self) -> &IndexMap<String, String> {
        &self.buffer_refs
    }

    pub fn into_buffer_refs(self) -> IndexMap<String, String> {
        self.buffer_refs
    }

    /// Emit one guarded dispatch block per eligible group, in the given
    /// (canonical) order, which is the order the struct layouts were built in,
    /// so dispatch indices and struct member indices agree.
    ///
    /// An empty eligible set emits nothing and leaves the cursor unchanged.
    pub fn plan<T, S, G, H>(
        &mut self,
        w: &mut CodeWriter,
        subs: &Substitutions<'_>,
        groups: &[MergedGroup<'_, T>],
        registry: &BufferRegistry,
        unpadded_size: S,
        filter: G,
        mut emit_body: H,
    ) -> Result<()>
    where
        T: Named,
        S: Fn(&MergedGroup<'_, T>) -> usize,
        G: Fn(&MergedGroup<'_, T>) -> bool,
        H: FnMut(&mut CodeWriter, &MergedGroup<'_, T>, &Substitutions<'_>) -> Result<()>,
    {
        for group in groups.iter().filter(|g| filter(g)) {
            let padded = self.backend.padded_size(self.phase, unpadded_size(group));
            let label = format!(
                "merged group {} (archetype '{}')",
                group.index(),
                group.archetype().name()
            );
            w.line(&format!("// {}", label));

            let mut group_subs = Substitutions::with_parent(subs);
            let head = if self.id_start == 0 {
                // The common first-group case stays branch-free: the lane id
                // is the local id directly, no subtraction emitted.
                group_subs.add_var("id", "id");
                format!("if (id < {})", padded)
            } else {
                group_subs.add_var("id", "lid");
                format!(
                    "if (id >= {} && id < {})",
                    self.id_start,
                    self.id_start + padded
                )
            };

            let mut body = CodeWriter::new();
            if self.id_start != 0 {
                body.line(&format!(
                    "const unsigned int lid = id - {};",
                    self.id_start
                ));
            }
            emit_body(&mut body, group, &group_subs)?;
            let body = body.into_string();

            self.collect_buffer_refs(&body, registry, &label)?;

            w.block(&head, |w| w.raw(&indent_fragment(&body)));
            debug!(
                phase = ?self.phase,
                group = group.index(),
                range_start = self.id_start,
                range_len = padded,
                "dispatch block planned"
            );
            self.id_start += padded;
        }
        Ok(())
    }

    /// Resolve every device-buffer token in `body` against the declared
    /// registry; unknown tokens are fatal.
    fn collect_buffer_refs(
        &mut self,
        body: &str,
        registry: &BufferRegistry,
        group_label: &str,
    ) -> Result<()> {
        for m in self.token_pattern.find_iter(body) {
            let token = m.as_str();
            if self.buffer_refs.contains_key(token) {
                continue;
            }
            match registry.declared_type(token) {
                Some(ty) => {
                    self.buffer_refs.insert(token.to_string(), ty.to_string());
                }
                None => {
                    let fragment = body
                        .lines()
                        .find(|l| l.contains(token))
                        .unwrap_or(token)
                        .trim()
                        .to_string();
                    return Err(CodegenError::UnresolvedExternalReference {
                        token: token.to_string(),
                        fragment,
                        group: group_label.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Re-indent a pre-rendered fragment one level for inclusion in a block.
pub(crate) fn indent_fragment(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for l in body.lines() {
        if l.is_empty() {
            out.push('\n');
        } else {
            out.push_str("    ");
            out.push_str(l);
            out.push('\n');
        }
    }
    out
}
