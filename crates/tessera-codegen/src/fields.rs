//! Field accumulation and merged-struct layout.
//!
//! A merged group's shared body reads its data through one generated struct.
//! The builder accumulates typed fields in insertion order from the
//! archetype's configuration; only values vary per member. Fields holding a
//! value identical across all members collapse to literals embedded in the
//! generated text, which costs no runtime memory traffic and lets the target
//! compiler fold them.

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use tessera_model::{is_pointer_ty, BufferDecl, DerivedParam, Named, VarDecl, VarInit};

use crate::emit::precise_literal;
use crate::error::{CodegenError, Result};
use crate::hetero::{self, Heterogeneity};
use crate::merge::MergedGroup;

/// Storage class of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    /// Compile-time constant text shared by all members; no struct slot.
    Literal,
    /// One runtime slot per member in the merged struct.
    PerInstanceArray,
    /// Device pointer, name-templated per member.
    ExternalPointer,
}

/// One field of a merged layout, with its per-member value texts already
/// evaluated (a single text for literals).
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: String,
    pub storage: FieldStorage,
    pub values: Vec<String>,
}

impl Field {
    pub fn is_runtime(&self) -> bool {
        self.storage != FieldStorage::Literal
    }
}

/// Declared external buffers: name → type. First declaration wins; order is
/// insertion order and output-visible.
#[derive(Debug, Clone, Default)]
pub struct BufferRegistry {
    map: IndexMap<String, String>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: impl Into<String>) {
        self.map.entry(name.into()).or_insert_with(|| ty.into());
    }

    pub fn declared_type(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn merge(&mut self, other: &BufferRegistry) {
        for (n, t) in &other.map {
            self.declare(n.clone(), t.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Host-side value table for one member's struct instance.
#[derive(Debug, Clone, Serialize)]
pub struct MemberValues {
    pub member: String,
    pub values: Vec<String>,
}

/// A finished merged-group layout: the generated struct declaration, the
/// per-member instantiation tables, and every buffer the fields declared.
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub struct_name: String,
    pub fields: Vec<Field>,
    pub instances: Vec<MemberValues>,
    pub buffers: BufferRegistry,
}

impl StructLayout {
    /// Fields occupying struct slots, in declaration order.
    pub fn runtime_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_runtime())
    }

    /// Generated struct declaration. Pointer members carry the backend's
    /// device-memory qualifier.
    pub fn definition(&self, global_qualifier: &str) -> String {
        let mut out = format!("struct {} {{\n", self.struct_name);
        for f in self.runtime_fields() {
            if is_pointer_ty(&f.ty) && !global_qualifier.is_empty() {
                out.push_str(&format!("    {} {} {};\n", global_qualifier, f.ty, f.name));
            } else {
                out.push_str(&format!("    {} {};\n", f.ty, f.name));
            }
        }
        out.push_str("};\n");
        out
    }

    /// In-body expression reading `name`: the parenthesized literal text, or
    /// a member access on the loaded struct instance.
    pub fn accessor(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|f| f.name == name).map(|f| {
            if f.storage == FieldStorage::Literal {
                format!("({})", f.values[0])
            } else {
                format!("group.{}", f.name)
            }
        })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// Accumulates the ordered field list for one merged group.
pub struct LayoutBuilder<'g, 'a, T: Named> {
    group: &'g MergedGroup<'a, T>,
    struct_name: String,
    label: String,
    scalar_ty: String,
    fields: Vec<Field>,
    buffers: BufferRegistry,
}

impl<'g, 'a, T: Named> LayoutBuilder<'g, 'a, T> {
    pub fn new(group: &'g MergedGroup<'a, T>, struct_name: impl Into<String>, scalar_ty: &str) -> Self {
        let struct_name = struct_name.into();
        let label = format!("{} (archetype '{}')", struct_name, group.archetype().name());
        Self {
            group,
            struct_name,
            label,
            scalar_ty: scalar_ty.to_string(),
            fields: Vec::new(),
            buffers: BufferRegistry::new(),
        }
    }

    pub fn group(&self) -> &'g MergedGroup<'a, T> {
        self.group
    }

    pub fn scalar_ty(&self) -> &str {
        &self.scalar_ty
    }

    fn push(&mut self, field: Field) -> Result<()> {
        if self.fields.iter().any(|f| f.name == field.name) {
            return Err(CodegenError::DuplicateFieldName {
                field: field.name,
                group: self.label.clone(),
            });
        }
        self.fields.push(field);
        Ok(())
    }

    /// Append a field with explicit per-member values. Pointer-typed fields
    /// are external references and register their buffer names; value-typed
    /// fields get one slot per member.
    pub fn add_field(
        &mut self,
        ty: &str,
        name: &str,
        value: impl Fn(&T, usize) -> String,
    ) -> Result<()> {
        let values: Vec<String> = self
            .group
            .members()
            .iter()
            .enumerate()
            .map(|(i, m)| value(m, i))
            .collect();
        let storage = if is_pointer_ty(ty) {
            for v in &values {
                self.buffers.declare(v.clone(), ty.to_string());
            }
            FieldStorage::ExternalPointer
        } else {
            FieldStorage::PerInstanceArray
        };
        self.push(Field {
            name: name.to_string(),
            ty: ty.to_string(),
            storage,
            values,
        })
    }

    /// Append an external-pointer field whose per-member buffer name is
    /// `name_prefix + member_name`.
    pub fn add_pointer_field(&mut self, elem_ty: &str, name: &str, name_prefix: &str) -> Result<()> {
        let prefix = name_prefix.to_string();
        self.add_field(&format!("{}*", elem_ty), name, |m, _| {
            format!("{}{}", prefix, m.name())
        })
    }

    /// Append a literal field: constant text shared by all members.
    pub fn add_literal_field(&mut self, ty: &str, name: &str, text: impl Into<String>) -> Result<()> {
        self.push(Field {
            name: name.to_string(),
            ty: ty.to_string(),
            storage: FieldStorage::Literal,
            values: vec![text.into()],
        })
    }

    /// Append a scalar parameter field, consulting the heterogeneity
    /// analyzer: unreferenced parameters are omitted entirely, homogeneous
    /// values embed as literals, heterogeneous values get per-member slots.
    ///
    /// `ref_name` is the placeholder token checked against `code`; it can
    /// differ from the field name when the field is disambiguated (child
    /// slot suffixes, initialiser params).
    pub fn add_scalar_field(
        &mut self,
        field_name: &str,
        ref_name: &str,
        code: &str,
        extract: impl Fn(&T, usize) -> f64,
    ) -> Result<()> {
        match hetero::analyze(self.group, ref_name, code, &extract) {
            Heterogeneity::NotReferenced => Ok(()),
            Heterogeneity::Homogeneous(v) => {
                let ty = self.scalar_ty.clone();
                self.add_literal_field(&ty, field_name, precise_literal(v))
            }
            Heterogeneity::Heterogeneous => {
                let values: Vec<String> = self
                    .group
                    .members()
                    .iter()
                    .enumerate()
                    .map(|(i, m)| precise_literal(extract(m, i)))
                    .collect();
                let ty = self.scalar_ty.clone();
                self.push(Field {
                    name: field_name.to_string(),
                    ty,
                    storage: FieldStorage::PerInstanceArray,
                    values,
                })
            }
        }
    }

    /// One scalar field per model parameter referenced in `code`.
    pub fn add_heterogeneous_params<F>(
        &mut self,
        names: &[String],
        code: &str,
        extract: F,
    ) -> Result<()>
    where
        F: Fn(&T) -> &[f64] + Copy,
    {
        for (i, name) in names.iter().enumerate() {
            self.add_scalar_field(name, name, code, move |m, _| extract(m)[i])?;
        }
        Ok(())
    }

    /// One scalar field per derived parameter referenced in `code`.
    pub fn add_heterogeneous_derived_params<F>(
        &mut self,
        derived: &[DerivedParam],
        code: &str,
        extract: F,
    ) -> Result<()>
    where
        F: Fn(&T) -> &[f64] + Copy,
    {
        for (i, dp) in derived.iter().enumerate() {
            self.add_scalar_field(&dp.name, &dp.name, code, move |m, _| extract(m)[i])?;
        }
        Ok(())
    }

    /// One external-pointer field per declared state variable, buffer name
    /// `prefix + var_name + member_name`.
    pub fn add_vars(&mut self, vars: &[VarDecl], prefix: &str) -> Result<()> {
        for v in vars {
            self.add_pointer_field(&v.ty, &v.name, &format!("{}{}", prefix, v.name))?;
        }
        Ok(())
    }

    /// Heterogeneous initialiser parameters for every variable: field
    /// `param_name + var_name`, reference-checked against the archetype's
    /// initialiser snippet.
    pub fn add_var_init_params<F>(&mut self, vars: &[VarDecl], extract: F) -> Result<()>
    where
        F: Fn(&T) -> &[VarInit] + Copy,
    {
        let arch_inits = extract(self.group.archetype());
        for (vi, var) in vars.iter().enumerate() {
            let snippet = arch_inits[vi].snippet.clone();
            for (pi, pname) in snippet.param_names.iter().enumerate() {
                self.add_scalar_field(
                    &format!("{}{}", pname, var.name),
                    pname,
                    &snippet.code,
                    move |m, _| extract(m)[vi].params[pi],
                )?;
            }
            for (pi, dp) in snippet.derived_params.iter().enumerate() {
                self.add_scalar_field(
                    &format!("{}{}", dp.name, var.name),
                    &dp.name,
                    &snippet.code,
                    move |m, _| extract(m)[vi].derived_param_values[pi],
                )?;
            }
        }
        Ok(())
    }

    /// One field per declared external buffer. Pointer-typed buffers become
    /// device pointers templated per member; value-typed buffers get a slot
    /// per member referencing the host symbol.
    pub fn add_external_buffers(&mut self, buffers: &[BufferDecl], prefix: &str) -> Result<()> {
        for b in buffers {
            if is_pointer_ty(&b.ty) {
                let name_prefix = format!("{}{}", prefix, b.name);
                let ty = b.ty.clone();
                let name = b.name.clone();
                self.add_field(&ty, &name, |m, _| format!("{}{}", name_prefix, m.name()))?;
            } else {
                let name = b.name.clone();
                let sym = name.clone();
                self.add_field(&b.ty, &name, |m, _| format!("{}{}", sym, m.name()))?;
            }
        }
        Ok(())
    }

    /// Register an external buffer the fields reference indirectly (merged
    /// struct arrays, start-id tables).
    pub fn declare_buffer(&mut self, name: impl Into<String>, ty: impl Into<String>) {
        self.buffers.declare(name, ty);
    }

    /// Finalize: field order is insertion order, values are already
    /// evaluated per member.
    pub fn finish(self) -> StructLayout {
        let instances = self
            .group
            .members()
            .iter()
            .enumerate()
            .map(|(i, m)| MemberValues {
                member: m.name().to_string(),
                values: self
                    .fields
                    .iter()
                    .filter(|f| f.is_runtime())
                    .map(|f| f.values[i].clone())
                    .collect(),
            })
            .collect();
        debug!(
            layout = %self.struct_name,
            fields = self.fields.len(),
            buffers = self.buffers.len(),
            "layout finalized"
        );
        StructLayout {
            struct_name: self.struct_name,
            fields: self.fields,
            instances,
            buffers: self.buffers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_groups;

    struct Pop {
        name: String,
        count: u32,
        tau: f64,
    }

    impl Named for Pop {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn pops(taus: &[f64]) -> Vec<Pop> {
        taus.iter()
            .enumerate()
            .map(|(i, t)| Pop {
                name: format!("pop{}", i),
                count: 10 * (i as u32 + 1),
                tau: *t,
            })
            .collect()
    }

    #[test]
    fn homogeneous_scalar_becomes_literal() {
        let ps = pops(&[1.0, 1.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_scalar_field("tau", "tau", "$(V) /= $(tau);", |p, _| p.tau)
            .unwrap();
        let layout = b.finish();

        assert_eq!(layout.fields.len(), 1);
        assert_eq!(layout.fields[0].storage, FieldStorage::Literal);
        assert_eq!(layout.fields[0].values, ["1.0"]);
        // No per-instance slot is allocated.
        assert!(layout.instances.iter().all(|i| i.values.is_empty()));
        assert_eq!(layout.accessor("tau").unwrap(), "(1.0)");
    }

    #[test]
    fn heterogeneous_scalar_gets_one_slot_per_member() {
        let ps = pops(&[1.0, 2.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_scalar_field("tau", "tau", "$(V) /= $(tau);", |p, _| p.tau)
            .unwrap();
        let layout = b.finish();

        assert_eq!(layout.fields[0].storage, FieldStorage::PerInstanceArray);
        assert_eq!(layout.fields[0].values, ["1.0", "2.0"]);
        assert_eq!(layout.instances[0].values, ["1.0"]);
        assert_eq!(layout.instances[1].values, ["2.0"]);
        assert_eq!(layout.accessor("tau").unwrap(), "group.tau");
    }

    #[test]
    fn unreferenced_scalar_is_omitted_even_when_values_differ() {
        let ps = pops(&[1.0, 2.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_scalar_field("tau", "tau", "$(V) += 1.0;", |p, _| p.tau)
            .unwrap();
        let layout = b.finish();
        assert!(layout.fields.is_empty());
    }

    #[test]
    fn pointer_fields_register_their_buffers() {
        let ps = pops(&[1.0, 1.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_pointer_field("scalar", "V", "d_V").unwrap();
        let layout = b.finish();

        assert_eq!(layout.instances[0].values, ["d_Vpop0"]);
        assert_eq!(layout.instances[1].values, ["d_Vpop1"]);
        assert_eq!(layout.buffers.declared_type("d_Vpop0"), Some("scalar*"));
        assert_eq!(layout.buffers.declared_type("d_Vpop1"), Some("scalar*"));
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let ps = pops(&[1.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_field("unsigned int", "numUnits", |p, _| p.count.to_string())
            .unwrap();
        let err = b
            .add_field("unsigned int", "numUnits", |p, _| p.count.to_string())
            .unwrap_err();
        match err {
            CodegenError::DuplicateFieldName { field, .. } => assert_eq!(field, "numUnits"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn definition_lists_runtime_fields_in_insertion_order() {
        let ps = pops(&[1.0, 2.0]);
        let groups = merge_groups("test", ps.iter(), |_, _| true);
        let mut b = LayoutBuilder::new(&groups[0], "MergedTestGroup0", "scalar");
        b.add_field("unsigned int", "numUnits", |p, _| p.count.to_string())
            .unwrap();
        b.add_pointer_field("scalar", "V", "d_V").unwrap();
        b.add_scalar_field("tau", "tau", "$(tau)", |p, _| p.tau).unwrap();
        let layout = b.finish();

        assert_eq!(
            layout.definition("__global"),
            "struct MergedTestGroup0 {\n    unsigned int numUnits;\n    __global scalar* V;\n    scalar tau;\n};\n"
        );
    }
}
