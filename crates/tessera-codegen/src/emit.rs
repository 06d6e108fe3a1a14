//! Text emission: scoped code writing and placeholder substitution.
//!
//! Model code references parameters, variables and built-ins through exact
//! delimited tokens, `$(name)`. Substitution is plain text replacement; the
//! engine never parses the target language. Cross-entity access uses the
//! suffixed forms `$(name_src)` / `$(name_tgt)`.

use regex::Regex;

use crate::error::{CodegenError, Result};

/// Indented text sink for generated code.
#[derive(Debug, Default)]
pub struct CodeWriter {
    out: String,
    indent: usize,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one line at the current indent.
    pub fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    /// Write a multi-line fragment, one indent per line. Blank lines stay
    /// blank.
    pub fn lines(&mut self, code: &str) {
        for l in code.lines() {
            let l = l.trim();
            if l.is_empty() {
                self.out.push('\n');
            } else {
                self.line(l);
            }
        }
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Write `head {`, run `f` one level deeper, then close the brace.
    pub fn block<R>(&mut self, head: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.line(&format!("{} {{", head));
        self.indent += 1;
        let r = f(self);
        self.indent -= 1;
        self.line("}");
        r
    }

    /// Append pre-rendered text verbatim.
    pub fn raw(&mut self, s: &str) {
        self.out.push_str(s);
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

/// Replace every occurrence of `target` in `code`.
pub fn substitute(code: &str, target: &str, replacement: &str) -> String {
    code.replace(target, replacement)
}

/// Replace `$(name)` with `prefix + name + postfix` for every name.
pub fn name_substitutions(code: &str, prefix: &str, names: &[String], postfix: &str) -> String {
    let mut code = code.to_string();
    for n in names {
        code = substitute(
            &code,
            &format!("$({})", n),
            &format!("{}{}{}", prefix, n, postfix),
        );
    }
    code
}

/// Replace `$(name)` with the parenthesized value for every (name, value)
/// pair.
pub fn value_substitutions(code: &str, names: &[String], values: &[f64]) -> String {
    let mut code = code.to_string();
    for (n, v) in names.iter().zip(values) {
        code = substitute(
            &code,
            &format!("$({})", n),
            &format!("({})", precise_literal(*v)),
        );
    }
    code
}

/// [`name_substitutions`] for suffixed cross-entity tokens, `$(name_src)` and
/// friends.
pub fn extended_name_substitutions(
    code: &str,
    prefix: &str,
    names: &[String],
    ext: &str,
    postfix: &str,
) -> String {
    let mut code = code.to_string();
    for n in names {
        code = substitute(
            &code,
            &format!("$({}{})", n, ext),
            &format!("{}{}{}", prefix, n, postfix),
        );
    }
    code
}

/// [`value_substitutions`] for suffixed cross-entity tokens.
pub fn extended_value_substitutions(
    code: &str,
    names: &[String],
    ext: &str,
    values: &[f64],
) -> String {
    let mut code = code.to_string();
    for (n, v) in names.iter().zip(values) {
        code = substitute(
            &code,
            &format!("$({}{})", n, ext),
            &format!("({})", precise_literal(*v)),
        );
    }
    code
}

/// Replace calls `$(name, a0, a1, ...)` with `template`, where the template
/// references arguments as `$(0)`, `$(1)`, ...
///
/// Arguments are split on commas at paren depth zero, so nested calls and
/// parenthesized expressions pass through intact.
pub fn function_substitute(code: &str, name: &str, arg_count: usize, template: &str) -> String {
    let open = format!("$({},", name);
    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some(at) = rest.find(&open) {
        out.push_str(&rest[..at]);
        let args_from = at + open.len();
        let bytes = rest.as_bytes();
        let mut depth = 1usize;
        let mut args: Vec<String> = Vec::new();
        let mut cur = String::new();
        let mut i = args_from;
        while i < bytes.len() && depth > 0 {
            let c = bytes[i] as char;
            match c {
                '(' => {
                    depth += 1;
                    cur.push(c);
                }
                ')' => {
                    depth -= 1;
                    if depth > 0 {
                        cur.push(c);
                    }
                }
                ',' if depth == 1 => {
                    args.push(cur.trim().to_string());
                    cur.clear();
                }
                _ => cur.push(c),
            }
            i += 1;
        }
        args.push(cur.trim().to_string());
        if depth == 0 && args.len() == arg_count {
            let mut expansion = template.to_string();
            for (k, a) in args.iter().enumerate() {
                expansion = substitute(&expansion, &format!("$({})", k), a);
            }
            out.push_str(&expansion);
            rest = &rest[i..];
        } else {
            // Malformed or wrong arity: leave the token for the unreplaced
            // check to report.
            out.push_str(&rest[at..i]);
            rest = &rest[i..];
        }
    }
    out.push_str(rest);
    out
}

/// Fail if any `$(...)` placeholder survived substitution.
pub fn check_unreplaced(code: &str, group: &str) -> Result<()> {
    let rgx = Regex::new(r"\$\([\w]+\)").expect("placeholder pattern is valid");
    if let Some(m) = rgx.find(code) {
        let fragment = code
            .lines()
            .find(|l| l.contains(m.as_str()))
            .unwrap_or(m.as_str())
            .trim()
            .to_string();
        return Err(CodegenError::UnresolvedExternalReference {
            token: m.as_str().to_string(),
            fragment,
            group: group.to_string(),
        });
    }
    Ok(())
}

/// Shortest round-trip text for a value, always spelled as floating point
/// (`1.0`, never `1`).
pub fn precise_literal(v: f64) -> String {
    let s = format!("{}", v);
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

/// A chained substitution scope: lookups fall through to the parent, so a
/// dispatch block can rebind `id` without copying the kernel-wide map.
#[derive(Debug, Default)]
pub struct Substitutions<'p> {
    vars: Vec<(String, String)>,
    parent: Option<&'p Substitutions<'p>>,
}

impl<'p> Substitutions<'p> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &'p Substitutions<'p>) -> Self {
        Self {
            vars: Vec::new(),
            parent: Some(parent),
        }
    }

    /// Bind `$(name)` to `value`. Later bindings shadow earlier ones at
    /// apply time because inner scopes are applied first.
    pub fn add_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.push((name.into(), value.into()));
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.parent.and_then(|p| p.lookup(name)))
    }

    /// Apply every binding in this scope, then the parent's.
    pub fn apply(&self, code: &str) -> String {
        let mut code = code.to_string();
        for (n, v) in &self.vars {
            code = substitute(&code, &format!("$({})", n), v);
        }
        match self.parent {
            Some(p) => p.apply(&code),
            None => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_indents_blocks() {
        let mut w = CodeWriter::new();
        w.block("if (id < 32)", |w| {
            w.line("x += 1;");
        });
        assert_eq!(w.as_str(), "if (id < 32) {\n    x += 1;\n}\n");
    }

    #[test]
    fn name_substitution_replaces_exact_tokens_only() {
        let code = "$(V) += $(Vrest);";
        let out = name_substitutions(code, "group.", &["V".into()], "[lid]");
        // $(Vrest) is a distinct token and must survive.
        assert_eq!(out, "group.V[lid] += $(Vrest);");
    }

    #[test]
    fn value_substitution_parenthesizes() {
        let out = value_substitutions("x * $(tau)", &["tau".into()], &[20.0]);
        assert_eq!(out, "x * (20.0)");
    }

    #[test]
    fn extended_substitutions_target_suffixed_tokens_only() {
        let code = "$(V_src) - $(V)";
        let out = extended_name_substitutions(code, "group.", &["V".into()], "_src", "[srcUnit]");
        assert_eq!(out, "group.V[srcUnit] - $(V)");

        let out = extended_value_substitutions("$(tau_tgt)", &["tau".into()], "_tgt", &[5.0]);
        assert_eq!(out, "(5.0)");
    }

    #[test]
    fn function_substitution_handles_nested_parens() {
        let out = function_substitute(
            "$(add_acc, max($(g), 0.0));",
            "add_acc",
            1,
            "acc += $(0)",
        );
        assert_eq!(out, "acc += max($(g), 0.0);");
    }

    #[test]
    fn precise_literal_always_floating() {
        assert_eq!(precise_literal(1.0), "1.0");
        assert_eq!(precise_literal(-3.0), "-3.0");
        assert_eq!(precise_literal(0.25), "0.25");
        assert_eq!(precise_literal(20.0), "20.0");
    }

    #[test]
    fn precise_literal_round_trips() {
        for v in [0.1, 1.0 / 3.0, 6.5e-4, 1234.5678] {
            let s = precise_literal(v);
            assert_eq!(s.parse::<f64>().unwrap(), v);
        }
    }

    #[test]
    fn substitution_scopes_chain() {
        let mut outer = Substitutions::new();
        outer.add_var("dt", "DT");
        let mut inner = Substitutions::with_parent(&outer);
        inner.add_var("id", "lid");
        assert_eq!(inner.apply("$(id) * $(dt)"), "lid * DT");
        assert_eq!(inner.lookup("dt"), Some("DT"));
    }

    #[test]
    fn unreplaced_tokens_are_fatal() {
        let err = check_unreplaced("x = $(missing);", "group 0").unwrap_err();
        match err {
            CodegenError::UnresolvedExternalReference { token, .. } => {
                assert_eq!(token, "$(missing)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
