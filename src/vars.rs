//! Variable catalogue and runtime environment.
//!
//! The catalogue holds declared variable definitions: a scalar literal, an
//! enumeration of candidate values, a `$var`-bearing template, or a
//! base64-computed template. [`Catalogue::resolve`] materialises literal
//! values through a bounded fixed-point substitution pass; cyclic or
//! undefined references are load errors.
//!
//! The [`Environment`] is the live name → value mapping that flows down the
//! execution tree. Sibling subtrees receive independent deep copies via
//! [`Environment::fork`], so writes on one branch never leak to another.
//! Bindings remember whether they are multi-valued (enumerations and `[]`
//! fan-out extractions) so the runtime can expand them into sequential
//! variable combinations.

use crate::constants::SUBST_MAX_PASSES;
use crate::error::Error;
use crate::subst;
use base64::Engine as _;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

/// Declared value of a catalogue variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VarSpec {
    Scalar(Value),
    Enumeration(Vec<Value>),
    Template(String),
    /// Base64-encoding of a resolved template.
    Base64(String),
}

/// One declared variable: name, doc description, optional value.
#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub descr: Option<String>,
    pub spec: Option<VarSpec>,
}

/// The load-time variable catalogue.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    defs: IndexMap<String, VarDef>,
}

impl Catalogue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a definition.
    pub fn insert(&mut self, def: VarDef) {
        self.defs.insert(def.name.clone(), def);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VarDef> {
        self.defs.get(name)
    }

    /// Doc description for a variable, if declared.
    #[must_use]
    pub fn description(&self, name: &str) -> Option<&str> {
        self.defs.get(name).and_then(|d| d.descr.as_deref())
    }

    /// Enumeration candidates for a variable, if it is enum-valued.
    #[must_use]
    pub fn enumeration(&self, name: &str) -> Option<&[Value]> {
        match self.defs.get(name).and_then(|d| d.spec.as_ref()) {
            Some(VarSpec::Enumeration(values)) => Some(values),
            _ => None,
        }
    }

    pub fn defs(&self) -> impl Iterator<Item = &VarDef> {
        self.defs.values()
    }

    /// Resolves every valued definition into an [`Environment`].
    ///
    /// Template and base64 definitions go through a textual fixed-point
    /// pass bounded at [`SUBST_MAX_PASSES`] rounds; a round that changes
    /// nothing ends the pass early.
    ///
    /// # Errors
    ///
    /// Returns a load error when a template references an unknown variable
    /// or when references are cyclic (the bound is hit, or the pass
    /// stabilises with placeholders left).
    pub fn resolve(&self) -> Result<Environment, Error> {
        let mut env = Environment::new();
        // Texts every template can draw from: literals render to their
        // textual form, templates start as their own source text.
        let mut texts: IndexMap<String, String> = IndexMap::new();
        let mut work: IndexSet<String> = IndexSet::new();

        for def in self.defs.values() {
            match &def.spec {
                Some(VarSpec::Scalar(v)) => {
                    texts.insert(def.name.clone(), textual(v));
                    env.set(&def.name, v.clone());
                }
                Some(VarSpec::Enumeration(values)) => {
                    let arr = Value::Array(values.clone());
                    texts.insert(def.name.clone(), textual(&arr));
                    env.set_multi(&def.name, values.clone());
                }
                Some(VarSpec::Template(t) | VarSpec::Base64(t)) => {
                    texts.insert(def.name.clone(), t.clone());
                    work.insert(def.name.clone());
                }
                None => {}
            }
        }

        for _ in 0..SUBST_MAX_PASSES {
            let snapshot = texts.clone();
            let mut changed = false;
            for name in &work {
                let current = &texts[name];
                let replaced = replace_from(current, &snapshot);
                if replaced != *current {
                    texts.insert(name.clone(), replaced);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for name in &work {
            let text = &texts[name];
            if let Some(var) = subst::var_refs(text).first() {
                return Err(match self.defs.get(*var) {
                    Some(def) if def.spec.is_some() => Error::load(format!(
                        "cyclic variable definition involving '{name}' (via '${var}')"
                    )),
                    Some(_) => Error::load(format!(
                        "variable '{name}' references '{var}', which has no value"
                    )),
                    None => Error::load(format!(
                        "variable '{name}' references undefined variable '{var}'"
                    )),
                });
            }
            let value = match &self.defs[name].spec {
                Some(VarSpec::Base64(_)) => {
                    Value::String(base64::engine::general_purpose::STANDARD.encode(text))
                }
                _ => Value::String(text.clone()),
            };
            env.set(name, value);
        }

        Ok(env)
    }
}

/// Substitutes `$var` references in `text` from `sources`, leaving unknown
/// references untouched.
fn replace_from(text: &str, sources: &IndexMap<String, String>) -> String {
    subst::replace_placeholders(text, |name| sources.get(name).cloned())
}

/// Textual form of a JSON value: strings render bare, everything else as
/// compact JSON.
#[must_use]
pub fn textual(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One environment entry. `multi` marks enumerations and `[]` fan-out
/// extractions, which the runtime expands into combinations.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub value: Value,
    pub multi: bool,
}

/// The live variable environment of one run context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: IndexMap<String, Binding>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).map(|b| &b.value)
    }

    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.vars.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(
            name.to_string(),
            Binding {
                value,
                multi: false,
            },
        );
    }

    /// Binds a multi-valued variable; each candidate becomes one
    /// combination when the runtime expands.
    pub fn set_multi(&mut self, name: &str, values: Vec<Value>) {
        self.vars.insert(
            name.to_string(),
            Binding {
                value: Value::Array(values),
                multi: true,
            },
        );
    }

    pub fn delete(&mut self, name: &str) -> Option<Value> {
        self.vars.shift_remove(name).map(|b| b.value)
    }

    /// Moves a value to a new name, erasing the old key.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if `from` is not bound.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), Error> {
        let binding = self
            .vars
            .shift_remove(from)
            .ok_or_else(|| Error::runtime(format!("cannot rename undefined variable '{from}'")))?;
        self.vars.insert(to.to_string(), binding);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// The textual form of a bound value, for substitution into strings.
    #[must_use]
    pub fn textual(&self, name: &str) -> Option<String> {
        self.get(name).map(textual)
    }

    /// Deep copy handed to a sibling subtree.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Expands multi-valued bindings consumed by an API into the Cartesian
    /// product of concrete environments, axes ordered by sorted variable
    /// name for reproducibility. With no multi-valued consumption this is a
    /// single clone of `self`. An empty enumeration yields zero
    /// combinations, which the caller treats as fatal.
    #[must_use]
    pub fn combinations(&self, consumes: &IndexSet<String>) -> Vec<Self> {
        let mut axes: Vec<(&str, &Vec<Value>)> = Vec::new();
        for name in consumes {
            if let Some(binding) = self.vars.get(name.as_str()) {
                if binding.multi {
                    if let Value::Array(candidates) = &binding.value {
                        axes.push((name.as_str(), candidates));
                    }
                }
            }
        }
        if axes.is_empty() {
            return vec![self.clone()];
        }
        axes.sort_by_key(|(name, _)| *name);
        if axes.iter().any(|(_, candidates)| candidates.is_empty()) {
            return Vec::new();
        }

        let total: usize = axes.iter().map(|(_, c)| c.len()).product();
        let mut combos = Vec::with_capacity(total);
        for mut index in 0..total {
            let mut env = self.clone();
            // Row-major: the last axis varies fastest.
            for (name, candidates) in axes.iter().rev() {
                let pick = index % candidates.len();
                index /= candidates.len();
                env.set(name, candidates[pick].clone());
            }
            combos.push(env);
        }
        combos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str, spec: VarSpec) -> VarDef {
        VarDef {
            name: name.to_string(),
            descr: None,
            spec: Some(spec),
        }
    }

    #[test]
    fn resolve_scalars_and_enums() {
        let mut cat = Catalogue::new();
        cat.insert(def("userName", VarSpec::Scalar(json!("u"))));
        cat.insert(def("grantType", VarSpec::Enumeration(vec![json!("a"), json!("b")])));
        let env = cat.resolve().unwrap();
        assert_eq!(env.get("userName"), Some(&json!("u")));
        assert!(env.binding("grantType").unwrap().multi);
    }

    #[test]
    fn resolve_template_chain() {
        let mut cat = Catalogue::new();
        cat.insert(def("host", VarSpec::Scalar(json!("api.example.com"))));
        cat.insert(def("port", VarSpec::Scalar(json!(8443))));
        cat.insert(def("base", VarSpec::Template("https://$host:$port".into())));
        cat.insert(def("login", VarSpec::Template("${base}/login".into())));
        let env = cat.resolve().unwrap();
        assert_eq!(
            env.get("login"),
            Some(&json!("https://api.example.com:8443/login"))
        );
    }

    #[test]
    fn resolve_base64_template() {
        let mut cat = Catalogue::new();
        cat.insert(def("userName", VarSpec::Scalar(json!("u"))));
        cat.insert(def("userPass", VarSpec::Scalar(json!("p"))));
        cat.insert(def(
            "authHdr",
            VarSpec::Base64("$userName:$userPass".into()),
        ));
        let env = cat.resolve().unwrap();
        // base64("u:p")
        assert_eq!(env.get("authHdr"), Some(&json!("dTpw")));
    }

    #[test]
    fn resolve_detects_cycle() {
        let mut cat = Catalogue::new();
        cat.insert(def("a", VarSpec::Template("$b".into())));
        cat.insert(def("b", VarSpec::Template("$a".into())));
        let err = cat.resolve().unwrap_err();
        assert!(err.to_string().contains("cyclic"), "got: {err}");
    }

    #[test]
    fn resolve_detects_undefined_reference() {
        let mut cat = Catalogue::new();
        cat.insert(def("a", VarSpec::Template("$nope".into())));
        let err = cat.resolve().unwrap_err();
        assert!(err.to_string().contains("undefined"), "got: {err}");
    }

    #[test]
    fn fork_isolates_writes() {
        let mut env = Environment::new();
        env.set("x", json!(1));
        let mut forked = env.fork();
        forked.set("x", json!(2));
        forked.set("y", json!(3));
        assert_eq!(env.get("x"), Some(&json!(1)));
        assert!(!env.contains("y"));
    }

    #[test]
    fn rename_moves_value() {
        let mut env = Environment::new();
        env.set("old", json!("v"));
        env.rename("old", "new").unwrap();
        assert!(!env.contains("old"));
        assert_eq!(env.get("new"), Some(&json!("v")));
        assert!(env.rename("missing", "x").is_err());
    }

    #[test]
    fn combinations_without_multi_is_identity() {
        let mut env = Environment::new();
        env.set("a", json!("x"));
        let consumes: IndexSet<String> = ["a".to_string()].into_iter().collect();
        let combos = env.combinations(&consumes);
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0], env);
    }

    #[test]
    fn combinations_expand_multi_bindings() {
        let mut env = Environment::new();
        env.set_multi("g", vec![json!("password"), json!("client_credentials")]);
        env.set("h", json!("basic"));
        let consumes: IndexSet<String> =
            ["g".to_string(), "h".to_string()].into_iter().collect();
        let combos = env.combinations(&consumes);
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[0].get("g"), Some(&json!("password")));
        assert_eq!(combos[1].get("g"), Some(&json!("client_credentials")));
        assert!(!combos[0].binding("g").unwrap().multi);
    }

    #[test]
    fn combinations_product_is_sorted_and_row_major() {
        let mut env = Environment::new();
        env.set_multi("b", vec![json!(1), json!(2)]);
        env.set_multi("a", vec![json!("x"), json!("y")]);
        let consumes: IndexSet<String> =
            ["b".to_string(), "a".to_string()].into_iter().collect();
        let combos = env.combinations(&consumes);
        let got: Vec<(String, String)> = combos
            .iter()
            .map(|e| (textual(e.get("a").unwrap()), textual(e.get("b").unwrap())))
            .collect();
        // Axis "a" sorts first and varies slowest.
        assert_eq!(
            got,
            vec![
                ("x".into(), "1".into()),
                ("x".into(), "2".into()),
                ("y".into(), "1".into()),
                ("y".into(), "2".into()),
            ]
        );
    }

    #[test]
    fn combinations_with_empty_enumeration_is_empty() {
        let mut env = Environment::new();
        env.set_multi("a", vec![]);
        let consumes: IndexSet<String> = ["a".to_string()].into_iter().collect();
        assert!(env.combinations(&consumes).is_empty());
    }
}
