//! `$name` / `${name}` variable substitution.
//!
//! Substitution applies to keys and values of every string in a JSON tree
//! and repeats until a fixed point, bounded at
//! [`SUBST_MAX_PASSES`](crate::constants::SUBST_MAX_PASSES) passes. A string
//! that consists of exactly one placeholder is spliced with the raw bound
//! value so non-string extractions keep their type; everything else is
//! textual interpolation. Missing variables are fatal at substitution time.

use crate::constants::SUBST_MAX_PASSES;
use crate::error::Error;
use crate::vars::{textual, Environment};
use indexmap::IndexSet;
use serde_json::{Map, Value};

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Scans a placeholder at `text[start..]` where `text[start] == '$'`.
/// Returns (name, length of the whole placeholder including `$`).
fn scan_placeholder(text: &str) -> Option<(&str, usize)> {
    let rest = text.strip_prefix('$')?;
    if let Some(braced) = rest.strip_prefix('{') {
        let end = braced.find('}')?;
        let name = &braced[..end];
        let mut chars = name.chars();
        if chars.next().is_some_and(is_name_start) && name.chars().all(is_name_char) {
            return Some((name, end + 3));
        }
        return None;
    }
    let mut len = 0;
    for (i, c) in rest.char_indices() {
        if i == 0 {
            if !is_name_start(c) {
                return None;
            }
        } else if !is_name_char(c) {
            break;
        }
        len = i + c.len_utf8();
    }
    if len == 0 {
        return None;
    }
    Some((&rest[..len], len + 1))
}

/// Variable names referenced in a string, in order of appearance.
#[must_use]
pub fn var_refs(text: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos..];
        if let Some((name, len)) = scan_placeholder(rest) {
            refs.push(name);
            rest = &rest[len..];
        } else {
            rest = &rest[1..];
        }
    }
    refs
}

/// Replaces every placeholder for which `lookup` yields a value; all other
/// text, including unresolved placeholders, passes through unchanged.
pub fn replace_placeholders(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match scan_placeholder(rest) {
            Some((name, len)) => {
                if let Some(value) = lookup(name) {
                    result.push_str(&value);
                } else {
                    result.push_str(&rest[..len]);
                }
                rest = &rest[len..];
            }
            None => {
                result.push('$');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    result
}

/// If `text` is exactly one placeholder, its variable name.
#[must_use]
pub fn exact_placeholder(text: &str) -> Option<&str> {
    let (name, len) = scan_placeholder(text)?;
    (len == text.len()).then_some(name)
}

/// Substitutes every placeholder in a string from the environment.
///
/// # Errors
///
/// Returns a substitution error naming the first missing variable.
pub fn subst_str(text: &str, env: &Environment) -> Result<String, Error> {
    if let Some(missing) = var_refs(text).iter().find(|name| !env.contains(name)) {
        return Err(Error::substitution(format!(
            "variable '{missing}' is not defined (while substituting '{text}')"
        )));
    }
    Ok(replace_placeholders(text, |name| env.textual(name)))
}

/// Substitutes a whole JSON tree to a fixed point.
///
/// # Errors
///
/// Returns a substitution error on a missing variable or when the tree has
/// not stabilised after the pass bound (a substitution cycle).
pub fn subst_value(value: &Value, env: &Environment) -> Result<Value, Error> {
    let mut current = value.clone();
    for _ in 0..SUBST_MAX_PASSES {
        let next = subst_pass(&current, env)?;
        if next == current {
            return Ok(next);
        }
        current = next;
    }
    Err(Error::substitution(
        "substitution did not converge (cyclic variable values?)",
    ))
}

fn subst_pass(value: &Value, env: &Environment) -> Result<Value, Error> {
    match value {
        Value::String(s) => {
            if let Some(name) = exact_placeholder(s) {
                let bound = env.get(name).ok_or_else(|| {
                    Error::substitution(format!("variable '{name}' is not defined"))
                })?;
                return Ok(bound.clone());
            }
            Ok(Value::String(subst_str(s, env)?))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| subst_pass(item, env))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(subst_str(key, env)?, subst_pass(val, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Grounds only the listed bindings into a JSON tree, single pass, leaving
/// every other placeholder symbolic. Used by descriptor expansion to bake
/// enumeration picks and per-test variable overrides into a request.
#[must_use]
pub fn ground_value(value: &Value, bindings: &indexmap::IndexMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = exact_placeholder(s) {
                if let Some(bound) = bindings.get(name) {
                    return bound.clone();
                }
            }
            Value::String(replace_placeholders(s, |name| {
                bindings.get(name).map(textual)
            }))
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|i| ground_value(i, bindings)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    (
                        replace_placeholders(k, |name| bindings.get(name).map(textual)),
                        ground_value(v, bindings),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Every variable referenced anywhere in a JSON tree, keys included,
/// depth-first in encounter order.
#[must_use]
pub fn collect_refs(value: &Value) -> IndexSet<String> {
    let mut refs = IndexSet::new();
    collect_into(value, &mut refs);
    refs
}

fn collect_into(value: &Value, refs: &mut IndexSet<String>) {
    match value {
        Value::String(s) => {
            refs.extend(var_refs(s).iter().map(|r| (*r).to_string()));
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, refs);
            }
        }
        Value::Object(map) => {
            for (key, val) in map {
                refs.extend(var_refs(key).iter().map(|r| (*r).to_string()));
                collect_into(val, refs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_with(pairs: &[(&str, Value)]) -> Environment {
        let mut env = Environment::new();
        for (name, value) in pairs {
            env.set(name, value.clone());
        }
        env
    }

    #[test]
    fn var_refs_finds_both_forms() {
        assert_eq!(var_refs("$a and ${b_2}!"), vec!["a", "b_2"]);
        assert_eq!(var_refs("no refs, just $$ 5"), Vec::<&str>::new());
    }

    #[test]
    fn subst_str_interpolates() {
        let env = env_with(&[("token", json!("T")), ("n", json!(42))]);
        assert_eq!(
            subst_str("Bearer $token/${n}", &env).unwrap(),
            "Bearer T/42"
        );
    }

    #[test]
    fn subst_str_missing_is_fatal() {
        let env = Environment::new();
        let err = subst_str("$nope", &env).unwrap_err();
        assert!(err.to_string().contains("nope"), "got: {err}");
    }

    #[test]
    fn exact_placeholder_splices_raw_value() {
        let env = env_with(&[("ids", json!([1, 2]))]);
        let out = subst_value(&json!({"eventIds": "$ids"}), &env).unwrap();
        assert_eq!(out, json!({"eventIds": [1, 2]}));
    }

    #[test]
    fn embedded_placeholder_is_textual() {
        let env = env_with(&[("id", json!(7))]);
        let out = subst_value(&json!({"path": "/users/$id/x"}), &env).unwrap();
        assert_eq!(out, json!({"path": "/users/7/x"}));
    }

    #[test]
    fn keys_are_substituted() {
        let env = env_with(&[("field", json!("name"))]);
        let out = subst_value(&json!({"$field": 1}), &env).unwrap();
        assert_eq!(out, json!({"name": 1}));
    }

    #[test]
    fn substitution_reaches_fixed_point() {
        let mut env = Environment::new();
        env.set("a", json!("$b"));
        env.set("b", json!("x"));
        let out = subst_value(&json!("$a"), &env).unwrap();
        assert_eq!(out, json!("x"));
        // Idempotent: substituting again changes nothing.
        assert_eq!(subst_value(&out, &env).unwrap(), out);
    }

    #[test]
    fn cyclic_values_fail_to_converge() {
        let mut env = Environment::new();
        env.set("a", json!("$b"));
        env.set("b", json!("$a!"));
        let err = subst_value(&json!("$a"), &env).unwrap_err();
        assert!(err.to_string().contains("converge"), "got: {err}");
    }

    #[test]
    fn ground_value_leaves_free_vars_symbolic() {
        let mut picks = indexmap::IndexMap::new();
        picks.insert("grantType".to_string(), json!("password"));
        let out = ground_value(
            &json!({"grant_type": "$grantType", "user": "$userName"}),
            &picks,
        );
        assert_eq!(
            out,
            json!({"grant_type": "password", "user": "$userName"})
        );
    }

    #[test]
    fn collect_refs_covers_keys_and_values() {
        let refs = collect_refs(&json!({"$k": {"a": "$v", "b": ["${w}"]}}));
        let got: Vec<&str> = refs.iter().map(String::as_str).collect();
        assert_eq!(got, vec!["k", "v", "w"]);
    }
}
