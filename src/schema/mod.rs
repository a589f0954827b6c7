//! Sketch → JSON Schema translation.
//!
//! Response and request bodies are described in a compact sketch syntax and
//! translated here into JSON Schema, used both for the emitted Swagger
//! documents and for response validation:
//!
//! - `"descr"` — a required string field with that description.
//! - `"(flags)descr"` — `flags` is a comma-separated list from a closed set
//!   selecting type (`s`, `i`, `b`, `o`, `a`, `sa`, `ia`, `ba`, `dt`,
//!   `dts`) and modifiers (`opt`, `req`, `ign`).
//! - `[S]` — array of `S`; `[meta, S]` — array with its own doc metadata.
//! - objects recurse per property; the reserved `__` key carries node-level
//!   metadata, and a single `"*"` key produces `patternProperties`.
//! - action keys (`var_set` and friends) are runtime instructions, not
//!   schema, and are skipped.
//!
//! After translation the per-child `required` flags are collected into the
//! canonical `required: [...]` array on the parent object.

use crate::error::Error;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

/// Keys recognized by action scanning; never translated as properties.
pub const ACTION_KEYS: [&str; 4] = ["var_set", "var_new", "var_rename", "var_delete"];

const META_KEY: &str = "__";
const PATTERN_KEY: &str = "*";
/// Marker for `ign` nodes; honored by [`for_validation`], stripped for docs.
const IGNORE_MARKER: &str = "x-ignore";

#[derive(Debug, Clone)]
struct DocInfo {
    ty: &'static str,
    item_ty: Option<&'static str>,
    format: Option<&'static str>,
    required: bool,
    optional: bool,
    ignore: bool,
    descr: String,
}

impl DocInfo {
    fn plain(default_ty: &'static str, descr: &str) -> Self {
        Self {
            ty: default_ty,
            item_ty: None,
            format: None,
            required: true,
            optional: false,
            ignore: false,
            descr: descr.to_string(),
        }
    }
}

/// Parses a `"(flags)descr"` or plain `"descr"` metadata string.
fn get_doc_info(meta: &str, default_ty: &'static str) -> Result<DocInfo, Error> {
    let Some(rest) = meta.strip_prefix('(') else {
        return Ok(DocInfo::plain(default_ty, meta));
    };
    let Some(close) = rest.find(')') else {
        return Ok(DocInfo::plain(default_ty, meta));
    };

    let mut info = DocInfo::plain(default_ty, rest[close + 1..].trim_start());
    for flag in rest[..close].split(',').map(str::trim) {
        match flag {
            "a" => info.ty = "array",
            "b" => info.ty = "boolean",
            "ba" => {
                info.ty = "array";
                info.item_ty = Some("boolean");
            }
            "dt" => {
                info.ty = "integer";
                info.format = Some("date-time");
            }
            "dts" => {
                info.ty = "string";
                info.format = Some("date-time");
            }
            "i" => info.ty = "integer",
            "ia" => {
                info.ty = "array";
                info.item_ty = Some("integer");
            }
            "o" => info.ty = "object",
            "s" => info.ty = "string",
            "sa" => {
                info.ty = "array";
                info.item_ty = Some("string");
            }
            "opt" => {
                info.optional = true;
                info.required = false;
            }
            "req" => info.required = true,
            "ign" => info.ignore = true,
            other => {
                return Err(Error::load(format!(
                    "unknown sketch flag '{other}' in '{meta}'"
                )));
            }
        }
    }
    Ok(info)
}

/// Builds the schema node for a parsed [`DocInfo`], with optional explicit
/// `items`.
fn info_schema(info: &DocInfo, items: Option<Value>) -> Value {
    let mut schema = Map::new();
    let ty = if info.optional {
        json!([info.ty, "null"])
    } else {
        json!(info.ty)
    };
    schema.insert("type".into(), ty);
    if !info.descr.is_empty() {
        schema.insert("description".into(), json!(info.descr));
    }
    if let Some(format) = info.format {
        schema.insert("format".into(), json!(format));
    }
    if let Some(items) = items {
        schema.insert("items".into(), items);
    } else if let Some(item_ty) = info.item_ty {
        schema.insert("items".into(), json!({ "type": item_ty }));
    }
    if info.ignore {
        schema.insert(IGNORE_MARKER.into(), json!(true));
    }
    Value::Object(schema)
}

/// Translates a body sketch into JSON Schema, then deep-merges the `bodymd`
/// overlay fragments at their dotted paths.
///
/// # Errors
///
/// Returns a load error on malformed sketch syntax.
pub fn translate(sketch: &Value, bodymd: &IndexMap<String, Value>) -> Result<Value, Error> {
    let (mut schema, _required) = translate_node(sketch)?;
    for (path, fragment) in bodymd {
        overlay(&mut schema, path, fragment)?;
    }
    Ok(schema)
}

fn translate_node(sketch: &Value) -> Result<(Value, bool), Error> {
    match sketch {
        Value::String(meta) => {
            let info = get_doc_info(meta, "string")?;
            let required = info.required;
            Ok((info_schema(&info, None), required))
        }
        Value::Array(items) => match items.as_slice() {
            [elem] => {
                let (item_schema, _) = translate_node(elem)?;
                Ok((json!({ "type": "array", "items": item_schema }), true))
            }
            [meta, elem] => {
                let meta = meta.as_str().ok_or_else(|| {
                    Error::load("two-element array sketch must start with a metadata string")
                })?;
                let info = get_doc_info(meta, "array")?;
                let required = info.required;
                let (item_schema, _) = translate_node(elem)?;
                Ok((info_schema(&info, Some(item_schema)), required))
            }
            _ => Err(Error::load(format!(
                "array sketch must have 1 or 2 elements, found {}",
                items.len()
            ))),
        },
        Value::Object(map) => translate_object(map),
        other => Err(Error::load(format!(
            "invalid sketch node: {other} (expected string, array, or object)"
        ))),
    }
}

fn translate_object(map: &Map<String, Value>) -> Result<(Value, bool), Error> {
    // Single-key "*" object: uniform map with arbitrary property names.
    if map.len() == 1 {
        if let Some(value) = map.get(PATTERN_KEY) {
            let (value_schema, _) = translate_node(value)?;
            return Ok((
                json!({ "type": "object", "patternProperties": { "^.+$": value_schema } }),
                true,
            ));
        }
    }

    let info = match map.get(META_KEY) {
        Some(Value::String(meta)) => get_doc_info(meta, "object")?,
        Some(Value::Object(meta)) => object_meta(meta)?,
        Some(other) => {
            return Err(Error::load(format!(
                "'__' metadata must be a string or object, found {other}"
            )));
        }
        None => DocInfo::plain("object", ""),
    };

    let mut properties = Map::new();
    let mut required_names = Vec::new();
    for (key, value) in map {
        if key == META_KEY || ACTION_KEYS.contains(&key.as_str()) {
            continue;
        }
        let (child, child_required) = translate_node(value)?;
        if child_required {
            required_names.push(json!(key));
        }
        properties.insert(key.clone(), child);
    }

    // A node whose only content is metadata and actions is a leaf of the
    // metadata's type (e.g. a string field that also carries a var_set).
    if properties.is_empty() && info.ty != "object" {
        let required = info.required;
        return Ok((info_schema(&info, None), required));
    }

    let mut schema = info_schema(&info, None);
    let obj = schema.as_object_mut().expect("info_schema returns an object");
    if !properties.is_empty() {
        obj.insert("properties".into(), Value::Object(properties));
    }
    if !required_names.is_empty() {
        obj.insert("required".into(), Value::Array(required_names));
    }
    let required = info.required;
    Ok((schema, required))
}

/// Reads `{type, required, description}` object-form metadata.
fn object_meta(meta: &Map<String, Value>) -> Result<DocInfo, Error> {
    let mut info = DocInfo::plain("object", "");
    if let Some(ty) = meta.get("type") {
        let ty = ty
            .as_str()
            .ok_or_else(|| Error::load("'__.type' must be a string"))?;
        info.ty = match ty {
            "string" => "string",
            "integer" => "integer",
            "boolean" => "boolean",
            "object" => "object",
            "array" => "array",
            "number" => "number",
            other => return Err(Error::load(format!("unknown '__.type' value '{other}'"))),
        };
    }
    if let Some(required) = meta.get("required") {
        info.required = required
            .as_bool()
            .ok_or_else(|| Error::load("'__.required' must be a boolean"))?;
        info.optional = !info.required;
    }
    if let Some(descr) = meta.get("description") {
        info.descr = descr
            .as_str()
            .ok_or_else(|| Error::load("'__.description' must be a string"))?
            .to_string();
    }
    Ok(info)
}

/// Deep-merges a `bodymd` fragment into the schema node at a dotted path
/// (`a.b` descends properties, `[]` descends items). An `anyOf` overlay
/// erases the node's `type`.
fn overlay(schema: &mut Value, path: &str, fragment: &Value) -> Result<(), Error> {
    let mut node = schema;
    for raw in path.split('.').filter(|s| !s.is_empty()) {
        let (field, every) = match raw.strip_suffix("[]") {
            Some(prefix) => (prefix, true),
            None => (raw, false),
        };
        if !field.is_empty() {
            node = node
                .as_object_mut()
                .ok_or_else(|| Error::load(format!("bodymd path '{path}' leaves the schema")))?
                .entry("properties")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("properties is an object")
                .entry(field)
                .or_insert_with(|| json!({}));
        }
        if every {
            node = node
                .as_object_mut()
                .ok_or_else(|| Error::load(format!("bodymd path '{path}' leaves the schema")))?
                .entry("items")
                .or_insert_with(|| json!({}));
        }
    }
    if fragment.get("anyOf").is_some() {
        if let Some(obj) = node.as_object_mut() {
            obj.remove("type");
        }
    }
    deep_merge(node, fragment);
    Ok(())
}

fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

/// Prepares a translated schema for response validation: `ign`-marked nodes
/// become accept-anything schemas and leave the parent's `required` list.
#[must_use]
pub fn for_validation(schema: &Value) -> Value {
    let mut cleaned = schema.clone();
    clean_for_validation(&mut cleaned);
    cleaned
}

fn clean_for_validation(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            if obj.get(IGNORE_MARKER).and_then(Value::as_bool) == Some(true) {
                *value = json!({});
                return;
            }
            let mut dropped: Vec<String> = Vec::new();
            if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
                for (name, prop) in props.iter_mut() {
                    let ignored =
                        prop.get(IGNORE_MARKER).and_then(Value::as_bool) == Some(true);
                    if ignored {
                        *prop = json!({});
                        dropped.push(name.clone());
                    } else {
                        clean_for_validation(prop);
                    }
                }
            }
            if !dropped.is_empty() {
                if let Some(required) = obj.get_mut("required").and_then(Value::as_array_mut) {
                    required.retain(|name| {
                        name.as_str().is_none_or(|n| !dropped.iter().any(|d| d == n))
                    });
                    if required.is_empty() {
                        obj.remove("required");
                    }
                }
            }
            for (key, child) in obj.iter_mut() {
                if key != "properties" {
                    clean_for_validation(child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                clean_for_validation(item);
            }
        }
        _ => {}
    }
}

/// Prepares a translated schema for document emission: internal markers are
/// removed, type information kept.
#[must_use]
pub fn for_docs(schema: &Value) -> Value {
    let mut cleaned = schema.clone();
    strip_markers(&mut cleaned);
    cleaned
}

fn strip_markers(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            obj.remove(IGNORE_MARKER);
            for child in obj.values_mut() {
                strip_markers(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_markers(item);
            }
        }
        _ => {}
    }
}
