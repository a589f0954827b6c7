//! Action scanning.
//!
//! Walks a response body sketch and a test object, tracking the dotted JSON
//! path of every scanned node, and collects the declared runtime actions:
//! `var_set`, `var_new`, `var_rename`, and `var_delete`. Scanning also
//! derives the produced and deleted variable sets and registers the peer
//! APIs a `var_new` or hook references.

use crate::descriptor::NameSet;
use crate::error::Error;
use crate::jsonpath::JsonPath;
use serde::Deserialize;
use serde_json::Value;

/// Where a `var_set`/`var_new` draws its value from at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSource {
    /// Extraction path into the response body.
    Path(JsonPath),
    /// Named registered function applied to the response body.
    Fcn(String),
    /// Textual template resolved against the environment.
    Value(String),
}

/// Constructor lifecycle link: the produced variable plus the getter and
/// destructor peers and the serialization keys for concurrent creation.
#[derive(Debug, Clone, PartialEq)]
pub struct VarNew {
    pub name: String,
    pub source: ActionSource,
    pub get: String,
    pub delete: String,
    pub serial_vars: Vec<String>,
}

/// One runtime action, applied in scanning order after a valid response.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Set { name: String, source: ActionSource },
    New { name: String, source: ActionSource },
    Rename { from: String, to: String },
    Delete { name: String },
}

/// Everything action scanning learns about one concrete API.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub actions: Vec<Action>,
    pub produces: NameSet,
    pub deletes: NameSet,
    pub var_new: Option<VarNew>,
    /// Peer API names referenced by `var_new` links; referenced APIs are
    /// hidden from standalone insertion.
    pub referenced: Vec<String>,
}

#[derive(Deserialize)]
struct VarSetDecl {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    fcn: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
struct VarNewDecl {
    name: String,
    #[serde(default)]
    path: Option<String>,
    get: String,
    delete: String,
    #[serde(default)]
    serial_vars: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct VarRenameDecl {
    from: String,
    to: String,
}

/// Scans the given roots (body sketch, then test object) for actions.
///
/// `request_body_vars` is the default `serial_vars` set for a `var_new`
/// that does not declare its own.
///
/// # Errors
///
/// Returns a load error on a malformed action declaration and a compile
/// error when an API declares more than one `var_new`.
pub fn scan(
    roots: &[&Value],
    request_body_vars: &NameSet,
    api_name: &str,
) -> Result<ScanOutcome, Error> {
    let mut outcome = ScanOutcome::default();
    for root in roots {
        let mut path = String::new();
        walk(root, &mut path, request_body_vars, api_name, &mut outcome)?;
    }
    Ok(outcome)
}

fn walk(
    value: &Value,
    path: &mut String,
    request_body_vars: &NameSet,
    api_name: &str,
    out: &mut ScanOutcome,
) -> Result<(), Error> {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                match key.as_str() {
                    "var_set" => var_set(val, path, api_name, out)?,
                    "var_new" => var_new(val, path, request_body_vars, api_name, out)?,
                    "var_rename" => var_rename(val, api_name, out)?,
                    "var_delete" => var_delete(val, api_name, out)?,
                    // Node metadata carries no actions.
                    "__" => {}
                    _ => {
                        let saved = path.len();
                        path.push('.');
                        path.push_str(key);
                        walk(val, path, request_body_vars, api_name, out)?;
                        path.truncate(saved);
                    }
                }
            }
        }
        Value::Array(items) => {
            let saved = path.len();
            path.push_str("[]");
            for item in items {
                walk(item, path, request_body_vars, api_name, out)?;
            }
            path.truncate(saved);
        }
        _ => {}
    }
    Ok(())
}

fn var_set(
    decl: &Value,
    path: &str,
    api_name: &str,
    out: &mut ScanOutcome,
) -> Result<(), Error> {
    let decl: VarSetDecl = parse_decl(decl, "var_set", api_name)?;
    let source = source_of(decl.path.as_deref(), decl.fcn, decl.value, path)?;
    out.produces.insert(decl.name.clone());
    out.actions.push(Action::Set {
        name: decl.name,
        source,
    });
    Ok(())
}

fn var_new(
    decl: &Value,
    path: &str,
    request_body_vars: &NameSet,
    api_name: &str,
    out: &mut ScanOutcome,
) -> Result<(), Error> {
    if out.var_new.is_some() {
        return Err(Error::compile(format!(
            "API '{api_name}' declares more than one var_new"
        )));
    }
    let decl: VarNewDecl = parse_decl(decl, "var_new", api_name)?;
    let source = ActionSource::Path(JsonPath::parse(decl.path.as_deref().unwrap_or(path))?);
    let serial_vars = decl
        .serial_vars
        .unwrap_or_else(|| request_body_vars.iter().cloned().collect());
    out.referenced.push(decl.get.clone());
    out.referenced.push(decl.delete.clone());
    out.produces.insert(decl.name.clone());
    out.actions.push(Action::New {
        name: decl.name.clone(),
        source: source.clone(),
    });
    out.var_new = Some(VarNew {
        name: decl.name,
        source,
        get: decl.get,
        delete: decl.delete,
        serial_vars,
    });
    Ok(())
}

fn var_rename(decl: &Value, api_name: &str, out: &mut ScanOutcome) -> Result<(), Error> {
    let decl: VarRenameDecl = parse_decl(decl, "var_rename", api_name)?;
    out.produces.insert(decl.to.clone());
    out.deletes.insert(decl.from.clone());
    out.actions.push(Action::Rename {
        from: decl.from,
        to: decl.to,
    });
    Ok(())
}

fn var_delete(decl: &Value, api_name: &str, out: &mut ScanOutcome) -> Result<(), Error> {
    let name = decl
        .as_str()
        .ok_or_else(|| {
            Error::load(format!(
                "API '{api_name}': var_delete takes a variable name, found {decl}"
            ))
        })?
        .to_string();
    out.deletes.insert(name.clone());
    out.actions.push(Action::Delete { name });
    Ok(())
}

fn parse_decl<T: serde::de::DeserializeOwned>(
    decl: &Value,
    action: &str,
    api_name: &str,
) -> Result<T, Error> {
    serde_json::from_value(decl.clone())
        .map_err(|e| Error::load(format!("API '{api_name}': invalid {action}: {e}")))
}

fn source_of(
    path: Option<&str>,
    fcn: Option<String>,
    value: Option<String>,
    scan_path: &str,
) -> Result<ActionSource, Error> {
    if let Some(path) = path {
        return Ok(ActionSource::Path(JsonPath::parse(path)?));
    }
    if let Some(fcn) = fcn {
        return Ok(ActionSource::Fcn(fcn));
    }
    if let Some(value) = value {
        return Ok(ActionSource::Value(value));
    }
    Ok(ActionSource::Path(JsonPath::parse(scan_path)?))
}
