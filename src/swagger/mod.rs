//! Swagger (OpenAPI 2.0) document emission.
//!
//! One JSON document per virtual host, named `swagger-<vhost>.json`. The
//! vhost manifest's `swagger` header seeds the document; every non-private
//! descriptor contributes one operation with its path parameters, body
//! parameter, and per-status responses. `$var` path segments are emitted
//! in `{var}` form.

use crate::constants::SWAGGER_PREFIX;
use crate::descriptor::{ApiDescriptor, VirtualHost};
use crate::error::Error;
use crate::loader::Project;
use crate::schema;
use crate::subst;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Output file name for a virtual host's document.
#[must_use]
pub fn document_name(vhost: &str) -> String {
    format!("{SWAGGER_PREFIX}{vhost}.json")
}

/// Emits one document per virtual host.
///
/// # Errors
///
/// Fails when a documented variable has no catalogue description or a
/// response sketch does not translate.
pub fn emit(project: &Project) -> Result<Vec<(String, Value)>, Error> {
    let mut documents = Vec::new();
    for vhost in &project.vhosts {
        let doc = emit_vhost(project, vhost)?;
        documents.push((document_name(&vhost.name), doc));
    }
    Ok(documents)
}

fn emit_vhost(project: &Project, vhost: &VirtualHost) -> Result<Value, Error> {
    let mut doc = Map::new();
    doc.insert("swagger".into(), json!("2.0"));
    for (key, value) in &vhost.swagger {
        doc.insert(key.clone(), value.clone());
    }

    let mut paths = Map::new();
    for descriptor in project.descriptors.iter().filter(|d| d.vhost == vhost.name) {
        if descriptor.private {
            continue;
        }
        let path_key = normalize_path(&descriptor.request.path);
        let method = descriptor.request.method.to_ascii_lowercase();
        let operation = emit_operation(project, descriptor)?;
        paths
            .entry(path_key)
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .expect("path item is an object")
            .insert(method, operation);
    }
    doc.insert("paths".into(), Value::Object(paths));
    Ok(Value::Object(doc))
}

fn emit_operation(project: &Project, descriptor: &ApiDescriptor) -> Result<Value, Error> {
    let mut operation = Map::new();
    if !descriptor.tags.is_empty() {
        operation.insert("tags".into(), json!(descriptor.tags));
    }
    if !descriptor.descr.is_empty() {
        operation.insert("description".into(), json!(descriptor.descr));
    }

    let mut parameters = Vec::new();
    for var in subst::var_refs(&descriptor.request.path) {
        let description = project.catalogue.description(var).ok_or_else(|| {
            Error::load(format!(
                "variable '{var}' is documented in '{}' but has no description",
                descriptor.name
            ))
        })?;
        parameters.push(json!({
            "name": var,
            "in": "path",
            "required": true,
            "type": "string",
            "description": description,
        }));
    }
    if let Some(body) = &descriptor.request.body {
        parameters.push(json!({
            "name": "body",
            "in": "body",
            "required": true,
            "schema": { "type": "object", "example": body },
        }));
    }
    if !parameters.is_empty() {
        operation.insert("parameters".into(), json!(parameters));
    }

    let mut responses = Map::new();
    for status in descriptor.sorted_statuses() {
        let response = &descriptor.responses[&status];
        let mut entry = Map::new();
        entry.insert("description".into(), json!(response.descr));
        if let Some(body) = &response.body {
            let translated = schema::translate(body, &response.bodymd)
                .map_err(|e| Error::load(format!("API '{}': {e}", descriptor.name)))?;
            entry.insert("schema".into(), schema::for_docs(&translated));
        }
        responses.insert(status.to_string(), Value::Object(entry));
    }
    operation.insert("responses".into(), Value::Object(responses));

    Ok(Value::Object(operation))
}

/// Translates `$var` and `${var}` path segments to `{var}` form.
fn normalize_path(path: &str) -> String {
    // Unwrap is fine: the pattern is a constant.
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid pattern");
    re.replace_all(path, "{$1}").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::{Catalogue, VarDef};
    use serde_json::json;

    fn project() -> Project {
        let mut catalogue = Catalogue::new();
        catalogue.insert(VarDef {
            name: "uid".into(),
            descr: Some("the user id".into()),
            spec: None,
        });

        let vhost: VirtualHost = serde_yaml::from_str(
            "host_variable: apiHost\nswagger:\n  info: { title: Users, version: '1.0' }\n",
        )
        .unwrap();
        let mut vhost = vhost;
        vhost.name = "users".into();

        let mut descriptor: ApiDescriptor = serde_yaml::from_str(
            concat!(
                "name: getUser\n",
                "descr: Fetch one user\n",
                "tags: [users]\n",
                "request:\n",
                "  method: GET\n",
                "  path: /users/$uid\n",
                "responses:\n",
                "  200:\n",
                "    descr: the user\n",
                "    body:\n",
                "      name: the user name\n",
            ),
        )
        .unwrap();
        descriptor.vhost = "users".into();

        Project {
            catalogue,
            vhosts: vec![vhost],
            descriptors: vec![descriptor],
        }
    }

    #[test]
    fn emits_one_document_per_vhost() {
        let docs = emit(&project()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "swagger-users.json");
        let doc = &docs[0].1;
        assert_eq!(doc["swagger"], "2.0");
        assert_eq!(doc["info"]["title"], "Users");
    }

    #[test]
    fn path_variables_become_swagger_parameters() {
        let docs = emit(&project()).unwrap();
        let op = &docs[0].1["paths"]["/users/{uid}"]["get"];
        assert_eq!(op["parameters"][0]["name"], "uid");
        assert_eq!(op["parameters"][0]["in"], "path");
        assert_eq!(op["parameters"][0]["description"], "the user id");
        assert_eq!(op["responses"]["200"]["schema"]["properties"]["name"]["type"], "string");
    }

    #[test]
    fn missing_variable_description_fails_gendoc() {
        let mut project = project();
        project.catalogue = Catalogue::new();
        let err = emit(&project).unwrap_err();
        assert!(err.to_string().contains("uid"), "got: {err}");
    }

    #[test]
    fn private_descriptors_are_excluded() {
        let mut project = project();
        project.descriptors[0].private = true;
        let docs = emit(&project).unwrap();
        assert_eq!(docs[0].1["paths"], json!({}));
    }

    #[test]
    fn braced_path_form_normalises() {
        assert_eq!(normalize_path("/a/${id}/b/$n"), "/a/{id}/b/{n}");
    }
}
