//! Response validation.
//!
//! Checks the actual status against the expected one, parses JSON bodies
//! (a JSON content type with an unparsable body is fatal), and validates
//! the parsed body against the response's translated schema with strict
//! multi-error reporting.

use crate::descriptor::ConcreteApi;
use crate::error::Error;
use crate::runtime::http::HttpResponse;
use crate::schema;
use jsonschema::JSONSchema;
use serde_json::Value;

/// Validates a response for an API and returns the parsed JSON body, if
/// there was one.
///
/// # Errors
///
/// Returns a contract error on status mismatch, JSON parse failure, or
/// schema violations (every violating path is named).
pub fn validate_response(
    api: &ConcreteApi,
    response: &HttpResponse,
) -> Result<Option<Value>, Error> {
    if response.status != api.status {
        return Err(Error::contract(format!(
            "API '{}': expected status {}, got {} (body: {})",
            api.name,
            api.status,
            response.status,
            snippet(&response.body)
        )));
    }

    let body = if response.is_json() && !response.body.trim().is_empty() {
        let parsed: Value = serde_json::from_str(&response.body).map_err(|e| {
            Error::contract(format!(
                "API '{}': JSON content type but unparsable body: {e}",
                api.name
            ))
        })?;
        Some(parsed)
    } else {
        None
    };

    if api.ignore_body {
        return Ok(body);
    }
    let Some(expected) = &api.schema else {
        return Ok(body);
    };

    let Some(instance) = &body else {
        return Err(Error::contract(format!(
            "API '{}': a JSON body matching the declared schema was expected",
            api.name
        )));
    };

    let compiled = JSONSchema::compile(&schema::for_validation(expected))
        .map_err(|e| Error::runtime(format!("API '{}': invalid schema: {e}", api.name)))?;
    let violations: Vec<String> = match compiled.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                let at = if path.is_empty() { "/".to_string() } else { path };
                format!("{at}: {e}")
            })
            .collect(),
    };
    if !violations.is_empty() {
        return Err(Error::contract(format!(
            "API '{}': response body failed validation: {}",
            api.name,
            violations.join("; ")
        )));
    }

    Ok(body)
}

fn snippet(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "(empty)";
    }
    let end = trimmed
        .char_indices()
        .nth(200)
        .map_or(trimmed.len(), |(i, _)| i);
    &trimmed[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{NameSet, RequestTemplate};
    use indexmap::IndexMap;
    use serde_json::json;

    fn api(status: u16, schema: Option<Value>, ignore_body: bool) -> ConcreteApi {
        ConcreteApi {
            name: "probe".into(),
            vhost: "v".into(),
            descriptor: "probe".into(),
            host_var: "h".into(),
            request: RequestTemplate {
                method: "GET".into(),
                path: "/probe".into(),
                headers: IndexMap::new(),
                auth: None,
                body: None,
            },
            status,
            schema,
            ignore_body,
            consumes: NameSet::new(),
            produces: NameSet::new(),
            deletes: NameSet::new(),
            actions: Vec::new(),
            var_new: None,
            serial_vars: Vec::new(),
            combo_key: None,
            before: Vec::new(),
            after_api: Vec::new(),
            after_all: Vec::new(),
            on_before_run: None,
            on_after_run: None,
            private: false,
            tags: Vec::new(),
            groups: Vec::new(),
            descr: String::new(),
        }
    }

    fn json_response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: [("content-type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
            body: body.to_string(),
        }
    }

    #[test]
    fn status_mismatch_is_contract_error() {
        let err = validate_response(&api(200, None, true), &json_response(500, "{}")).unwrap_err();
        assert!(err.to_string().contains("expected status 200"), "got: {err}");
    }

    #[test]
    fn unparsable_json_is_contract_error() {
        let err =
            validate_response(&api(200, None, true), &json_response(200, "{nope")).unwrap_err();
        assert!(err.to_string().contains("unparsable"), "got: {err}");
    }

    #[test]
    fn non_json_body_passes_through_unparsed() {
        let resp = HttpResponse {
            status: 200,
            headers: [("content-type".to_string(), "text/plain".to_string())]
                .into_iter()
                .collect(),
            body: "hello".into(),
        };
        assert_eq!(validate_response(&api(200, None, true), &resp).unwrap(), None);
    }

    #[test]
    fn schema_violation_names_the_path() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        });
        let err = validate_response(
            &api(200, Some(schema), false),
            &json_response(200, r#"{"name": 42}"#),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/name"), "got: {err}");
    }

    #[test]
    fn valid_body_is_returned() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } }
        });
        let body = validate_response(
            &api(200, Some(schema), false),
            &json_response(200, r#"{"name": "ok"}"#),
        )
        .unwrap();
        assert_eq!(body, Some(json!({"name": "ok"})));
    }

    #[test]
    fn ignore_body_skips_schema() {
        let schema = json!({"type": "object", "required": ["nope"]});
        let body = validate_response(
            &api(200, Some(schema), true),
            &json_response(200, r#"{"name": "ok"}"#),
        )
        .unwrap();
        assert_eq!(body, Some(json!({"name": "ok"})));
    }
}
