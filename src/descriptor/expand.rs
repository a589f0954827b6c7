//! Descriptor expansion.
//!
//! Explodes a multi-response descriptor into concrete APIs, one per
//! (response, test variant, enumeration combination). Per-test variable
//! overrides and enumeration picks are grounded textually into the request;
//! all remaining `$var` references stay symbolic until runtime
//! substitution.

use crate::constants::COMBO_QUEUE_PREFIX;
use crate::descriptor::actions::{self, Action, VarNew};
use crate::descriptor::{ApiDescriptor, Hook, NameSet, RequestTemplate, TestVariant};
use crate::error::Error;
use crate::schema;
use crate::subst;
use crate::vars::{textual, Catalogue};
use indexmap::IndexMap;
use serde_json::Value;

/// The planner's unit: a single schedulable request with one expected
/// status, fully grounded on enumerated axes.
#[derive(Debug, Clone)]
pub struct ConcreteApi {
    pub name: String,
    pub vhost: String,
    /// Owning descriptor name.
    pub descriptor: String,
    /// Variable whose runtime value prefixes the request path.
    pub host_var: String,
    pub request: RequestTemplate,
    pub status: u16,
    /// Translated response body schema, if the response declares one.
    pub schema: Option<Value>,
    pub ignore_body: bool,
    pub consumes: NameSet,
    pub produces: NameSet,
    pub deletes: NameSet,
    pub actions: Vec<Action>,
    pub var_new: Option<VarNew>,
    /// Serialization keys; non-empty gates the waterfall on a queue.
    pub serial_vars: Vec<String>,
    /// Shared queue key for combination variants of one test unit, which
    /// keeps sibling variants sequential.
    pub combo_key: Option<String>,
    pub before: Vec<Hook>,
    pub after_api: Vec<Hook>,
    pub after_all: Vec<Hook>,
    pub on_before_run: Option<String>,
    pub on_after_run: Option<String>,
    pub private: bool,
    pub tags: Vec<String>,
    pub groups: Vec<String>,
    pub descr: String,
}

impl ConcreteApi {
    /// Test-filter match: checks the API name and its groups against a
    /// requested prefix.
    #[must_use]
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.name.starts_with(prefix) || self.groups.iter().any(|g| g.starts_with(prefix))
    }
}

/// Expands one descriptor against the variable catalogue.
///
/// # Errors
///
/// Returns load errors for malformed sketches or actions and compile
/// errors for invalid lifecycle declarations.
pub fn expand(
    desc: &ApiDescriptor,
    catalogue: &Catalogue,
    host_var: &str,
) -> Result<Vec<ConcreteApi>, Error> {
    let mut apis = Vec::new();
    let default_test = [TestVariant::default()];
    let mut unit_index = 0usize;

    for status in desc.sorted_statuses() {
        let response = &desc.responses[&status];
        let tests: &[TestVariant] = if response.tests.is_empty() {
            &default_test
        } else {
            &response.tests
        };

        for (test_index, test) in tests.iter().enumerate() {
            let unit_name = unit_name(desc, status, test, test_index, unit_index);
            unit_index += 1;

            let base_request = ground_request(&desc.request, &test.vars);
            let body_vars = body_refs(&base_request);

            let test_rest = Value::Object(
                test.rest
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            let mut scan_roots: Vec<&Value> = Vec::new();
            if let Some(body) = &response.body {
                scan_roots.push(body);
            }
            scan_roots.push(&test_rest);
            let scanned = actions::scan(&scan_roots, &body_vars, &unit_name)?;

            let translated = match (&response.body, response.ignore_body) {
                (Some(body), false) => Some(
                    schema::translate(body, &response.bodymd)
                        .map_err(|e| Error::load(format!("API '{unit_name}': {e}")))?,
                ),
                _ => None,
            };

            let hooks = response.hooks.merged(&desc.hooks);
            let serial_vars = scanned
                .var_new
                .as_ref()
                .map(|vn| vn.serial_vars.clone())
                .or_else(|| response.serial_vars.clone())
                .unwrap_or_default();

            let combos = enum_combinations(&base_request, catalogue);
            let combo_key =
                (combos.len() > 1).then(|| format!("{COMBO_QUEUE_PREFIX}{unit_name}"));

            for (combo_index, picks) in combos.iter().enumerate() {
                let request = ground_request(&base_request, picks);
                let name = if combo_index == 0 {
                    unit_name.clone()
                } else {
                    format!("{unit_name}-{combo_index}")
                };

                let mut consumes = request_refs(&request);
                consumes.extend(desc.consumes.iter().cloned());
                consumes.insert(host_var.to_string());
                let mut produces = scanned.produces.clone();
                produces.extend(desc.produces.iter().cloned());

                apis.push(ConcreteApi {
                    name,
                    vhost: desc.vhost.clone(),
                    descriptor: desc.name.clone(),
                    host_var: host_var.to_string(),
                    request,
                    status,
                    schema: translated.clone(),
                    ignore_body: response.ignore_body,
                    consumes,
                    produces,
                    deletes: scanned.deletes.clone(),
                    actions: scanned.actions.clone(),
                    var_new: scanned.var_new.clone(),
                    serial_vars: serial_vars.clone(),
                    combo_key: combo_key.clone(),
                    before: hooks.before.iter().map(Hook::from).collect(),
                    after_api: hooks.after_api.iter().map(Hook::from).collect(),
                    after_all: hooks.after_all.iter().map(Hook::from).collect(),
                    on_before_run: hooks.on_before_run.clone(),
                    on_after_run: hooks.on_after_run.clone(),
                    private: desc.private,
                    tags: desc.tags.clone(),
                    groups: desc.groups.clone(),
                    descr: desc.descr.clone(),
                });
            }
        }
    }

    Ok(apis)
}

/// Peer-API names a set of concrete APIs reference through `var_new` links
/// and hook declarations; referenced APIs never insert standalone.
#[must_use]
pub fn referenced_names(apis: &[ConcreteApi]) -> Vec<String> {
    let mut referenced: NameSet = NameSet::new();
    for api in apis {
        if let Some(var_new) = &api.var_new {
            referenced.insert(var_new.get.clone());
            referenced.insert(var_new.delete.clone());
        }
        for hook in api.before.iter().chain(&api.after_api).chain(&api.after_all) {
            referenced.insert(hook.name.clone());
        }
    }
    referenced.into_iter().collect()
}

/// First unit keeps the bare descriptor name; later units are suffixed
/// with their status and, for explicit tests, the test name or index.
fn unit_name(
    desc: &ApiDescriptor,
    status: u16,
    test: &TestVariant,
    test_index: usize,
    unit_index: usize,
) -> String {
    if unit_index == 0 {
        return desc.name.clone();
    }
    let mut name = format!("{}-{status}", desc.name);
    if let Some(test_name) = &test.name {
        name = format!("{name}-{test_name}");
    } else if test_index > 0 {
        name = format!("{name}-{test_index}");
    }
    name
}

/// Grounds the listed bindings into every textual part of a request.
fn ground_request(request: &RequestTemplate, bindings: &IndexMap<String, Value>) -> RequestTemplate {
    let ground_str =
        |s: &str| subst::replace_placeholders(s, |name| bindings.get(name).map(textual));
    RequestTemplate {
        method: request.method.clone(),
        path: ground_str(&request.path),
        headers: request
            .headers
            .iter()
            .map(|(k, v)| (ground_str(k), ground_str(v)))
            .collect(),
        auth: request.auth.as_ref().map(|auth| crate::descriptor::BasicAuth {
            username: ground_str(&auth.username),
            password: ground_str(&auth.password),
        }),
        body: request
            .body
            .as_ref()
            .map(|body| subst::ground_value(body, bindings)),
    }
}

/// Every `$var` referenced anywhere in a request.
#[must_use]
pub fn request_refs(request: &RequestTemplate) -> NameSet {
    let mut refs = NameSet::new();
    refs.extend(subst::var_refs(&request.path).iter().map(|r| (*r).to_string()));
    for (key, value) in &request.headers {
        refs.extend(subst::var_refs(key).iter().map(|r| (*r).to_string()));
        refs.extend(subst::var_refs(value).iter().map(|r| (*r).to_string()));
    }
    if let Some(auth) = &request.auth {
        refs.extend(subst::var_refs(&auth.username).iter().map(|r| (*r).to_string()));
        refs.extend(subst::var_refs(&auth.password).iter().map(|r| (*r).to_string()));
    }
    if let Some(body) = &request.body {
        refs.extend(subst::collect_refs(body));
    }
    refs
}

/// Variables referenced in the request body only (the default
/// `serial_vars` set).
fn body_refs(request: &RequestTemplate) -> NameSet {
    request
        .body
        .as_ref()
        .map(subst::collect_refs)
        .unwrap_or_default()
}

/// Cartesian product over request variables with catalogue enumerations,
/// axes sorted by name, last axis varying fastest. Always yields at least
/// the empty pick.
fn enum_combinations(
    request: &RequestTemplate,
    catalogue: &Catalogue,
) -> Vec<IndexMap<String, Value>> {
    let mut axes: Vec<(String, &[Value])> = request_refs(request)
        .into_iter()
        .filter_map(|name| {
            catalogue
                .enumeration(&name)
                .map(|candidates| (name, candidates))
        })
        .collect();
    axes.sort_by(|(a, _), (b, _)| a.cmp(b));

    if axes.is_empty() || axes.iter().any(|(_, c)| c.is_empty()) {
        return vec![IndexMap::new()];
    }

    let total: usize = axes.iter().map(|(_, c)| c.len()).product();
    let mut combos = Vec::with_capacity(total);
    for mut index in 0..total {
        let mut picks = IndexMap::new();
        for (name, candidates) in axes.iter().rev() {
            let pick = index % candidates.len();
            index /= candidates.len();
            picks.insert(name.clone(), candidates[pick].clone());
        }
        // Restore sorted axis order for reproducible serialization.
        picks.sort_keys();
        combos.push(picks);
    }
    combos
}
