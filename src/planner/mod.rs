//! Test execution tree construction.
//!
//! The planner inserts every runnable concrete API into a dependency tree
//! rooted at an empty node. An API lands at every location whose
//! accumulated produced-variable set newly satisfies its dependencies;
//! when nothing satisfies a dependency, the producers of the first missing
//! variable are seeded first. Constructor APIs (`var_new`) receive preRun
//! (getter → destructor) and postRun (destructor) satellite subtrees.
//!
//! Planning is sequential and deterministic: the corpus keeps load order,
//! children are scanned in insertion order, and the first-listed undefined
//! variable seeds producers.

use crate::descriptor::actions::{Action, ActionSource};
use crate::descriptor::expand::{referenced_names, ConcreteApi};
use crate::descriptor::NameSet;
use crate::error::Error;
use std::collections::HashSet;
use std::fmt::Write as _;

pub type NodeId = usize;

/// One position in the plan. Satellite nodes (preRun/postRun subtrees)
/// hang off their owner instead of its `children` and never contribute to
/// sibling subtree-produces.
#[derive(Debug)]
pub struct PlanNode {
    pub api: Option<usize>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Variables available to this node's subtree: parent's set plus own
    /// API produces, minus own API deletes.
    pub produces: NameSet,
    /// Union of API produces over the subtree rooted here, filtered
    /// through deletes on the way up.
    pub subtree_produces: NameSet,
    pub pre_run: Option<NodeId>,
    pub post_run: Option<NodeId>,
    /// Stable dotted identifier (`1.2.1`) used in logs.
    pub label: String,
    pub satellite: bool,
}

/// A compiled execution plan: the corpus plus the tree over it.
#[derive(Debug)]
pub struct Plan {
    pub apis: Vec<ConcreteApi>,
    pub nodes: Vec<PlanNode>,
    pub root: NodeId,
}

impl Plan {
    #[must_use]
    pub fn api_of(&self, node: NodeId) -> Option<&ConcreteApi> {
        self.nodes[node].api.map(|idx| &self.apis[idx])
    }

    /// Human-readable tree rendering for `hdt compile`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("root\n");
        for &child in &self.nodes[self.root].children {
            self.render_node(child, 1, &mut out);
        }
        out
    }

    fn render_node(&self, node: NodeId, depth: usize, out: &mut String) {
        let n = &self.nodes[node];
        let api = n.api.map_or("-", |idx| self.apis[idx].name.as_str());
        let _ = writeln!(out, "{:indent$}{} {}", "", n.label, api, indent = depth * 2);
        if let Some(pre) = n.pre_run {
            self.render_satellite(pre, depth + 1, "pre", out);
        }
        for &child in &n.children {
            self.render_node(child, depth + 1, out);
        }
        if let Some(post) = n.post_run {
            self.render_satellite(post, depth + 1, "post", out);
        }
    }

    fn render_satellite(&self, node: NodeId, depth: usize, tag: &str, out: &mut String) {
        let n = &self.nodes[node];
        let api = n.api.map_or("-", |idx| self.apis[idx].name.as_str());
        let _ = writeln!(out, "{:indent$}[{tag}] {api}", "", indent = depth * 2);
        for &child in &n.children {
            self.render_satellite(child, depth + 1, tag, out);
        }
    }
}

/// Builds the execution tree.
///
/// `filters` holds the requested test-name prefixes (empty = everything);
/// filtered-out APIs can still be pulled in as producers. `registered`
/// names the hook and run-callback functions registered on the runtime,
/// for reference validation.
///
/// # Errors
///
/// Compile errors accumulate: unknown peer references, missing producers,
/// unresolvable serialization keys, and insertions that cannot make
/// progress are all reported together.
pub fn build(
    apis: Vec<ConcreteApi>,
    predefined: &NameSet,
    filters: &[String],
    registered: &NameSet,
) -> Result<Plan, Vec<Error>> {
    let mut errors = validate(&apis, registered);

    // Hook strings naming registered functions are not API references.
    let mut referenced = referenced_names(&apis);
    referenced.retain(|name| apis.iter().any(|a| a.name == *name));

    let mut builder = Builder {
        apis: &apis,
        referenced,
        predefined,
        nodes: vec![PlanNode {
            api: None,
            parent: None,
            children: Vec::new(),
            produces: NameSet::new(),
            subtree_produces: NameSet::new(),
            pre_run: None,
            post_run: None,
            label: String::new(),
            satellite: false,
        }],
        inserting: HashSet::new(),
    };

    for idx in 0..apis.len() {
        let selected = filters.is_empty() || filters.iter().any(|p| apis[idx].matches_prefix(p));
        if !selected {
            continue;
        }
        if let Err(e) = builder.insert(idx, 0) {
            errors.push(e);
        }
    }

    let nodes = builder.nodes;
    if errors.is_empty() {
        Ok(Plan {
            apis,
            nodes,
            root: 0,
        })
    } else {
        Err(errors)
    }
}

/// Pre-insertion reference validation over the whole corpus.
fn validate(apis: &[ConcreteApi], registered: &NameSet) -> Vec<Error> {
    let mut errors = Vec::new();
    let mut seen: NameSet = NameSet::new();
    for api in apis {
        if !seen.insert(api.name.clone()) {
            errors.push(Error::compile(format!(
                "duplicate concrete API name '{}'",
                api.name
            )));
        }
    }
    let resolves = |name: &str| apis.iter().any(|a| a.name == name);

    for api in apis {
        if let Some(var_new) = &api.var_new {
            for (role, peer) in [("get", &var_new.get), ("delete", &var_new.delete)] {
                if !resolves(peer) {
                    errors.push(Error::compile(format!(
                        "API '{}': var_new {role} references unknown API '{peer}'",
                        api.name
                    )));
                }
            }
            if var_new.serial_vars.is_empty() {
                errors.push(Error::compile(format!(
                    "API '{}': var_new has no resolvable serial_vars",
                    api.name
                )));
            }
        }
        for hook in api.before.iter().chain(&api.after_api).chain(&api.after_all) {
            if !resolves(&hook.name) && !registered.contains(&hook.name) {
                errors.push(Error::compile(format!(
                    "API '{}': hook '{}' names neither an API nor a registered function",
                    api.name, hook.name
                )));
            }
        }
        for (field, cb) in [
            ("onBeforeRun", &api.on_before_run),
            ("onAfterRun", &api.on_after_run),
        ] {
            if let Some(name) = cb {
                if !registered.contains(name) {
                    errors.push(Error::compile(format!(
                        "API '{}': {field} '{name}' is not a registered function",
                        api.name
                    )));
                }
            }
        }
        for action in &api.actions {
            if let Action::Set {
                source: ActionSource::Fcn(name),
                ..
            }
            | Action::New {
                source: ActionSource::Fcn(name),
                ..
            } = action
            {
                if !registered.contains(name) {
                    errors.push(Error::compile(format!(
                        "API '{}': extraction function '{name}' is not registered",
                        api.name
                    )));
                }
            }
        }
    }
    errors
}

struct Builder<'a> {
    apis: &'a [ConcreteApi],
    referenced: Vec<String>,
    predefined: &'a NameSet,
    nodes: Vec<PlanNode>,
    inserting: HashSet<(NodeId, usize)>,
}

impl Builder<'_> {
    /// Referenced APIs run only as satellites or inside hooks, never on
    /// their own.
    fn insertable(&self, api: usize) -> bool {
        let name = &self.apis[api].name;
        !self.referenced.iter().any(|r| r.starts_with(name.as_str()))
    }

    fn ancestor_hosts(&self, mut node: NodeId, api: usize) -> bool {
        loop {
            if self.nodes[node].api == Some(api) {
                return true;
            }
            match self.nodes[node].parent {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Inserts `api` at `node` and every deeper location that newly
    /// satisfies it. Returns whether any location accepted it.
    fn insert(&mut self, api: usize, node: NodeId) -> Result<bool, Error> {
        if !self.insertable(api) {
            return Ok(false);
        }
        if !self.inserting.insert((node, api)) {
            return Ok(false);
        }
        let result = self.insert_guarded(api, node);
        self.inserting.remove(&(node, api));
        result
    }

    fn insert_guarded(&mut self, api: usize, node: NodeId) -> Result<bool, Error> {
        if self.ancestor_hosts(node, api) {
            return Ok(false);
        }

        let undef: Vec<String> = self.apis[api]
            .consumes
            .iter()
            .filter(|name| {
                !self.nodes[node].produces.contains(name.as_str())
                    && !self.predefined.contains(name.as_str())
            })
            .cloned()
            .collect();

        if undef.is_empty() {
            // Already placed here (e.g. seeded earlier as a producer).
            let hosted = self.nodes[node]
                .children
                .iter()
                .any(|&child| self.nodes[child].api == Some(api));
            if !hosted {
                self.append(api, node)?;
            }
            return Ok(true);
        }

        let mut accepted = false;
        let children = self.nodes[node].children.clone();
        for child in children {
            let overlaps = undef
                .iter()
                .any(|name| self.nodes[child].subtree_produces.contains(name.as_str()));
            if overlaps {
                accepted |= self.insert(api, child)?;
            }
        }
        if accepted {
            return Ok(true);
        }

        // Nothing below satisfies the first missing variable: seed its
        // producers here, then retry.
        let needed = &undef[0];
        let producers: Vec<usize> = (0..self.apis.len())
            .filter(|&p| p != api && self.apis[p].produces.contains(needed.as_str()))
            .collect();
        if producers.is_empty() {
            return Err(Error::compile(format!(
                "no producer exists for variable '{needed}' required by API '{}'",
                self.apis[api].name
            )));
        }
        let mut progress = false;
        for producer in producers {
            progress |= self.insert(producer, node)?;
        }
        if !progress {
            return Err(Error::compile(format!(
                "cannot place API '{}': seeding producers of '{needed}' made no progress",
                self.apis[api].name
            )));
        }

        self.inserting.remove(&(node, api));
        self.insert(api, node)
    }

    /// Creates the child node, its satellites when the API is a
    /// constructor, and propagates the new produces up the ancestor chain.
    fn append(&mut self, api: usize, parent: NodeId) -> Result<NodeId, Error> {
        let concrete = &self.apis[api];
        let mut produces = self.nodes[parent].produces.clone();
        produces.extend(concrete.produces.iter().cloned());
        for deleted in &concrete.deletes {
            produces.shift_remove(deleted);
        }

        let label = if self.nodes[parent].label.is_empty() {
            format!("{}", self.nodes[parent].children.len() + 1)
        } else {
            format!(
                "{}.{}",
                self.nodes[parent].label,
                self.nodes[parent].children.len() + 1
            )
        };

        let node = self.push_node(api, Some(parent), produces, label.clone(), false);
        self.nodes[parent].children.push(node);

        if let Some(var_new) = self.apis[api].var_new.clone() {
            let getter = self.find_api(&var_new.get)?;
            let destructor = self.find_api(&var_new.delete)?;

            // preRun: getter with the destructor as its child; runs before
            // the node's API with failures ignored, clearing leftovers
            // from a previous run.
            let base = self.nodes[node].produces.clone();
            let pre = self.push_node(
                getter,
                Some(node),
                base.clone(),
                format!("{label}.pre"),
                true,
            );
            let pre_child = self.push_node(
                destructor,
                Some(pre),
                {
                    let mut p = base.clone();
                    p.extend(self.apis[getter].produces.iter().cloned());
                    p
                },
                format!("{label}.pre.1"),
                true,
            );
            self.nodes[pre].children.push(pre_child);

            // postRun: destructor alone, after the node's entire subtree.
            let post = self.push_node(
                destructor,
                Some(node),
                base,
                format!("{label}.post"),
                true,
            );
            self.nodes[node].pre_run = Some(pre);
            self.nodes[node].post_run = Some(post);
        }

        self.propagate_up(node);
        Ok(node)
    }

    fn push_node(
        &mut self,
        api: usize,
        parent: Option<NodeId>,
        produces: NameSet,
        label: String,
        satellite: bool,
    ) -> NodeId {
        let subtree_produces = self.apis[api].produces.clone();
        self.nodes.push(PlanNode {
            api: Some(api),
            parent,
            children: Vec::new(),
            produces,
            subtree_produces,
            pre_run: None,
            post_run: None,
            label,
            satellite,
        });
        self.nodes.len() - 1
    }

    /// Walks the ancestor chain adding the new node's produces to each
    /// ancestor's subtree set; an ancestor's deletes drop those names from
    /// the set propagated above it.
    fn propagate_up(&mut self, node: NodeId) {
        let Some(api) = self.nodes[node].api else {
            return;
        };
        let mut names: NameSet = self.apis[api].produces.clone();
        let mut cursor = self.nodes[node].parent;
        while let Some(current) = cursor {
            if names.is_empty() {
                break;
            }
            self.nodes[current]
                .subtree_produces
                .extend(names.iter().cloned());
            if let Some(current_api) = self.nodes[current].api {
                for deleted in &self.apis[current_api].deletes {
                    names.shift_remove(deleted);
                }
            }
            cursor = self.nodes[current].parent;
        }
    }

    fn find_api(&self, name: &str) -> Result<usize, Error> {
        self.apis
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::compile(format!("reference to unknown API '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::expand::ConcreteApi;
    use crate::descriptor::{RequestTemplate, VarNew};
    use crate::jsonpath::JsonPath;
    use indexmap::IndexMap;

    fn api(name: &str, consumes: &[&str], produces: &[&str]) -> ConcreteApi {
        ConcreteApi {
            name: name.into(),
            vhost: "v".into(),
            descriptor: name.into(),
            host_var: "host".into(),
            request: RequestTemplate {
                method: "GET".into(),
                path: format!("/{name}"),
                headers: IndexMap::new(),
                auth: None,
                body: None,
            },
            status: 200,
            schema: None,
            ignore_body: true,
            consumes: consumes.iter().map(|s| (*s).to_string()).collect(),
            produces: produces.iter().map(|s| (*s).to_string()).collect(),
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

    fn predefined(names: &[&str]) -> NameSet {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn build_ok(apis: Vec<ConcreteApi>, pre: &[&str]) -> Plan {
        build(apis, &predefined(pre), &[], &NameSet::new()).expect("plan should build")
    }

    fn child_apis<'a>(plan: &'a Plan, node: NodeId) -> Vec<&'a str> {
        plan.nodes[node]
            .children
            .iter()
            .map(|&c| plan.api_of(c).unwrap().name.as_str())
            .collect()
    }

    #[test]
    fn linear_chain() {
        let login = api("login", &["userName", "userPass"], &["token"]);
        let whoami = api("whoami", &["token"], &[]);
        let plan = build_ok(vec![login, whoami], &["userName", "userPass"]);

        assert_eq!(child_apis(&plan, plan.root), vec!["login"]);
        let login_node = plan.nodes[plan.root].children[0];
        assert_eq!(child_apis(&plan, login_node), vec!["whoami"]);
        assert_eq!(plan.nodes[plan.nodes[login_node].children[0]].label, "1.1");
    }

    #[test]
    fn producer_seeded_even_when_not_requested() {
        let make_x = api("makeX", &[], &["x"]);
        let use_x = api("useX", &["x"], &[]);
        let plan = build(
            vec![make_x, use_x],
            &NameSet::new(),
            &["useX".to_string()],
            &NameSet::new(),
        )
        .expect("plan should build");

        assert_eq!(child_apis(&plan, plan.root), vec!["makeX"]);
        let make_node = plan.nodes[plan.root].children[0];
        assert_eq!(child_apis(&plan, make_node), vec!["useX"]);
    }

    #[test]
    fn no_producer_is_compile_error() {
        let use_x = api("useX", &["x"], &[]);
        let errors = build(vec![use_x], &NameSet::new(), &[], &NameSet::new()).unwrap_err();
        assert!(errors[0].to_string().contains("no producer"), "got: {}", errors[0]);
        assert!(errors[0].to_string().contains('x'));
    }

    #[test]
    fn api_inserted_at_every_satisfying_location() {
        // Both producers of "t" get their own subtree; the consumer lands
        // under each of them.
        let p1 = api("makeT1", &[], &["t"]);
        let p2 = api("makeT2", &[], &["t"]);
        let use_t = api("useT", &["t"], &[]);
        let plan = build_ok(vec![p1, p2, use_t], &[]);

        assert_eq!(child_apis(&plan, plan.root), vec!["makeT1", "makeT2"]);
        for &producer in &plan.nodes[plan.root].children {
            assert_eq!(child_apis(&plan, producer), vec!["useT"]);
        }
    }

    #[test]
    fn no_duplicate_on_a_path() {
        let a = api("a", &[], &["x"]);
        let b = api("b", &["x"], &["x"]);
        let plan = build_ok(vec![a, b], &[]);
        let a_node = plan.nodes[plan.root].children[0];
        let b_node = plan.nodes[a_node].children[0];
        // b produces x again but must not be re-inserted under itself.
        assert!(plan.nodes[b_node].children.is_empty());
    }

    #[test]
    fn referenced_apis_are_not_insertable() {
        let mut create = api("createApp", &["appName"], &["appGuid"]);
        create.var_new = Some(VarNew {
            name: "appGuid".into(),
            source: crate::descriptor::ActionSource::Path(JsonPath::parse("guid").unwrap()),
            get: "getApp".into(),
            delete: "delApp".into(),
            serial_vars: vec!["appName".into()],
        });
        let get = api("getApp", &["appName"], &["appGuid"]);
        let del = api("delApp", &["appGuid"], &[]);
        let plan = build_ok(vec![create, get, del], &["appName"]);

        // Only the constructor is a top-level child; the getter and
        // destructor appear solely as satellites.
        assert_eq!(child_apis(&plan, plan.root), vec!["createApp"]);
        let create_node = plan.nodes[plan.root].children[0];
        let pre = plan.nodes[create_node].pre_run.expect("preRun satellite");
        let post = plan.nodes[create_node].post_run.expect("postRun satellite");
        assert_eq!(plan.api_of(pre).unwrap().name, "getApp");
        assert_eq!(plan.api_of(plan.nodes[pre].children[0]).unwrap().name, "delApp");
        assert_eq!(plan.api_of(post).unwrap().name, "delApp");
        assert!(plan.nodes[pre].satellite);
    }

    #[test]
    fn satellites_do_not_leak_into_sibling_produces() {
        let mut create = api("createApp", &["appName"], &["appGuid"]);
        create.var_new = Some(VarNew {
            name: "appGuid".into(),
            source: crate::descriptor::ActionSource::Path(JsonPath::parse("guid").unwrap()),
            get: "getApp".into(),
            delete: "delApp".into(),
            serial_vars: vec!["appName".into()],
        });
        let get = api("getApp", &["appName"], &["leaked"]);
        let del = api("delApp", &["appGuid"], &[]);
        let plan = build_ok(vec![create, get, del], &["appName"]);
        let create_node = plan.nodes[plan.root].children[0];
        assert!(!plan.nodes[create_node].subtree_produces.contains("leaked"));
        assert!(!plan.nodes[plan.root].subtree_produces.contains("leaked"));
    }

    #[test]
    fn dependency_completeness_invariant() {
        let login = api("login", &["userName"], &["token"]);
        let whoami = api("whoami", &["token"], &["uid"]);
        let detail = api("detail", &["uid", "token"], &[]);
        let pre = predefined(&["userName"]);
        let plan = build(vec![login, whoami, detail], &pre, &[], &NameSet::new()).unwrap();

        for (id, node) in plan.nodes.iter().enumerate() {
            if node.satellite || node.api.is_none() {
                continue;
            }
            let api = plan.api_of(id).unwrap();
            let parent = node.parent.expect("non-root");
            for consumed in &api.consumes {
                assert!(
                    plan.nodes[parent].produces.contains(consumed.as_str())
                        || pre.contains(consumed.as_str()),
                    "'{}' consumed by '{}' is not satisfied",
                    consumed,
                    api.name
                );
            }
        }
    }

    #[test]
    fn group_prefix_filter_selects_apis() {
        let mut a = api("a", &[], &[]);
        a.groups = vec!["smoke-auth".into()];
        let b = api("b", &[], &[]);
        let plan = build(
            vec![a, b],
            &NameSet::new(),
            &["smoke".to_string()],
            &NameSet::new(),
        )
        .unwrap();
        assert_eq!(child_apis(&plan, plan.root), vec!["a"]);
    }

    #[test]
    fn unknown_hook_reference_is_compile_error() {
        let mut a = api("a", &[], &[]);
        a.before = vec![crate::descriptor::Hook {
            name: "nosuch".into(),
            quit: vec![],
            fatal: false,
        }];
        let errors = build(vec![a], &NameSet::new(), &[], &NameSet::new()).unwrap_err();
        assert!(errors[0].to_string().contains("nosuch"));
    }

    #[test]
    fn deletes_block_upward_propagation() {
        let mut eat = api("eat", &["x"], &["y"]);
        eat.deletes = ["x".to_string()].into_iter().collect();
        let make = api("make", &[], &["x"]);
        let plan = build_ok(vec![make, eat], &[]);
        let make_node = plan.nodes[plan.root].children[0];
        let eat_node = plan.nodes[make_node].children[0];
        // eat deleted x from its own availability set.
        assert!(!plan.nodes[eat_node].produces.contains("x"));
        assert!(plan.nodes[eat_node].produces.contains("y"));
    }

    #[test]
    fn render_shows_tree_shape() {
        let login = api("login", &[], &["token"]);
        let whoami = api("whoami", &["token"], &[]);
        let plan = build_ok(vec![login, whoami], &[]);
        let rendered = plan.render();
        assert!(rendered.contains("1 login"));
        assert!(rendered.contains("1.1 whoami"));
    }
}
