//! Compilation pipeline: loaded project → expanded corpus → execution plan.

use crate::descriptor::expand::{self, ConcreteApi};
use crate::descriptor::NameSet;
use crate::error::Error;
use crate::loader::Project;
use crate::planner::{self, Plan};
use crate::vars::Environment;
use indexmap::IndexMap;
use serde_json::Value;

/// A compiled project ready to run: the plan plus the starting
/// environment (resolved catalogue overlaid with config/CLI variables).
#[derive(Debug)]
pub struct Compiled {
    pub plan: Plan,
    pub env: Environment,
}

/// Expands every descriptor and builds the execution tree.
///
/// `extra_vars` (config files and `--var` overrides) take precedence over
/// catalogue values and count as predefined for dependency satisfaction.
/// `filters` holds the requested test-name prefixes; `registered` the
/// names of programmatically registered hooks and extraction functions.
///
/// # Errors
///
/// Load and compile errors accumulate and are returned together; nothing
/// runs when any are present.
pub fn compile_project(
    project: &Project,
    extra_vars: &IndexMap<String, Value>,
    filters: &[String],
    registered: &NameSet,
) -> Result<Compiled, Vec<Error>> {
    let mut env = match project.catalogue.resolve() {
        Ok(env) => env,
        Err(e) => return Err(vec![e]),
    };
    for (name, value) in extra_vars {
        env.set(name, value.clone());
    }

    let mut errors = Vec::new();
    let mut corpus: Vec<ConcreteApi> = Vec::new();
    for descriptor in &project.descriptors {
        let Some(vhost) = project.vhost(&descriptor.vhost) else {
            errors.push(Error::compile(format!(
                "descriptor '{}' belongs to unknown virtual host '{}'",
                descriptor.name, descriptor.vhost
            )));
            continue;
        };
        match expand::expand(descriptor, &project.catalogue, &vhost.host_variable) {
            Ok(apis) => corpus.extend(apis),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let predefined: NameSet = env.names().map(str::to_string).collect();
    let plan = planner::build(corpus, &predefined, filters, registered)?;
    Ok(Compiled { plan, env })
}
