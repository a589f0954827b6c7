//! Plan execution.
//!
//! The runtime walks the compiled tree: per node and per variable
//! combination it runs the nine-stage waterfall (preRun, onBeforeRun,
//! before, main request, afterApi, children, afterAll, onAfterRun,
//! postRun). The first error wins, but cleanup stages still run on the
//! stage-progress rules, so a destructor fires even when a later hook
//! failed. Children execute concurrently on deep-copied environments;
//! serialization queues gate the main request through postRun.
//!
//! Every context failure is logged exactly once, where it happens; parents
//! only observe a boolean and never re-log.

pub mod hooks;
pub mod http;
pub mod queue;
pub mod validate;

use crate::constants::DEFAULT_TIMEOUT_MS;
use crate::descriptor::actions::{Action, ActionSource};
use crate::descriptor::{ConcreteApi, Hook};
use crate::error::Error;
use crate::planner::{NodeId, Plan};
use crate::subst;
use crate::vars::Environment;
use hooks::{FcnRegistry, HookCtx, HookRegistry};
use http::{Dispatch, HttpRequest};
use queue::SerialQueues;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Run-wide settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Default per-request timeout.
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Outcome of a full run.
#[derive(Debug)]
pub struct RunReport {
    /// Contexts that completed their waterfall without error.
    pub passed: usize,
    /// Contexts that failed (failure-ignoring contexts excluded).
    pub failed: usize,
    pub duration: Duration,
}

impl RunReport {
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.failed == 0
    }
}

struct Core {
    plan: Plan,
    client: Arc<dyn Dispatch>,
    queues: SerialQueues,
    hooks: HookRegistry,
    fcns: FcnRegistry,
    timeout: Duration,
    passed: AtomicUsize,
    failed: AtomicUsize,
}

/// Executes a compiled plan.
pub struct Runtime {
    core: Arc<Core>,
}

impl Runtime {
    #[must_use]
    pub fn new(
        plan: Plan,
        client: Arc<dyn Dispatch>,
        hooks: HookRegistry,
        fcns: FcnRegistry,
        options: RunOptions,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                plan,
                client,
                queues: SerialQueues::new(),
                hooks,
                fcns,
                timeout: options.timeout,
                passed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs the whole tree against a starting environment. Top-level
    /// subtrees run concurrently, each on its own environment fork;
    /// sibling failures do not cancel each other.
    pub async fn run(&self, env: &Environment) -> RunReport {
        let started = Instant::now();
        let root = self.core.plan.root;
        let mut set = JoinSet::new();
        for &child in &self.core.plan.nodes[root].children {
            set.spawn(run_node(Arc::clone(&self.core), child, env.fork(), false));
        }
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "subtree task panicked");
                self.core.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        RunReport {
            passed: self.core.passed.load(Ordering::Relaxed),
            failed: self.core.failed.load(Ordering::Relaxed),
            duration: started.elapsed(),
        }
    }
}

type BoxedRun = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Runs one node: expands the environment into variable combinations and
/// executes the waterfall for each, in order. Returns overall success
/// (always true in failure-ignoring mode).
fn run_node(core: Arc<Core>, node: NodeId, env: Environment, ignore: bool) -> BoxedRun {
    Box::pin(async move {
        let Some(api_idx) = core.plan.nodes[node].api else {
            return true;
        };
        let label = core.plan.nodes[node].label.clone();
        let consumes = core.plan.apis[api_idx].consumes.clone();

        let combos = env.combinations(&consumes);
        if combos.is_empty() {
            record_failure(
                &core,
                node,
                ignore,
                &label,
                &core.plan.apis[api_idx].name,
                "expand",
                &Error::runtime("variable expansion produced zero combinations"),
            );
            return ignore;
        }

        let multi = combos.len() > 1;
        let mut all_ok = true;
        for (index, combo_env) in combos.into_iter().enumerate() {
            let id = if multi {
                format!("{label}#{index}")
            } else {
                label.clone()
            };
            all_ok &= waterfall(&core, node, api_idx, combo_env, &id, ignore).await;
        }
        all_ok || ignore
    })
}

/// The nine-stage waterfall for one run context.
///
/// Stage gating: before and main need onBeforeRun; afterApi needs main;
/// children and afterAll need afterApi; onAfterRun needs onBeforeRun;
/// postRun needs before. The first error is remembered; later failures are
/// still logged where they occur.
#[allow(clippy::too_many_lines)]
async fn waterfall(
    core: &Arc<Core>,
    node: NodeId,
    api_idx: usize,
    mut env: Environment,
    id: &str,
    ignore: bool,
) -> bool {
    let api = &core.plan.apis[api_idx];
    let plan_node = &core.plan.nodes[node];
    let mut first_err: Option<Error> = None;
    let mut note = |stage: &str, err: Error| {
        log_failure(ignore, id, &api.name, stage, &err);
        if first_err.is_none() {
            first_err = Some(err);
        }
    };

    // 1. preRun: leftover-state cleanup, failures ignored.
    if let Some(pre) = plan_node.pre_run {
        run_node(Arc::clone(core), pre, env.fork(), true).await;
    }

    // 2. onBeforeRun
    let mut ob_ok = true;
    if let Some(name) = &api.on_before_run {
        if let Err(e) = run_user_hook(core, name, &mut env).await {
            note("onBeforeRun", e);
            ob_ok = false;
        }
    }

    // 3. before
    let mut before_ok = false;
    if ob_ok {
        match run_hook_chain(core, &api.before, &mut env, id).await {
            Ok(()) => before_ok = true,
            Err(e) => note("before", e),
        }
    }

    // 4. main request, gated by the serialization queues.
    let mut held_keys: Vec<String> = Vec::new();
    let mut main_ok = false;
    if before_ok {
        match queue_keys(api, &env) {
            Err(e) => note("main", e),
            Ok(keys) => {
                for key in keys {
                    core.queues.acquire(&key).await;
                    held_keys.push(key);
                }
                let (_, result) = execute_api(core, api, &mut env, id).await;
                match result {
                    Ok(()) => main_ok = true,
                    Err(e) => note("main", e),
                }
            }
        }
    }

    // 5. afterApi
    let mut after_api_ok = false;
    if main_ok {
        match run_hook_chain(core, &api.after_api, &mut env, id).await {
            Ok(()) => after_api_ok = true,
            Err(e) => note("afterApi", e),
        }
    }

    // 6. children, concurrently on forked environments.
    let mut children_ok = true;
    if after_api_ok {
        let mut set = JoinSet::new();
        for &child in &plan_node.children {
            set.spawn(run_node(Arc::clone(core), child, env.fork(), ignore));
        }
        while let Some(result) = set.join_next().await {
            children_ok &= result.unwrap_or(false);
        }
    }

    // 7. afterAll: needs afterApi, not the children.
    if after_api_ok {
        if let Err(e) = run_hook_chain(core, &api.after_all, &mut env, id).await {
            note("afterAll", e);
        }
    }

    // 8. onAfterRun
    if ob_ok {
        if let Some(name) = &api.on_after_run {
            if let Err(e) = run_user_hook(core, name, &mut env).await {
                note("onAfterRun", e);
            }
        }
    }

    // 9. postRun: the destructor subtree; runs whenever `before` succeeded
    // so state created by the main request is torn down even after later
    // hook failures.
    let mut post_ok = true;
    if before_ok {
        if let Some(post) = plan_node.post_run {
            post_ok = run_node(Arc::clone(core), post, env.fork(), ignore).await;
        }
    }

    for key in held_keys.iter().rev() {
        core.queues.release(key).await;
    }

    let ok = first_err.is_none() && children_ok && post_ok;
    if !ignore && !plan_node.satellite {
        let counter = if ok { &core.passed } else { &core.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }
    ok || ignore
}

fn log_failure(ignore: bool, id: &str, api: &str, stage: &str, err: &Error) {
    if ignore {
        tracing::debug!(ctx = %id, api = %api, stage = %stage, error = %err, "ignored failure");
    } else {
        tracing::error!(ctx = %id, api = %api, stage = %stage, error = %err, "context failed");
    }
}

fn record_failure(
    core: &Core,
    node: NodeId,
    ignore: bool,
    id: &str,
    api: &str,
    stage: &str,
    err: &Error,
) {
    log_failure(ignore, id, api, stage, err);
    if !ignore && !core.plan.nodes[node].satellite {
        core.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queue keys this context must hold through its waterfall: the implicit
/// combination-variant key, then the `serial_vars` resource key.
fn queue_keys(api: &ConcreteApi, env: &Environment) -> Result<Vec<String>, Error> {
    let mut keys = Vec::new();
    if let Some(combo) = &api.combo_key {
        keys.push(combo.clone());
    }
    if !api.serial_vars.is_empty() {
        let parts = api
            .serial_vars
            .iter()
            .map(|name| {
                env.textual(name)
                    .map(|value| format!("{name}={value}"))
                    .ok_or_else(|| {
                        Error::runtime(format!(
                            "serialization variable '{name}' has no value in API '{}'",
                            api.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        keys.push(parts.join(","));
    }
    Ok(keys)
}

/// Substitutes, dispatches, validates, and applies actions for one API.
/// Returns the actual status (when a response arrived) so hook chains can
/// match their `quit` lists even on validation failure.
async fn execute_api(
    core: &Core,
    api: &ConcreteApi,
    env: &mut Environment,
    id: &str,
) -> (Option<u16>, Result<(), Error>) {
    let request = match build_request(api, env, core.timeout) {
        Ok(request) => request,
        Err(e) => return (None, Err(e)),
    };
    tracing::debug!(ctx = %id, api = %api.name, method = %request.method, url = %request.url, "request");

    let response = match core.client.dispatch(&request).await {
        Ok(response) => response,
        Err(e) => return (None, Err(e)),
    };
    let status = response.status;

    let body = match validate::validate_response(api, &response) {
        Ok(body) => body,
        Err(e) => return (Some(status), Err(e)),
    };

    if let Err(e) = apply_actions(core, api, env, body.as_ref()) {
        return (Some(status), Err(e));
    }
    (Some(status), Ok(()))
}

/// Resolves every `$var` in the request template and prefixes the path
/// with the virtual host's runtime value.
fn build_request(
    api: &ConcreteApi,
    env: &Environment,
    timeout: Duration,
) -> Result<HttpRequest, Error> {
    let host = env.textual(&api.host_var).ok_or_else(|| {
        Error::substitution(format!(
            "host variable '{}' is not defined (API '{}')",
            api.host_var, api.name
        ))
    })?;
    let path = subst::subst_str(&api.request.path, env)?;
    let headers = api
        .request
        .headers
        .iter()
        .map(|(k, v)| Ok((subst::subst_str(k, env)?, subst::subst_str(v, env)?)))
        .collect::<Result<_, Error>>()?;
    let auth = api
        .request
        .auth
        .as_ref()
        .map(|auth| {
            Ok::<_, Error>((
                subst::subst_str(&auth.username, env)?,
                subst::subst_str(&auth.password, env)?,
            ))
        })
        .transpose()?;
    let body = api
        .request
        .body
        .as_ref()
        .map(|body| subst::subst_value(body, env))
        .transpose()?;

    Ok(HttpRequest {
        method: api.request.method.clone(),
        url: format!("{host}{path}"),
        headers,
        auth,
        body,
        timeout,
    })
}

/// Applies the API's actions to the environment in scanning order.
fn apply_actions(
    core: &Core,
    api: &ConcreteApi,
    env: &mut Environment,
    body: Option<&Value>,
) -> Result<(), Error> {
    for action in &api.actions {
        match action {
            Action::Set { name, source } | Action::New { name, source } => {
                let (value, multi) = eval_source(core, api, source, body, env)?;
                if multi {
                    match value {
                        Value::Array(items) => env.set_multi(name, items),
                        other => env.set(name, other),
                    }
                } else {
                    env.set(name, value);
                }
                tracing::debug!(api = %api.name, var = %name, "variable set");
            }
            Action::Rename { from, to } => env.rename(from, to)?,
            Action::Delete { name } => {
                env.delete(name);
            }
        }
    }
    Ok(())
}

/// Evaluates a `var_set`/`var_new` source. A path containing `[]` yields a
/// multi-valued binding (one combination per extracted element).
fn eval_source(
    core: &Core,
    api: &ConcreteApi,
    source: &ActionSource,
    body: Option<&Value>,
    env: &Environment,
) -> Result<(Value, bool), Error> {
    match source {
        ActionSource::Path(path) => {
            let body = body.ok_or_else(|| {
                Error::runtime(format!(
                    "API '{}': no JSON body to extract '{path}' from",
                    api.name
                ))
            })?;
            Ok((path.extract(body)?, path.fans_out()))
        }
        ActionSource::Fcn(name) => {
            let fcn = core.fcns.get(name).ok_or_else(|| {
                Error::runtime(format!("extraction function '{name}' is not registered"))
            })?;
            Ok((fcn(body.unwrap_or(&Value::Null))?, false))
        }
        ActionSource::Value(template) => Ok((
            subst::subst_value(&Value::String(template.clone()), env)?,
            false,
        )),
    }
}

/// Runs an `onBeforeRun`/`onAfterRun` user callback.
async fn run_user_hook(core: &Core, name: &str, env: &mut Environment) -> Result<(), Error> {
    let hook = core
        .hooks
        .get(name)
        .ok_or_else(|| Error::hook(format!("'{name}' is not a registered function")))?;
    let mut ctx = HookCtx::new(env, core.client.as_ref());
    hook.call(&mut ctx)
        .await
        .map_err(|e| Error::hook(format!("{name}: {e}")))
}

/// Runs a hook chain in order. A hook naming a peer API runs that API
/// inline against the current environment: a status listed in `quit` ends
/// the chain silently, a failure is fatal only when the hook says so. A
/// user hook ends the chain by calling `set_break(true)`.
async fn run_hook_chain(
    core: &Core,
    chain: &[Hook],
    env: &mut Environment,
    id: &str,
) -> Result<(), Error> {
    for hook in chain {
        if let Some(peer) = core.plan.apis.iter().position(|a| a.name == hook.name) {
            let peer_api = &core.plan.apis[peer];
            let (status, result) = execute_api(core, peer_api, env, id).await;
            if let Some(code) = status {
                if hook.quit.contains(&code) {
                    tracing::debug!(ctx = %id, hook = %hook.name, status = code, "quit status ends hook chain");
                    return Ok(());
                }
            }
            if let Err(e) = result {
                if hook.fatal {
                    return Err(Error::hook(format!("hook API '{}': {e}", hook.name)));
                }
                tracing::warn!(ctx = %id, hook = %hook.name, error = %e, "non-fatal hook API failure");
            }
            continue;
        }

        let user = core
            .hooks
            .get(&hook.name)
            .ok_or_else(|| Error::hook(format!("'{}' is not a registered function", hook.name)))?;
        let mut ctx = HookCtx::new(env, core.client.as_ref());
        user.call(&mut ctx)
            .await
            .map_err(|e| Error::hook(format!("{}: {e}", hook.name)))?;
        if ctx.is_break() {
            return Ok(());
        }
    }
    Ok(())
}
