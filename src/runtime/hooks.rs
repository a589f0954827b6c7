//! User hook and extraction-function registries.
//!
//! Lifecycle hooks declared in descriptor files may name registered Rust
//! functions; `onBeforeRun`/`onAfterRun` callbacks always do. A hook runs
//! against a [`HookCtx`] exposing the context's environment, the break
//! flag that short-circuits the rest of its chain, and ad-hoc HTTP
//! dispatch through the run's shared client.

use crate::descriptor::NameSet;
use crate::error::Error;
use crate::runtime::http::{Dispatch, HttpRequest, HttpResponse};
use crate::vars::Environment;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Hook execution context: a child view over one run context.
pub struct HookCtx<'a> {
    env: &'a mut Environment,
    client: &'a dyn Dispatch,
    brk: bool,
}

impl<'a> HookCtx<'a> {
    pub(crate) fn new(env: &'a mut Environment, client: &'a dyn Dispatch) -> Self {
        Self {
            env,
            client,
            brk: false,
        }
    }

    #[must_use]
    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.env.get(name).cloned()
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.env.set(name, value);
    }

    pub fn delete_var(&mut self, name: &str) -> Option<Value> {
        self.env.delete(name)
    }

    /// # Errors
    ///
    /// Returns a runtime error if `from` is not bound.
    pub fn rename_var(&mut self, from: &str, to: &str) -> Result<(), Error> {
        self.env.rename(from, to)
    }

    #[must_use]
    pub fn is_break(&self) -> bool {
        self.brk
    }

    /// Terminates the remaining hooks of the chain without error.
    pub fn set_break(&mut self, brk: bool) {
        self.brk = brk;
    }

    /// Dispatches an ad-hoc request through the run's shared client (and
    /// cookie jar).
    ///
    /// # Errors
    ///
    /// Returns a transport error if dispatch fails.
    pub async fn send_request(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        self.client.dispatch(request).await
    }
}

/// A user-registered hook body.
#[async_trait]
pub trait RunHook: Send + Sync {
    async fn call(&self, ctx: &mut HookCtx<'_>) -> Result<(), Error>;
}

/// Adapter so plain closures register as hooks.
struct FnHook<F>(F);

#[async_trait]
impl<F> RunHook for FnHook<F>
where
    F: Fn(&mut HookCtx<'_>) -> Result<(), Error> + Send + Sync,
{
    async fn call(&self, ctx: &mut HookCtx<'_>) -> Result<(), Error> {
        (self.0)(ctx)
    }
}

/// Named registry of user hooks and run callbacks.
#[derive(Clone, Default)]
pub struct HookRegistry {
    map: HashMap<String, Arc<dyn RunHook>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, hook: impl RunHook + 'static) {
        self.map.insert(name.to_string(), Arc::new(hook));
    }

    /// Registers a synchronous closure as a hook.
    pub fn register_fn<F>(&mut self, name: &str, hook: F)
    where
        F: Fn(&mut HookCtx<'_>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.register(name, FnHook(hook));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RunHook>> {
        self.map.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> NameSet {
        self.map.keys().cloned().collect()
    }
}

/// An extraction function applied to a response body (`var_set.fcn`).
pub type Fcn = Arc<dyn Fn(&Value) -> Result<Value, Error> + Send + Sync>;

/// Named registry of extraction functions.
#[derive(Clone, Default)]
pub struct FcnRegistry {
    map: HashMap<String, Fcn>,
}

impl FcnRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, fcn: F)
    where
        F: Fn(&Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.map.insert(name.to_string(), Arc::new(fcn));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Fcn> {
        self.map.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> NameSet {
        self.map.keys().cloned().collect()
    }
}
