//! Descriptor model: virtual hosts, multi-response API descriptors, and the
//! concrete APIs the planner schedules.
//!
//! A descriptor is the on-disk unit (one request template, one response
//! descriptor per status code). Expansion (see [`expand`]) explodes it into
//! concrete APIs, one per (response, test variant, variable combination).

pub mod actions;
pub mod expand;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use serde_json::Value;

pub use actions::{Action, ActionSource, VarNew};
pub use expand::ConcreteApi;

/// A namespace grouping descriptors. Its `host_variable` resolves at
/// runtime to the scheme+authority prefix of every request path it owns.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualHost {
    #[serde(skip)]
    pub name: String,
    pub host_variable: String,
    /// Static Swagger header fields (`info`, `basePath`, ...).
    #[serde(default)]
    pub swagger: IndexMap<String, Value>,
}

/// Basic-auth pair; both fields may contain `$var` placeholders.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// The request half of a descriptor, still symbolic in `$var`.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestTemplate {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// A lifecycle hook as declared on disk: either a bare name or the full
/// object form with `quit` statuses and a `fatal` flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HookDecl {
    Name(String),
    Full {
        hook: String,
        #[serde(default)]
        quit: Vec<u16>,
        #[serde(default)]
        fatal: bool,
    },
}

impl HookDecl {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Full { hook: name, .. } => name,
        }
    }
}

/// Normalized hook carried by a concrete API. The name resolves to either
/// a peer API or a registered hook function at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub quit: Vec<u16>,
    pub fatal: bool,
}

impl From<&HookDecl> for Hook {
    fn from(decl: &HookDecl) -> Self {
        match decl {
            HookDecl::Name(name) => Self {
                name: name.clone(),
                quit: Vec::new(),
                fatal: false,
            },
            HookDecl::Full { hook, quit, fatal } => Self {
                name: hook.clone(),
                quit: quit.clone(),
                fatal: *fatal,
            },
        }
    }
}

/// Hook chains and run callbacks attachable at descriptor or response level.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookSet {
    #[serde(default)]
    pub before: Vec<HookDecl>,
    #[serde(default, rename = "afterApi")]
    pub after_api: Vec<HookDecl>,
    #[serde(default, rename = "afterAll")]
    pub after_all: Vec<HookDecl>,
    #[serde(default, rename = "onBeforeRun")]
    pub on_before_run: Option<String>,
    #[serde(default, rename = "onAfterRun")]
    pub on_after_run: Option<String>,
}

impl HookSet {
    /// Per-field overlay: a field set here wins, otherwise the fallback's.
    #[must_use]
    pub fn merged(&self, fallback: &Self) -> Self {
        Self {
            before: pick(&self.before, &fallback.before),
            after_api: pick(&self.after_api, &fallback.after_api),
            after_all: pick(&self.after_all, &fallback.after_all),
            on_before_run: self
                .on_before_run
                .clone()
                .or_else(|| fallback.on_before_run.clone()),
            on_after_run: self
                .on_after_run
                .clone()
                .or_else(|| fallback.on_after_run.clone()),
        }
    }

    /// Names of every declared hook, for reference validation.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.before
            .iter()
            .chain(&self.after_api)
            .chain(&self.after_all)
            .map(HookDecl::name)
    }
}

fn pick(primary: &[HookDecl], fallback: &[HookDecl]) -> Vec<HookDecl> {
    if primary.is_empty() {
        fallback.to_vec()
    } else {
        primary.to_vec()
    }
}

/// One explicit test variant on a response, used to force that status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestVariant {
    #[serde(default)]
    pub name: Option<String>,
    /// Variable overrides grounded into the base request.
    #[serde(default)]
    pub vars: IndexMap<String, Value>,
    /// Remaining fields, scanned for actions.
    #[serde(flatten)]
    pub rest: IndexMap<String, Value>,
}

/// Per-status response descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseDescriptor {
    #[serde(default)]
    pub descr: String,
    /// Body sketch (see the schema module); may embed actions.
    #[serde(default)]
    pub body: Option<Value>,
    /// Dotted-path → JSON Schema fragment overlay.
    #[serde(default)]
    pub bodymd: IndexMap<String, Value>,
    #[serde(default)]
    pub ignore_body: bool,
    #[serde(default)]
    pub tests: Vec<TestVariant>,
    #[serde(default)]
    pub serial_vars: Option<Vec<String>>,
    #[serde(flatten)]
    pub hooks: HookSet,
}

/// A multi-response API descriptor as loaded from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDescriptor {
    /// Defaults to the descriptor file stem.
    #[serde(default)]
    pub name: String,
    #[serde(skip)]
    pub vhost: String,
    #[serde(default)]
    pub descr: String,
    /// Excluded from emitted documentation.
    #[serde(default)]
    pub private: bool,
    pub request: RequestTemplate,
    pub responses: IndexMap<u16, ResponseDescriptor>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Name-prefix matchers usable with the test filter.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Extra consumed variables beyond the request's `$var` references.
    #[serde(default)]
    pub consumes: Vec<String>,
    /// Extra produced variables beyond action-derived ones.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(flatten)]
    pub hooks: HookSet,
}

impl ApiDescriptor {
    /// Responses in ascending status order; the first is the unit that
    /// keeps the bare descriptor name.
    #[must_use]
    pub fn sorted_statuses(&self) -> Vec<u16> {
        let mut statuses: Vec<u16> = self.responses.keys().copied().collect();
        statuses.sort_unstable();
        statuses
    }
}

/// Convenience alias for produced/consumed/deleted name sets, which keep
/// insertion order for deterministic planning.
pub type NameSet = IndexSet<String>;
