//! Directory loader.
//!
//! A project root holds `hdt.yaml` (the global variable catalogue), plus
//! one subdirectory per virtual host, each with a `vhost.yaml` manifest
//! (`host_variable` and the Swagger header) and one descriptor file per
//! API. A `.hdtignore` file carries line-delimited glob patterns that
//! subtract from the default include set; `swagger-*` files are always
//! excluded. Load errors accumulate and are reported together.

use crate::constants::{IGNORE_FILE, ROOT_MANIFEST, SWAGGER_PREFIX, VHOST_MANIFEST};
use crate::descriptor::{ApiDescriptor, VirtualHost};
use crate::error::Error;
use crate::vars::{Catalogue, VarDef, VarSpec};
use globset::{Glob, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Everything loaded from a project directory.
#[derive(Debug, Default)]
pub struct Project {
    pub catalogue: Catalogue,
    pub vhosts: Vec<VirtualHost>,
    pub descriptors: Vec<ApiDescriptor>,
}

impl Project {
    #[must_use]
    pub fn vhost(&self, name: &str) -> Option<&VirtualHost> {
        self.vhosts.iter().find(|v| v.name == name)
    }
}

#[derive(Deserialize, Default)]
struct RawManifest {
    #[serde(default)]
    vars: IndexMap<String, RawVarDef>,
}

#[derive(Deserialize, Default)]
struct RawVarDef {
    #[serde(default)]
    descr: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    values: Option<Vec<Value>>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    base64: Option<String>,
}

/// Loads a project directory.
///
/// # Errors
///
/// Returns every load error found: missing or malformed manifests,
/// invalid variable definitions, and bad descriptor files.
pub fn load_dir(root: &Path) -> Result<Project, Vec<Error>> {
    let mut errors = Vec::new();
    let mut project = Project::default();

    match load_catalogue(&root.join(ROOT_MANIFEST)) {
        Ok(catalogue) => project.catalogue = catalogue,
        Err(e) => errors.push(e),
    }

    let ignore = match load_ignore(&root.join(IGNORE_FILE)) {
        Ok(ignore) => ignore,
        Err(e) => {
            errors.push(e);
            None
        }
    };

    let mut vhost_dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_dir())
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    vhost_dirs.sort();

    for dir in vhost_dirs {
        let manifest = dir.join(VHOST_MANIFEST);
        if !manifest.is_file() {
            tracing::debug!(dir = %dir.display(), "skipping directory without a vhost manifest");
            continue;
        }
        let vhost_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match load_vhost(&manifest, &vhost_name) {
            Ok(vhost) => project.vhosts.push(vhost),
            Err(e) => {
                errors.push(e);
                continue;
            }
        }

        for file in descriptor_files(&dir, ignore.as_ref(), root) {
            match load_descriptor(&file, &vhost_name) {
                Ok(descriptor) => project.descriptors.push(descriptor),
                Err(e) => errors.push(e),
            }
        }
    }

    if errors.is_empty() {
        Ok(project)
    } else {
        Err(errors)
    }
}

fn load_catalogue(path: &Path) -> Result<Catalogue, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
    let manifest: RawManifest = serde_yaml::from_str(&text)
        .map_err(|e| Error::load(format!("{}: {e}", path.display())))?;

    let mut catalogue = Catalogue::new();
    for (name, raw) in manifest.vars {
        catalogue.insert(var_def(&name, raw)?);
    }
    Ok(catalogue)
}

fn var_def(name: &str, raw: RawVarDef) -> Result<VarDef, Error> {
    let sources = usize::from(raw.value.is_some())
        + usize::from(raw.values.is_some())
        + usize::from(raw.template.is_some())
        + usize::from(raw.base64.is_some());
    if sources > 1 {
        return Err(Error::load(format!(
            "variable '{name}' declares more than one of value/values/template/base64"
        )));
    }
    let spec = if let Some(value) = raw.value {
        Some(VarSpec::Scalar(value))
    } else if let Some(values) = raw.values {
        Some(VarSpec::Enumeration(values))
    } else if let Some(template) = raw.template {
        Some(VarSpec::Template(template))
    } else {
        raw.base64.map(VarSpec::Base64)
    };
    Ok(VarDef {
        name: name.to_string(),
        descr: raw.descr,
        spec,
    })
}

fn load_ignore(path: &Path) -> Result<Option<GlobSet>, Error> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
    let mut builder = GlobSetBuilder::new();
    for line in text.lines() {
        let pattern = line.trim();
        if pattern.is_empty() || pattern.starts_with('#') {
            continue;
        }
        let glob = Glob::new(pattern)
            .map_err(|e| Error::load(format!("bad ignore pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| Error::load(format!("{}: {e}", path.display())))?;
    Ok(Some(set))
}

/// Descriptor files in a vhost directory, sorted by file name.
fn descriptor_files(dir: &Path, ignore: Option<&GlobSet>, root: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name == VHOST_MANIFEST || name.starts_with('.') || name.starts_with(SWAGGER_PREFIX)
            {
                return false;
            }
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                return false;
            }
            if let Some(ignore) = ignore {
                let relative = path.strip_prefix(root).unwrap_or(path);
                if ignore.is_match(relative) || ignore.is_match(&name) {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn load_vhost(path: &Path, name: &str) -> Result<VirtualHost, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
    let mut vhost: VirtualHost = serde_yaml::from_str(&text)
        .map_err(|e| Error::load(format!("{}: {e}", path.display())))?;
    vhost.name = name.to_string();
    Ok(vhost)
}

fn load_descriptor(path: &Path, vhost: &str) -> Result<ApiDescriptor, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
    let mut descriptor: ApiDescriptor = serde_yaml::from_str(&text)
        .map_err(|e| Error::load(format!("{}: {e}", path.display())))?;

    if descriptor.name.is_empty() {
        descriptor.name = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    descriptor.vhost = vhost.to_string();

    let method = descriptor.request.method.to_ascii_uppercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(Error::load(format!(
            "{}: unknown HTTP method '{}'",
            path.display(),
            descriptor.request.method
        )));
    }
    descriptor.request.method = method;

    if descriptor.responses.is_empty() {
        return Err(Error::load(format!(
            "{}: descriptor declares no responses",
            path.display()
        )));
    }
    Ok(descriptor)
}

/// Merges `--config` JSON variable files, left to right.
///
/// # Errors
///
/// Returns a load error when a file is unreadable or not a JSON object.
pub fn load_var_files(paths: &[PathBuf]) -> Result<IndexMap<String, Value>, Error> {
    let mut merged = IndexMap::new();
    for path in paths {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| Error::load(format!("{}: {e}", path.display())))?;
        let Value::Object(map) = value else {
            return Err(Error::load(format!(
                "{}: variable file must hold a JSON object",
                path.display()
            )));
        };
        for (name, value) in map {
            merged.insert(name, value);
        }
    }
    Ok(merged)
}

/// Parses repeated `--var NAME=VALUE` overrides.
///
/// # Errors
///
/// Returns a load error when an override has no `=`.
pub fn parse_var_overrides(specs: &[String]) -> Result<IndexMap<String, Value>, Error> {
    let mut overrides = IndexMap::new();
    for spec in specs {
        let Some((name, value)) = spec.split_once('=') else {
            return Err(Error::load(format!(
                "invalid --var '{spec}': expected NAME=VALUE"
            )));
        };
        overrides.insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(overrides)
}
