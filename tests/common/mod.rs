//! Shared fixtures: temp project directories for loader-driven tests.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Creates a project skeleton with a root manifest and one `uaa` virtual
/// host directory.
pub fn project(vars_yaml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let manifest = if vars_yaml.trim().is_empty() {
        "vars: {}\n".to_string()
    } else {
        format!("vars:\n{vars_yaml}")
    };
    fs::write(dir.path().join("hdt.yaml"), manifest).unwrap();
    let vhost = dir.path().join("uaa");
    fs::create_dir(&vhost).unwrap();
    fs::write(vhost.join("vhost.yaml"), VHOST_MANIFEST).unwrap();
    dir
}

pub const VHOST_MANIFEST: &str = concat!(
    "host_variable: uaaHost\n",
    "swagger:\n",
    "  info: { title: Test host, version: '1.0' }\n",
);

/// Writes one descriptor file into the `uaa` virtual host.
pub fn descriptor(root: &Path, file: &str, yaml: &str) {
    fs::write(root.join("uaa").join(file), yaml).unwrap();
}
