//! Helpers for inspecting mounts via findmnt.

use std::process::Command;

use anyhow::{anyhow, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use ferrite_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<Filesystem>,
}

/// A mounted filesystem as reported by `findmnt`.
#[derive(Debug, Deserialize)]
pub struct Filesystem {
    /// The device backing the mount. `findmnt -v` reports the plain
    /// source device even for e.g. bind mounts.
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: Option<String>,
}

#[context("Inspecting filesystem {path}")]
pub fn inspect_filesystem(path: &Utf8Path) -> Result<Filesystem> {
    let o: FindmntOutput = Command::new("findmnt")
        .args([
            "--json",
            "-v",
            "--output",
            "SOURCE,TARGET,FSTYPE,OPTIONS",
            path.as_str(),
        ])
        .log_debug()
        .run_and_parse_json()?;
    o.filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("findmnt returned no filesystems for {path}"))
}
