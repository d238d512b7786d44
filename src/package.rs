//! Package manifest metadata for services

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

pub const MANIFEST_FILE: &str = "package.json";

/// The subset of `package.json` the proxy cares about
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

impl PackageInfo {
    /// Read the manifest in `dir`, returning `None` when there is none
    pub fn read(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let info = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(info))
    }
}
