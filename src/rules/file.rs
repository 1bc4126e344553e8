//! Rule file documents and rule spec resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A Prometheus rule file.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleFile {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

/// A named list of rules evaluated in declaration order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleGroup {
    pub name: String,
    /// Accepted for compatibility; evaluation is driven by the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One rule entry as written in the file. Exactly one of `record` and
/// `alert` must be set.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(default)]
    pub expr: String,
    /// Pending duration. Alerts fire on the first pass regardless.
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl RuleFile {
    /// Read and parse a rule file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let txt = fs::read_to_string(path)?;
        Self::parse(&txt)
    }

    /// Parse a rule document. An empty document has no groups.
    pub fn parse(txt: &str) -> Result<Self> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }
}

fn is_glob(spec: &str) -> bool {
    spec.contains(['*', '?', '['])
}

fn is_rule_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().and_then(|e| e.to_str()).is_some_and(|e| e == "yml" || e == "yaml")
}

/// Expand a rule spec into the list of files it names.
///
/// A spec containing `*`, `?` or `[` is a glob. A directory contributes its
/// `.yml`/`.yaml` files (not recursive). Anything else is a single file.
/// Results are sorted; an empty list is not an error.
pub fn resolve(spec: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    if is_glob(spec) {
        for entry in glob::glob(spec)? {
            let path = entry.map_err(|e| Error::Io(e.into()))?;
            if path.is_file() {
                paths.push(path);
            }
        }
    } else {
        let path = Path::new(spec);
        if fs::metadata(path)?.is_dir() {
            for entry in fs::read_dir(path)? {
                let path = entry?.path();
                if is_rule_file(&path) {
                    paths.push(path);
                }
            }
        } else {
            paths.push(path.to_path_buf());
        }
    }

    paths.sort();
    Ok(paths)
}
