//! Recording and alerting rules layered over the store.
//!
//! A rule set is activated from one or more rule files and then evaluated in
//! passes at a chosen instant. Each pass appends the derived samples to the
//! same store the rules read from.

mod eval;
mod file;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub use eval::{evaluate, AlertNotification, EvalReport, NotificationSink, ALERTS_METRIC};
pub use file::{resolve, RuleConfig, RuleFile, RuleGroup};

use crate::error::{Error, Result};

/// What a rule produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// Writes the result under the given metric name.
    Recording,
    /// Writes `ALERTS` samples for firing components.
    Alerting,
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub kind: RuleKind,
    /// Recorded metric name or alert name.
    pub name: String,
    pub expr: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    fn from_config(config: RuleConfig) -> std::result::Result<Self, String> {
        let (kind, name) = match (config.record, config.alert) {
            (Some(record), None) => (RuleKind::Recording, record),
            (None, Some(alert)) => (RuleKind::Alerting, alert),
            (Some(_), Some(_)) => return Err("rule sets both record and alert".into()),
            (None, None) => return Err("rule needs one of record or alert".into()),
        };
        if name.trim().is_empty() {
            return Err("rule name is empty".into());
        }
        if config.expr.trim().is_empty() {
            return Err(format!("rule {name:?} has an empty expr"));
        }
        Ok(Self { kind, name, expr: config.expr, labels: config.labels, annotations: config.annotations })
    }
}

/// Rules of one group, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveGroup {
    pub file: PathBuf,
    pub name: String,
    pub rules: Vec<Rule>,
}

/// The rule set currently layered over the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveRuleSet {
    pub files: Vec<PathBuf>,
    pub groups: Vec<ActiveGroup>,
    /// Metric names produced by recording rules.
    pub recording_names: BTreeSet<String>,
    /// `(alert name, expr)` of every alerting rule.
    pub alerts: Vec<(String, String)>,
}

impl ActiveRuleSet {
    /// Build a rule set from already-parsed files.
    pub fn from_files(files: Vec<(PathBuf, RuleFile)>) -> Result<Self> {
        let mut set = Self::default();
        for (path, file) in files {
            for group in file.groups {
                let mut rules = Vec::with_capacity(group.rules.len());
                for config in group.rules {
                    let rule = Rule::from_config(config).map_err(|msg| {
                        Error::usage(format!("{}: group {:?}: {msg}", path.display(), group.name))
                    })?;
                    match rule.kind {
                        RuleKind::Recording => {
                            set.recording_names.insert(rule.name.clone());
                        }
                        RuleKind::Alerting => set.alerts.push((rule.name.clone(), rule.expr.clone())),
                    }
                    rules.push(rule);
                }
                set.groups.push(ActiveGroup { file: path.clone(), name: group.name, rules });
            }
            set.files.push(path);
        }
        Ok(set)
    }

    /// Resolve `spec` and parse every file it names.
    pub fn activate(spec: &str) -> Result<Self> {
        let mut files = Vec::new();
        for path in resolve(spec)? {
            let file = RuleFile::load_from_path(&path)?;
            files.push((path, file));
        }
        let set = Self::from_files(files)?;
        tracing::info!(
            spec,
            files = set.files.len(),
            groups = set.groups.len(),
            rules = set.rule_count(),
            "activated rules"
        );
        Ok(set)
    }

    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules.len()).sum()
    }

    /// Every rule in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.groups.iter().flat_map(|g| g.rules.iter())
    }
}
