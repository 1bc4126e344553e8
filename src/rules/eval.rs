//! Evaluation passes over an [`ActiveRuleSet`].

use std::collections::BTreeMap;
use std::fmt;

use crate::clock::format_ms;
use crate::codec::format_value;
use crate::error::RuleEvaluationError;
use crate::query_engine::{is_filter_comparison, parse, InstantSample, QueryEngine, QueryValue};
use crate::rules::{ActiveRuleSet, Rule, RuleKind};
use crate::storage::{Labels, MemoryStorage, METRIC_NAME_LABEL};

/// Metric written by alerting rules.
pub const ALERTS_METRIC: &str = "ALERTS";

/// Counts accumulated during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalReport {
    /// Rules evaluated successfully.
    pub rules: usize,
    pub samples_added: usize,
    pub alerts_fired: usize,
}

/// A firing alert component.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotification {
    pub alertname: String,
    /// Labels of the written `ALERTS` sample, `__name__` excluded.
    pub labels: Labels,
    /// Value of the expression that fired.
    pub value: f64,
    pub annotations: BTreeMap<String, String>,
    pub at: i64,
}

impl fmt::Display for AlertNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[FIRING] {} {} value={} at {}",
            self.alertname,
            self.labels,
            format_value(self.value),
            format_ms(self.at)
        )?;
        for (key, value) in &self.annotations {
            write!(f, " {key}={value:?}")?;
        }
        Ok(())
    }
}

/// Receives a notification for every firing alert component.
pub trait NotificationSink {
    fn notify(&mut self, alert: &AlertNotification);
}

impl<F: FnMut(&AlertNotification)> NotificationSink for F {
    fn notify(&mut self, alert: &AlertNotification) {
        self(alert);
    }
}

/// Evaluate every rule at `instant`, appending results to `store`.
///
/// Rules run in file, group and declaration order, so a rule sees what the
/// rules before it recorded. The first failing rule aborts the pass; samples
/// already written stay in the store and are counted in the error's
/// `partial` report.
pub fn evaluate(
    rules: &ActiveRuleSet,
    store: &mut MemoryStorage,
    engine: &QueryEngine,
    instant: i64,
    sink: &mut dyn NotificationSink,
) -> Result<EvalReport, RuleEvaluationError> {
    let mut report = EvalReport::default();

    for rule in rules.rules() {
        let outcome = match rule.kind {
            RuleKind::Recording => record(rule, store, engine, instant),
            RuleKind::Alerting => alert(rule, store, engine, instant, sink),
        };
        match outcome {
            Ok((samples, fired)) => {
                tracing::debug!(rule = %rule.name, samples, fired, "evaluated rule");
                report.rules += 1;
                report.samples_added += samples;
                report.alerts_fired += fired;
            }
            Err(reason) => {
                tracing::warn!(rule = %rule.name, %reason, "rule evaluation failed");
                return Err(RuleEvaluationError { rule: rule.name.clone(), reason, partial: report });
            }
        }
    }

    tracing::info!(
        rules = report.rules,
        samples = report.samples_added,
        alerts = report.alerts_fired,
        at = instant,
        "rule pass complete"
    );
    Ok(report)
}

fn static_labels(rule: &Rule, base: &Labels) -> Labels {
    let mut labels = base.without_name();
    for (name, value) in &rule.labels {
        labels.insert(name.as_str(), value.as_str());
    }
    labels
}

fn unsupported(value: &QueryValue) -> String {
    format!("rule expression must return a vector or scalar, got {}", value.type_name())
}

/// Returns `(samples written, alerts fired)`.
fn record(
    rule: &Rule,
    store: &mut MemoryStorage,
    engine: &QueryEngine,
    instant: i64,
) -> Result<(usize, usize), String> {
    let result = engine.instant_query(&*store, &rule.expr, instant).map_err(|e| e.to_string())?;
    let components = match result {
        QueryValue::Vector(samples) => samples,
        QueryValue::Scalar(value) => {
            vec![InstantSample { labels: Labels::new(), timestamp: instant, value }]
        }
        other => return Err(unsupported(&other)),
    };

    for component in &components {
        let mut labels = static_labels(rule, &component.labels);
        labels.insert(METRIC_NAME_LABEL, rule.name.as_str());
        store.add_sample(labels, component.value, instant);
    }
    Ok((components.len(), 0))
}

fn alert(
    rule: &Rule,
    store: &mut MemoryStorage,
    engine: &QueryEngine,
    instant: i64,
    sink: &mut dyn NotificationSink,
) -> Result<(usize, usize), String> {
    let filtering = is_filter_comparison(&parse(&rule.expr).map_err(|e| e.to_string())?);
    let result = engine.instant_query(&*store, &rule.expr, instant).map_err(|e| e.to_string())?;
    let components = match result {
        QueryValue::Vector(samples) => samples,
        QueryValue::Scalar(value) => {
            vec![InstantSample { labels: Labels::new(), timestamp: instant, value }]
        }
        other => return Err(unsupported(&other)),
    };

    let mut fired = 0;
    for component in components.iter().filter(|c| is_firing(c.value, filtering)) {
        let mut labels = static_labels(rule, &component.labels);
        labels.insert("alertname", rule.name.as_str());
        labels.insert("alertstate", "firing");

        sink.notify(&AlertNotification {
            alertname: rule.name.clone(),
            labels: labels.clone(),
            value: component.value,
            annotations: rule.annotations.clone(),
            at: instant,
        });

        labels.insert(METRIC_NAME_LABEL, ALERTS_METRIC);
        store.add_sample(labels, 1.0, instant);
        fired += 1;
    }
    Ok((fired, fired))
}

/// A component fires when its value is non-zero. When the expression is a
/// filtering comparison, having survived the filter is enough.
fn is_firing(value: f64, filtering: bool) -> bool {
    !value.is_nan() && (filtering || value != 0.0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::rules::RuleFile;

    const T: i64 = 1_700_000_000_000;

    fn rules(doc: &str) -> ActiveRuleSet {
        ActiveRuleSet::from_files(vec![(PathBuf::from("rules.yml"), RuleFile::parse(doc).expect("yaml"))])
            .expect("valid rules")
    }

    fn up_store(values: &[(&str, f64)]) -> MemoryStorage {
        let mut store = MemoryStorage::new();
        for (instance, value) in values {
            let labels: Labels =
                [("__name__", "up"), ("job", "node"), ("instance", instance)].into_iter().collect();
            store.add_sample(labels, *value, T - 10_000);
        }
        store
    }

    fn run(
        set: &ActiveRuleSet,
        store: &mut MemoryStorage,
    ) -> (Result<EvalReport, RuleEvaluationError>, Vec<AlertNotification>) {
        let mut notes = Vec::new();
        let mut sink = |n: &AlertNotification| notes.push(n.clone());
        let result = evaluate(set, store, &QueryEngine::new(), T, &mut sink);
        (result, notes)
    }

    #[test]
    fn test_recording_count_up() {
        let set = rules("groups:\n  - name: g\n    rules:\n      - record: job:up:count\n        expr: count(up)\n");
        let mut store = up_store(&[("a", 1.0), ("b", 1.0), ("c", 0.0)]);

        let (result, notes) = run(&set, &mut store);
        assert_eq!(result.expect("pass"), EvalReport { rules: 1, samples_added: 1, alerts_fired: 0 });
        assert!(notes.is_empty());

        let bucket = store.bucket("job:up:count").expect("recorded");
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].labels.len(), 1);
        assert_eq!(bucket[0].value, 3.0);
        assert_eq!(bucket[0].timestamp, T);
    }

    #[test]
    fn test_recording_static_labels_and_scalar() {
        let set = rules(
            "groups:\n  - name: g\n    rules:\n      - record: up:copy\n        expr: up\n        labels:\n          job: override\n      - record: answer\n        expr: scalar(vector(42))\n        labels:\n          team: core\n",
        );
        let mut store = up_store(&[("a", 1.0)]);
        let (result, _) = run(&set, &mut store);
        assert_eq!(result.expect("pass").samples_added, 2);

        let copy = &store.bucket("up:copy").expect("recorded")[0];
        assert_eq!(copy.labels.get("job"), Some("override"));
        assert_eq!(copy.labels.get("instance"), Some("a"));

        let answer = &store.bucket("answer").expect("recorded")[0];
        assert_eq!(answer.value, 42.0);
        assert_eq!(answer.labels.get("team"), Some("core"));
        assert_eq!(answer.labels.len(), 2);
    }

    #[test]
    fn test_alert_instance_down() {
        let set = rules(
            "groups:\n  - name: g\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n        labels:\n          severity: page\n        annotations:\n          summary: instance down\n",
        );
        let mut store = up_store(&[("a", 1.0), ("b", 0.0)]);

        let (result, notes) = run(&set, &mut store);
        assert_eq!(result.expect("pass").alerts_fired, 1);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].alertname, "InstanceDown");
        assert!(notes[0].to_string().contains("summary=\"instance down\""));

        let alerts = store.bucket(ALERTS_METRIC).expect("alerts written");
        assert_eq!(alerts.len(), 1);
        let labels = &alerts[0].labels;
        assert_eq!(labels.get("alertname"), Some("InstanceDown"));
        assert_eq!(labels.get("alertstate"), Some("firing"));
        assert_eq!(labels.get("instance"), Some("b"));
        assert_eq!(labels.get("severity"), Some("page"));
        assert_eq!(alerts[0].value, 1.0);
        assert_eq!(alerts[0].timestamp, T);
    }

    #[test]
    fn test_alert_with_nothing_matching() {
        let set = rules("groups:\n  - name: g\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n");
        let mut store = up_store(&[("a", 1.0)]);
        let (result, notes) = run(&set, &mut store);
        assert_eq!(result.expect("pass").alerts_fired, 0);
        assert!(notes.is_empty());
        assert!(!store.contains_metric(ALERTS_METRIC));
    }

    #[test]
    fn test_alert_zero_value_without_filter_does_not_fire() {
        let set = rules("groups:\n  - name: g\n    rules:\n      - alert: Flag\n        expr: up\n");
        let mut store = up_store(&[("a", 0.0), ("b", 2.0)]);
        let (result, notes) = run(&set, &mut store);
        assert_eq!(result.expect("pass").alerts_fired, 1);
        assert_eq!(notes[0].labels.get("instance"), Some("b"));
    }

    #[test]
    fn test_failing_rule_keeps_earlier_writes() {
        let set = rules(
            "groups:\n  - name: g\n    rules:\n      - record: first\n        expr: count(up)\n      - record: broken\n        expr: up[5m]\n      - record: never\n        expr: vector(1)\n",
        );
        let mut store = up_store(&[("a", 1.0)]);
        let (result, _) = run(&set, &mut store);

        let err = result.expect_err("matrix result aborts the pass");
        assert_eq!(err.rule, "broken");
        assert_eq!(err.partial, EvalReport { rules: 1, samples_added: 1, alerts_fired: 0 });
        assert!(store.contains_metric("first"));
        assert!(!store.contains_metric("never"));
    }
}
