use std::fs;
use std::sync::{Arc, Mutex};

use promql_workbench::rules::ALERTS_METRIC;
use promql_workbench::{
    AlertNotification, Error, LoadOptions, QueryValue, SeriesFilter, Session, TimestampMode,
};

const T: i64 = 1_700_000_000_000;

const SNAPSHOT: &str = "\
# HELP http_requests_total Total HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method=\"get\",code=\"200\"} 1024
http_requests_total{method=\"get\",code=\"200\"} 3
http_requests_total{method=\"get\",code=\"404\"} 3
# HELP up Target up.
up{instance=\"a\",job=\"node\"} 1
up{instance=\"b\",job=\"node\"} 1
up{instance=\"c\",job=\"node\"} 0
";

fn session() -> Session {
    Session::builder().with_fixed_now(T).with_rng_seed(11).build().expect("valid settings")
}

fn vector(value: QueryValue) -> Vec<(String, f64)> {
    let QueryValue::Vector(samples) = value else {
        panic!("expected a vector, got {value:?}");
    };
    samples.into_iter().map(|s| (s.labels.to_string(), s.value)).collect()
}

#[test]
fn sum_by_code() {
    let mut session = session();
    session.load_text(SNAPSHOT, &LoadOptions::default()).expect("loaded");

    let result = vector(session.query("sum(http_requests_total) by (code)", None).expect("query"));
    assert_eq!(
        result,
        vec![("{code=\"200\"}".to_string(), 1027.0), ("{code=\"404\"}".to_string(), 3.0)]
    );
}

#[test]
fn duplicate_samples_are_all_selected() {
    let mut session = session();
    session.load_text(SNAPSHOT, &LoadOptions::default()).expect("loaded");

    let result = vector(session.query("http_requests_total{code=\"200\"}", None).expect("query"));
    let values: Vec<f64> = result.iter().map(|(_, v)| *v).collect();
    assert_eq!(values, vec![1024.0, 3.0]);
    assert_eq!(session.store().series_count("http_requests_total"), 2);
}

#[test]
fn save_and_reload_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("snapshot.prom");

    let mut original = session();
    original.load_text(SNAPSHOT, &LoadOptions::default()).expect("loaded");
    let saved = original.save_file(&path, None, TimestampMode::Keep).expect("saved");
    assert_eq!(saved.samples, 6);
    assert_eq!(saved.metrics, 2);

    let mut restored = session();
    restored.load_file(&path, &LoadOptions::default()).expect("reloaded");
    for name in ["http_requests_total", "up"] {
        assert_eq!(restored.store().bucket(name), original.store().bucket(name), "{name}");
        assert_eq!(restored.store().help(name), original.store().help(name), "{name}");
    }
    assert_eq!(restored.save(None, TimestampMode::Keep).expect("saved").text, saved.text);
}

#[test]
fn load_with_filter_and_shifted_timestamps() {
    let mut session = session();
    let options = LoadOptions {
        filter: Some(SeriesFilter::new("^up").expect("valid")),
        mode: TimestampMode::Set(T - 60_000),
    };
    let report = session
        .load_text("up{job=\"a\"} 1 1000\nup{job=\"a\"} 1 4000\nother 2 4000\n", &options)
        .expect("loaded");
    assert_eq!(report.load.loaded, 2);
    assert_eq!(report.load.filtered_out, 1);

    let timestamps: Vec<i64> =
        session.store().bucket("up").expect("bucket").iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![T - 63_000, T - 60_000]);
    assert!(!session.store().contains_metric("other"));
}

#[test]
fn recording_and_alerting_rules_from_a_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("10-recording.yml"),
        "groups:\n  - name: counts\n    rules:\n      - record: job:up:count\n        expr: count(up)\n",
    )
    .expect("write");
    fs::write(
        dir.path().join("20-alerts.yaml"),
        "groups:\n  - name: alerts\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n        labels:\n          severity: page\n",
    )
    .expect("write");
    fs::write(dir.path().join("README.md"), "not a rule file").expect("write");

    let fired = Arc::new(Mutex::new(Vec::new()));
    let seen = fired.clone();
    let mut session = Session::builder()
        .with_fixed_now(T)
        .with_sink(move |alert: &AlertNotification| {
            if let Ok(mut seen) = seen.lock() {
                seen.push(alert.labels.to_string());
            }
        })
        .build()
        .expect("valid settings");

    let set = session.activate_rules(&dir.path().to_string_lossy()).expect("activated");
    assert_eq!(set.files.len(), 2);
    assert_eq!(set.rule_count(), 2);

    let report = session.load_text(SNAPSHOT, &LoadOptions::default()).expect("loaded");
    let eval = report.eval.expect("rules active").expect("pass succeeded");
    assert_eq!(eval.rules, 2);
    assert_eq!(eval.alerts_fired, 1);

    let recorded = session.store().bucket("job:up:count").expect("recorded");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].value, 3.0);
    assert_eq!(recorded[0].timestamp, T);

    let alerts = session.store().bucket(ALERTS_METRIC).expect("alert written");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].labels.get("instance"), Some("c"));
    assert_eq!(alerts[0].labels.get("severity"), Some("page"));

    let fired = fired.lock().expect("lock");
    assert_eq!(fired.len(), 1);
    assert!(fired[0].contains("alertname=\"InstanceDown\""), "{}", fired[0]);
}

#[test]
fn rule_pass_failure_is_reported_as_a_value() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.yml");
    fs::write(
        &path,
        "groups:\n  - name: g\n    rules:\n      - record: ok\n        expr: vector(1)\n      - record: bad\n        expr: up[1m]\n",
    )
    .expect("write");

    let mut session = session();
    session.activate_rules(&path.to_string_lossy()).expect("activated");
    let report = session.load_text("up 1\n", &LoadOptions::default()).expect("load succeeds");
    assert_eq!(report.load.loaded, 1);

    let err = report.eval.expect("rules active").expect_err("pass aborted");
    assert_eq!(err.rule, "bad");
    assert_eq!(err.partial.samples_added, 1);
    assert!(session.store().contains_metric("ok"));

    assert!(matches!(session.evaluate_rules(None), Err(Error::RuleEvaluation(_))));
}

#[test]
fn seeded_history_feeds_range_functions() {
    let mut session = session();
    session.load_text("requests_total{job=\"a\"} 600\n", &LoadOptions::default()).expect("loaded");
    let seeded = session.seed("requests_total", 10, 60_000).expect("seeded");
    assert_eq!(seeded.samples, 10);

    let rate = vector(session.query("rate(requests_total[15m])", None).expect("query"));
    assert_eq!(rate.len(), 1);
    assert!(rate[0].1 > 0.0, "{rate:?}");

    let series = session.query_range("requests_total", T - 600_000, T, 60_000).expect("range");
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].points.len(), 11);
}

#[test]
fn import_query_response() {
    let body = format!(
        r#"{{"status":"success","data":{{"resultType":"vector","result":[{{"metric":{{"job":"agg"}},"value":[{}, "7"]}}]}}}}"#,
        T / 1000
    );
    let mut session = session();
    session.import_json(&body, &LoadOptions::default()).expect("imported");

    let result = vector(session.query("query_result", None).expect("query"));
    assert_eq!(result, vec![("query_result{job=\"agg\"}".to_string(), 7.0)]);
}

#[test]
fn pinned_clock_drives_relative_instants() {
    let mut session = session();
    assert_eq!(session.parse_instant("now-5m").expect("valid"), T - 300_000);
    session.pin(T + 1_000);
    assert_eq!(session.now_ms(), T + 1_000);
    session.unpin();
    assert_eq!(session.pinned(), None);
}
