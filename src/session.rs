//! Workbench session: the store, the evaluation clock, query settings and the
//! active rule set, owned by whoever drives the command loop.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::clock::{self, Clock};
use crate::codec::{api_json, text, Decoded};
use crate::error::{Error, Result, RuleEvaluationError};
use crate::mutate::{self, LoadReport, SaveOutput, SeedReport, SeriesFilter, TimestampMode};
use crate::query_engine::{QueryEngine, QueryValue};
use crate::rules::{self, ActiveRuleSet, AlertNotification, EvalReport, NotificationSink};
use crate::storage::memory::RetainStats;
use crate::storage::{MemoryStorage, Querier, Series};

/// How incoming samples are filtered and stamped.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub filter: Option<SeriesFilter>,
    pub mode: TimestampMode,
}

/// Outcome of a load followed by the automatic rule pass.
#[derive(Debug)]
pub struct IngestReport {
    pub load: LoadReport,
    /// `None` when no rule set is active.
    pub eval: Option<Result<EvalReport, RuleEvaluationError>>,
}

/// Logs firing alerts when no sink was configured.
struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&mut self, alert: &AlertNotification) {
        tracing::warn!(alert = %alert, "alert firing");
    }
}

pub struct Session {
    store: MemoryStorage,
    clock: Clock,
    engine: QueryEngine,
    rules: Option<ActiveRuleSet>,
    sink: Box<dyn NotificationSink + Send>,
    rng: StdRng,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("engine", &self.engine)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with default query settings and an unpinned clock.
    pub fn new() -> Self {
        Self {
            store: MemoryStorage::new(),
            clock: Clock::new(),
            engine: QueryEngine::new(),
            rules: None,
            sink: Box::new(LogSink),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub const fn store(&self) -> &MemoryStorage {
        &self.store
    }

    pub const fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub const fn rules(&self) -> Option<&ActiveRuleSet> {
        self.rules.as_ref()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Parse an instant relative to the session clock.
    pub fn parse_instant(&self, input: &str) -> Result<i64> {
        clock::parse_instant(input, self.now_ms())
    }

    pub fn pin(&mut self, at_ms: i64) {
        self.clock.pin(at_ms);
        tracing::info!(at = %clock::format_ms(at_ms), "pinned evaluation time");
    }

    pub fn unpin(&mut self) {
        self.clock.unpin();
        tracing::info!("evaluation time follows the wall clock");
    }

    pub const fn pinned(&self) -> Option<i64> {
        self.clock.pinned()
    }

    /// Remove every sample. The active rule set stays.
    pub fn clear(&mut self) {
        self.store.clear();
        tracing::info!("cleared store");
    }

    fn ingest(&mut self, decoded: Decoded, opts: &LoadOptions) -> Result<IngestReport> {
        let now = self.now_ms();
        let load = mutate::load(&mut self.store, decoded, opts.filter.as_ref(), opts.mode, now)?;
        let eval = self.rules.as_ref().map(|set| {
            rules::evaluate(set, &mut self.store, &self.engine, now, self.sink.as_mut())
        });
        Ok(IngestReport { load, eval })
    }

    /// Load exposition text, then run a rule pass when rules are active.
    ///
    /// # Parameters
    ///
    /// - `input` - Exposition text document
    /// - `opts` - Series filter and timestamp mode for the new samples
    ///
    /// # Returns
    ///
    /// Load counts plus the outcome of the rule pass. A failed pass is
    /// reported inside the [`IngestReport`]; the samples stay loaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputFormat`] for a malformed document and
    /// [`Error::Usage`] when the timestamp mode overflows. The store is left
    /// unchanged in both cases.
    pub fn load_text(&mut self, input: &str, opts: &LoadOptions) -> Result<IngestReport> {
        let decoded = text::decode(input)?;
        self.ingest(decoded, opts)
    }

    /// Load an exposition text file. See [`Session::load_text`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] when the file cannot be read.
    pub fn load_file(&mut self, path: impl AsRef<Path>, opts: &LoadOptions) -> Result<IngestReport> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)?;
        tracing::info!(path = %path.display(), "loading file");
        self.load_text(&input, opts)
    }

    /// Import a Prometheus HTTP API query response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for a body that is not a query response.
    pub fn import_json(&mut self, input: &str, opts: &LoadOptions) -> Result<IngestReport> {
        let decoded = api_json::decode(input)?;
        self.ingest(decoded, opts)
    }

    /// Fetch `url` `count` times, `delay` apart, loading every body.
    ///
    /// A failed fetch stops the sequence; bodies loaded before it stay.
    pub async fn scrape(
        &mut self,
        url: &str,
        count: usize,
        delay: Duration,
        opts: &LoadOptions,
    ) -> Result<Vec<IngestReport>> {
        let client = reqwest::Client::builder().timeout(self.engine.timeout()).build()?;
        let mut reports = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            let body = client.get(url).send().await?.error_for_status()?.text().await?;
            tracing::info!(url, fetch = i + 1, count, bytes = body.len(), "scraped");
            reports.push(self.load_text(&body, opts)?);
        }
        Ok(reports)
    }

    /// Encode the store as exposition text.
    ///
    /// # Parameters
    ///
    /// - `filter` - Only series whose signature matches are written
    /// - `mode` - How timestamps are written
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] when `mode` shifts a timestamp out of range.
    pub fn save(&self, filter: Option<&SeriesFilter>, mode: TimestampMode) -> Result<SaveOutput> {
        mutate::save(&self.store, filter, mode, self.now_ms())
    }

    /// Encode the store and write it to `path`.
    ///
    /// # Errors
    ///
    /// Fails like [`Session::save`], or with [`Error::Io`] when the file
    /// cannot be written.
    pub fn save_file(
        &self,
        path: impl AsRef<Path>,
        filter: Option<&SeriesFilter>,
        mode: TimestampMode,
    ) -> Result<SaveOutput> {
        let path = path.as_ref();
        let output = self.save(filter, mode)?;
        fs::write(path, &output.text)?;
        tracing::info!(path = %path.display(), samples = output.samples, "saved snapshot");
        Ok(output)
    }

    pub fn drop_series(&mut self, filter: &SeriesFilter) -> RetainStats {
        mutate::drop_series(&mut self.store, filter)
    }

    pub fn keep_series(&mut self, filter: &SeriesFilter) -> RetainStats {
        mutate::keep_series(&mut self.store, filter)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<usize> {
        mutate::rename(&mut self.store, old, new)
    }

    pub fn seed(&mut self, metric: &str, steps: usize, step_ms: i64) -> Result<SeedReport> {
        let now = self.now_ms();
        mutate::seed_history(&mut self.store, metric, steps, step_ms, now, &mut self.rng)
    }

    /// Replace the active rule set.
    ///
    /// # Parameters
    ///
    /// - `spec` - Rule file, directory or glob pattern
    ///
    /// # Returns
    ///
    /// The newly active set. Rules from the previous set are discarded.
    ///
    /// # Errors
    ///
    /// Fails when the spec resolves to no readable file or a rule is invalid.
    /// The previous set stays active in that case.
    pub fn activate_rules(&mut self, spec: &str) -> Result<&ActiveRuleSet> {
        let set = ActiveRuleSet::activate(spec)?;
        Ok(self.rules.insert(set))
    }

    /// Run one rule pass at `at`, or at the session clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] when no rules are active and
    /// [`Error::RuleEvaluation`] when a rule fails; samples written by
    /// earlier rules stay in the store.
    pub fn evaluate_rules(&mut self, at: Option<i64>) -> Result<EvalReport> {
        let Some(set) = self.rules.as_ref() else {
            return Err(Error::usage("no rules are active"));
        };
        let at = at.unwrap_or_else(|| self.clock.now_ms());
        Ok(rules::evaluate(set, &mut self.store, &self.engine, at, self.sink.as_mut())?)
    }

    /// Instant query at `at`, or at the session clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] for a parse, evaluation or timeout failure.
    pub fn query(&self, query: &str, at: Option<i64>) -> Result<QueryValue> {
        let at = at.unwrap_or_else(|| self.now_ms());
        Ok(self.engine.instant_query(&self.store, query, at)?)
    }

    /// Evaluate `query` from `start` to `end` inclusive, every `step_ms`.
    ///
    /// # Returns
    ///
    /// One series per distinct label set, points at the step instants.
    pub fn query_range(&self, query: &str, start: i64, end: i64, step_ms: i64) -> Result<Vec<Series>> {
        Ok(self.engine.range_query(&self.store, query, start, end, step_ms)?)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.store.metric_names()
    }

    pub fn label_names(&self) -> Vec<String> {
        self.store.label_names()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.store.label_values(name)
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    lookback: Option<Duration>,
    query_timeout: Option<Duration>,
    fixed_now: Option<i64>,
    sink: Option<Box<dyn NotificationSink + Send>>,
    seed: Option<u64>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Staleness window for instant selectors.
    #[must_use]
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    /// Per-query deadline.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Start with the clock pinned at `at_ms`.
    #[must_use]
    pub fn with_fixed_now(mut self, at_ms: i64) -> Self {
        self.fixed_now = Some(at_ms);
        self
    }

    /// Where firing alerts are reported. Defaults to the log.
    #[must_use]
    pub fn with_sink(mut self, sink: impl NotificationSink + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Seed for synthetic history generation.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// # Errors
    ///
    /// Returns a usage error for a zero lookback or timeout.
    pub fn build(self) -> Result<Session> {
        let mut engine = QueryEngine::new();
        if let Some(lookback) = self.lookback {
            if lookback.is_zero() {
                return Err(Error::usage("lookback must be positive"));
            }
            engine = engine.with_lookback(lookback);
        }
        if let Some(timeout) = self.query_timeout {
            if timeout.is_zero() {
                return Err(Error::usage("query timeout must be positive"));
            }
            engine = engine.with_timeout(timeout);
        }

        let mut session = Session::new();
        session.engine = engine;
        if let Some(at) = self.fixed_now {
            session.clock = Clock::pinned_at(at);
        }
        if let Some(sink) = self.sink {
            session.sink = sink;
        }
        if let Some(seed) = self.seed {
            session.rng = StdRng::seed_from_u64(seed);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const T: i64 = 1_700_000_000_000;

    fn session() -> Session {
        Session::builder().with_fixed_now(T).with_rng_seed(3).build().expect("valid settings")
    }

    fn write_rules(dir: &Path, doc: &str) -> String {
        let path = dir.join("rules.yml");
        fs::write(&path, doc).expect("write rules");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_then_query() {
        let mut session = session();
        let report = session
            .load_text("up{job=\"a\"} 1\nup{job=\"b\"} 0\n", &LoadOptions::default())
            .expect("loaded");
        assert_eq!(report.load.loaded, 2);
        assert!(report.eval.is_none());

        let QueryValue::Vector(samples) = session.query("sum(up)", None).expect("query") else {
            panic!("expected vector");
        };
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[0].timestamp, T);
    }

    #[test]
    fn test_load_triggers_rule_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = write_rules(
            dir.path(),
            "groups:\n  - name: g\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n",
        );

        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = fired.clone();
        let mut session = Session::builder()
            .with_fixed_now(T)
            .with_sink(move |n: &AlertNotification| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(n.alertname.clone());
                }
            })
            .build()
            .expect("valid settings");
        session.activate_rules(&spec).expect("activated");

        let report = session
            .load_text("up{instance=\"a\"} 0\n", &LoadOptions::default())
            .expect("loaded");
        let eval = report.eval.expect("rules active").expect("pass ok");
        assert_eq!(eval.alerts_fired, 1);
        assert_eq!(*fired.lock().expect("lock"), vec!["InstanceDown".to_string()]);
        assert_eq!(session.store().bucket_len("ALERTS"), 1);
    }

    #[test]
    fn test_failed_activation_keeps_previous_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = write_rules(
            dir.path(),
            "groups:\n  - name: g\n    rules:\n      - record: a\n        expr: vector(1)\n",
        );
        let mut session = session();
        session.activate_rules(&spec).expect("activated");

        let missing = dir.path().join("missing.yml");
        assert!(session.activate_rules(&missing.to_string_lossy()).is_err());
        assert_eq!(session.rules().map(ActiveRuleSet::rule_count), Some(1));

        assert_eq!(session.evaluate_rules(None).expect("pass").samples_added, 1);
        assert_eq!(session.store().bucket("a").expect("recorded")[0].timestamp, T);
    }

    #[test]
    fn test_activation_replaces_previous_rules() {
        let first = tempfile::tempdir().expect("tempdir");
        let spec_a = write_rules(
            first.path(),
            "groups:\n  - name: a\n    rules:\n      - record: a\n        expr: vector(1)\n      - alert: X\n        expr: vector(1)\n",
        );
        let second = tempfile::tempdir().expect("tempdir");
        let spec_b = write_rules(
            second.path(),
            "groups:\n  - name: b\n    rules:\n      - record: b\n        expr: vector(2)\n",
        );

        let mut session = session();
        let set = session.activate_rules(&spec_a).expect("activated");
        assert_eq!(set.rule_count(), 2);
        assert!(set.recording_names.contains("a"));
        assert_eq!(set.alerts.len(), 1);

        let set = session.activate_rules(&spec_b).expect("activated");
        assert_eq!(set.rule_count(), 1);
        assert_eq!(set.recording_names.iter().collect::<Vec<_>>(), vec!["b"]);
        assert!(set.alerts.is_empty());

        let report = session.evaluate_rules(None).expect("pass");
        assert_eq!(report.rules, 1);
        assert_eq!(report.alerts_fired, 0);
        assert!(!session.store().contains_metric("a"));
        assert!(!session.store().contains_metric("ALERTS"));
        assert_eq!(session.store().bucket("b").expect("recorded")[0].value, 2.0);
    }

    #[test]
    fn test_out_of_range_shift_is_an_error() {
        let mut session = session();
        session.load_text("up 1 1000\n", &LoadOptions::default()).expect("loaded");

        let opts = LoadOptions { filter: None, mode: TimestampMode::Set(T) };
        let err = session
            .load_text("up 2 -9223372036854775808\n", &opts)
            .expect_err("shift overflows");
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(session.store().sample_count(), 1);

        session.load_text("up 3 -9223372036854775808\n", &LoadOptions::default()).expect("kept as is");
        assert!(session.save(None, TimestampMode::Set(0)).is_err());
        assert!(session.save(None, TimestampMode::Keep).is_ok());
    }

    #[test]
    fn test_evaluate_without_rules() {
        assert!(matches!(session().evaluate_rules(None), Err(Error::Usage(_))));
    }

    #[test]
    fn test_save_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.prom");
        let mut session = session();
        session
            .load_text("# HELP up Target up.\nup{job=\"a\"} 1 1000\n", &LoadOptions::default())
            .expect("loaded");
        session.save_file(&path, None, TimestampMode::Keep).expect("saved");

        let mut restored = Session::new();
        restored.load_file(&path, &LoadOptions::default()).expect("reloaded");
        assert_eq!(restored.store().bucket("up"), session.store().bucket("up"));
        assert_eq!(restored.store().help("up"), Some("Target up."));
    }

    #[test]
    fn test_builder_rejects_zero_durations() {
        assert!(Session::builder().with_lookback(Duration::ZERO).build().is_err());
        assert!(Session::builder().with_query_timeout(Duration::ZERO).build().is_err());
    }

    #[tokio::test]
    async fn test_scrape_loads_each_fetch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let body = "requests_total 5\n";
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let mut session = session();
        let reports = session
            .scrape(&format!("http://{addr}/metrics"), 2, Duration::from_millis(10), &LoadOptions::default())
            .await
            .expect("scraped");
        assert_eq!(reports.len(), 2);
        assert_eq!(session.store().bucket_len("requests_total"), 2);
    }
}
