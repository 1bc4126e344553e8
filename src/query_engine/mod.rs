//! PromQL evaluation over a [`Querier`].
//!
//! Parsing is done by `promql-parser`; this module walks the resulting AST
//! and only ever reads from the store through the query-adapter boundary.
//! The evaluator covers selectors, literals, arithmetic/comparison/set
//! operators, the common aggregations and a practical set of functions.
//! Anything else is reported as unsupported.

mod aggregate;
mod functions;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use promql_parser::label::MatchOp;
use promql_parser::parser::{self, AtModifier, BinaryExpr, Expr, LabelModifier, Offset, VectorSelector};

use crate::error::QueryError;
use crate::matchers::{
    anchored_regex, AbsentMatcher, EqualMatcher, LabelMatcher, NotEqualMatcher, NotRegexMatcher,
    RegexMatcher,
};
use crate::storage::{Labels, Point, Querier, Series, METRIC_NAME_LABEL};

/// Default staleness lookback for instant selectors (5 minutes).
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// Default per-query deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of steps a range query may evaluate.
const MAX_RANGE_STEPS: i64 = 11_000;

/// One element of an instant vector.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub labels: Labels,
    /// Source sample timestamp for raw selections, evaluation time otherwise.
    pub timestamp: i64,
    pub value: f64,
}

/// Result of evaluating an expression at one instant.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Vector(Vec<InstantSample>),
    Scalar(f64),
    Matrix(Vec<Series>),
    String(String),
}

impl QueryValue {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Scalar(_) => "scalar",
            Self::Matrix(_) => "matrix",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector(samples) => {
                for s in samples {
                    writeln!(f, "{} => {} @[{}]", s.labels, crate::codec::format_value(s.value), s.timestamp)?;
                }
                Ok(())
            }
            Self::Scalar(v) => writeln!(f, "scalar: {}", crate::codec::format_value(*v)),
            Self::Matrix(series) => {
                for s in series {
                    let points = s
                        .points
                        .iter()
                        .map(|p| format!("{} @[{}]", crate::codec::format_value(p.value), p.timestamp))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(f, "{} => {points}", s.labels)?;
                }
                Ok(())
            }
            Self::String(s) => writeln!(f, "string: {s:?}"),
        }
    }
}

/// Parse a PromQL expression.
pub fn parse(query: &str) -> Result<Expr, QueryError> {
    parser::parse(query).map_err(QueryError::Construction)
}

/// True when the outermost node of `expr` is a filtering comparison, i.e. a
/// comparison operator without the `bool` modifier.
pub fn is_filter_comparison(expr: &Expr) -> bool {
    match expr {
        Expr::Paren(paren) => is_filter_comparison(&paren.expr),
        Expr::Binary(binary) => {
            is_comparison(&binary.op.to_string())
                && !binary.modifier.as_ref().is_some_and(|m| m.return_bool)
        }
        _ => false,
    }
}

/// PromQL evaluator configured with a lookback window and a deadline.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    lookback: Duration,
    timeout: Duration,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    pub const fn new() -> Self {
        Self { lookback: DEFAULT_LOOKBACK, timeout: DEFAULT_TIMEOUT }
    }

    #[must_use]
    pub const fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub const fn lookback(&self) -> Duration {
        self.lookback
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate `query` at instant `at` (milliseconds).
    pub fn instant_query(
        &self,
        querier: &dyn Querier,
        query: &str,
        at: i64,
    ) -> Result<QueryValue, QueryError> {
        let expr = parse(query)?;
        tracing::debug!(query, at, "instant query");
        self.evaluator(querier, at, at, at).eval(&expr)
    }

    /// Evaluate `query` at every `step` from `start` to `end` inclusive and
    /// collect the results by series.
    pub fn range_query(
        &self,
        querier: &dyn Querier,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<Series>, QueryError> {
        if step <= 0 {
            return Err(QueryError::Evaluation("step must be positive".into()));
        }
        if end < start {
            return Err(QueryError::Evaluation("end is before start".into()));
        }
        let span = end
            .checked_sub(start)
            .ok_or_else(|| QueryError::Evaluation("range is too wide".into()))?;
        if span / step > MAX_RANGE_STEPS {
            return Err(QueryError::Evaluation(format!(
                "range query exceeds {MAX_RANGE_STEPS} steps, use a larger step"
            )));
        }

        let expr = parse(query)?;
        let mut evaluator = self.evaluator(querier, start, start, end);
        let mut out: BTreeMap<Labels, Vec<Point>> = BTreeMap::new();

        let mut t = start;
        while t <= end {
            evaluator.at = t;
            match evaluator.eval(&expr)? {
                QueryValue::Vector(samples) => {
                    for s in samples {
                        out.entry(s.labels).or_default().push(Point::new(t, s.value));
                    }
                }
                QueryValue::Scalar(v) => out.entry(Labels::new()).or_default().push(Point::new(t, v)),
                other => {
                    return Err(QueryError::Evaluation(format!(
                        "range query needs a vector or scalar expression, got {}",
                        other.type_name()
                    )))
                }
            }
            match t.checked_add(step) {
                Some(next) => t = next,
                None => break,
            }
        }

        Ok(out.into_iter().map(|(labels, points)| Series { labels, points }).collect())
    }

    fn evaluator<'a>(&self, querier: &'a dyn Querier, at: i64, start: i64, end: i64) -> Evaluator<'a> {
        Evaluator {
            querier,
            lookback_ms: duration_ms(self.lookback),
            timeout: self.timeout,
            deadline: Instant::now() + self.timeout,
            at,
            start,
            end,
        }
    }
}

/// Per-query evaluation state.
struct Evaluator<'a> {
    querier: &'a dyn Querier,
    lookback_ms: i64,
    timeout: Duration,
    deadline: Instant,
    /// Current evaluation instant.
    at: i64,
    /// Bounds used by `@ start()` and `@ end()`.
    start: i64,
    end: i64,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<QueryValue, QueryError> {
        if Instant::now() > self.deadline {
            return Err(QueryError::Timeout(self.timeout));
        }

        match expr {
            Expr::NumberLiteral(n) => Ok(QueryValue::Scalar(n.val)),
            Expr::StringLiteral(s) => Ok(QueryValue::String(s.val.clone())),
            Expr::Paren(p) => self.eval(&p.expr),
            Expr::Unary(u) => match self.eval(&u.expr)? {
                QueryValue::Scalar(v) => Ok(QueryValue::Scalar(-v)),
                QueryValue::Vector(samples) => Ok(QueryValue::Vector(
                    samples
                        .into_iter()
                        .map(|s| InstantSample { labels: s.labels.without_name(), value: -s.value, ..s })
                        .collect(),
                )),
                other => Err(unexpected("unary minus", &other)),
            },
            Expr::VectorSelector(vs) => self.select_instant(vs).map(QueryValue::Vector),
            Expr::MatrixSelector(ms) => {
                let range = duration_ms(ms.range);
                self.select_range(&ms.vs, range).map(QueryValue::Matrix)
            }
            Expr::Aggregate(agg) => self.aggregate(agg),
            Expr::Binary(binary) => self.binary(binary),
            Expr::Call(call) => self.call(call),
            _ => Err(QueryError::Evaluation(format!("unsupported expression: {expr:?}"))),
        }
    }

    fn eval_vector(&self, expr: &Expr, context: &str) -> Result<Vec<InstantSample>, QueryError> {
        match self.eval(expr)? {
            QueryValue::Vector(samples) => Ok(samples),
            other => Err(unexpected(context, &other)),
        }
    }

    fn eval_scalar(&self, expr: &Expr, context: &str) -> Result<f64, QueryError> {
        match self.eval(expr)? {
            QueryValue::Scalar(v) => Ok(v),
            other => Err(unexpected(context, &other)),
        }
    }

    /// Timestamp a selector reads at, after `@` and `offset`.
    fn selector_time(&self, vs: &VectorSelector) -> i64 {
        let base = match &vs.at {
            Some(AtModifier::At(t)) => system_time_ms(*t),
            Some(AtModifier::Start) => self.start,
            Some(AtModifier::End) => self.end,
            None => self.at,
        };
        match &vs.offset {
            Some(Offset::Pos(d)) => base - duration_ms(*d),
            Some(Offset::Neg(d)) => base + duration_ms(*d),
            None => base,
        }
    }

    /// Latest sample of every matching series within the lookback window.
    ///
    /// Points sharing the newest timestamp are all returned, in insertion
    /// order.
    fn select_instant(&self, vs: &VectorSelector) -> Result<Vec<InstantSample>, QueryError> {
        let matchers = selector_matchers(vs)?;
        let t = self.selector_time(vs);
        let mut samples = Vec::new();
        for series in self.querier.select(&matchers, t.saturating_sub(self.lookback_ms) + 1, t) {
            let Some(newest) = series.points.last().map(|p| p.timestamp) else {
                continue;
            };
            let first = series.points.partition_point(|p| p.timestamp < newest);
            samples.extend(series.points[first..].iter().map(|p| InstantSample {
                labels: series.labels.clone(),
                timestamp: p.timestamp,
                value: p.value,
            }));
        }
        Ok(samples)
    }

    fn select_range(&self, vs: &VectorSelector, range_ms: i64) -> Result<Vec<Series>, QueryError> {
        let matchers = selector_matchers(vs)?;
        let t = self.selector_time(vs);
        Ok(self.querier.select(&matchers, t.saturating_sub(range_ms) + 1, t).collect())
    }

    fn binary(&self, binary: &BinaryExpr) -> Result<QueryValue, QueryError> {
        let op = binary.op.to_string().to_lowercase();
        let return_bool = binary.modifier.as_ref().is_some_and(|m| m.return_bool);
        let matching = binary.modifier.as_ref().and_then(|m| m.matching.as_ref());

        let lhs = self.eval(&binary.lhs)?;
        let rhs = self.eval(&binary.rhs)?;

        match (lhs, rhs) {
            (QueryValue::Scalar(a), QueryValue::Scalar(b)) => {
                let value = if is_comparison(&op) {
                    bool_value(compare(&op, a, b)?)
                } else {
                    arithmetic(&op, a, b)?
                };
                Ok(QueryValue::Scalar(value))
            }
            (QueryValue::Vector(v), QueryValue::Scalar(s)) => {
                self.vector_scalar(&op, v, s, return_bool, false).map(QueryValue::Vector)
            }
            (QueryValue::Scalar(s), QueryValue::Vector(v)) => {
                self.vector_scalar(&op, v, s, return_bool, true).map(QueryValue::Vector)
            }
            (QueryValue::Vector(l), QueryValue::Vector(r)) => match op.as_str() {
                "and" | "or" | "unless" => Ok(QueryValue::Vector(set_operation(&op, l, r, matching))),
                _ => self.vector_vector(&op, l, r, matching, return_bool).map(QueryValue::Vector),
            },
            (l, r) => Err(QueryError::Evaluation(format!(
                "binary {op} not defined between {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        }
    }

    /// `vector op scalar`, or `scalar op vector` when `swapped`.
    fn vector_scalar(
        &self,
        op: &str,
        vector: Vec<InstantSample>,
        scalar: f64,
        return_bool: bool,
        swapped: bool,
    ) -> Result<Vec<InstantSample>, QueryError> {
        let mut out = Vec::with_capacity(vector.len());
        for sample in vector {
            let (a, b) = if swapped { (scalar, sample.value) } else { (sample.value, scalar) };
            if is_comparison(op) {
                let hit = compare(op, a, b)?;
                if return_bool {
                    out.push(InstantSample {
                        labels: sample.labels.without_name(),
                        timestamp: self.at,
                        value: bool_value(hit),
                    });
                } else if hit {
                    out.push(sample);
                }
            } else {
                out.push(InstantSample {
                    labels: sample.labels.without_name(),
                    timestamp: self.at,
                    value: arithmetic(op, a, b)?,
                });
            }
        }
        Ok(out)
    }

    /// One-to-one vector matching.
    fn vector_vector(
        &self,
        op: &str,
        lhs: Vec<InstantSample>,
        rhs: Vec<InstantSample>,
        matching: Option<&LabelModifier>,
        return_bool: bool,
    ) -> Result<Vec<InstantSample>, QueryError> {
        let mut right: BTreeMap<Labels, InstantSample> = BTreeMap::new();
        for sample in rhs {
            let key = match_key(&sample.labels, matching);
            if right.insert(key.clone(), sample).is_some() {
                return Err(QueryError::Evaluation(format!(
                    "many-to-many matching not allowed: duplicate series {key} on the right-hand side"
                )));
            }
        }

        let comparison = is_comparison(op);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for sample in lhs {
            let key = match_key(&sample.labels, matching);
            let Some(other) = right.get(&key) else {
                continue;
            };
            if !seen.insert(key.clone()) {
                return Err(QueryError::Evaluation(format!(
                    "many-to-many matching not allowed: duplicate series {key} on the left-hand side"
                )));
            }

            let mut labels = sample.labels.clone();
            if !comparison || return_bool {
                labels.remove(METRIC_NAME_LABEL);
            }
            match matching {
                Some(LabelModifier::Include(on)) => labels.retain(|n| on.labels.iter().any(|l| l == n)),
                Some(LabelModifier::Exclude(ignoring)) => {
                    labels.retain(|n| !ignoring.labels.iter().any(|l| l == n));
                }
                None => {}
            }

            if comparison {
                let hit = compare(op, sample.value, other.value)?;
                if return_bool {
                    out.push(InstantSample { labels, timestamp: self.at, value: bool_value(hit) });
                } else if hit {
                    out.push(InstantSample { labels, ..sample });
                }
            } else {
                let value = arithmetic(op, sample.value, other.value)?;
                out.push(InstantSample { labels, timestamp: self.at, value });
            }
        }
        Ok(out)
    }
}

/// `and` / `or` / `unless` between two vectors.
fn set_operation(
    op: &str,
    lhs: Vec<InstantSample>,
    rhs: Vec<InstantSample>,
    matching: Option<&LabelModifier>,
) -> Vec<InstantSample> {
    let right_keys: HashSet<Labels> = rhs.iter().map(|s| match_key(&s.labels, matching)).collect();
    match op {
        "and" => lhs.into_iter().filter(|s| right_keys.contains(&match_key(&s.labels, matching))).collect(),
        "unless" => {
            lhs.into_iter().filter(|s| !right_keys.contains(&match_key(&s.labels, matching))).collect()
        }
        _ => {
            let left_keys: HashSet<Labels> = lhs.iter().map(|s| match_key(&s.labels, matching)).collect();
            let mut out = lhs;
            out.extend(rhs.into_iter().filter(|s| !left_keys.contains(&match_key(&s.labels, matching))));
            out
        }
    }
}

/// Labels used to pair series in vector matching.
fn match_key(labels: &Labels, matching: Option<&LabelModifier>) -> Labels {
    let mut key = labels.clone();
    match matching {
        Some(LabelModifier::Include(on)) => key.retain(|n| on.labels.iter().any(|l| l == n)),
        Some(LabelModifier::Exclude(ignoring)) => {
            key.retain(|n| n != METRIC_NAME_LABEL && !ignoring.labels.iter().any(|l| l == n));
        }
        None => {
            key.remove(METRIC_NAME_LABEL);
        }
    }
    key
}

/// Convert parsed selector matchers into store matchers.
fn selector_matchers(vs: &VectorSelector) -> Result<Vec<Arc<dyn LabelMatcher>>, QueryError> {
    let mut matchers: Vec<Arc<dyn LabelMatcher>> = Vec::new();
    if let Some(name) = &vs.name {
        matchers.push(Arc::new(EqualMatcher::new(METRIC_NAME_LABEL, name.clone())));
    }
    for m in &vs.matchers.matchers {
        let matcher: Arc<dyn LabelMatcher> = match &m.op {
            MatchOp::Equal if m.value.is_empty() => Arc::new(AbsentMatcher::new(m.name.clone())),
            MatchOp::Equal => Arc::new(EqualMatcher::new(m.name.clone(), m.value.clone())),
            MatchOp::NotEqual => Arc::new(NotEqualMatcher::new(m.name.clone(), m.value.clone())),
            MatchOp::Re(_) => Arc::new(RegexMatcher::new(m.name.clone(), anchored_regex(&m.value)?)),
            MatchOp::NotRe(_) => {
                Arc::new(NotRegexMatcher::new(m.name.clone(), anchored_regex(&m.value)?))
            }
        };
        matchers.push(matcher);
    }
    Ok(matchers)
}

fn is_comparison(op: &str) -> bool {
    matches!(op, "==" | "!=" | ">" | "<" | ">=" | "<=")
}

fn compare(op: &str, a: f64, b: f64) -> Result<bool, QueryError> {
    Ok(match op {
        "==" => a == b,
        "!=" => a != b,
        ">" => a > b,
        "<" => a < b,
        ">=" => a >= b,
        "<=" => a <= b,
        _ => return Err(QueryError::Evaluation(format!("unsupported comparison {op}"))),
    })
}

fn arithmetic(op: &str, a: f64, b: f64) -> Result<f64, QueryError> {
    Ok(match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a % b,
        "^" => a.powf(b),
        "atan2" => a.atan2(b),
        _ => return Err(QueryError::Evaluation(format!("unsupported operator {op}"))),
    })
}

const fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn unexpected(context: &str, value: &QueryValue) -> QueryError {
    QueryError::Evaluation(format!("{context}: unexpected {} argument", value.type_name()))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn system_time_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => duration_ms(d),
        Err(e) => -duration_ms(e.duration()),
    }
}
