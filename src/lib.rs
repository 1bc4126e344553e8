//! # PromQL Workbench
//!
//! Load Prometheus metric snapshots into memory, reshape them and explore
//! them with PromQL and rule files.
//!
//! This library provides components for:
//! - **Sample Store**: metric-name bucketed in-memory samples behind a
//!   read-only [`Querier`] view
//! - **Codecs**: exposition text in both directions, query-result JSON import
//! - **Mutation Operators**: load, save, drop, keep, rename and seed history
//! - **Rule Overlay**: recording and alerting rules evaluated into the store
//! - **Session**: the store, clock, query settings and rules in one place
//!
//! # Examples
//!
//! ```no_run
//! use promql_workbench::{LoadOptions, Session};
//!
//! # fn example() -> promql_workbench::Result<()> {
//! let mut session = Session::builder().with_fixed_now(1_700_000_000_000).build()?;
//! session.load_text("http_requests_total{code=\"200\"} 1024\n", &LoadOptions::default())?;
//! let value = session.query("sum(http_requests_total) by (code)", None)?;
//! print!("{value}");
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod error;
pub mod matchers;
pub mod mutate;
pub mod query_engine;
pub mod rules;
pub mod session;
pub mod storage;

pub use clock::Clock;
pub use error::{Error, QueryError, Result, RuleEvaluationError};
pub use matchers::{EqualMatcher, LabelMatcher, NotEqualMatcher, NotRegexMatcher, RegexMatcher};
pub use mutate::{SeriesFilter, TimestampMode};
pub use query_engine::{QueryEngine, QueryValue};
pub use rules::{ActiveRuleSet, AlertNotification, EvalReport, NotificationSink};
pub use session::{IngestReport, LoadOptions, Session, SessionBuilder};
pub use storage::{Labels, MemoryStorage, Querier, Sample, Series};
