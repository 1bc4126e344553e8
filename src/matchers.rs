//! Label matchers used to select series.
//!
//! Matching follows Prometheus semantics: a label that is not present behaves
//! like a label with an empty value, and regular expressions must match the
//! whole value.

use regex::Regex;

use crate::error::QueryError;
use crate::storage::{Labels, METRIC_NAME_LABEL};

/// A predicate over one label of a series.
pub trait LabelMatcher: Send + Sync + std::fmt::Debug {
    /// Name of the label this matcher inspects.
    fn label_name(&self) -> &str;

    /// Test the label's value; `None` when the label is absent.
    fn matches_value(&self, value: Option<&str>) -> bool;

    /// Test a full label set.
    fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(self.label_name()))
    }

    /// True when this matcher constrains the metric name.
    fn is_name_matcher(&self) -> bool {
        self.label_name() == METRIC_NAME_LABEL
    }
}

/// Compile `pattern` anchored at both ends.
///
/// # Errors
///
/// Returns [`QueryError::Construction`] when `pattern` is not a valid regex.
pub fn anchored_regex(pattern: &str) -> Result<Regex, QueryError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| QueryError::Construction(format!("invalid regex {pattern:?}: {e}")))
}

/// Equality matcher for exact label value matching.
#[derive(Debug, Clone)]
pub struct EqualMatcher {
    pub name: String,
    pub value: String,
}

impl EqualMatcher {
    /// Create a new equality matcher.
    ///
    /// # Parameters
    ///
    /// - `name` - Label name to match
    /// - `value` - Exact value to match; empty also matches an absent label
    ///
    /// # Returns
    ///
    /// Returns a new `EqualMatcher` instance.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

impl LabelMatcher for EqualMatcher {
    fn label_name(&self) -> &str {
        &self.name
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        value.unwrap_or_default() == self.value
    }
}

/// Not-equality matcher for excluding specific label values.
#[derive(Debug, Clone)]
pub struct NotEqualMatcher {
    pub name: String,
    pub value: String,
}

impl NotEqualMatcher {
    /// Create a new not-equality matcher.
    ///
    /// # Parameters
    ///
    /// - `name` - Label name to match
    /// - `value` - Value to exclude
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

impl LabelMatcher for NotEqualMatcher {
    fn label_name(&self) -> &str {
        &self.name
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        value.unwrap_or_default() != self.value
    }
}

/// Regex matcher; the pattern must already be anchored.
#[derive(Debug)]
pub struct RegexMatcher {
    pub name: String,
    pub pattern: Regex,
}

impl RegexMatcher {
    /// Create a new regex matcher.
    ///
    /// # Parameters
    ///
    /// - `name` - Label name to match
    /// - `pattern` - Compiled pattern, see [`anchored_regex`]
    ///
    /// # Returns
    ///
    /// Returns a new `RegexMatcher` instance.
    pub fn new(name: impl Into<String>, pattern: Regex) -> Self {
        Self { name: name.into(), pattern }
    }
}

impl LabelMatcher for RegexMatcher {
    fn label_name(&self) -> &str {
        &self.name
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        self.pattern.is_match(value.unwrap_or_default())
    }
}

/// Negated regex matcher; the pattern must already be anchored.
#[derive(Debug)]
pub struct NotRegexMatcher {
    pub name: String,
    pub pattern: Regex,
}

impl NotRegexMatcher {
    pub fn new(name: impl Into<String>, pattern: Regex) -> Self {
        Self { name: name.into(), pattern }
    }
}

impl LabelMatcher for NotRegexMatcher {
    fn label_name(&self) -> &str {
        &self.name
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        !self.pattern.is_match(value.unwrap_or_default())
    }
}

/// Matches series that do not carry the label at all (`label=""`).
#[derive(Debug, Clone)]
pub struct AbsentMatcher {
    pub name: String,
}

impl AbsentMatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl LabelMatcher for AbsentMatcher {
    fn label_name(&self) -> &str {
        &self.name
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        value.map_or(true, str::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Labels {
        [("__name__", "http_requests_total"), ("job", "api"), ("method", "GET")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_basic_matchers() {
        let labels = labels();

        assert!(EqualMatcher::new("job", "api").matches(&labels));
        assert!(!EqualMatcher::new("job", "web").matches(&labels));
        assert!(NotEqualMatcher::new("job", "web").matches(&labels));
        assert!(!NotEqualMatcher::new("job", "api").matches(&labels));
        assert!(EqualMatcher::new("__name__", "http_requests_total").is_name_matcher());
    }

    #[test]
    fn test_regex_matchers_are_anchored() {
        let labels: Labels =
            [("service", "web-frontend"), ("version", "v1.2.3")].into_iter().collect();

        let matcher = RegexMatcher::new("service", anchored_regex("web.*").expect("valid regex"));
        assert!(matcher.matches(&labels));

        let matcher = RegexMatcher::new("service", anchored_regex("front").expect("valid regex"));
        assert!(!matcher.matches(&labels));

        let matcher = NotRegexMatcher::new("service", anchored_regex("api.*").expect("valid regex"));
        assert!(matcher.matches(&labels));
    }

    #[test]
    fn test_missing_label_is_empty() {
        let labels = labels();

        assert!(AbsentMatcher::new("instance").matches(&labels));
        assert!(!AbsentMatcher::new("job").matches(&labels));
        assert!(EqualMatcher::new("instance", "").matches(&labels));
        assert!(NotEqualMatcher::new("instance", "x").matches(&labels));
        assert!(!RegexMatcher::new("instance", anchored_regex(".+").expect("valid regex"))
            .matches(&labels));
    }

    #[test]
    fn test_invalid_regex_is_construction_error() {
        assert!(matches!(anchored_regex("(unclosed"), Err(QueryError::Construction(_))));
    }
}
