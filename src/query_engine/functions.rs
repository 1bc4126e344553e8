//! PromQL function calls.

use promql_parser::label::MatchOp;
use promql_parser::parser::{Call, Expr};

use super::aggregate::quantile;
use super::{duration_ms, unexpected, Evaluator, InstantSample, QueryValue};
use crate::error::QueryError;
use crate::storage::{Labels, Point, Series, METRIC_NAME_LABEL};

impl Evaluator<'_> {
    pub(super) fn call(&self, call: &Call) -> Result<QueryValue, QueryError> {
        let name = call.func.name;
        let args: Vec<&Expr> = call.args.args.iter().map(|a| a.as_ref()).collect();
        let arg = |i: usize| {
            args.get(i)
                .copied()
                .ok_or_else(|| QueryError::Evaluation(format!("{name}: missing argument {}", i + 1)))
        };

        match name {
            "time" => Ok(QueryValue::Scalar(self.at as f64 / 1000.0)),
            "vector" => {
                let value = self.eval_scalar(arg(0)?, name)?;
                Ok(QueryValue::Vector(vec![InstantSample { labels: Labels::new(), timestamp: self.at, value }]))
            }
            "scalar" => {
                let v = self.eval_vector(arg(0)?, name)?;
                Ok(QueryValue::Scalar(if v.len() == 1 { v[0].value } else { f64::NAN }))
            }
            "absent" => {
                let v = self.eval_vector(arg(0)?, name)?;
                if !v.is_empty() {
                    return Ok(QueryValue::Vector(Vec::new()));
                }
                let labels = absent_labels(arg(0)?);
                Ok(QueryValue::Vector(vec![InstantSample { labels, timestamp: self.at, value: 1.0 }]))
            }
            "timestamp" => {
                let v = self.eval_vector(arg(0)?, name)?;
                Ok(QueryValue::Vector(
                    v.into_iter()
                        .map(|s| InstantSample {
                            labels: s.labels.without_name(),
                            timestamp: self.at,
                            value: s.timestamp as f64 / 1000.0,
                        })
                        .collect(),
                ))
            }
            "sort" | "sort_desc" => {
                let mut v = self.eval_vector(arg(0)?, name)?;
                v.sort_by(|a, b| a.value.total_cmp(&b.value));
                if name == "sort_desc" {
                    v.reverse();
                }
                Ok(QueryValue::Vector(v))
            }
            "abs" | "ceil" | "floor" | "sqrt" | "exp" | "ln" | "log2" | "log10" => {
                let v = self.eval_vector(arg(0)?, name)?;
                Ok(self.map_values(v, |x| math(name, x)))
            }
            "round" => {
                let v = self.eval_vector(arg(0)?, name)?;
                let to_nearest = match args.get(1) {
                    Some(expr) => self.eval_scalar(expr, name)?,
                    None => 1.0,
                };
                Ok(self.map_values(v, |x| (x / to_nearest).round() * to_nearest))
            }
            "clamp_min" | "clamp_max" => {
                let v = self.eval_vector(arg(0)?, name)?;
                let bound = self.eval_scalar(arg(1)?, name)?;
                if name == "clamp_min" {
                    Ok(self.map_values(v, |x| x.max(bound)))
                } else {
                    Ok(self.map_values(v, |x| x.min(bound)))
                }
            }
            "quantile_over_time" => {
                let phi = self.eval_scalar(arg(0)?, name)?;
                let (series, _) = self.range_arg(arg(1)?, name)?;
                Ok(self.over_range(series, 1, |points, _| {
                    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
                    Some(quantile(phi, &values))
                }))
            }
            _ => self.range_function(name, arg(0)?),
        }
    }

    /// Functions taking a single range vector argument.
    fn range_function(&self, name: &str, arg: &Expr) -> Result<QueryValue, QueryError> {
        let reducer: fn(&[Point], i64) -> Option<f64> = match name {
            "rate" => |p, range| Some(increase(p) / (range as f64 / 1000.0)),
            "increase" => |p, _| Some(increase(p)),
            "delta" => |p, _| Some(p[p.len() - 1].value - p[0].value),
            "irate" => |p, _| {
                let (prev, last) = (p[p.len() - 2], p[p.len() - 1]);
                let diff = if last.value < prev.value { last.value } else { last.value - prev.value };
                let secs = (last.timestamp - prev.timestamp) as f64 / 1000.0;
                (secs > 0.0).then(|| diff / secs)
            },
            "idelta" => |p, _| Some(p[p.len() - 1].value - p[p.len() - 2].value),
            "resets" => |p, _| Some(p.windows(2).filter(|w| w[1].value < w[0].value).count() as f64),
            "changes" => |p, _| Some(p.windows(2).filter(|w| w[1].value != w[0].value).count() as f64),
            "avg_over_time" => |p, _| Some(p.iter().map(|x| x.value).sum::<f64>() / p.len() as f64),
            "sum_over_time" => |p, _| Some(p.iter().map(|x| x.value).sum()),
            "min_over_time" => |p, _| p.iter().map(|x| x.value).reduce(f64::min),
            "max_over_time" => |p, _| p.iter().map(|x| x.value).reduce(f64::max),
            "count_over_time" => |p, _| Some(p.len() as f64),
            "last_over_time" => |p, _| p.last().map(|x| x.value),
            "present_over_time" => |_, _| Some(1.0),
            _ => return Err(QueryError::Evaluation(format!("unsupported function {name}"))),
        };
        let min_points = match name {
            "rate" | "increase" | "delta" | "irate" | "idelta" => 2,
            _ => 1,
        };

        let (series, range) = self.range_arg(arg, name)?;
        Ok(self.over_range(series, min_points, |points, _| reducer(points, range)))
    }

    /// Evaluate a range-vector argument and return it with its range.
    fn range_arg(&self, expr: &Expr, name: &str) -> Result<(Vec<Series>, i64), QueryError> {
        let range = match expr {
            Expr::MatrixSelector(ms) => duration_ms(ms.range),
            _ => {
                return Err(QueryError::Evaluation(format!(
                    "{name}: expected a range vector selector argument"
                )))
            }
        };
        match self.eval(expr)? {
            QueryValue::Matrix(series) => Ok((series, range)),
            other => Err(unexpected(name, &other)),
        }
    }

    fn over_range(
        &self,
        series: Vec<Series>,
        min_points: usize,
        reduce: impl Fn(&[Point], i64) -> Option<f64>,
    ) -> QueryValue {
        let samples = series
            .into_iter()
            .filter(|s| s.points.len() >= min_points)
            .filter_map(|s| {
                let value = reduce(&s.points, self.at)?;
                Some(InstantSample { labels: s.labels.without_name(), timestamp: self.at, value })
            })
            .collect();
        QueryValue::Vector(samples)
    }

    fn map_values(&self, vector: Vec<InstantSample>, f: impl Fn(f64) -> f64) -> QueryValue {
        QueryValue::Vector(
            vector
                .into_iter()
                .map(|s| InstantSample { labels: s.labels.without_name(), timestamp: self.at, value: f(s.value) })
                .collect(),
        )
    }
}

/// Counter increase across `points`, compensating for resets.
fn increase(points: &[Point]) -> f64 {
    let correction: f64 =
        points.windows(2).filter(|w| w[1].value < w[0].value).map(|w| w[0].value).sum();
    points[points.len() - 1].value - points[0].value + correction
}

fn math(name: &str, x: f64) -> f64 {
    match name {
        "abs" => x.abs(),
        "ceil" => x.ceil(),
        "floor" => x.floor(),
        "sqrt" => x.sqrt(),
        "exp" => x.exp(),
        "ln" => x.ln(),
        "log2" => x.log2(),
        _ => x.log10(),
    }
}

/// Labels `absent()` reports: the equality matchers of a plain selector.
fn absent_labels(expr: &Expr) -> Labels {
    let mut labels = Labels::new();
    if let Expr::VectorSelector(vs) = expr {
        for m in &vs.matchers.matchers {
            if matches!(m.op, MatchOp::Equal) && m.name != METRIC_NAME_LABEL {
                labels.insert(m.name.clone(), m.value.clone());
            }
        }
    }
    labels
}
