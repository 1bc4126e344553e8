//! Aggregation operators (`sum`, `avg`, `topk`, ...).

use std::collections::BTreeMap;

use promql_parser::parser::{AggregateExpr, LabelModifier};

use super::{Evaluator, InstantSample, QueryValue};
use crate::error::QueryError;
use crate::storage::{Labels, METRIC_NAME_LABEL};

impl Evaluator<'_> {
    pub(super) fn aggregate(&self, agg: &AggregateExpr) -> Result<QueryValue, QueryError> {
        let op = agg.op.to_string().to_lowercase();
        let param = match &agg.param {
            Some(p) => Some(self.eval_scalar(p, &op)?),
            None => None,
        };
        let input = self.eval_vector(&agg.expr, &op)?;

        let mut groups: BTreeMap<Labels, Vec<InstantSample>> = BTreeMap::new();
        for sample in input {
            groups.entry(grouping_key(&sample.labels, agg.modifier.as_ref())).or_default().push(sample);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (labels, members) in groups {
            match op.as_str() {
                "topk" | "bottomk" => {
                    let k = param.unwrap_or_default();
                    out.extend(select_k(members, k, op == "topk"));
                }
                _ => {
                    let values: Vec<f64> = members.iter().map(|s| s.value).collect();
                    let value = reduce(&op, &values, param)?;
                    out.push(InstantSample { labels, timestamp: self.at, value });
                }
            }
        }
        Ok(QueryValue::Vector(out))
    }
}

/// Output labels of the group a sample belongs to.
fn grouping_key(labels: &Labels, modifier: Option<&LabelModifier>) -> Labels {
    match modifier {
        None => Labels::new(),
        Some(LabelModifier::Include(by)) => {
            let mut key = labels.clone();
            key.retain(|n| by.labels.iter().any(|l| l == n));
            key
        }
        Some(LabelModifier::Exclude(without)) => {
            let mut key = labels.clone();
            key.retain(|n| n != METRIC_NAME_LABEL && !without.labels.iter().any(|l| l == n));
            key
        }
    }
}

fn reduce(op: &str, values: &[f64], param: Option<f64>) -> Result<f64, QueryError> {
    let n = values.len() as f64;
    Ok(match op {
        "sum" => values.iter().sum(),
        "avg" => values.iter().sum::<f64>() / n,
        "count" => n,
        "group" => 1.0,
        "min" => fold_extreme(values, |candidate, current| candidate < current),
        "max" => fold_extreme(values, |candidate, current| candidate > current),
        "stdvar" => variance(values),
        "stddev" => variance(values).sqrt(),
        "quantile" => quantile(param.unwrap_or(f64::NAN), values),
        _ => return Err(QueryError::Evaluation(format!("unsupported aggregation {op}"))),
    })
}

/// Min/max where NaN only survives when every input is NaN.
fn fold_extreme(values: &[f64], better: impl Fn(f64, f64) -> bool) -> f64 {
    values.iter().copied().fold(f64::NAN, |current, v| {
        if current.is_nan() || better(v, current) {
            v
        } else {
            current
        }
    })
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Linear-interpolated φ-quantile.
pub(super) fn quantile(phi: f64, values: &[f64]) -> f64 {
    if values.is_empty() || phi.is_nan() {
        return f64::NAN;
    }
    if phi < 0.0 {
        return f64::NEG_INFINITY;
    }
    if phi > 1.0 {
        return f64::INFINITY;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = phi * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = rank - rank.floor();
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

fn select_k(mut members: Vec<InstantSample>, k: f64, top: bool) -> Vec<InstantSample> {
    if k < 1.0 || k.is_nan() {
        return Vec::new();
    }
    members.sort_by(|a, b| if top { b.value.total_cmp(&a.value) } else { a.value.total_cmp(&b.value) });
    members.truncate(k as usize);
    members
}
