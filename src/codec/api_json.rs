//! Import of Prometheus HTTP API query responses.
//!
//! Accepts the body of `/api/v1/query` or `/api/v1/query_range`, either the
//! full `{"status": ..., "data": ...}` envelope or just the `data` object.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::codec::{parse_value, Decoded, DecodedSample};
use crate::error::{Error, Result};
use crate::storage::Labels;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<ApiData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Vector(Vec<VectorItem>),
    Matrix(Vec<MatrixItem>),
    Scalar(ApiPoint),
}

#[derive(Debug, Deserialize)]
struct VectorItem {
    metric: BTreeMap<String, String>,
    value: ApiPoint,
}

#[derive(Debug, Deserialize)]
struct MatrixItem {
    metric: BTreeMap<String, String>,
    values: Vec<ApiPoint>,
}

/// `[unix_seconds, "value"]`
#[derive(Debug, Deserialize)]
struct ApiPoint(f64, String);

impl ApiPoint {
    fn decode(&self, labels: &Labels) -> Result<DecodedSample> {
        let value = parse_value(&self.1)
            .ok_or_else(|| Error::input(1, format!("invalid sample value {:?}", self.1)))?;
        let timestamp = Some((self.0 * 1000.0).round() as i64);
        Ok(DecodedSample { labels: labels.clone(), value, timestamp })
    }
}

/// Decode an API response into samples.
///
/// Samples keep whatever `__name__` the response carries; unnamed results are
/// named by the store when inserted.
pub fn decode(input: &str) -> Result<Decoded> {
    let value: serde_json::Value = serde_json::from_str(input)?;
    let data = if value.get("status").is_some() {
        let response: ApiResponse = serde_json::from_value(value)?;
        if response.status != "success" {
            let reason = response.error.unwrap_or_else(|| response.status.clone());
            return Err(Error::input(1, format!("query response is an error: {reason}")));
        }
        response.data.ok_or_else(|| Error::input(1, "query response has no data"))?
    } else {
        serde_json::from_value(value)?
    };

    let mut decoded = Decoded::default();
    match data {
        ApiData::Vector(items) => {
            for item in items {
                let labels: Labels = item.metric.into_iter().collect();
                decoded.samples.push(item.value.decode(&labels)?);
            }
        }
        ApiData::Matrix(items) => {
            for item in items {
                let labels: Labels = item.metric.into_iter().collect();
                for point in &item.values {
                    decoded.samples.push(point.decode(&labels)?);
                }
            }
        }
        ApiData::Scalar(point) => decoded.samples.push(point.decode(&Labels::new())?),
    }
    Ok(decoded)
}
