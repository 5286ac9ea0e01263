// src/normalize/mod.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedResponseError;

/// The `data` member of a segmentation response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentData {
    /// `[index, entity_id]` pairs.
    pub series_labels: Vec<Value>,
    /// `[total]` per label, same order.
    pub series: Vec<Value>,
    pub x_values: Vec<String>,
}

/// One entity's total for one day, before the channel is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFragment {
    pub payment_date: String,
    pub entity_id: String,
    pub count: f64,
}

/// Flatten a decoded segmentation payload into one fragment per entity.
pub fn normalize(body: &Value) -> Result<Vec<RowFragment>, MalformedResponseError> {
    let data = match body.get("data") {
        Some(data) => data,
        None => {
            return Err(match body.get("error") {
                Some(Value::String(msg)) => MalformedResponseError::Api(msg.clone()),
                Some(other) => MalformedResponseError::Api(other.to_string()),
                None => MalformedResponseError::MissingData,
            })
        }
    };

    let data = SegmentData::deserialize(data)
        .map_err(|e| MalformedResponseError::Shape(e.to_string()))?;

    if data.series_labels.len() != data.series.len() {
        return Err(MalformedResponseError::LengthMismatch {
            labels: data.series_labels.len(),
            values: data.series.len(),
        });
    }
    if data.series_labels.is_empty() {
        return Err(MalformedResponseError::NoLabels);
    }
    let payment_date = data
        .x_values
        .first()
        .ok_or(MalformedResponseError::NoDateBucket)?;

    data.series_labels
        .iter()
        .zip(&data.series)
        .enumerate()
        .map(|(i, (label, value))| {
            let entity_id = entity_id(label).ok_or(MalformedResponseError::BadLabel(i))?;
            let count = value
                .get(0)
                .and_then(Value::as_f64)
                .ok_or(MalformedResponseError::BadValue(i))?;
            Ok(RowFragment {
                payment_date: payment_date.clone(),
                entity_id,
                count,
            })
        })
        .collect()
}

fn entity_id(label: &Value) -> Option<String> {
    match label.get(1)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
