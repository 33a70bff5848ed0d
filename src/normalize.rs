// src/normalize.rs

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::fetch::RawPayload;

/// Time index of every series; always selected, always the first column.
pub const TIME_FIELD: &str = "time";

/// The columns `normalize` selects for `requested`: `time` first, then the
/// requested fields in order.
pub fn expected_fields(requested: &[String]) -> Vec<String> {
    std::iter::once(TIME_FIELD.to_string())
        .chain(requested.iter().cloned())
        .collect()
}

/// Select `expected` from the payload's `granularity` object into a [`Dataset`].
///
/// Keys of the container not listed in `expected` are ignored. Row order is the
/// order of the arrays in the payload.
#[instrument(level = "info", skip(payload, expected), fields(columns = expected.len()))]
pub fn normalize(
    payload: &RawPayload,
    granularity: &str,
    expected: &[String],
) -> Result<Dataset, PipelineError> {
    let container = payload
        .as_value()
        .get(granularity)
        .ok_or_else(|| {
            PipelineError::SchemaMismatch(format!("payload has no `{}` object", granularity))
        })?
        .as_object()
        .ok_or_else(|| {
            PipelineError::SchemaMismatch(format!("`{}` is not an object", granularity))
        })?;

    let mut columns: Vec<(String, ArrayRef)> = Vec::with_capacity(expected.len());
    let mut expected_len: Option<usize> = None;

    for field in expected {
        let values = container
            .get(field)
            .ok_or_else(|| {
                PipelineError::SchemaMismatch(format!(
                    "field `{}` missing from `{}`",
                    field, granularity
                ))
            })?
            .as_array()
            .ok_or_else(|| {
                PipelineError::SchemaMismatch(format!("field `{}` is not an array", field))
            })?;

        match expected_len {
            None => expected_len = Some(values.len()),
            Some(n) if n != values.len() => {
                return Err(PipelineError::SchemaMismatch(format!(
                    "field `{}` has {} values, expected {}",
                    field,
                    values.len(),
                    n
                )));
            }
            Some(_) => {}
        }

        let array = build_column(field, values)?;
        columns.push((field.clone(), array));
    }

    let dataset = Dataset::new(columns)?;
    debug!(rows = dataset.num_rows(), "normalized");
    Ok(dataset)
}

/// Column type inferred from the non-null values of one series.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
}

fn infer_type(field: &str, values: &[Value]) -> Result<ColumnType, PipelineError> {
    let mut ty: Option<ColumnType> = None;
    for (i, v) in values.iter().enumerate() {
        let this = match v {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Bool,
            Value::Number(n) if n.is_i64() => ColumnType::Int,
            Value::Number(_) => ColumnType::Float,
            Value::String(_) => ColumnType::Text,
            Value::Array(_) | Value::Object(_) => {
                return Err(PipelineError::SchemaMismatch(format!(
                    "field `{}` row {} is not a scalar",
                    field, i
                )));
            }
        };
        ty = Some(match (ty, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Int), ColumnType::Float) | (Some(ColumnType::Float), ColumnType::Int) => {
                ColumnType::Float
            }
            (Some(a), b) => {
                return Err(PipelineError::SchemaMismatch(format!(
                    "field `{}` mixes {:?} and {:?} values (row {})",
                    field, a, b, i
                )));
            }
        });
    }
    // Nothing to infer from: store as text.
    Ok(ty.unwrap_or(ColumnType::Text))
}

fn build_column(field: &str, values: &[Value]) -> Result<ArrayRef, PipelineError> {
    let array: ArrayRef = match infer_type(field, values)? {
        ColumnType::Int => Arc::new(values.iter().map(Value::as_i64).collect::<Int64Array>()),
        ColumnType::Float => Arc::new(values.iter().map(Value::as_f64).collect::<Float64Array>()),
        ColumnType::Bool => Arc::new(values.iter().map(Value::as_bool).collect::<BooleanArray>()),
        ColumnType::Text => Arc::new(values.iter().map(Value::as_str).collect::<StringArray>()),
    };
    Ok(array)
}
