// src/dataset.rs

use arrow::{
    array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use std::{collections::HashSet, fmt, sync::Arc};

use crate::error::PipelineError;

/// A tabular snapshot: ordered, uniquely named columns of equal length.
///
/// Backed by a single Arrow `RecordBatch`; every column is nullable and one of
/// `Int64`, `Float64`, `Utf8` or `Boolean`.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    batch: RecordBatch,
}

/// One cell, detached from its Arrow array.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("NULL"),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => f.write_str(v),
            Scalar::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Plain row-major view of a table, used to compare what a store holds with
/// what was loaded into it.
#[derive(Clone, Debug, PartialEq)]
pub struct TableContents {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl TableContents {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

impl Dataset {
    /// Assemble a dataset from `(name, array)` pairs, in the given column order.
    pub fn new(columns: Vec<(String, ArrayRef)>) -> Result<Self, PipelineError> {
        if columns.is_empty() {
            return Err(PipelineError::SchemaMismatch(
                "a dataset needs at least one column".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(columns.len());
        let expected_len = columns[0].1.len();
        for (name, array) in &columns {
            if name.is_empty() {
                return Err(PipelineError::SchemaMismatch("empty column name".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::SchemaMismatch(format!(
                    "duplicate column `{}`",
                    name
                )));
            }
            if !is_supported(array.data_type()) {
                return Err(PipelineError::SchemaMismatch(format!(
                    "column `{}` has unsupported type {}",
                    name,
                    array.data_type()
                )));
            }
            if array.len() != expected_len {
                return Err(PipelineError::SchemaMismatch(format!(
                    "column `{}` has {} values, expected {}",
                    name,
                    array.len(),
                    expected_len
                )));
            }
        }

        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(name, array.data_type().clone(), true))
            .collect();
        let arrays: Vec<ArrayRef> = columns.into_iter().map(|(_, a)| a).collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Ok(Self { batch })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Cells of row `row`, in column order.
    pub fn row(&self, row: usize) -> Vec<Scalar> {
        self.batch
            .columns()
            .iter()
            .map(|a| scalar_at(a.as_ref(), row))
            .collect()
    }

    pub fn to_contents(&self) -> TableContents {
        TableContents {
            columns: self.column_names(),
            rows: (0..self.num_rows()).map(|r| self.row(r)).collect(),
        }
    }
}

fn is_supported(ty: &DataType) -> bool {
    matches!(
        ty,
        DataType::Int64 | DataType::Float64 | DataType::Utf8 | DataType::Boolean
    )
}

/// Read one cell out of an Arrow array. Types outside the dataset's four are
/// rendered through Arrow's display formatter.
pub fn scalar_at(array: &dyn Array, row: usize) -> Scalar {
    if array.is_null(row) {
        return Scalar::Null;
    }
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        Scalar::Int(a.value(row))
    } else if let Some(a) = any.downcast_ref::<Float64Array>() {
        Scalar::Float(a.value(row))
    } else if let Some(a) = any.downcast_ref::<StringArray>() {
        Scalar::Text(a.value(row).to_string())
    } else if let Some(a) = any.downcast_ref::<BooleanArray>() {
        Scalar::Bool(a.value(row))
    } else {
        let text = arrow::util::display::array_value_to_string(array, row)
            .unwrap_or_else(|e| format!("<{}>", e));
        Scalar::Text(text)
    }
}
