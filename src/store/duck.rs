// src/store/duck.rs

use arrow::datatypes::DataType;
use duckdb::{params, types::Value, Connection, ToSql};
use std::{path::PathBuf, time::Instant};
use tracing::{debug, warn};

use super::{Connector, Destination};
use crate::dataset::{Dataset, Scalar, TableContents};
use crate::error::{LoadError, PipelineError};

/// Opens a DuckDB database file per connection.
#[derive(Clone, Debug)]
pub struct DuckDbConnector {
    path: PathBuf,
}

impl DuckDbConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for DuckDbConnector {
    fn connect(&self) -> Result<Box<dyn Destination>, PipelineError> {
        // DuckDB creates a missing file but not a missing directory.
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(PipelineError::connection(format!(
                    "directory {} does not exist",
                    parent.display()
                )));
            }
        }
        let conn = Connection::open(&self.path).map_err(|e| {
            PipelineError::connection(format!("opening {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), "opened duckdb");
        Ok(Box::new(DuckDbDestination::new(conn)))
    }

    fn describe(&self) -> String {
        format!("duckdb:{}", self.path.display())
    }
}

/// One open DuckDB connection. Closed when dropped.
pub struct DuckDbDestination {
    conn: Connection,
}

impl DuckDbDestination {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl Destination for DuckDbDestination {
    /// `DROP` + `CREATE` + bulk append inside one transaction. Any early
    /// return drops the transaction, which rolls it back.
    fn replace_table(
        &mut self,
        table: &str,
        dataset: &Dataset,
        deadline: Instant,
    ) -> Result<u64, LoadError> {
        let ident = quote_ident(table);
        let tx = self.conn.transaction()?;

        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", ident))?;
        tx.execute_batch(&create_table_sql(&ident, dataset))?;

        if !dataset.is_empty() {
            // Appender borrows the transaction; flush and release it before commit.
            let mut appender = tx.appender(table)?;
            for row in 0..dataset.num_rows() {
                let values: Vec<Value> = dataset.row(row).into_iter().map(to_value).collect();
                let cells: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
                appender.append_row(cells.as_slice())?;
            }
            appender.flush()?;
        }
        let written = dataset.num_rows() as u64;

        if Instant::now() > deadline {
            warn!(table, "deadline passed before commit, rolling back");
            return Err(LoadError::Write(format!(
                "replacing `{}` did not finish before the deadline; rolled back",
                table
            )));
        }
        tx.commit()?;
        Ok(written)
    }

    fn read_table(&mut self, table: &str) -> Result<Option<TableContents>, LoadError> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
        )?;
        let columns = stmt
            .query_map(params![table], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Ok(None);
        }

        let n = columns.len();
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
        let rows = stmt
            .query_map([], |r| {
                (0..n)
                    .map(|i| r.get::<_, Value>(i).map(from_value))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(TableContents { columns, rows }))
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(ty: &DataType) -> &'static str {
    match ty {
        DataType::Int64 => "BIGINT",
        DataType::Float64 => "DOUBLE",
        DataType::Boolean => "BOOLEAN",
        _ => "VARCHAR",
    }
}

fn create_table_sql(ident: &str, dataset: &Dataset) -> String {
    let cols: Vec<String> = dataset
        .schema()
        .fields()
        .iter()
        .map(|f| format!("{} {}", quote_ident(f.name()), sql_type(f.data_type())))
        .collect();
    format!("CREATE TABLE {} ({});", ident, cols.join(", "))
}

fn to_value(s: Scalar) -> Value {
    match s {
        Scalar::Null => Value::Null,
        Scalar::Int(v) => Value::BigInt(v),
        Scalar::Float(v) => Value::Double(v),
        Scalar::Text(v) => Value::Text(v),
        Scalar::Bool(v) => Value::Boolean(v),
    }
}

fn from_value(v: Value) -> Scalar {
    match v {
        Value::Null => Scalar::Null,
        Value::Boolean(b) => Scalar::Bool(b),
        Value::TinyInt(i) => Scalar::Int(i.into()),
        Value::SmallInt(i) => Scalar::Int(i.into()),
        Value::Int(i) => Scalar::Int(i.into()),
        Value::BigInt(i) => Scalar::Int(i),
        Value::UTinyInt(i) => Scalar::Int(i.into()),
        Value::USmallInt(i) => Scalar::Int(i.into()),
        Value::UInt(i) => Scalar::Int(i.into()),
        Value::Float(f) => Scalar::Float(f.into()),
        Value::Double(f) => Scalar::Float(f),
        Value::Text(s) => Scalar::Text(s),
        other => Scalar::Text(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{load, read_table};
    use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
    use duckdb::{AccessMode, Config};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn weather(times: &[&str], temps: &[f64]) -> Dataset {
        Dataset::new(vec![
            (
                "time".to_string(),
                Arc::new(StringArray::from(times.to_vec())) as ArrayRef,
            ),
            (
                "temperature_2m".to_string(),
                Arc::new(Float64Array::from(temps.to_vec())) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_replace_roundtrip() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        let ds = weather(&["t0", "t1"], &[1.5, -2.0]);

        assert_eq!(load(&ds, "new_dag_data", &db, later()).unwrap(), 2);
        let contents = read_table(&db, "new_dag_data").unwrap().unwrap();
        assert_eq!(contents, ds.to_contents());
    }

    #[test]
    fn test_replace_drops_previous_rows_and_columns() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));

        let old = Dataset::new(vec![(
            "legacy".to_string(),
            Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef,
        )])
        .unwrap();
        load(&old, "snap", &db, later()).unwrap();

        let new = weather(&["t9"], &[9.0]);
        load(&new, "snap", &db, later()).unwrap();
        assert_eq!(read_table(&db, "snap").unwrap().unwrap(), new.to_contents());
    }

    #[test]
    fn test_load_is_idempotent() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        let ds = weather(&["a", "b", "c"], &[1.0, 2.0, 3.0]);

        load(&ds, "snap", &db, later()).unwrap();
        let once = read_table(&db, "snap").unwrap();
        load(&ds, "snap", &db, later()).unwrap();
        let twice = read_table(&db, "snap").unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.unwrap().num_rows(), 3);
    }

    #[test]
    fn test_empty_dataset_empties_table() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        load(&weather(&["a"], &[1.0]), "snap", &db, later()).unwrap();

        let empty = weather(&[], &[]);
        assert_eq!(load(&empty, "snap", &db, later()).unwrap(), 0);
        let contents = read_table(&db, "snap").unwrap().unwrap();
        assert_eq!(contents.columns, vec!["time", "temperature_2m"]);
        assert!(contents.rows.is_empty());
    }

    #[test]
    fn test_missed_deadline_rolls_back() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        let before = weather(&["keep"], &[1.0]);
        load(&before, "snap", &db, later()).unwrap();

        let mut dest = db.connect().unwrap();
        let err = dest
            .replace_table("snap", &weather(&["x", "y"], &[0.0, 0.0]), Instant::now() - Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, LoadError::Write(_)));
        drop(dest);

        assert_eq!(read_table(&db, "snap").unwrap().unwrap(), before.to_contents());
    }

    #[test]
    fn test_failed_write_leaves_prior_contents() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("w.duckdb");
        let db = DuckDbConnector::new(&path);
        let before = weather(&["keep"], &[1.0]);
        load(&before, "snap", &db, later()).unwrap();

        let config = Config::default().access_mode(AccessMode::ReadOnly).unwrap();
        let ro = Connection::open_with_flags(&path, config).unwrap();
        let mut dest = DuckDbDestination::new(ro);
        assert!(dest
            .replace_table("snap", &weather(&["new"], &[2.0]), later())
            .is_err());
        drop(dest);

        assert_eq!(read_table(&db, "snap").unwrap().unwrap(), before.to_contents());
    }

    #[test]
    fn test_missing_directory_is_connection_error() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("nope").join("w.duckdb"));
        let err = load(&weather(&["a"], &[1.0]), "snap", &db, later()).unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_read_missing_table() {
        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        assert!(read_table(&db, "absent").unwrap().is_none());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("rain"), "\"rain\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_bulk_append_keeps_types_and_nulls() {
        use arrow::array::BooleanArray;

        let tmp = tempdir().unwrap();
        let db = DuckDbConnector::new(tmp.path().join("w.duckdb"));
        let n = 5_000;
        let ds = Dataset::new(vec![
            (
                "time".to_string(),
                Arc::new(StringArray::from_iter_values((0..n).map(|i| format!("t{}", i)))) as ArrayRef,
            ),
            (
                "probability".to_string(),
                Arc::new(Int64Array::from_iter((0..n).map(|i| (i % 7 != 0).then_some(i as i64)))) as ArrayRef,
            ),
            (
                "rain".to_string(),
                Arc::new(Float64Array::from_iter((0..n).map(|i| Some(i as f64 / 10.0)))) as ArrayRef,
            ),
            (
                "frost".to_string(),
                Arc::new(BooleanArray::from_iter((0..n).map(|i| Some(i % 2 == 0)))) as ArrayRef,
            ),
        ])
        .unwrap();

        assert_eq!(load(&ds, "snap", &db, later()).unwrap(), n as u64);
        let contents = read_table(&db, "snap").unwrap().unwrap();
        assert_eq!(contents.num_rows(), n);
        assert_eq!(contents, ds.to_contents());
        assert_eq!(contents.rows[7][1], Scalar::Null);
    }
}
