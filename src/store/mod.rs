// src/store/mod.rs

//! Destination stores and the full-replace load.
//!
//! A [`Connector`] is the injected connection factory: it hands out a fresh
//! [`Destination`] per attempt, and dropping the destination closes it. Each
//! engine implements `replace_table` as one all-or-nothing operation, so a
//! failed load never leaves the table half written.

pub mod duck;
pub mod parquet;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::config::{is_identifier, ConnectionSpec};
use crate::dataset::{Dataset, TableContents};
use crate::error::{LoadError, PipelineError};

pub use self::duck::{DuckDbConnector, DuckDbDestination};
pub use self::parquet::{ParquetConnector, ParquetDestination};

/// Time a write may run past its commit deadline before the load is abandoned.
/// The abandoned write still sees the passed deadline and rolls back.
pub const WRITE_GRACE: Duration = Duration::from_millis(500);

/// Factory for destination connections.
pub trait Connector: Send + Sync {
    /// Open a new connection. Failures here are `ConnectionError`s.
    fn connect(&self) -> Result<Box<dyn Destination>, PipelineError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// An open connection to a store.
pub trait Destination: Send {
    /// Replace `table` with exactly the rows of `dataset`. Nothing becomes
    /// visible unless the whole replace completes before `deadline`.
    fn replace_table(
        &mut self,
        table: &str,
        dataset: &Dataset,
        deadline: Instant,
    ) -> Result<u64, LoadError>;

    /// Current contents of `table`, or `None` if it does not exist.
    fn read_table(&mut self, table: &str) -> Result<Option<TableContents>, LoadError>;
}

/// Build the connector for a resolved connection.
pub fn connector_for(spec: &ConnectionSpec) -> Arc<dyn Connector> {
    match spec {
        ConnectionSpec::DuckDb { path } => Arc::new(DuckDbConnector::new(path)),
        ConnectionSpec::Parquet { dir } => Arc::new(ParquetConnector::new(dir)),
    }
}

/// Blocking full replace of `table` with `dataset`.
///
/// The connection is held only for the duration of this call and is closed
/// on every path out of it.
#[instrument(level = "info", skip(dataset, connector, deadline), fields(target = %connector.describe(), rows = dataset.num_rows()))]
pub fn load(
    dataset: &Dataset,
    table: &str,
    connector: &dyn Connector,
    deadline: Instant,
) -> Result<u64, PipelineError> {
    check_table_name(table)?;
    let mut dest = connector.connect()?;
    if Instant::now() > deadline {
        return Err(PipelineError::connection(format!(
            "connecting to {} exceeded the deadline",
            connector.describe()
        )));
    }
    let written = dest.replace_table(table, dataset, deadline)?;
    info!(rows_written = written, "replaced table");
    Ok(written)
}

/// Async full replace with a timeout.
///
/// Connection acquisition is bounded by `timeout` and reported as
/// `ConnectionError` when it runs out. The write gets the remainder of the
/// same budget as a commit deadline and rolls back if it passes; a write that
/// stalls past the deadline plus [`WRITE_GRACE`] is abandoned with `LoadError`.
pub async fn load_with_timeout(
    dataset: Dataset,
    table: String,
    connector: Arc<dyn Connector>,
    timeout: Duration,
) -> Result<u64, PipelineError> {
    check_table_name(&table)?;
    let deadline = Instant::now() + timeout;
    let target = connector.describe();

    let connect = tokio::task::spawn_blocking({
        let connector = Arc::clone(&connector);
        move || connector.connect()
    });
    let mut dest = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(conn)) => conn?,
        Ok(Err(join)) => {
            return Err(PipelineError::connection(format!(
                "connect task for {} failed: {}",
                target, join
            )))
        }
        Err(_) => {
            return Err(PipelineError::connection(format!(
                "connecting to {} timed out after {:?}",
                target, timeout
            )))
        }
    };
    debug!(%target, "connected");

    let write = tokio::task::spawn_blocking(move || {
        let result = dest.replace_table(&table, &dataset, deadline);
        drop(dest);
        result
    });
    let budget = deadline.saturating_duration_since(Instant::now()) + WRITE_GRACE;
    let written = match tokio::time::timeout(budget, write).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join)) => {
            return Err(PipelineError::write(format!(
                "load task for {} failed: {}",
                target, join
            )))
        }
        Err(_) => {
            warn!(%target, "write stalled past the deadline, abandoning it");
            return Err(PipelineError::write(format!(
                "writing to {} did not finish within {:?}",
                target, timeout
            )));
        }
    };

    info!(%target, rows_written = written, "replaced table");
    Ok(written)
}

/// Blocking read of a table through a fresh connection.
pub fn read_table(
    connector: &dyn Connector,
    table: &str,
) -> Result<Option<TableContents>, PipelineError> {
    check_table_name(table)?;
    let mut dest = connector.connect()?;
    Ok(dest.read_table(table)?)
}

fn check_table_name(table: &str) -> Result<(), PipelineError> {
    if is_identifier(table) {
        Ok(())
    } else {
        Err(PipelineError::write(format!(
            "invalid table name `{}`",
            table
        )))
    }
}
