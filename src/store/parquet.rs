// src/store/parquet.rs

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, warn};

use super::{Connector, Destination};
use crate::dataset::{scalar_at, Dataset, TableContents};
use crate::error::{LoadError, PipelineError};

/// A directory holding one `<table>.parquet` snapshot per table.
#[derive(Clone, Debug)]
pub struct ParquetConnector {
    dir: PathBuf,
}

impl ParquetConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Connector for ParquetConnector {
    fn connect(&self) -> Result<Box<dyn Destination>, PipelineError> {
        if !self.dir.is_dir() {
            return Err(PipelineError::connection(format!(
                "snapshot directory {} does not exist",
                self.dir.display()
            )));
        }
        Ok(Box::new(ParquetDestination {
            dir: self.dir.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("parquet:{}", self.dir.display())
    }
}

pub struct ParquetDestination {
    dir: PathBuf,
}

impl ParquetDestination {
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.parquet", table))
    }
}

impl Destination for ParquetDestination {
    /// Write to a temp file in the same directory, then rename it over the
    /// previous snapshot. The temp file is removed on every failure path.
    fn replace_table(
        &mut self,
        table: &str,
        dataset: &Dataset,
        deadline: Instant,
    ) -> Result<u64, LoadError> {
        let final_path = self.table_path(table);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", table))
            .suffix(".parquet.tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| write_err(&self.dir, "creating temp file in", e))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), dataset.schema(), Some(props))
            .map_err(|e| write_err(&final_path, "creating writer for", e))?;
        if !dataset.is_empty() {
            writer
                .write(dataset.record_batch())
                .map_err(|e| write_err(&final_path, "writing", e))?;
        }
        writer
            .close()
            .map_err(|e| write_err(&final_path, "closing writer for", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| write_err(&final_path, "syncing", e))?;

        if Instant::now() > deadline {
            warn!(table, "deadline passed before rename, discarding snapshot");
            return Err(LoadError::Write(format!(
                "replacing `{}` did not finish before the deadline; previous snapshot kept",
                table
            )));
        }

        tmp.persist(&final_path)
            .map_err(|e| write_err(&final_path, "renaming snapshot to", e.error))?;
        debug!(path = %final_path.display(), rows = dataset.num_rows(), "snapshot written");
        Ok(dataset.num_rows() as u64)
    }

    fn read_table(&mut self, table: &str) -> Result<Option<TableContents>, LoadError> {
        let path = self.table_path(table);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| write_err(&path, "opening", e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| write_err(&path, "reading metadata of", e))?;
        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let reader = builder
            .build()
            .map_err(|e| write_err(&path, "reading", e))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| write_err(&path, "decoding", e))?;
            for r in 0..batch.num_rows() {
                rows.push(
                    batch
                        .columns()
                        .iter()
                        .map(|a| scalar_at(a.as_ref(), r))
                        .collect(),
                );
            }
        }
        Ok(Some(TableContents { columns, rows }))
    }
}

fn write_err(path: &Path, action: &str, e: impl std::fmt::Display) -> LoadError {
    LoadError::Write(format!("{} {}: {}", action, path.display(), e))
}
