//! Error taxonomy for a single pipeline run.
//!
//! Every variant carries a stable code, included in the `Display` output as
//! `[CODE] message` and available through [`PipelineError::code()`]. The task
//! runner reports these codes to the scheduler unchanged.

use serde::Serialize;
use std::fmt;

/// Failure category of a run, one per stage boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network or transport failure reaching the data source (including timeouts).
    SourceUnavailable,
    /// The data source answered with a non-success status.
    SourceError,
    /// The response body was not parseable as JSON.
    SourceFormatError,
    /// Expected fields missing, misaligned or of incompatible types.
    SchemaMismatch,
    /// The destination store could not be reached.
    ConnectionError,
    /// The write failed after connecting.
    LoadError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorKind::SourceError => "SOURCE_ERROR",
            ErrorKind::SourceFormatError => "SOURCE_FORMAT_ERROR",
            ErrorKind::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::LoadError => "LOAD_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-side failures. `Connection` is the distinguished subtype for an
/// unreachable store; `Write` covers everything after a connection exists.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("[CONNECTION_ERROR] {0}")]
    Connection(String),

    #[error("[LOAD_ERROR] {0}")]
    Write(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("[SOURCE_UNAVAILABLE] {0}")]
    SourceUnavailable(String),

    #[error("[SOURCE_ERROR] status {status}: {message}")]
    SourceError { status: u16, message: String },

    #[error("[SOURCE_FORMAT_ERROR] {0}")]
    SourceFormatError(String),

    #[error("[SCHEMA_MISMATCH] {0}")]
    SchemaMismatch(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            PipelineError::SourceError { .. } => ErrorKind::SourceError,
            PipelineError::SourceFormatError(_) => ErrorKind::SourceFormatError,
            PipelineError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            PipelineError::Load(LoadError::Connection(_)) => ErrorKind::ConnectionError,
            PipelineError::Load(LoadError::Write(_)) => ErrorKind::LoadError,
        }
    }

    /// Stable SCREAMING_SNAKE_CASE code for this error.
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// True for both `ConnectionError` and `LoadError`.
    pub fn is_load(&self) -> bool {
        matches!(self, PipelineError::Load(_))
    }

    pub(crate) fn connection(msg: impl Into<String>) -> Self {
        PipelineError::Load(LoadError::Connection(msg.into()))
    }

    pub(crate) fn write(msg: impl Into<String>) -> Self {
        PipelineError::Load(LoadError::Write(msg.into()))
    }
}

impl From<duckdb::Error> for LoadError {
    fn from(e: duckdb::Error) -> Self {
        LoadError::Write(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for PipelineError {
    fn from(e: arrow::error::ArrowError) -> Self {
        PipelineError::SchemaMismatch(e.to_string())
    }
}
