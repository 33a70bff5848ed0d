pub mod config;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod store;
pub mod task;

pub use config::Config;
pub use dataset::Dataset;
pub use error::{ErrorKind, LoadError, PipelineError};
pub use task::{RetryPolicy, RunResult, TaskRunner};
