// src/task.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::{ErrorKind, PipelineError};
use crate::fetch::{Endpoint, Fetcher};
use crate::normalize::{expected_fields, normalize};
use crate::store::{load_with_timeout, Connector};

/// Where one attempt currently is. Only surfaced through debug logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Fetching,
    Normalizing,
    Loading,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::Normalizing => "normalizing",
            RunState::Loading => "loading",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one invocation, as handed back to the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded {
        task_id: String,
        rows_written: u64,
        attempts: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        task_id: String,
        error_kind: ErrorKind,
        message: String,
        attempts: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        #[serde(skip)]
        error: PipelineError,
    },
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Succeeded { .. })
    }

    pub fn rows_written(&self) -> Option<u64> {
        match self {
            RunResult::Succeeded { rows_written, .. } => Some(*rows_written),
            RunResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            RunResult::Succeeded { .. } => None,
            RunResult::Failed { error, .. } => Some(error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RunResult::Succeeded { attempts, .. } | RunResult::Failed { attempts, .. } => *attempts,
        }
    }
}

/// How often and how far apart whole-sequence attempts are made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(300),
        }
    }
}

/// Fetch → normalize → load for one table, with retries of the whole sequence.
///
/// Holds no state between invocations beyond its configuration and the HTTP
/// client pool; every attempt gets a fresh destination connection from the
/// injected connector.
pub struct TaskRunner {
    task_id: String,
    endpoint: Endpoint,
    fields: Vec<String>,
    table_name: String,
    timeout: Duration,
    retry: RetryPolicy,
    fetcher: Fetcher,
    connector: Arc<dyn Connector>,
}

impl TaskRunner {
    pub fn new(
        task_id: impl Into<String>,
        endpoint: Endpoint,
        table_name: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PipelineError> {
        let fields = expected_fields(&endpoint.fields);
        Ok(Self {
            task_id: task_id.into(),
            fields,
            endpoint,
            table_name: table_name.into(),
            timeout,
            retry,
            fetcher: Fetcher::new(timeout)?,
            connector,
        })
    }

    /// Build a runner from a validated [`Config`] and an injected connector.
    pub fn from_config(config: &Config, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        let retry = RetryPolicy {
            retries: config.retry_count,
            delay: config.retry_delay(),
        };
        Ok(Self::new(
            config.task_id.clone(),
            config.endpoint()?,
            config.table_name.clone(),
            config.timeout(),
            retry,
            connector,
        )?)
    }

    /// Run once, retrying the full sequence up to `retry.retries` times.
    /// The last failure is returned unchanged.
    pub async fn run(&self) -> RunResult {
        let started_at = Utc::now();
        let max_attempts = self.retry.retries.saturating_add(1);
        info!(
            task_id = %self.task_id,
            table = %self.table_name,
            target = %self.connector.describe(),
            "run started"
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let span = info_span!("attempt", task_id = %self.task_id, attempt, of = max_attempts);
            match self.attempt().instrument(span).await {
                Ok(rows_written) => {
                    info!(task_id = %self.task_id, rows_written, attempts = attempt, "run succeeded");
                    return RunResult::Succeeded {
                        task_id: self.task_id.clone(),
                        rows_written,
                        attempts: attempt,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        task_id = %self.task_id,
                        attempt,
                        code = e.code(),
                        error = %e,
                        delay_s = self.retry.delay.as_secs_f64(),
                        "attempt failed, retrying whole sequence"
                    );
                    sleep(self.retry.delay).await;
                }
                Err(e) => {
                    error!(task_id = %self.task_id, attempts = attempt, code = e.code(), error = %e, "run failed");
                    return RunResult::Failed {
                        task_id: self.task_id.clone(),
                        error_kind: e.kind(),
                        message: e.to_string(),
                        attempts: attempt,
                        started_at,
                        finished_at: Utc::now(),
                        error: e,
                    };
                }
            }
        }
    }

    /// One pass through the three stages; the first failure ends it.
    async fn attempt(&self) -> Result<u64, PipelineError> {
        let mut state = RunState::Pending;
        let result = self.stages(&mut state).await;
        let terminal = if result.is_ok() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        debug!(from = %state, to = %terminal, "state");
        result
    }

    async fn stages(&self, state: &mut RunState) -> Result<u64, PipelineError> {
        transition(state, RunState::Fetching);
        let payload = self.fetcher.fetch(&self.endpoint).await?;

        transition(state, RunState::Normalizing);
        let dataset = normalize(&payload, &self.endpoint.granularity, &self.fields)?;
        drop(payload);

        transition(state, RunState::Loading);
        load_with_timeout(
            dataset,
            self.table_name.clone(),
            Arc::clone(&self.connector),
            self.timeout,
        )
        .await
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!(from = %state, to = %next, "state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, TableContents};
    use crate::error::LoadError;
    use crate::store::Destination;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// In-memory store keeping the last replaced table; can fail the first N connects.
    #[derive(Default)]
    struct MemoryStore {
        tables: Arc<Mutex<BTreeMap<String, TableContents>>>,
        connects: AtomicUsize,
        fail_first_connects: usize,
    }

    struct MemoryDestination {
        tables: Arc<Mutex<BTreeMap<String, TableContents>>>,
    }

    impl Destination for MemoryDestination {
        fn replace_table(
            &mut self,
            table: &str,
            dataset: &Dataset,
            _deadline: Instant,
        ) -> Result<u64, LoadError> {
            self.tables
                .lock()
                .unwrap()
                .insert(table.to_string(), dataset.to_contents());
            Ok(dataset.num_rows() as u64)
        }

        fn read_table(&mut self, table: &str) -> Result<Option<TableContents>, LoadError> {
            Ok(self.tables.lock().unwrap().get(table).cloned())
        }
    }

    impl Connector for MemoryStore {
        fn connect(&self) -> Result<Box<dyn Destination>, PipelineError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_connects {
                return Err(PipelineError::connection("store is restarting"));
            }
            Ok(Box::new(MemoryDestination {
                tables: Arc::clone(&self.tables),
            }))
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn endpoint(server: &MockServer) -> Endpoint {
        Endpoint {
            base_url: Url::parse(&format!("{}/v1/forecast", server.uri())).unwrap(),
            latitude: 52.52,
            longitude: 13.41,
            granularity: "hourly".into(),
            fields: vec![
                "temperature_2m".into(),
                "precipitation_probability".into(),
                "rain".into(),
            ],
            extra_params: BTreeMap::new(),
        }
    }

    fn one_row() -> serde_json::Value {
        json!({"hourly": {
            "time": ["2025-01-01T00:00"],
            "temperature_2m": [5.0],
            "precipitation_probability": [10],
            "rain": [0.0]
        }})
    }

    fn runner(server: &MockServer, store: Arc<MemoryStore>, timeout: Duration, retries: u32) -> TaskRunner {
        TaskRunner::new(
            "load_dataframe",
            endpoint(server),
            "new_dag_data",
            timeout,
            RetryPolicy {
                retries,
                delay: Duration::ZERO,
            },
            store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_reports_rows_written() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(one_row()))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let result = runner(&server, store.clone(), Duration::from_secs(5), 1).run().await;

        assert!(result.is_success());
        assert_eq!(result.rows_written(), Some(1));
        assert_eq!(result.attempts(), 1);
        let tables = store.tables.lock().unwrap();
        assert_eq!(tables["new_dag_data"].columns.len(), 4);
    }

    #[tokio::test]
    async fn test_retries_once_after_timeout_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(one_row())
                    .set_delay(Duration::from_secs(3)),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(one_row()))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let result = runner(&server, store, Duration::from_millis(300), 1).run().await;

        assert_eq!(result.attempts(), 2);
        assert_eq!(result.rows_written(), Some(1));
    }

    #[tokio::test]
    async fn test_failure_after_retries_is_returned_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let result = runner(&server, store.clone(), Duration::from_secs(5), 1).run().await;

        assert!(!result.is_success());
        assert_eq!(result.attempts(), 2);
        assert_eq!(
            result.error(),
            Some(&PipelineError::SourceError {
                status: 502,
                message: "bad gateway".into()
            })
        );
        // The store was never reached.
        assert_eq!(store.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_covers_the_whole_sequence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(one_row()))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore {
            fail_first_connects: 1,
            ..Default::default()
        });
        let result = runner(&server, store.clone(), Duration::from_secs(5), 1).run().await;

        // The second attempt fetched again rather than reusing the first payload.
        assert_eq!(result.attempts(), 2);
        assert_eq!(result.rows_written(), Some(1));
        assert_eq!(store.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retries_when_count_is_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hourly": {"time": []}})))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let result = runner(&server, store, Duration::from_secs(5), 0).run().await;
        assert_eq!(result.attempts(), 1);
        assert_eq!(result.error().map(PipelineError::kind), Some(ErrorKind::SchemaMismatch));
    }

    #[tokio::test]
    async fn test_result_serializes_for_scheduler() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let result = runner(&server, store, Duration::from_secs(5), 0).run().await;
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_kind"], "SOURCE_FORMAT_ERROR");
        assert_eq!(value["task_id"], "load_dataframe");
        assert_eq!(value["attempts"], 1);
    }
}
