// src/config.rs

use anyhow::{bail, Context, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};
use url::Url;

use crate::fetch::Endpoint;
use crate::normalize::TIME_FIELD;

pub const DEFAULT_CONFIG_FILE: &str = "etlweather.yaml";
pub const CONFIG_ENV: &str = "ETLWEATHER_CONFIG";
/// Prefix of the environment variables that resolve connection references,
/// e.g. `ETLWEATHER_CONN_DUCKDB_DEFAULT`.
pub const CONNECTION_ENV_PREFIX: &str = "ETLWEATHER_CONN_";

static DEFAULT_ENDPOINT: &str = "https://api.open-meteo.com/v1/forecast";
static DEFAULT_FIELDS: &[&str] = &["temperature_2m", "precipitation_probability", "rain"];
static DEFAULT_CONNECTION_REF: &str = "duckdb_default";
static DEFAULT_CONNECTION_URI: &str = "duckdb:etlweather.duckdb";

/// Everything one run needs, as read from `etlweather.yaml`.
///
/// Every field has a default, so an empty document is a valid config that
/// reproduces the Berlin hourly forecast job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub task_id: String,
    pub endpoint_url: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Key of the series container in the response, also the query parameter
    /// carrying the field list.
    pub granularity: String,
    pub requested_fields: Vec<String>,
    /// Additional query parameters appended after the location and fields.
    pub extra_params: BTreeMap<String, String>,
    pub table_name: String,
    pub connection_ref: String,
    /// Fallback connection URIs by reference, consulted after the environment.
    pub connections: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_id: "load_dataframe".to_string(),
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            latitude: 52.52,
            longitude: 13.41,
            granularity: "hourly".to_string(),
            requested_fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            extra_params: BTreeMap::new(),
            table_name: "new_dag_data".to_string(),
            connection_ref: DEFAULT_CONNECTION_REF.to_string(),
            connections: BTreeMap::new(),
            timeout_seconds: 30,
            retry_count: 1,
            retry_delay_seconds: 300,
        }
    }
}

/// A resolved destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionSpec {
    DuckDb { path: PathBuf },
    Parquet { dir: PathBuf },
}

impl ConnectionSpec {
    /// Parse `duckdb:<path>`, `duckdb:///abs/path`, `parquet:<dir>` or `parquet:///abs/dir`.
    ///
    /// Stores are local, so a URI naming a host is rejected. The path is
    /// percent-decoded back to the file name the operator wrote.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("parsing connection URI `{}`", uri))?;
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            bail!(
                "connection URI `{}` names host `{}`; only local paths are supported",
                uri,
                host
            );
        }
        let path = percent_decode_str(url.path())
            .decode_utf8()
            .with_context(|| format!("connection URI `{}` has a non UTF-8 path", uri))?;
        if path.is_empty() {
            bail!("connection URI `{}` has no path", uri);
        }
        let path = PathBuf::from(path.as_ref());
        match url.scheme() {
            "duckdb" => Ok(ConnectionSpec::DuckDb { path }),
            "parquet" => Ok(ConnectionSpec::Parquet { dir: path }),
            other => bail!("unsupported connection scheme `{}` in `{}`", other, uri),
        }
    }
}

impl Config {
    /// Load from an explicit path, `ETLWEATHER_CONFIG`, or `./etlweather.yaml`.
    /// Falls back to defaults only when no file was asked for and none exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let requested = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let config = match requested {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.is_file() {
                    Self::from_file(path)?
                } else {
                    info!("no {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_yaml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // serde_yaml maps an empty document to unit, not to an empty mapping.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint_url)
            .with_context(|| format!("endpoint_url `{}` is not a URL", self.endpoint_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("endpoint_url must be http(s), got `{}`", url.scheme());
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            bail!("latitude {} out of range", self.latitude);
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            bail!("longitude {} out of range", self.longitude);
        }
        if self.granularity.trim().is_empty() {
            bail!("granularity must not be empty");
        }
        if self.requested_fields.is_empty() {
            bail!("requested_fields must name at least one field");
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.requested_fields {
            if field.trim().is_empty() {
                bail!("requested_fields contains an empty name");
            }
            if field == TIME_FIELD {
                bail!("`{}` is always selected; do not list it", TIME_FIELD);
            }
            if !seen.insert(field.as_str()) {
                bail!("requested field `{}` listed twice", field);
            }
        }
        if !is_identifier(&self.table_name) {
            bail!(
                "table_name `{}` must match [A-Za-z_][A-Za-z0-9_]*",
                self.table_name
            );
        }
        if self.timeout_seconds == 0 {
            bail!("timeout_seconds must be positive");
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        let base = Url::parse(&self.endpoint_url)
            .with_context(|| format!("parsing endpoint_url `{}`", self.endpoint_url))?;
        Ok(Endpoint {
            base_url: base,
            latitude: self.latitude,
            longitude: self.longitude,
            granularity: self.granularity.clone(),
            fields: self.requested_fields.clone(),
            extra_params: self.extra_params.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Resolve `connection_ref` against the process environment.
    pub fn resolve_connection(&self) -> Result<ConnectionSpec> {
        self.resolve_connection_with(|key| env::var(key).ok())
    }

    /// Resolution order: `ETLWEATHER_CONN_<REF>`, the `connections` map, then
    /// the built-in `duckdb_default`.
    pub fn resolve_connection_with<F>(&self, lookup: F) -> Result<ConnectionSpec>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = connection_env_key(&self.connection_ref);
        let uri = if let Some(uri) = lookup(&key) {
            debug!(connection_ref = %self.connection_ref, source = "env", "resolved connection");
            uri
        } else if let Some(uri) = self.connections.get(&self.connection_ref) {
            debug!(connection_ref = %self.connection_ref, source = "config", "resolved connection");
            uri.clone()
        } else if self.connection_ref == DEFAULT_CONNECTION_REF {
            DEFAULT_CONNECTION_URI.to_string()
        } else {
            bail!(
                "connection `{}` is not defined (set {} or add it under `connections`)",
                self.connection_ref,
                key
            );
        };
        ConnectionSpec::parse(&uri)
            .with_context(|| format!("resolving connection `{}`", self.connection_ref))
    }
}

fn connection_env_key(reference: &str) -> String {
    let suffix: String = reference
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", CONNECTION_ENV_PREFIX, suffix)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
