use anyhow::{Context, Result};
use etlweather::{config::Config, store, TaskRunner};
use std::{env, path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// One scheduled invocation: the scheduler runs this binary, reads the JSON
/// result line from stdout and the exit status.
#[tokio::main]
async fn main() -> ExitCode {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    // ─── 2) configure ────────────────────────────────────────────────
    let runner = match build_runner() {
        Ok(r) => r,
        Err(e) => {
            error!("invalid configuration: {:#}", e);
            return ExitCode::from(2);
        }
    };

    // ─── 3) run once ─────────────────────────────────────────────────
    let result = runner.run().await;
    match serde_json::to_string(&result) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("serializing run result: {}", e),
    }

    if result.is_success() {
        info!("all done");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn build_runner() -> Result<TaskRunner> {
    let explicit = env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(explicit.as_deref())?;
    let spec = config
        .resolve_connection()
        .context("resolving destination connection")?;
    info!(task_id = %config.task_id, table = %config.table_name, ?spec, "configured");
    TaskRunner::from_config(&config, store::connector_for(&spec))
}
