use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use toolrelay_core::agent::{ConversationDriver, DriverOptions};
use toolrelay_core::bridge::{AsyncBridge, BlockingToolClient, BridgeError, ClientError};
use toolrelay_core::config::{ConfigError, EndpointParseError};
use toolrelay_core::jobs::{JobError, JobStatus, JobStatusResponse, JobSupervisor};
use toolrelay_core::model::OpenAIClient;
use toolrelay_core::pipeline::{TaskStore, VerificationStep};
use toolrelay_core::tooling::ConnectionRegistry;
use toolrelay_core::{AppConfig, EndpointSpec};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(
    name = "toolrelay",
    version,
    about = "Multi-provider tool-calling runtime"
)]
struct Cli {
    /// Configuration file (defaults to config/relay.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to every endpoint and print the merged tool catalog
    Catalog {
        /// Extra endpoint specs (`path[:a1,a2][^K=v]`) added to the configured ones
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,
    },
    /// Run every unverified task of a JSON-lines file through the model
    Verify {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Run a shell command as a tracked job and print its final status
    Job {
        command: String,
        #[arg(long, default_value = "shell")]
        kind: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid --endpoint value: {0}")]
    Endpoint(#[from] EndpointParseError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("job finished with status {0}")]
    JobFailed(JobStatus),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    debug!(command = ?cli.command, config = ?cli.config, "CLI arguments parsed");

    let result = match cli.command {
        Command::Catalog { endpoints } => catalog(cli.config.as_deref(), &endpoints),
        Command::Verify { input, output } => verify(cli.config.as_deref(), input, output),
        Command::Job { command, kind } => shell_job(&command, &kind),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn catalog(config_path: Option<&Path>, extra: &[String]) -> Result<(), CliError> {
    let config = AppConfig::load(config_path)?;
    let mut specs = config.endpoints.clone();
    for raw in extra {
        specs.push(EndpointSpec::parse(raw)?);
    }

    let bridge = AsyncBridge::start()?;
    let client = connect_client(&bridge, &config);
    let result = client.connect(specs);
    let summary = client.close_all();
    bridge.teardown(TEARDOWN_TIMEOUT);

    let catalog = result?;
    if let Ok(summary) = summary {
        debug!(closed = summary.closed, "provider sessions closed");
    }
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}

fn verify(config_path: Option<&Path>, input: PathBuf, output: PathBuf) -> Result<(), CliError> {
    let config = AppConfig::load(config_path)?;
    let bridge = AsyncBridge::start()?;
    let client = connect_client(&bridge, &config);

    let outcome = run_verification(&config, client.clone(), input, output);
    if let Err(err) = client.close_all() {
        warn!(%err, "failed to close provider sessions");
    }
    bridge.teardown(TEARDOWN_TIMEOUT);
    outcome
}

fn run_verification(
    config: &AppConfig,
    client: BlockingToolClient,
    input: PathBuf,
    output: PathBuf,
) -> Result<(), CliError> {
    let catalog = client.connect(config.endpoints.clone())?;
    info!(
        endpoints = catalog.endpoints.len(),
        tools = catalog.tools.len(),
        "providers connected"
    );

    let driver = Arc::new(ConversationDriver::new(
        OpenAIClient::from_config(&config.provider),
        DriverOptions::from(config),
    ));
    let step = VerificationStep::new(client, driver);

    let supervisor = JobSupervisor::new();
    let id = supervisor.create_job("verify", format!("Verify {}", input.display()), None);
    supervisor.run_with(id, move |ctx| {
        let report = step
            .run(&TaskStore::new(input), &TaskStore::new(output), Some(ctx))
            .map_err(|err| err.to_string())?;
        ctx.set_metadata(
            "report",
            serde_json::to_value(&report).map_err(|err| err.to_string())?,
        );
        Ok(())
    })?;

    let snapshot = loop {
        if let Some(snapshot) = supervisor.wait(id, POLL_INTERVAL) {
            if snapshot.status.is_finished() {
                break snapshot;
            }
            debug!(progress = snapshot.progress_percent, "verification running");
        } else {
            return Err(JobError::NotFound { id }.into());
        }
    };

    let report = snapshot.metadata.get("report").cloned();
    let status = snapshot.status;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "job": JobStatusResponse::from(snapshot),
            "report": report,
        }))?
    );
    match status {
        JobStatus::Completed => Ok(()),
        other => Err(CliError::JobFailed(other)),
    }
}

fn shell_job(command: &str, kind: &str) -> Result<(), CliError> {
    let supervisor = JobSupervisor::new();
    let id = supervisor.create_job(kind, command, None);
    supervisor.run_async(id, command)?;

    let snapshot = loop {
        match supervisor.wait(id, POLL_INTERVAL) {
            Some(snapshot) if snapshot.status.is_finished() => break snapshot,
            Some(_) => continue,
            None => return Err(JobError::NotFound { id }.into()),
        }
    };

    let status = snapshot.status;
    println!(
        "{}",
        serde_json::to_string_pretty(&JobStatusResponse::from(snapshot))?
    );
    match status {
        JobStatus::Completed => Ok(()),
        other => Err(CliError::JobFailed(other)),
    }
}

fn connect_client(bridge: &AsyncBridge, config: &AppConfig) -> BlockingToolClient {
    let registry = ConnectionRegistry::with_default_connector(config.project_root.clone())
        .with_call_timeout(config.tool_call_timeout);
    BlockingToolClient::new(bridge.handle(), Arc::new(registry))
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
    });
}
