#![forbid(unsafe_code)]

//! `agent-runtime`: agent runtime execution engine binary.
//!
//! Loads configuration, builds the configured execution driver, and either
//! serves it as a remote runtime over HTTP or runs a single command
//! against it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_runtime::driver::{self, ExecutionDriver, ThreadRef, TurnRequest};
use agent_runtime::server::{self, ServerState};
use agent_runtime::turn::DeltaCallback;
use agent_runtime::{AppError, Result, RuntimeConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-runtime", about = "Agent runtime execution engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the configured driver as a remote runtime over HTTP.
    Serve {
        /// Override `server.http_port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one turn and stream its output to stdout.
    Turn {
        /// Internal thread id.
        #[arg(long, default_value = "cli")]
        thread: String,
        /// Known agent-side thread id to resume.
        #[arg(long)]
        external_thread: Option<String>,
        /// User text.
        text: String,
    },
    /// Print the current account state.
    Account,
    /// Print the driver health snapshot.
    Health,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from_path(path)?,
        None => RuntimeConfig::default(),
    };
    config.load_credentials().await?;
    info!(mode = config.driver.mode.as_str(), "configuration loaded");

    let driver = driver::from_config(&config);

    match args.command {
        Command::Serve { port } => {
            let port = port.unwrap_or(config.server.http_port);
            serve(driver, port, config.server.buffer_capacity).await
        }
        Command::Turn {
            thread,
            external_thread,
            text,
        } => {
            let mut thread = ThreadRef::new(thread);
            thread.external_thread_id = external_thread;
            run_turn(driver.as_ref(), thread, text).await
        }
        Command::Account => print_json(&driver.read_account().await?),
        Command::Health => print_json(&driver.health().await),
    }
}

async fn serve(driver: Arc<dyn ExecutionDriver>, port: u16, buffer_capacity: usize) -> Result<()> {
    let state = Arc::new(ServerState::new(driver, buffer_capacity));
    let ct = CancellationToken::new();

    let server_ct = ct.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(state, port, server_ct).await {
            error!(%err, "http surface failed");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = server_handle.await;
    info!("agent-runtime shut down");
    Ok(())
}

async fn run_turn(driver: &dyn ExecutionDriver, thread: ThreadRef, text: String) -> Result<()> {
    let session = driver.bootstrap_session(&thread).await?;
    info!(external_thread_id = ?session.external_thread_id, "session ready");

    let on_delta: DeltaCallback = Arc::new(|chunk: &str| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    });
    let outcome = driver
        .run_turn(TurnRequest {
            thread: ThreadRef {
                thread_id: session.thread_id,
                external_thread_id: session.external_thread_id,
            },
            turn_id: uuid::Uuid::new_v4().to_string(),
            text,
            on_delta: Some(on_delta),
        })
        .await?;

    println!();
    info!(status = %outcome.status, error = ?outcome.error, "turn finished");
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
