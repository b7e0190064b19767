//! # rdao
//!
//! Reactive-dao command line: hosts the demo DAO over WebSocket and issues
//! one-shot requests against a running server.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rdao_client::{ReactiveConnection, WsConnector};
use rdao_core::Path;
use rdao_server::{ReactiveServer, serve, shared_dao};
use rdao_settings::RdaoSettings;
use serde_json::Value;
use tracing::info;

use crate::demo::Demo;

/// Request timeout used by one-shot commands when settings leave it unset.
const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Reactive-dao server and client.
#[derive(Parser, Debug)]
#[command(name = "rdao", version, about = "Reactive-dao demo server and command-line client")]
struct Cli {
    /// Settings file (defaults to `~/.rdao/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo DAO over WebSocket until interrupted.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Invoke a remote method and print its result.
    Call {
        /// Method path as JSON, e.g. `'["demo","increment"]'`.
        method: String,
        /// Arguments, each as JSON.
        args: Vec<String>,
        #[command(flatten)]
        target: Target,
    },
    /// Fetch a value and print it.
    Get {
        /// Path as JSON, e.g. `'["demo","counter"]'`.
        what: String,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Server URL (defaults to the configured host, port and path).
    #[arg(long)]
    url: Option<String>,
}

fn load_settings(cli: &Cli) -> Result<RdaoSettings> {
    let path = cli.settings.clone().unwrap_or_else(rdao_settings::settings_path);
    rdao_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

fn init_logging(cli: &Cli, settings: &RdaoSettings) {
    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    if cli.json_logs || settings.logging.json {
        rdao_logging::init_json_subscriber(level);
    } else {
        rdao_logging::init_subscriber(level);
    }
}

fn parse_json(label: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("{label} is not valid JSON: {text}"))
}

fn parse_path(label: &str, text: &str) -> Result<Path> {
    let value = parse_json(label, text)?;
    if !value.is_array() && !value.is_object() {
        bail!("{label} must be a JSON array or object, got {value}");
    }
    Ok(Path::new(value))
}

async fn run_server(mut settings: RdaoSettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    let demo = Demo::new();
    let clock = demo.start_clock();
    let server = Arc::new(ReactiveServer::with_settings(shared_dao(demo.dao()), settings.server));
    let handle = serve(server).await.context("failed to start server")?;
    info!(url = %handle.url(), "demo server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    handle.stop().await;
    clock.abort();
    Ok(())
}

fn connect(settings: &RdaoSettings, target: &Target) -> ReactiveConnection {
    let connector = match &target.url {
        Some(url) => WsConnector::new(url.clone()),
        None => WsConnector::from_settings(&settings.server),
    };
    let mut client = settings.client.clone();
    if client.request_timeout_ms.is_none() {
        client.request_timeout_ms = Some(DEFAULT_CALL_TIMEOUT_MS);
    }
    ReactiveConnection::new(Arc::new(connector), Value::Object(serde_json::Map::new()), client)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&cli, &settings);

    match cli.command {
        Command::Serve { host, port } => run_server(settings, host, port).await,
        Command::Call { method, args, target } => {
            let method = parse_path("method", &method)?;
            let args = args
                .iter()
                .enumerate()
                .map(|(i, arg)| parse_json(&format!("argument {i}"), arg))
                .collect::<Result<Vec<_>>>()?;
            let connection = connect(&settings, &target);
            let outcome = connection.request(method, args).await;
            connection.dispose();
            print_json(&outcome.context("request failed")?)
        }
        Command::Get { what, target } => {
            let what = parse_path("path", &what)?;
            let connection = connect(&settings, &target);
            let outcome = connection.get(what).await;
            connection.dispose();
            print_json(&outcome.context("get failed")?)
        }
    }
}
