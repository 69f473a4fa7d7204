//! Tether command line client
//!
//! ## Usage
//!
//! ```bash
//! # One request, printed as JSON
//! tether --endpoint ws://localhost:5010/ send echo '{"x":1}'
//!
//! # Stay connected and log state transitions
//! tether watch
//!
//! # Switch identity, then send
//! tether login dingtaxi 42 profile/get
//!
//! # Write the default config file
//! tether init
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tether::config::default_config_path;
use tether::{Client, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Persistent request/response client over WebSocket")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint prefix; `<platform>_<token>` is appended
    #[arg(long, env = "TETHER_ENDPOINT")]
    endpoint: Option<String>,

    /// Platform identifier
    #[arg(long, env = "TETHER_PLATFORM")]
    platform: Option<String>,

    /// Credential token
    #[arg(long, env = "TETHER_TOKEN")]
    token: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the result
    Send {
        path: String,
        /// JSON payload (defaults to `{}`)
        payload: Option<String>,
    },
    /// Stay connected and log every state transition until Ctrl-C
    Watch,
    /// Log in as another identity, optionally sending a request afterwards
    Login {
        platform: String,
        token: String,
        path: Option<String>,
        payload: Option<String>,
    },
    /// Write the default config file
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tether=info".parse()?))
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(platform) = args.platform {
        config.platform = platform;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    config.validate()?;

    match args.command {
        Command::Init => {
            if config_path.exists() {
                bail!("{} already exists", config_path.display());
            }
            config.save(&config_path)?;
            info!(path = %config_path.display(), "Created default config");
        }
        Command::Send { path, payload } => {
            let client = Client::connect(config.client_config());
            client.wait_ready().await?;
            let result = client.send(&path, parse_payload(payload)?).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            client.close();
        }
        Command::Watch => {
            let client = Client::connect(config.client_config());
            let mut states = client.subscribe_state();
            info!(url = %client.endpoint_url(), "Watching connection");
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        changed?;
                        let state = *states.borrow_and_update();
                        info!(state = %state, "State");
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            client.close();
        }
        Command::Login {
            platform,
            token,
            path,
            payload,
        } => {
            let client = Client::connect(config.client_config());
            client.wait_ready().await?;
            client
                .login(platform, token)
                .await
                .context("login did not complete")?;
            info!(url = %client.endpoint_url(), "Logged in");
            if let Some(path) = path {
                let result = client.send(&path, parse_payload(payload)?).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            client.close();
        }
    }

    Ok(())
}

fn parse_payload(raw: Option<String>) -> anyhow::Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}
