//! fleet-probe - run a Gateway call against every configured instance
//!
//! Usage: `fleet-probe [--instances <path>] <health|status|config|watch>`
//!
//! Instances are read from the JSON file given by `--instances` or
//! `FLEET_INSTANCES` (default `.fleet-data/instances.json`).

mod instances;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use gateway_client::{ClientEvent, GatewayClient, GatewayManager};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::instances::{load_instances, InstanceConfig};

#[derive(Parser, Debug)]
#[command(name = "fleet-probe")]
#[command(about = "Run a Gateway call against every configured instance")]
#[command(version)]
struct Cli {
    /// JSON file listing the instances to reach
    #[arg(long, env = "FLEET_INSTANCES", default_value = ".fleet-data/instances.json")]
    instances: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Query each Gateway's health
    Health,
    /// Query each Gateway's status
    Status,
    /// Fetch each Gateway's configuration
    Config,
    /// Stream pushed events until Ctrl-C
    Watch,
}

impl Command {
    fn name(self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Status => "status",
            Self::Config => "config",
            Self::Watch => "watch",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_probe=info,gateway_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Using instance file: {:?}", cli.instances);

    let instances = load_instances(&cli.instances)
        .await
        .with_context(|| format!("loading {}", cli.instances.display()))?;
    if instances.is_empty() {
        tracing::warn!("No instances configured");
        return Ok(());
    }

    let manager = GatewayManager::new();
    let outcome = match cli.command {
        Command::Watch => watch(&manager, &instances).await,
        call => {
            call_all(&manager, &instances, call).await;
            Ok(())
        }
    };
    manager.disconnect_all().await;
    outcome
}

/// Print one JSON document per instance
async fn call_all(manager: &GatewayManager, instances: &[InstanceConfig], command: Command) {
    let results = join_all(instances.iter().map(|instance| async move {
        let outcome = match manager
            .get_client(&instance.instance_id, instance.gateway.clone(), vec![])
            .await
        {
            Ok(client) => call(&client, command).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(result) => json!({"instanceId": instance.instance_id, "ok": true, "result": result}),
            Err(err) => {
                tracing::warn!("{} failed on {}: {}", command.name(), instance.instance_id, err);
                json!({"instanceId": instance.instance_id, "ok": false, "error": err.to_string()})
            }
        }
    }))
    .await;

    for result in results {
        println!("{}", result);
    }
}

async fn call(client: &GatewayClient, command: Command) -> gateway_client::Result<Value> {
    match command {
        Command::Health => client.health().await,
        Command::Status => client.status().await,
        Command::Config => client.config_get().await,
        Command::Watch => Ok(Value::Null),
    }
}

/// Stream pushed events from every instance until Ctrl-C
async fn watch(manager: &GatewayManager, instances: &[InstanceConfig]) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    for instance in instances {
        let client = match manager
            .get_client(&instance.instance_id, instance.gateway.clone(), vec![])
            .await
        {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!("Skipping {}: {}", instance.instance_id, err);
                continue;
            }
        };
        let mut events = client.subscribe();
        let tx = tx.clone();
        let instance_id = instance.instance_id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(line) = render(&instance_id, event) {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("{} dropped {} events", instance_id, missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    drop(tx);

    if manager.get_connected_instances().await.is_empty() {
        bail!("no instance could be reached");
    }

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                tracing::info!("Stopping watch");
                break;
            }
        }
    }
    Ok(())
}

/// Pushed events become output lines; lifecycle notifications are logged
fn render(instance_id: &str, event: ClientEvent) -> Option<Value> {
    match event {
        ClientEvent::AgentOutput(event)
        | ClientEvent::Presence(event)
        | ClientEvent::Keepalive(event)
        | ClientEvent::Shutdown(event) => Some(json!({
            "instanceId": instance_id,
            "type": event.event_type,
            "payload": event.payload,
        })),
        ClientEvent::Connected(result) => {
            tracing::info!(state_version = result.state_version, "{} connected", instance_id);
            None
        }
        ClientEvent::Disconnected { intentional } => {
            if !intentional {
                tracing::warn!("{} disconnected", instance_id);
            }
            None
        }
        ClientEvent::Reconnecting { attempt, delay } => {
            tracing::info!("{} reconnecting (attempt {}, in {:?})", instance_id, attempt, delay);
            None
        }
        ClientEvent::Error(err) => {
            tracing::error!("{}: {}", instance_id, err);
            None
        }
    }
}
