//! Node binary
//!
//! Starts one clusterconf instance: boots the config from the local disk, a
//! bootstrap file, or a configured peer, then serves the RPC surface.

use clap::{Parser, Subcommand};
use clusterconf::cluster::membership::{Member, MemberPayload, MemberStatus, MembershipState};
use clusterconf::cluster::runtime::LocalRuntime;
use clusterconf::cluster::{fetch_from_membership, RoleRegistry};
use clusterconf::common::InstanceSettings;
use clusterconf::config::store;
use clusterconf::rpc::{AppState, HttpPool};
use clusterconf::{Applier, Membership};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "clusterconf-node")]
#[command(about = "clusterconf instance with clusterwide 2PC config")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an instance
    Serve {
        /// Instance UUID
        #[arg(long)]
        uuid: Uuid,

        /// Human-readable alias
        #[arg(long)]
        alias: Option<String>,

        /// URI peers reach this instance at
        #[arg(long)]
        advertise: String,

        /// Bind address for the RPC listener
        #[arg(long, default_value = "0.0.0.0:8081")]
        listen: SocketAddr,

        /// Working directory for the config file set
        #[arg(long, default_value = "./data")]
        workdir: PathBuf,

        /// Peer URIs (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Config file to bootstrap a brand-new cluster from
        #[arg(long)]
        bootstrap: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            uuid,
            alias,
            advertise,
            listen,
            workdir,
            peers,
            bootstrap,
        } => {
            std::fs::create_dir_all(&workdir)?;

            let mut settings = InstanceSettings::new(uuid, advertise.clone(), workdir);
            settings.alias = alias;
            settings.http_listen = listen;
            settings.validate()?;

            tracing::info!("Starting instance {} ({})", uuid, advertise);
            tracing::info!("  RPC listener: {}", settings.http_listen);
            tracing::info!("  Workdir: {}", settings.workdir.display());

            let state = MembershipState::new();
            let membership = state.handle(advertise.clone());
            membership.set_payload("uuid", Some(serde_json::json!(uuid.to_string())));

            let applier = Applier::new(
                settings.clone(),
                Arc::new(RoleRegistry::new()),
                membership,
                Arc::new(HttpPool::new()),
                Arc::new(LocalRuntime::new()),
            );

            // Stand-in for the gossip transport: poll the configured peers'
            // health endpoints into the membership table.
            spawn_peer_refresh(state.clone(), peers);
            spawn_bootstrap(applier.clone(), bootstrap);

            let listener = tokio::net::TcpListener::bind(settings.http_listen).await?;
            tracing::info!("Instance ready");
            clusterconf::rpc::serve(AppState { applier }, listener).await?;
        }
    }

    Ok(())
}

/// Poll peer health endpoints into the membership table.
fn spawn_peer_refresh(state: Arc<MembershipState>, peers: Vec<String>) {
    if peers.is_empty() {
        return;
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .expect("reqwest client");

    tokio::spawn(async move {
        loop {
            for uri in &peers {
                let member = match probe_peer(&client, uri).await {
                    Some(member) => member,
                    None => Member {
                        uri: uri.clone(),
                        status: MemberStatus::Dead,
                        payload: MemberPayload::default(),
                    },
                };
                state.upsert(member);
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    });
}

async fn probe_peer(client: &reqwest::Client, uri: &str) -> Option<Member> {
    let resp = client
        .get(format!("http://{}/health", uri))
        .send()
        .await
        .ok()?;
    let body: serde_json::Value = resp.json().await.ok()?;
    Some(Member {
        uri: uri.to_string(),
        status: MemberStatus::Alive,
        payload: MemberPayload {
            uuid: body.get("uuid").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
            error: None,
            ready: body.get("ready").and_then(|v| v.as_bool()).unwrap_or(false),
        },
    })
}

/// Converge on a config: local disk, bootstrap file, or a configured peer.
fn spawn_bootstrap(applier: Arc<Applier>, bootstrap: Option<PathBuf>) {
    tokio::spawn(async move {
        let active = applier.settings().active_path();

        let doc = if active.exists() {
            tracing::info!("Loading config from {}", active.display());
            store::load(&active)
        } else if let Some(path) = bootstrap {
            tracing::info!("Bootstrapping cluster from {}", path.display());
            store::load(&path)
        } else {
            loop {
                match fetch_from_membership(&applier, None).await {
                    Ok(Some(doc)) => break Ok(doc),
                    Ok(None) => {
                        tracing::info!("No configured peer yet, retrying");
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Fetching config failed: {}, retrying", e);
                    }
                    Err(e) => break Err(e),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };

        let result = match doc {
            Ok(doc) => applier.validate_and_apply(doc).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!("Instance converged on the clusterwide config"),
            Err(e) => tracing::error!("Bootstrap failed: {}", e),
        }
    });
}
