//! Operator CLI
//!
//! Submits clusterwide patches and inspects instances over their RPC
//! surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clusterconf-ctl")]
#[command(about = "clusterconf operator CLI")]
#[command(version)]
struct Cli {
    /// Instance to talk to (host:port of its RPC listener)
    #[arg(long, default_value = "localhost:8081")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a clusterwide patch
    ///
    /// Top-level keys in the patch replace the current ones; an explicit
    /// null removes a key.
    Patch {
        /// YAML patch file
        #[arg(long)]
        file: PathBuf,
    },

    /// Dump the instance's active config
    Get {
        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show instance health
    Health {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = format!("http://{}", cli.node);

    match cli.command {
        Commands::Patch { file } => {
            let patch = std::fs::read_to_string(&file)?;
            let resp = client
                .post(format!("{}/rpc/patch_clusterwide", base))
                .json(&serde_json::json!({ "patch": patch }))
                .send()
                .await?;
            if resp.status().is_success() {
                println!("Patch committed clusterwide");
            } else {
                let status = resp.status();
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                anyhow::bail!(
                    "patch failed ({}): {}",
                    status,
                    body.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error")
                );
            }
        }

        Commands::Get { output } => {
            let resp = client
                .get(format!("{}/rpc/load_from_file", base))
                .send()
                .await?
                .error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            let config = body
                .get("config")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            match output {
                Some(path) => {
                    std::fs::write(&path, config)?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", config),
            }
        }

        Commands::Health {} => {
            let resp = client
                .get(format!("{}/health", base))
                .send()
                .await?
                .error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
