//! Instance settings for clusterconf nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Active configuration file, relative to the workdir.
pub const ACTIVE_CONFIG_FILE: &str = "config.yml";
/// Proposed configuration written during the prepare phase of 2PC.
/// Doubles as the cluster-visible lock for a round.
pub const PREPARE_CONFIG_FILE: &str = "config.prepare.yml";
/// Previous active configuration, hard-linked on each commit.
pub const BACKUP_CONFIG_FILE: &str = "config.backup.yml";

/// Per-instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Instance UUID (stable identity within the topology)
    pub instance_uuid: Uuid,

    /// Human-readable alias, shown in sharding maps and logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// URI this instance is reachable at by peers
    pub advertise_uri: String,

    /// Working directory holding the config file set
    pub workdir: PathBuf,

    /// Bind address for the RPC/HTTP listener
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,

    /// Client-side timeout for the prepare phase of 2PC
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_ms: u64,
}

fn default_http_listen() -> SocketAddr {
    "0.0.0.0:8081".parse().unwrap()
}

fn default_prepare_timeout() -> u64 {
    5_000
}

impl InstanceSettings {
    /// Settings with defaults for everything but identity and placement.
    pub fn new(instance_uuid: Uuid, advertise_uri: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            instance_uuid,
            alias: None,
            advertise_uri: advertise_uri.into(),
            workdir: workdir.into(),
            http_listen: default_http_listen(),
            prepare_timeout_ms: default_prepare_timeout(),
        }
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: InstanceSettings = serde_yaml::from_str(&content)
            .map_err(|e| crate::Error::ConfigLoad(format!("failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.advertise_uri.is_empty() {
            return Err(crate::Error::ConfigLoad("advertise_uri is required".into()));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(crate::Error::ConfigLoad("workdir is required".into()));
        }
        Ok(())
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn active_path(&self) -> PathBuf {
        self.workdir.join(ACTIVE_CONFIG_FILE)
    }

    pub fn prepare_path(&self) -> PathBuf {
        self.workdir.join(PREPARE_CONFIG_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.workdir.join(BACKUP_CONFIG_FILE)
    }
}
