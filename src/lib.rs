//! # clusterconf
//!
//! A clusterwide configuration applier for replicaset clusters:
//! - YAML config with external-file inlining and an atomic on-disk file set
//! - Two-phase commit across every live instance (prepare / commit / abort)
//! - Local apply pipeline: replication, sharding services, pluggable roles
//! - Automatic master failover driven by membership events
//! - HTTP RPC between instances, one stable endpoint per wire operation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  patch_clusterwide (any instance)            │
//! │   validate → prepare on all → commit on all  │
//! └───────┬───────────────┬──────────────────────┘
//!         │ RPC           │ RPC
//!   ┌─────▼──────┐  ┌─────▼──────┐
//!   │ Instance A │  │ Instance B │   prepare: config.prepare.yml (EXCL)
//!   │  applier   │  │  applier   │   commit:  rename → config.yml,
//!   │  worker    │  │  worker    │           run local apply pipeline
//!   └────────────┘  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! clusterconf-node serve \
//!   --uuid aaaaaaaa-aaaa-4000-b000-000000000001 \
//!   --advertise localhost:3301 \
//!   --listen 0.0.0.0:8081 \
//!   --workdir ./node-a \
//!   --peers localhost:3302,localhost:3303
//! ```
//!
//! ### Patch the cluster
//! ```bash
//! clusterconf-ctl patch --node localhost:8081 --file ./patch.yml
//! clusterconf-ctl get --node localhost:8081
//! clusterconf-ctl health --node localhost:8081
//! ```

pub mod cluster;
pub mod common;
pub mod config;
pub mod rpc;

// Re-export commonly used types
pub use cluster::{Applier, Membership, Role, RoleRegistry};
pub use common::{Error, InstanceSettings, Result};
pub use config::{ClusterConfig, ConfigView};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
