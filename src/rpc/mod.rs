//! Peer RPC surface
//!
//! JSON envelopes over HTTP; the config document itself travels as YAML
//! text so every peer persists the exact same bytes.

pub mod pool;
pub mod server;

use serde::{Deserialize, Serialize};

/// Envelope carrying a config document as YAML text
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBody {
    pub config: String,
}

/// Envelope carrying a clusterwide patch as YAML text
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchBody {
    pub patch: String,
}

/// Positive RPC reply
#[derive(Debug, Serialize, Deserialize)]
pub struct OkBody {
    pub ok: bool,
}

/// Negative RPC reply, carrying the error kind for reconstruction
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub use pool::{Connection, HttpPool, LoopbackPool, Pool};
pub use server::{create_router, serve, AppState};
