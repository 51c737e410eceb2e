//! Connection pool for peer RPC
//!
//! The coordinator and the peer fetcher reach other instances through the
//! [`Pool`] contract. [`HttpPool`] is the wire implementation; [`LoopbackPool`]
//! routes calls to in-process instances and records every contact, which is
//! what the multi-instance test suites run on.

use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::cluster::applier::Applier;
use crate::common::{Error, Result};
use crate::config::store;
use crate::rpc::{ConfigBody, ErrorBody};

/// Returns RPC channels to peer URIs.
#[async_trait]
pub trait Pool: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>>;
}

/// One peer's RPC surface. Endpoint names are part of the wire contract.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn load_from_file(&self) -> Result<Value>;
    async fn prepare_2pc(&self, conf: &Value) -> Result<()>;
    async fn commit_2pc(&self) -> Result<()>;
    async fn abort_2pc(&self) -> Result<()>;
    async fn validate_config(&self, conf: &Value) -> Result<()>;
    async fn apply_config(&self, conf: &Value) -> Result<()>;
}

// === HTTP implementation ===

/// Pool handing out HTTP connections to peer URIs.
pub struct HttpPool {
    client: reqwest::Client,
}

impl Default for HttpPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPool {
    pub fn new() -> Self {
        // No global timeout: commit and abort must run to completion, the
        // prepare phase is bounded by the coordinator instead.
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Pool for HttpPool {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>> {
        let base = if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("http://{}", uri)
        };
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            base,
        }))
    }
}

struct HttpConnection {
    client: reqwest::Client,
    base: String,
}

fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_connect() {
        Error::ConnectionFailed(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

async fn decode_unit(resp: reqwest::Response) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(Error::from_wire(&body.kind, body.error)),
        Err(_) => Err(Error::Http(format!("peer replied with status {}", status))),
    }
}

impl HttpConnection {
    async fn post_config(&self, endpoint: &str, conf: &Value) -> Result<()> {
        let body = ConfigBody {
            config: store::to_yaml_string(conf)?,
        };
        let resp = self
            .client
            .post(format!("{}/rpc/{}", self.base, endpoint))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode_unit(resp).await
    }

    async fn post_empty(&self, endpoint: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/rpc/{}", self.base, endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_reqwest)?;
        decode_unit(resp).await
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn load_from_file(&self) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}/rpc/load_from_file", self.base))
            .send()
            .await
            .map_err(map_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return match resp.json::<ErrorBody>().await {
                Ok(body) => Err(Error::from_wire(&body.kind, body.error)),
                Err(_) => Err(Error::Http(format!("peer replied with status {}", status))),
            };
        }
        let body: ConfigBody = resp.json().await.map_err(map_reqwest)?;
        serde_yaml::from_str(&body.config)
            .map_err(|e| Error::ConfigFetch(format!("peer sent unparseable config: {}", e)))
    }

    async fn prepare_2pc(&self, conf: &Value) -> Result<()> {
        self.post_config("prepare_2pc", conf).await
    }

    async fn commit_2pc(&self) -> Result<()> {
        self.post_empty("commit_2pc").await
    }

    async fn abort_2pc(&self) -> Result<()> {
        self.post_empty("abort_2pc").await
    }

    async fn validate_config(&self, conf: &Value) -> Result<()> {
        self.post_config("validate_config", conf).await
    }

    async fn apply_config(&self, conf: &Value) -> Result<()> {
        self.post_config("apply_config", conf).await
    }
}

// === In-process implementation ===

/// Pool routing RPC to in-process [`Applier`] instances.
///
/// Records every contact so tests can assert which peers were reached;
/// instances can be marked down to simulate an unreachable peer.
#[derive(Default)]
pub struct LoopbackPool {
    instances: Mutex<BTreeMap<String, Arc<Applier>>>,
    down: Mutex<BTreeSet<String>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl LoopbackPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, uri: impl Into<String>, applier: Arc<Applier>) {
        self.instances.lock().unwrap().insert(uri.into(), applier);
    }

    pub fn set_down(&self, uri: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(uri.to_string());
        } else {
            set.remove(uri);
        }
    }

    /// Every `(uri, endpoint)` contact made through this pool.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// URIs contacted for a given endpoint, in call order.
    pub fn contacted(&self, endpoint: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ep)| ep == endpoint)
            .map(|(uri, _)| uri.clone())
            .collect()
    }
}

#[async_trait]
impl Pool for LoopbackPool {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Connection>> {
        self.calls
            .lock()
            .unwrap()
            .push((uri.to_string(), "connect".to_string()));
        if self.down.lock().unwrap().contains(uri) {
            return Err(Error::ConnectionFailed(format!("{} is unreachable", uri)));
        }
        let target = self
            .instances
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("{} is not registered", uri)))?;
        Ok(Box::new(LoopbackConnection {
            uri: uri.to_string(),
            target,
            calls: self.calls.clone(),
        }))
    }
}

struct LoopbackConnection {
    uri: String,
    target: Arc<Applier>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl LoopbackConnection {
    fn record(&self, endpoint: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((self.uri.clone(), endpoint.to_string()));
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn load_from_file(&self) -> Result<Value> {
        self.record("load_from_file");
        self.target.load_from_file()
    }

    async fn prepare_2pc(&self, conf: &Value) -> Result<()> {
        self.record("prepare_2pc");
        self.target.prepare_2pc(conf.clone()).await
    }

    async fn commit_2pc(&self) -> Result<()> {
        self.record("commit_2pc");
        self.target.commit_2pc().await
    }

    async fn abort_2pc(&self) -> Result<()> {
        self.record("abort_2pc");
        self.target.abort_2pc()
    }

    async fn validate_config(&self, conf: &Value) -> Result<()> {
        self.record("validate_config");
        self.target.validate_config_remote(conf)
    }

    async fn apply_config(&self, conf: &Value) -> Result<()> {
        self.record("apply_config");
        self.target.apply_config_remote(conf.clone()).await
    }
}
