//! Shared harness for multi-instance tests
//!
//! Builds an in-process cluster: one applier per instance, a shared
//! membership table, and a loopback pool recording every peer contact.

#![allow(dead_code)]

use clusterconf::cluster::membership::MembershipState;
use clusterconf::cluster::runtime::LocalRuntime;
use clusterconf::cluster::{Membership, RoleRegistry};
use clusterconf::common::InstanceSettings;
use clusterconf::rpc::LoopbackPool;
use clusterconf::Applier;
use serde_yaml::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const ROUTER: &str = "aaaaaaaa-aaaa-4000-b000-000000000001";
pub const STORAGE_1: &str = "bbbbbbbb-bbbb-4000-b000-000000000001";
pub const STORAGE_2: &str = "bbbbbbbb-bbbb-4000-b000-000000000002";
pub const EXPELLED_1: &str = "cccccccc-cccc-4000-b000-000000000001";
pub const RS_ROUTER: &str = "aaaaaaaa-0000-4000-b000-000000000000";
pub const RS_STORAGE: &str = "bbbbbbbb-0000-4000-b000-000000000000";

pub const ROUTER_URI: &str = "localhost:3301";
pub const STORAGE_1_URI: &str = "localhost:3302";
pub const STORAGE_2_URI: &str = "localhost:3303";

pub fn u(s: &str) -> Uuid {
    s.parse().unwrap()
}

pub struct TestInstance {
    pub uuid: Uuid,
    pub uri: String,
    pub applier: Arc<Applier>,
    pub runtime: Arc<LocalRuntime>,
    pub registry: Arc<RoleRegistry>,
    _dir: TempDir,
}

pub struct TestCluster {
    pub membership: Arc<MembershipState>,
    pub pool: Arc<LoopbackPool>,
    pub instances: Vec<TestInstance>,
}

impl TestCluster {
    /// One applier per `(uuid, uri)`, wired through shared membership and a
    /// loopback pool.
    pub fn new(specs: &[(&str, &str)]) -> Self {
        let membership = MembershipState::new();
        let pool = LoopbackPool::new();

        let instances = specs
            .iter()
            .map(|(uuid, uri)| {
                let uuid = u(uuid);
                let dir = TempDir::new().unwrap();
                let handle = membership.handle(*uri);
                handle.set_payload("uuid", Some(serde_json::json!(uuid.to_string())));

                let runtime = Arc::new(LocalRuntime::new());
                let registry = Arc::new(RoleRegistry::new());
                let applier = Applier::new(
                    InstanceSettings::new(uuid, *uri, dir.path()),
                    registry.clone(),
                    handle,
                    pool.clone(),
                    runtime.clone(),
                );
                pool.register(*uri, applier.clone());

                TestInstance {
                    uuid,
                    uri: uri.to_string(),
                    applier,
                    runtime,
                    registry,
                    _dir: dir,
                }
            })
            .collect();

        Self {
            membership,
            pool,
            instances,
        }
    }

    /// The standard three-instance cluster: a router and a two-storage
    /// replicaset.
    pub fn three_nodes() -> Self {
        Self::new(&[
            (ROUTER, ROUTER_URI),
            (STORAGE_1, STORAGE_1_URI),
            (STORAGE_2, STORAGE_2_URI),
        ])
    }

    pub fn get(&self, uuid: &str) -> &TestInstance {
        let uuid = u(uuid);
        self.instances
            .iter()
            .find(|i| i.uuid == uuid)
            .expect("unknown instance")
    }

    /// Validate and apply the same document on every instance.
    pub async fn bootstrap(&self, doc: &Value) {
        for instance in &self.instances {
            instance
                .applier
                .validate_and_apply(doc.clone())
                .await
                .unwrap();
        }
    }
}

/// The standard cluster document for [`TestCluster::three_nodes`].
pub fn three_node_doc(failover: bool) -> Value {
    serde_yaml::from_str(&format!(
        "topology:\n\
         \x20 servers:\n\
         \x20   {ROUTER}:\n\
         \x20     uri: {ROUTER_URI}\n\
         \x20     replicaset_uuid: {RS_ROUTER}\n\
         \x20   {STORAGE_1}:\n\
         \x20     uri: {STORAGE_1_URI}\n\
         \x20     replicaset_uuid: {RS_STORAGE}\n\
         \x20   {STORAGE_2}:\n\
         \x20     uri: {STORAGE_2_URI}\n\
         \x20     replicaset_uuid: {RS_STORAGE}\n\
         \x20 replicasets:\n\
         \x20   {RS_ROUTER}:\n\
         \x20     roles: [vshard-router]\n\
         \x20     master: [{ROUTER}]\n\
         \x20   {RS_STORAGE}:\n\
         \x20     roles: [vshard-storage]\n\
         \x20     master: [{STORAGE_1}, {STORAGE_2}]\n\
         \x20 failover: {failover}\n\
         vshard:\n\
         \x20 bucket_count: 3000\n\
         \x20 bootstrapped: true\n"
    ))
    .unwrap()
}

/// Poll until the condition holds or a 5 s deadline passes.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
