//! Built-in sharding service facades
//!
//! The bucket engine itself is external; these handles record the sharding
//! configuration applied to the storage and router services and expose it
//! for introspection. The failover worker deep-compares the installed
//! config against a freshly derived one to decide whether to reconfigure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::common::Result;

/// One replica inside a sharded replicaset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingReplica {
    pub uri: String,
    pub name: String,
    pub master: bool,
}

/// One storage replicaset as seen by the sharding services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingReplicaset {
    pub replicas: BTreeMap<Uuid, ShardingReplica>,
    pub weight: f64,
}

/// Full sharding map: storage replicaset UUID to its replicas
pub type ShardingMap = BTreeMap<Uuid, ShardingReplicaset>;

/// Configuration applied to the storage service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOpts {
    pub sharding: ShardingMap,
    pub bucket_count: u64,
    pub listen: String,
}

/// Configuration applied to the router service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterOpts {
    pub sharding: ShardingMap,
    pub bucket_count: u64,
}

/// `vshard-storage` service handle
#[derive(Default)]
pub struct StorageService {
    current: Mutex<Option<StorageOpts>>,
}

impl StorageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a new storage configuration.
    pub fn cfg(&self, opts: StorageOpts) -> Result<()> {
        tracing::info!(
            "Configuring vshard-storage: {} replicasets, {} buckets",
            opts.sharding.len(),
            opts.bucket_count
        );
        *self.current.lock().unwrap() = Some(opts);
        Ok(())
    }

    /// Currently installed configuration, if any.
    pub fn current_cfg(&self) -> Option<StorageOpts> {
        self.current.lock().unwrap().clone()
    }
}

/// `vshard-router` service handle
#[derive(Default)]
pub struct RouterService {
    current: Mutex<Option<RouterOpts>>,
}

impl RouterService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a new router configuration.
    pub fn cfg(&self, opts: RouterOpts) -> Result<()> {
        tracing::info!(
            "Configuring vshard-router: {} replicasets, {} buckets",
            opts.sharding.len(),
            opts.bucket_count
        );
        *self.current.lock().unwrap() = Some(opts);
        Ok(())
    }

    /// Currently installed configuration, if any.
    pub fn current_cfg(&self) -> Option<RouterOpts> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map(master: bool) -> ShardingMap {
        let rs = Uuid::new_v4();
        let instance = Uuid::new_v4();
        let mut replicas = BTreeMap::new();
        replicas.insert(
            instance,
            ShardingReplica {
                uri: "localhost:3302".into(),
                name: "storage-1".into(),
                master,
            },
        );
        let mut map = BTreeMap::new();
        map.insert(rs, ShardingReplicaset { replicas, weight: 1.0 });
        map
    }

    #[test]
    fn test_storage_cfg_is_introspectable() {
        let storage = StorageService::new();
        assert!(storage.current_cfg().is_none());

        let opts = StorageOpts {
            sharding: sample_map(true),
            bucket_count: 3000,
            listen: "localhost:3302".into(),
        };
        storage.cfg(opts.clone()).unwrap();
        assert_eq!(storage.current_cfg(), Some(opts));
    }

    #[test]
    fn test_sharding_map_compares_deeply() {
        let router = RouterService::new();
        let opts = RouterOpts {
            sharding: sample_map(true),
            bucket_count: 3000,
        };
        router.cfg(opts.clone()).unwrap();

        let mut changed = opts.clone();
        for rs in changed.sharding.values_mut() {
            for replica in rs.replicas.values_mut() {
                replica.master = false;
            }
        }
        assert_ne!(router.current_cfg(), Some(changed));
        assert_eq!(router.current_cfg(), Some(opts));
    }
}
