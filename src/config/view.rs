//! Active configuration snapshots
//!
//! The active document is owned by the applier; everybody else gets either
//! a [`ConfigView`] (an `Arc`'d snapshot exposing read accessors only) or an
//! independently owned deep copy of the raw document.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::cluster::topology::Topology;
use crate::common::{Error, Result};

/// The `vshard` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VshardConfig {
    pub bucket_count: u64,
    pub bootstrapped: bool,
}

/// A parsed clusterwide configuration document.
///
/// Keeps the full raw tree (role sections stay opaque to the core) next to
/// the typed mandatory sections.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    doc: Value,
    topology: Topology,
    vshard: VshardConfig,
}

impl ClusterConfig {
    /// Parse the mandatory sections out of a raw document.
    pub fn from_value(doc: Value) -> Result<Self> {
        if doc.as_mapping().is_none() {
            return Err(Error::ConfigValidate("configuration must be a mapping".into()));
        }

        let topology_value = doc
            .get("topology")
            .cloned()
            .ok_or_else(|| Error::ConfigValidate("topology section is missing".into()))?;
        let topology: Topology = serde_yaml::from_value(topology_value)
            .map_err(|e| Error::ConfigValidate(format!("topology section: {}", e)))?;

        let vshard_value = doc
            .get("vshard")
            .cloned()
            .ok_or_else(|| Error::ConfigValidate("vshard section is missing".into()))?;
        let vshard: VshardConfig = serde_yaml::from_value(vshard_value)
            .map_err(|e| Error::ConfigValidate(format!("vshard section: {}", e)))?;

        Ok(Self {
            doc,
            topology,
            vshard,
        })
    }

    pub fn doc(&self) -> &Value {
        &self.doc
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn vshard(&self) -> &VshardConfig {
        &self.vshard
    }

    /// A top-level section of the raw tree.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.doc.get(name)
    }

    /// Roles enabled for the replicaset this instance belongs to.
    pub fn enabled_roles(&self, instance_uuid: &Uuid) -> Vec<String> {
        self.topology
            .replicaset_of(instance_uuid)
            .and_then(|rs| self.topology.replicasets.get(&rs))
            .map(|rs| rs.roles.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Read-only handle over the active configuration.
///
/// Cloning is cheap; the underlying document is shared and immutable. Use
/// [`ConfigView::deepcopy`] for a tree the caller may mutate.
#[derive(Clone)]
pub struct ConfigView {
    inner: Arc<ClusterConfig>,
}

impl ConfigView {
    pub fn new(inner: Arc<ClusterConfig>) -> Self {
        Self { inner }
    }

    pub fn doc(&self) -> &Value {
        self.inner.doc()
    }

    pub fn topology(&self) -> &Topology {
        self.inner.topology()
    }

    pub fn vshard(&self) -> &VshardConfig {
        self.inner.vshard()
    }

    pub fn section(&self, name: &str) -> Option<&Value> {
        self.inner.section(name)
    }

    pub fn enabled_roles(&self, instance_uuid: &Uuid) -> Vec<String> {
        self.inner.enabled_roles(instance_uuid)
    }

    /// Independently owned copy of the whole document.
    pub fn deepcopy(&self) -> Value {
        self.inner.doc().clone()
    }

    /// Independently owned copy of one top-level section.
    pub fn section_deepcopy(&self, name: &str) -> Option<Value> {
        self.inner.section(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Value {
        serde_yaml::from_str(
            "topology:\n\
             \x20 servers:\n\
             \x20   aaaaaaaa-aaaa-4000-b000-000000000001:\n\
             \x20     uri: localhost:3301\n\
             \x20     replicaset_uuid: aaaaaaaa-0000-4000-b000-000000000000\n\
             \x20 replicasets:\n\
             \x20   aaaaaaaa-0000-4000-b000-000000000000:\n\
             \x20     roles: [vshard-router]\n\
             \x20     master: [aaaaaaaa-aaaa-4000-b000-000000000001]\n\
             \x20 failover: false\n\
             vshard:\n\
             \x20 bucket_count: 3000\n\
             \x20 bootstrapped: false\n\
             myrole:\n\
             \x20 answer: 42\n",
        )
        .unwrap()
    }

    #[test]
    fn test_from_value() {
        let conf = ClusterConfig::from_value(sample_doc()).unwrap();
        assert_eq!(conf.vshard().bucket_count, 3000);
        assert_eq!(conf.topology().servers.len(), 1);
        assert_eq!(
            conf.section("myrole").unwrap().get("answer").unwrap().as_u64(),
            Some(42)
        );
    }

    #[test]
    fn test_from_value_missing_sections() {
        let err = ClusterConfig::from_value(Value::Null).unwrap_err();
        assert!(matches!(err, Error::ConfigValidate(_)));

        let doc: Value = serde_yaml::from_str("topology: {}\n").unwrap();
        let err = ClusterConfig::from_value(doc).unwrap_err();
        assert!(err.to_string().contains("vshard"));
    }

    #[test]
    fn test_deepcopy_does_not_alias_the_active_tree() {
        let conf = Arc::new(ClusterConfig::from_value(sample_doc()).unwrap());
        let view = ConfigView::new(conf);

        let mut copy = view.deepcopy();
        let mapping = copy.as_mapping_mut().unwrap();
        mapping.insert("myrole".into(), Value::Null);

        // The view still observes the original tree.
        assert_eq!(
            view.section("myrole").unwrap().get("answer").unwrap().as_u64(),
            Some(42)
        );
    }

    #[test]
    fn test_enabled_roles() {
        let conf = Arc::new(ClusterConfig::from_value(sample_doc()).unwrap());
        let view = ConfigView::new(conf);
        let uuid: Uuid = "aaaaaaaa-aaaa-4000-b000-000000000001".parse().unwrap();
        assert_eq!(view.enabled_roles(&uuid), vec!["vshard-router".to_string()]);
        assert!(view.enabled_roles(&Uuid::nil()).is_empty());
    }
}
