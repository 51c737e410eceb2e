//! Cluster topology model and checks
//!
//! Typed view of the `topology` section of the clusterwide config:
//! servers (keyed by instance UUID, with a tombstone sentinel for expelled
//! ones), replicasets (roles, master order, weight), and the failover flag.
//! Also derives the per-instance replication list, the active master of
//! each replicaset, and the sharding map consumed by the vshard services.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::cluster::membership::{Member, Membership};
use crate::cluster::roles::VSHARD_STORAGE;
use crate::cluster::sharding::{ShardingMap, ShardingReplica, ShardingReplicaset};
use crate::common::{Error, Result};

/// Tombstone retained for servers permanently removed from the cluster.
pub const EXPELLED: &str = "expelled";

/// The `topology` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub servers: BTreeMap<Uuid, ServerEntry>,

    #[serde(default)]
    pub replicasets: BTreeMap<Uuid, ReplicasetConfig>,

    #[serde(default)]
    pub failover: bool,
}

/// A server slot: either a live record or the expelled tombstone
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEntry {
    Expelled,
    Server(ServerConfig),
}

impl ServerEntry {
    pub fn as_server(&self) -> Option<&ServerConfig> {
        match self {
            ServerEntry::Server(cfg) => Some(cfg),
            ServerEntry::Expelled => None,
        }
    }

    pub fn is_expelled(&self) -> bool {
        matches!(self, ServerEntry::Expelled)
    }
}

impl Serialize for ServerEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ServerEntry::Expelled => serializer.serialize_str(EXPELLED),
            ServerEntry::Server(cfg) => cfg.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ServerEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        if value.as_str() == Some(EXPELLED) {
            return Ok(ServerEntry::Expelled);
        }
        serde_yaml::from_value(value)
            .map(ServerEntry::Server)
            .map_err(D::Error::custom)
    }
}

/// A live server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub uri: String,

    pub replicaset_uuid: Uuid,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ServerConfig {
    /// Name shown in sharding maps and logs.
    pub fn name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.uri.clone())
    }
}

/// One replicaset record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicasetConfig {
    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Failover priority order; the head is the preferred master.
    #[serde(default)]
    pub master: Vec<Uuid>,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub all_rw: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl Topology {
    /// The replicaset a server belongs to, if it is a live record.
    pub fn replicaset_of(&self, uuid: &Uuid) -> Option<Uuid> {
        self.servers
            .get(uuid)
            .and_then(ServerEntry::as_server)
            .map(|s| s.replicaset_uuid)
    }

    /// The live server record for a UUID.
    pub fn server(&self, uuid: &Uuid) -> Option<&ServerConfig> {
        self.servers.get(uuid).and_then(ServerEntry::as_server)
    }
}

/// Is the server a live, non-disabled record?
pub fn not_disabled(topology: &Topology, uuid: &Uuid) -> bool {
    topology.server(uuid).map(|s| !s.disabled).unwrap_or(false)
}

/// Validate a proposed topology against the current one.
pub fn validate(new: &Topology, old: Option<&Topology>, known_roles: &[String]) -> Result<()> {
    // Server records reference existing replicasets and carry unique URIs.
    let mut seen_uris: BTreeMap<&str, &Uuid> = BTreeMap::new();
    for (uuid, entry) in &new.servers {
        let Some(server) = entry.as_server() else {
            continue;
        };
        if server.uri.is_empty() {
            return Err(Error::ConfigValidate(format!("server {}: uri is empty", uuid)));
        }
        if !new.replicasets.contains_key(&server.replicaset_uuid) {
            return Err(Error::ConfigValidate(format!(
                "server {}: unknown replicaset {}",
                uuid, server.replicaset_uuid
            )));
        }
        if let Some(other) = seen_uris.insert(server.uri.as_str(), uuid) {
            return Err(Error::ConfigValidate(format!(
                "servers {} and {} share the same uri {}",
                other, uuid, server.uri
            )));
        }
    }

    for (rs_uuid, rs) in &new.replicasets {
        if rs.master.is_empty() {
            return Err(Error::ConfigValidate(format!(
                "replicaset {}: master list is empty",
                rs_uuid
            )));
        }
        for master in &rs.master {
            match new.servers.get(master) {
                None => {
                    return Err(Error::ConfigValidate(format!(
                        "replicaset {}: master {} is not in topology.servers",
                        rs_uuid, master
                    )));
                }
                Some(ServerEntry::Expelled) => {
                    return Err(Error::ConfigValidate(format!(
                        "replicaset {}: master {} is expelled",
                        rs_uuid, master
                    )));
                }
                Some(ServerEntry::Server(server)) => {
                    if server.replicaset_uuid != *rs_uuid {
                        return Err(Error::ConfigValidate(format!(
                            "replicaset {}: master {} belongs to replicaset {}",
                            rs_uuid, master, server.replicaset_uuid
                        )));
                    }
                }
            }
        }
        for role in &rs.roles {
            if !known_roles.iter().any(|known| known == role) {
                return Err(Error::ConfigValidate(format!(
                    "replicaset {}: unknown role {:?}",
                    rs_uuid, role
                )));
            }
        }
    }

    // Server slots are permanent: no removal, no replicaset reassignment,
    // and expelled stays expelled.
    if let Some(old) = old {
        for (uuid, old_entry) in &old.servers {
            match (old_entry, new.servers.get(uuid)) {
                (_, None) => {
                    return Err(Error::ConfigValidate(format!(
                        "server {} cannot be removed from the topology",
                        uuid
                    )));
                }
                (ServerEntry::Expelled, Some(entry)) if !entry.is_expelled() => {
                    return Err(Error::ConfigValidate(format!(
                        "server {} is expelled and cannot come back",
                        uuid
                    )));
                }
                (ServerEntry::Server(old_server), Some(ServerEntry::Server(new_server))) => {
                    if old_server.replicaset_uuid != new_server.replicaset_uuid {
                        return Err(Error::ConfigValidate(format!(
                            "server {} cannot move from replicaset {} to {}",
                            uuid, old_server.replicaset_uuid, new_server.replicaset_uuid
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

/// Ordered replication peer list for one replicaset: masters first in
/// priority order, then the remaining members sorted by UUID.
pub fn get_replication_config(topology: &Topology, replicaset_uuid: &Uuid) -> Vec<String> {
    let mut uris = Vec::new();
    let mut listed: BTreeSet<&Uuid> = BTreeSet::new();

    let masters = topology
        .replicasets
        .get(replicaset_uuid)
        .map(|rs| rs.master.as_slice())
        .unwrap_or(&[]);

    for uuid in masters {
        if let Some(server) = topology.server(uuid) {
            if server.replicaset_uuid == *replicaset_uuid && !server.disabled && listed.insert(uuid)
            {
                uris.push(server.uri.clone());
            }
        }
    }

    for (uuid, entry) in &topology.servers {
        let Some(server) = entry.as_server() else {
            continue;
        };
        if server.replicaset_uuid == *replicaset_uuid && !server.disabled && listed.insert(uuid) {
            uris.push(server.uri.clone());
        }
    }

    uris
}

/// Active master of every replicaset.
///
/// The head of the master list wins; with failover enabled the first
/// candidate that membership reports healthy wins instead, falling back to
/// the head when nobody is.
pub fn get_active_masters(
    topology: &Topology,
    membership: Option<&dyn Membership>,
) -> BTreeMap<Uuid, Uuid> {
    let members: BTreeMap<String, Member> = membership
        .map(|m| m.pairs().into_iter().map(|m| (m.uri.clone(), m)).collect())
        .unwrap_or_default();

    let mut masters = BTreeMap::new();
    for (rs_uuid, rs) in &topology.replicasets {
        let candidates: Vec<&Uuid> = rs
            .master
            .iter()
            .filter(|uuid| not_disabled(topology, uuid))
            .collect();

        let mut chosen = candidates.first().copied();
        if topology.failover && membership.is_some() {
            let healthy = candidates.iter().find(|uuid| {
                topology
                    .server(uuid)
                    .and_then(|s| members.get(&s.uri))
                    .map(Member::is_healthy)
                    .unwrap_or(false)
            });
            if let Some(uuid) = healthy {
                chosen = Some(*uuid);
            }
        }

        if let Some(uuid) = chosen {
            masters.insert(*rs_uuid, *uuid);
        }
    }

    masters
}

/// Sharding map for every replicaset carrying the `vshard-storage` role.
pub fn get_vshard_sharding_config(
    topology: &Topology,
    active_masters: &BTreeMap<Uuid, Uuid>,
) -> ShardingMap {
    let mut sharding = ShardingMap::new();

    for (rs_uuid, rs) in &topology.replicasets {
        if !rs.roles.contains(VSHARD_STORAGE) {
            continue;
        }

        let mut replicas = BTreeMap::new();
        for (uuid, entry) in &topology.servers {
            let Some(server) = entry.as_server() else {
                continue;
            };
            if server.replicaset_uuid != *rs_uuid || server.disabled {
                continue;
            }
            replicas.insert(
                *uuid,
                ShardingReplica {
                    uri: server.uri.clone(),
                    name: server.name(),
                    master: active_masters.get(rs_uuid) == Some(uuid),
                },
            );
        }

        sharding.insert(
            *rs_uuid,
            ShardingReplicaset {
                replicas,
                weight: rs.weight,
            },
        );
    }

    sharding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::{MemberStatus, MembershipState};

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn server(rs: Uuid, uri: &str) -> ServerEntry {
        ServerEntry::Server(ServerConfig {
            uri: uri.into(),
            replicaset_uuid: rs,
            disabled: false,
            alias: None,
        })
    }

    fn storage_pair() -> Topology {
        let rs = uuid(0xb0);
        let mut topology = Topology::default();
        topology.servers.insert(uuid(1), server(rs, "localhost:3301"));
        topology.servers.insert(uuid(2), server(rs, "localhost:3302"));
        topology.replicasets.insert(
            rs,
            ReplicasetConfig {
                roles: [VSHARD_STORAGE.to_string()].into(),
                master: vec![uuid(1), uuid(2)],
                weight: 1.0,
                all_rw: false,
            },
        );
        topology
    }

    fn known() -> Vec<String> {
        vec![VSHARD_STORAGE.to_string(), "vshard-router".to_string()]
    }

    #[test]
    fn test_expelled_sentinel_serde() {
        let mut topology = storage_pair();
        topology.servers.insert(uuid(3), ServerEntry::Expelled);

        let yaml = serde_yaml::to_string(&topology).unwrap();
        assert!(yaml.contains("expelled"));

        let parsed: Topology = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, topology);
    }

    #[test]
    fn test_validate_ok() {
        let topology = storage_pair();
        validate(&topology, None, &known()).unwrap();
    }

    #[test]
    fn test_validate_duplicate_uri() {
        let mut topology = storage_pair();
        let rs = uuid(0xb0);
        topology.servers.insert(uuid(2), server(rs, "localhost:3301"));

        let err = validate(&topology, None, &known()).unwrap_err();
        assert!(err.to_string().contains("same uri"));
    }

    #[test]
    fn test_validate_master_expelled() {
        let mut topology = storage_pair();
        topology.servers.insert(uuid(1), ServerEntry::Expelled);

        let err = validate(&topology, None, &known()).unwrap_err();
        assert!(err.to_string().contains("expelled"));
    }

    #[test]
    fn test_validate_master_missing() {
        let mut topology = storage_pair();
        topology.servers.remove(&uuid(2));

        let err = validate(&topology, None, &known()).unwrap_err();
        assert!(err.to_string().contains("not in topology.servers"));
    }

    #[test]
    fn test_validate_unknown_role() {
        let mut topology = storage_pair();
        topology
            .replicasets
            .get_mut(&uuid(0xb0))
            .unwrap()
            .roles
            .insert("mystery".into());

        let err = validate(&topology, None, &known()).unwrap_err();
        assert!(err.to_string().contains("unknown role"));
    }

    #[test]
    fn test_validate_no_reassignment() {
        let old = storage_pair();

        let mut new = storage_pair();
        let other_rs = uuid(0xc0);
        new.replicasets.insert(
            other_rs,
            ReplicasetConfig {
                roles: BTreeSet::new(),
                master: vec![uuid(2)],
                weight: 1.0,
                all_rw: false,
            },
        );
        new.servers.insert(uuid(2), server(other_rs, "localhost:3302"));

        let err = validate(&new, Some(&old), &known()).unwrap_err();
        assert!(err.to_string().contains("cannot move"));
    }

    #[test]
    fn test_validate_expelled_is_permanent() {
        let mut old = storage_pair();
        old.servers.insert(uuid(3), ServerEntry::Expelled);

        let mut new = storage_pair();
        new.servers
            .insert(uuid(3), server(uuid(0xb0), "localhost:3303"));
        let err = validate(&new, Some(&old), &known()).unwrap_err();
        assert!(err.to_string().contains("cannot come back"));

        let new = storage_pair();
        let err = validate(&new, Some(&old), &known()).unwrap_err();
        assert!(err.to_string().contains("cannot be removed"));
    }

    #[test]
    fn test_replication_config_order() {
        let mut topology = storage_pair();
        let rs = uuid(0xb0);
        topology.servers.insert(uuid(3), server(rs, "localhost:3303"));
        topology.replicasets.get_mut(&rs).unwrap().master = vec![uuid(2), uuid(1)];

        // Masters first in priority order, then the rest by UUID.
        let uris = get_replication_config(&topology, &rs);
        assert_eq!(uris, vec!["localhost:3302", "localhost:3301", "localhost:3303"]);
    }

    #[test]
    fn test_active_masters_without_failover() {
        let topology = storage_pair();
        let masters = get_active_masters(&topology, None);
        assert_eq!(masters.get(&uuid(0xb0)), Some(&uuid(1)));
    }

    #[test]
    fn test_active_masters_with_failover() {
        let mut topology = storage_pair();
        topology.failover = true;

        let state = MembershipState::new();
        let me = state.handle("localhost:3301");
        state.handle("localhost:3302");
        state.set_status("localhost:3301", MemberStatus::Dead);

        let masters = get_active_masters(&topology, Some(&*me));
        assert_eq!(masters.get(&uuid(0xb0)), Some(&uuid(2)));

        // Nobody healthy: fall back to the head of the list.
        state.set_status("localhost:3302", MemberStatus::Dead);
        let masters = get_active_masters(&topology, Some(&*me));
        assert_eq!(masters.get(&uuid(0xb0)), Some(&uuid(1)));
    }

    #[test]
    fn test_sharding_config() {
        let topology = storage_pair();
        let masters = get_active_masters(&topology, None);
        let sharding = get_vshard_sharding_config(&topology, &masters);

        let rs = sharding.get(&uuid(0xb0)).unwrap();
        assert_eq!(rs.replicas.len(), 2);
        assert!(rs.replicas.get(&uuid(1)).unwrap().master);
        assert!(!rs.replicas.get(&uuid(2)).unwrap().master);

        // Disabled members are left out of the map.
        let mut topology = storage_pair();
        if let Some(ServerEntry::Server(s)) = topology.servers.get_mut(&uuid(2)) {
            s.disabled = true;
        }
        let sharding = get_vshard_sharding_config(&topology, &masters);
        assert_eq!(sharding.get(&uuid(0xb0)).unwrap().replicas.len(), 1);
    }
}
