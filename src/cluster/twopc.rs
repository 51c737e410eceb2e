//! Clusterwide two-phase commit
//!
//! `patch_clusterwide` merges a patch into the active config, validates it,
//! prepares the result on every participant (exclusive on-disk lock, 5 s
//! client timeout, stop at the first failure), then either commits on every
//! participant or aborts the prepared ones. A commit failure is recorded
//! per peer but the remaining commits are still issued: once any peer has
//! committed there is no automatic rollback, the operator reconciles.

use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::applier::Applier;
use crate::cluster::topology::{self, Topology};
use crate::common::{Error, Result};
use crate::config::view::ClusterConfig;
use crate::rpc::{Connection, Pool};

/// Apply a patch to the clusterwide configuration.
///
/// Top-level keys in the patch replace the current ones; an explicit null
/// removes the key; absent keys are left unchanged.
pub async fn patch_clusterwide(applier: &Arc<Applier>, patch: Mapping) -> Result<()> {
    tracing::info!("Patching clusterwide config");
    let _guard = applier.try_lock_clusterwide()?;

    let result = run_round(applier, patch).await;
    if let Err(e) = &result {
        tracing::error!("Clusterwide patch failed: {}", e);
    }
    result
}

async fn run_round(applier: &Arc<Applier>, patch: Mapping) -> Result<()> {
    let old_view = applier.get_readonly().ok_or_else(|| {
        Error::ConfigApply("no active configuration, bootstrap the instance first".into())
    })?;

    let new_doc = merge_patch(old_view.doc(), &patch);
    let new_conf = ClusterConfig::from_value(new_doc.clone())?;
    topology::validate(
        new_conf.topology(),
        Some(old_view.topology()),
        &applier.registry().known_roles(),
    )?;

    let uris = participants(new_conf.topology(), old_view.topology());
    tracing::debug!("Participants: {:?}", uris);

    // Prepare phase: sequential, stop at the first failure.
    let timeout = applier.settings().prepare_timeout();
    let mut prepared: Vec<&String> = Vec::new();
    let mut failure: Option<Error> = None;
    for uri in &uris {
        match prepare_on(applier.pool(), uri, &new_doc, timeout).await {
            Ok(()) => {
                tracing::info!("Prepared config on {}", uri);
                prepared.push(uri);
            }
            Err(e) => {
                failure = Some(Error::PrepareFailed {
                    uri: uri.clone(),
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    if let Some(error) = failure {
        tracing::error!("{}", error);
        for uri in prepared {
            match abort_on(applier.pool(), uri).await {
                Ok(()) => tracing::info!("Aborted config on {}", uri),
                Err(e) => tracing::error!("Aborting config on {} failed: {}", uri, e),
            }
        }
        return Err(error);
    }

    // Commit phase: every participant, no timeout, no rollback.
    let mut commit_failure: Option<Error> = None;
    for uri in &uris {
        match commit_on(applier.pool(), uri).await {
            Ok(()) => tracing::info!("Committed config on {}", uri),
            Err(e) => {
                let error = Error::CommitFailed {
                    uri: uri.clone(),
                    reason: e.to_string(),
                };
                tracing::error!("{}", error);
                if commit_failure.is_none() {
                    commit_failure = Some(error);
                }
            }
        }
    }

    match commit_failure {
        Some(error) => Err(error),
        None => {
            tracing::info!("Clusterwide config updated");
            Ok(())
        }
    }
}

/// Merge a patch into a copy of the base document.
pub(crate) fn merge_patch(base: &Value, patch: &Mapping) -> Value {
    let mut doc = base.clone();
    if let Some(mapping) = doc.as_mapping_mut() {
        for (key, value) in patch {
            if value.is_null() {
                mapping.remove(key);
            } else {
                mapping.insert(key.clone(), value.clone());
            }
        }
    }
    doc
}

/// URIs taking part in a round: every server of the new topology that is
/// not expelled, not disabled, and already known to the old topology (new
/// servers bootstrap via membership instead). Sorted for determinism.
pub(crate) fn participants(new: &Topology, old: &Topology) -> Vec<String> {
    let mut uris: Vec<String> = new
        .servers
        .iter()
        .filter_map(|(uuid, entry)| {
            let server = entry.as_server()?;
            if server.disabled || !old.servers.contains_key(uuid) {
                return None;
            }
            Some(server.uri.clone())
        })
        .collect();
    uris.sort();
    uris
}

async fn prepare_on(
    pool: &Arc<dyn Pool>,
    uri: &str,
    doc: &Value,
    timeout: Duration,
) -> Result<()> {
    let call = async {
        let conn = pool.connect(uri).await?;
        conn.prepare_2pc(doc).await
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout(format!("prepare on {} timed out", uri)))?
}

async fn commit_on(pool: &Arc<dyn Pool>, uri: &str) -> Result<()> {
    let conn = pool.connect(uri).await?;
    conn.commit_2pc().await
}

async fn abort_on(pool: &Arc<dyn Pool>, uri: &str) -> Result<()> {
    let conn = pool.connect(uri).await?;
    conn.abort_2pc().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::topology::{ReplicasetConfig, ServerConfig, ServerEntry};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    #[test]
    fn test_merge_patch_semantics() {
        let base: Value = serde_yaml::from_str("a: 1\nb: {x: 2}\nc: 3\n").unwrap();
        let patch: Mapping = serde_yaml::from_str("b: {y: 9}\nc: null\nd: 4\n").unwrap();

        let merged = merge_patch(&base, &patch);
        // Untouched keys stay, replaced keys are replaced wholesale,
        // explicit null removes.
        assert_eq!(merged.get("a").unwrap().as_u64(), Some(1));
        assert_eq!(merged.get("b").unwrap().get("y").unwrap().as_u64(), Some(9));
        assert!(merged.get("b").unwrap().get("x").is_none());
        assert!(merged.get("c").is_none());
        assert_eq!(merged.get("d").unwrap().as_u64(), Some(4));
    }

    fn topology_with(entries: &[(u128, &str, bool)]) -> Topology {
        let rs_uuid = Uuid::from_u128(0xb0);
        let mut topology = Topology::default();
        let mut master = Vec::new();
        for (n, uri, disabled) in entries {
            let uuid = Uuid::from_u128(*n);
            if uri.is_empty() {
                topology.servers.insert(uuid, ServerEntry::Expelled);
                continue;
            }
            master.push(uuid);
            topology.servers.insert(
                uuid,
                ServerEntry::Server(ServerConfig {
                    uri: uri.to_string(),
                    replicaset_uuid: rs_uuid,
                    disabled: *disabled,
                    alias: None,
                }),
            );
        }
        topology.replicasets.insert(
            rs_uuid,
            ReplicasetConfig {
                roles: BTreeSet::new(),
                master,
                weight: 1.0,
                all_rw: false,
            },
        );
        topology
    }

    #[test]
    fn test_participants_excludes_expelled_disabled_and_new() {
        let old = topology_with(&[
            (1, "localhost:3303", false),
            (2, "localhost:3301", false),
            (3, "", false),
        ]);
        let new = topology_with(&[
            (1, "localhost:3303", false),
            (2, "localhost:3301", true),
            (3, "", false),
            (4, "localhost:3304", false),
        ]);

        // Disabled and expelled servers are skipped; server 4 is new and
        // bootstraps via membership instead; output is sorted.
        assert_eq!(participants(&new, &old), vec!["localhost:3303"]);

        let new = topology_with(&[(1, "localhost:3303", false), (2, "localhost:3301", false)]);
        assert_eq!(
            participants(&new, &old),
            vec!["localhost:3301", "localhost:3303"]
        );
    }
}
