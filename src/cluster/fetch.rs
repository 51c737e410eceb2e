//! Config bootstrap via a peer
//!
//! A freshly started instance with no local config locates a suitable peer
//! through membership and pulls its active config. Only used at boot.

use rand::seq::SliceRandom;
use serde_yaml::Value;

use crate::cluster::applier::Applier;
use crate::cluster::membership::{Member, Membership};
use crate::cluster::topology::Topology;
use crate::common::{Error, Result};
use crate::config::store;
use crate::rpc::{Connection, Pool};

/// Fetch the clusterwide config from a peer picked out of membership.
///
/// With a topology hint, instances that cannot be served by a peer (not in
/// the hint, expelled, or alone in the cluster) fall back to the local
/// disk. Returns `None` when no candidate is available yet; the caller
/// retries.
pub async fn fetch_from_membership(
    applier: &Applier,
    hint: Option<&Topology>,
) -> Result<Option<Value>> {
    let settings = applier.settings();

    if let Some(hint) = hint {
        let entry = hint.servers.get(&settings.instance_uuid);
        let alone = hint.servers.len() == 1;
        let expelled = entry.map(|e| e.is_expelled()).unwrap_or(false);
        if entry.is_none() || expelled || alone {
            return store::load(&settings.active_path()).map(Some);
        }
    }

    let myself = applier.membership().myself();
    let candidates: Vec<Member> = applier
        .membership()
        .pairs()
        .into_iter()
        .filter(|member| {
            member.status.is_alive()
                && member.payload.error.is_none()
                && member.uri != myself.uri
                && member.payload.uuid.map_or(false, |uuid| match hint {
                    Some(hint) => hint.servers.contains_key(&uuid),
                    None => true,
                })
        })
        .collect();

    let Some(chosen) = candidates.choose(&mut rand::thread_rng()) else {
        return Ok(None);
    };

    tracing::info!("Fetching config from {}", chosen.uri);
    let conn = applier
        .pool()
        .connect(&chosen.uri)
        .await
        .map_err(|e| Error::ConfigFetch(e.to_string()))?;
    let doc = conn.load_from_file().await.map_err(|e| match e {
        Error::ConfigFetch(_) => e,
        other => Error::ConfigFetch(other.to_string()),
    })?;

    Ok(Some(doc))
}
