//! Local apply pipeline
//!
//! A single worker consumes apply requests from a one-slot channel and
//! drives the pipeline in a fixed order: install the document, replication,
//! topology handoff, built-in sharding, user roles, failover worker,
//! membership payload. After the replication step failures are logged and
//! remembered, never fatal: every subsequent step still runs and the first
//! recorded error is returned at the end.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::cluster::applier::Applier;
use crate::cluster::membership::Membership;
use crate::cluster::roles::{Role, RoleContext, Service, VSHARD_ROUTER, VSHARD_STORAGE};
use crate::cluster::runtime::DatabaseRuntime;
use crate::cluster::sharding::{RouterOpts, RouterService, StorageOpts, StorageService};
use crate::cluster::topology;
use crate::common::{Error, Result};
use crate::config::view::{ClusterConfig, ConfigView};

/// Applier worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Dead,
}

pub(crate) struct ApplyRequest {
    pub conf: ClusterConfig,
    pub done: oneshot::Sender<Result<()>>,
}

/// Spawn the single applier worker for this process.
pub(crate) fn spawn_worker(applier: &Arc<Applier>) {
    let Some(mut rx) = applier.take_worker_rx() else {
        return;
    };
    let weak = Arc::downgrade(applier);

    tokio::spawn(async move {
        if let Some(applier) = weak.upgrade() {
            applier.set_worker_state(WorkerState::Ready);
        }

        while let Some(request) = rx.recv().await {
            let Some(applier) = weak.upgrade() else {
                break;
            };
            let result = run_pipeline(&applier, request.conf).await;
            let _ = request.done.send(result);
        }

        if let Some(applier) = weak.upgrade() {
            applier.set_worker_state(WorkerState::Dead);
        }
    });
}

fn record(first_error: &mut Option<Error>, error: Error) {
    tracing::error!("{}", error);
    if first_error.is_none() {
        *first_error = Some(error);
    }
}

async fn run_pipeline(applier: &Arc<Applier>, conf: ClusterConfig) -> Result<()> {
    tracing::info!("Applying clusterwide config");

    let my_uuid = applier.settings().instance_uuid;
    let conf = Arc::new(conf);
    let mut first_error: Option<Error> = None;

    // Freeze the document and install it as the active config.
    applier.install_active(conf.clone());
    let view = ConfigView::new(conf.clone());

    // Replication.
    let my_rs = conf.topology().replicaset_of(&my_uuid);
    if let Some(rs_uuid) = my_rs {
        let uris = topology::get_replication_config(conf.topology(), &rs_uuid);
        if let Err(e) = applier.runtime().reconfigure_replication(&uris).await {
            record(
                &mut first_error,
                Error::ConfigApply(format!("replication: {}", e)),
            );
        }
    }

    // Topology handoff: active masters and our own mastership.
    let masters =
        topology::get_active_masters(conf.topology(), Some(applier.membership().as_ref()));
    let is_master = my_rs
        .map(|rs_uuid| masters.get(&rs_uuid) == Some(&my_uuid))
        .unwrap_or(false);
    applier.set_is_master(is_master);

    let all_rw = my_rs
        .and_then(|rs_uuid| conf.topology().replicasets.get(&rs_uuid))
        .map(|rs| rs.all_rw)
        .unwrap_or(false);
    applier.runtime().set_read_only(!(is_master || all_rw));

    // Built-in sharding services.
    let enabled: BTreeSet<String> = view.enabled_roles(&my_uuid).into_iter().collect();
    if enabled.contains(VSHARD_STORAGE) {
        let storage = applier
            .services()
            .vshard_storage()
            .unwrap_or_else(|| Arc::new(StorageService::new()));
        let opts = StorageOpts {
            sharding: topology::get_vshard_sharding_config(conf.topology(), &masters),
            bucket_count: conf.vshard().bucket_count,
            listen: applier.settings().advertise_uri.clone(),
        };
        if let Err(e) = storage.cfg(opts) {
            record(
                &mut first_error,
                Error::ConfigApply(format!("vshard-storage: {}", e)),
            );
        }
        applier
            .services()
            .set(VSHARD_STORAGE, Service::VshardStorage(storage));
    }
    if enabled.contains(VSHARD_ROUTER) {
        let router = applier
            .services()
            .vshard_router()
            .unwrap_or_else(|| Arc::new(RouterService::new()));
        let opts = RouterOpts {
            sharding: topology::get_vshard_sharding_config(conf.topology(), &masters),
            bucket_count: conf.vshard().bucket_count,
        };
        if let Err(e) = router.cfg(opts) {
            record(
                &mut first_error,
                Error::ConfigApply(format!("vshard-router: {}", e)),
            );
        }
        applier
            .services()
            .set(VSHARD_ROUTER, Service::VshardRouter(router));
    }

    // User roles, in registration order.
    let ctx = RoleContext { is_master };
    for role in applier.registry().roles() {
        let name = role.name().to_string();
        let is_enabled = enabled.contains(&name);
        let installed = applier.services().contains(&name);

        if is_enabled {
            if !installed {
                if let Err(e) = role.init(&ctx) {
                    record(
                        &mut first_error,
                        Error::ConfigApply(format!("role {:?} init: {}", name, e)),
                    );
                    continue;
                }
            }
            applier.services().set(&name, Service::Role(role.clone()));
            if let Err(e) = role.apply_config(&view, &ctx) {
                record(
                    &mut first_error,
                    Error::ConfigApply(format!("role {:?} apply_config: {}", name, e)),
                );
            }
        } else if installed {
            if let Err(e) = role.stop(&ctx) {
                record(
                    &mut first_error,
                    Error::ConfigApply(format!("role {:?} stop: {}", name, e)),
                );
            }
            applier.services().remove(&name);
        }
    }

    // Failover worker.
    let wants_failover = conf.topology().failover
        && (enabled.contains(VSHARD_STORAGE) || enabled.contains(VSHARD_ROUTER));
    if wants_failover {
        applier.ensure_failover();
    } else {
        applier.stop_failover();
    }

    // Publish the outcome for operators watching membership.
    if first_error.is_some() {
        applier
            .membership()
            .set_payload("error", Some(serde_json::json!("Config apply failed")));
        applier
            .membership()
            .set_payload("ready", Some(serde_json::json!(false)));
    } else {
        applier.membership().set_payload("error", None);
        applier
            .membership()
            .set_payload("ready", Some(serde_json::json!(true)));
        tracing::info!("Clusterwide config applied");
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
