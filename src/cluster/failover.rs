//! Failover worker
//!
//! A single long-lived task that wakes on membership changes, recomputes
//! the active masters, reconfigures the sharding services when the derived
//! map differs from the installed one, and re-runs the hooks of every
//! installed role. Step failures are logged and never stop the loop. The
//! worker is cancellable; cancellation drops the membership subscription.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::applier::Applier;
use crate::cluster::membership::Membership;
use crate::cluster::roles::{Role, RoleContext};
use crate::cluster::runtime::DatabaseRuntime;
use crate::cluster::sharding::{RouterOpts, StorageOpts};
use crate::cluster::topology;
use crate::common::Error;

/// Worker state machine: idle between events, running while a step is in
/// flight, stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct FailoverHandle {
    cancel: CancellationToken,
    state: watch::Receiver<FailoverState>,
    task: JoinHandle<()>,
}

impl FailoverHandle {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn state(&self) -> watch::Receiver<FailoverState> {
        self.state.clone()
    }
}

pub(crate) fn spawn(applier: &Arc<Applier>) -> FailoverHandle {
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(FailoverState::Idle);
    let mut events = applier.membership().subscribe();
    let weak = Arc::downgrade(applier);
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        tracing::info!("Failover worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = events.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(applier) = weak.upgrade() else {
                break;
            };
            let _ = state_tx.send(FailoverState::Running);
            step(&applier);
            let _ = state_tx.send(FailoverState::Idle);
        }

        let _ = state_tx.send(FailoverState::Stopped);
        tracing::info!("Failover worker stopped");
        // Dropping `events` unsubscribes from membership.
    });

    FailoverHandle {
        cancel,
        state: state_rx,
        task,
    }
}

fn step(applier: &Arc<Applier>) {
    let Some(view) = applier.get_readonly() else {
        return;
    };
    let settings = applier.settings();
    let my_uuid = settings.instance_uuid;

    let masters =
        topology::get_active_masters(view.topology(), Some(applier.membership().as_ref()));
    let my_rs = view.topology().replicaset_of(&my_uuid);
    let is_master = my_rs
        .map(|rs_uuid| masters.get(&rs_uuid) == Some(&my_uuid))
        .unwrap_or(false);
    applier.set_is_master(is_master);

    let all_rw = my_rs
        .and_then(|rs_uuid| view.topology().replicasets.get(&rs_uuid))
        .map(|rs| rs.all_rw)
        .unwrap_or(false);
    applier.runtime().set_read_only(!(is_master || all_rw));

    // Reconfigure sharding only when the derived map actually changed.
    let sharding = topology::get_vshard_sharding_config(view.topology(), &masters);
    if let Some(storage) = applier.services().vshard_storage() {
        let installed = storage.current_cfg();
        if installed.as_ref().map(|c| &c.sharding) != Some(&sharding) {
            let opts = StorageOpts {
                sharding: sharding.clone(),
                bucket_count: view.vshard().bucket_count,
                listen: settings.advertise_uri.clone(),
            };
            if let Err(e) = storage.cfg(opts) {
                tracing::warn!("{}", Error::Failover(format!("vshard-storage: {}", e)));
            }
        }
    }
    if let Some(router) = applier.services().vshard_router() {
        let installed = router.current_cfg();
        if installed.as_ref().map(|c| &c.sharding) != Some(&sharding) {
            let opts = RouterOpts {
                sharding: sharding.clone(),
                bucket_count: view.vshard().bucket_count,
            };
            if let Err(e) = router.cfg(opts) {
                tracing::warn!("{}", Error::Failover(format!("vshard-router: {}", e)));
            }
        }
    }

    // Re-run the hooks of every installed role.
    let ctx = RoleContext { is_master };
    for (name, role) in applier.services().installed_roles() {
        match applier.registry().validate_role(&role, &view, Some(&view)) {
            Ok(()) => {
                if let Err(e) = role.apply_config(&view, &ctx) {
                    tracing::warn!(
                        "{}",
                        Error::Failover(format!("role {:?} apply_config: {}", name, e))
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "{}",
                    Error::Failover(format!("role {:?} validate_config: {}", name, e))
                );
            }
        }
    }
}
