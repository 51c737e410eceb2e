//! Process-wide applier state
//!
//! One [`Applier`] per process bundles the active config, the workdir, the
//! role and service registries, the clusterwide lock, and the worker
//! handles. Every public operation and every RPC endpoint goes through it.

use serde_yaml::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cluster::apply::{self, ApplyRequest, WorkerState};
use crate::cluster::failover::{FailoverHandle, FailoverState};
use crate::cluster::membership::Membership;
use crate::cluster::roles::{RoleRegistry, ServiceRegistry};
use crate::cluster::runtime::DatabaseRuntime;
use crate::common::{Error, InstanceSettings, Result};
use crate::config::store;
use crate::config::validate;
use crate::config::view::{ClusterConfig, ConfigView};
use crate::rpc::Pool;

pub struct Applier {
    settings: InstanceSettings,
    registry: Arc<RoleRegistry>,
    services: Arc<ServiceRegistry>,
    membership: Arc<dyn Membership>,
    pool: Arc<dyn Pool>,
    runtime: Arc<dyn DatabaseRuntime>,

    active: Mutex<Option<Arc<ClusterConfig>>>,
    is_master: AtomicBool,
    clusterwide_busy: AtomicBool,

    apply_tx: mpsc::Sender<ApplyRequest>,
    worker_rx: Mutex<Option<mpsc::Receiver<ApplyRequest>>>,
    worker_state: watch::Sender<WorkerState>,
    failover: Mutex<Option<FailoverHandle>>,
}

impl Applier {
    /// Build the applier and start its worker.
    pub fn new(
        settings: InstanceSettings,
        registry: Arc<RoleRegistry>,
        membership: Arc<dyn Membership>,
        pool: Arc<dyn Pool>,
        runtime: Arc<dyn DatabaseRuntime>,
    ) -> Arc<Self> {
        // Capacity 1: the producer blocks until the worker is consuming.
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let (worker_state, _) = watch::channel(WorkerState::Starting);

        let applier = Arc::new(Self {
            settings,
            registry,
            services: Arc::new(ServiceRegistry::new()),
            membership,
            pool,
            runtime,
            active: Mutex::new(None),
            is_master: AtomicBool::new(false),
            clusterwide_busy: AtomicBool::new(false),
            apply_tx,
            worker_rx: Mutex::new(Some(apply_rx)),
            worker_state,
            failover: Mutex::new(None),
        });

        apply::spawn_worker(&applier);
        applier
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn runtime(&self) -> &Arc<dyn DatabaseRuntime> {
        &self.runtime
    }

    /// Was this instance the active master of its replicaset at the last
    /// apply or failover step?
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub(crate) fn set_is_master(&self, is_master: bool) {
        self.is_master.store(is_master, Ordering::SeqCst);
    }

    // === View layer ===

    /// Read-only handle over the active config, if any.
    pub fn get_readonly(&self) -> Option<ConfigView> {
        self.active
            .lock()
            .unwrap()
            .clone()
            .map(ConfigView::new)
    }

    /// Independently owned copy of the active document.
    pub fn get_deepcopy(&self) -> Option<Value> {
        self.get_readonly().map(|view| view.deepcopy())
    }

    /// Independently owned copy of one top-level section.
    pub fn get_deepcopy_section(&self, name: &str) -> Option<Value> {
        self.get_readonly().and_then(|view| view.section_deepcopy(name))
    }

    pub(crate) fn install_active(&self, conf: Arc<ClusterConfig>) {
        *self.active.lock().unwrap() = Some(conf);
    }

    // === Local apply ===

    /// Block until the applier worker is consuming requests.
    pub async fn wait_worker_ready(&self) -> Result<()> {
        let mut rx = self.worker_state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                WorkerState::Ready => return Ok(()),
                WorkerState::Dead => {
                    return Err(Error::ConfigApply("applier worker is dead".into()));
                }
                WorkerState::Starting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::ConfigApply("applier worker is dead".into()));
            }
        }
    }

    /// Persist an already-validated config and run the local apply pipeline.
    pub async fn apply(&self, conf: ClusterConfig) -> Result<()> {
        self.wait_worker_ready().await?;
        store::save(&self.settings.active_path(), conf.doc())?;
        self.submit(conf).await
    }

    /// Validate a raw document against the current config, then apply it.
    pub async fn validate_and_apply(&self, doc: Value) -> Result<()> {
        let conf = validate::validate(&self.registry, &doc, self.get_readonly().as_ref())?;
        self.apply(conf).await
    }

    /// Hand a config to the worker and wait for the pipeline outcome.
    pub(crate) async fn submit(&self, conf: ClusterConfig) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyRequest { conf, done })
            .await
            .map_err(|_| Error::ConfigApply("applier worker is dead".into()))?;
        done_rx
            .await
            .map_err(|_| Error::ConfigApply("applier worker is dead".into()))?
    }

    pub(crate) fn take_worker_rx(&self) -> Option<mpsc::Receiver<ApplyRequest>> {
        self.worker_rx.lock().unwrap().take()
    }

    pub(crate) fn set_worker_state(&self, state: WorkerState) {
        let _ = self.worker_state.send_replace(state);
    }

    // === Remote endpoints (wire contract) ===

    /// `load_from_file`: the active config as persisted on disk.
    pub fn load_from_file(&self) -> Result<Value> {
        store::load(&self.settings.active_path())
    }

    /// `prepare_2pc`: validate the proposed config and take the on-disk
    /// prepare lock.
    pub async fn prepare_2pc(&self, doc: Value) -> Result<()> {
        tracing::info!("Preparing clusterwide config");
        validate::validate(&self.registry, &doc, self.get_readonly().as_ref())?;
        store::write_exclusive(&self.settings.prepare_path(), &doc)
    }

    /// `commit_2pc`: move the prepared config into place and apply it.
    pub async fn commit_2pc(&self) -> Result<()> {
        let prepare = self.settings.prepare_path();
        if !prepare.exists() {
            return Err(Error::ConfigApply(format!(
                "{} does not exist",
                prepare.display()
            )));
        }

        store::promote(
            &prepare,
            &self.settings.active_path(),
            &self.settings.backup_path(),
        )?;

        let doc = store::load(&self.settings.active_path())?;
        let conf = ClusterConfig::from_value(doc)?;
        self.wait_worker_ready().await?;
        self.submit(conf).await
    }

    /// `abort_2pc`: drop the prepare lock. Idempotent.
    pub fn abort_2pc(&self) -> Result<()> {
        store::unlink(&self.settings.prepare_path())
    }

    /// `validate_config`: check a proposed config without persisting it.
    pub fn validate_config_remote(&self, doc: &Value) -> Result<()> {
        validate::validate(&self.registry, doc, self.get_readonly().as_ref()).map(|_| ())
    }

    /// `apply_config`: validate and apply in one step (older protocol form).
    pub async fn apply_config_remote(&self, doc: Value) -> Result<()> {
        self.validate_and_apply(doc).await
    }

    // === Clusterwide lock ===

    /// Take the local 2PC lock, or fail immediately when a round started on
    /// this instance is still in flight.
    pub(crate) fn try_lock_clusterwide(&self) -> Result<ClusterwideGuard<'_>> {
        if self
            .clusterwide_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Atomic);
        }
        Ok(ClusterwideGuard {
            flag: &self.clusterwide_busy,
        })
    }

    // === Failover worker control ===

    pub(crate) fn ensure_failover(self: &Arc<Self>) {
        let mut slot = self.failover.lock().unwrap();
        let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            *slot = Some(crate::cluster::failover::spawn(self));
        }
    }

    pub(crate) fn stop_failover(&self) {
        if let Some(handle) = self.failover.lock().unwrap().take() {
            handle.cancel();
        }
    }

    /// Observe the failover worker's state machine, if the worker exists.
    pub fn failover_state(&self) -> Option<watch::Receiver<FailoverState>> {
        self.failover
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.state())
    }
}

/// Released on drop; contention is rejected, never queued.
#[derive(Debug)]
pub(crate) struct ClusterwideGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ClusterwideGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::MembershipState;
    use crate::cluster::runtime::LocalRuntime;
    use crate::rpc::LoopbackPool;

    fn test_applier(dir: &std::path::Path) -> Arc<Applier> {
        let settings = InstanceSettings::new(uuid::Uuid::new_v4(), "localhost:3301", dir);
        let membership = MembershipState::new().handle("localhost:3301");
        Applier::new(
            settings,
            Arc::new(RoleRegistry::new()),
            membership,
            LoopbackPool::new(),
            Arc::new(LocalRuntime::new()),
        )
    }

    #[tokio::test]
    async fn test_clusterwide_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());

        let guard = applier.try_lock_clusterwide().unwrap();
        assert!(matches!(
            applier.try_lock_clusterwide().unwrap_err(),
            Error::Atomic
        ));

        drop(guard);
        applier.try_lock_clusterwide().unwrap();
    }

    #[tokio::test]
    async fn test_apply_fails_fast_when_worker_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());
        applier.wait_worker_ready().await.unwrap();

        applier.set_worker_state(WorkerState::Dead);
        let doc = serde_yaml::from_str(
            "topology:\n  servers: {}\n  replicasets: {}\nvshard:\n  bucket_count: 1\n  bootstrapped: false\n",
        )
        .unwrap();
        let conf = ClusterConfig::from_value(doc).unwrap();
        let err = applier.apply(conf).await.unwrap_err();
        assert!(err.to_string().contains("worker is dead"));
    }

    #[tokio::test]
    async fn test_views_absent_before_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let applier = test_applier(dir.path());
        assert!(applier.get_readonly().is_none());
        assert!(applier.get_deepcopy().is_none());
    }
}
