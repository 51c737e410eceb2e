//! Database runtime contract
//!
//! The storage engine under the applier is external; this is the narrow
//! surface of knobs the apply pipeline tunes: the replication peer list and
//! the read-only flag. [`LocalRuntime`] records what was applied and backs
//! the node binary and the tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::common::Result;

#[async_trait]
pub trait DatabaseRuntime: Send + Sync {
    /// Install the ordered replication peer list for this instance.
    async fn reconfigure_replication(&self, uris: &[String]) -> Result<()>;

    /// Flip the instance between read-only replica and writable master.
    fn set_read_only(&self, read_only: bool);

    fn is_read_only(&self) -> bool;
}

/// In-process runtime recording the applied knobs.
pub struct LocalRuntime {
    replication: Mutex<Vec<String>>,
    read_only: AtomicBool,
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRuntime {
    /// Instances start read-only until the first apply decides otherwise.
    pub fn new() -> Self {
        Self {
            replication: Mutex::new(Vec::new()),
            read_only: AtomicBool::new(true),
        }
    }

    pub fn replication(&self) -> Vec<String> {
        self.replication.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseRuntime for LocalRuntime {
    async fn reconfigure_replication(&self, uris: &[String]) -> Result<()> {
        tracing::info!("Reconfiguring replication: {:?}", uris);
        *self.replication.lock().unwrap() = uris.to_vec();
        Ok(())
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}
