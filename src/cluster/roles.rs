//! Role registry and service registry
//!
//! A role is a pluggable module with lifecycle hooks, enabled per
//! replicaset. Registration order is preserved and defines apply order.
//! The two built-in sharding pseudo-roles are always known and always come
//! first. The service registry maps role names to the live handler objects
//! currently running on this instance.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::cluster::sharding::{RouterService, StorageService};
use crate::common::{Error, Result};
use crate::config::view::ConfigView;

pub const VSHARD_STORAGE: &str = "vshard-storage";
pub const VSHARD_ROUTER: &str = "vshard-router";

/// Built-in pseudo-roles, applied before any user role.
pub static BUILTIN_ROLES: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec![VSHARD_STORAGE, VSHARD_ROUTER]);

/// Context handed to role lifecycle hooks
#[derive(Debug, Clone, Copy)]
pub struct RoleContext {
    pub is_master: bool,
}

/// A pluggable role. Every hook has a no-op default.
pub trait Role: Send + Sync {
    fn name(&self) -> &str;

    /// Check a proposed config before it is prepared anywhere.
    fn validate_config(&self, new: &ConfigView, old: Option<&ConfigView>) -> Result<()> {
        let _ = (new, old);
        Ok(())
    }

    /// Pre-`validate_config` hook kept for old roles. Returning `Some`
    /// marks the role as legacy; a deprecation warning is logged once per
    /// role per process.
    fn legacy_validate(&self, new: &ConfigView, old: Option<&ConfigView>) -> Option<Result<()>> {
        let _ = (new, old);
        None
    }

    /// Called once when the role becomes enabled on this instance.
    fn init(&self, ctx: &RoleContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called on every config apply while the role is enabled.
    fn apply_config(&self, conf: &ConfigView, ctx: &RoleContext) -> Result<()> {
        let _ = (conf, ctx);
        Ok(())
    }

    /// Called once when the role becomes disabled on this instance.
    fn stop(&self, ctx: &RoleContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Ordered registry of user roles.
pub struct RoleRegistry {
    roles: Mutex<Vec<Arc<dyn Role>>>,
    legacy_warned: Mutex<BTreeSet<String>>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self {
            roles: Mutex::new(Vec::new()),
            legacy_warned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register a role. Fails on a name collision, leaving the registry
    /// unchanged.
    pub fn register(&self, role: Arc<dyn Role>) -> Result<()> {
        let name = role.name().to_string();
        if BUILTIN_ROLES.contains(&name.as_str()) {
            return Err(Error::RegisterRole(format!("role {:?} is built in", name)));
        }

        let mut roles = self.roles.lock().unwrap();
        if roles.iter().any(|r| r.name() == name) {
            return Err(Error::RegisterRole(format!(
                "role {:?} is already registered",
                name
            )));
        }

        tracing::info!("Registered role {:?}", name);
        roles.push(role);
        Ok(())
    }

    /// Registered roles in registration order.
    pub fn roles(&self) -> Vec<Arc<dyn Role>> {
        self.roles.lock().unwrap().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Role>> {
        self.roles
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    /// All known role names: the built-ins first, then registered roles in
    /// registration order.
    pub fn known_roles(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_ROLES.iter().map(|s| s.to_string()).collect();
        names.extend(self.roles.lock().unwrap().iter().map(|r| r.name().to_string()));
        names
    }

    /// Dispatch a role's validation hook, honouring the legacy form.
    pub fn validate_role(
        &self,
        role: &Arc<dyn Role>,
        new: &ConfigView,
        old: Option<&ConfigView>,
    ) -> Result<()> {
        if let Some(result) = role.legacy_validate(new, old) {
            if self
                .legacy_warned
                .lock()
                .unwrap()
                .insert(role.name().to_string())
            {
                tracing::warn!(
                    "Role {:?} uses the deprecated validate hook, implement validate_config instead",
                    role.name()
                );
            }
            return result;
        }
        role.validate_config(new, old)
    }
}

/// A live handler installed on this instance.
#[derive(Clone)]
pub enum Service {
    Role(Arc<dyn Role>),
    VshardStorage(Arc<StorageService>),
    VshardRouter(Arc<RouterService>),
}

/// Process-local mapping from role name to its live handler.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, service: Service) {
        self.services.lock().unwrap().insert(name.to_string(), service);
    }

    pub fn get(&self, name: &str) -> Option<Service> {
        self.services.lock().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        self.services.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.lock().unwrap().contains_key(name)
    }

    pub fn vshard_storage(&self) -> Option<Arc<StorageService>> {
        match self.get(VSHARD_STORAGE) {
            Some(Service::VshardStorage(s)) => Some(s),
            _ => None,
        }
    }

    pub fn vshard_router(&self) -> Option<Arc<RouterService>> {
        match self.get(VSHARD_ROUTER) {
            Some(Service::VshardRouter(r)) => Some(r),
            _ => None,
        }
    }

    /// Installed user roles, by name.
    pub fn installed_roles(&self) -> Vec<(String, Arc<dyn Role>)> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(name, service)| match service {
                Service::Role(role) => Some((name.clone(), role.clone())),
                _ => None,
            })
            .collect()
    }
}
