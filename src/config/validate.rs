//! Clusterwide configuration validation
//!
//! Structural checks on the raw document, topology checks against the
//! current config, then every registered role's validation hook in
//! registration order. The first failure aborts.

use serde_yaml::Value;
use std::sync::Arc;

use crate::cluster::{
    roles::{Role, RoleRegistry},
    topology,
};
use crate::common::{Error, Result};
use crate::config::view::{ClusterConfig, ConfigView};

/// Validate a proposed document against the current configuration.
///
/// Returns the parsed config so callers do not parse twice.
pub fn validate(
    registry: &RoleRegistry,
    new_doc: &Value,
    old: Option<&ConfigView>,
) -> Result<ClusterConfig> {
    let mapping = new_doc
        .as_mapping()
        .ok_or_else(|| Error::ConfigValidate("configuration must be a mapping".into()))?;

    let vshard = mapping
        .get("vshard")
        .ok_or_else(|| Error::ConfigValidate("vshard section is missing".into()))?
        .as_mapping()
        .ok_or_else(|| Error::ConfigValidate("vshard section must be a mapping".into()))?;

    match vshard.get("bucket_count").and_then(Value::as_u64) {
        Some(count) if count > 0 => {}
        _ => {
            return Err(Error::ConfigValidate(
                "vshard.bucket_count must be a positive integer".into(),
            ));
        }
    }
    if vshard.get("bootstrapped").and_then(Value::as_bool).is_none() {
        return Err(Error::ConfigValidate(
            "vshard.bootstrapped must be a boolean".into(),
        ));
    }

    let conf = ClusterConfig::from_value(new_doc.clone())?;
    topology::validate(
        conf.topology(),
        old.map(|view| view.topology()),
        &registry.known_roles(),
    )?;

    let new_view = ConfigView::new(Arc::new(conf.clone()));
    for role in registry.roles() {
        if let Err(e) = registry.validate_role(&role, &new_view, old) {
            let reason = match e {
                Error::ConfigValidate(msg) => msg,
                other => other.to_string(),
            };
            return Err(Error::ConfigValidate(format!(
                "role {:?}: {}",
                role.name(),
                reason
            )));
        }
    }

    Ok(conf)
}
