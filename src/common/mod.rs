//! Common types shared across clusterconf

pub mod error;
pub mod settings;

pub use error::{Error, Result};
pub use settings::{
    InstanceSettings, ACTIVE_CONFIG_FILE, BACKUP_CONFIG_FILE, PREPARE_CONFIG_FILE,
};
