//! Configuration document handling: the on-disk store, validation, and views

pub mod store;
pub mod validate;
pub mod view;

pub use validate::validate;
pub use view::{ClusterConfig, ConfigView, VshardConfig};
