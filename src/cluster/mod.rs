//! Cluster runtime: the applier, its workers, and the sibling modules

pub mod applier;
pub mod apply;
pub mod failover;
pub mod fetch;
pub mod membership;
pub mod roles;
pub mod runtime;
pub mod sharding;
pub mod topology;
pub mod twopc;

pub use applier::Applier;
pub use apply::WorkerState;
pub use failover::FailoverState;
pub use fetch::fetch_from_membership;
pub use membership::{LocalMembership, Member, MemberPayload, MemberStatus, Membership, MembershipState};
pub use roles::{Role, RoleContext, RoleRegistry, Service, ServiceRegistry, VSHARD_ROUTER, VSHARD_STORAGE};
pub use runtime::{DatabaseRuntime, LocalRuntime};
pub use sharding::{RouterService, ShardingMap, StorageService};
pub use topology::{ReplicasetConfig, ServerConfig, ServerEntry, Topology};
pub use twopc::patch_clusterwide;
