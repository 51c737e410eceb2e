//! Membership contract
//!
//! The gossip transport itself is out of scope; this module pins down the
//! surface the applier consumes: member enumeration, self identity, change
//! notifications, and the per-instance payload operators observe. The
//! in-process [`LocalMembership`] implementation backs the node binary and
//! the test suites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// Member liveness as reported by the gossip layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
}

impl MemberStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, MemberStatus::Alive)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Suspect => write!(f, "suspect"),
            MemberStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Payload gossiped alongside each member
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub ready: bool,
}

/// One membership entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub uri: String,
    pub status: MemberStatus,
    #[serde(default)]
    pub payload: MemberPayload,
}

impl Member {
    /// Alive and not reporting an apply error.
    pub fn is_healthy(&self) -> bool {
        self.status.is_alive() && self.payload.error.is_none()
    }
}

/// Surface of the gossip layer the applier consumes.
pub trait Membership: Send + Sync {
    /// All known members, self included.
    fn pairs(&self) -> Vec<Member>;

    /// This instance's own entry.
    fn myself(&self) -> Member;

    /// Change notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Publish a payload field on this instance's entry.
    fn set_payload(&self, key: &str, value: Option<serde_json::Value>);
}

/// Shared membership table, handed out as per-instance handles.
pub struct MembershipState {
    members: Mutex<BTreeMap<String, Member>>,
    generation: watch::Sender<u64>,
}

impl MembershipState {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(0);
        Arc::new(Self {
            members: Mutex::new(BTreeMap::new()),
            generation: tx,
        })
    }

    /// Handle for one instance, with `myself()` bound to `self_uri`.
    pub fn handle(self: &Arc<Self>, self_uri: impl Into<String>) -> Arc<LocalMembership> {
        let self_uri = self_uri.into();
        self.upsert(Member {
            uri: self_uri.clone(),
            status: MemberStatus::Alive,
            payload: MemberPayload::default(),
        });
        Arc::new(LocalMembership {
            state: self.clone(),
            self_uri,
        })
    }

    /// Insert or replace a member entry and wake subscribers.
    pub fn upsert(&self, member: Member) {
        self.members
            .lock()
            .unwrap()
            .insert(member.uri.clone(), member);
        self.notify();
    }

    /// Flip a member's liveness and wake subscribers.
    pub fn set_status(&self, uri: &str, status: MemberStatus) {
        if let Some(member) = self.members.lock().unwrap().get_mut(uri) {
            member.status = status;
        }
        self.notify();
    }

    pub fn get(&self, uri: &str) -> Option<Member> {
        self.members.lock().unwrap().get(uri).cloned()
    }

    fn notify(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// In-process membership handle for one instance.
pub struct LocalMembership {
    state: Arc<MembershipState>,
    self_uri: String,
}

impl LocalMembership {
    pub fn state(&self) -> &Arc<MembershipState> {
        &self.state
    }
}

impl Membership for LocalMembership {
    fn pairs(&self) -> Vec<Member> {
        self.state.members.lock().unwrap().values().cloned().collect()
    }

    fn myself(&self) -> Member {
        self.state.get(&self.self_uri).unwrap_or(Member {
            uri: self.self_uri.clone(),
            status: MemberStatus::Alive,
            payload: MemberPayload::default(),
        })
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.generation.subscribe()
    }

    fn set_payload(&self, key: &str, value: Option<serde_json::Value>) {
        {
            let mut members = self.state.members.lock().unwrap();
            let member = members.entry(self.self_uri.clone()).or_insert(Member {
                uri: self.self_uri.clone(),
                status: MemberStatus::Alive,
                payload: MemberPayload::default(),
            });
            match key {
                "uuid" => {
                    member.payload.uuid = value
                        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()));
                }
                "error" => {
                    member.payload.error =
                        value.and_then(|v| v.as_str().map(|s| s.to_string()));
                }
                "ready" => {
                    member.payload.ready =
                        value.and_then(|v| v.as_bool()).unwrap_or(false);
                }
                other => {
                    tracing::debug!("Ignoring unknown payload key {:?}", other);
                }
            }
        }
        self.state.notify();
    }
}
