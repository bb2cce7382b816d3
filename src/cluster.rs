//! Cluster membership collaborator boundary.
//!
//! The core consumes membership as a stream of [`ClusterEvent`]s: a member
//! joins advertising the contracts it hosts, or leaves. How those events are
//! produced (gossip, static config, an orchestrator) is outside the core.
//!
//! [`InprocNetwork`] is the in-process implementation of that boundary: a
//! shared node table that fans join/leave events out to every node and
//! routes transport messages between them. The network is an explicit
//! collaborator passed by handle, never a hidden global, so two runtimes
//! wired to different networks are fully isolated.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::definition::ContractDescriptor;
use crate::error::{Result, ServiceError};
use crate::transport::TransportMessage;

/// Opaque id of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Wrap a raw member id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live cluster member: id plus the address other nodes use as a seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member id.
    pub id: MemberId,
    /// Seed address, e.g. `cell://local/3`.
    pub address: String,
}

/// Membership event consumed by the registry and dispatcher.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A member joined, advertising the contracts it hosts.
    MemberJoined {
        member: Member,
        contracts: Vec<ContractDescriptor>,
    },
    /// A member left; every reference to it must be purged.
    MemberLeft { member: Member },
}

struct NodeEntry {
    member: Member,
    contracts: Vec<ContractDescriptor>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    inbox: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<MemberId, NodeEntry>,
    addresses: HashMap<String, MemberId>,
}

/// Channels handed to a node when it joins the network.
#[derive(Debug)]
pub(crate) struct JoinedNode {
    pub member: Member,
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
    pub inbox: mpsc::UnboundedReceiver<TransportMessage>,
}

/// In-process cluster: node table, membership fan-out, message routing.
///
/// Every node on the same network sees every other node; `seeds` are
/// validated against the node table on join. Existing membership is
/// replayed to a joining node as ordinary [`ClusterEvent::MemberJoined`]
/// events, so consumers have a single code path for "already there" and
/// "arrived later".
pub struct InprocNetwork {
    next_node: AtomicU64,
    state: RwLock<NetworkState>,
}

impl InprocNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_node: AtomicU64::new(1),
            state: RwLock::new(NetworkState::default()),
        })
    }

    /// Join the network, advertising the given contracts.
    ///
    /// With a non-empty seed list, at least one seed address must belong to
    /// a node already on the network.
    pub(crate) fn join(
        &self,
        contracts: Vec<ContractDescriptor>,
        seeds: &[String],
    ) -> Result<JoinedNode> {
        let n = self.next_node.fetch_add(1, Ordering::Relaxed);
        let member = Member {
            id: MemberId::new(format!("cell-{n}")),
            address: format!("cell://local/{n}"),
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let mut state = self.state.write();
        if !seeds.is_empty() {
            if !seeds.iter().any(|seed| state.addresses.contains_key(seed)) {
                return Err(ServiceError::Transport(format!(
                    "no reachable seed among {seeds:?}"
                )));
            }
            for seed in seeds {
                if !state.addresses.contains_key(seed) {
                    warn!("seed {} is not on the network, skipping", seed);
                }
            }
        }

        // Announce the newcomer, then replay the existing membership to it.
        for entry in state.nodes.values() {
            let _ = entry.events.send(ClusterEvent::MemberJoined {
                member: member.clone(),
                contracts: contracts.clone(),
            });
        }
        for entry in state.nodes.values() {
            let _ = event_tx.send(ClusterEvent::MemberJoined {
                member: entry.member.clone(),
                contracts: entry.contracts.clone(),
            });
        }

        state
            .addresses
            .insert(member.address.clone(), member.id.clone());
        state.nodes.insert(
            member.id.clone(),
            NodeEntry {
                member: member.clone(),
                contracts,
                events: event_tx,
                inbox: inbox_tx,
            },
        );
        debug!("member {} joined at {}", member.id, member.address);

        Ok(JoinedNode {
            member,
            events: event_rx,
            inbox: inbox_rx,
        })
    }

    /// Remove a node and notify everyone still on the network.
    pub(crate) fn leave(&self, member: &Member) {
        let mut state = self.state.write();
        if state.nodes.remove(&member.id).is_none() {
            return;
        }
        state.addresses.remove(&member.address);
        for entry in state.nodes.values() {
            let _ = entry.events.send(ClusterEvent::MemberLeft {
                member: member.clone(),
            });
        }
        debug!("member {} left", member.id);
    }

    /// Route a transport message to a member's inbox.
    pub(crate) fn deliver(&self, to: &MemberId, message: TransportMessage) -> Result<()> {
        let state = self.state.read();
        let entry = state
            .nodes
            .get(to)
            .ok_or_else(|| ServiceError::Transport(format!("unknown member {to}")))?;
        entry
            .inbox
            .send(message)
            .map_err(|_| ServiceError::Transport(format!("member {to} inbox is closed")))
    }

    /// Number of nodes currently on the network.
    pub fn member_count(&self) -> usize {
        self.state.read().nodes.len()
    }
}

/// A node's view of its own membership.
pub struct ClusterHandle {
    member: Member,
    network: Arc<InprocNetwork>,
}

impl ClusterHandle {
    pub(crate) fn new(member: Member, network: Arc<InprocNetwork>) -> Self {
        Self { member, network }
    }

    /// This node's member record.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// This node's seed address.
    pub fn address(&self) -> &str {
        &self.member.address
    }

    pub(crate) fn network(&self) -> &Arc<InprocNetwork> {
        &self.network
    }

    pub(crate) fn leave(&self) {
        self.network.leave(&self.member);
    }
}
