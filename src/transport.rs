//! Transport collaborator boundary.
//!
//! The dispatcher hands envelopes to a [`Transport`] and receives inbound
//! messages through the channel its node got when joining the cluster. A
//! transport send is fire-and-forget: delivery is at-most-once from the
//! core's perspective and no retry happens below this seam.
//!
//! [`InprocTransport`] routes messages over an
//! [`InprocNetwork`](crate::cluster::InprocNetwork); socket-based
//! transports plug in behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::cluster::{InprocNetwork, MemberId};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::Result;

/// A message crossing the transport boundary.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// An invocation headed for a remote member.
    Request(RequestEnvelope),
    /// A correlated reply headed back to the caller.
    Response(ResponseEnvelope),
}

/// Outbound half of the transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand a message off toward a member. Returns once the transport has
    /// accepted it; delivery is not acknowledged.
    async fn send(&self, to: &MemberId, message: TransportMessage) -> Result<()>;
}

/// Transport over an in-process cluster network.
pub struct InprocTransport {
    network: Arc<InprocNetwork>,
}

impl InprocTransport {
    /// Create a transport routing over the given network.
    pub fn new(network: Arc<InprocNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for InprocTransport {
    async fn send(&self, to: &MemberId, message: TransportMessage) -> Result<()> {
        trace!("delivering message to {}", to);
        self.network.deliver(to, message)
    }
}
