//! Request/response envelopes and request-id generation.
//!
//! Every remote invocation is wrapped in a [`RequestEnvelope`] carrying a
//! unique request id for correlation, the sender's member id for the reply
//! path, and the serialized method arguments. Responses travel back as
//! [`ResponseEnvelope`]s correlated by the same id. The concrete wire
//! encoding underneath is the transport collaborator's concern; envelopes
//! are plain serde values.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::MemberId;
use crate::definition::MethodKind;
use crate::error::{Result, ServiceError};

/// Monotonic request-id source, scoped to one dispatcher instance.
///
/// Ids start at 1 and never repeat for the lifetime of the instance, so an
/// outstanding call can never collide with a later one.
#[derive(Debug)]
pub struct RequestIdGenerator(AtomicU64);

impl RequestIdGenerator {
    /// Create a generator starting at id 1.
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Take the next unique request id.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound invocation on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique id used to correlate the response.
    pub request_id: u64,
    /// Member to reply to.
    pub sender: MemberId,
    /// Target service name.
    pub service: String,
    /// Target method name.
    pub method: String,
    /// Return kind of the method; fire-and-forget requests expect no reply.
    pub kind: MethodKind,
    /// Serialized method arguments.
    pub payload: Value,
}

/// Outcome half of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    /// The method returned a value.
    Success(Value),
    /// The method failed; the message is opaque application payload.
    Failure(String),
}

/// A correlated reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the request this responds to.
    pub request_id: u64,
    /// Success or failure payload.
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// Build a success response.
    pub fn success(request_id: u64, value: Value) -> Self {
        Self {
            request_id,
            body: ResponseBody::Success(value),
        }
    }

    /// Build a failure response carrying an opaque application error.
    pub fn failure(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            body: ResponseBody::Failure(message.into()),
        }
    }

    /// Convert the body into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        match self.body {
            ResponseBody::Success(value) => Ok(value),
            ResponseBody::Failure(message) => Err(ServiceError::Application(message)),
        }
    }
}
