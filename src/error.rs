//! Error types for the invocation runtime.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during service registration and invocation.
///
/// Registration and contract-validation errors surface synchronously from
/// the registry API. Invocation-path errors (routing, timeout, endpoint
/// loss, shutdown, application failures) surface only through the
/// [`ResponseHandle`](crate::dispatcher::ResponseHandle) a call returns.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A registration operation was handed no service instance.
    #[error("Service object can't be null.")]
    NullService,

    /// The same service instance was registered twice.
    #[error("service instance is already registered")]
    DuplicateService,

    /// Unregistration of an instance that was never registered.
    #[error("service instance is not registered")]
    NotFound,

    /// A service contract failed validation.
    #[error("invalid service contract: {0}")]
    InvalidContract(String),

    /// The proxy was invoked with a method name its contract doesn't declare.
    #[error("unknown method: {0}")]
    MethodNotFound(String),

    /// The router found zero candidate references for a definition.
    #[error("no reachable member for {0}")]
    NoReachableMember(String),

    /// The target member left the cluster with the call still in flight.
    #[error("endpoint {0} is no longer reachable")]
    EndpointUnavailable(String),

    /// The call's deadline expired. Carries the configured duration so
    /// callers can distinguish a slow callee from an unreachable one.
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The runtime was shut down with the call outstanding, or an operation
    /// was attempted after shutdown.
    #[error("runtime is shut down")]
    Shutdown,

    /// The remote method itself failed. The payload is opaque to the core
    /// and passed through unchanged.
    #[error("application error: {0}")]
    Application(String),

    /// The transport collaborator failed to hand off a message.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
