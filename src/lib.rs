//! Microservices invocation runtime.
//!
//! This crate lets a process expose plain service implementations locally
//! and invoke them — in-process or across a cluster — through proxies that
//! look like ordinary asynchronous calls:
//! - a per-node [`registry`] tracks which service methods exist and where,
//!   reacting to cluster membership;
//! - pluggable [`routing`] strategies pick a target reference per call;
//! - the [`dispatcher`] turns a method call into a correlated
//!   request/response exchange with deadline handling;
//! - [`proxy`] contexts bind a router and timeout per call-site and
//!   materialize dispatch-table proxies for service contracts.
//!
//! Cluster membership and the transport are collaborators behind seams in
//! [`cluster`] and [`transport`]; in-process implementations of both are
//! included.
//!
//! # Example
//!
//! ```ignore
//! use cellmesh::prelude::*;
//!
//! let provider = Microservices::builder()
//!     .service(Arc::new(GreetingServiceImpl::default()))
//!     .build()
//!     .await?;
//!
//! let consumer = Microservices::builder()
//!     .network(network)
//!     .seed(provider.cluster().address())
//!     .build()
//!     .await?;
//!
//! let proxy = consumer.proxy()
//!     .timeout(Duration::from_secs(3))
//!     .api(&greeting_contract())?;
//! let reply = proxy.call("greeting", json!("hello")).await?;
//! ```

pub mod cluster;
pub mod definition;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod microservices;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod transport;

/// Prelude for convenient imports.
///
/// Re-exports the most commonly used types for `use cellmesh::prelude::*;`
pub mod prelude {
    pub use crate::cluster::{ClusterEvent, ClusterHandle, InprocNetwork, Member, MemberId};
    pub use crate::definition::{
        ContractDescriptor, DefinitionCache, MethodDescriptor, MethodKind, ServiceDefinition,
        ServiceHandler,
    };
    pub use crate::dispatcher::{Dispatcher, ResponseHandle};
    pub use crate::envelope::{RequestEnvelope, ResponseEnvelope};
    pub use crate::error::{Result, ServiceError};
    pub use crate::microservices::{Builder, Microservices, DEFAULT_TIMEOUT};
    pub use crate::proxy::{DispatcherContext, ProxyContext, ServiceProxy};
    pub use crate::registry::{Endpoint, ServiceReference, ServiceRegistry};
    pub use crate::routing::{RoundRobinRouter, Router, RouterKind, TagRouter};
    pub use crate::transport::{InprocTransport, Transport, TransportMessage};
}

// Re-export the facade at the crate root.
pub use error::{Result, ServiceError};
pub use microservices::Microservices;
