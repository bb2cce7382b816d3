//! Proxies and per-call-site configuration contexts.
//!
//! A [`ProxyContext`] binds a router variant and a timeout; [`api`]
//! materializes a [`ServiceProxy`] for a contract — the generic
//! dispatch-table stand-in for a generated client. Typed client adapters
//! are plain structs wrapping a proxy and forwarding each method through
//! [`ServiceProxy::call`], so no run-time reflection is involved anywhere.
//!
//! Contexts are cheap value objects; any number of them, with distinct
//! routers and timeouts, can coexist against one runtime. Two proxies are
//! never equal, even when created from identical configuration.
//!
//! [`api`]: ProxyContext::api

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::definition::{ContractDescriptor, DefinitionCache, MethodKind, ServiceDefinition};
use crate::dispatcher::{Dispatcher, ResponseHandle};
use crate::error::{Result, ServiceError};
use crate::routing::{Router, RouterKind};

/// Distinguishes proxy objects across the process lifetime.
static PROXY_IDS: AtomicU64 = AtomicU64::new(1);

/// Configuration context for low-level, definition-driven dispatch.
#[derive(Clone)]
pub struct DispatcherContext {
    dispatcher: Arc<Dispatcher>,
    router_kind: RouterKind,
    router: Arc<dyn Router>,
    timeout: Duration,
}

impl DispatcherContext {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, timeout: Duration) -> Self {
        let router_kind = RouterKind::RoundRobin;
        let router = router_kind.build();
        Self {
            dispatcher,
            router_kind,
            router,
            timeout,
        }
    }

    /// Replace the router variant. Resets the variant's selection state.
    pub fn router(mut self, kind: RouterKind) -> Self {
        self.router = kind.build();
        self.router_kind = kind;
        self
    }

    /// The configured router variant.
    pub fn router_kind(&self) -> &RouterKind {
        &self.router_kind
    }

    /// Replace the dispatch timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured dispatch timeout.
    pub fn configured_timeout(&self) -> Duration {
        self.timeout
    }

    /// Dispatch a call for an explicit definition.
    pub fn invoke(&self, definition: &ServiceDefinition, args: Value) -> ResponseHandle {
        self.dispatcher
            .invoke(definition, args, &self.router, self.timeout)
    }
}

/// Configuration context for creating typed proxies.
#[derive(Clone)]
pub struct ProxyContext {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<DefinitionCache>,
    router_kind: RouterKind,
    router: Arc<dyn Router>,
    timeout: Duration,
}

impl ProxyContext {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        cache: Arc<DefinitionCache>,
        timeout: Duration,
    ) -> Self {
        let router_kind = RouterKind::RoundRobin;
        let router = router_kind.build();
        Self {
            dispatcher,
            cache,
            router_kind,
            router,
            timeout,
        }
    }

    /// Replace the router variant. Resets the variant's selection state.
    pub fn router(mut self, kind: RouterKind) -> Self {
        self.router = kind.build();
        self.router_kind = kind;
        self
    }

    /// The configured router variant.
    pub fn router_kind(&self) -> &RouterKind {
        &self.router_kind
    }

    /// Replace the dispatch timeout bound into created proxies.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured dispatch timeout.
    pub fn configured_timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a call-through proxy for a contract, bound to this context's
    /// router and timeout. Proxies created from the same context share the
    /// router instance (and therefore its rotation state).
    pub fn api(&self, contract: &ContractDescriptor) -> Result<ServiceProxy> {
        let definitions = self.cache.describe(contract)?;
        Ok(ServiceProxy {
            id: PROXY_IDS.fetch_add(1, Ordering::Relaxed),
            service: contract.service.clone(),
            definitions,
            dispatcher: Arc::clone(&self.dispatcher),
            router: Arc::clone(&self.router),
            timeout: self.timeout,
        })
    }
}

/// Generic call-through object for one service contract.
///
/// Every invocation resolves its [`ServiceDefinition`] from the contract's
/// dispatch table and delegates to the dispatcher with the bound router and
/// timeout. A call always returns a handle; even "no such method" arrives
/// through it.
pub struct ServiceProxy {
    id: u64,
    service: String,
    definitions: Arc<HashMap<String, ServiceDefinition>>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn Router>,
    timeout: Duration,
}

impl ServiceProxy {
    /// The service name this proxy fronts.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke a request/response method.
    pub fn call(&self, method: &str, args: Value) -> ResponseHandle {
        match self.definitions.get(method) {
            Some(definition) => self
                .dispatcher
                .invoke(definition, args, &self.router, self.timeout),
            None => ResponseHandle::ready(Err(ServiceError::MethodNotFound(format!(
                "{}/{}",
                self.service, method
            )))),
        }
    }

    /// Invoke a fire-and-forget method. Fails synchronously if the method
    /// is unknown or declared request/response.
    pub fn call_oneway(&self, method: &str, args: Value) -> Result<()> {
        let definition = self.definitions.get(method).ok_or_else(|| {
            ServiceError::MethodNotFound(format!("{}/{}", self.service, method))
        })?;
        if definition.kind != MethodKind::FireAndForget {
            return Err(ServiceError::InvalidContract(format!(
                "method {} expects a response",
                definition.qualified_name()
            )));
        }
        let _completed = self
            .dispatcher
            .invoke(definition, args, &self.router, self.timeout);
        Ok(())
    }
}

impl PartialEq for ServiceProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceProxy {}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("id", &self.id)
            .field("service", &self.service)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Member, MemberId};
    use crate::definition::{MethodDescriptor, ServiceHandler};
    use crate::registry::ServiceRegistry;
    use crate::transport::{Transport, TransportMessage};
    use async_trait::async_trait;
    use serde_json::json;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _to: &MemberId, _message: TransportMessage) -> Result<()> {
            Ok(())
        }
    }

    struct Greeter;

    #[async_trait]
    impl ServiceHandler for Greeter {
        fn contract(&self) -> ContractDescriptor {
            ContractDescriptor::new("greeting")
                .method(MethodDescriptor::request_response("greeting"))
                .method(MethodDescriptor::fire_and_forget("greeting_void"))
        }

        async fn handle(&self, _method: &str, _args: Value) -> anyhow::Result<Value> {
            Ok(json!("DONE"))
        }
    }

    fn proxy_context() -> ProxyContext {
        let cache = Arc::new(DefinitionCache::new());
        let registry = Arc::new(ServiceRegistry::new(Arc::clone(&cache)));
        registry
            .register_local(Some(Arc::new(Greeter) as Arc<dyn ServiceHandler>))
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(NullTransport),
            Member {
                id: MemberId::new("cell-1"),
                address: "cell://local/1".to_owned(),
            },
        ));
        ProxyContext::new(dispatcher, cache, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn proxies_are_never_equal() {
        let context = proxy_context();
        let first = context.api(&Greeter.contract()).unwrap();
        let second = context.api(&Greeter.contract()).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn calls_flow_through_the_dispatch_table() {
        let context = proxy_context();
        let proxy = context.api(&Greeter.contract()).unwrap();
        assert_eq!(proxy.call("greeting", json!("joe")).await.unwrap(), json!("DONE"));
    }

    #[tokio::test]
    async fn unknown_methods_resolve_through_the_handle() {
        let context = proxy_context();
        let proxy = context.api(&Greeter.contract()).unwrap();
        let err = proxy.call("missing", json!(null)).await.unwrap_err();
        assert!(matches!(err, ServiceError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn oneway_calls_enforce_the_declared_kind() {
        let context = proxy_context();
        let proxy = context.api(&Greeter.contract()).unwrap();

        proxy.call_oneway("greeting_void", json!(null)).unwrap();
        let err = proxy.call_oneway("greeting", json!(null)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidContract(_)));
    }
}
