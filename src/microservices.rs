//! The runtime facade and composition root.
//!
//! [`Microservices`] wires the registry, dispatcher, transport, and cluster
//! collaborator together for one node. The [`Builder`] takes the service
//! instances to host and the seed addresses to join; `build` registers the
//! services, joins the network advertising their contracts, and spawns the
//! node loop that pumps membership events and inbound messages until
//! shutdown.
//!
//! Configuration contexts are handed out per call-site: `proxy()` and
//! `dispatcher()` each return a fresh context defaulting to round-robin
//! routing and the node's default timeout, reconfigurable independently of
//! every other context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterEvent, ClusterHandle, InprocNetwork};
use crate::definition::{ContractDescriptor, DefinitionCache, MethodKind, ServiceHandler};
use crate::dispatcher::Dispatcher;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{Result, ServiceError};
use crate::proxy::{DispatcherContext, ProxyContext};
use crate::registry::ServiceRegistry;
use crate::transport::{InprocTransport, Transport, TransportMessage};

/// Dispatch timeout used when a context doesn't configure its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for a [`Microservices`] node.
pub struct Builder {
    services: Vec<Arc<dyn ServiceHandler>>,
    seeds: Vec<String>,
    network: Option<Arc<InprocNetwork>>,
    default_timeout: Duration,
}

impl Builder {
    fn new() -> Self {
        Self {
            services: Vec::new(),
            seeds: Vec::new(),
            network: None,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Host a service instance on this node.
    pub fn service(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.services.push(handler);
        self
    }

    /// Host several service instances.
    pub fn services<I>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ServiceHandler>>,
    {
        self.services.extend(handlers);
        self
    }

    /// Add a seed address to join through.
    pub fn seed(mut self, address: impl Into<String>) -> Self {
        self.seeds.push(address.into());
        self
    }

    /// Add several seed addresses.
    pub fn seeds<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Join an existing in-process network instead of a private one.
    pub fn network(mut self, network: Arc<InprocNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Override the node-wide default dispatch timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register the services, join the cluster, and start the node loop.
    pub async fn build(self) -> Result<Microservices> {
        let network = self.network.unwrap_or_else(InprocNetwork::new);
        let cache = Arc::new(DefinitionCache::new());
        let registry = Arc::new(ServiceRegistry::new(Arc::clone(&cache)));
        for service in self.services {
            registry.register_local(Some(service))?;
        }

        let mut joined = network.join(registry.contracts(), &self.seeds)?;
        let transport: Arc<dyn Transport> =
            Arc::new(InprocTransport::new(Arc::clone(&network)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            joined.member.clone(),
        ));

        // Membership replayed at join is applied before the node goes live,
        // so seeded services are routable as soon as build returns.
        while let Ok(event) = joined.events.try_recv() {
            apply_cluster_event(&registry, &dispatcher, event);
        }

        let shutdown_signal = Arc::new(Notify::new());
        let loop_task = tokio::spawn(node_loop(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&transport),
            joined.events,
            joined.inbox,
            Arc::clone(&shutdown_signal),
        ));
        info!(
            "node {} up at {} hosting {} services",
            joined.member.id,
            joined.member.address,
            registry.count()
        );

        Ok(Microservices {
            cache,
            registry,
            dispatcher,
            cluster: ClusterHandle::new(joined.member, network),
            default_timeout: self.default_timeout,
            shutdown_signal,
            loop_task: Mutex::new(Some(loop_task)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// One microservices node: hosted services, cluster view, and the
/// invocation engine behind every proxy created from it.
pub struct Microservices {
    cache: Arc<DefinitionCache>,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<Dispatcher>,
    cluster: ClusterHandle,
    default_timeout: Duration,
    shutdown_signal: Arc<Notify>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Microservices {
    /// Start configuring a node.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Register a service instance after startup.
    ///
    /// The instance becomes invocable locally; contract advertisement to
    /// the cluster happens at join time, from the builder's service list.
    pub fn register_service(&self, service: Option<Arc<dyn ServiceHandler>>) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ServiceError::Shutdown);
        }
        self.registry.register_local(service)
    }

    /// Remove a service instance and all of its references.
    pub fn unregister_service(&self, service: Option<&Arc<dyn ServiceHandler>>) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ServiceError::Shutdown);
        }
        self.registry.unregister_local(service)
    }

    /// Count of distinct locally hosted service instances.
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Contracts of the locally hosted services.
    pub fn services(&self) -> Vec<ContractDescriptor> {
        self.registry.contracts()
    }

    /// This node's cluster view.
    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// A fresh proxy-creation context with default routing and timeout.
    pub fn proxy(&self) -> ProxyContext {
        ProxyContext::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.cache),
            self.default_timeout,
        )
    }

    /// A fresh low-level dispatch context with default routing and timeout.
    pub fn dispatcher(&self) -> DispatcherContext {
        DispatcherContext::new(Arc::clone(&self.dispatcher), self.default_timeout)
    }

    /// Tear the node down: drain in-flight calls with
    /// [`ServiceError::Shutdown`], leave the cluster, and stop the node
    /// loop. Idempotent; registration and dispatch fail afterwards.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down node {}", self.cluster.member().id);
        self.dispatcher.shutdown();
        self.cluster.leave();
        self.shutdown_signal.notify_one();
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn node_loop(
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
    mut inbox: mpsc::UnboundedReceiver<TransportMessage>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            Some(event) = events.recv() => {
                apply_cluster_event(&registry, &dispatcher, event);
            }

            Some(message) = inbox.recv() => {
                handle_transport_message(&registry, &dispatcher, &transport, message);
            }

            else => break,
        }
    }
    debug!("node loop stopped");
}

fn apply_cluster_event(
    registry: &Arc<ServiceRegistry>,
    dispatcher: &Arc<Dispatcher>,
    event: ClusterEvent,
) {
    match event {
        ClusterEvent::MemberJoined { member, contracts } => {
            registry.member_joined(&member, &contracts);
        }
        ClusterEvent::MemberLeft { member } => {
            registry.member_left(&member.id);
            dispatcher.fail_member(&member.id);
        }
    }
}

fn handle_transport_message(
    registry: &Arc<ServiceRegistry>,
    dispatcher: &Arc<Dispatcher>,
    transport: &Arc<dyn Transport>,
    message: TransportMessage,
) {
    match message {
        TransportMessage::Response(response) => dispatcher.complete(response),
        TransportMessage::Request(request) => {
            // Handlers may block on their own awaits; serve each request on
            // its own task so the node loop keeps draining.
            let registry = Arc::clone(registry);
            let transport = Arc::clone(transport);
            tokio::spawn(async move {
                serve_request(registry, transport, request).await;
            });
        }
    }
}

async fn serve_request(
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    request: RequestEnvelope,
) {
    let RequestEnvelope {
        request_id,
        sender,
        service,
        method,
        kind,
        payload,
    } = request;

    if kind == MethodKind::FireAndForget {
        match registry.handler_for(&service, &method) {
            Some(handler) => {
                if let Err(e) = handler.handle(&method, payload).await {
                    warn!("fire-and-forget {}/{} failed: {}", service, method, e);
                }
            }
            None => warn!("no local handler for {}/{}", service, method),
        }
        return;
    }

    let response = match registry.handler_for(&service, &method) {
        Some(handler) => match handler.handle(&method, payload).await {
            Ok(value) => ResponseEnvelope::success(request_id, value),
            Err(e) => ResponseEnvelope::failure(request_id, e.to_string()),
        },
        None => ResponseEnvelope::failure(
            request_id,
            format!("no local handler for {service}/{method}"),
        ),
    };
    if let Err(e) = transport
        .send(&sender, TransportMessage::Response(response))
        .await
    {
        warn!("failed to reply to {}: {}", sender, e);
    }
}
