//! The request/response engine.
//!
//! Every outbound call moves through `CREATED → SENT → {COMPLETED | FAILED
//! | TIMED_OUT}`, realized by the lifecycle of its entry in the pending
//! table: the entry is created before send, and whichever of response
//! arrival, deadline expiry, member-departure fast-fail, or shutdown
//! removes the entry is the one resolution that reaches the caller. A
//! response with no matching entry — already resolved, already timed out —
//! is dropped, never an error.
//!
//! Local targets are invoked directly in-process, bypassing the transport
//! entirely, but still resolve through the same [`ResponseHandle`] so
//! callers cannot tell the difference.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::cluster::{Member, MemberId};
use crate::definition::{MethodKind, ServiceDefinition};
use crate::envelope::{RequestEnvelope, RequestIdGenerator, ResponseEnvelope};
use crate::error::{Result, ServiceError};
use crate::registry::{Endpoint, ServiceRegistry, ServiceReference};
use crate::routing::Router;
use crate::transport::{Transport, TransportMessage};

/// The asynchronous result of an invocation.
///
/// A proxy call always returns a handle; success, application failure,
/// timeout, endpoint loss, and shutdown all arrive through it. Dropping the
/// handle abandons the result but does not cancel the in-flight call.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

/// Single-use writer half of a [`ResponseHandle`]. First resolution wins;
/// there is no second writer by construction.
pub(crate) struct ResponseResolver {
    tx: oneshot::Sender<Result<Value>>,
}

impl ResponseResolver {
    pub(crate) fn resolve(self, result: Result<Value>) {
        // The caller may have abandoned the handle; that's fine.
        let _ = self.tx.send(result);
    }
}

impl ResponseHandle {
    pub(crate) fn pending() -> (ResponseResolver, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        (ResponseResolver { tx }, ResponseHandle { rx })
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(result: Result<Value>) -> ResponseHandle {
        let (resolver, handle) = Self::pending();
        resolver.resolve(result);
        handle
    }

    /// Await the result, but give up after `wait`. This wait bound is the
    /// caller's own and is distinct from the dispatch timeout: the call
    /// itself keeps running.
    pub async fn await_with(self, wait: Duration) -> Result<Value> {
        match time::timeout(wait, self).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout { elapsed: wait }),
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ServiceError::Shutdown)))
    }
}

struct PendingCall {
    resolver: ResponseResolver,
    target: MemberId,
    created_at: Instant,
    configured: Duration,
}

/// Correlates outbound requests with inbound responses, owns the pending
/// table, and enforces deadlines.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    local: Member,
    ids: RequestIdGenerator,
    pending: Mutex<HashMap<u64, PendingCall>>,
    shut_down: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher for the given node.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn Transport>,
        local: Member,
    ) -> Self {
        Self {
            registry,
            transport,
            local,
            ids: RequestIdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Dispatch a call to one reference chosen by the router.
    ///
    /// Never returns an error synchronously: routing failures, shutdown,
    /// and everything downstream resolve through the returned handle. The
    /// definition's timeout override, when present, beats `timeout`.
    pub fn invoke(
        self: &Arc<Self>,
        definition: &ServiceDefinition,
        args: Value,
        router: &Arc<dyn Router>,
        timeout: Duration,
    ) -> ResponseHandle {
        if self.shut_down.load(Ordering::SeqCst) {
            return ResponseHandle::ready(Err(ServiceError::Shutdown));
        }
        let candidates = self.registry.lookup(definition);
        let target = match router.route(definition, &candidates) {
            Ok(target) => target,
            Err(e) => return ResponseHandle::ready(Err(e)),
        };
        let configured = definition.timeout_override.unwrap_or(timeout);
        match definition.kind {
            MethodKind::FireAndForget => self.dispatch_oneway(definition, args, target),
            MethodKind::RequestResponse => {
                self.dispatch_call(definition, args, target, configured)
            }
        }
    }

    fn dispatch_oneway(
        self: &Arc<Self>,
        definition: &ServiceDefinition,
        args: Value,
        target: ServiceReference,
    ) -> ResponseHandle {
        match target.endpoint {
            Endpoint::Local { instance } => {
                if let Some(handler) = self.registry.local_handler(instance) {
                    let method = definition.method.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(&method, args).await {
                            warn!("fire-and-forget {} failed locally: {}", method, e);
                        }
                    });
                } else {
                    warn!(
                        "local instance for {} vanished before dispatch",
                        definition.qualified_name()
                    );
                }
            }
            Endpoint::Remote(member) => {
                let envelope = self.request_envelope(self.ids.next_id(), definition, args);
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    if let Err(e) = transport
                        .send(&member, TransportMessage::Request(envelope))
                        .await
                    {
                        warn!("fire-and-forget send to {} failed: {}", member, e);
                    }
                });
            }
        }
        // No correlation entry, no response: the handle is empty success.
        ResponseHandle::ready(Ok(Value::Null))
    }

    fn dispatch_call(
        self: &Arc<Self>,
        definition: &ServiceDefinition,
        args: Value,
        target: ServiceReference,
        configured: Duration,
    ) -> ResponseHandle {
        let (resolver, handle) = ResponseHandle::pending();
        match target.endpoint {
            Endpoint::Local { instance } => {
                let Some(handler) = self.registry.local_handler(instance) else {
                    resolver.resolve(Err(ServiceError::NoReachableMember(
                        definition.qualified_name(),
                    )));
                    return handle;
                };
                let method = definition.method.clone();
                tokio::spawn(async move {
                    let result = match time::timeout(configured, handler.handle(&method, args))
                        .await
                    {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(ServiceError::Application(e.to_string())),
                        Err(_) => Err(ServiceError::Timeout {
                            elapsed: configured,
                        }),
                    };
                    resolver.resolve(result);
                });
            }
            Endpoint::Remote(member) => {
                let request_id = self.ids.next_id();
                let envelope = self.request_envelope(request_id, definition, args);
                self.pending.lock().insert(
                    request_id,
                    PendingCall {
                        resolver,
                        target: member.clone(),
                        created_at: Instant::now(),
                        configured,
                    },
                );
                trace!(
                    "request {} for {} routed to {}",
                    request_id,
                    definition.qualified_name(),
                    member
                );

                let dispatcher = Arc::clone(self);
                let send_to = member.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher
                        .transport
                        .send(&send_to, TransportMessage::Request(envelope))
                        .await
                    {
                        dispatcher.resolve(request_id, Err(e));
                    }
                });

                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    time::sleep(configured).await;
                    dispatcher.expire(request_id);
                });
            }
        }
        handle
    }

    /// Correlate an inbound response. Unmatched responses are dropped.
    pub fn complete(&self, response: ResponseEnvelope) {
        match self.take(response.request_id) {
            Some(call) => {
                trace!(
                    "request {} resolved after {:?}",
                    response.request_id,
                    call.created_at.elapsed()
                );
                call.resolver.resolve(response.into_result());
            }
            None => trace!(
                "dropping orphaned response for request {}",
                response.request_id
            ),
        }
    }

    /// Fast-fail every pending call targeting a departed member.
    pub fn fail_member(&self, member: &MemberId) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.target == *member)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(
            "failing {} in-flight calls to departed member {}",
            drained.len(),
            member
        );
        for call in drained {
            call.resolver
                .resolve(Err(ServiceError::EndpointUnavailable(member.to_string())));
        }
    }

    /// Drain every pending call with [`ServiceError::Shutdown`] and refuse
    /// further dispatch. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        if !drained.is_empty() {
            debug!("cancelling {} in-flight calls at shutdown", drained.len());
        }
        for call in drained {
            call.resolver.resolve(Err(ServiceError::Shutdown));
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn take(&self, request_id: u64) -> Option<PendingCall> {
        self.pending.lock().remove(&request_id)
    }

    fn resolve(&self, request_id: u64, result: Result<Value>) {
        if let Some(call) = self.take(request_id) {
            call.resolver.resolve(result);
        }
    }

    fn expire(&self, request_id: u64) {
        if let Some(call) = self.take(request_id) {
            debug!(
                "request {} timed out after {:?}",
                request_id, call.configured
            );
            call.resolver.resolve(Err(ServiceError::Timeout {
                elapsed: call.configured,
            }));
        }
    }

    fn request_envelope(
        &self,
        request_id: u64,
        definition: &ServiceDefinition,
        args: Value,
    ) -> RequestEnvelope {
        RequestEnvelope {
            request_id,
            sender: self.local.id.clone(),
            service: definition.service.clone(),
            method: definition.method.clone(),
            kind: definition.kind,
            payload: args,
        }
    }
}
