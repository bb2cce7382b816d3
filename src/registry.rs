//! Service registry: which methods exist, and where.
//!
//! The registry owns two things under one lock: the set of locally
//! registered service instances, and a multimap from method definition to
//! the [`ServiceReference`]s that can serve it — local instances and remote
//! cluster members alike. Membership events add and purge remote
//! references; `lookup` hands out cloned snapshots so readers never hold
//! the lock while routing or dispatching.
//!
//! One registry exists per runtime instance. It is never shared process-wide.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cluster::{Member, MemberId};
use crate::definition::{ContractDescriptor, DefinitionCache, ServiceDefinition, ServiceHandler};
use crate::error::{Result, ServiceError};

/// Where a service reference can be invoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A local instance, identified by its registration id. Multiple local
    /// instances of the same contract get distinct ids.
    Local { instance: u64 },
    /// A remote cluster member.
    Remote(MemberId),
}

impl Endpoint {
    /// Whether this endpoint is served in-process.
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local { instance } => write!(f, "local#{instance}"),
            Endpoint::Remote(member) => write!(f, "{member}"),
        }
    }
}

/// A (definition, endpoint) pairing: one place a method is servable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReference {
    /// The method this reference serves.
    pub definition: ServiceDefinition,
    /// Where it is served.
    pub endpoint: Endpoint,
    /// Tags for affinity routing, from the hosting contract.
    pub tags: BTreeMap<String, String>,
}

struct LocalService {
    instance: u64,
    handler: Arc<dyn ServiceHandler>,
    contract: ContractDescriptor,
    definitions: Vec<ServiceDefinition>,
}

#[derive(Default)]
struct RegistryState {
    locals: Vec<LocalService>,
    references: HashMap<String, Vec<ServiceReference>>,
}

/// Per-runtime registry of local instances and known references.
pub struct ServiceRegistry {
    definitions: Arc<DefinitionCache>,
    next_instance: AtomicU64,
    state: RwLock<RegistryState>,
}

impl ServiceRegistry {
    /// Create a registry backed by the given definition cache.
    pub fn new(definitions: Arc<DefinitionCache>) -> Self {
        Self {
            definitions,
            next_instance: AtomicU64::new(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register a local service instance.
    ///
    /// Derives the instance's definitions through the cache and inserts one
    /// local reference per method. Registering the same instance twice is
    /// an error; a second, distinct instance of the same contract is fine
    /// and yields additional references.
    pub fn register_local(&self, service: Option<Arc<dyn ServiceHandler>>) -> Result<()> {
        let handler = service.ok_or(ServiceError::NullService)?;
        let contract = handler.contract();
        let derived = self.definitions.describe(&contract)?;

        let mut state = self.state.write();
        if state
            .locals
            .iter()
            .any(|local| Arc::ptr_eq(&local.handler, &handler))
        {
            return Err(ServiceError::DuplicateService);
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        // Walk the declared method order so reference ordering stays stable.
        let mut definitions = Vec::with_capacity(contract.methods.len());
        for method in &contract.methods {
            let Some(definition) = derived.get(&method.name) else {
                continue;
            };
            if definitions.contains(definition) {
                continue;
            }
            state
                .references
                .entry(definition.qualified_name())
                .or_default()
                .push(ServiceReference {
                    definition: definition.clone(),
                    endpoint: Endpoint::Local { instance },
                    tags: contract.tags.clone(),
                });
            definitions.push(definition.clone());
        }
        debug!(
            "registered local service {} with {} methods",
            contract.service,
            definitions.len()
        );
        state.locals.push(LocalService {
            instance,
            handler,
            contract,
            definitions,
        });
        Ok(())
    }

    /// Remove a local instance and every reference rooted at it.
    pub fn unregister_local(&self, service: Option<&Arc<dyn ServiceHandler>>) -> Result<()> {
        let handler = service.ok_or(ServiceError::NullService)?;

        let mut state = self.state.write();
        let position = state
            .locals
            .iter()
            .position(|local| Arc::ptr_eq(&local.handler, handler))
            .ok_or(ServiceError::NotFound)?;
        let local = state.locals.remove(position);
        let endpoint = Endpoint::Local {
            instance: local.instance,
        };
        for definition in &local.definitions {
            let key = definition.qualified_name();
            if let Some(references) = state.references.get_mut(&key) {
                references.retain(|reference| reference.endpoint != endpoint);
                if references.is_empty() {
                    state.references.remove(&key);
                }
            }
        }
        debug!("unregistered local service {}", local.contract.service);
        Ok(())
    }

    /// React to a member joining: add remote references for each advertised
    /// contract. A contract that fails validation is skipped, not fatal.
    pub fn member_joined(&self, member: &Member, contracts: &[ContractDescriptor]) {
        let mut state = self.state.write();
        for contract in contracts {
            let derived = match self.definitions.describe(contract) {
                Ok(derived) => derived,
                Err(e) => {
                    warn!(
                        "skipping contract {} advertised by {}: {}",
                        contract.service, member.id, e
                    );
                    continue;
                }
            };
            for method in &contract.methods {
                let Some(definition) = derived.get(&method.name) else {
                    continue;
                };
                let references = state
                    .references
                    .entry(definition.qualified_name())
                    .or_default();
                let endpoint = Endpoint::Remote(member.id.clone());
                if references.iter().any(|r| r.endpoint == endpoint) {
                    continue;
                }
                references.push(ServiceReference {
                    definition: definition.clone(),
                    endpoint,
                    tags: contract.tags.clone(),
                });
            }
        }
        debug!("registered contracts of member {}", member.id);
    }

    /// React to a member leaving: purge every reference to it. Returns the
    /// number of references removed.
    pub fn member_left(&self, member: &MemberId) -> usize {
        let mut state = self.state.write();
        let mut purged = 0;
        state.references.retain(|_, references| {
            let before = references.len();
            references.retain(|r| r.endpoint != Endpoint::Remote(member.clone()));
            purged += before - references.len();
            !references.is_empty()
        });
        if purged > 0 {
            debug!("purged {} references of departed member {}", purged, member);
        }
        purged
    }

    /// Snapshot of the references serving a definition, in registration
    /// order. Safe to call concurrently with mutation.
    pub fn lookup(&self, definition: &ServiceDefinition) -> Vec<ServiceReference> {
        self.state
            .read()
            .references
            .get(&definition.qualified_name())
            .cloned()
            .unwrap_or_default()
    }

    /// The handler behind a local endpoint id.
    pub fn local_handler(&self, instance: u64) -> Option<Arc<dyn ServiceHandler>> {
        self.state
            .read()
            .locals
            .iter()
            .find(|local| local.instance == instance)
            .map(|local| Arc::clone(&local.handler))
    }

    /// A local handler serving `service/method`, if any. Used to dispatch
    /// inbound requests from remote callers.
    pub fn handler_for(&self, service: &str, method: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.state
            .read()
            .locals
            .iter()
            .find(|local| {
                local.contract.service == service
                    && local.definitions.iter().any(|d| d.method == method)
            })
            .map(|local| Arc::clone(&local.handler))
    }

    /// Contracts of every local instance — the advertisement payload for
    /// cluster join.
    pub fn contracts(&self) -> Vec<ContractDescriptor> {
        self.state
            .read()
            .locals
            .iter()
            .map(|local| local.contract.clone())
            .collect()
    }

    /// Count of distinct registered local instances.
    pub fn count(&self) -> usize {
        self.state.read().locals.len()
    }

    /// Whether nothing is registered or known.
    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.locals.is_empty() && state.references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{MethodDescriptor, MethodKind};
    use async_trait::async_trait;
    use serde_json::{json, Value};

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

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(DefinitionCache::new()))
    }

    fn greeting_definition() -> ServiceDefinition {
        ServiceDefinition {
            service: "greeting".to_owned(),
            method: "greeting".to_owned(),
            kind: MethodKind::RequestResponse,
            timeout_override: None,
        }
    }

    #[test]
    fn register_creates_local_references() {
        let registry = registry();
        let handler: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        registry.register_local(Some(Arc::clone(&handler))).unwrap();

        assert_eq!(registry.count(), 1);
        let references = registry.lookup(&greeting_definition());
        assert_eq!(references.len(), 1);
        assert!(references[0].endpoint.is_local());
        assert!(registry.handler_for("greeting", "greeting").is_some());
    }

    #[test]
    fn unregister_restores_prior_count() {
        let registry = registry();
        let handler: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        registry.register_local(Some(Arc::clone(&handler))).unwrap();
        registry.unregister_local(Some(&handler)).unwrap();

        assert_eq!(registry.count(), 0);
        assert!(registry.lookup(&greeting_definition()).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_service_object_is_rejected() {
        let registry = registry();
        let err = registry.register_local(None).unwrap_err();
        assert_eq!(err.to_string(), "Service object can't be null.");
        let err = registry.unregister_local(None).unwrap_err();
        assert_eq!(err.to_string(), "Service object can't be null.");
    }

    #[test]
    fn double_registration_is_an_error() {
        let registry = registry();
        let handler: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        registry.register_local(Some(Arc::clone(&handler))).unwrap();
        let err = registry
            .register_local(Some(Arc::clone(&handler)))
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateService));
    }

    #[test]
    fn unregistering_an_unknown_instance_is_an_error() {
        let registry = registry();
        let handler: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        let err = registry.unregister_local(Some(&handler)).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
    }

    #[test]
    fn two_instances_of_one_contract_coexist() {
        let registry = registry();
        let first: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        let second: Arc<dyn ServiceHandler> = Arc::new(Greeter);
        registry.register_local(Some(Arc::clone(&first))).unwrap();
        registry.register_local(Some(Arc::clone(&second))).unwrap();

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.lookup(&greeting_definition()).len(), 2);

        registry.unregister_local(Some(&first)).unwrap();
        assert_eq!(registry.lookup(&greeting_definition()).len(), 1);
    }

    #[test]
    fn membership_events_manage_remote_references() {
        let registry = registry();
        let member = Member {
            id: MemberId::new("cell-9"),
            address: "cell://local/9".to_owned(),
        };
        let contracts = vec![Greeter.contract()];

        registry.member_joined(&member, &contracts);
        let references = registry.lookup(&greeting_definition());
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].endpoint, Endpoint::Remote(member.id.clone()));

        // A repeated join advertisement doesn't duplicate references.
        registry.member_joined(&member, &contracts);
        assert_eq!(registry.lookup(&greeting_definition()).len(), 1);

        let purged = registry.member_left(&member.id);
        assert_eq!(purged, 2);
        assert!(registry.lookup(&greeting_definition()).is_empty());
    }
}
