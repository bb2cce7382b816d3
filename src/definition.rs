//! Service contracts and method-level definition metadata.
//!
//! A service exposes a [`ContractDescriptor`]: an explicit dispatch table of
//! method name → [`MethodDescriptor`]. [`describe`] reflects a contract into
//! the per-method [`ServiceDefinition`]s the registry, router, and
//! dispatcher operate on. Definitions are immutable once derived and are
//! memoized by a [`DefinitionCache`] owned by the composition root, so two
//! independent runtimes in one process never share definition state.
//!
//! There is no run-time reflection: service implementations and generated
//! client stand-ins both carry a descriptor and forward every call through a
//! single generic dispatch entry point.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ServiceError};

/// Return kind of a service method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// The caller awaits a correlated response value.
    RequestResponse,
    /// Fire-and-forget: dispatched without response correlation.
    FireAndForget,
}

/// Declared shape of a single service method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Method name, unique within the contract.
    pub name: String,
    /// Return kind.
    pub kind: MethodKind,
    /// Per-method timeout override. Takes precedence over the context
    /// timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override: Option<Duration>,
}

impl MethodDescriptor {
    /// Declare a request/response method.
    pub fn request_response(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::RequestResponse,
            timeout_override: None,
        }
    }

    /// Declare a fire-and-forget method.
    pub fn fire_and_forget(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::FireAndForget,
            timeout_override: None,
        }
    }

    /// Attach a per-method timeout override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }
}

/// The explicit contract of a service interface: its name, its methods, and
/// the tags used for affinity routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDescriptor {
    /// Service (interface) name.
    pub service: String,
    /// Declared methods.
    pub methods: Vec<MethodDescriptor>,
    /// Tags advertised with every reference to this contract.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ContractDescriptor {
    /// Start a contract for the named service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a method declaration.
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Add a routing tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Identity and metadata of a single service method: `(service, method)`
/// plus its return kind and optional timeout override.
///
/// Immutable once derived from a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service (interface) name.
    pub service: String,
    /// Method name.
    pub method: String,
    /// Return kind.
    pub kind: MethodKind,
    /// Per-method timeout override.
    pub timeout_override: Option<Duration>,
}

impl ServiceDefinition {
    /// `"service/method"` — the registry's multimap key.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

/// A service implementation: carries its contract and a single generic
/// dispatch entry point.
///
/// Application errors returned from [`handle`](ServiceHandler::handle) are
/// passed through to the caller opaquely; the core never interprets them.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// The contract this instance serves.
    fn contract(&self) -> ContractDescriptor;

    /// Dispatch a method invocation against this instance.
    async fn handle(&self, method: &str, args: Value) -> anyhow::Result<Value>;
}

/// Reflect a contract into its per-method definitions.
///
/// Pure function of the contract shape. Fails with
/// [`ServiceError::InvalidContract`] if the service name or a method name is
/// empty, the method list is empty, or two methods collide on name with
/// different signatures. Same-name methods with identical signatures
/// collapse to a single definition.
pub fn describe(contract: &ContractDescriptor) -> Result<HashMap<String, ServiceDefinition>> {
    if contract.service.is_empty() {
        return Err(ServiceError::InvalidContract(
            "service name is empty".to_owned(),
        ));
    }
    if contract.methods.is_empty() {
        return Err(ServiceError::InvalidContract(format!(
            "service {} declares no methods",
            contract.service
        )));
    }

    let mut definitions: HashMap<String, ServiceDefinition> = HashMap::new();
    for method in &contract.methods {
        if method.name.is_empty() {
            return Err(ServiceError::InvalidContract(format!(
                "service {} declares a method with an empty name",
                contract.service
            )));
        }
        let definition = ServiceDefinition {
            service: contract.service.clone(),
            method: method.name.clone(),
            kind: method.kind,
            timeout_override: method.timeout_override,
        };
        if let Some(existing) = definitions.get(&method.name) {
            if *existing != definition {
                return Err(ServiceError::InvalidContract(format!(
                    "service {} declares method {} twice with conflicting signatures",
                    contract.service, method.name
                )));
            }
            continue;
        }
        definitions.insert(method.name.clone(), definition);
    }
    Ok(definitions)
}

/// Memoizing definition store, keyed by service name.
///
/// Owned by the composition root and shared by handle. Entries never expire:
/// interface shapes are static for the process lifetime.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    inner: RwLock<HashMap<String, Arc<HashMap<String, ServiceDefinition>>>>,
}

impl DefinitionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive (or fetch the memoized) definition map for a contract.
    pub fn describe(
        &self,
        contract: &ContractDescriptor,
    ) -> Result<Arc<HashMap<String, ServiceDefinition>>> {
        if let Some(hit) = self.inner.read().get(&contract.service) {
            return Ok(Arc::clone(hit));
        }
        let derived = Arc::new(describe(contract)?);
        let mut cache = self.inner.write();
        // Another caller may have derived the same contract concurrently.
        Ok(Arc::clone(
            cache
                .entry(contract.service.clone())
                .or_insert(derived),
        ))
    }

    /// Number of cached contracts.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_contract() -> ContractDescriptor {
        ContractDescriptor::new("greeting")
            .method(MethodDescriptor::request_response("greeting"))
            .method(MethodDescriptor::fire_and_forget("greeting_void"))
    }

    #[test]
    fn describe_maps_every_method() {
        let definitions = describe(&greeting_contract()).unwrap();
        assert_eq!(definitions.len(), 2);

        let greeting = &definitions["greeting"];
        assert_eq!(greeting.kind, MethodKind::RequestResponse);
        assert_eq!(greeting.qualified_name(), "greeting/greeting");

        let oneway = &definitions["greeting_void"];
        assert_eq!(oneway.kind, MethodKind::FireAndForget);
    }

    #[test]
    fn describe_rejects_empty_contracts() {
        let err = describe(&ContractDescriptor::new("greeting")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidContract(_)));

        let err = describe(
            &ContractDescriptor::new("").method(MethodDescriptor::request_response("m")),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidContract(_)));
    }

    #[test]
    fn describe_rejects_conflicting_overloads() {
        let contract = ContractDescriptor::new("greeting")
            .method(MethodDescriptor::request_response("greeting"))
            .method(MethodDescriptor::fire_and_forget("greeting"));
        let err = describe(&contract).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidContract(_)));
    }

    #[test]
    fn describe_collapses_identical_duplicates() {
        let contract = ContractDescriptor::new("greeting")
            .method(MethodDescriptor::request_response("greeting"))
            .method(MethodDescriptor::request_response("greeting"));
        let definitions = describe(&contract).unwrap();
        assert_eq!(definitions.len(), 1);
    }

    #[test]
    fn cache_memoizes_per_service() {
        let cache = DefinitionCache::new();
        let first = cache.describe(&greeting_contract()).unwrap();
        let second = cache.describe(&greeting_contract()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn timeout_override_survives_description() {
        let contract = ContractDescriptor::new("slow").method(
            MethodDescriptor::request_response("crawl").with_timeout(Duration::from_secs(120)),
        );
        let definitions = describe(&contract).unwrap();
        assert_eq!(
            definitions["crawl"].timeout_override,
            Some(Duration::from_secs(120))
        );
    }
}
