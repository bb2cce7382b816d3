//! Pluggable per-call routing strategies.
//!
//! A [`Router`] picks one [`ServiceReference`] out of the registry snapshot
//! for a definition. Routers are chosen per dispatcher/proxy context; the
//! counter state of a [`RoundRobinRouter`] lives in the router instance, so
//! every caller sharing that instance advances the same rotation.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::definition::ServiceDefinition;
use crate::error::{Result, ServiceError};
use crate::registry::ServiceReference;

/// Routing strategy seam.
pub trait Router: Send + Sync + 'static {
    /// Select the reference to receive the call.
    ///
    /// Fails with [`ServiceError::NoReachableMember`] when the snapshot has
    /// zero candidates for the definition.
    fn route(
        &self,
        definition: &ServiceDefinition,
        candidates: &[ServiceReference],
    ) -> Result<ServiceReference>;
}

/// Selector for the built-in router variants, used on the context surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterKind {
    /// Rotate through all references of a definition.
    RoundRobin,
    /// Restrict to references tagged `key=value`, rotating within the
    /// subset.
    Tag { key: String, value: String },
}

impl RouterKind {
    /// Instantiate the selected variant.
    pub(crate) fn build(&self) -> std::sync::Arc<dyn Router> {
        match self {
            RouterKind::RoundRobin => std::sync::Arc::new(RoundRobinRouter::new()),
            RouterKind::Tag { key, value } => {
                std::sync::Arc::new(TagRouter::new(key.clone(), value.clone()))
            }
        }
    }
}

/// Round-robin across every reference of a definition.
///
/// Keeps one monotonic counter per definition; selection is
/// `candidates[counter % len]` and the counter advances on every selection,
/// concurrent callers included.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    counters: Mutex<HashMap<String, u64>>,
}

impl RoundRobinRouter {
    /// Create a router with fresh counters.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Router for RoundRobinRouter {
    fn route(
        &self,
        definition: &ServiceDefinition,
        candidates: &[ServiceReference],
    ) -> Result<ServiceReference> {
        if candidates.is_empty() {
            return Err(ServiceError::NoReachableMember(definition.qualified_name()));
        }
        let mut counters = self.counters.lock();
        let counter = counters.entry(definition.qualified_name()).or_insert(0);
        let picked = candidates[(*counter % candidates.len() as u64) as usize].clone();
        *counter += 1;
        Ok(picked)
    }
}

/// Tag-affinity routing: keep only references carrying `key=value`, then
/// round-robin among what's left.
#[derive(Debug)]
pub struct TagRouter {
    key: String,
    value: String,
    fallback: RoundRobinRouter,
}

impl TagRouter {
    /// Create a router selecting references tagged `key=value`.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            fallback: RoundRobinRouter::new(),
        }
    }
}

impl Router for TagRouter {
    fn route(
        &self,
        definition: &ServiceDefinition,
        candidates: &[ServiceReference],
    ) -> Result<ServiceReference> {
        let subset: Vec<ServiceReference> = candidates
            .iter()
            .filter(|reference| {
                reference
                    .tags
                    .get(&self.key)
                    .is_some_and(|value| *value == self.value)
            })
            .cloned()
            .collect();
        self.fallback.route(definition, &subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberId;
    use crate::definition::MethodKind;
    use crate::registry::Endpoint;
    use std::collections::BTreeMap;

    fn definition() -> ServiceDefinition {
        ServiceDefinition {
            service: "greeting".to_owned(),
            method: "greeting".to_owned(),
            kind: MethodKind::RequestResponse,
            timeout_override: None,
        }
    }

    fn reference(member: &str, tags: &[(&str, &str)]) -> ServiceReference {
        ServiceReference {
            definition: definition(),
            endpoint: Endpoint::Remote(MemberId::new(member)),
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn round_robin_visits_each_reference_once_then_repeats() {
        let router = RoundRobinRouter::new();
        let candidates = vec![
            reference("cell-1", &[]),
            reference("cell-2", &[]),
            reference("cell-3", &[]),
        ];

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(router.route(&definition(), &candidates).unwrap());
        }
        assert_eq!(&picked[..3], &candidates[..]);
        assert_eq!(&picked[3..], &candidates[..]);
    }

    #[test]
    fn round_robin_counters_are_per_definition() {
        let router = RoundRobinRouter::new();
        let candidates = vec![reference("cell-1", &[]), reference("cell-2", &[])];
        let other = ServiceDefinition {
            method: "greeting_void".to_owned(),
            kind: MethodKind::FireAndForget,
            ..definition()
        };

        assert_eq!(
            router.route(&definition(), &candidates).unwrap(),
            candidates[0]
        );
        // A different definition starts its own rotation.
        assert_eq!(router.route(&other, &candidates).unwrap(), candidates[0]);
        assert_eq!(
            router.route(&definition(), &candidates).unwrap(),
            candidates[1]
        );
    }

    #[test]
    fn empty_snapshot_is_unroutable() {
        let router = RoundRobinRouter::new();
        let err = router.route(&definition(), &[]).unwrap_err();
        assert!(matches!(err, ServiceError::NoReachableMember(_)));
    }

    #[test]
    fn tag_router_restricts_to_matching_references() {
        let router = TagRouter::new("zone", "eu");
        let candidates = vec![
            reference("cell-1", &[("zone", "us")]),
            reference("cell-2", &[("zone", "eu")]),
            reference("cell-3", &[("zone", "eu")]),
        ];

        let first = router.route(&definition(), &candidates).unwrap();
        let second = router.route(&definition(), &candidates).unwrap();
        assert_eq!(first, candidates[1]);
        assert_eq!(second, candidates[2]);
    }

    #[test]
    fn tag_router_with_no_match_is_unroutable() {
        let router = TagRouter::new("zone", "mars");
        let candidates = vec![reference("cell-1", &[("zone", "eu")])];
        let err = router.route(&definition(), &candidates).unwrap_err();
        assert!(matches!(err, ServiceError::NoReachableMember(_)));
    }
}
