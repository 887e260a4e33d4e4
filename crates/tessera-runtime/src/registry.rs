//! # Capability Registry
//!
//! Maps capability names to the handlers that serve them. Several handlers
//! may share one name (a primary plus fallbacks); they are kept ordered by
//! descending priority, ties broken by registration order.
//!
//! The registry is written once at startup and read on every admission, so
//! it sits behind a `std::sync::RwLock`. Per-descriptor health is an atomic
//! flag the health monitor flips without taking the write lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tessera_core::{
    CapabilityHandler, CapabilityName, HandlerId, RegistryError, RegistryResult,
};

use crate::config::ConcurrencyLimit;

/// A handler registration request.
#[derive(Clone)]
pub struct Capability {
    pub name: CapabilityName,
    pub handler_id: HandlerId,
    pub max_concurrency: ConcurrencyLimit,
    /// Higher runs first; fallbacks use lower values.
    pub priority: i32,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    /// A primary handler with the default concurrency ceiling.
    pub fn new(name: CapabilityName, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            name,
            handler_id: HandlerId::primary(),
            max_concurrency: ConcurrencyLimit::DEFAULT,
            priority: 0,
            handler,
        }
    }

    pub fn with_handler_id(mut self, handler_id: HandlerId) -> Self {
        self.handler_id = handler_id;
        self
    }

    pub fn with_max_concurrency(mut self, limit: ConcurrencyLimit) -> Self {
        self.max_concurrency = limit;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("handler_id", &self.handler_id)
            .field("max_concurrency", &self.max_concurrency)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Identity of one descriptor: capability name plus handler id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorKey {
    pub capability: CapabilityName,
    pub handler_id: HandlerId,
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.capability, self.handler_id)
    }
}

/// A registered capability plus its runtime health.
pub struct CapabilityDescriptor {
    capability: Capability,
    key: DescriptorKey,
    healthy: AtomicBool,
    last_probe: Mutex<Option<DateTime<Utc>>>,
}

impl CapabilityDescriptor {
    fn new(capability: Capability) -> Self {
        let key = DescriptorKey {
            capability: capability.name.clone(),
            handler_id: capability.handler_id.clone(),
        };
        Self {
            capability,
            key,
            healthy: AtomicBool::new(true),
            last_probe: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &DescriptorKey {
        &self.key
    }

    pub fn name(&self) -> &CapabilityName {
        &self.capability.name
    }

    pub fn handler_id(&self) -> &HandlerId {
        &self.capability.handler_id
    }

    pub fn max_concurrency(&self) -> usize {
        self.capability.max_concurrency.get()
    }

    pub fn priority(&self) -> i32 {
        self.capability.priority
    }

    pub fn handler(&self) -> &Arc<dyn CapabilityHandler> {
        &self.capability.handler
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a probe result. Returns the previous health.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        *self
            .last_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        *self
            .last_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("key", &self.key)
            .field("priority", &self.priority())
            .field("max_concurrency", &self.max_concurrency())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Registry of capability descriptors keyed by name.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    descriptors: RwLock<HashMap<CapabilityName, Vec<Arc<CapabilityDescriptor>>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Fails if `(name, handler_id)` is already taken.
    pub fn register(&self, capability: Capability) -> RegistryResult<Arc<CapabilityDescriptor>> {
        let mut descriptors = self
            .descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = descriptors.entry(capability.name.clone()).or_default();

        if entries
            .iter()
            .any(|d| d.handler_id() == &capability.handler_id)
        {
            return Err(RegistryError::DuplicateCapability {
                capability: capability.name,
                handler: capability.handler_id,
            });
        }

        let descriptor = Arc::new(CapabilityDescriptor::new(capability));
        entries.push(Arc::clone(&descriptor));
        // Stable sort keeps registration order among equal priorities.
        entries.sort_by_key(|d| std::cmp::Reverse(d.priority()));

        tracing::debug!(
            capability = %descriptor.name(),
            handler = %descriptor.handler_id(),
            priority = descriptor.priority(),
            max_concurrency = descriptor.max_concurrency(),
            "Registered capability handler"
        );
        Ok(descriptor)
    }

    /// The highest-priority descriptor for `name`.
    pub fn lookup(&self, name: &CapabilityName) -> RegistryResult<Arc<CapabilityDescriptor>> {
        self.list_by_capability(name)
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::CapabilityNotFound {
                capability: name.clone(),
            })
    }

    /// Every descriptor under `name`, highest priority first.
    pub fn list_by_capability(&self, name: &CapabilityName) -> Vec<Arc<CapabilityDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// The highest-priority healthy descriptor, or the primary when none is
    /// healthy.
    pub fn select(&self, name: &CapabilityName) -> RegistryResult<Arc<CapabilityDescriptor>> {
        let candidates = self.list_by_capability(name);
        candidates
            .iter()
            .find(|d| d.is_healthy())
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| RegistryError::CapabilityNotFound {
                capability: name.clone(),
            })
    }

    /// The next descriptor after `current` in priority order, preferring a
    /// healthy one.
    pub fn alternate(&self, current: &DescriptorKey) -> Option<Arc<CapabilityDescriptor>> {
        let candidates = self.list_by_capability(&current.capability);
        let position = candidates.iter().position(|d| d.key() == current)?;
        let rest = &candidates[position + 1..];
        rest.iter()
            .find(|d| d.is_healthy())
            .or_else(|| rest.first())
            .cloned()
    }

    pub fn contains(&self, name: &CapabilityName) -> bool {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// All descriptors, grouped by name in unspecified order.
    pub fn descriptors(&self) -> Vec<Arc<CapabilityDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
