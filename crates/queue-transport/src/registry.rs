//! Registry of leases currently checked out from the backend.

use crate::message::Lease;
use std::collections::HashMap;

/// Map from message id to the lease the transport currently holds for it
///
/// Not synchronized; callers hold the transport gate.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: HashMap<String, Lease>,
}

impl LeaseRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lease, returning `true` when it replaced an existing one
    pub fn put(&mut self, lease: Lease) -> bool {
        self.leases.insert(lease.id().to_string(), lease).is_some()
    }

    /// Whether `lease` is exactly the lease registered for its id
    ///
    /// A lease superseded by redelivery carries an outdated receipt and is not current.
    pub fn is_current(&self, lease: &Lease) -> bool {
        self.leases.get(lease.id()) == Some(lease)
    }

    pub fn remove(&mut self, id: &str) -> Option<Lease> {
        self.leases.remove(id)
    }

    /// Every registered lease, in no particular order
    pub fn values(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn clear(&mut self) {
        self.leases.clear();
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
