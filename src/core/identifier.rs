// src/core/identifier.rs

//! Opaque identifiers for PubSub components and their per-manager generator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// An opaque 128-bit identifier assigned to every PubSub component
/// (connections, groups, readers, writers). Identifiers are unique within a
/// process and are never reissued, which lets scheduler callbacks re-resolve
/// a component by id and safely short-circuit when it has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubSubId(Uuid);

impl PubSubId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PubSubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Generates unique component identifiers for one manager instance.
///
/// The high 64 bits are randomized once per manager so identifiers from
/// different processes do not collide; the low 64 bits are a monotonic
/// counter, so a fresh value is never equal to a previously issued one.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: u64,
    counter: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let (prefix, _) = Uuid::new_v4().as_u64_pair();
        Self { prefix, counter: 0 }
    }

    /// Returns a fresh identifier never previously issued by this generator.
    pub fn next_id(&mut self) -> PubSubId {
        self.counter += 1;
        PubSubId(Uuid::from_u64_pair(self.prefix, self.counter))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_unique_and_monotonic() {
        let mut generator = IdGenerator::new();
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
