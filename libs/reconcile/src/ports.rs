//! Port allocation for newly provisioned nodes.

use std::collections::HashSet;

use crate::DEFAULT_BASE_PORT;

/// Return the smallest port `>= start_from` that is not in `existing`.
///
/// Callers pass the union of every port they know about: registry records
/// and in-flight lifecycle entries. Missing either lets two concurrent
/// provisioning requests race onto the same port.
pub fn allocate_port(existing: &HashSet<u32>, start_from: u32) -> u32 {
    let mut port = start_from;
    while existing.contains(&port) {
        port += 1;
    }
    port
}

/// Allocator bound to a fixed base port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base: u32,
}

impl PortAllocator {
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Allocate the first free port at or above the base.
    pub fn allocate<I>(&self, existing: I) -> u32
    where
        I: IntoIterator<Item = u32>,
    {
        let existing: HashSet<u32> = existing.into_iter().collect();
        allocate_port(&existing, self.base)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}
