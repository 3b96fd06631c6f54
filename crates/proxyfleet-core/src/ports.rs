use std::collections::VecDeque;
use std::ops::Range;

use crate::error::FleetError;

/// A contiguous-in-allocation block of local ports owned by one node.
///
/// Deliberately not `Clone`: a block is handed back to the allocator by
/// value, so it cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct PortBlock {
    ports: Vec<u16>,
}

impl PortBlock {
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Pool of unused local port numbers.
///
/// Ports are conserved: every port of the configured range is at any time
/// either in the free list or inside exactly one live `PortBlock`.
#[derive(Debug)]
pub struct PortAllocator {
    range: Range<u16>,
    free: VecDeque<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            free: range.clone().collect(),
            range,
        }
    }

    /// Take `n` ports from the front of the free list.
    pub fn allocate(&mut self, n: usize) -> Result<PortBlock, FleetError> {
        if n > self.free.len() {
            return Err(FleetError::PortPoolExhausted {
                requested: n,
                available: self.free.len(),
            });
        }
        Ok(PortBlock {
            ports: self.free.drain(..n).collect(),
        })
    }

    /// Return a block to the back of the free list.
    pub fn release(&mut self, block: PortBlock) {
        debug_assert!(
            block.ports.iter().all(|p| self.range.contains(p)),
            "released ports outside the configured range"
        );
        self.free.extend(block.ports);
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total size of the configured range.
    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    /// Snapshot of the free list, front first.
    pub fn free_ports(&self) -> Vec<u16> {
        self.free.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_conserved(alloc: &PortAllocator, live: &[&PortBlock]) {
        let mut all: Vec<u16> = alloc.free_ports();
        for block in live {
            all.extend_from_slice(block.ports());
        }
        all.sort_unstable();
        let expected: Vec<u16> = alloc.range().collect();
        assert_eq!(all, expected, "ports leaked or duplicated");
    }

    #[test]
    fn test_allocate_takes_from_front() {
        let mut alloc = PortAllocator::new(8080..8090);
        let block = alloc.allocate(3).unwrap();
        assert_eq!(block.ports(), &[8080, 8081, 8082]);
        assert_eq!(alloc.available(), 7);
        assert_eq!(alloc.capacity(), 10);
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut alloc = PortAllocator::new(8080..8082);
        let _a = alloc.allocate(1).unwrap();
        let err = alloc.allocate(2).unwrap_err();
        assert_eq!(
            err,
            FleetError::PortPoolExhausted {
                requested: 2,
                available: 1,
            }
        );
        // A failed request takes nothing.
        assert_eq!(alloc.available(), 1);
    }

    #[test]
    fn test_release_appends_to_back() {
        let mut alloc = PortAllocator::new(8080..8084);
        let a = alloc.allocate(2).unwrap();
        alloc.release(a);
        assert_eq!(alloc.free_ports(), vec![8082, 8083, 8080, 8081]);
    }

    #[test]
    fn test_conservation_across_churn() {
        let mut alloc = PortAllocator::new(9000..9012);
        let a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(3).unwrap();
        assert_conserved(&alloc, &[&a, &b]);

        alloc.release(a);
        assert_conserved(&alloc, &[&b]);

        let c = alloc.allocate(3).unwrap();
        let d = alloc.allocate(3).unwrap();
        let e = alloc.allocate(3).unwrap();
        assert_conserved(&alloc, &[&b, &c, &d, &e]);
        assert!(alloc.allocate(1).is_err());

        alloc.release(c);
        alloc.release(e);
        assert_conserved(&alloc, &[&b, &d]);
    }

    #[test]
    fn test_zero_sized_block() {
        let mut alloc = PortAllocator::new(8080..8081);
        let block = alloc.allocate(0).unwrap();
        assert!(block.is_empty());
        assert_eq!(alloc.available(), 1);
    }
}
