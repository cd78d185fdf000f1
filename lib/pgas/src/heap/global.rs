// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use tracing::debug;

use super::address::MAX_OFFSET;
use super::{AllocatorError, GlobalAddress, GlobalHeapAllocator};
use crate::NodeId;
use crate::config::HeapConfig;

/// Snapshot of a heap's usage counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub bytes_total: u64,
    pub bytes_in_use: u64,
    pub bytes_free: u64,
    pub chunks: usize,
}

/// One node's share of the global heap.
///
/// Wraps a [`GlobalHeapAllocator`] whose arena offsets start at zero, so every
/// allocation maps directly onto a [`GlobalAddress`] owned by this node. The
/// allocator is serialized behind a mutex so the heap can be shared between
/// tasks on the node.
pub struct GlobalHeap {
    node: NodeId,
    allocator: Mutex<GlobalHeapAllocator>,
}

impl GlobalHeap {
    /// # Panics
    ///
    /// Panics if `arena_bytes` is zero or larger than a global address can express.
    pub fn new(node: NodeId, arena_bytes: u64) -> Self {
        assert!(
            arena_bytes <= MAX_OFFSET + 1,
            "heap arena of {arena_bytes} bytes exceeds the global address range"
        );
        debug!(%node, arena_bytes, "creating global heap");
        Self {
            node,
            allocator: Mutex::new(GlobalHeapAllocator::new(0, arena_bytes)),
        }
    }

    pub fn from_config(node: NodeId, config: &HeapConfig) -> Self {
        Self::new(node, config.arena_bytes)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn allocate(&self, bytes: u64) -> Result<GlobalAddress, AllocatorError> {
        let offset = self.allocator.lock().allocate(bytes)?;
        Ok(GlobalAddress::from_parts(self.node, offset))
    }

    /// # Panics
    ///
    /// Panics if `address` is owned by another node or is not currently allocated.
    pub fn free(&self, address: GlobalAddress) {
        assert_eq!(
            address.node(),
            self.node,
            "free of {address} on {}: address is owned by another node",
            self.node
        );
        self.allocator.lock().free(address.offset());
    }

    pub fn owns(&self, address: GlobalAddress) -> bool {
        address.node() == self.node
    }

    pub fn stats(&self) -> HeapStats {
        let allocator = self.allocator.lock();
        HeapStats {
            bytes_total: allocator.bytes_total(),
            bytes_in_use: allocator.bytes_in_use(),
            bytes_free: allocator.bytes_free(),
            chunks: allocator.num_chunks(),
        }
    }

    /// Human-readable dump of the underlying allocator.
    pub fn dump(&self) -> String {
        self.allocator.lock().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocations_are_tagged_with_owner() {
        let heap = GlobalHeap::new(NodeId::new(3), 4096);
        let address = heap.allocate(100).unwrap();
        assert_eq!(address.node(), NodeId::new(3));
        assert_eq!(address.offset(), 0);
        assert!(heap.owns(address));

        let stats = heap.stats();
        assert_eq!(stats.bytes_total, 4096);
        assert_eq!(stats.bytes_in_use, 128);
        assert_eq!(stats.bytes_free, 4096 - 128);

        heap.free(address);
        assert_eq!(heap.stats().chunks, 1);
    }

    #[test]
    fn test_from_config() {
        let config = HeapConfig { arena_bytes: 1 << 20 };
        let heap = GlobalHeap::from_config(NodeId::new(0), &config);
        assert_eq!(heap.stats().bytes_total, 1 << 20);
        assert!(matches!(
            heap.allocate(2 << 20),
            Err(AllocatorError::ResourceExhaustion { .. })
        ));
    }

    #[test]
    fn test_shared_between_threads() {
        let heap = Arc::new(GlobalHeap::new(NodeId::new(1), 1 << 16));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let address = heap.allocate(64).unwrap();
                        heap.free(address);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(heap.stats().bytes_in_use, 0);
        assert_eq!(heap.stats().chunks, 1);
    }

    #[test]
    #[should_panic(expected = "owned by another node")]
    fn test_free_of_foreign_address_panics() {
        let heap = GlobalHeap::new(NodeId::new(0), 1024);
        let foreign = GlobalAddress::new(NodeId::new(1), 0).unwrap();
        heap.free(foreign);
    }
}
