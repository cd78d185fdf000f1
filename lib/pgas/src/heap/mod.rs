// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global heap allocation.
//!
//! Each node owns a contiguous arena carved up by a [`GlobalHeapAllocator`], a
//! power-of-two buddy allocator. [`GlobalHeap`] wraps one node's allocator and
//! hands out [`GlobalAddress`]es, which encode the owning node alongside the
//! offset into that node's arena.
//!
//! ```text
//! arena (1536 bytes)      [ 1024 @ 0                 ][ 512 @ 1024  ]
//! allocate(100)           [128][128][256][ 512       ][ 512 @ 1024  ]
//!                           ^ in use, buddies registered on their free lists
//! free(0)                 [ 1024 @ 0                 ][ 512 @ 1024  ]
//! ```

mod address;
mod allocator;
mod global;

pub use address::GlobalAddress;
pub use allocator::{Chunk, GlobalHeapAllocator};
pub use global::{GlobalHeap, HeapStats};

/// Errors returned by the heap allocators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// No free chunk of a sufficient size class exists.
    #[error(
        "Out of memory in the global heap: no free chunk of {rounded} bytes to hold an allocation of {requested} bytes (largest free chunk: {largest_free} bytes)"
    )]
    ResourceExhaustion {
        requested: u64,
        rounded: u64,
        largest_free: u64,
    },
}
