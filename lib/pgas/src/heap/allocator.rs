// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Power-of-two buddy allocator over a caller-supplied arena.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use tracing::{debug, trace, warn};

use super::AllocatorError;

/// A power-of-two region of the arena, addressed by its offset from the arena base.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    offset: u64,
    size: u64,
    in_use: bool,
}

impl Chunk {
    fn free(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            in_use: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    fn buddy_offset(&self) -> u64 {
        self.offset ^ self.size
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ chunk {:#x} size {} in_use {} ]",
            self.offset, self.size, self.in_use
        )
    }
}

/// Buddy allocator managing one contiguous arena.
///
/// Tracked chunks always partition the arena exactly. A free chunk never has a
/// free buddy of the same size; such pairs are merged as soon as they appear.
///
/// The allocator is not internally synchronized. Use it from a single owner or
/// wrap it, as [`GlobalHeap`](super::GlobalHeap) does.
#[derive(Debug)]
pub struct GlobalHeapAllocator {
    base: u64,
    size: u64,
    chunks: BTreeMap<u64, Chunk>,
    free_lists: BTreeMap<u64, BTreeSet<u64>>,
}

impl GlobalHeapAllocator {
    /// Create an allocator responsible for `[base, base + size)`.
    ///
    /// The arena is decomposed into maximal power-of-two chunks, all free.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the arena wraps the address space.
    pub fn new(base: u64, size: u64) -> Self {
        assert!(size != 0, "global heap allocator requires a non-zero arena");
        assert!(
            base.checked_add(size).is_some(),
            "arena [{base:#x}, +{size}) overflows the address space"
        );

        let mut allocator = Self {
            base,
            size,
            chunks: BTreeMap::new(),
            free_lists: BTreeMap::new(),
        };

        let mut offset = 0;
        let mut remaining = size;
        while remaining > 0 {
            let chunk_size = largest_power_of_two_at_most(remaining);
            allocator.chunks.insert(offset, Chunk::free(offset, chunk_size));
            allocator.add_to_free_list(chunk_size, offset);
            offset += chunk_size;
            remaining -= chunk_size;
        }

        debug!(
            base = format_args!("{base:#x}"),
            size,
            chunks = allocator.chunks.len(),
            "global heap allocator initialized"
        );
        allocator
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Allocate at least `requested` bytes, returning the chunk's absolute address.
    ///
    /// The request is rounded up to the next power of two. The smallest free
    /// size class that fits donates its lowest chunk, which is halved until it
    /// matches; every upper half becomes a free chunk of its own.
    pub fn allocate(&mut self, requested: u64) -> Result<u64, AllocatorError> {
        let rounded = match requested.max(1).checked_next_power_of_two() {
            Some(rounded) => rounded,
            None => return Err(self.exhausted(requested, u64::MAX)),
        };

        let donor = self
            .free_lists
            .range(rounded..)
            .find_map(|(size, offsets)| offsets.first().map(|offset| (*size, *offset)));

        let Some((mut chunk_size, offset)) = donor else {
            return Err(self.exhausted(requested, rounded));
        };

        self.remove_from_free_list(chunk_size, offset);

        while chunk_size > rounded {
            chunk_size /= 2;
            let buddy = offset + chunk_size;
            self.chunks.insert(buddy, Chunk::free(buddy, chunk_size));
            self.add_to_free_list(chunk_size, buddy);
            trace!(offset, buddy, chunk_size, "split chunk");
        }

        let chunk = self.chunk_mut(offset);
        chunk.size = chunk_size;
        chunk.in_use = true;

        trace!(requested, offset, size = chunk_size, "allocated chunk");
        Ok(self.base + offset)
    }

    /// Return a chunk previously handed out by [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `address` does not name a chunk that is currently in use.
    pub fn free(&mut self, address: u64) {
        let Some(offset) = address
            .checked_sub(self.base)
            .filter(|offset| *offset < self.size)
        else {
            panic!("free of {address:#x}: address is outside the global heap arena");
        };

        let size = match self.chunks.get_mut(&offset) {
            Some(chunk) if chunk.in_use => {
                chunk.in_use = false;
                chunk.size
            }
            Some(_) => panic!("free of {address:#x}: chunk is not in use (double free?)"),
            None => panic!("free of {address:#x}: address was not returned by allocate"),
        };

        self.add_to_free_list(size, offset);
        trace!(offset, size, "freed chunk");
        self.coalesce(offset);
    }

    /// Merge the free chunk at `offset` with its buddy for as long as the buddy
    /// is tracked, free and of equal size.
    fn coalesce(&mut self, mut offset: u64) {
        loop {
            let chunk = self.chunks[&offset];
            let buddy_offset = chunk.buddy_offset();

            match self.chunks.get(&buddy_offset) {
                Some(buddy) if !buddy.in_use && buddy.size == chunk.size => {}
                _ => break,
            }

            let (lower, higher) = if offset < buddy_offset {
                (offset, buddy_offset)
            } else {
                (buddy_offset, offset)
            };

            self.remove_from_free_list(chunk.size, higher);
            self.chunks.remove(&higher);

            self.remove_from_free_list(chunk.size, lower);
            let merged = self.chunk_mut(lower);
            merged.size *= 2;
            let merged_size = merged.size;
            self.add_to_free_list(merged_size, lower);

            trace!(lower, higher, size = merged_size, "merged buddies");
            offset = lower;
        }
    }

    fn chunk_mut(&mut self, offset: u64) -> &mut Chunk {
        self.chunks
            .get_mut(&offset)
            .expect("free list entries always name tracked chunks")
    }

    fn add_to_free_list(&mut self, size: u64, offset: u64) {
        self.free_lists.entry(size).or_default().insert(offset);
    }

    fn remove_from_free_list(&mut self, size: u64, offset: u64) {
        if let Some(offsets) = self.free_lists.get_mut(&size) {
            offsets.remove(&offset);
            if offsets.is_empty() {
                self.free_lists.remove(&size);
            }
        }
    }

    fn exhausted(&self, requested: u64, rounded: u64) -> AllocatorError {
        let largest_free = self.largest_free_chunk();
        warn!(
            requested,
            rounded,
            largest_free,
            "out of memory in the global heap; consider a larger heap arena"
        );
        AllocatorError::ResourceExhaustion {
            requested,
            rounded,
            largest_free,
        }
    }

    /// Number of chunks currently tracked, free or in use.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn bytes_total(&self) -> u64 {
        self.chunks.values().map(Chunk::size).sum()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.chunks
            .values()
            .filter(|chunk| chunk.in_use)
            .map(Chunk::size)
            .sum()
    }

    pub fn bytes_free(&self) -> u64 {
        self.free_lists
            .iter()
            .map(|(size, offsets)| size * offsets.len() as u64)
            .sum()
    }

    /// Size of the largest free chunk, or zero when the arena is fully used.
    pub fn largest_free_chunk(&self) -> u64 {
        self.free_lists.keys().next_back().copied().unwrap_or(0)
    }

    /// All tracked chunks in offset order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }
}

impl Display for GlobalHeapAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "all chunks = {{")?;
        for chunk in self.chunks.values() {
            writeln!(f, "   {chunk}")?;
        }
        writeln!(f, "}}, free lists = {{")?;
        for (size, offsets) in &self.free_lists {
            write!(f, "   {size}:")?;
            for offset in offsets {
                write!(f, " {}", self.chunks[offset])?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

fn largest_power_of_two_at_most(value: u64) -> u64 {
    1 << (u64::BITS - 1 - value.leading_zeros())
}
