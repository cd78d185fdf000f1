// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::NodeId;

const NODE_BITS: u32 = 16;
const OFFSET_BITS: u32 = 48;

const NODE_SHIFT: u32 = OFFSET_BITS;

const NODE_MASK: u64 = ((1u64 << NODE_BITS) - 1) << NODE_SHIFT;
const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;

/// Largest offset a global address can carry.
pub const MAX_OFFSET: u64 = OFFSET_MASK;

/// Address in the partitioned global address space, encoded in a single u64.
///
/// The high 16 bits name the owning node, the low 48 bits the byte offset into
/// that node's heap arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalAddress(u64);

impl GlobalAddress {
    pub fn new(node: NodeId, offset: u64) -> Result<Self> {
        if offset > MAX_OFFSET {
            bail!(
                "offset {:#x} does not fit in a global address ({} bits)",
                offset,
                OFFSET_BITS
            );
        }
        Ok(Self::from_parts(node, offset))
    }

    /// Caller guarantees `offset <= MAX_OFFSET`.
    pub(crate) fn from_parts(node: NodeId, offset: u64) -> Self {
        debug_assert!(offset <= MAX_OFFSET);
        Self(((node.as_u16() as u64) << NODE_SHIFT) | offset)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(((self.0 & NODE_MASK) >> NODE_SHIFT) as u16)
    }

    pub fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Address `bytes` further into the same node's arena.
    pub fn add(&self, bytes: u64) -> Result<Self> {
        match self.offset().checked_add(bytes) {
            Some(offset) => Self::new(self.node(), offset),
            None => bail!("global address {} overflowed by {} bytes", self, bytes),
        }
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalAddress({}, {:#x})", self.node(), self.offset())
    }
}
