// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Rank of a node within the cluster, `0..cluster_size`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u16);

impl NodeId {
    pub const fn new(rank: u16) -> Self {
        Self(rank)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterate over every node of a cluster of `cluster_size` nodes.
    pub fn all(cluster_size: usize) -> impl Iterator<Item = NodeId> {
        (0..cluster_size).map(|rank| NodeId(rank as u16))
    }
}

impl From<u16> for NodeId {
    fn from(rank: u16) -> Self {
        Self(rank)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}
