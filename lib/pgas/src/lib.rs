// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Dynamo PGAS
//!
//! Resource management and synchronization substrate for a partitioned global
//! address space runtime:
//!
//! - [`heap`]: node-local buddy allocation backing the global heap
//! - [`collective`]: cluster-wide all-reduce and barrier over one-way active messages
//! - [`combining`]: flat-combining delegation that bounds concurrent flushes of a shared object
//!
//! The three are independent. [`am`] defines the messaging seam the collective
//! layer is built on, and ships an in-process fabric for single-process clusters.

pub mod am;
pub mod collective;
pub mod combining;
pub mod config;
pub mod heap;
pub mod logging;

mod types;

pub use collective::{CollectiveError, CollectiveReducer, ReduceOp};
pub use combining::{Combinable, FcStatus, FlatCombiner};
pub use config::PgasConfig;
pub use heap::{AllocatorError, GlobalAddress, GlobalHeap, GlobalHeapAllocator};
pub use types::NodeId;
