// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Active message seam.
//!
//! The collective layer only needs one-way, reliable, by-name delivery of an
//! opaque payload to a node. [`ActiveMessenger`] captures exactly that; a real
//! network transport implements it outside this crate, and [`LocalFabric`]
//! implements it in-process.
//!
//! Handlers run to completion on the receiving node's dispatcher, one message
//! at a time per node. Handler names beginning with `_` are reserved for system
//! handlers and can only be registered through
//! [`ActiveMessenger::register_internal_handler`].

mod local;

pub use local::{LocalEndpoint, LocalFabric};

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use thiserror::Error;

use crate::NodeId;

/// Delivery errors raised by a fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("{target} is not a member of a cluster of {cluster_size} nodes")]
    UnknownNode { target: NodeId, cluster_size: usize },

    #[error("inbox of {0} is closed")]
    InboxClosed(NodeId),

    #[error("handler '{0}' is already registered")]
    DuplicateHandler(String),

    #[error(
        "Handler name '{0}' cannot start with '_'. System handlers must be registered via internal APIs."
    )]
    ReservedName(String),
}

/// Context passed to a handler for each delivered message.
#[derive(Clone, Debug)]
pub struct AmContext {
    /// Node that sent the message
    pub source: NodeId,

    /// Message payload
    pub payload: Bytes,
}

type HandlerFn = dyn Fn(AmContext) + Send + Sync;

/// A named message handler.
#[derive(Clone)]
pub struct AmHandler {
    name: Arc<str>,
    handler: Arc<HandlerFn>,
}

impl AmHandler {
    pub fn new<F>(name: impl Into<Arc<str>>, handler: F) -> Self
    where
        F: Fn(AmContext) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dispatch(&self, ctx: AmContext) {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for AmHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One-way messaging between the nodes of a cluster.
pub trait ActiveMessenger: Send + Sync {
    /// Rank of the local node.
    fn node_id(&self) -> NodeId;

    /// Number of nodes in the cluster.
    fn cluster_size(&self) -> usize;

    /// Deliver `payload` to the handler named `handler` on `target`.
    ///
    /// Delivery is reliable and does not wait for the handler to run.
    fn send(&self, target: NodeId, handler: &str, payload: Bytes) -> Result<()>;

    /// Register a public handler (handler names cannot start with `_`).
    fn register_handler(&self, handler: AmHandler) -> Result<()> {
        if handler.name().starts_with('_') {
            return Err(FabricError::ReservedName(handler.name().to_string()).into());
        }
        self.register_internal_handler(handler)
    }

    /// Register a system handler (allows names starting with `_`).
    fn register_internal_handler(&self, handler: AmHandler) -> Result<()>;
}
