// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process fabric: every node of the cluster lives in the current process.
//!
//! Each endpoint owns a flume inbox drained by a dispatcher task. Registrations
//! travel through the same inbox as messages, so a handler registered before a
//! message is sent is always visible to that message. Messages that arrive for
//! a name nobody has registered yet are parked and replayed, in arrival order,
//! once the handler shows up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use super::{ActiveMessenger, AmContext, AmHandler, FabricError};
use crate::NodeId;

enum Inbound {
    Message { handler: String, ctx: AmContext },
    Register(AmHandler),
}

/// A cluster of `cluster_size` nodes connected through in-memory channels.
pub struct LocalFabric {
    endpoints: Vec<Arc<LocalEndpoint>>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
}

impl LocalFabric {
    /// Create the cluster and spawn one dispatcher per node on the current
    /// tokio runtime.
    pub fn new(cluster_size: usize) -> Result<Self> {
        if cluster_size == 0 {
            bail!("a cluster needs at least one node");
        }
        if cluster_size > u16::MAX as usize + 1 {
            bail!("cluster of {cluster_size} nodes exceeds the node id range");
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("LocalFabric must be created inside a tokio runtime: {e}"))?;

        let (inboxes, receivers): (Vec<_>, Vec<_>) =
            (0..cluster_size).map(|_| flume::unbounded()).unzip();
        let inboxes: Arc<[flume::Sender<Inbound>]> = inboxes.into();

        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let endpoints = NodeId::all(cluster_size)
            .zip(receivers)
            .map(|(node, rx)| {
                let dispatcher = Dispatcher {
                    node,
                    handlers: HashMap::new(),
                    backlog: HashMap::new(),
                    rx,
                };
                tracker.spawn_on(dispatcher.run(cancel_token.child_token()), &runtime);

                Arc::new(LocalEndpoint {
                    node,
                    inboxes: inboxes.clone(),
                    registered: Mutex::new(HashSet::new()),
                })
            })
            .collect();

        debug!(cluster_size, "local fabric started");

        Ok(Self {
            endpoints,
            cancel_token,
            tracker,
        })
    }

    pub fn cluster_size(&self) -> usize {
        self.endpoints.len()
    }

    pub fn endpoint(&self, node: NodeId) -> Result<Arc<LocalEndpoint>> {
        match self.endpoints.get(node.index()) {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Err(FabricError::UnknownNode {
                target: node,
                cluster_size: self.endpoints.len(),
            }
            .into()),
        }
    }

    pub fn endpoints(&self) -> &[Arc<LocalEndpoint>] {
        &self.endpoints
    }

    /// Every endpoint as a trait object, indexed by rank.
    pub fn messengers(&self) -> Vec<Arc<dyn ActiveMessenger>> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.clone() as Arc<dyn ActiveMessenger>)
            .collect()
    }

    /// Stop every dispatcher and wait for them to exit. Messages still queued
    /// are dropped.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(cluster_size = self.endpoints.len(), "local fabric stopped");
    }
}

impl Drop for LocalFabric {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// One node's view of a [`LocalFabric`].
pub struct LocalEndpoint {
    node: NodeId,
    inboxes: Arc<[flume::Sender<Inbound>]>,
    registered: Mutex<HashSet<String>>,
}

impl LocalEndpoint {
    fn inbox(&self, target: NodeId) -> Result<&flume::Sender<Inbound>, FabricError> {
        self.inboxes
            .get(target.index())
            .ok_or(FabricError::UnknownNode {
                target,
                cluster_size: self.inboxes.len(),
            })
    }
}

impl ActiveMessenger for LocalEndpoint {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn cluster_size(&self) -> usize {
        self.inboxes.len()
    }

    fn send(&self, target: NodeId, handler: &str, payload: Bytes) -> Result<()> {
        trace!(source = %self.node, %target, handler, bytes = payload.len(), "send");
        let ctx = AmContext {
            source: self.node,
            payload,
        };
        self.inbox(target)?
            .send(Inbound::Message {
                handler: handler.to_string(),
                ctx,
            })
            .map_err(|_| FabricError::InboxClosed(target))?;
        Ok(())
    }

    fn register_internal_handler(&self, handler: AmHandler) -> Result<()> {
        if !self.registered.lock().insert(handler.name().to_string()) {
            return Err(FabricError::DuplicateHandler(handler.name().to_string()).into());
        }
        debug!(node = %self.node, handler = handler.name(), "registering handler");
        self.inbox(self.node)?
            .send(Inbound::Register(handler))
            .map_err(|_| FabricError::InboxClosed(self.node))?;
        Ok(())
    }
}

struct Dispatcher {
    node: NodeId,
    handlers: HashMap<String, AmHandler>,
    backlog: HashMap<String, Vec<AmContext>>,
    rx: flume::Receiver<Inbound>,
}

impl Dispatcher {
    async fn run(mut self, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                inbound = self.rx.recv_async() => match inbound {
                    Ok(inbound) => self.process(inbound),
                    Err(_) => break,
                },
            }
        }
        debug!(node = %self.node, parked = self.backlog.len(), "dispatcher exiting");
    }

    fn process(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message { handler, ctx } => match self.handlers.get(&handler) {
                Some(registered) => registered.dispatch(ctx),
                None => {
                    trace!(node = %self.node, %handler, "no handler yet; parking message");
                    self.backlog.entry(handler).or_default().push(ctx);
                }
            },
            Inbound::Register(handler) => {
                let name = handler.name().to_string();
                if let Some(parked) = self.backlog.remove(&name) {
                    debug!(node = %self.node, handler = %name, count = parked.len(), "replaying parked messages");
                    for ctx in parked {
                        handler.dispatch(ctx);
                    }
                }
                self.handlers.insert(name, handler);
            }
        }
    }
}
