// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster-wide all-reduce and barrier.
//!
//! Every node calls the same operation once per logical invocation with its own
//! contribution. Contributions travel as one-way messages to the home node,
//! which folds them as they arrive; on the last arrival it broadcasts the result
//! to every node, itself included, and the suspended callers resume.
//!
//! ```text
//!  node1 ──contribute──┐
//!  node2 ──contribute──┼──► home (node0): fold, fold, fold ──result──► node0, node1, node2
//!  node0 ──contribute──┘
//! ```
//!
//! A round is identified by its op's tag, so at most one round per op may be
//! outstanding across the cluster. There is no timeout or fault detection: a
//! node that never calls the operation stalls every other node indefinitely.
//!
//! # Example
//!
//! ```rust,ignore
//! use dynamo_pgas::collective::{CollectiveReducer, ops::Sum};
//!
//! let reducer = CollectiveReducer::new(messenger, CollectiveConfig::default())?;
//! let total = reducer.all_reduce::<Sum<u64>>(local_count).await?;
//! reducer.barrier().await?;
//! ```

mod messages;
pub mod ops;
mod round;

pub use ops::ReduceOp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Result, bail};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::NodeId;
use crate::am::{ActiveMessenger, AmContext, AmHandler};
use crate::config::CollectiveConfig;
use messages::{CONTRIBUTE_HANDLER, Contribution, Outcome, RESULT_HANDLER};
use ops::BarrierOp;
use round::{RoundFolder, RoundRegistry, ScalarFolder, SliceFolder};

/// Collective errors
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("a reduction round for '{tag}' is already in flight on this node")]
    RoundInFlight { tag: String },

    #[error("failed to encode or decode a reduction value: {0}")]
    Codec(String),

    #[error("failed to send a reduction message: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("reduction round for '{tag}' was abandoned before its result arrived")]
    Cancelled { tag: String },
}

type RoundResult = Result<Vec<u8>, String>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<RoundResult>,
}

/// Removes this call's waiter if the call ends before the result arrives.
struct WaiterGuard<'a> {
    pending: &'a DashMap<String, Waiter>,
    tag: &'a str,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove_if(self.tag, |_, waiter| waiter.id == self.id);
    }
}

/// All-reduce and barrier over an [`ActiveMessenger`].
///
/// One reducer per messenger: it registers the system handlers
/// `_pgas_reduce_contribute` and `_pgas_reduce_result`.
pub struct CollectiveReducer {
    messenger: Arc<dyn ActiveMessenger>,
    home: NodeId,
    max_message_bytes: usize,
    rounds: RoundRegistry,
    pending: DashMap<String, Waiter>,
    next_waiter_id: AtomicU64,
}

impl CollectiveReducer {
    pub fn new(messenger: Arc<dyn ActiveMessenger>, config: CollectiveConfig) -> Result<Arc<Self>> {
        let cluster_size = messenger.cluster_size();
        let home = NodeId::new(config.home_node);
        if home.index() >= cluster_size {
            bail!("home node {home} is not a member of a cluster of {cluster_size} nodes");
        }
        if config.max_message_bytes == 0 {
            bail!("max_message_bytes must be at least 1");
        }

        let reducer = Arc::new(Self {
            messenger,
            home,
            max_message_bytes: config.max_message_bytes,
            rounds: RoundRegistry::new(cluster_size),
            pending: DashMap::new(),
            next_waiter_id: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&reducer);
        reducer
            .messenger
            .register_internal_handler(AmHandler::new(CONTRIBUTE_HANDLER, move |ctx| {
                with_reducer(&weak, |reducer| reducer.on_contribution(ctx))
            }))?;

        let weak = Arc::downgrade(&reducer);
        reducer
            .messenger
            .register_internal_handler(AmHandler::new(RESULT_HANDLER, move |ctx| {
                with_reducer(&weak, |reducer| reducer.on_result(ctx))
            }))?;

        debug!(node = %reducer.node_id(), %home, cluster_size, "collective reducer ready");
        Ok(reducer)
    }

    pub fn node_id(&self) -> NodeId {
        self.messenger.node_id()
    }

    pub fn cluster_size(&self) -> usize {
        self.messenger.cluster_size()
    }

    pub fn home_node(&self) -> NodeId {
        self.home
    }

    fn is_home(&self) -> bool {
        self.node_id() == self.home
    }

    /// Reduce one value per node; every node receives the result.
    pub async fn all_reduce<Op: ReduceOp>(&self, value: Op::Value) -> Result<Op::Value, CollectiveError> {
        let body = self
            .round(Op::tag(), &value, || {
                Arc::new(ScalarFolder::<Op>::new()) as Arc<dyn RoundFolder>
            })
            .await?;
        messages::decode(&body)
    }

    /// Reduce a slice element-wise across nodes, in place.
    ///
    /// The slice is reduced in chunks of at most
    /// `max_message_bytes / size_of::<Op::Value>()` elements (at least one), one
    /// round per chunk; an empty slice still takes one round. Every node must
    /// pass a slice of the same length: each chunk carries the slice length, so
    /// a disagreement fails the first round with [`CollectiveError::Codec`] on
    /// every node.
    pub async fn all_reduce_slice<Op: ReduceOp>(&self, values: &mut [Op::Value]) -> Result<(), CollectiveError> {
        let tag = slice_tag::<Op>();
        let slice_len = values.len();
        if values.is_empty() {
            self.reduce_chunk::<Op>(&tag, slice_len, values).await?;
            return Ok(());
        }
        for chunk in values.chunks_mut(self.chunk_len::<Op::Value>()) {
            let reduced = self.reduce_chunk::<Op>(&tag, slice_len, chunk).await?;
            chunk.clone_from_slice(&reduced);
        }
        Ok(())
    }

    /// Reduce `input` element-wise across nodes, writing the result to `output`.
    ///
    /// # Panics
    ///
    /// Panics if `input` and `output` differ in length.
    pub async fn all_reduce_slice_into<Op: ReduceOp>(
        &self,
        input: &[Op::Value],
        output: &mut [Op::Value],
    ) -> Result<(), CollectiveError> {
        assert_eq!(
            input.len(),
            output.len(),
            "all_reduce_slice_into: input and output lengths differ"
        );
        let tag = slice_tag::<Op>();
        let slice_len = input.len();
        if input.is_empty() {
            self.reduce_chunk::<Op>(&tag, slice_len, input).await?;
            return Ok(());
        }
        let chunk_len = self.chunk_len::<Op::Value>();
        for (src, dst) in input.chunks(chunk_len).zip(output.chunks_mut(chunk_len)) {
            let reduced = self.reduce_chunk::<Op>(&tag, slice_len, src).await?;
            dst.clone_from_slice(&reduced);
        }
        Ok(())
    }

    /// Wait until every node of the cluster has reached the barrier.
    pub async fn barrier(&self) -> Result<(), CollectiveError> {
        self.all_reduce::<BarrierOp>(()).await
    }

    fn chunk_len<T>(&self) -> usize {
        (self.max_message_bytes / std::mem::size_of::<T>().max(1)).max(1)
    }

    async fn reduce_chunk<Op: ReduceOp>(
        &self,
        tag: &str,
        slice_len: usize,
        chunk: &[Op::Value],
    ) -> Result<Vec<Op::Value>, CollectiveError> {
        let body = self
            .round(tag, &(slice_len as u64, chunk), || {
                Arc::new(SliceFolder::<Op>::new()) as Arc<dyn RoundFolder>
            })
            .await?;
        let reduced: Vec<Op::Value> = messages::decode(&body)?;
        if reduced.len() != chunk.len() {
            return Err(CollectiveError::Codec(format!(
                "reduced chunk has {} elements, expected {}",
                reduced.len(),
                chunk.len()
            )));
        }
        Ok(reduced)
    }

    /// Run one round: contribute `value` under `tag` and wait for the result.
    async fn round<T: serde::Serialize + ?Sized>(
        &self,
        tag: &str,
        value: &T,
        folder: impl FnOnce() -> Arc<dyn RoundFolder>,
    ) -> Result<Vec<u8>, CollectiveError> {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(tag.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CollectiveError::RoundInFlight {
                    tag: tag.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Waiter { id, tx });
            }
        }
        let _guard = WaiterGuard {
            pending: &self.pending,
            tag,
            id,
        };

        if self.is_home() {
            if let Some(outcome) = self.rounds.install(tag, folder) {
                self.broadcast(tag, outcome)?;
            }
        }

        let contribution = Contribution {
            tag: tag.to_string(),
            body: messages::encode(value)?,
        };
        trace!(node = %self.node_id(), tag, home = %self.home, "contributing");
        self.messenger
            .send(self.home, CONTRIBUTE_HANDLER, messages::encode_bytes(&contribution)?)
            .map_err(CollectiveError::Transport)?;

        match rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(failure)) => Err(CollectiveError::Codec(failure)),
            Err(_) => Err(CollectiveError::Cancelled {
                tag: tag.to_string(),
            }),
        }
    }

    fn on_contribution(&self, ctx: AmContext) {
        let contribution: Contribution = match messages::decode(&ctx.payload) {
            Ok(contribution) => contribution,
            Err(e) => {
                self.on_undecodable_contribution(&ctx, e);
                return;
            }
        };
        trace!(node = %self.node_id(), source = %ctx.source, tag = %contribution.tag, "contribution arrived");

        if !self.is_home() {
            warn!(node = %self.node_id(), source = %ctx.source, tag = %contribution.tag, "contribution sent to a node that is not home");
            return;
        }

        if let Some(outcome) = self.rounds.contribute(&contribution.tag, contribution.body) {
            if let Err(e) = self.broadcast(&contribution.tag, outcome) {
                warn!(tag = %contribution.tag, "failed to broadcast reduction result: {e}");
            }
        }
    }

    /// Fail the round of a contribution whose tag is still readable, so every
    /// node gets the error instead of waiting on an arrival that never counts.
    fn on_undecodable_contribution(&self, ctx: &AmContext, error: CollectiveError) {
        let Some(tag) = Contribution::peek_tag(&ctx.payload) else {
            warn!(node = %self.node_id(), source = %ctx.source, "dropping undecodable contribution: {error}");
            return;
        };
        if !self.is_home() {
            warn!(node = %self.node_id(), source = %ctx.source, %tag, "contribution sent to a node that is not home");
            return;
        }
        warn!(node = %self.node_id(), source = %ctx.source, %tag, "failing round on undecodable contribution: {error}");
        let reason = format!("contribution from {} is undecodable: {error}", ctx.source);
        if let Some(outcome) = self.rounds.poison(&tag, reason) {
            if let Err(e) = self.broadcast(&tag, outcome) {
                warn!(%tag, "failed to broadcast reduction result: {e}");
            }
        }
    }

    fn broadcast(&self, tag: &str, result: RoundResult) -> Result<(), CollectiveError> {
        let payload = messages::encode_bytes(&Outcome {
            tag: tag.to_string(),
            result,
        })?;
        for node in NodeId::all(self.cluster_size()) {
            self.messenger
                .send(node, RESULT_HANDLER, payload.clone())
                .map_err(CollectiveError::Transport)?;
        }
        debug!(tag, cluster_size = self.cluster_size(), "reduction result broadcast");
        Ok(())
    }

    fn on_result(&self, ctx: AmContext) {
        let outcome: Outcome = match messages::decode(&ctx.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(node = %self.node_id(), source = %ctx.source, "dropping undecodable reduction result: {e}");
                return;
            }
        };
        match self.pending.remove(&outcome.tag) {
            Some((_, waiter)) => {
                trace!(node = %self.node_id(), tag = %outcome.tag, "waking reducer caller");
                let _ = waiter.tx.send(outcome.result);
            }
            None => {
                warn!(node = %self.node_id(), tag = %outcome.tag, "reduction result with no waiting caller");
            }
        }
    }

    /// Tags with a round open on this node (always zero off the home node).
    pub fn open_rounds(&self) -> usize {
        self.rounds.open_rounds()
    }
}

fn with_reducer(weak: &Weak<CollectiveReducer>, f: impl FnOnce(&CollectiveReducer)) {
    match weak.upgrade() {
        Some(reducer) => f(&reducer),
        None => trace!("reducer dropped; ignoring message"),
    }
}

fn slice_tag<Op: ReduceOp>() -> String {
    format!("{}[]", Op::tag())
}
