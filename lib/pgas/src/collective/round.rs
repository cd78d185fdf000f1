// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Home-node reduction state.
//!
//! The home node keeps one [`ReductionRound`] per tag while contributions are
//! arriving. The value type of a tag is only known to the code that called
//! `all_reduce`, so that call installs a [`RoundFolder`] for its tag; the
//! folder decodes and combines contributions behind a type-erased
//! accumulator. Contributions that arrive before the folder is installed are
//! parked on the tag and folded at install time.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::messages;
use super::ops::ReduceOp;

type Accumulator = Box<dyn Any + Send>;

/// Folds encoded contributions of one tag.
pub(crate) trait RoundFolder: Send + Sync {
    fn fold(&self, accumulator: Option<Accumulator>, body: &[u8]) -> Result<Accumulator, String>;

    fn finish(&self, accumulator: Accumulator) -> Result<Vec<u8>, String>;
}

/// Folds one value per node.
pub(crate) struct ScalarFolder<Op>(PhantomData<fn() -> Op>);

impl<Op: ReduceOp> ScalarFolder<Op> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<Op: ReduceOp> RoundFolder for ScalarFolder<Op> {
    fn fold(&self, accumulator: Option<Accumulator>, body: &[u8]) -> Result<Accumulator, String> {
        let value: Op::Value = messages::decode(body).map_err(|e| e.to_string())?;
        let folded = match accumulator {
            Some(accumulator) => Op::combine(&downcast::<Op::Value>(accumulator)?, &value),
            None => match Op::identity() {
                Some(identity) => Op::combine(&identity, &value),
                None => value,
            },
        };
        Ok(Box::new(folded))
    }

    fn finish(&self, accumulator: Accumulator) -> Result<Vec<u8>, String> {
        let value = downcast::<Op::Value>(accumulator)?;
        messages::encode(&value).map_err(|e| e.to_string())
    }
}

/// Folds one chunk of a slice per node, element-wise.
///
/// A contribution is `(slice_len, chunk)`, so nodes whose slices differ in
/// total length fail in the first round even when that chunk agrees.
pub(crate) struct SliceFolder<Op>(PhantomData<fn() -> Op>);

impl<Op: ReduceOp> SliceFolder<Op> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<Op: ReduceOp> RoundFolder for SliceFolder<Op> {
    fn fold(&self, accumulator: Option<Accumulator>, body: &[u8]) -> Result<Accumulator, String> {
        let (slice_len, values): (u64, Vec<Op::Value>) = messages::decode(body).map_err(|e| e.to_string())?;
        let folded: Vec<Op::Value> = match accumulator {
            Some(accumulator) => {
                let (expected_len, current) = downcast::<(u64, Vec<Op::Value>)>(accumulator)?;
                if expected_len != slice_len || current.len() != values.len() {
                    return Err(format!(
                        "slice contributions disagree on length: {expected_len} vs {slice_len} elements"
                    ));
                }
                current
                    .iter()
                    .zip(values.iter())
                    .map(|(a, b)| Op::combine(a, b))
                    .collect()
            }
            None => match Op::identity() {
                Some(identity) => values.iter().map(|v| Op::combine(&identity, v)).collect(),
                None => values,
            },
        };
        Ok(Box::new((slice_len, folded)))
    }

    fn finish(&self, accumulator: Accumulator) -> Result<Vec<u8>, String> {
        let (_, values) = downcast::<(u64, Vec<Op::Value>)>(accumulator)?;
        messages::encode(&values).map_err(|e| e.to_string())
    }
}

fn downcast<T: 'static>(accumulator: Accumulator) -> Result<T, String> {
    accumulator
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| format!("accumulator is not a {}", std::any::type_name::<T>()))
}

/// In-progress round on the home node.
#[derive(Default)]
struct ReductionRound {
    accumulator: Option<Accumulator>,
    arrived: usize,
    failure: Option<String>,
}

/// One node's arrival at a round.
enum Arrival {
    Body(Vec<u8>),
    /// The node's message was unusable; the round completes with this error.
    Poisoned(String),
}

#[derive(Default)]
struct TagEntry {
    folder: Option<Arc<dyn RoundFolder>>,
    round: Option<ReductionRound>,
    parked: Vec<Arrival>,
}

impl TagEntry {
    fn arrive(
        &mut self,
        folder: &Arc<dyn RoundFolder>,
        tag: &str,
        arrival: Arrival,
        cluster_size: usize,
    ) -> Option<Result<Vec<u8>, String>> {
        let round = self.round.get_or_insert_with(ReductionRound::default);

        if round.failure.is_none() {
            match arrival {
                Arrival::Body(body) => match folder.fold(round.accumulator.take(), &body) {
                    Ok(accumulator) => round.accumulator = Some(accumulator),
                    Err(e) => round.failure = Some(e),
                },
                Arrival::Poisoned(reason) => round.failure = Some(reason),
            }
        }
        round.arrived += 1;
        trace!(tag, arrived = round.arrived, cluster_size, "contribution folded");

        if round.arrived < cluster_size {
            return None;
        }

        let round = self.round.take()?;
        debug!(tag, cluster_size, "round complete");
        Some(match (round.failure, round.accumulator) {
            (Some(failure), _) => Err(failure),
            (None, Some(accumulator)) => folder.finish(accumulator),
            (None, None) => Err("round completed without an accumulator".to_string()),
        })
    }
}

/// Reduction rounds of the home node, keyed by op tag.
pub(crate) struct RoundRegistry {
    cluster_size: usize,
    tags: Mutex<HashMap<String, TagEntry>>,
}

impl RoundRegistry {
    pub(crate) fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            tags: Mutex::new(HashMap::new()),
        }
    }

    /// Install the folder for `tag` if it has none, folding any parked
    /// contributions. Returns the outcome if that completed the round.
    pub(crate) fn install(
        &self,
        tag: &str,
        folder: impl FnOnce() -> Arc<dyn RoundFolder>,
    ) -> Option<Result<Vec<u8>, String>> {
        let mut tags = self.tags.lock();
        let entry = tags.entry(tag.to_string()).or_default();
        if entry.folder.is_some() {
            return None;
        }
        let folder = folder();
        entry.folder = Some(folder.clone());

        let mut outcome = None;
        for arrival in std::mem::take(&mut entry.parked) {
            if let Some(done) = entry.arrive(&folder, tag, arrival, self.cluster_size) {
                outcome = Some(done);
            }
        }
        outcome
    }

    /// Record one node's contribution. Returns the outcome on the last arrival.
    pub(crate) fn contribute(&self, tag: &str, body: Vec<u8>) -> Option<Result<Vec<u8>, String>> {
        self.record(tag, Arrival::Body(body))
    }

    /// Count an arrival for `tag` whose contribution could not be read. The
    /// round still waits for every node, then fails with `reason`.
    pub(crate) fn poison(&self, tag: &str, reason: String) -> Option<Result<Vec<u8>, String>> {
        self.record(tag, Arrival::Poisoned(reason))
    }

    fn record(&self, tag: &str, arrival: Arrival) -> Option<Result<Vec<u8>, String>> {
        let mut tags = self.tags.lock();
        let entry = tags.entry(tag.to_string()).or_default();
        match entry.folder.clone() {
            Some(folder) => entry.arrive(&folder, tag, arrival, self.cluster_size),
            None => {
                trace!(tag, "no folder installed yet; parking contribution");
                entry.parked.push(arrival);
                None
            }
        }
    }

    /// Number of tags with a round currently open.
    pub(crate) fn open_rounds(&self) -> usize {
        self.tags
            .lock()
            .values()
            .filter(|entry| entry.round.is_some())
            .count()
    }
}
