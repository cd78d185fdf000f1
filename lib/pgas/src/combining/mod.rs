// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flat-combining delegation.
//!
//! Many tasks want to update a shared object whose externally visible update,
//! the flush, is expensive. A [`FlatCombiner`] lets them apply their
//! contributions to a cheap local payload instead, and batches everything
//! gathered between two flushes into a single [`Combinable::synchronize`] call.
//! At most one flush is in flight per combiner at any time.
//!
//! ```text
//!   combine ──► active slot ──retire──► flushing slot ──synchronize──► free list
//!                  ▲                                                     │
//!                  └─────────────────────── recycle ─────────────────────┘
//! ```
//!
//! The task that retires a slot while no flush is running flushes it itself.
//! Otherwise callers wait on their slot and are woken either when it has been
//! flushed or, for the oldest waiter, to flush it themselves once the previous
//! flush completes.

mod slots;

use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use slots::{SlotArena, SlotId, SlotState, Wake};

/// Result of applying a contribution to a payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FcStatus {
    /// The contribution took effect locally; no flush is needed for it.
    Satisfied,
    /// The contribution needs a flush before it is visible.
    Blocked,
    /// The contribution completed a blocked one already in the payload.
    Matched,
}

/// A payload that can absorb contributions and publish them in one flush.
#[async_trait]
pub trait Combinable: Send + 'static {
    type Contribution: Send;

    fn apply(&mut self, contribution: Self::Contribution) -> FcStatus;

    /// No further contributions fit until the payload is flushed.
    fn is_full(&self) -> bool;

    /// Publish everything applied since the last clear.
    async fn synchronize(&mut self);

    fn clear(&mut self);

    fn clone_fresh(&self) -> Self
    where
        Self: Sized;
}

/// Snapshot of a combiner's counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CombinerStats {
    pub contributions: u64,
    pub flushes: u64,
    pub slots_allocated: usize,
    pub slots_free: usize,
    pub flush_in_flight: bool,
    pub active_waiters: usize,
}

struct State<P> {
    arena: SlotArena<P>,
    active: SlotId,
    in_flight: bool,
    retired: VecDeque<SlotId>,
    contributions: u64,
    flushes: u64,
}

enum Next {
    Done,
    Flush(SlotId),
    Wait(tokio::sync::oneshot::Receiver<Wake>),
}

impl<P: Combinable> State<P> {
    /// Close the active slot and install a fresh one in its place.
    fn retire_active(&mut self) -> SlotId {
        let retired = self.active;
        self.arena.retire(retired);
        self.active = self.arena.activate();
        retired
    }

    /// Pass the in-flight flush to the next slot that needs it. Returns the
    /// slot the caller must flush itself when no waiter could take it.
    fn hand_off(&mut self) -> Option<SlotId> {
        let next = match self.retired.pop_front() {
            Some(queued) => queued,
            None if self.arena.has_waiters(self.active) => self.retire_active(),
            None => {
                self.in_flight = false;
                return None;
            }
        };
        debug_assert_eq!(self.arena.state(next), SlotState::Retired);

        if self.arena.wake_oldest(next, || Wake::Flush(next)) {
            trace!(slot = ?next, "flush handed to oldest waiter");
            None
        } else {
            trace!(slot = ?next, "no waiter left on slot; flushing it in place");
            Some(next)
        }
    }
}

/// Delegates contributions to a shared [`Combinable`] payload, bounding the
/// number of concurrent flushes to one.
pub struct FlatCombiner<P> {
    state: Mutex<State<P>>,
}

impl<P: Combinable> FlatCombiner<P> {
    pub fn new(payload: P) -> Self {
        let (arena, active) = SlotArena::new(payload);
        Self {
            state: Mutex::new(State {
                arena,
                active,
                in_flight: false,
                retired: VecDeque::new(),
                contributions: 0,
                flushes: 0,
            }),
        }
    }

    /// Apply `contribution` and return once it is visible.
    ///
    /// A `Satisfied` contribution returns without suspending. A `Blocked` one
    /// returns after the flush of the slot it landed in. The future must be
    /// driven to completion: a caller chosen as flusher holds the combiner's
    /// only flush.
    pub async fn combine(&self, contribution: P::Contribution) -> Result<()> {
        let next = self.submit(contribution);

        let mut slot = match next {
            Next::Done => return Ok(()),
            Next::Flush(slot) => slot,
            Next::Wait(rx) => match rx.await {
                Ok(Wake::Completed) => return Ok(()),
                Ok(Wake::Flush(slot)) => slot,
                Err(_) => return Err(anyhow!("combiner slot dropped its waiter")),
            },
        };

        loop {
            let mut payload = self.state.lock().arena.begin_flush(slot);
            trace!(slot = ?slot, "flushing");
            payload.synchronize().await;

            let handed = {
                let mut state = self.state.lock();
                let state = &mut *state;
                state.flushes += 1;
                let woken = state.arena.wake_all(slot);
                state.arena.release(slot, payload);
                debug!(slot = ?slot, woken, flushes = state.flushes, "flush complete");
                state.hand_off()
            };

            match handed {
                Some(next) => slot = next,
                None => return Ok(()),
            }
        }
    }

    fn submit(&self, contribution: P::Contribution) -> Next {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.contributions += 1;

        let active = state.active;
        let payload = state.arena.payload_mut(active);
        match payload.apply(contribution) {
            FcStatus::Satisfied => Next::Done,
            FcStatus::Matched => {
                state.arena.wake_oldest(active, || Wake::Completed);
                Next::Done
            }
            FcStatus::Blocked if payload.is_full() => {
                let retired = state.retire_active();
                if state.in_flight {
                    state.retired.push_back(retired);
                    trace!(slot = ?retired, queued = state.retired.len(), "full slot queued for flush");
                    Next::Wait(state.arena.enqueue_waiter(retired))
                } else {
                    state.in_flight = true;
                    Next::Flush(retired)
                }
            }
            FcStatus::Blocked if !state.in_flight => {
                state.in_flight = true;
                Next::Flush(state.retire_active())
            }
            FcStatus::Blocked => Next::Wait(state.arena.enqueue_waiter(active)),
        }
    }

    /// Read the payload currently accepting contributions.
    pub fn inspect<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let state = self.state.lock();
        f(state.arena.payload(state.active))
    }

    pub fn stats(&self) -> CombinerStats {
        let state = self.state.lock();
        CombinerStats {
            contributions: state.contributions,
            flushes: state.flushes,
            slots_allocated: state.arena.len(),
            slots_free: state.arena.free_len(),
            flush_in_flight: state.in_flight,
            active_waiters: state.arena.waiters(state.active),
        }
    }
}
