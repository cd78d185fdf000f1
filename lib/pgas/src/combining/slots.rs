// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Slot arena backing a [`FlatCombiner`](super::FlatCombiner).
//!
//! Slots are addressed by [`SlotId`] and recycled through a free list, so a
//! steady-state combiner stops allocating once it has as many slots as it ever
//! had retired at once.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use super::Combinable;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Accepting contributions.
    Active,
    /// Closed to contributions, queued for its flush.
    Retired,
    /// Payload handed to a flusher.
    Flushing,
    /// On the free list.
    Free,
}

/// How a suspended `combine` call is resumed.
#[derive(Debug)]
pub(crate) enum Wake {
    /// The slot holding the caller's contribution has been flushed.
    Completed,
    /// The caller must flush this slot.
    Flush(SlotId),
}

struct Slot<P> {
    state: SlotState,
    payload: Option<P>,
    waiters: VecDeque<oneshot::Sender<Wake>>,
}

pub(crate) struct SlotArena<P> {
    slots: Vec<Slot<P>>,
    free: Vec<SlotId>,
    prototype: P,
}

impl<P: Combinable> SlotArena<P> {
    /// Arena whose first slot holds `payload`, already active.
    pub(crate) fn new(payload: P) -> (Self, SlotId) {
        let prototype = payload.clone_fresh();
        let arena = Self {
            slots: vec![Slot {
                state: SlotState::Active,
                payload: Some(payload),
                waiters: VecDeque::new(),
            }],
            free: Vec::new(),
            prototype,
        };
        (arena, SlotId(0))
    }

    /// Take a slot off the free list, or grow the arena, and mark it active.
    pub(crate) fn activate(&mut self) -> SlotId {
        match self.free.pop() {
            Some(id) => {
                let slot = &mut self.slots[id.0];
                debug_assert_eq!(slot.state, SlotState::Free);
                slot.state = SlotState::Active;
                id
            }
            None => {
                self.slots.push(Slot {
                    state: SlotState::Active,
                    payload: Some(self.prototype.clone_fresh()),
                    waiters: VecDeque::new(),
                });
                SlotId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn state(&self, id: SlotId) -> SlotState {
        self.slots[id.0].state
    }

    pub(crate) fn retire(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.0];
        debug_assert_eq!(slot.state, SlotState::Active);
        slot.state = SlotState::Retired;
    }

    pub(crate) fn payload(&self, id: SlotId) -> &P {
        self.slots[id.0]
            .payload
            .as_ref()
            .expect("only a flushing slot gives up its payload")
    }

    pub(crate) fn payload_mut(&mut self, id: SlotId) -> &mut P {
        self.slots[id.0]
            .payload
            .as_mut()
            .expect("only a flushing slot gives up its payload")
    }

    /// Hand the slot's payload to its flusher.
    pub(crate) fn begin_flush(&mut self, id: SlotId) -> P {
        let slot = &mut self.slots[id.0];
        assert_eq!(slot.state, SlotState::Retired, "slot {id:?} flushed twice");
        slot.state = SlotState::Flushing;
        slot.payload
            .take()
            .expect("a retired slot still holds its payload")
    }

    /// Take back a flushed payload, clear it and put the slot on the free list.
    pub(crate) fn release(&mut self, id: SlotId, mut payload: P) {
        let slot = &mut self.slots[id.0];
        debug_assert_eq!(slot.state, SlotState::Flushing);
        debug_assert!(slot.waiters.is_empty());
        payload.clear();
        slot.payload = Some(payload);
        slot.state = SlotState::Free;
        self.free.push(id);
    }

    pub(crate) fn enqueue_waiter(&mut self, id: SlotId) -> oneshot::Receiver<Wake> {
        let (tx, rx) = oneshot::channel();
        self.slots[id.0].waiters.push_back(tx);
        rx
    }

    pub(crate) fn has_waiters(&self, id: SlotId) -> bool {
        !self.slots[id.0].waiters.is_empty()
    }

    pub(crate) fn waiters(&self, id: SlotId) -> usize {
        self.slots[id.0].waiters.len()
    }

    /// Wake the oldest waiter still listening. Returns false if none was.
    pub(crate) fn wake_oldest(&mut self, id: SlotId, wake: impl Fn() -> Wake) -> bool {
        let waiters = &mut self.slots[id.0].waiters;
        while let Some(tx) = waiters.pop_front() {
            if tx.send(wake()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Wake every waiter as completed. Returns how many were woken.
    pub(crate) fn wake_all(&mut self, id: SlotId) -> usize {
        self.slots[id.0]
            .waiters
            .drain(..)
            .filter(|tx| !tx.is_closed())
            .map(|tx| tx.send(Wake::Completed).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }
}
