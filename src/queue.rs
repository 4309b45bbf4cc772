/*!
FIFO primitive with an intrinsic one-cycle enqueue latency.

Models the wire delay of a latched hardware FIFO: an element pushed at
cycle N is not visible at the head before cycle N+1. Pushing wakes the
bound event so the consumer re-checks its state on the next cycle.

`len()` deliberately counts pushed-but-not-yet-visible entries: capacity
and backpressure tests care about occupancy, not visibility.
*/

use std::collections::VecDeque;

use crate::engine::{Cycle, Engine, EventId};

/// FIFO with one-cycle visibility latency and a bound wake event.
pub struct Queue<P> {
    items: VecDeque<(Cycle, P)>,
    wake: EventId,
}

impl<P: Copy> Queue<P> {
    /// Create a queue bound to `wake`; the event is enqueued for the next
    /// cycle on every push.
    pub fn new(wake: EventId) -> Self {
        Self {
            items: VecDeque::new(),
            wake,
        }
    }

    /// Push an element; it becomes head-visible one cycle later.
    pub fn push_back<T: Copy>(&mut self, engine: &mut Engine<T>, item: P) {
        self.items.push_back((engine.now() + 1, item));
        engine.enqueue(self.wake);
    }

    /// Raw occupancy, including entries that are not yet visible.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Head element, only once its visibility cycle has passed.
    #[inline]
    pub fn head(&self, now: Cycle) -> Option<P> {
        match self.items.front() {
            Some(&(visible_at, item)) if visible_at <= now => Some(item),
            _ => None,
        }
    }

    /// Remove the head. Only legal after `head(now)` returned `Some`.
    pub fn pop(&mut self) -> P {
        let (_, item) = self
            .items
            .pop_front()
            .expect("pop on empty queue");
        item
    }

    /// Event bound at construction, re-armed by `push_back`.
    #[inline]
    pub fn wake_event(&self) -> EventId {
        self.wake
    }

    /// Drop all entries (reset path).
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterate over all queued items regardless of visibility.
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.items.iter().map(|(_, p)| p)
    }
}
