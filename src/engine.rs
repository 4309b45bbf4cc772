/*!
Event engine: the clocked priority queue driving the whole simulation.

Purpose
- Own the absolute cycle counter and the ordered set of pending events.
- Give every component a cheap way to say "run my handler again at
  `now + offset`" without ever blocking.

Behavioral model
- Events are registered once and identified by `EventId`; each carries an
  opaque target value that the owner uses to dispatch back to the right
  handler.
- Enqueuing an event that is already queued for an earlier-or-equal cycle is
  a no-op; enqueuing it for an earlier cycle than currently scheduled moves
  it forward (earliest-of semantics). The heap is never searched: stale
  entries are skipped when popped.
- Events scheduled for the same cycle run in FIFO order of enqueueing,
  which keeps multi-component interactions deterministic.

Integration notes
- The `System` facade owns the engine and drives `pop()` in its run loop;
  components only ever call `enqueue`/`enqueue_in`.
*/

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Absolute simulation time in clock cycles.
pub type Cycle = u64;

/// Handle to a registered event. Cheap to copy, stable for the lifetime of
/// the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(pub(crate) usize);

struct EventSlot<T> {
    target: T,
    /// Cycle the event is currently queued for, if any. Cleared when the
    /// event fires; used to drop stale heap entries.
    scheduled: Option<Cycle>,
}

/// Ordered event queue keyed by `(cycle, enqueue sequence)`.
pub struct Engine<T> {
    now: Cycle,
    seq: u64,
    heap: BinaryHeap<Reverse<(Cycle, u64, usize)>>,
    slots: Vec<EventSlot<T>>,
}

impl<T: Copy> Engine<T> {
    pub fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            heap: BinaryHeap::new(),
            slots: Vec::new(),
        }
    }

    /// Current cycle. Advances only when an event fires.
    #[inline]
    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Register a new event bound to `target`. The event starts unqueued.
    pub fn new_event(&mut self, target: T) -> EventId {
        self.slots.push(EventSlot {
            target,
            scheduled: None,
        });
        EventId(self.slots.len() - 1)
    }

    /// Queue `ev` for the next cycle. Shorthand for `enqueue_in(ev, 1)`,
    /// which is by far the most common retry pattern in component FSMs.
    #[inline]
    pub fn enqueue(&mut self, ev: EventId) {
        self.enqueue_in(ev, 1);
    }

    /// Queue `ev` to fire `offset` cycles from now (minimum one cycle).
    ///
    /// If the event is already queued for an earlier or equal cycle this is
    /// a no-op; if it is queued for a later cycle, the earlier time wins.
    pub fn enqueue_in(&mut self, ev: EventId, offset: Cycle) {
        let at = self.now + offset.max(1);
        let slot = &mut self.slots[ev.0];
        if let Some(cur) = slot.scheduled {
            if cur <= at {
                return;
            }
        }
        slot.scheduled = Some(at);
        self.seq += 1;
        self.heap.push(Reverse((at, self.seq, ev.0)));
    }

    /// Whether `ev` is currently queued.
    #[inline]
    pub fn is_enqueued(&self, ev: EventId) -> bool {
        self.slots[ev.0].scheduled.is_some()
    }

    /// Pop the next live event, advancing `now` to its cycle. Returns
    /// `None` when the queue has drained.
    pub fn pop(&mut self) -> Option<(EventId, T)> {
        while let Some(Reverse((at, _seq, idx))) = self.heap.pop() {
            let slot = &mut self.slots[idx];
            // Skip heap entries that were superseded by a re-enqueue or
            // already fired.
            if slot.scheduled != Some(at) {
                continue;
            }
            slot.scheduled = None;
            debug_assert!(at >= self.now, "event queue went backwards");
            self.now = at;
            return Some((EventId(idx), slot.target));
        }
        None
    }

    /// Like `pop`, but refuses to cross `limit`: events scheduled after it
    /// stay queued and `None` is returned.
    pub fn pop_before(&mut self, limit: Cycle) -> Option<(EventId, T)> {
        loop {
            let &Reverse((at, _, idx)) = self.heap.peek()?;
            if self.slots[idx].scheduled != Some(at) {
                // Stale entry; discard and keep looking.
                self.heap.pop();
                continue;
            }
            if at > limit {
                return None;
            }
            self.heap.pop();
            self.slots[idx].scheduled = None;
            self.now = at;
            return Some((EventId(idx), self.slots[idx].target));
        }
    }

    /// Move the clock forward with no event firing (end of a bounded run).
    pub fn advance_to(&mut self, cycle: Cycle) {
        self.now = self.now.max(cycle);
    }

    /// Peek the cycle of the next live event without firing it.
    pub fn next_cycle(&self) -> Option<Cycle> {
        self.heap
            .iter()
            .filter(|Reverse((at, _, idx))| self.slots[*idx].scheduled == Some(*at))
            .map(|Reverse((at, _, _))| *at)
            .min()
    }
}

impl<T: Copy> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_cycle_order() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(1);
        let b = e.new_event(2);
        e.enqueue_in(a, 5);
        e.enqueue_in(b, 2);

        assert_eq!(e.pop(), Some((b, 2)));
        assert_eq!(e.now(), 2);
        assert_eq!(e.pop(), Some((a, 1)));
        assert_eq!(e.now(), 5);
        assert_eq!(e.pop(), None);
    }

    #[test]
    fn same_cycle_events_fire_in_fifo_order() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(1);
        let b = e.new_event(2);
        let c = e.new_event(3);
        e.enqueue_in(b, 3);
        e.enqueue_in(a, 3);
        e.enqueue_in(c, 3);

        assert_eq!(e.pop().unwrap().1, 2);
        assert_eq!(e.pop().unwrap().1, 1);
        assert_eq!(e.pop().unwrap().1, 3);
    }

    #[test]
    fn re_enqueue_is_noop_when_already_earlier() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(7);
        e.enqueue_in(a, 2);
        e.enqueue_in(a, 10);

        assert_eq!(e.pop(), Some((a, 7)));
        assert_eq!(e.now(), 2);
        // The later request must not have left a second firing behind.
        assert_eq!(e.pop(), None);
    }

    #[test]
    fn earlier_re_enqueue_wins() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(7);
        e.enqueue_in(a, 10);
        e.enqueue_in(a, 2);

        assert_eq!(e.pop(), Some((a, 7)));
        assert_eq!(e.now(), 2);
        assert_eq!(e.pop(), None);
    }

    #[test]
    fn zero_offset_means_next_cycle() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(7);
        e.enqueue_in(a, 0);
        assert_eq!(e.pop(), Some((a, 7)));
        assert_eq!(e.now(), 1);
    }

    #[test]
    fn event_can_refire_after_pop() {
        let mut e: Engine<u32> = Engine::new();
        let a = e.new_event(7);
        e.enqueue(a);
        assert!(e.is_enqueued(a));
        assert_eq!(e.pop(), Some((a, 7)));
        assert!(!e.is_enqueued(a));
        e.enqueue(a);
        assert_eq!(e.pop(), Some((a, 7)));
        assert_eq!(e.now(), 2);
    }
}
