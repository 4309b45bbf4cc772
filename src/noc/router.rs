/*!
Mesh router: five directional input queues, five output queues, round-robin
arbitration, credit-style backpressure.

Behavioral model
- Stage 1 (arbitration): starting at the round-robin cursor, each input
  queue with a visible head gets one chance per cycle to move its flit onto
  the output queue selected by dimension-ordered routing. An output accepts
  at most one flit from arbitration per cycle, and flits are never moved
  onto a stalled or full output. The cursor advances unconditionally at the
  start of arbitration.
- Stage 2 (delivery): output queues are served in fixed direction order;
  each delivers at most one visible flit per cycle to the next-hop router
  (or to the local network interface when the destination is this node).
  A full downstream input queue stalls the output until the downstream
  router unstalls it.
- Backpressure: `handle_request` accepts one flit beyond `queue_size` and
  returns `true` to tell the predecessor to stop sending on that direction.
  When the over-full queue drains back to `queue_size`, the predecessor is
  unstalled. Occupancy beyond `queue_size + 1` is a fatal modeling error.

Routing policy
- XY dimension order: X is fully reduced before Y moves. Off-grid
  destination coordinates are clamped so edge traffic leaves the fabric
  through the local port of the nearest in-grid node. The ZXY variant of
  the policy is expressed by `next_hop_zxy`, which reduces Z first and
  degenerates to XY on a single-layer mesh.
*/

#[cfg(feature = "flit_trace")]
use log::trace;

use crate::engine::{Cycle, EventId};
use crate::queue::Queue;
use crate::req::ReqId;
use crate::system::System;

use super::{Dir, NUM_DIRS};

/// Traffic/contention counters, the simulator's observable output.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Flits moved from an input to an output queue.
    pub arbitrated: u64,
    /// Flits handed to the next-hop router.
    pub forwarded: u64,
    /// Flits delivered through the local port.
    pub delivered_local: u64,
    /// Times this router told a predecessor to stall.
    pub backpressure_events: u64,
}

pub struct Router {
    pub x: i32,
    pub y: i32,
    pub stats: RouterStats,
    queue_size: usize,
    input: [Queue<ReqId>; NUM_DIRS],
    output: [Queue<ReqId>; NUM_DIRS],
    /// Next input direction arbitration starts from.
    current_queue: usize,
    /// Per-output stall bits (downstream full or force-stalled).
    out_stalled: [bool; NUM_DIRS],
    /// Cycle an output last accepted a flit from arbitration.
    out_accepted_at: [Option<Cycle>; NUM_DIRS],
    /// Cycle an output last delivered a flit downstream.
    out_delivered_at: [Option<Cycle>; NUM_DIRS],
    pub(crate) fsm: EventId,
}

impl Router {
    pub fn new(x: i32, y: i32, queue_size: usize, fsm: EventId) -> Self {
        Self {
            x,
            y,
            stats: RouterStats::default(),
            queue_size,
            input: std::array::from_fn(|_| Queue::new(fsm)),
            output: std::array::from_fn(|_| Queue::new(fsm)),
            current_queue: 0,
            out_stalled: [false; NUM_DIRS],
            out_accepted_at: [None; NUM_DIRS],
            out_delivered_at: [None; NUM_DIRS],
            fsm,
        }
    }

    pub fn reset(&mut self) {
        self.current_queue = 0;
        self.out_stalled = [false; NUM_DIRS];
        self.out_accepted_at = [None; NUM_DIRS];
        self.out_delivered_at = [None; NUM_DIRS];
        for q in self.input.iter_mut().chain(self.output.iter_mut()) {
            q.clear();
        }
    }

    /// Input queue fed by the neighbor (or local NI) at `(from_x, from_y)`.
    pub fn req_queue(&self, from_x: i32, from_y: i32) -> usize {
        if from_x != self.x {
            if from_x < self.x { Dir::Left } else { Dir::Right }
        } else if from_y != self.y {
            if from_y < self.y { Dir::Down } else { Dir::Up }
        } else {
            Dir::Local
        }
        .index()
    }

    /// Coordinates of the component on the other side of a queue index.
    pub fn pos_from_queue(&self, queue: usize) -> (i32, i32) {
        match Dir::ALL[queue] {
            Dir::Right => (self.x + 1, self.y),
            Dir::Left => (self.x - 1, self.y),
            Dir::Up => (self.x, self.y + 1),
            Dir::Down => (self.x, self.y - 1),
            Dir::Local => (self.x, self.y),
        }
    }

    /// XY dimension-ordered next hop toward already-clamped `(dx, dy)`.
    pub fn next_hop(&self, dx: i32, dy: i32) -> (i32, i32) {
        if dx != self.x {
            (if dx < self.x { self.x - 1 } else { self.x + 1 }, self.y)
        } else if dy != self.y {
            (self.x, if dy < self.y { self.y - 1 } else { self.y + 1 })
        } else {
            (self.x, self.y)
        }
    }

    /// Occupancy of an input queue, for invariant checks.
    pub fn input_len(&self, queue: usize) -> usize {
        self.input[queue].len()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn is_output_stalled(&self, dir: Dir) -> bool {
        self.out_stalled[dir.index()]
    }

    /// Whether any queue holds work.
    pub fn is_idle(&self) -> bool {
        self.input.iter().all(Queue::is_empty) && self.output.iter().all(Queue::is_empty)
    }
}

/// ZXY dimension-ordered next hop for the 7-port mesh variant: Z is fully
/// reduced, then X, then Y. On a single-layer mesh this is plain XY.
pub fn next_hop_zxy(
    (x, y, z): (i32, i32, i32),
    (dx, dy, dz): (i32, i32, i32),
) -> (i32, i32, i32) {
    if dz != z {
        (x, y, if dz < z { z - 1 } else { z + 1 })
    } else if dx != x {
        (if dx < x { x - 1 } else { x + 1 }, y, z)
    } else if dy != y {
        (x, if dy < y { y - 1 } else { y + 1 }, z)
    } else {
        (x, y, z)
    }
}

impl System {
    /// Push `req` onto the input queue fed from `(from_x, from_y)`.
    ///
    /// Returns `true` when the queue is now above `queue_size`, telling the
    /// predecessor to stall its output toward this router.
    pub(crate) fn router_handle_request(
        &mut self,
        node: usize,
        req: ReqId,
        from_x: i32,
        from_y: i32,
    ) -> bool {
        let router = &mut self.noc.routers[node];
        let queue = router.req_queue(from_x, from_y);
        #[cfg(feature = "flit_trace")]
        trace!(
            "router ({}, {}): request {:?} from ({}, {}) -> input {}",
            router.x, router.y, req, from_x, from_y, queue
        );
        router.input[queue].push_back(&mut self.engine, req);

        let len = router.input[queue].len();
        assert!(
            len <= router.queue_size + 1,
            "router ({}, {}) input {} overflowed: {} flits (ceiling {})",
            router.x,
            router.y,
            queue,
            len,
            router.queue_size + 1,
        );
        if len > router.queue_size {
            router.stats.backpressure_events += 1;
            return true;
        }
        false
    }

    /// Mark the output toward `(from_x, from_y)` ready again and re-arm
    /// arbitration. Called by the downstream hop once it can accept more.
    pub(crate) fn router_unstall_queue(&mut self, node: usize, from_x: i32, from_y: i32) {
        let router = &mut self.noc.routers[node];
        let queue = router.req_queue(from_x, from_y);
        router.out_stalled[queue] = false;
        self.engine.enqueue(router.fsm);
    }

    /// Force-stall the output toward `(from_x, from_y)`. Used by a network
    /// interface whose target denied a request.
    pub(crate) fn router_stall_queue(&mut self, node: usize, from_x: i32, from_y: i32) {
        let router = &mut self.noc.routers[node];
        let queue = router.req_queue(from_x, from_y);
        router.out_stalled[queue] = true;
    }

    /// A previously denied request from this router was granted by its
    /// target: clear the stall recorded in the request's scratch slots.
    pub(crate) fn router_grant(&mut self, req: ReqId) {
        let queue = self.reqs[req].scratch.queue;
        let node = self.reqs[req]
            .scratch
            .router
            .expect("granted request carries no router");
        let router = &mut self.noc.routers[node];
        router.out_stalled[queue] = false;
        self.engine.enqueue(router.fsm);
    }

    /// One arbitration + delivery pass. Bound to the router's wake event.
    pub(crate) fn router_fsm(&mut self, node: usize) {
        let now = self.engine.now();
        let mut progress = false;

        // Stage 1: round-robin arbitration from inputs to outputs. The
        // cursor is advanced before any flit is known to move.
        let start = self.noc.routers[node].current_queue;
        self.noc.routers[node].current_queue = (start + 1) % NUM_DIRS;

        for i in 0..NUM_DIRS {
            let qi = (start + i) % NUM_DIRS;

            let Some(req) = self.noc.routers[node].input[qi].head(now) else {
                continue;
            };

            // Destination was filled in by the originating NI; clamp keeps
            // edge-addressed traffic on the grid.
            let sc = &self.reqs[req].scratch;
            let (dx, dy) = self.noc.clamp(sc.dest_x, sc.dest_y);
            let router = &self.noc.routers[node];
            let (nx, ny) = router.next_hop(dx, dy);
            let d_out = if (nx, ny) == (router.x, router.y) {
                Dir::Local.index()
            } else {
                router.req_queue(nx, ny)
            };

            let router = &mut self.noc.routers[node];
            if router.out_accepted_at[d_out] == Some(now)
                || router.output[d_out].len() >= router.queue_size
                || router.out_stalled[d_out]
            {
                continue;
            }

            router.input[qi].pop();
            router.out_accepted_at[d_out] = Some(now);
            router.stats.arbitrated += 1;
            progress = true;

            // Dropping back to the ceiling means the predecessor had one
            // flit stalled on top: release it.
            if router.input[qi].len() == router.queue_size {
                let (px, py) = router.pos_from_queue(qi);
                let (rx, ry) = (router.x, router.y);
                if (px, py) == (rx, ry) {
                    self.ni_unstall(node);
                } else if self.noc.contains(px, py) {
                    let pred = self.noc.node(px, py);
                    self.router_unstall_queue(pred, rx, ry);
                }
            }

            let router = &mut self.noc.routers[node];
            router.output[d_out].push_back(&mut self.engine, req);
        }

        // Stage 2: deliver output heads downstream, fixed direction order,
        // one flit per output per cycle.
        for d in 0..NUM_DIRS {
            let router = &self.noc.routers[node];
            if router.out_stalled[d] || router.out_delivered_at[d] == Some(now) {
                continue;
            }
            let Some(req) = router.output[d].head(now) else {
                continue;
            };
            let (rx, ry) = (router.x, router.y);

            let router = &mut self.noc.routers[node];
            router.output[d].pop();
            router.out_delivered_at[d] = Some(now);
            progress = true;

            if d == Dir::Local.index() {
                #[cfg(feature = "flit_trace")]
                trace!("router ({rx}, {ry}): delivering {req:?} to local NI");
                self.noc.routers[node].stats.delivered_local += 1;
                self.ni_req_from_router(node, req);
            } else {
                self.noc.routers[node].stats.forwarded += 1;
                let (nx, ny) = self.noc.routers[node].pos_from_queue(d);
                debug_assert!(self.noc.contains(nx, ny));
                let next = self.noc.node(nx, ny);
                if self.router_handle_request(next, req, rx, ry) {
                    self.noc.routers[node].out_stalled[d] = true;
                }
            }
        }

        // Re-arm only when something moved; every state change that could
        // unblock a skipped flit (push, unstall, grant) re-arms on its own.
        if progress {
            let fsm = self.noc.routers[node].fsm;
            self.engine.enqueue(fsm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::EventTarget;

    #[test]
    fn req_queue_maps_neighbors_to_directions() {
        let mut engine: crate::engine::Engine<EventTarget> = crate::engine::Engine::new();
        let ev = engine.new_event(EventTarget::RouterFsm(0));
        let r = Router::new(2, 2, 4, ev);

        assert_eq!(r.req_queue(1, 2), Dir::Left.index());
        assert_eq!(r.req_queue(3, 2), Dir::Right.index());
        assert_eq!(r.req_queue(2, 3), Dir::Up.index());
        assert_eq!(r.req_queue(2, 1), Dir::Down.index());
        assert_eq!(r.req_queue(2, 2), Dir::Local.index());
    }

    #[test]
    fn next_hop_reduces_x_before_y() {
        let mut engine: crate::engine::Engine<EventTarget> = crate::engine::Engine::new();
        let ev = engine.new_event(EventTarget::RouterFsm(0));
        let r = Router::new(1, 1, 4, ev);

        assert_eq!(r.next_hop(3, 3), (2, 1));
        assert_eq!(r.next_hop(0, 3), (0, 1));
        assert_eq!(r.next_hop(1, 3), (1, 2));
        assert_eq!(r.next_hop(1, 0), (1, 0));
        assert_eq!(r.next_hop(1, 1), (1, 1));
    }

    #[test]
    fn zxy_reduces_z_then_x_then_y() {
        assert_eq!(next_hop_zxy((1, 1, 1), (2, 2, 3)), (1, 1, 2));
        assert_eq!(next_hop_zxy((1, 1, 3), (2, 2, 3)), (2, 1, 3));
        assert_eq!(next_hop_zxy((2, 1, 3), (2, 2, 3)), (2, 2, 3));
        assert_eq!(next_hop_zxy((2, 2, 3), (2, 2, 3)), (2, 2, 3));
        // Single-layer: plain XY.
        assert_eq!(next_hop_zxy((0, 0, 0), (2, 1, 0)), (1, 0, 0));
    }

    #[test]
    fn pos_from_queue_inverts_req_queue() {
        let mut engine: crate::engine::Engine<EventTarget> = crate::engine::Engine::new();
        let ev = engine.new_event(EventTarget::RouterFsm(0));
        let r = Router::new(2, 2, 4, ev);
        for d in 0..NUM_DIRS {
            let (px, py) = r.pos_from_queue(d);
            assert_eq!(r.req_queue(px, py), d);
        }
    }
}
