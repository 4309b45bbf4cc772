/*!
Network interface: bridges initiator bursts onto the mesh and back.

Forward path
- `ni_req` absorbs a burst, timestamps it with the latency accumulated so
  far (then clears it: the NI owns timing from here), and queues it. The
  burst beyond the outstanding ceiling is still queued but answered DENIED,
  and the initiator is granted again once an outstanding burst completes.
- The FSM turns the head burst into fabric flits: one address-phase flit
  carrying the translated destination, then (for writes) data-phase flits
  of at most one NoC width each. All flits are drawn from a pre-allocated
  pool sized by the outstanding-request budget; an empty pool pauses
  emission until a flit returns home.

Return path
- A destination NI forwards arriving address/data flits to its local
  target, then emits backward flits toward the originator: read data split
  at NoC width, or per-chunk write acknowledgements. Backward emission
  waits out the latency the target reported.
- The originator accounts backward flits against the burst's remaining
  counter; writes additionally need the address phase observed. One
  response per burst, status OK or INVALID — an INVALID child poisons the
  whole burst.

Stall behavior
- A full local router input stalls the NI until the router unstalls it.
- A target DENIED holds the offending flit, force-stalls the local router
  output feeding this NI, and retries when the target grants.
*/

use std::collections::VecDeque;

use log::{debug, trace};

use crate::engine::{Cycle, EventId};
use crate::req::{FlitKind, IoStatus, ReqId};
use crate::system::System;

/// Pending backward emission at a destination NI: read data to stream
/// home, or a write acknowledgement for one landed chunk.
pub(crate) struct DstBurst {
    /// Originating burst the backward flits account against.
    burst: ReqId,
    /// Coordinates of the originating NI.
    origin: (i32, i32),
    /// Emission may not start before this cycle (target latency replay).
    ready_at: Cycle,
    /// Node-local address of the next backward flit.
    base: u64,
    /// Offset of the next chunk within the burst payload.
    off: u64,
    remaining: u64,
    /// Read payload; empty for write acknowledgements.
    data: Vec<u8>,
    is_write: bool,
    wide: bool,
    /// Propagates a target decode failure back to the originator.
    invalid: bool,
}

/// Per-NI traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiStats {
    pub bursts_accepted: u64,
    pub bursts_denied: u64,
    pub bursts_invalid: u64,
    /// Flits injected into the local router (all kinds).
    pub flits_injected: u64,
    /// Payload bytes sent on forward data-phase flits.
    pub bytes_forward: u64,
    /// Payload bytes returned on backward flits.
    pub bytes_backward: u64,
}

pub struct NetworkInterface {
    pub x: i32,
    pub y: i32,
    pub stats: NiStats,
    max_outstanding: usize,
    /// Free child requests. Sized to the outstanding-request budget.
    pool: Vec<ReqId>,
    /// Accepted bursts not yet responded to.
    outstanding: usize,
    /// (burst, earliest processing cycle), in arrival order.
    pending_src: VecDeque<(ReqId, Cycle)>,
    /// Initiator burst answered DENIED, granted when capacity returns.
    denied_req: Option<ReqId>,
    /// Local router input full.
    stalled: bool,
    /// Target denied a forwarded flit.
    target_stalled: bool,
    /// Predecessor router force-stalled while the target is denied.
    routers_stalled: bool,
    target_denied_req: Option<ReqId>,
    // Head-burst emission state (forward path).
    head_addr_sent: bool,
    emit_base: u64,
    emit_off: u64,
    emit_remaining: u64,
    // Destination-side backward emissions.
    pending_dst: VecDeque<DstBurst>,
    pub(crate) fsm: EventId,
}

impl NetworkInterface {
    pub fn new(x: i32, y: i32, max_outstanding: usize, fsm: EventId) -> Self {
        Self {
            x,
            y,
            stats: NiStats::default(),
            max_outstanding,
            pool: Vec::new(),
            outstanding: 0,
            pending_src: VecDeque::new(),
            denied_req: None,
            stalled: false,
            target_stalled: false,
            routers_stalled: false,
            target_denied_req: None,
            head_addr_sent: false,
            emit_base: 0,
            emit_off: 0,
            emit_remaining: 0,
            pending_dst: VecDeque::new(),
            fsm,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn pool_free(&self) -> usize {
        self.pool.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_src.is_empty() && self.pending_dst.is_empty() && self.outstanding == 0
    }

    /// Back to power-on state. Pending bursts are drained and returned so
    /// the owner can release them; the child pool stays as allocated.
    pub fn reset(&mut self) -> Vec<ReqId> {
        debug_assert!(
            self.target_denied_req.is_none(),
            "reset with a target-denied flit in flight"
        );
        // The held denied burst also sits in the pending queue; taking it
        // here must not produce a second handle.
        self.denied_req = None;
        let dropped = self.pending_src.drain(..).map(|(burst, _)| burst).collect();
        self.pending_dst.clear();
        self.outstanding = 0;
        self.stalled = false;
        self.target_stalled = false;
        self.routers_stalled = false;
        self.head_addr_sent = false;
        self.emit_base = 0;
        self.emit_off = 0;
        self.emit_remaining = 0;
        dropped
    }
}

/// Outcome of forwarding a flit to the node target.
enum Forward {
    Done,
    Held,
}

impl System {
    /// Initiator entry point: absorb a burst on the NI at `node`.
    ///
    /// Returns `Pending` (response follows), `Denied` (queued, but stop
    /// sending until granted) or `Ok` for the degenerate zero-size burst.
    pub fn ni_req(&mut self, node: usize, burst: ReqId, wide: bool) -> IoStatus {
        let now = self.engine.now();

        if self.reqs[burst].size == 0 {
            // Nothing to move; complete synchronously.
            self.reqs[burst].status = IoStatus::Ok;
            return IoStatus::Ok;
        }

        let (nx, ny) = {
            let ni = &self.noc.nis[node];
            (ni.x, ni.y)
        };

        {
            let req = &mut self.reqs[burst];
            req.scratch.wide = wide;
            req.scratch.src_x = nx;
            req.scratch.src_y = ny;
            req.scratch.remaining = req.size;
            req.scratch.phase = 0;
            if !req.is_write && (req.data.len() as u64) < req.size {
                req.data.resize(req.size as usize, 0);
            }
            debug_assert!(
                !req.is_write || req.data.len() as u64 == req.size,
                "write burst payload does not match its size"
            );
        }

        // The burst becomes runnable only once its accumulated latency has
        // elapsed; the NI owns timing from here on.
        let earliest = now + self.reqs[burst].latency;
        self.reqs[burst].latency = 0;

        let ni = &mut self.noc.nis[node];
        debug!(
            "ni ({}, {}): received {} burst (addr: {:#x}, size: {:#x}, wide: {})",
            ni.x,
            ni.y,
            if self.reqs[burst].is_write { "write" } else { "read" },
            self.reqs[burst].addr,
            self.reqs[burst].size,
            wide
        );

        ni.pending_src.push_back((burst, earliest));
        let was = ni.outstanding;
        ni.outstanding += 1;
        ni.stats.bursts_accepted += 1;
        self.engine.enqueue_in(ni.fsm, (earliest - now).max(1));

        if was >= ni.max_outstanding {
            ni.stats.bursts_denied += 1;
            assert!(
                ni.denied_req.is_none(),
                "ni ({}, {}): initiator pushed past a denied burst",
                ni.x,
                ni.y
            );
            ni.denied_req = Some(burst);
            IoStatus::Denied
        } else {
            IoStatus::Pending
        }
    }

    /// Local router drained below the ceiling: resume emission.
    pub(crate) fn ni_unstall(&mut self, node: usize) {
        let ni = &mut self.noc.nis[node];
        ni.stalled = false;
        self.engine.enqueue(ni.fsm);
    }

    /// Flit delivered by the local router (destination side or backward).
    pub(crate) fn ni_req_from_router(&mut self, node: usize, req: ReqId) {
        match self.reqs[req].scratch.kind {
            FlitKind::Address | FlitKind::WriteData => {
                let _ = self.ni_forward_to_target(node, req);
            }
            FlitKind::Response => self.ni_handle_response(node, req),
        }
    }

    /// FSM pass: one forward emission and one backward emission per cycle.
    pub(crate) fn ni_fsm(&mut self, node: usize) {
        let now = self.engine.now();

        self.ni_forward_step(node, now);
        self.ni_backward_step(node, now);
    }

    fn ni_forward_step(&mut self, node: usize, now: Cycle) {
        let ni = &self.noc.nis[node];
        if ni.stalled {
            return;
        }
        let Some(&(burst, earliest)) = ni.pending_src.front() else {
            return;
        };
        if earliest > now {
            let fsm = ni.fsm;
            self.engine.enqueue_in(fsm, earliest - now);
            return;
        }
        if ni.pool.is_empty() {
            // A returning flit re-arms the FSM.
            return;
        }

        if !self.noc.nis[node].head_addr_sent {
            self.ni_emit_address(node, burst);
        } else {
            self.ni_emit_write_data(node, burst);
        }

        let fsm = self.noc.nis[node].fsm;
        self.engine.enqueue(fsm);
    }

    /// Open the head burst: resolve its mapping and send the address flit.
    fn ni_emit_address(&mut self, node: usize, burst: ReqId) {
        let (addr, size, is_write, wide) = {
            let b = &self.reqs[burst];
            (b.addr, b.size, b.is_write, b.scratch.wide)
        };

        let Some(entry) = self.noc.map.lookup(addr, size).copied() else {
            // No mapping: the burst dies here, INVALID, without routing.
            let (x, y) = {
                let ni = &self.noc.nis[node];
                (ni.x, ni.y)
            };
            debug!(
                "ni ({x}, {y}): no mapping for burst (addr: {addr:#x}, size: {size:#x})"
            );
            self.reqs[burst].status = IoStatus::Invalid;
            let ni = &mut self.noc.nis[node];
            ni.stats.bursts_invalid += 1;
            ni.pending_src.pop_front();
            self.ni_complete_burst(node, burst);
            return;
        };

        let translated = addr - entry.remove_offset;
        let flit = {
            let ni = &mut self.noc.nis[node];
            ni.head_addr_sent = true;
            ni.emit_base = translated;
            ni.emit_off = 0;
            ni.emit_remaining = size;
            ni.pool.pop().expect("checked non-empty")
        };

        {
            let r = &mut self.reqs[flit];
            r.init();
            r.addr = translated;
            r.size = size;
            r.is_write = is_write;
            r.scratch.kind = FlitKind::Address;
            r.scratch.burst = Some(burst);
            r.scratch.src_ni = Some(node);
            r.scratch.wide = wide;
            r.scratch.dest_x = entry.x;
            r.scratch.dest_y = entry.y;
        }
        // Opcode and second operand ride on the address phase untouched.
        let (opcode, second) = {
            let b = &self.reqs[burst];
            (b.opcode, b.second_data.clone())
        };
        self.reqs[flit].opcode = opcode;
        self.reqs[flit].second_data = second;

        trace!(
            "ni: address flit {:?} for burst {:?} -> ({}, {})",
            flit, burst, entry.x, entry.y
        );

        let (x, y) = {
            let ni = &mut self.noc.nis[node];
            ni.stats.flits_injected += 1;
            (ni.x, ni.y)
        };
        let full = self.router_handle_request(node, flit, x, y);
        self.noc.nis[node].stalled = full;

        if !is_write {
            // Reads emit nothing further; data returns on backward flits.
            let ni = &mut self.noc.nis[node];
            ni.pending_src.pop_front();
            ni.head_addr_sent = false;
        }
    }

    /// Emit the next data-phase flit of the head write burst.
    fn ni_emit_write_data(&mut self, node: usize, burst: ReqId) {
        let wide = self.reqs[burst].scratch.wide;
        let width = self.noc.width(wide);
        let (flit, addr, off, chunk, done) = {
            let ni = &mut self.noc.nis[node];
            let chunk = width.min(ni.emit_remaining);
            debug_assert!(chunk >= 1);
            let addr = ni.emit_base;
            let off = ni.emit_off;
            ni.emit_base += chunk;
            ni.emit_off += chunk;
            ni.emit_remaining -= chunk;
            let done = ni.emit_remaining == 0;
            let flit = ni.pool.pop().expect("checked non-empty");
            (flit, addr, off, chunk, done)
        };
        // Destination coordinates repeat the address flit's resolution.
        let (dx, dy) = {
            let b = &self.reqs[burst];
            let entry = self
                .noc
                .map
                .lookup(b.addr, b.size)
                .expect("mapping vanished mid-burst");
            (entry.x, entry.y)
        };

        let payload = {
            let b = &self.reqs[burst];
            b.data[off as usize..(off + chunk) as usize].to_vec()
        };

        {
            let r = &mut self.reqs[flit];
            r.init();
            r.addr = addr;
            r.size = chunk;
            r.is_write = true;
            r.data = payload;
            r.scratch.kind = FlitKind::WriteData;
            r.scratch.burst = Some(burst);
            r.scratch.src_ni = Some(node);
            r.scratch.wide = wide;
            r.scratch.offset = off;
            r.scratch.dest_x = dx;
            r.scratch.dest_y = dy;
        }

        let (x, y) = {
            let ni = &mut self.noc.nis[node];
            ni.stats.flits_injected += 1;
            ni.stats.bytes_forward += chunk;
            (ni.x, ni.y)
        };
        let full = self.router_handle_request(node, flit, x, y);
        let ni = &mut self.noc.nis[node];
        ni.stalled = full;

        if done {
            ni.pending_src.pop_front();
            ni.head_addr_sent = false;
        }
    }

    /// Emit one backward flit for the head pending destination burst.
    fn ni_backward_step(&mut self, node: usize, now: Cycle) {
        let ni = &self.noc.nis[node];
        if ni.stalled {
            return;
        }
        let Some(d) = ni.pending_dst.front() else {
            return;
        };
        if d.ready_at > now {
            let fsm = ni.fsm;
            let at = d.ready_at - now;
            self.engine.enqueue_in(fsm, at);
            return;
        }
        if ni.pool.is_empty() {
            return;
        }

        let wide = d.wide;
        let width = self.noc.width(wide);
        let (flit, burst, origin, addr, off, chunk, payload, is_write, invalid) = {
            let ni = &mut self.noc.nis[node];
            let d = ni.pending_dst.front_mut().expect("checked non-empty");
            let chunk = width.min(d.remaining);
            debug_assert!(chunk >= 1);
            let addr = d.base;
            let off = d.off;
            let payload = if d.data.is_empty() {
                Vec::new()
            } else {
                d.data[off as usize..(off + chunk) as usize].to_vec()
            };
            d.base += chunk;
            d.off += chunk;
            d.remaining -= chunk;
            let out = (
                ni.pool.pop().expect("checked non-empty"),
                d.burst,
                d.origin,
                addr,
                off,
                chunk,
                payload,
                d.is_write,
                d.invalid,
            );
            if d.remaining == 0 {
                ni.pending_dst.pop_front();
            }
            out
        };

        {
            let r = &mut self.reqs[flit];
            r.init();
            r.addr = addr;
            r.size = chunk;
            r.is_write = is_write;
            r.data = payload;
            r.status = if invalid { IoStatus::Invalid } else { IoStatus::Ok };
            r.scratch.kind = FlitKind::Response;
            r.scratch.burst = Some(burst);
            r.scratch.src_ni = Some(node);
            r.scratch.wide = wide;
            r.scratch.offset = off;
            r.scratch.dest_x = origin.0;
            r.scratch.dest_y = origin.1;
        }

        let (x, y) = {
            let ni = &mut self.noc.nis[node];
            ni.stats.flits_injected += 1;
            ni.stats.bytes_backward += chunk;
            (ni.x, ni.y)
        };
        let full = self.router_handle_request(node, flit, x, y);
        self.noc.nis[node].stalled = full;

        let fsm = self.noc.nis[node].fsm;
        self.engine.enqueue(fsm);
    }

    /// Forward an address or data flit to the node target, queueing the
    /// matching backward work. Returns `Held` when the target denied.
    fn ni_forward_to_target(&mut self, node: usize, req: ReqId) -> Forward {
        let now = self.engine.now();
        let status = self.target_req(node, req);

        if status == IoStatus::Denied {
            // Hold the flit and freeze everything feeding this NI until
            // the target grants.
            let (x, y) = {
                let ni = &self.noc.nis[node];
                (ni.x, ni.y)
            };
            debug!("ni ({x}, {y}): target denied, stalling predecessors");
            {
                // Record where the stall sits so the grant can undo it.
                let sc = &mut self.reqs[req].scratch;
                sc.ni = Some(node);
                sc.router = Some(node);
                sc.queue = crate::noc::Dir::Local.index();
            }
            let ni = &mut self.noc.nis[node];
            assert!(
                ni.target_denied_req.is_none(),
                "ni ({x}, {y}): second flit delivered while target-denied"
            );
            ni.target_denied_req = Some(req);
            ni.target_stalled = true;
            ni.routers_stalled = true;
            self.router_stall_queue(node, x, y);
            return Forward::Held;
        }

        let invalid = status == IoStatus::Invalid;
        let kind = self.reqs[req].scratch.kind;
        let burst = self.reqs[req].scratch.burst.expect("flit without burst");
        let origin_node = self.reqs[req].scratch.src_ni.expect("flit without origin");
        let origin = {
            let o = &self.noc.nis[origin_node];
            (o.x, o.y)
        };
        let latency = self.reqs[req].latency;
        let wide = self.reqs[req].scratch.wide;

        match kind {
            FlitKind::Address => {
                let (addr, size, is_write) =
                    { (self.reqs[req].addr, self.reqs[req].size, self.reqs[req].is_write) };
                if is_write {
                    // Address phase of a write: acknowledge the phase to the
                    // originator; data flits follow on their own.
                    if invalid {
                        self.reqs[burst].status = IoStatus::Invalid;
                    }
                    self.ni_mark_addr_done(origin_node, burst);
                } else {
                    // Read: the target produced the payload; stream it back
                    // at NoC width once the reported latency has elapsed.
                    let mut data = std::mem::take(&mut self.reqs[req].data);
                    if invalid {
                        data.clear();
                        data.resize(size as usize, 0);
                    }
                    let ni = &mut self.noc.nis[node];
                    ni.pending_dst.push_back(DstBurst {
                        burst,
                        origin,
                        ready_at: now + latency,
                        base: addr,
                        off: 0,
                        remaining: size,
                        data,
                        is_write: false,
                        wide,
                        invalid,
                    });
                    self.engine.enqueue_in(ni.fsm, latency.max(1));
                }
            }
            FlitKind::WriteData => {
                // One acknowledgement flit per landed chunk.
                let (addr, size) = (self.reqs[req].addr, self.reqs[req].size);
                let off = self.reqs[req].scratch.offset;
                let ni = &mut self.noc.nis[node];
                ni.pending_dst.push_back(DstBurst {
                    burst,
                    origin,
                    ready_at: now + latency,
                    base: addr,
                    off,
                    remaining: size,
                    data: Vec::new(),
                    is_write: true,
                    wide,
                    invalid,
                });
                self.engine.enqueue_in(ni.fsm, latency.max(1));
            }
            FlitKind::Response => unreachable!("response flits never reach a target"),
        }

        // The forward flit's journey ends here; hand it back to its pool.
        self.ni_pool_release(origin_node, req);
        Forward::Done
    }

    /// Backward flit arrived at the originating NI: account it.
    pub(crate) fn ni_handle_response(&mut self, node: usize, req: ReqId) {
        let burst = self.reqs[req].scratch.burst.expect("response without burst");
        let owner = self.reqs[req].scratch.src_ni.expect("response without owner");
        let size = self.reqs[req].size;
        let off = self.reqs[req].scratch.offset;
        let invalid = self.reqs[req].status == IoStatus::Invalid;
        let duration = self.reqs[req].duration;

        if invalid {
            self.reqs[burst].status = IoStatus::Invalid;
        }

        if !self.reqs[req].data.is_empty() {
            // Read data lands in the burst payload at the recorded offset.
            let chunk = std::mem::take(&mut self.reqs[req].data);
            let b = &mut self.reqs[burst];
            b.data[off as usize..off as usize + chunk.len()].copy_from_slice(&chunk);
        }

        {
            let b = &mut self.reqs[burst];
            assert!(
                b.scratch.remaining >= size,
                "burst over-acknowledged: remaining {:#x}, response {:#x}",
                b.scratch.remaining,
                size
            );
            b.scratch.remaining -= size;
            b.set_duration(duration);
        }

        self.ni_pool_release(owner, req);

        if self.reqs[burst].scratch.remaining == 0 {
            self.ni_mark_data_done(node, burst);
        }
    }

    fn ni_mark_addr_done(&mut self, node: usize, burst: ReqId) {
        self.reqs[burst].scratch.phase += 1;
        self.ni_check_burst_done(node, burst);
    }

    fn ni_mark_data_done(&mut self, node: usize, burst: ReqId) {
        self.reqs[burst].scratch.phase += 1;
        self.ni_check_burst_done(node, burst);
    }

    /// Writes need the address and data phases; reads only the data phase.
    fn ni_check_burst_done(&mut self, node: usize, burst: ReqId) {
        let b = &self.reqs[burst];
        let required = if b.is_write { 2 } else { 1 };
        if b.scratch.phase >= required {
            self.ni_complete_burst(node, burst);
        }
    }

    /// Deliver the burst response and release one unit of the budget.
    fn ni_complete_burst(&mut self, node: usize, burst: ReqId) {
        {
            let ni = &mut self.noc.nis[node];
            debug!(
                "ni ({}, {}): finished burst {:?} (status: {:?})",
                ni.x, ni.y, burst, self.reqs[burst].status
            );
            debug_assert!(ni.outstanding > 0);
            ni.outstanding -= 1;
        }
        if self.reqs[burst].status == IoStatus::Pending {
            self.reqs[burst].status = IoStatus::Ok;
        }
        self.deliver_resp(burst);

        // Capacity came back: release a denied initiator, if any.
        let grant = {
            let ni = &mut self.noc.nis[node];
            if ni.outstanding <= ni.max_outstanding {
                ni.denied_req.take()
            } else {
                None
            }
        };
        if let Some(denied) = grant {
            trace!("ni: granting denied burst {:?}", denied);
            self.deliver_grant(denied);
        }

        let fsm = self.noc.nis[node].fsm;
        self.engine.enqueue(fsm);
    }

    /// Target granted the held flit: unfreeze the predecessors recorded
    /// in the request's scratch slots and retry. A renewed denial freezes
    /// them straight back.
    pub(crate) fn ni_target_granted(&mut self, node: usize) {
        let Some(req) = self.noc.nis[node].target_denied_req.take() else {
            return;
        };
        self.noc.nis[node].target_stalled = false;
        if self.noc.nis[node].routers_stalled {
            self.noc.nis[node].routers_stalled = false;
            self.router_grant(req);
        }
        match self.ni_forward_to_target(node, req) {
            Forward::Held => {
                // Denied again; everything froze again.
            }
            Forward::Done => {
                let fsm = self.noc.nis[node].fsm;
                self.engine.enqueue(fsm);
            }
        }
    }

    /// Return a child flit to the pool of the NI that allocated it.
    pub(crate) fn ni_pool_release(&mut self, owner: usize, req: ReqId) {
        self.reqs[req].init();
        let ni = &mut self.noc.nis[owner];
        ni.pool.push(req);
        self.engine.enqueue(ni.fsm);
    }

    /// Pre-allocate the child-request pool of every NI. Called once by the
    /// system builder after the grid exists.
    pub(crate) fn ni_fill_pools(&mut self) {
        for node in 0..self.noc.nis.len() {
            let budget = self.noc.nis[node].max_outstanding;
            for _ in 0..budget {
                let req = self.reqs.alloc();
                self.noc.nis[node].pool.push(req);
            }
        }
    }
}
