/*!
I/O request objects: the universal carrier of a memory transaction.

Purpose
- Define `IoRequest`, the unit of communication between initiators, network
  interfaces, routers, targets and DMA protocols.
- Provide the arena the requests live in. Components never hold references
  to a request, only `ReqId` handles; the arena owns the storage and the
  component that allocated a request is responsible for releasing it once
  its response has been delivered.

Behavioral model
- `latency` accumulates monotonically along a request's path (`inc_latency`),
  `duration` keeps the maximum any hop reported (`set_duration`).
- The scratch area models the typed argument slots intermediate components
  use to attach routing and ownership information to a request in flight.
  Each field is written only by the component owning that leg: the
  originating NI owns the burst-level fields, a destination NI writes its
  own coordinates, the DMA protocols own the transfer backlink.
*/

use crate::engine::Cycle;

/// Status of an I/O request on the wire protocol.
///
/// `Ok` and `Invalid` are synchronous outcomes. `Pending` promises exactly
/// one later `resp` callback, `Denied` promises exactly one later `grant`
/// after which the initiator may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    Invalid,
    Denied,
    Pending,
}

/// Handle into the request arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub(crate) u32);

/// Where the response (or grant) for a request must be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespPort {
    /// No initiator is waiting; the request is an internal child.
    #[default]
    None,
    /// An iDMA AXI protocol channel issued this request.
    DmaAxi { dma: usize, write: bool },
    /// A scripted test initiator.
    Harness(usize),
}

/// Role of a fabric child request, recorded by the NI that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlitKind {
    /// Address-phase flit opening a burst toward its destination.
    #[default]
    Address,
    /// Forward data-phase flit of a write burst.
    WriteData,
    /// Backward flit: read data or write acknowledgement.
    Response,
}

/// Typed scratch slots carried by a request while it crosses the fabric.
///
/// The slot set is fixed; ownership of each slot is per leg (see module
/// docs). Handles replace the raw back-pointers of a pointer-based design.
#[derive(Debug, Clone, Default)]
pub struct ReqScratch {
    /// Parent burst of a fabric child request.
    pub burst: Option<ReqId>,
    /// Node index of the NI that allocated this request from its pool.
    pub src_ni: Option<usize>,
    /// Node index of the NI that must see the response (target side).
    pub dest_ni: Option<usize>,
    pub src_x: i32,
    pub src_y: i32,
    pub src_z: i32,
    pub dest_x: i32,
    pub dest_y: i32,
    pub dest_z: i32,
    /// Role of this flit on the forward/backward path.
    pub kind: FlitKind,
    /// Address/data phase completion counter on a burst (0 -> 1 -> 2).
    pub phase: u8,
    /// Wide/narrow channel tag.
    pub wide: bool,
    /// Router holding a stalled output queue for this request (DENIED leg).
    pub router: Option<usize>,
    /// Queue index inside that router to unstall on grant.
    pub queue: usize,
    /// NI holding this request while its target is denied.
    pub ni: Option<usize>,
    /// Identifier of the tile that originated the burst.
    pub src_tile: u32,
    /// Remaining-size counter of a burst (the "last slot" accumulator).
    pub remaining: u64,
    /// Byte offset of a chunk flit within its parent burst buffer.
    pub offset: u64,
    /// Timestamp slot: cycle at which a latency-delayed completion matures.
    pub ready_at: Cycle,
    /// Owning iDMA transfer of a protocol-level burst or chunk.
    pub transfer: Option<u32>,
}

/// The unit of communication across components.
#[derive(Debug, Clone, Default)]
pub struct IoRequest {
    pub addr: u64,
    pub size: u64,
    pub is_write: bool,
    /// Opaque operation code used for atomics; `0` is a plain access.
    /// Targets forward it untouched.
    pub opcode: u8,
    /// Payload buffer. Owned by the request while in flight.
    pub data: Vec<u8>,
    /// Second operand for compare-and-swap style opcodes.
    pub second_data: Vec<u8>,
    pub latency: u64,
    pub duration: u64,
    pub status: IoStatus,
    pub resp_port: RespPort,
    /// Initiator-chosen tag, reflected untouched in the response.
    pub tag: u64,
    pub scratch: ReqScratch,
}

impl Default for IoStatus {
    fn default() -> Self {
        IoStatus::Ok
    }
}

impl IoRequest {
    /// Clear the timing accumulators and status before (re)sending.
    /// Scratch slots and payload survive; they belong to the current leg.
    pub fn prepare(&mut self) {
        self.latency = 0;
        self.duration = 0;
        self.status = IoStatus::Ok;
    }

    /// Full re-initialization for reuse from a pool.
    pub fn init(&mut self) {
        self.prepare();
        self.addr = 0;
        self.size = 0;
        self.is_write = false;
        self.opcode = 0;
        self.data.clear();
        self.second_data.clear();
        self.resp_port = RespPort::None;
        self.tag = 0;
        self.scratch = ReqScratch::default();
    }

    #[inline]
    pub fn inc_latency(&mut self, cycles: u64) {
        self.latency += cycles;
    }

    #[inline]
    pub fn set_duration(&mut self, cycles: u64) {
        self.duration = self.duration.max(cycles);
    }
}

/// Slab arena for `IoRequest` with a free list.
pub struct ReqArena {
    slots: Vec<IoRequest>,
    free: Vec<u32>,
}

impl ReqArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a fresh (zeroed) request.
    pub fn alloc(&mut self) -> ReqId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize].init();
            ReqId(idx)
        } else {
            self.slots.push(IoRequest::default());
            ReqId((self.slots.len() - 1) as u32)
        }
    }

    /// Return a request to the arena. The handle must not be used again
    /// until it is re-allocated.
    pub fn release(&mut self, id: ReqId) {
        debug_assert!(
            !self.free.contains(&id.0),
            "double release of request {:?}",
            id
        );
        self.free.push(id.0);
    }

    #[inline]
    pub fn get(&self, id: ReqId) -> &IoRequest {
        &self.slots[id.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ReqId) -> &mut IoRequest {
        &mut self.slots[id.0 as usize]
    }

    /// Number of live (allocated) requests, for leak assertions in tests.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Default for ReqArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<ReqId> for ReqArena {
    type Output = IoRequest;
    #[inline]
    fn index(&self, id: ReqId) -> &IoRequest {
        self.get(id)
    }
}

impl std::ops::IndexMut<ReqId> for ReqArena {
    #[inline]
    fn index_mut(&mut self, id: ReqId) -> &mut IoRequest {
        self.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_accumulates_duration_maxes() {
        let mut r = IoRequest::default();
        r.inc_latency(3);
        r.inc_latency(4);
        assert_eq!(r.latency, 7);

        r.set_duration(5);
        r.set_duration(2);
        assert_eq!(r.duration, 5);
    }

    #[test]
    fn arena_reuses_released_slots() {
        let mut arena = ReqArena::new();
        let a = arena.alloc();
        arena[a].addr = 0x1000;
        arena[a].data = vec![1, 2, 3];
        arena.release(a);

        let b = arena.alloc();
        // Same slot, fully re-initialized.
        assert_eq!(a.0, b.0);
        assert_eq!(arena[b].addr, 0);
        assert!(arena[b].data.is_empty());
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn prepare_keeps_scratch_and_payload() {
        let mut r = IoRequest::default();
        r.scratch.dest_x = 3;
        r.data = vec![9];
        r.inc_latency(10);
        r.status = IoStatus::Pending;

        r.prepare();
        assert_eq!(r.latency, 0);
        assert_eq!(r.status, IoStatus::Ok);
        assert_eq!(r.scratch.dest_x, 3);
        assert_eq!(r.data, vec![9]);
    }
}
