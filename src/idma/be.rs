/*!
Back-end core: transfer-to-burst splitting and channel steering.

State machine
- New transfers land in a regulation queue. The head is promoted to the
  active slot only when no in-flight transfer reads from a *different*
  source channel, or that channel has drained. This keeps reads from a
  given source in issue order across transfers.
- Each FSM cycle the active transfer emits one legalized burst: the burst
  size is the minimum both involved channels accept at the current source
  and destination addresses. A read burst goes to the source channel, the
  matching write burst to the destination channel.

Data plane
- The source channel pushes chunks through `be_write_data`; the head of
  `transfer_queue` names the destination. The destination channel
  acknowledges drained chunks through `be_ack_data`; the head of the ack
  queue names the source to release. `ack_size` reaching zero completes
  the transfer toward the middle-end. A negative `ack_size` would mean the
  accounting went wrong, and aborts.
*/

use std::collections::VecDeque;

use log::trace;

use crate::system::System;

use super::{DmaEngine, ProtoId, TransferId};

pub struct Backend {
    loc_base: u64,
    loc_size: u64,
    /// Accepted transfers waiting for source-conflict clearance.
    regulation: VecDeque<TransferId>,
    /// Data-plane FIFO: head receives the chunks being written.
    transfer_queue: VecDeque<TransferId>,
    /// Ack-plane FIFO: head matches the write-acknowledgement stream.
    ack_queue: VecDeque<TransferId>,
    /// Active transfer being split into bursts.
    cur: Option<TransferId>,
    cur_src: u64,
    cur_dst: u64,
    cur_size: u64,
    cur_src_be: ProtoId,
    cur_dst_be: ProtoId,
    /// Source channel of the previously issued burst; a different source
    /// may not fetch until this one drained.
    prev_src_be: Option<ProtoId>,
}

impl Backend {
    pub fn new(loc_base: u64, loc_size: u64) -> Self {
        Self {
            loc_base,
            loc_size,
            regulation: VecDeque::new(),
            transfer_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            cur: None,
            cur_src: 0,
            cur_dst: 0,
            cur_size: 0,
            cur_src_be: ProtoId::AxiRead,
            cur_dst_be: ProtoId::AxiWrite,
            prev_src_be: None,
        }
    }

    /// Channel serving `[base, base+size)` for the given direction.
    pub fn consumer(&self, base: u64, size: u64, is_read: bool) -> ProtoId {
        let is_loc = base >= self.loc_base && base + size <= self.loc_base + self.loc_size;
        match (is_loc, is_read) {
            (true, true) => ProtoId::TcdmRead,
            (true, false) => ProtoId::TcdmWrite,
            (false, true) => ProtoId::AxiRead,
            (false, false) => ProtoId::AxiWrite,
        }
    }

    /// Only one transfer may occupy the active slot.
    pub fn can_accept_transfer(&self) -> bool {
        self.cur_size == 0
    }

    pub fn is_idle(&self) -> bool {
        self.cur_size == 0
            && self.regulation.is_empty()
            && self.transfer_queue.is_empty()
            && self.ack_queue.is_empty()
    }

    /// Back to power-on state. Descriptor storage is reclaimed by the
    /// owning engine, which wipes the arena after every stage cleared.
    pub fn reset(&mut self) {
        self.regulation.clear();
        self.ack_queue.clear();
        self.transfer_queue.clear();
        self.cur = None;
        self.cur_size = 0;
        self.prev_src_be = None;
    }
}

impl DmaEngine {
    /// Middle-end pushes a transfer; it waits in the regulation queue.
    pub(crate) fn be_enqueue_transfer(&mut self, sys: &mut System, t: TransferId) {
        trace!(
            "dma {}: be queueing transfer (src: {:#x}, dst: {:#x}, size: {:#x})",
            self.id, self.transfers[t].src, self.transfers[t].dst, self.transfers[t].size
        );
        self.be.regulation.push_back(t);
        sys.engine.enqueue(self.ev.be_reg);
    }

    /// Promote the regulation head when the source-conflict rule allows.
    pub(crate) fn be_regulate(&mut self, sys: &mut System) {
        let Some(&head) = self.be.regulation.front() else {
            return;
        };

        let (src, dst, size) = {
            let t = &self.transfers[head];
            (t.src, t.dst, t.size)
        };
        let src_be = self.be.consumer(src, size, true);

        if !self.be.ack_queue.is_empty() && self.be.cur_src_be != src_be {
            trace!("dma {}: be source conflict, holding transfer", self.id);
            return;
        }

        self.be.regulation.pop_front();
        self.be.transfer_queue.push_back(head);
        self.be.ack_queue.push_back(head);

        self.transfers[head].ack_size = size;
        self.be.cur = Some(head);
        self.be.cur_src = src;
        self.be.cur_dst = dst;
        self.be.cur_size = size;
        self.be.cur_src_be = src_be;
        self.be.cur_dst_be = self.be.consumer(dst, size, false);

        sys.engine.enqueue(self.ev.be);
        if !self.be.regulation.is_empty() {
            sys.engine.enqueue(self.ev.be_reg);
        }
    }

    /// Emit one legalized burst per cycle while channels accept.
    pub(crate) fn be_fsm(&mut self, sys: &mut System) {
        let src_clear = match self.be.prev_src_be {
            None => true,
            Some(prev) => prev == self.be.cur_src_be || self.proto_is_empty(prev),
        };

        if !(src_clear
            && self.be.cur_size > 0
            && self.proto_can_accept_burst(self.be.cur_src_be)
            && self.proto_can_accept_burst(self.be.cur_dst_be))
        {
            return;
        }

        let src = self.be.cur_src;
        let dst = self.be.cur_dst;
        let size = self.be.cur_size;

        // Legalize against both sides: the burst must fit the source at
        // `src` and the destination at `dst`.
        let burst = self.proto_get_burst_size(self.be.cur_src_be, src, size);
        let burst = self.proto_get_burst_size(self.be.cur_dst_be, dst, burst);
        debug_assert!(burst >= 1);

        self.be.prev_src_be = Some(self.be.cur_src_be);

        let t = self.be.cur.expect("active size without active transfer");
        trace!(
            "dma {}: be burst (src: {:#x}, dst: {:#x}, size: {:#x})",
            self.id, src, dst, burst
        );
        self.proto_read_burst(sys, self.be.cur_src_be, t, src, burst);
        self.proto_write_burst(sys, self.be.cur_dst_be, t, dst, burst);

        self.be.cur_size -= burst;
        self.be.cur_src += burst;
        self.be.cur_dst += burst;

        sys.engine.enqueue(self.ev.be);

        if self.be.cur_size == 0 {
            // Room for the next transfer: poke the middle-end.
            sys.engine.enqueue(self.ev.me);
        }
    }

    /// May the source channel push a chunk right now?
    pub(crate) fn be_is_ready_to_accept_data(&self) -> bool {
        let Some(&t) = self.be.transfer_queue.front() else {
            return false;
        };
        let (dst, size) = {
            let t = &self.transfers[t];
            (t.dst, t.size)
        };
        let dst_be = self.be.consumer(dst, size, false);
        self.proto_can_accept_data(dst_be)
    }

    /// Source channel pushes a chunk toward the head transfer's
    /// destination. Readiness was checked by the caller.
    pub(crate) fn be_write_data(&mut self, sys: &mut System, data: Vec<u8>, size: u64) {
        let &t = self
            .be
            .transfer_queue
            .front()
            .expect("data pushed with no transfer in flight");
        let (dst, tsize) = {
            let tr = &self.transfers[t];
            (tr.dst, tr.size)
        };
        let dst_be = self.be.consumer(dst, tsize, false);

        {
            let tr = &mut self.transfers[t];
            tr.dst += size;
            tr.size -= size;
            if tr.size == 0 {
                self.be.transfer_queue.pop_front();
            }
        }

        self.proto_write_data(sys, dst_be, t, data, size);
    }

    /// Destination channel drained a chunk: release the source side and
    /// account the transfer.
    pub(crate) fn be_ack_data(&mut self, sys: &mut System, size: u64) {
        let &t = self
            .be
            .ack_queue
            .front()
            .expect("ack with no transfer in flight");
        let (src, tsize) = {
            let tr = &self.transfers[t];
            (tr.src, tr.size)
        };
        let src_be = self.be.consumer(src, tsize, true);
        self.proto_write_data_ack(sys, src_be, size);

        self.stats.bytes_acked += size;
        let done = {
            let tr = &mut self.transfers[t];
            assert!(
                tr.ack_size >= size,
                "iDMA back-end over-acknowledged: ack_size {:#x}, chunk {:#x}",
                tr.ack_size,
                size
            );
            tr.ack_size -= size;
            trace!(
                "dma: be acked chunk (size: {:#x}, remaining: {:#x})",
                size, tr.ack_size
            );
            tr.ack_size == 0
        };

        if done {
            self.be.ack_queue.pop_front();
            self.me_ack_transfer(sys, t);
            if self.be.ack_queue.is_empty() {
                sys.engine.enqueue(self.ev.be_reg);
            }
        }
    }
}
