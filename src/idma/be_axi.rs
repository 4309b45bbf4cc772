/*!
AXI-style protocol channel.

- Reads use a static pool of request objects sized by the outstanding-burst
  budget; each pooled request keeps reusing its buffer. Writes allocate one
  request per incoming chunk so the chunk size chosen by the peer channel
  is preserved on the wire.
- `axi_burst_size` caps bursts at the 4 KiB page and forbids crossing it.
- Read completions are stamped with the latency the port reported and
  drained in order, each only when the back-end is ready to accept data
  and the stamp has matured.
- A DENIED port queues the request downstream; the channel stops issuing
  until the grant arrives. Responses may be asynchronous: the port routes
  them back through the same handlers the synchronous path uses.
*/

use std::collections::VecDeque;

use log::{trace, warn};

use crate::req::{IoStatus, ReqId, RespPort};
use crate::system::System;

use super::{DmaEngine, TransferId};

/// Maximum AXI burst size, also the page-crossing boundary.
pub const AXI_PAGE_SIZE: u64 = 1 << 12;

/// Largest legal burst at `base`: capped by the page size and by the
/// distance to the next page boundary.
pub fn axi_burst_size(base: u64, size: u64) -> u64 {
    let mut size = size.min(AXI_PAGE_SIZE);
    let next_page = (base + AXI_PAGE_SIZE - 1) & !(AXI_PAGE_SIZE - 1);
    if next_page > base {
        size = size.min(next_page - base);
    }
    size
}

pub struct AxiChannel {
    dma: usize,
    /// Whether this instance is the write channel of its engine.
    write_chan: bool,
    /// Static request pool; also the outstanding-burst budget.
    pool: Vec<ReqId>,
    free: Vec<ReqId>,
    /// Bursts in issue order. The head is the one being worked on.
    pending: VecDeque<ReqId>,
    /// Completed reads waiting for their latency stamp and back-end
    /// readiness before pushing data.
    read_waiting: VecDeque<ReqId>,
    /// Reads pushed to the peer, waiting for the ack to free the slot.
    read_wait_ack: VecDeque<ReqId>,
    /// Write base of the head pending burst (chunks advance it).
    current_burst_base: u64,
    /// Port denied: stop issuing until granted.
    stalled: bool,
}

impl AxiChannel {
    pub fn new(dma: usize, write_chan: bool, queue_size: usize, pool: Vec<ReqId>) -> Self {
        debug_assert_eq!(pool.len(), queue_size);
        Self {
            dma,
            write_chan,
            free: pool.clone(),
            pool,
            pending: VecDeque::new(),
            read_waiting: VecDeque::new(),
            read_wait_ack: VecDeque::new(),
            current_burst_base: 0,
            stalled: false,
        }
    }

    pub fn can_accept_burst(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn can_accept_data(&self) -> bool {
        !self.stalled
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.read_waiting.is_empty() && self.read_wait_ack.is_empty()
    }

    /// Drop all in-flight bookkeeping and return every pooled request to
    /// the free list (reset domain entry).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.read_waiting.clear();
        self.read_wait_ack.clear();
        self.free = self.pool.clone();
        self.current_burst_base = 0;
        self.stalled = false;
    }

    fn resp_port(&self) -> RespPort {
        RespPort::DmaAxi {
            dma: self.dma,
            write: self.write_chan,
        }
    }
}

impl DmaEngine {
    fn axi(&mut self, write_chan: bool) -> &mut AxiChannel {
        if write_chan {
            &mut self.axi_write
        } else {
            &mut self.axi_read
        }
    }

    /// Back-end enqueues a burst descriptor (read or write direction).
    pub(crate) fn axi_enqueue_burst(
        &mut self,
        sys: &mut System,
        write_chan: bool,
        t: TransferId,
        base: u64,
        size: u64,
        is_write: bool,
    ) {
        let resp_port = self.axi(write_chan).resp_port();
        let chan = self.axi(write_chan);
        let req = chan
            .free
            .pop()
            .expect("burst enqueued on a full AXI channel");
        trace!(
            "dma {}: axi enqueue {} burst (req: {:?}, base: {:#x}, size: {:#x})",
            chan.dma,
            if is_write { "write" } else { "read" },
            req,
            base,
            size
        );
        chan.pending.push_back(req);
        if chan.pending.len() == 1 {
            chan.current_burst_base = base;
        }

        {
            let r = &mut sys.reqs[req];
            r.init();
            r.addr = base;
            r.size = size;
            r.is_write = is_write;
            r.resp_port = resp_port;
            r.scratch.transfer = Some(t.0);
        }

        self.axi_update(sys, write_chan);
    }

    /// Channel FSM: issue the head read, then drain matured completions.
    pub(crate) fn axi_fsm(&mut self, sys: &mut System, write_chan: bool) {
        // One read issued per cycle, head-of-queue, unless flow-controlled.
        let head_is_read = {
            let chan = self.axi(write_chan);
            !chan.stalled
                && chan
                    .pending
                    .front()
                    .is_some_and(|&r| !sys.reqs[r].is_write)
        };
        if head_is_read {
            self.axi_send_read(sys, write_chan);
        }

        // Push one matured read completion toward the back-end.
        let head = self.axi(write_chan).read_waiting.front().copied();
        if let Some(req) = head {
            if self.be_is_ready_to_accept_data() {
                let now = sys.engine.now();
                let ready_at = sys.reqs[req].scratch.ready_at;
                if ready_at <= now {
                    let chan = self.axi(write_chan);
                    chan.read_waiting.pop_front();
                    chan.read_wait_ack.push_back(req);

                    let (data, size) = {
                        let r = &mut sys.reqs[req];
                        (std::mem::take(&mut r.data), r.size)
                    };
                    self.be_write_data(sys, data, size);

                    let ev = if write_chan {
                        self.ev.axi_write
                    } else {
                        self.ev.axi_read
                    };
                    sys.engine.enqueue(ev);
                } else {
                    let ev = if write_chan {
                        self.ev.axi_write
                    } else {
                        self.ev.axi_read
                    };
                    sys.engine.enqueue_in(ev, ready_at - now);
                }
            }
        }
    }

    fn axi_send_read(&mut self, sys: &mut System, write_chan: bool) {
        let req = {
            let chan = self.axi(write_chan);
            chan.pending.pop_front().expect("checked non-empty")
        };
        // More bursts may be pending, and the back-end may push another.
        self.axi_update(sys, write_chan);
        sys.engine.enqueue(self.ev.be);

        trace!(
            "dma {}: axi read to port (req: {:?}, base: {:#x}, size: {:#x})",
            self.id, req, sys.reqs[req].addr, sys.reqs[req].size
        );
        self.axi_issue(sys, write_chan, req);
    }

    /// Push `req` out of the port and route the synchronous outcome.
    /// DENIED stalls the channel: either the request was queued
    /// downstream (its response will arrive on its own) or it was not
    /// performed at all, in which case the grant re-issues it here.
    fn axi_issue(&mut self, sys: &mut System, write_chan: bool, req: ReqId) {
        sys.reqs[req].prepare();
        let status = self.axi_port_req(sys, req);
        match status {
            IoStatus::Ok => {
                if sys.reqs[req].is_write {
                    self.axi_write_done(sys, write_chan, req);
                } else {
                    self.axi_read_done(sys, write_chan, req);
                }
            }
            IoStatus::Invalid => {
                warn!(
                    "invalid access during AXI burst (base: {:#x}, size: {:#x})",
                    sys.reqs[req].addr, sys.reqs[req].size
                );
                if sys.reqs[req].is_write {
                    // Account the chunk anyway or the transfer would
                    // never complete.
                    self.axi_write_done(sys, write_chan, req);
                }
            }
            IoStatus::Denied => {
                self.axi(write_chan).stalled = true;
            }
            IoStatus::Pending => {}
        }
    }

    /// A read burst completed (synchronously or via response): stamp it
    /// and queue it for the data push.
    fn axi_read_done(&mut self, sys: &mut System, write_chan: bool, req: ReqId) {
        let latency = sys.reqs[req].latency;
        sys.reqs[req].scratch.ready_at = sys.engine.now() + latency;
        trace!(
            "dma {}: axi read done (req: {:?}, latency: {})",
            self.id, req, latency
        );
        self.axi(write_chan).read_waiting.push_back(req);
        let ev = if write_chan {
            self.ev.axi_write
        } else {
            self.ev.axi_read
        };
        sys.engine.enqueue_in(ev, latency.max(1));
    }

    /// Back-end forwards a chunk to write: one port request per chunk.
    pub(crate) fn axi_write_data(
        &mut self,
        sys: &mut System,
        write_chan: bool,
        t: TransferId,
        data: Vec<u8>,
        size: u64,
    ) {
        let resp_port = self.axi(write_chan).resp_port();
        let base = {
            let chan = self.axi(write_chan);
            let base = chan.current_burst_base;
            chan.current_burst_base += size;
            base
        };

        let req = sys.reqs.alloc();
        {
            let r = &mut sys.reqs[req];
            r.addr = base;
            r.size = size;
            r.is_write = true;
            r.data = data;
            r.resp_port = resp_port;
            r.scratch.transfer = Some(t.0);
        }
        trace!(
            "dma {}: axi write data (req: {:?}, base: {:#x}, size: {:#x})",
            self.id, req, base, size
        );
        self.axi_issue(sys, write_chan, req);
    }

    /// A write chunk landed: ack it against the head burst.
    fn axi_write_done(&mut self, sys: &mut System, write_chan: bool, req: ReqId) {
        let size = sys.reqs[req].size;
        let burst = {
            let chan = self.axi(write_chan);
            *chan
                .pending
                .front()
                .expect("write completion with no pending burst")
        };

        // Acknowledge first so the peer channel can keep streaming.
        self.be_ack_data(sys, size);

        let remaining = {
            let r = &mut sys.reqs[burst];
            debug_assert!(r.size >= size);
            r.size -= size;
            r.size
        };
        trace!(
            "dma {}: axi write chunk done (burst: {:?}, remaining: {:#x})",
            self.id, burst, remaining
        );

        if remaining == 0 {
            let chan = self.axi(write_chan);
            chan.pending.pop_front();
            if let Some(&next) = chan.pending.front() {
                chan.current_burst_base = sys.reqs[next].addr;
            }
            chan.free.push(burst);
            sys.engine.enqueue(self.ev.be);
            self.axi_update(sys, write_chan);
        }

        sys.reqs.release(req);
    }

    /// The peer consumed a pushed read chunk: the pooled slot frees up.
    pub(crate) fn axi_write_data_ack(&mut self, sys: &mut System, write_chan: bool, _size: u64) {
        let id = self.id;
        let chan = self.axi(write_chan);
        let req = chan
            .read_wait_ack
            .pop_front()
            .expect("ack with no read awaiting it");
        trace!("dma {}: axi read slot {:?} freed", id, req);
        chan.free.push(req);
        sys.engine.enqueue(self.ev.be);
        self.axi_update(sys, write_chan);
    }

    /// Asynchronous response from the external port.
    pub(crate) fn axi_response(&mut self, sys: &mut System, req: ReqId) {
        let RespPort::DmaAxi { write, .. } = sys.reqs[req].resp_port else {
            unreachable!("AXI response routed to the wrong component");
        };
        if sys.reqs[req].is_write {
            self.axi_write_done(sys, write, req);
        } else {
            self.axi_read_done(sys, write, req);
        }
    }

    /// Grant after a DENIED port call: resume issuing.
    pub(crate) fn axi_granted(&mut self, sys: &mut System, req: ReqId) {
        let RespPort::DmaAxi { write, .. } = sys.reqs[req].resp_port else {
            unreachable!("AXI grant routed to the wrong component");
        };
        self.axi(write).stalled = false;
        if sys.reqs[req].status == IoStatus::Denied {
            // The target never performed the access; send it again.
            self.axi_issue(sys, write, req);
        }
        self.axi_update(sys, write);
        // Data was flow-controlled while denied; wake everyone who may
        // have been holding a chunk for this channel.
        sys.engine.enqueue(self.ev.be);
        sys.engine.enqueue(self.ev.tcdm_read);
        sys.engine.enqueue(self.ev.tcdm_write);
    }

    pub(crate) fn axi_update(&mut self, sys: &mut System, write_chan: bool) {
        let ev = if write_chan {
            self.ev.axi_write
        } else {
            self.ev.axi_read
        };
        sys.engine.enqueue(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_size_caps_at_page() {
        assert_eq!(axi_burst_size(0x1000_0000, 0x10000), AXI_PAGE_SIZE);
        assert_eq!(axi_burst_size(0x1000_0000, 0x100), 0x100);
    }

    #[test]
    fn burst_size_never_crosses_page() {
        // src 0x1000_0F80, 256 bytes -> 128 then 128.
        assert_eq!(axi_burst_size(0x1000_0F80, 256), 128);
        assert_eq!(axi_burst_size(0x1000_1000, 128), 128);
        // One byte before the boundary.
        assert_eq!(axi_burst_size(0x1000_0FFF, 0x1000), 1);
    }
}
