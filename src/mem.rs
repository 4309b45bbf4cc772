/*!
Functional byte memory used as a fabric target.

Scope:
- Loads/stores against a flat byte array at a node-local base, with a fixed
  per-access latency reported through the request's latency accumulator.
- Optional port occupancy: when `occupancy` is non-zero every accepted
  access holds the port busy for that many cycles and later arrivals are
  DENIED until the grant fires. This is the knob tests use to exercise the
  denied/grant leg of the wire protocol; the default (0) never denies.

Anything beyond forwarding the access to the byte array (atomic opcodes,
coherence) is out of scope: opcode and second operand are accepted and
ignored.
*/

use std::collections::VecDeque;

use crate::engine::Cycle;
use crate::req::{IoRequest, IoStatus, ReqId};

pub struct Memory {
    base: u64,
    data: Vec<u8>,
    latency: u64,
    /// Cycles each accepted access occupies the port. 0 = never busy.
    occupancy: u64,
    busy_until: Cycle,
    /// Requests denied while busy, granted in arrival order.
    pub(crate) denied: VecDeque<ReqId>,
}

impl Memory {
    pub fn new(base: u64, size: usize, latency: u64) -> Self {
        Self {
            base,
            data: vec![0; size],
            latency,
            occupancy: 0,
            busy_until: 0,
            denied: VecDeque::new(),
        }
    }

    /// Enable port-occupancy throttling (see module docs).
    pub fn with_occupancy(mut self, cycles: u64) -> Self {
        self.occupancy = cycles;
        self
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn busy_until(&self) -> Cycle {
        self.busy_until
    }

    /// Whether an access arriving at `now` would be denied.
    #[inline]
    pub fn is_busy(&self, now: Cycle) -> bool {
        self.occupancy > 0 && now < self.busy_until
    }

    /// Perform the access carried by `req`.
    ///
    /// Returns `Ok` with the latency accumulated on the request, `Invalid`
    /// when the range does not decode, or `Denied` while the port is busy
    /// (the caller records the request for the later grant).
    pub fn access(&mut self, now: Cycle, req: &mut IoRequest) -> IoStatus {
        if self.is_busy(now) {
            return IoStatus::Denied;
        }

        let Some(off) = self.decode(req.addr, req.size) else {
            return IoStatus::Invalid;
        };

        if req.size > 0 {
            let range = off..off + req.size as usize;
            if req.is_write {
                // Zero-size address phases and data-less probes skip the copy.
                if !req.data.is_empty() {
                    debug_assert_eq!(req.data.len() as u64, req.size);
                    self.data[range].copy_from_slice(&req.data);
                }
            } else {
                req.data.resize(req.size as usize, 0);
                req.data.copy_from_slice(&self.data[range]);
            }
        }

        req.inc_latency(self.latency);
        req.set_duration(self.latency);
        if self.occupancy > 0 {
            self.busy_until = now + self.occupancy;
        }
        IoStatus::Ok
    }

    fn decode(&self, addr: u64, size: u64) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let off = addr - self.base;
        if off + size > self.data.len() as u64 {
            return None;
        }
        Some(off as usize)
    }

    // Debug/test accessors bypassing timing.

    pub fn peek(&self, addr: u64, len: usize) -> &[u8] {
        let off = (addr - self.base) as usize;
        &self.data[off..off + len]
    }

    pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
        let off = (addr - self.base) as usize;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Fill with a position-derived pattern, handy for copy tests.
    pub fn fill_pattern(&mut self, seed: u8) {
        for (i, b) in self.data.iter_mut().enumerate() {
            *b = seed.wrapping_add((i & 0xFF) as u8) ^ ((i >> 8) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(addr: u64, size: u64, write: bool, data: Vec<u8>) -> IoRequest {
        IoRequest {
            addr,
            size,
            is_write: write,
            data,
            ..Default::default()
        }
    }

    #[test]
    fn read_write_round_trip() {
        let mut mem = Memory::new(0x1000, 0x100, 3);
        let mut w = req(0x1010, 4, true, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(mem.access(0, &mut w), IoStatus::Ok);
        assert_eq!(w.latency, 3);

        let mut r = req(0x1010, 4, false, Vec::new());
        assert_eq!(mem.access(0, &mut r), IoStatus::Ok);
        assert_eq!(r.data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn out_of_range_is_invalid() {
        let mut mem = Memory::new(0x1000, 0x100, 0);
        let mut r = req(0x10FE, 4, false, Vec::new());
        assert_eq!(mem.access(0, &mut r), IoStatus::Invalid);
        let mut r = req(0x0, 4, false, Vec::new());
        assert_eq!(mem.access(0, &mut r), IoStatus::Invalid);
    }

    #[test]
    fn occupancy_denies_until_free() {
        let mut mem = Memory::new(0, 0x100, 1).with_occupancy(4);
        let mut a = req(0, 4, false, Vec::new());
        assert_eq!(mem.access(10, &mut a), IoStatus::Ok);
        assert_eq!(mem.busy_until(), 14);

        let mut b = req(4, 4, false, Vec::new());
        assert_eq!(mem.access(12, &mut b), IoStatus::Denied);
        assert_eq!(mem.access(14, &mut b), IoStatus::Ok);
    }
}
