/*!
Custom-instruction front-end.

Decodes offloaded xdma instructions by funct7: set-source and
set-destination take two 32-bit registers concatenated into a 64-bit
address, set-strides takes both strides, set-reps the repetition count.
The copy forms (immediate and register) latch size + config, allocate an
id and enqueue; the status forms return `done_id`, `next_id`, the busy
flag or the accept flag depending on the sub-operation.

Stall semantics: a copy refused by a full middle-end clears the
instruction's `granted` flag and holds the transfer; when the middle-end
drains, a grant pulse carrying the stalled id unblocks the issuing core.
*/

use log::{debug, trace};

use crate::signal::{Register, ResetKind, Signal};
use crate::system::{GrantSink, System, WireMsg};

use super::insn::{self, OffloadInsn};
use super::{DmaEngine, FrontEnd, TransferConfig, TransferId};

pub struct FeInsn {
    src: Register<u64>,
    dst: Register<u64>,
    src_stride: Register<u64>,
    dst_stride: Register<u64>,
    reps: Register<u64>,
    next_id: Register<u32>,
    done_id: Register<u32>,
    do_grant: Signal<bool>,
    stalled_transfer: Option<TransferId>,
    pub(crate) grant_sink: GrantSink,
}

impl FeInsn {
    pub fn new() -> Self {
        Self {
            src: Register::with_reset(0),
            dst: Register::with_reset(0),
            src_stride: Register::with_reset(0),
            dst_stride: Register::with_reset(0),
            reps: Register::with_reset(0),
            next_id: Register::with_reset(2),
            done_id: Register::with_reset(1),
            do_grant: Signal::new("fe_insn_do_grant", ResetKind::Constant(false)),
            stalled_transfer: None,
            grant_sink: GrantSink::Harness,
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.get()
    }

    pub fn done_id(&self) -> u32 {
        self.done_id.get()
    }

    /// Apply every register's reset policy; a stalled descriptor is
    /// returned for release.
    pub fn reset(&mut self) -> Option<super::TransferId> {
        self.src.reset();
        self.dst.reset();
        self.src_stride.reset();
        self.dst_stride.reset();
        self.reps.reset();
        self.next_id.reset();
        self.done_id.reset();
        self.do_grant.reset();
        self.stalled_transfer.take()
    }
}

impl Default for FeInsn {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine {
    fn fe_insn(&mut self) -> &mut FeInsn {
        match &mut self.fe {
            FrontEnd::Insn(fe) => fe,
            FrontEnd::Reg(_) => panic!("instruction offload on a register front-end"),
        }
    }

    /// Core offloads one xdma instruction.
    pub(crate) fn fe_offload(&mut self, sys: &mut System, insn: &mut OffloadInsn) {
        let f7 = insn::funct7(insn.opcode);
        insn.granted = true;

        match f7 {
            insn::DMSRC_FUNCT7 => {
                let addr = ((insn.arg_b as u64) << 32) | insn.arg_a as u64;
                trace!("dma {}: dmsrc {:#x}", self.id, addr);
                self.fe_insn().src.set(addr);
            }
            insn::DMDST_FUNCT7 => {
                let addr = ((insn.arg_b as u64) << 32) | insn.arg_a as u64;
                trace!("dma {}: dmdst {:#x}", self.id, addr);
                self.fe_insn().dst.set(addr);
            }
            insn::DMSTR_FUNCT7 => {
                trace!(
                    "dma {}: dmstr src {:#x} dst {:#x}",
                    self.id, insn.arg_a, insn.arg_b
                );
                self.fe_insn().src_stride.set(insn.arg_a as u64);
                self.fe_insn().dst_stride.set(insn.arg_b as u64);
            }
            insn::DMREP_FUNCT7 => {
                trace!("dma {}: dmrep {:#x}", self.id, insn.arg_a);
                self.fe_insn().reps.set(insn.arg_a as u64);
            }
            insn::DMCPY_FUNCT7 | insn::DMCPYI_FUNCT7 => {
                let (id, granted) = self.fe_insn_enqueue_copy(sys, insn.arg_b, insn.arg_a);
                insn.result = id;
                insn.granted = granted;
            }
            insn::DMSTAT_FUNCT7 | insn::DMSTATI_FUNCT7 => {
                insn.result = self.fe_insn_status(insn.arg_b);
            }
            other => {
                debug!("dma {}: unhandled xdma funct7 {:#04b}", self.id, other);
            }
        }
    }

    fn fe_insn_status(&mut self, which: u32) -> u32 {
        let busy = {
            let fe = self.fe_insn();
            fe.next_id.get().wrapping_sub(fe.done_id.get()) != 1
        };
        match which {
            0 => self.fe_insn().done_id.get(),
            1 => self.fe_insn().next_id.get().wrapping_add(1),
            2 => busy as u32,
            3 => !self.me.can_accept_transfer() as u32,
            _ => 0,
        }
    }

    fn fe_insn_enqueue_copy(&mut self, sys: &mut System, config: u32, size: u32) -> (u32, bool) {
        let id = {
            let fe = self.fe_insn();
            let id = fe.next_id.get();
            fe.next_id.set(id.wrapping_add(1));
            id
        };

        let t = self.transfers.alloc();
        {
            let (src, dst, ss, ds, reps) = {
                let fe = self.fe_insn();
                (
                    fe.src.get(),
                    fe.dst.get(),
                    fe.src_stride.get(),
                    fe.dst_stride.get(),
                    fe.reps.get(),
                )
            };
            let tr = &mut self.transfers[t];
            tr.src = src;
            tr.dst = dst;
            tr.size = size as u64;
            tr.src_stride = ss;
            tr.dst_stride = ds;
            tr.reps = reps;
            tr.config = TransferConfig::from_bits_retain(config as u64);
            tr.id = id;
        }

        debug!(
            "dma {}: dmcpy (id: {}, src: {:#x}, dst: {:#x}, size: {:#x}, config: {:#x})",
            self.id, id, self.transfers[t].src, self.transfers[t].dst, size, config
        );

        let degenerate = {
            let tr = &self.transfers[t];
            tr.size == 0 || (tr.config.contains(TransferConfig::ENABLE_2D) && tr.reps == 0)
        };
        if degenerate {
            self.fe_insn_ack_transfer(sys, t);
            return (id, true);
        }

        if self.me.can_accept_transfer() {
            self.me_enqueue_transfer(sys, t);
            (id, true)
        } else {
            debug!("dma {}: middle-end not ready, blocking transfer", self.id);
            let fe = self.fe_insn();
            fe.stalled_transfer = Some(t);
            fe.do_grant.set(true);
            (id, false)
        }
    }

    pub(crate) fn fe_insn_ack_transfer(&mut self, _sys: &mut System, t: TransferId) {
        self.transfers.release(t);
        self.fe_insn().done_id.inc(1);
    }

    pub(crate) fn fe_insn_update(&mut self, sys: &mut System) {
        let ready = {
            let fe = self.fe_insn();
            fe.do_grant.get() && fe.stalled_transfer.is_some()
        };
        if ready && self.me.can_accept_transfer() {
            let (t, sink, result) = {
                let fe = self.fe_insn();
                fe.do_grant.set(false);
                let t = fe.stalled_transfer.take().expect("checked some");
                (t, fe.grant_sink, fe.next_id.get().wrapping_sub(1))
            };
            debug!("dma {}: middle-end ready, unblocking transfer", self.id);
            sys.wires.push_back(WireMsg::OffloadGrant { sink, result });
            self.me_enqueue_transfer(sys, t);
        }
    }
}
