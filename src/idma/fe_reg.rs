/*!
Register-mapped front-end.

Register file (32-bit accesses; anything else is INVALID):

| Offset | Name          | R/W           |
|--------|---------------|---------------|
| 0x00   | config        | RW            |
| 0x04   | status        | RO            |
| 0x44   | next_id       | RO, side-effect: latches the registers into a new transfer |
| 0x84   | done_id       | RO            |
| 0xD0   | dst_addr_low  | RW            |
| 0xD8   | src_addr_low  | RW            |
| 0xE0   | length        | RW            |
| 0xE8   | dst_stride_2  | RW            |
| 0xF0   | src_stride_2  | RW            |
| 0xF8   | reps_2        | RW            |
| 0x100  | dst_stride_3  | RW (reserved) |
| 0x108  | src_stride_3  | RW (reserved) |
| 0x110  | reps_3        | RW (reserved) |

Reading `next_id` allocates an id, snapshots the registers into a
transfer and tries to enqueue it. A full middle-end keeps the transfer
stalled; the grant pulse (with the stalled id) fires once the queue
drains. Zero-length transfers, and 2D transfers with zero repetitions,
complete immediately with the next sequential id. Completions bump
`done_id` and raise the bound level IRQ.
*/

use log::{debug, warn};

use crate::req::{IoStatus, ReqId};
use crate::signal::{Register, ResetKind, Signal};
use crate::system::{GrantSink, System, WireMsg};

use super::{DmaEngine, FrontEnd, TransferConfig, TransferId};

pub const REG_CONFIG: u64 = 0x00;
pub const REG_STATUS: u64 = 0x04;
pub const REG_NEXT_ID: u64 = 0x44;
pub const REG_DONE_ID: u64 = 0x84;
pub const REG_DST_ADDR_LOW: u64 = 0xD0;
pub const REG_SRC_ADDR_LOW: u64 = 0xD8;
pub const REG_LENGTH: u64 = 0xE0;
pub const REG_DST_STRIDE_2: u64 = 0xE8;
pub const REG_SRC_STRIDE_2: u64 = 0xF0;
pub const REG_REPS_2: u64 = 0xF8;
pub const REG_DST_STRIDE_3: u64 = 0x100;
pub const REG_SRC_STRIDE_3: u64 = 0x108;
pub const REG_REPS_3: u64 = 0x110;

pub struct FeReg {
    config: Register<u32>,
    src: Register<u32>,
    dst: Register<u32>,
    length: Register<u32>,
    src_stride: Register<u32>,
    dst_stride: Register<u32>,
    reps: Register<u32>,
    src_stride_3: Register<u32>,
    dst_stride_3: Register<u32>,
    reps_3: Register<u32>,
    next_id: Register<u32>,
    done_id: Register<u32>,
    /// Pending grant toward a stalled initiator.
    do_grant: Signal<bool>,
    stalled_transfer: Option<TransferId>,
    pub(crate) irq_line: Option<usize>,
    pub(crate) grant_sink: GrantSink,
}

impl FeReg {
    pub fn new() -> Self {
        Self {
            config: Register::with_reset(0),
            src: Register::with_reset(0),
            dst: Register::with_reset(0),
            length: Register::with_reset(0),
            src_stride: Register::with_reset(0),
            dst_stride: Register::with_reset(0),
            reps: Register::with_reset(0),
            src_stride_3: Register::with_reset(0),
            dst_stride_3: Register::with_reset(0),
            reps_3: Register::with_reset(0),
            next_id: Register::with_reset(1),
            done_id: Register::with_reset(0),
            do_grant: Signal::new("fe_do_grant", ResetKind::Constant(false)),
            stalled_transfer: None,
            irq_line: None,
            grant_sink: GrantSink::Harness,
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.get()
    }

    pub fn done_id(&self) -> u32 {
        self.done_id.get()
    }

    /// Outstanding-transfer bit exposed in the status register.
    fn busy(&self) -> bool {
        self.next_id.get().wrapping_sub(self.done_id.get()) != 1
    }

    /// Apply every register's reset policy; a stalled descriptor is
    /// returned for release.
    pub fn reset(&mut self) -> Option<super::TransferId> {
        self.config.reset();
        self.src.reset();
        self.dst.reset();
        self.length.reset();
        self.src_stride.reset();
        self.dst_stride.reset();
        self.reps.reset();
        self.src_stride_3.reset();
        self.dst_stride_3.reset();
        self.reps_3.reset();
        self.next_id.reset();
        self.done_id.reset();
        self.do_grant.reset();
        self.stalled_transfer.take()
    }
}

impl Default for FeReg {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine {
    fn fe_reg(&mut self) -> &mut FeReg {
        match &mut self.fe {
            FrontEnd::Reg(fe) => fe,
            FrontEnd::Insn(_) => panic!("register access on an instruction front-end"),
        }
    }

    /// Decode one register-file access.
    pub(crate) fn fe_reg_access(&mut self, sys: &mut System, req: ReqId) -> IoStatus {
        let (offset, is_write, size) = {
            let r = &sys.reqs[req];
            (r.addr, r.is_write, r.size)
        };
        if size != 4 {
            return IoStatus::Invalid;
        }
        if is_write && sys.reqs[req].data.is_empty() {
            // Address-phase probe of a fabric write; the payload follows
            // in the data-phase flit.
            return IoStatus::Ok;
        }
        let value = if is_write {
            let d = &sys.reqs[req].data;
            u32::from_le_bytes([d[0], d[1], d[2], d[3]])
        } else {
            0
        };

        let result: u32 = match (offset, is_write) {
            (REG_CONFIG, true) => {
                self.fe_reg().config.set(value);
                0
            }
            (REG_CONFIG, false) => self.fe_reg().config.get(),
            (REG_STATUS, false) => self.fe_reg().busy() as u32,
            (REG_NEXT_ID, false) => {
                let (id, granted) = self.fe_reg_enqueue_copy(sys);
                if !granted {
                    warn!("iDMA transfer pushed while the queue is full; stalling");
                }
                id
            }
            (REG_DONE_ID, false) => self.fe_reg().done_id.get(),
            (REG_DST_ADDR_LOW, true) => {
                self.fe_reg().dst.set(value);
                0
            }
            (REG_DST_ADDR_LOW, false) => self.fe_reg().dst.get(),
            (REG_SRC_ADDR_LOW, true) => {
                self.fe_reg().src.set(value);
                0
            }
            (REG_SRC_ADDR_LOW, false) => self.fe_reg().src.get(),
            (REG_LENGTH, true) => {
                self.fe_reg().length.set(value);
                0
            }
            (REG_LENGTH, false) => self.fe_reg().length.get(),
            (REG_DST_STRIDE_2, true) => {
                self.fe_reg().dst_stride.set(value);
                0
            }
            (REG_DST_STRIDE_2, false) => self.fe_reg().dst_stride.get(),
            (REG_SRC_STRIDE_2, true) => {
                self.fe_reg().src_stride.set(value);
                0
            }
            (REG_SRC_STRIDE_2, false) => self.fe_reg().src_stride.get(),
            (REG_REPS_2, true) => {
                self.fe_reg().reps.set(value);
                0
            }
            (REG_REPS_2, false) => self.fe_reg().reps.get(),
            (REG_DST_STRIDE_3, true) => {
                self.fe_reg().dst_stride_3.set(value);
                0
            }
            (REG_DST_STRIDE_3, false) => self.fe_reg().dst_stride_3.get(),
            (REG_SRC_STRIDE_3, true) => {
                self.fe_reg().src_stride_3.set(value);
                0
            }
            (REG_SRC_STRIDE_3, false) => self.fe_reg().src_stride_3.get(),
            (REG_REPS_3, true) => {
                self.fe_reg().reps_3.set(value);
                0
            }
            (REG_REPS_3, false) => self.fe_reg().reps_3.get(),
            // Writes to read-only registers, and anything off the map.
            _ => return IoStatus::Invalid,
        };

        if !is_write {
            sys.reqs[req].data = result.to_le_bytes().to_vec();
        }
        IoStatus::Ok
    }

    /// Snapshot the registers into a transfer and try to enqueue it.
    /// Returns the allocated id and whether the enqueue was granted.
    fn fe_reg_enqueue_copy(&mut self, sys: &mut System) -> (u32, bool) {
        let id = {
            let fe = self.fe_reg();
            let id = fe.next_id.get();
            fe.next_id.set(id.wrapping_add(1));
            id
        };

        let t = self.transfers.alloc();
        {
            let (src, dst, len, ss, ds, reps, config) = {
                let fe = self.fe_reg();
                (
                    fe.src.get() as u64,
                    fe.dst.get() as u64,
                    fe.length.get() as u64,
                    fe.src_stride.get() as u64,
                    fe.dst_stride.get() as u64,
                    fe.reps.get() as u64,
                    fe.config.get() as u64,
                )
            };
            let tr = &mut self.transfers[t];
            tr.src = src;
            tr.dst = dst;
            tr.size = len;
            tr.src_stride = ss;
            tr.dst_stride = ds;
            tr.reps = reps;
            tr.config = TransferConfig::from_bits_retain(config);
            tr.id = id;
        }

        debug!(
            "dma {}: enqueue transfer (id: {}, src: {:#x}, dst: {:#x}, size: {:#x}, reps: {})",
            self.id,
            id,
            self.transfers[t].src,
            self.transfers[t].dst,
            self.transfers[t].size,
            self.transfers[t].reps
        );

        // Degenerate transfers complete on the spot with a fresh id.
        let degenerate = {
            let tr = &self.transfers[t];
            tr.size == 0 || (tr.config.contains(TransferConfig::ENABLE_2D) && tr.reps == 0)
        };
        if degenerate {
            self.fe_reg_ack_transfer(sys, t);
            return (id, true);
        }

        if self.me.can_accept_transfer() {
            self.me_enqueue_transfer(sys, t);
            (id, true)
        } else {
            let fe = self.fe_reg();
            fe.stalled_transfer = Some(t);
            fe.do_grant.set(true);
            (id, false)
        }
    }

    /// Middle-end finished a parent transfer.
    pub(crate) fn fe_reg_ack_transfer(&mut self, sys: &mut System, t: TransferId) {
        self.transfers.release(t);
        let irq = {
            let fe = self.fe_reg();
            fe.done_id.inc(1);
            fe.irq_line
        };
        if let Some(line) = irq {
            sys.wires.push_back(WireMsg::Irq { line, level: true });
        }
    }

    /// Middle-end drained: release a stalled transfer, pulsing the grant
    /// wire with its id.
    pub(crate) fn fe_reg_update(&mut self, sys: &mut System) {
        let ready = {
            let fe = self.fe_reg();
            fe.do_grant.get() && fe.stalled_transfer.is_some()
        };
        if ready && self.me.can_accept_transfer() {
            let (t, sink) = {
                let fe = self.fe_reg();
                fe.do_grant.set(false);
                (fe.stalled_transfer.take().expect("checked some"), fe.grant_sink)
            };
            debug!("dma {}: middle-end ready, unblocking transfer", self.id);
            let result = self.transfers[t].id;
            sys.wires.push_back(WireMsg::OffloadGrant { sink, result });
            self.me_enqueue_transfer(sys, t);
        }
    }
}
