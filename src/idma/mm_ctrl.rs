/*!
Memory-mapped DMA controller wrapper.

Fronts two instruction-driven engines (channel 0: L2 -> L1, channel 1:
L1 -> L2) with a 32-bit register window; address bit 0x200 selects the
channel. Reading `next_id` translates the staged registers into the
dmsrc/dmdst/dmstr/dmrep/dmcpyi offload sequence and arms a two-state FSM
(IDLE, POLL_STATUS) that issues `dmstati` every cycle until the engine
reports zero outstanding transfers, then latches `done_id` and pulses the
channel's done IRQ.

Only 32-bit accesses are legal; anything else is a fatal protocol
violation of the wrapper's bus contract.
*/

use log::{debug, trace};

use crate::engine::EventId;
use crate::req::{IoStatus, ReqId};
use crate::signal::Register;
use crate::system::{ConfigError, EventTarget, GrantSink, System, WireMsg};

use super::insn::{self, OffloadInsn};
use super::FrontendKind;

/// Channel-select bit in the register address.
pub const DIRECTION_OFFSET: u64 = 0x200;

pub const CTRL_CONFIG: u64 = 0x00;
pub const CTRL_STATUS: u64 = 0x04;
pub const CTRL_NEXT_ID: u64 = 0x44;
pub const CTRL_DONE_ID: u64 = 0x84;
pub const CTRL_DST_ADDR_LOW: u64 = 0xD0;
pub const CTRL_SRC_ADDR_LOW: u64 = 0xD8;
pub const CTRL_LENGTH: u64 = 0xE0;
pub const CTRL_DST_STRIDE_2: u64 = 0xE8;
pub const CTRL_SRC_STRIDE_2: u64 = 0xF0;
pub const CTRL_REPS_2: u64 = 0xF8;
pub const CTRL_DST_STRIDE_3: u64 = 0x100;
pub const CTRL_SRC_STRIDE_3: u64 = 0x108;
pub const CTRL_REPS_3: u64 = 0x110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtrlState {
    Idle,
    PollStatus,
}

struct CtrlChan {
    state: CtrlState,
    config: Register<u32>,
    status: Register<u32>,
    next_id: Register<u32>,
    done_id: Register<u32>,
    src: Register<u32>,
    dst: Register<u32>,
    len: Register<u32>,
    src_stride_2: Register<u32>,
    dst_stride_2: Register<u32>,
    reps_2: Register<u32>,
    src_stride_3: Register<u32>,
    dst_stride_3: Register<u32>,
    reps_3: Register<u32>,
    start_cycle: u64,
}

impl CtrlChan {
    fn new() -> Self {
        Self {
            state: CtrlState::Idle,
            config: Register::with_reset(0),
            status: Register::with_reset(0),
            next_id: Register::with_reset(0),
            done_id: Register::with_reset(0),
            src: Register::with_reset(0),
            dst: Register::with_reset(0),
            len: Register::with_reset(0),
            src_stride_2: Register::with_reset(0),
            dst_stride_2: Register::with_reset(0),
            reps_2: Register::with_reset(0),
            src_stride_3: Register::with_reset(0),
            dst_stride_3: Register::with_reset(0),
            reps_3: Register::with_reset(0),
            start_cycle: 0,
        }
    }
}

pub struct MmCtrl {
    id: usize,
    /// Wrapped engines, one per direction.
    dma: [usize; 2],
    chans: [CtrlChan; 2],
    fsm: [EventId; 2],
    irq_line: [Option<usize>; 2],
}

impl MmCtrl {
    /// Latched completion id of a channel (tests/debug).
    pub fn done_id(&self, chan: usize) -> u32 {
        self.chans[chan].done_id.get()
    }

    pub fn is_idle(&self, chan: usize) -> bool {
        self.chans[chan].state == CtrlState::Idle
    }

    /// Back to power-on state; IRQ bindings survive.
    pub fn reset(&mut self) {
        self.chans = [CtrlChan::new(), CtrlChan::new()];
    }

    /// Decode one 32-bit window access.
    pub(crate) fn access(&mut self, sys: &mut System, req: ReqId) -> IoStatus {
        let (mut offset, is_write, size) = {
            let r = &sys.reqs[req];
            (r.addr, r.is_write, r.size)
        };
        assert_eq!(
            size, 4,
            "the DMA controller window supports 32-bit accesses only"
        );
        if is_write && sys.reqs[req].data.is_empty() {
            // Address-phase probe of a fabric write; the payload follows
            // in the data-phase flit.
            return IoStatus::Ok;
        }

        let chan = usize::from(offset & DIRECTION_OFFSET != 0);
        offset &= 0x1FF;

        let value = if is_write {
            let d = &sys.reqs[req].data;
            u32::from_le_bytes([d[0], d[1], d[2], d[3]])
        } else {
            0
        };

        let result: u32 = match (offset, is_write) {
            (CTRL_CONFIG, true) => {
                self.chans[chan].config.set(value);
                0
            }
            (CTRL_CONFIG, false) => self.chans[chan].config.get(),
            (CTRL_STATUS, false) => self.chans[chan].status.get(),
            (CTRL_NEXT_ID, true) => {
                panic!("writing the DMA controller next_id register is not permitted")
            }
            (CTRL_NEXT_ID, false) => {
                assert!(
                    self.chans[chan].state == CtrlState::Idle,
                    "next_id read while a transfer is still polling"
                );
                self.trigger_copy(sys, chan)
            }
            (CTRL_DONE_ID, true) => {
                panic!("writing the DMA controller done_id register is not permitted")
            }
            (CTRL_DONE_ID, false) => self.chans[chan].done_id.get(),
            (CTRL_DST_ADDR_LOW, true) => {
                self.chans[chan].dst.set(value);
                0
            }
            (CTRL_DST_ADDR_LOW, false) => self.chans[chan].dst.get(),
            (CTRL_SRC_ADDR_LOW, true) => {
                self.chans[chan].src.set(value);
                0
            }
            (CTRL_SRC_ADDR_LOW, false) => self.chans[chan].src.get(),
            (CTRL_LENGTH, true) => {
                self.chans[chan].len.set(value);
                0
            }
            (CTRL_LENGTH, false) => self.chans[chan].len.get(),
            (CTRL_DST_STRIDE_2, true) => {
                self.chans[chan].dst_stride_2.set(value);
                0
            }
            (CTRL_DST_STRIDE_2, false) => self.chans[chan].dst_stride_2.get(),
            (CTRL_SRC_STRIDE_2, true) => {
                self.chans[chan].src_stride_2.set(value);
                0
            }
            (CTRL_SRC_STRIDE_2, false) => self.chans[chan].src_stride_2.get(),
            (CTRL_REPS_2, true) => {
                self.chans[chan].reps_2.set(value);
                0
            }
            (CTRL_REPS_2, false) => self.chans[chan].reps_2.get(),
            (CTRL_DST_STRIDE_3, true) => {
                self.chans[chan].dst_stride_3.set(value);
                0
            }
            (CTRL_DST_STRIDE_3, false) => self.chans[chan].dst_stride_3.get(),
            (CTRL_SRC_STRIDE_3, true) => {
                self.chans[chan].src_stride_3.set(value);
                0
            }
            (CTRL_SRC_STRIDE_3, false) => self.chans[chan].src_stride_3.get(),
            (CTRL_REPS_3, true) => {
                self.chans[chan].reps_3.set(value);
                0
            }
            (CTRL_REPS_3, false) => self.chans[chan].reps_3.get(),
            _ => return IoStatus::Invalid,
        };

        if !is_write {
            sys.reqs[req].data = result.to_le_bytes().to_vec();
        }
        IoStatus::Ok
    }

    /// next_id read: program the wrapped engine and start polling.
    fn trigger_copy(&mut self, sys: &mut System, chan: usize) -> u32 {
        let dma = self.dma[chan];
        let c = &self.chans[chan];
        debug!(
            "mm-ctrl {}: channel {} copy (src: {:#x}, dst: {:#x}, len: {:#x}, reps: {})",
            self.id,
            chan,
            c.src.get(),
            c.dst.get(),
            c.len.get(),
            c.reps_2.get()
        );

        let mut dmsrc = OffloadInsn::xdma(insn::DMSRC_FUNCT7, c.src.get(), 0);
        let mut dmdst = OffloadInsn::xdma(insn::DMDST_FUNCT7, c.dst.get(), 0);
        let mut dmstr = OffloadInsn::xdma(
            insn::DMSTR_FUNCT7,
            c.src_stride_2.get(),
            c.dst_stride_2.get(),
        );
        let mut dmrep = OffloadInsn::xdma(insn::DMREP_FUNCT7, c.reps_2.get(), 0);
        // The wrapper always drives the engine in 2D mode; 1D copies use a
        // single repetition.
        let mut dmcpyi = OffloadInsn::xdma(insn::DMCPYI_FUNCT7, c.len.get(), 0b10);

        sys.with_dma(dma, |d, sys| {
            d.fe_offload(sys, &mut dmsrc);
            d.fe_offload(sys, &mut dmdst);
            d.fe_offload(sys, &mut dmstr);
            d.fe_offload(sys, &mut dmrep);
            d.fe_offload(sys, &mut dmcpyi);
        });

        let id = dmcpyi.result;
        self.chans[chan].next_id.set(id);
        self.chans[chan].start_cycle = sys.engine.now();
        self.chans[chan].state = CtrlState::PollStatus;
        sys.engine.enqueue(self.fsm[chan]);
        id
    }

    /// Per-channel FSM: poll with dmstati until nothing is outstanding.
    pub(crate) fn fsm(&mut self, sys: &mut System, chan: usize) {
        match self.chans[chan].state {
            CtrlState::Idle => {
                trace!(
                    "mm-ctrl {}: channel {} idle after {} cycles",
                    self.id,
                    chan,
                    sys.engine.now() - self.chans[chan].start_cycle
                );
                // Level back down: the done IRQ is a pulse.
                if let Some(line) = self.irq_line[chan] {
                    sys.wires.push_back(WireMsg::Irq { line, level: false });
                }
            }
            CtrlState::PollStatus => {
                let dma = self.dma[chan];
                let mut dmstati = OffloadInsn::xdma(insn::DMSTATI_FUNCT7, 0, 0b10);
                sys.with_dma(dma, |d, sys| d.fe_offload(sys, &mut dmstati));
                self.chans[chan].status.set(dmstati.result);

                if dmstati.result == 0 {
                    debug!("mm-ctrl {}: channel {} transfer completed", self.id, chan);
                    let mut done = OffloadInsn::xdma(insn::DMSTATI_FUNCT7, 0, 0);
                    sys.with_dma(dma, |d, sys| d.fe_offload(sys, &mut done));
                    self.chans[chan].done_id.set(done.result);
                    if let Some(line) = self.irq_line[chan] {
                        sys.wires.push_back(WireMsg::Irq { line, level: true });
                    }
                    self.chans[chan].state = CtrlState::Idle;
                }
                sys.engine.enqueue(self.fsm[chan]);
            }
        }
    }

    /// Grant pulse from a wrapped engine whose dmcpyi had stalled.
    pub(crate) fn offload_granted(&mut self, sys: &mut System, chan: usize, result: u32) {
        self.chans[chan].next_id.set(result);
        self.chans[chan].state = CtrlState::PollStatus;
        sys.engine.enqueue(self.fsm[chan]);
    }
}

impl System {
    /// Wrap two instruction front-end engines behind one register window.
    /// Returns the controller index; bind IRQ lines separately.
    pub fn add_mm_ctrl(&mut self, dma0: usize, dma1: usize) -> Result<usize, ConfigError> {
        for dma in [dma0, dma1] {
            let ok = self
                .dmas
                .get(dma)
                .and_then(|d| d.as_ref())
                .is_some_and(|d| d.frontend_kind() == FrontendKind::Insn);
            if !ok {
                return Err(ConfigError::BadParam(
                    "mm controller requires instruction front-ends",
                ));
            }
        }

        let id = self.mm_ctrls.len();
        let fsm = [
            self.engine.new_event(EventTarget::MmCtrl { ctrl: id, chan: 0 }),
            self.engine.new_event(EventTarget::MmCtrl { ctrl: id, chan: 1 }),
        ];
        self.mm_ctrls.push(Some(MmCtrl {
            id,
            dma: [dma0, dma1],
            chans: [CtrlChan::new(), CtrlChan::new()],
            fsm,
            irq_line: [None, None],
        }));
        for (chan, dma) in [(0usize, dma0), (1, dma1)] {
            self.bind_dma_grant_sink(dma, GrantSink::MmCtrl { ctrl: id, chan });
        }
        Ok(id)
    }

    /// Bind a channel's done IRQ to a harness-observed line.
    pub fn bind_mm_ctrl_irq(&mut self, ctrl: usize, chan: usize, line: usize) {
        let mut c = self.mm_ctrls[ctrl].take().expect("controller is running");
        c.irq_line[chan] = Some(line);
        self.mm_ctrls[ctrl] = Some(c);
    }

    /// Map the controller window at node `(x, y)`.
    pub fn map_mm_ctrl(
        &mut self,
        ctrl: usize,
        x: i32,
        y: i32,
        base: u64,
    ) -> Result<(), ConfigError> {
        self.noc.map.add(crate::memmap::MapEntry {
            base,
            size: 2 * DIRECTION_OFFSET,
            x,
            y,
            remove_offset: base,
        })?;
        self.set_target(x, y, crate::noc::NodeTarget::MmCtrl(ctrl))?;
        Ok(())
    }
}
