/*!
iDMA pipeline: front-end / middle-end / back-end architecture.

An engine is assembled from:
- a front-end (register-mapped or custom-instruction) accepting transfer
  descriptors and allocating ids,
- the 2D middle-end decomposing strided descriptors into 1D transfers,
- the back-end core splitting transfers into legal bursts and steering
  them across four protocol channels (local scratchpad read/write,
  external AXI read/write) selected by address range.

All stages of one engine live in a single `DmaEngine` value; they interact
through direct method calls, and with the rest of the system (ports,
events, arenas) through the `System` facade passed into every handler.

Submodules:
- insn: custom-instruction encoding shared by the front-end and wrapper
- fe_reg / fe_insn: the two front-end variants
- me: 2D -> 1D middle-end
- be: back-end core (burst splitting, channel steering, data/ack planes)
- be_axi: AXI-style protocol channel
- be_tcdm: scratchpad protocol channel
- mm_ctrl: memory-mapped controller wrapping two engines
*/

pub mod be;
pub mod be_axi;
pub mod be_tcdm;
pub mod fe_insn;
pub mod fe_reg;
pub mod insn;
pub mod me;
pub mod mm_ctrl;

#[cfg(test)]
mod tests;

use bitflags::bitflags;
use log::info;

use crate::engine::EventId;
use crate::noc::NodeTarget;
use crate::req::{IoStatus, ReqId};
use crate::system::{ConfigError, EventTarget, GrantSink, System};

pub use be::Backend;
pub use be_axi::AxiChannel;
pub use be_tcdm::TcdmChannel;
pub use fe_insn::FeInsn;
pub use fe_reg::FeReg;
pub use insn::OffloadInsn;
pub use me::MiddleEnd;

/// Per-engine clocked events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    MeFsm,
    BeFsm,
    BeRegulate,
    AxiFsm { write: bool },
    TcdmFsm { write: bool },
}

bitflags! {
    /// Transfer config word. Bits outside the named ones are carried
    /// opaquely (software may set reserved bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferConfig: u64 {
        const DECOUPLED = 1 << 0;
        const ENABLE_2D = 1 << 1;
        const STREAMOUT = 1 << 4;
        const _ = !0;
    }
}

/// Handle into an engine's transfer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferId(u32);

/// Descriptor exchanged between the pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct IdmaTransfer {
    pub src: u64,
    pub dst: u64,
    pub size: u64,
    pub src_stride: u64,
    pub dst_stride: u64,
    pub reps: u64,
    pub config: TransferConfig,
    /// Children in flight below the middle-end.
    pub nb_bursts: u32,
    /// All children of this parent have been emitted.
    pub bursts_sent: bool,
    /// Bytes not yet acknowledged by the destination protocol.
    pub ack_size: u64,
    /// Parent descriptor when this is a middle-end child.
    pub parent: Option<TransferId>,
    /// Front-end id (parents only).
    pub id: u32,
}

/// Slab arena for transfers, one per engine.
#[derive(Default)]
pub struct TransferArena {
    slots: Vec<IdmaTransfer>,
    free: Vec<u32>,
}

impl TransferArena {
    pub fn alloc(&mut self) -> TransferId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = IdmaTransfer::default();
            TransferId(idx)
        } else {
            self.slots.push(IdmaTransfer::default());
            TransferId((self.slots.len() - 1) as u32)
        }
    }

    pub fn release(&mut self, id: TransferId) {
        debug_assert!(!self.free.contains(&id.0), "double release of {id:?}");
        self.free.push(id.0);
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Drop every descriptor, live or free. Only sound when no handle is
    /// held anywhere, i.e. from a whole-engine reset.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

impl std::ops::Index<TransferId> for TransferArena {
    type Output = IdmaTransfer;
    #[inline]
    fn index(&self, id: TransferId) -> &IdmaTransfer {
        &self.slots[id.0 as usize]
    }
}

impl std::ops::IndexMut<TransferId> for TransferArena {
    #[inline]
    fn index_mut(&mut self, id: TransferId) -> &mut IdmaTransfer {
        &mut self.slots[id.0 as usize]
    }
}

/// The four protocol channels the back-end steers between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoId {
    TcdmRead,
    TcdmWrite,
    AxiRead,
    AxiWrite,
}

/// Where the engine's external (AXI) port is wired.
#[derive(Debug, Clone, Copy)]
pub enum AxiPort {
    /// Straight into a memory (no fabric in between).
    Mem(usize),
    /// Into the network interface at `(x, y)` on the given channel.
    Ni { x: i32, y: i32, wide: bool },
}

/// Which front-end variant the engine carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    Reg,
    Insn,
}

pub enum FrontEnd {
    Reg(FeReg),
    Insn(FeInsn),
}

/// Build-time parameters of one engine.
#[derive(Debug, Clone)]
pub struct DmaConfig {
    /// Local (scratchpad) address window; everything else is external.
    pub loc_base: u64,
    pub loc_size: u64,
    /// Scratchpad bus width in bytes (line size).
    pub tcdm_width: u64,
    /// Outstanding bursts per protocol channel.
    pub burst_queue_size: usize,
    /// Middle-end descriptor queue depth.
    pub transfer_queue_size: usize,
    pub axi_port: AxiPort,
    /// Memory index serving as the local scratchpad.
    pub tcdm_mem: usize,
    pub frontend: FrontendKind,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            loc_base: 0,
            loc_size: 0x1_0000,
            tcdm_width: 8,
            burst_queue_size: 4,
            transfer_queue_size: 4,
            axi_port: AxiPort::Mem(0),
            tcdm_mem: 0,
            frontend: FrontendKind::Reg,
        }
    }
}

/// Event handles of one engine.
#[derive(Clone, Copy)]
pub(crate) struct DmaEvents {
    pub me: EventId,
    pub be: EventId,
    pub be_reg: EventId,
    pub axi_read: EventId,
    pub axi_write: EventId,
    pub tcdm_read: EventId,
    pub tcdm_write: EventId,
}

/// Per-engine accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaStats {
    /// Parent transfers acknowledged to the front-end.
    pub transfers_completed: u64,
    /// Bytes confirmed written by a destination channel.
    pub bytes_acked: u64,
}

pub struct DmaEngine {
    pub(crate) id: usize,
    pub stats: DmaStats,
    pub transfers: TransferArena,
    pub fe: FrontEnd,
    pub me: MiddleEnd,
    pub be: Backend,
    pub axi_read: AxiChannel,
    pub axi_write: AxiChannel,
    pub tcdm_read: TcdmChannel,
    pub tcdm_write: TcdmChannel,
    pub(crate) axi_port: AxiPort,
    pub(crate) tcdm_mem: usize,
    pub(crate) ev: DmaEvents,
}

impl DmaEngine {
    /// Which front-end variant this engine carries.
    pub fn frontend_kind(&self) -> FrontendKind {
        match self.fe {
            FrontEnd::Reg(_) => FrontendKind::Reg,
            FrontEnd::Insn(_) => FrontendKind::Insn,
        }
    }

    /// Reset the whole engine: front-end registers to their seeds, every
    /// stage queue cleared, the descriptor arena wiped. Intended between
    /// runs, once in-flight port traffic has drained.
    pub fn reset(&mut self) {
        let _ = match &mut self.fe {
            FrontEnd::Reg(fe) => fe.reset(),
            FrontEnd::Insn(fe) => fe.reset(),
        };
        self.me.reset();
        self.be.reset();
        self.axi_read.reset();
        self.axi_write.reset();
        self.tcdm_read.reset();
        self.tcdm_write.reset();
        // Stages hold no handles anymore; reclaim the storage wholesale.
        self.transfers.clear();
    }

    /// Dispatch one of the engine's clocked events.
    pub(crate) fn handle_event(&mut self, sys: &mut System, ev: DmaEvent) {
        match ev {
            DmaEvent::MeFsm => self.me_fsm(sys),
            DmaEvent::BeFsm => self.be_fsm(sys),
            DmaEvent::BeRegulate => self.be_regulate(sys),
            DmaEvent::AxiFsm { write } => self.axi_fsm(sys, write),
            DmaEvent::TcdmFsm { write } => self.tcdm_fsm(sys, write),
        }
    }

    /// Channel fan-out used by the back-end core.
    pub(crate) fn proto_can_accept_burst(&self, p: ProtoId) -> bool {
        match p {
            ProtoId::TcdmRead => self.tcdm_read.can_accept_burst(),
            ProtoId::TcdmWrite => self.tcdm_write.can_accept_burst(),
            ProtoId::AxiRead => self.axi_read.can_accept_burst(),
            ProtoId::AxiWrite => self.axi_write.can_accept_burst(),
        }
    }

    pub(crate) fn proto_can_accept_data(&self, p: ProtoId) -> bool {
        match p {
            ProtoId::TcdmRead => self.tcdm_read.can_accept_data(),
            ProtoId::TcdmWrite => self.tcdm_write.can_accept_data(),
            // Chunks go straight to the interconnect, except while the
            // port has denied and the grant is still outstanding.
            ProtoId::AxiRead => self.axi_read.can_accept_data(),
            ProtoId::AxiWrite => self.axi_write.can_accept_data(),
        }
    }

    pub(crate) fn proto_get_burst_size(&self, p: ProtoId, base: u64, size: u64) -> u64 {
        match p {
            ProtoId::TcdmRead | ProtoId::TcdmWrite => size,
            ProtoId::AxiRead | ProtoId::AxiWrite => be_axi::axi_burst_size(base, size),
        }
    }

    pub(crate) fn proto_is_empty(&self, p: ProtoId) -> bool {
        match p {
            ProtoId::TcdmRead => self.tcdm_read.is_empty(),
            ProtoId::TcdmWrite => self.tcdm_write.is_empty(),
            ProtoId::AxiRead => self.axi_read.is_empty(),
            ProtoId::AxiWrite => self.axi_write.is_empty(),
        }
    }

    pub(crate) fn proto_read_burst(
        &mut self,
        sys: &mut System,
        p: ProtoId,
        t: TransferId,
        base: u64,
        size: u64,
    ) {
        match p {
            ProtoId::TcdmRead => self.tcdm_enqueue_burst(sys, false, t, base, size, false),
            ProtoId::AxiRead => self.axi_enqueue_burst(sys, false, t, base, size, false),
            _ => unreachable!("read burst on a write channel"),
        }
    }

    pub(crate) fn proto_write_burst(
        &mut self,
        sys: &mut System,
        p: ProtoId,
        t: TransferId,
        base: u64,
        size: u64,
    ) {
        match p {
            ProtoId::TcdmWrite => self.tcdm_enqueue_burst(sys, true, t, base, size, true),
            ProtoId::AxiWrite => self.axi_enqueue_burst(sys, true, t, base, size, true),
            _ => unreachable!("write burst on a read channel"),
        }
    }

    pub(crate) fn proto_write_data(
        &mut self,
        sys: &mut System,
        p: ProtoId,
        t: TransferId,
        data: Vec<u8>,
        size: u64,
    ) {
        match p {
            ProtoId::TcdmWrite => self.tcdm_write_data(sys, true, t, data, size),
            ProtoId::AxiWrite => self.axi_write_data(sys, true, t, data, size),
            _ => unreachable!("data pushed into a read channel"),
        }
    }

    pub(crate) fn proto_write_data_ack(&mut self, sys: &mut System, p: ProtoId, size: u64) {
        match p {
            ProtoId::TcdmRead => self.tcdm_write_data_ack(sys, false, size),
            ProtoId::AxiRead => self.axi_write_data_ack(sys, false, size),
            _ => unreachable!("data ack on a write channel"),
        }
    }

    /// Send a request out of the external port.
    pub(crate) fn axi_port_req(&mut self, sys: &mut System, req: ReqId) -> IoStatus {
        match self.axi_port {
            AxiPort::Mem(m) => sys.mem_port_req(m, req),
            AxiPort::Ni { x, y, wide } => {
                let node = sys.noc.node(x, y);
                sys.ni_req(node, req, wide)
            }
        }
    }

    /// Send a line out of the scratchpad port. The scratchpad is a plain
    /// memory; anything but a synchronous answer violates the protocol.
    pub(crate) fn tcdm_port_req(&mut self, sys: &mut System, req: ReqId) -> IoStatus {
        let now = sys.engine.now();
        let status = {
            let mem = &mut sys.mems[self.tcdm_mem];
            let r = &mut sys.reqs[req];
            mem.access(now, r)
        };
        if status == IoStatus::Denied || status == IoStatus::Pending {
            panic!("asynchronous reply on the scratchpad back-end");
        }
        status
    }

    // Front-end fan-out.

    pub(crate) fn fe_ack_transfer(&mut self, sys: &mut System, t: TransferId) {
        match self.frontend_kind() {
            FrontendKind::Reg => self.fe_reg_ack_transfer(sys, t),
            FrontendKind::Insn => self.fe_insn_ack_transfer(sys, t),
        }
    }

    pub(crate) fn fe_update(&mut self, sys: &mut System) {
        match self.frontend_kind() {
            FrontendKind::Reg => self.fe_reg_update(sys),
            FrontendKind::Insn => self.fe_insn_update(sys),
        }
    }
}

impl System {
    /// Assemble an engine and return its index.
    pub fn add_dma(&mut self, cfg: DmaConfig) -> Result<usize, ConfigError> {
        if cfg.tcdm_width < 1 {
            return Err(ConfigError::BadParam("scratchpad width"));
        }
        if cfg.burst_queue_size < 1 {
            return Err(ConfigError::BadParam("burst queue size"));
        }
        if cfg.transfer_queue_size < 1 {
            return Err(ConfigError::BadParam("transfer queue size"));
        }
        if cfg.tcdm_mem >= self.mems.len() {
            return Err(ConfigError::BadParam("scratchpad memory index"));
        }

        let id = self.dmas.len();
        let ev = DmaEvents {
            me: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::MeFsm,
            }),
            be: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::BeFsm,
            }),
            be_reg: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::BeRegulate,
            }),
            axi_read: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::AxiFsm { write: false },
            }),
            axi_write: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::AxiFsm { write: true },
            }),
            tcdm_read: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::TcdmFsm { write: false },
            }),
            tcdm_write: self.engine.new_event(EventTarget::Dma {
                dma: id,
                ev: DmaEvent::TcdmFsm { write: true },
            }),
        };

        let transfers = TransferArena::default();
        let mut reqs_pool = |n: usize| -> Vec<ReqId> {
            (0..n).map(|_| self.reqs.alloc()).collect()
        };
        let axi_read = AxiChannel::new(id, false, cfg.burst_queue_size, reqs_pool(cfg.burst_queue_size));
        let axi_write =
            AxiChannel::new(id, true, cfg.burst_queue_size, reqs_pool(cfg.burst_queue_size));
        let tcdm_read = TcdmChannel::new(cfg.tcdm_width, cfg.burst_queue_size, self.reqs.alloc());
        let tcdm_write = TcdmChannel::new(cfg.tcdm_width, cfg.burst_queue_size, self.reqs.alloc());

        let fe = match cfg.frontend {
            FrontendKind::Reg => FrontEnd::Reg(FeReg::new()),
            FrontendKind::Insn => FrontEnd::Insn(FeInsn::new()),
        };

        let engine = DmaEngine {
            id,
            stats: DmaStats::default(),
            transfers,
            fe,
            me: MiddleEnd::new(cfg.transfer_queue_size),
            be: Backend::new(cfg.loc_base, cfg.loc_size),
            axi_read,
            axi_write,
            tcdm_read,
            tcdm_write,
            axi_port: cfg.axi_port,
            tcdm_mem: cfg.tcdm_mem,
            ev,
        };
        self.dmas.push(Some(engine));
        info!(
            "added iDMA engine {} (local window {:#x}+{:#x})",
            id, cfg.loc_base, cfg.loc_size
        );
        Ok(id)
    }

    /// Expose a register-mapped front-end at node `(x, y)` under the given
    /// address window.
    pub fn map_dma_frontend(
        &mut self,
        dma: usize,
        x: i32,
        y: i32,
        base: u64,
        size: u64,
    ) -> Result<(), ConfigError> {
        self.noc.map.add(crate::memmap::MapEntry {
            base,
            size,
            x,
            y,
            remove_offset: base,
        })?;
        self.set_target(x, y, NodeTarget::DmaFeReg(dma))?;
        Ok(())
    }

    /// Bind the engine's completion IRQ to a harness-observed line.
    pub fn bind_dma_irq(&mut self, dma: usize, line: usize) {
        self.with_dma(dma, |d, _sys| match &mut d.fe {
            FrontEnd::Reg(fe) => fe.irq_line = Some(line),
            FrontEnd::Insn(_) => {}
        });
    }

    /// Set the consumer of front-end grant pulses (defaults to the
    /// harness; the memory-mapped wrapper re-binds this).
    pub fn bind_dma_grant_sink(&mut self, dma: usize, sink: GrantSink) {
        self.with_dma(dma, |d, _sys| match &mut d.fe {
            FrontEnd::Reg(fe) => fe.grant_sink = sink,
            FrontEnd::Insn(fe) => fe.grant_sink = sink,
        });
    }

    /// Offload one custom instruction into the engine's front-end.
    pub fn dma_offload(&mut self, dma: usize, insn: &mut OffloadInsn) {
        self.with_dma(dma, |d, sys| d.fe_offload(sys, insn));
        self.drain_wires();
    }

    /// Register-file write helper (tests and the demo binary).
    pub fn dma_reg_write(&mut self, dma: usize, offset: u64, value: u32) -> IoStatus {
        let req = self.reqs.alloc();
        {
            let r = &mut self.reqs[req];
            r.addr = offset;
            r.size = 4;
            r.is_write = true;
            r.data = value.to_le_bytes().to_vec();
        }
        let status = self.with_dma(dma, |d, sys| d.fe_reg_access(sys, req));
        self.drain_wires();
        self.reqs.release(req);
        status
    }

    /// Register-file read helper.
    pub fn dma_reg_read(&mut self, dma: usize, offset: u64) -> (IoStatus, u32) {
        let req = self.reqs.alloc();
        {
            let r = &mut self.reqs[req];
            r.addr = offset;
            r.size = 4;
            r.is_write = false;
        }
        let status = self.with_dma(dma, |d, sys| d.fe_reg_access(sys, req));
        self.drain_wires();
        let value = {
            let d = &self.reqs[req].data;
            if d.len() >= 4 {
                u32::from_le_bytes([d[0], d[1], d[2], d[3]])
            } else {
                0
            }
        };
        self.reqs.release(req);
        (status, value)
    }

    /// External-port access with the denied-booking of a memory target.
    pub(crate) fn mem_port_req(&mut self, m: usize, req: ReqId) -> IoStatus {
        let now = self.engine.now();
        let status = {
            let Self { mems, reqs, .. } = self;
            mems[m].access(now, &mut reqs[req])
        };
        if status == IoStatus::Denied {
            // Not performed: the caller must retry after the grant.
            self.reqs[req].status = IoStatus::Denied;
            self.mems[m].denied.push_back(req);
            let at = self.mems[m].busy_until();
            let ev = self.mem_grant_events[m];
            self.engine.enqueue_in(ev, at.saturating_sub(now).max(1));
        }
        status
    }
}
