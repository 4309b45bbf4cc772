/*!
System facade: owns every component and runs the event loop.

Purpose
- Centralize the order-of-operations of a simulation step: pop the next
  clocked event, dispatch it to the owning component, then drain the wire
  inbox (IRQ levels, offload grants, synchronizer port traffic) in FIFO
  order before the next event fires.
- Route responses and grants: every in-flight request names its response
  port; the system is the only place that resolves those ports back to
  concrete components.

Integration
- Component logic lives with the components (`impl System` blocks in the
  `noc`, `idma`, `timer` and `fsync` modules); this module only owns the
  state, the builders and the dispatch plumbing.
- DMA engines and memory-mapped controllers are temporarily moved out of
  their slots while they run, because their handlers re-enter the system
  (ports, events, arenas). The slot is always restored before the handler
  returns; observing a `None` slot from inside a handler is a wiring bug.
*/

use std::collections::VecDeque;

use log::{debug, info, trace};
use thiserror::Error;

use crate::engine::{Cycle, Engine, EventId};
use crate::fsync::{Fsync, FsyncMsg, FsyncPort, FsyncResp};
use crate::idma::mm_ctrl::MmCtrl;
use crate::idma::{DmaEngine, DmaEvent};
use crate::mem::Memory;
use crate::memmap::{MapEntry, MemMapError};
use crate::noc::{NetworkInterface, Noc, NodeTarget, Router};
use crate::req::{IoStatus, ReqArena, ReqId, RespPort};
use crate::timer::Timer;

/// Dispatch key carried by every clocked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    RouterFsm(usize),
    NiFsm(usize),
    MemGrant(usize),
    Dma { dma: usize, ev: DmaEvent },
    Timer(usize),
    Fsync(usize),
    MmCtrl { ctrl: usize, chan: usize },
}

/// Same-thread wire traffic, delivered in FIFO order between events.
#[derive(Debug, Clone)]
pub enum WireMsg {
    /// Level change on an interrupt line.
    Irq { line: usize, level: bool },
    /// Grant pulse releasing a stalled offloaded instruction.
    OffloadGrant { sink: GrantSink, result: u32 },
    /// Synchronizer request leaving a node's master port on `axis`.
    FsyncUp { node: usize, axis: crate::fsync::Axis, msg: FsyncMsg },
    /// Synchronizer response leaving a node's slave port.
    FsyncDown { node: usize, port: FsyncPort, resp: FsyncResp },
}

/// Who consumes an offload grant pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSink {
    Harness,
    MmCtrl { ctrl: usize, chan: usize },
}

/// Scripted-initiator observation point used by tests and the demo binary.
#[derive(Default)]
pub struct Harness {
    pub responses: Vec<HarnessResponse>,
    /// (initiator tag, cycle) of every burst-level grant received.
    pub grants: Vec<(u64, Cycle)>,
    pub irq_level: Vec<bool>,
    pub irq_log: Vec<(Cycle, usize, bool)>,
    pub offload_grants: Vec<(Cycle, u32)>,
    pub fsync_resps: Vec<(Cycle, usize, FsyncPort, FsyncResp)>,
}

pub struct HarnessResponse {
    pub tag: u64,
    pub status: IoStatus,
    pub cycle: Cycle,
    pub data: Vec<u8>,
    pub latency: u64,
    pub duration: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mesh dimensions must be positive, got {0}x{1}")]
    BadDims(i32, i32),
    #[error("{0} must be at least 1")]
    BadParam(&'static str),
    #[error("node ({0}, {1}) outside the {2}x{3} mesh")]
    NodeOutOfRange(i32, i32, i32, i32),
    #[error("node ({0}, {1}) already has a target")]
    TargetTaken(i32, i32),
    #[error(transparent)]
    Map(#[from] MemMapError),
}

/// Build-time parameters of the fabric.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub dim_x: i32,
    pub dim_y: i32,
    /// Wide-channel flit payload ceiling, bytes.
    pub wide_width: u64,
    /// Narrow-channel flit payload ceiling, bytes.
    pub narrow_width: u64,
    /// Router input/output FIFO depth (one extra slot models the stalled
    /// flit sitting on the wire).
    pub router_queue_size: usize,
    /// Outstanding-burst ceiling and child-request pool size of every NI.
    pub ni_outstanding_reqs: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            dim_x: 4,
            dim_y: 4,
            wide_width: 64,
            narrow_width: 8,
            router_queue_size: 4,
            ni_outstanding_reqs: 8,
        }
    }
}

pub struct System {
    pub engine: Engine<EventTarget>,
    pub reqs: ReqArena,
    pub noc: Noc,
    pub mems: Vec<Memory>,
    pub(crate) mem_grant_events: Vec<EventId>,
    pub(crate) dmas: Vec<Option<DmaEngine>>,
    pub(crate) mm_ctrls: Vec<Option<MmCtrl>>,
    pub timers: Vec<Timer>,
    pub fsync: Fsync,
    pub harness: Harness,
    pub(crate) wires: VecDeque<WireMsg>,
}

impl System {
    pub fn new(cfg: SystemConfig) -> Result<Self, ConfigError> {
        if cfg.dim_x < 1 || cfg.dim_y < 1 {
            return Err(ConfigError::BadDims(cfg.dim_x, cfg.dim_y));
        }
        if cfg.wide_width < 1 || cfg.narrow_width < 1 {
            return Err(ConfigError::BadParam("flit width"));
        }
        if cfg.router_queue_size < 1 {
            return Err(ConfigError::BadParam("router queue size"));
        }
        if cfg.ni_outstanding_reqs < 1 {
            return Err(ConfigError::BadParam("NI outstanding-request budget"));
        }

        let mut engine = Engine::new();
        let nodes = (cfg.dim_x * cfg.dim_y) as usize;
        let mut routers = Vec::with_capacity(nodes);
        let mut nis = Vec::with_capacity(nodes);
        for y in 0..cfg.dim_y {
            for x in 0..cfg.dim_x {
                let node = (y * cfg.dim_x + x) as usize;
                let r_ev = engine.new_event(EventTarget::RouterFsm(node));
                routers.push(Router::new(x, y, cfg.router_queue_size, r_ev));
                let n_ev = engine.new_event(EventTarget::NiFsm(node));
                nis.push(NetworkInterface::new(
                    x,
                    y,
                    cfg.ni_outstanding_reqs,
                    n_ev,
                ));
            }
        }

        let mut sys = Self {
            engine,
            reqs: ReqArena::new(),
            noc: Noc {
                dim_x: cfg.dim_x,
                dim_y: cfg.dim_y,
                wide_width: cfg.wide_width,
                narrow_width: cfg.narrow_width,
                router_queue_size: cfg.router_queue_size,
                map: crate::memmap::MemoryMap::new(),
                routers,
                nis,
                targets: vec![NodeTarget::None; nodes],
            },
            mems: Vec::new(),
            mem_grant_events: Vec::new(),
            dmas: Vec::new(),
            mm_ctrls: Vec::new(),
            timers: Vec::new(),
            fsync: Fsync::default(),
            harness: Harness::default(),
            wires: VecDeque::new(),
        };
        sys.ni_fill_pools();
        info!(
            "built {}x{} mesh (wide: {} B, narrow: {} B)",
            cfg.dim_x, cfg.dim_y, cfg.wide_width, cfg.narrow_width
        );
        Ok(sys)
    }

    #[inline]
    pub fn now(&self) -> Cycle {
        self.engine.now()
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    fn check_node(&self, x: i32, y: i32) -> Result<usize, ConfigError> {
        if !self.noc.contains(x, y) {
            return Err(ConfigError::NodeOutOfRange(
                x,
                y,
                self.noc.dim_x,
                self.noc.dim_y,
            ));
        }
        Ok(self.noc.node(x, y))
    }

    pub(crate) fn set_target(
        &mut self,
        x: i32,
        y: i32,
        target: NodeTarget,
    ) -> Result<usize, ConfigError> {
        let node = self.check_node(x, y)?;
        if self.noc.targets[node] != NodeTarget::None {
            return Err(ConfigError::TargetTaken(x, y));
        }
        self.noc.targets[node] = target;
        Ok(node)
    }

    /// Register a memory behind node `(x, y)`, mapped at `[base, base+size)`
    /// with no address translation. Returns the memory index.
    pub fn add_memory(
        &mut self,
        x: i32,
        y: i32,
        base: u64,
        size: u64,
        latency: u64,
    ) -> Result<usize, ConfigError> {
        self.add_memory_translated(x, y, base, size, latency, 0)
    }

    /// Same, but the NI subtracts `remove_offset` before the request
    /// reaches the memory, which therefore decodes local offsets.
    pub fn add_memory_translated(
        &mut self,
        x: i32,
        y: i32,
        base: u64,
        size: u64,
        latency: u64,
        remove_offset: u64,
    ) -> Result<usize, ConfigError> {
        let idx = self.mems.len();
        self.noc.map.add(MapEntry {
            base,
            size,
            x,
            y,
            remove_offset,
        })?;
        self.set_target(x, y, NodeTarget::Mem(idx))?;
        self.mems
            .push(Memory::new(base - remove_offset, size as usize, latency));
        let ev = self.engine.new_event(EventTarget::MemGrant(idx));
        self.mem_grant_events.push(ev);
        Ok(idx)
    }

    /// Direct handle to a memory, for test setup and result checks.
    pub fn mem(&mut self, idx: usize) -> &mut Memory {
        &mut self.mems[idx]
    }

    /// Allocate a fresh interrupt line observed by the harness.
    pub fn new_irq_line(&mut self) -> usize {
        self.harness.irq_level.push(false);
        self.harness.irq_level.len() - 1
    }

    pub fn irq_level(&self, line: usize) -> bool {
        self.harness.irq_level[line]
    }

    /// Reset every component back to power-on state: router and NI queues
    /// cleared, DMA engines re-seeded, timers/synchronizers/controllers
    /// re-initialized. Intended between runs once traffic has drained;
    /// bursts still queued at an NI are dropped without a response.
    pub fn reset(&mut self) {
        for router in &mut self.noc.routers {
            router.reset();
        }
        for node in 0..self.noc.nis.len() {
            for burst in self.noc.nis[node].reset() {
                // Initiator-owned storage is reclaimed here; pooled DMA
                // requests are reclaimed by their channel's own reset.
                match self.reqs[burst].resp_port {
                    RespPort::DmaAxi { .. } => {}
                    RespPort::Harness(_) | RespPort::None => self.reqs.release(burst),
                }
            }
        }
        for dma in &mut self.dmas {
            dma.as_mut().expect("DMA engine is running").reset();
        }
        for ctrl in &mut self.mm_ctrls {
            ctrl.as_mut().expect("controller is running").reset();
        }
        let now = self.engine.now();
        for timer in &mut self.timers {
            timer.reset(now);
        }
        for node in &mut self.fsync.nodes {
            node.reset();
        }
        self.wires.clear();
        info!("system reset at cycle {now}");
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until the event queue drains or `limit` is reached. Returns the
    /// cycle the clock ends on.
    pub fn run_until(&mut self, limit: Cycle) -> Cycle {
        while let Some((_ev, target)) = self.engine.pop_before(limit) {
            self.dispatch(target);
            self.drain_wires();
        }
        self.engine.advance_to(limit);
        self.engine.now()
    }

    /// Run `cycles` cycles from the current time.
    pub fn run_cycles(&mut self, cycles: Cycle) -> Cycle {
        let limit = self.engine.now() + cycles;
        self.run_until(limit)
    }

    /// Run until nothing is scheduled anymore, bounded by `max` cycles as
    /// a hang guard. Returns true when the queue drained.
    pub fn run_to_idle(&mut self, max: Cycle) -> bool {
        let limit = self.engine.now() + max;
        while let Some((_ev, target)) = self.engine.pop_before(limit) {
            self.dispatch(target);
            self.drain_wires();
        }
        self.engine.next_cycle().is_none()
    }

    fn dispatch(&mut self, target: EventTarget) {
        trace!("cycle {}: dispatch {:?}", self.engine.now(), target);
        match target {
            EventTarget::RouterFsm(node) => self.router_fsm(node),
            EventTarget::NiFsm(node) => self.ni_fsm(node),
            EventTarget::MemGrant(m) => self.mem_grant(m),
            EventTarget::Dma { dma, ev } => self.with_dma(dma, |d, sys| d.handle_event(sys, ev)),
            EventTarget::Timer(t) => {
                let Self {
                    timers,
                    engine,
                    wires,
                    ..
                } = self;
                timers[t].on_event(engine, wires);
            }
            EventTarget::Fsync(node) => self.fsync_fsm(node),
            EventTarget::MmCtrl { ctrl, chan } => {
                self.with_mm_ctrl(ctrl, |c, sys| c.fsm(sys, chan))
            }
        }
    }

    /// Deliver queued wire traffic in FIFO order. Handlers may queue more;
    /// the loop runs until the inbox is empty.
    pub(crate) fn drain_wires(&mut self) {
        while let Some(msg) = self.wires.pop_front() {
            match msg {
                WireMsg::Irq { line, level } => {
                    if self.harness.irq_level[line] != level {
                        debug!(
                            "cycle {}: irq line {} -> {}",
                            self.engine.now(),
                            line,
                            level
                        );
                        self.harness.irq_level[line] = level;
                        self.harness.irq_log.push((self.engine.now(), line, level));
                    }
                }
                WireMsg::OffloadGrant { sink, result } => match sink {
                    GrantSink::Harness => {
                        self.harness.offload_grants.push((self.engine.now(), result))
                    }
                    GrantSink::MmCtrl { ctrl, chan } => {
                        self.with_mm_ctrl(ctrl, |c, sys| c.offload_granted(sys, chan, result))
                    }
                },
                WireMsg::FsyncUp { node, axis, msg } => self.fsync_deliver_up(node, axis, msg),
                WireMsg::FsyncDown { node, port, resp } => {
                    self.fsync_deliver_down(node, port, resp)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Target ports, responses, grants
    // ------------------------------------------------------------------

    /// Forward `req` to the target behind `node`. Synchronous statuses come
    /// back directly; DENIED additionally books the request for the later
    /// grant.
    pub(crate) fn target_req(&mut self, node: usize, req: ReqId) -> IoStatus {
        match self.noc.targets[node] {
            NodeTarget::None => IoStatus::Invalid,
            NodeTarget::Mem(m) => {
                let now = self.engine.now();
                let status = {
                    let Self { mems, reqs, .. } = self;
                    mems[m].access(now, &mut reqs[req])
                };
                if status == IoStatus::Denied {
                    // Mark the request so the initiator knows it was not
                    // performed and must be retried after the grant.
                    self.reqs[req].status = IoStatus::Denied;
                    self.mems[m].denied.push_back(req);
                    let at = self.mems[m].busy_until();
                    let ev = self.mem_grant_events[m];
                    self.engine.enqueue_in(ev, at.saturating_sub(now).max(1));
                }
                status
            }
            NodeTarget::Timer(t) => {
                let Self {
                    timers,
                    engine,
                    wires,
                    reqs,
                    ..
                } = self;
                timers[t].access(engine, wires, &mut reqs[req])
            }
            NodeTarget::MmCtrl(c) => self.with_mm_ctrl(c, |ctrl, sys| ctrl.access(sys, req)),
            NodeTarget::DmaFeReg(d) => self.with_dma(d, |dma, sys| dma.fe_reg_access(sys, req)),
        }
    }

    /// A throttled memory freed up: grant its denied requests in order.
    fn mem_grant(&mut self, m: usize) {
        let now = self.engine.now();
        loop {
            if self.mems[m].is_busy(now) {
                if !self.mems[m].denied.is_empty() {
                    let at = self.mems[m].busy_until();
                    let ev = self.mem_grant_events[m];
                    self.engine.enqueue_in(ev, at - now);
                }
                return;
            }
            let Some(req) = self.mems[m].denied.pop_front() else {
                return;
            };
            if let Some(node) = self.reqs[req].scratch.ni {
                // A network interface held the flit; it retries the access.
                self.ni_target_granted(node);
            } else {
                self.deliver_grant(req);
            }
        }
    }

    /// Route a completed request's response to its initiator.
    pub(crate) fn deliver_resp(&mut self, req: ReqId) {
        match self.reqs[req].resp_port {
            RespPort::Harness(_) => {
                let r = &mut self.reqs[req];
                let resp = HarnessResponse {
                    tag: r.tag,
                    status: r.status,
                    cycle: 0,
                    data: std::mem::take(&mut r.data),
                    latency: r.latency,
                    duration: r.duration,
                };
                let cycle = self.engine.now();
                self.harness.responses.push(HarnessResponse { cycle, ..resp });
                self.reqs.release(req);
            }
            RespPort::DmaAxi { dma, .. } => {
                self.with_dma(dma, |d, sys| d.axi_response(sys, req))
            }
            RespPort::None => {
                // Fire-and-forget internal request.
                self.reqs.release(req);
            }
        }
    }

    /// Route a grant pulse to the initiator of a previously denied request.
    pub(crate) fn deliver_grant(&mut self, req: ReqId) {
        match self.reqs[req].resp_port {
            RespPort::Harness(_) => {
                let tag = self.reqs[req].tag;
                let now = self.engine.now();
                self.harness.grants.push((tag, now));
            }
            RespPort::DmaAxi { dma, .. } => self.with_dma(dma, |d, sys| d.axi_granted(sys, req)),
            RespPort::None => {}
        }
    }

    // ------------------------------------------------------------------
    // Take-out helpers
    // ------------------------------------------------------------------

    pub(crate) fn with_dma<R>(
        &mut self,
        dma: usize,
        f: impl FnOnce(&mut DmaEngine, &mut System) -> R,
    ) -> R {
        let mut engine = self.dmas[dma]
            .take()
            .expect("DMA engine re-entered its own handler");
        let r = f(&mut engine, self);
        self.dmas[dma] = Some(engine);
        r
    }

    pub(crate) fn with_mm_ctrl<R>(
        &mut self,
        ctrl: usize,
        f: impl FnOnce(&mut MmCtrl, &mut System) -> R,
    ) -> R {
        let mut c = self.mm_ctrls[ctrl]
            .take()
            .expect("mm controller re-entered its own handler");
        let r = f(&mut c, self);
        self.mm_ctrls[ctrl] = Some(c);
        r
    }

    /// Immutable view of a DMA engine (panics while it is running).
    pub fn dma(&self, dma: usize) -> &DmaEngine {
        self.dmas[dma].as_ref().expect("DMA engine is running")
    }

    pub fn mm_ctrl(&self, ctrl: usize) -> &MmCtrl {
        self.mm_ctrls[ctrl].as_ref().expect("controller is running")
    }

    // ------------------------------------------------------------------
    // Scripted initiator
    // ------------------------------------------------------------------

    /// Issue a burst from the harness initiator into the NI at `(x, y)`.
    /// The response (and any grant) lands in `self.harness`.
    pub fn send_burst(
        &mut self,
        x: i32,
        y: i32,
        addr: u64,
        size: u64,
        is_write: bool,
        data: Vec<u8>,
        wide: bool,
        tag: u64,
    ) -> IoStatus {
        let node = self.noc.node(x, y);
        let req = self.reqs.alloc();
        {
            let r = &mut self.reqs[req];
            r.addr = addr;
            r.size = size;
            r.is_write = is_write;
            r.data = data;
            r.status = IoStatus::Pending;
            r.resp_port = RespPort::Harness(0);
            r.tag = tag;
        }
        let status = self.ni_req(node, req, wide);
        if status == IoStatus::Ok {
            // Zero-size fast path: complete on the spot.
            let cycle = self.engine.now();
            let r = &mut self.reqs[req];
            let resp = HarnessResponse {
                tag: r.tag,
                status: IoStatus::Ok,
                cycle,
                data: std::mem::take(&mut r.data),
                latency: 0,
                duration: 0,
            };
            self.harness.responses.push(resp);
            self.reqs.release(req);
        }
        status
    }
}
