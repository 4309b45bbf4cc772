/*!
Programmable timer block: two 32-bit counters, optionally cascaded into
one 64-bit counter.

Each counter has its own configuration register controlling enable, IRQ
enable, input-event mask, compare-clear, one-shot, prescaler enable and
value, and reference-clock select. Reaching the compare value optionally
clears the counter, optionally disables it (one-shot), and raises a level
IRQ when enabled.

The model never ticks per cycle. Counters driven by the simulation clock
are synchronized lazily: every register access and every fired event first
folds the elapsed cycles into the counter, and the next interesting cycle
(compare match) is scheduled as a single event. Counters driven by the
reference clock advance only on rising edges delivered through
`ref_clock_edge`, with the prescaler counting edges.
*/

use std::collections::VecDeque;

use bitflags::bitflags;
use log::{debug, trace};

use crate::engine::{Cycle, Engine, EventId};
use crate::req::{IoRequest, IoStatus};
use crate::system::{ConfigError, EventTarget, System, WireMsg};

pub const TIMER_CFG_LO: u64 = 0x00;
pub const TIMER_CFG_HI: u64 = 0x04;
pub const TIMER_CNT_LO: u64 = 0x08;
pub const TIMER_CNT_HI: u64 = 0x0C;
pub const TIMER_CMP_LO: u64 = 0x10;
pub const TIMER_CMP_HI: u64 = 0x14;
pub const TIMER_START_LO: u64 = 0x18;
pub const TIMER_START_HI: u64 = 0x1C;
pub const TIMER_RESET_LO: u64 = 0x20;
pub const TIMER_RESET_HI: u64 = 0x24;

bitflags! {
    /// Per-counter configuration register layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerCfg: u32 {
        const ENABLE = 1 << 0;
        const RESET = 1 << 1;
        const IRQ_EN = 1 << 2;
        const IEM = 1 << 3;
        /// Compare-clear: reset the counter on compare match.
        const CMP_CLR = 1 << 4;
        const ONE_SHOT = 1 << 5;
        const PRESC_EN = 1 << 6;
        /// Count reference-clock edges instead of simulation cycles.
        const REF_CLK = 1 << 7;
        /// 64-bit cascade (counter 0 config only).
        const CASC = 1 << 31;
        const _ = !0;
    }
}

/// Prescaler divisor field, bits 8..=15.
pub fn cfg_presc_val(cfg: u32) -> u32 {
    (cfg >> 8) & 0xFF
}

pub struct Timer {
    cfg: [u32; 2],
    value: [u32; 2],
    cmp: [u32; 2],
    enabled: [bool; 2],
    irq_enabled: [bool; 2],
    iem: [bool; 2],
    cmp_clr: [bool; 2],
    one_shot: [bool; 2],
    presc_en: [bool; 2],
    ref_clk: [bool; 2],
    presc_val: [u32; 2],
    presc_cur: [u32; 2],
    irq_state: [bool; 2],
    is_64: bool,
    /// Last cycle the clock-driven counters were folded up to.
    sync_time: Cycle,
    event: EventId,
    irq_line: [Option<usize>; 2],
    busy_line: Option<usize>,
    latency: u64,
}

impl Timer {
    pub fn new(event: EventId) -> Self {
        Self {
            cfg: [0; 2],
            value: [0; 2],
            cmp: [0; 2],
            enabled: [false; 2],
            irq_enabled: [false; 2],
            iem: [false; 2],
            cmp_clr: [false; 2],
            one_shot: [false; 2],
            presc_en: [false; 2],
            ref_clk: [false; 2],
            presc_val: [0; 2],
            presc_cur: [0; 2],
            irq_state: [false; 2],
            is_64: false,
            sync_time: 0,
            event,
            irq_line: [None, None],
            busy_line: None,
            latency: 0,
        }
    }

    pub fn bind_irq(&mut self, counter: usize, line: usize) {
        self.irq_line[counter] = Some(line);
    }

    pub fn bind_busy(&mut self, line: usize) {
        self.busy_line = Some(line);
    }

    pub fn counter_value(&self, counter: usize) -> u32 {
        self.value[counter]
    }

    pub fn value64(&self) -> u64 {
        ((self.value[1] as u64) << 32) | self.value[0] as u64
    }

    pub fn is_enabled(&self, counter: usize) -> bool {
        self.enabled[counter]
    }

    /// Back to power-on state; line bindings survive.
    pub fn reset(&mut self, now: Cycle) {
        self.cfg = [0; 2];
        self.value = [0; 2];
        self.cmp = [0; 2];
        self.enabled = [false; 2];
        self.irq_enabled = [false; 2];
        self.iem = [false; 2];
        self.cmp_clr = [false; 2];
        self.one_shot = [false; 2];
        self.presc_en = [false; 2];
        self.ref_clk = [false; 2];
        self.presc_val = [0; 2];
        self.presc_cur = [0; 2];
        self.irq_state = [false; 2];
        self.is_64 = false;
        self.sync_time = now;
    }

    /// Fold elapsed simulation cycles into the clock-driven counters.
    fn sync(&mut self, now: Cycle) {
        let elapsed = now - self.sync_time;
        self.sync_time = now;
        if elapsed == 0 {
            return;
        }

        if self.is_64 && self.enabled[0] && !self.ref_clk[0] {
            let v = self.value64().wrapping_add(elapsed);
            self.value[0] = v as u32;
            self.value[1] = (v >> 32) as u32;
        } else {
            for i in 0..2 {
                if self.enabled[i] && !self.ref_clk[i] {
                    self.value[i] = self.value[i].wrapping_add(elapsed as u32);
                }
            }
        }
    }

    fn compare64(&self) -> u64 {
        ((self.cmp[1] as u64) << 32) | self.cmp[0] as u64
    }

    /// Cycles until the next compare match of `counter`.
    fn remaining_cycles(&self, counter: usize) -> u64 {
        let cycles = if self.is_64 {
            self.compare64().wrapping_sub(self.value64())
        } else {
            let c = self.cmp[counter].wrapping_sub(self.value[counter]) as u64;
            if c == 0 { 0x1_0000_0000 } else { c }
        };
        if self.presc_en[counter] {
            cycles * (self.presc_val[counter] as u64 + 1)
        } else {
            cycles
        }
    }

    fn set_enable(&mut self, counter: usize, enabled: bool, wires: &mut VecDeque<WireMsg>) {
        self.enabled[counter] = enabled;
        if let Some(line) = self.busy_line {
            let level = self.enabled[0] || self.enabled[1];
            wires.push_back(WireMsg::Irq { line, level });
        }
    }

    fn set_value(&mut self, counter: usize, value: u64) {
        if self.is_64 {
            self.value[0] = value as u32;
            self.value[1] = (value >> 32) as u32;
        } else {
            self.value[counter] = value as u32;
        }
    }

    fn current_value(&self, counter: usize) -> u64 {
        if self.is_64 {
            self.value64()
        } else {
            self.value[counter] as u64
        }
    }

    fn current_compare(&self, counter: usize) -> u64 {
        if self.is_64 {
            self.compare64()
        } else {
            self.cmp[counter] as u64
        }
    }

    /// Evaluate the compare actions of one counter and reschedule.
    fn check_counter(
        &mut self,
        counter: usize,
        engine: &mut Engine<EventTarget>,
        wires: &mut VecDeque<WireMsg>,
    ) {
        self.irq_state[counter] = false;

        if self.enabled[counter] && self.current_compare(counter) == self.current_value(counter) {
            debug!("timer: counter {} reached compare value", counter);

            if self.cmp_clr[counter] {
                self.set_value(counter, 0);
            }

            if self.irq_enabled[counter] {
                if let Some(line) = self.irq_line[counter] {
                    wires.push_back(WireMsg::Irq { line, level: true });
                    self.irq_state[counter] = true;
                } else {
                    trace!("timer: compare hit with no irq line bound");
                }
            }

            if self.one_shot[counter] {
                self.set_enable(counter, false, wires);
            }
        }

        if self.enabled[counter]
            && !self.ref_clk[counter]
            && (self.irq_enabled[counter] || self.cmp_clr[counter])
        {
            let cycles = self.remaining_cycles(counter);
            if cycles > 0 {
                engine.enqueue_in(self.event, cycles);
            }
        }
    }

    fn check_state(&mut self, engine: &mut Engine<EventTarget>, wires: &mut VecDeque<WireMsg>) {
        if self.is_64 {
            self.check_counter(0, engine, wires);
        } else {
            self.check_counter(0, engine, wires);
            self.check_counter(1, engine, wires);
        }
    }

    fn apply_config(&mut self, counter: usize, raw: u32, wires: &mut VecDeque<WireMsg>) {
        let cfg = TimerCfg::from_bits_retain(raw);
        self.cfg[counter] = raw;
        self.set_enable(counter, cfg.contains(TimerCfg::ENABLE), wires);
        self.irq_enabled[counter] = cfg.contains(TimerCfg::IRQ_EN);
        self.iem[counter] = cfg.contains(TimerCfg::IEM);
        self.cmp_clr[counter] = cfg.contains(TimerCfg::CMP_CLR);
        self.one_shot[counter] = cfg.contains(TimerCfg::ONE_SHOT);
        self.presc_en[counter] = cfg.contains(TimerCfg::PRESC_EN);
        self.ref_clk[counter] = cfg.contains(TimerCfg::REF_CLK);
        self.presc_val[counter] = cfg_presc_val(raw);
        self.presc_cur[counter] = 0;
        if counter == 0 {
            self.is_64 = cfg.contains(TimerCfg::CASC);
        }

        debug!(
            "timer: counter {} configured (enabled: {}, irq: {}, cmp-clr: {}, one-shot: {}, presc: {}/{}, ref: {}, is64: {})",
            counter,
            self.enabled[counter],
            self.irq_enabled[counter],
            self.cmp_clr[counter],
            self.one_shot[counter],
            self.presc_en[counter],
            self.presc_val[counter],
            self.ref_clk[counter],
            self.is_64,
        );

        if cfg.contains(TimerCfg::RESET) {
            self.value[counter] = 0;
        }
    }

    /// Register-file access. 32-bit only; other sizes are INVALID.
    pub fn access(
        &mut self,
        engine: &mut Engine<EventTarget>,
        wires: &mut VecDeque<WireMsg>,
        req: &mut IoRequest,
    ) -> IoStatus {
        if req.size != 4 {
            return IoStatus::Invalid;
        }
        if req.is_write && req.data.is_empty() {
            // Address-phase probe of a fabric write; the payload follows
            // in the data-phase flit.
            req.inc_latency(self.latency);
            return IoStatus::Ok;
        }
        // The counters are not ticked every cycle, so fold time in before
        // any value is observed or changed.
        self.sync(engine.now());

        let value = if req.is_write {
            u32::from_le_bytes([req.data[0], req.data[1], req.data[2], req.data[3]])
        } else {
            0
        };

        let mut read_back: u32 = 0;
        match (req.addr, req.is_write) {
            (TIMER_CFG_LO, true) => {
                self.apply_config(0, value, wires);
                self.check_state(engine, wires);
            }
            (TIMER_CFG_LO, false) => read_back = self.cfg[0],
            (TIMER_CFG_HI, true) => {
                self.apply_config(1, value, wires);
                self.check_state(engine, wires);
            }
            (TIMER_CFG_HI, false) => read_back = self.cfg[1],
            (TIMER_CNT_LO, true) => {
                self.value[0] = value;
                self.check_state(engine, wires);
            }
            (TIMER_CNT_LO, false) => read_back = self.value[0],
            (TIMER_CNT_HI, true) => {
                self.value[1] = value;
                self.check_state(engine, wires);
            }
            (TIMER_CNT_HI, false) => read_back = self.value[1],
            (TIMER_CMP_LO, true) => {
                self.cmp[0] = value;
                self.check_state(engine, wires);
            }
            (TIMER_CMP_LO, false) => read_back = self.cmp[0],
            (TIMER_CMP_HI, true) => {
                self.cmp[1] = value;
                self.check_state(engine, wires);
            }
            (TIMER_CMP_HI, false) => read_back = self.cmp[1],
            (TIMER_START_LO, true) => {
                self.set_enable(0, true, wires);
                self.check_state(engine, wires);
            }
            (TIMER_START_HI, true) => {
                self.set_enable(1, true, wires);
                self.check_state(engine, wires);
            }
            (TIMER_RESET_LO, true) => {
                self.value[0] = 0;
                self.check_state(engine, wires);
            }
            (TIMER_RESET_HI, true) => {
                self.value[1] = 0;
                self.check_state(engine, wires);
            }
            _ => return IoStatus::Invalid,
        }

        if !req.is_write {
            req.data = read_back.to_le_bytes().to_vec();
        }
        req.inc_latency(self.latency);
        IoStatus::Ok
    }

    /// Compare-match event.
    pub fn on_event(&mut self, engine: &mut Engine<EventTarget>, wires: &mut VecDeque<WireMsg>) {
        self.sync(engine.now());
        self.check_state(engine, wires);
    }

    /// Reference-clock edge; only rising edges count, through the
    /// prescaler when enabled.
    pub fn ref_clock_edge(
        &mut self,
        engine: &mut Engine<EventTarget>,
        wires: &mut VecDeque<WireMsg>,
        value: bool,
    ) {
        if !value {
            return;
        }
        let mut check = false;

        if self.ref_clk[0] && self.enabled[0] && self.tick_prescaler(0) {
            if self.is_64 {
                let v = self.value64().wrapping_add(1);
                self.value[0] = v as u32;
                self.value[1] = (v >> 32) as u32;
            } else {
                self.value[0] = self.value[0].wrapping_add(1);
            }
            check = true;
        }

        if self.ref_clk[1] && self.enabled[1] && !self.is_64 && self.tick_prescaler(1) {
            self.value[1] = self.value[1].wrapping_add(1);
            check = true;
        }

        if check {
            self.sync(engine.now());
            self.check_state(engine, wires);
        }
    }

    fn tick_prescaler(&mut self, counter: usize) -> bool {
        if !self.presc_en[counter] {
            return true;
        }
        // Exact-match divider: the edge counter must hit the programmed
        // value, so a prescaler enabled with value 0 never produces a
        // tick until the counter wraps.
        self.presc_cur[counter] = self.presc_cur[counter].wrapping_add(1);
        if self.presc_cur[counter] == self.presc_val[counter] {
            self.presc_cur[counter] = 0;
            true
        } else {
            false
        }
    }
}

impl System {
    /// Add a timer block; optionally reachable through the mesh when
    /// mapped with `map_timer`.
    pub fn add_timer(&mut self) -> usize {
        let idx = self.timers.len();
        let ev = self.engine.new_event(EventTarget::Timer(idx));
        self.timers.push(Timer::new(ev));
        idx
    }

    /// Map a timer's register file at node `(x, y)`.
    pub fn map_timer(
        &mut self,
        timer: usize,
        x: i32,
        y: i32,
        base: u64,
    ) -> Result<(), ConfigError> {
        self.noc.map.add(crate::memmap::MapEntry {
            base,
            size: 0x40,
            x,
            y,
            remove_offset: base,
        })?;
        self.set_target(x, y, crate::noc::NodeTarget::Timer(timer))?;
        Ok(())
    }

    /// Direct register access helper for tests and the demo binary.
    pub fn timer_write(&mut self, timer: usize, offset: u64, value: u32) -> IoStatus {
        let mut req = IoRequest {
            addr: offset,
            size: 4,
            is_write: true,
            data: value.to_le_bytes().to_vec(),
            ..Default::default()
        };
        let Self {
            timers,
            engine,
            wires,
            ..
        } = self;
        let status = timers[timer].access(engine, wires, &mut req);
        self.drain_wires();
        status
    }

    pub fn timer_read(&mut self, timer: usize, offset: u64) -> (IoStatus, u32) {
        let mut req = IoRequest {
            addr: offset,
            size: 4,
            ..Default::default()
        };
        let Self {
            timers,
            engine,
            wires,
            ..
        } = self;
        let status = timers[timer].access(engine, wires, &mut req);
        self.drain_wires();
        let v = if req.data.len() >= 4 {
            u32::from_le_bytes([req.data[0], req.data[1], req.data[2], req.data[3]])
        } else {
            0
        };
        (status, v)
    }

    /// Drive a timer's reference-clock wire.
    pub fn timer_ref_clock(&mut self, timer: usize, value: bool) {
        let Self {
            timers,
            engine,
            wires,
            ..
        } = self;
        timers[timer].ref_clock_edge(engine, wires, value);
        self.drain_wires();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mesh;

    fn timer_system() -> (crate::system::System, usize, usize) {
        let mut sys = mesh(1, 1, 8, 4);
        let t = sys.add_timer();
        let line = sys.new_irq_line();
        sys.timers[t].bind_irq(0, line);
        (sys, t, line)
    }

    #[test]
    fn cascaded_timer_fires_at_compare() {
        // 64-bit cascade, compare = 1_000_000, prescaler off,
        // simulation clock. The IRQ rises exactly at the compare cycle.
        let (mut sys, t, line) = timer_system();

        sys.timer_write(t, TIMER_CMP_LO, 1_000_000);
        sys.timer_write(t, TIMER_CMP_HI, 0);
        let cfg = TimerCfg::ENABLE | TimerCfg::IRQ_EN | TimerCfg::CASC;
        sys.timer_write(t, TIMER_CFG_LO, cfg.bits());

        sys.run_until(999_999);
        assert!(!sys.irq_level(line));

        sys.run_until(1_000_001);
        assert!(sys.irq_level(line));
        assert_eq!(sys.harness.irq_log[0], (1_000_000, line, true));

        // Not one-shot: the counter keeps running past the match.
        sys.run_until(1_000_100);
        let (_, lo) = sys.timer_read(t, TIMER_CNT_LO);
        assert!(lo > 1_000_000);
        assert!(sys.timers[t].is_enabled(0));
    }

    #[test]
    fn one_shot_disables_on_match() {
        let (mut sys, t, line) = timer_system();

        sys.timer_write(t, TIMER_CMP_LO, 500);
        let cfg = TimerCfg::ENABLE | TimerCfg::IRQ_EN | TimerCfg::ONE_SHOT;
        sys.timer_write(t, TIMER_CFG_LO, cfg.bits());

        sys.run_until(1_000);
        assert!(sys.irq_level(line));
        assert!(!sys.timers[t].is_enabled(0));
        let (_, lo) = sys.timer_read(t, TIMER_CNT_LO);
        assert_eq!(lo, 500);
    }

    #[test]
    fn compare_clear_wraps_the_counter() {
        let (mut sys, t, _line) = timer_system();

        sys.timer_write(t, TIMER_CMP_LO, 100);
        let cfg = TimerCfg::ENABLE | TimerCfg::IRQ_EN | TimerCfg::CMP_CLR;
        sys.timer_write(t, TIMER_CFG_LO, cfg.bits());

        // Just past the second match the counter has restarted twice.
        sys.run_until(205);
        let (_, lo) = sys.timer_read(t, TIMER_CNT_LO);
        assert_eq!(lo, 5);
    }

    #[test]
    fn lazy_sync_shows_elapsed_cycles_on_read() {
        let (mut sys, t, _line) = timer_system();

        sys.timer_write(t, TIMER_CFG_LO, TimerCfg::ENABLE.bits());
        sys.run_until(777);
        let (status, lo) = sys.timer_read(t, TIMER_CNT_LO);
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(lo, 777);
    }

    #[test]
    fn ref_clock_counts_edges_through_prescaler() {
        let (mut sys, t, _line) = timer_system();

        // Prescaler divides by 4: 8 rising edges move the counter by 2.
        let cfg = TimerCfg::ENABLE | TimerCfg::PRESC_EN | TimerCfg::REF_CLK;
        sys.timer_write(t, TIMER_CFG_LO, cfg.bits() | (4 << 8));

        for _ in 0..8 {
            sys.timer_ref_clock(t, true);
            sys.timer_ref_clock(t, false);
        }
        assert_eq!(sys.timers[t].counter_value(0), 2);
    }

    #[test]
    fn second_counter_runs_independently() {
        let (mut sys, t, _line) = timer_system();
        let line1 = sys.new_irq_line();
        sys.timers[t].bind_irq(1, line1);

        sys.timer_write(t, TIMER_CMP_HI, 64);
        let cfg = TimerCfg::ENABLE | TimerCfg::IRQ_EN;
        sys.timer_write(t, TIMER_CFG_HI, cfg.bits());

        sys.run_until(100);
        assert!(sys.irq_level(line1));
        let (_, hi) = sys.timer_read(t, TIMER_CNT_HI);
        assert_eq!(hi, 100);
    }

    #[test]
    fn start_and_reset_strobes() {
        let (mut sys, t, _line) = timer_system();

        sys.timer_write(t, TIMER_START_LO, 1);
        sys.run_until(50);
        sys.timer_write(t, TIMER_RESET_LO, 1);
        sys.run_until(60);
        let (_, lo) = sys.timer_read(t, TIMER_CNT_LO);
        assert_eq!(lo, 10);
    }

    #[test]
    fn non_word_access_is_invalid() {
        let (mut sys, t, _line) = timer_system();
        let mut req = IoRequest {
            addr: TIMER_CFG_LO,
            size: 8,
            is_write: true,
            data: vec![0; 8],
            ..Default::default()
        };
        let crate::system::System {
            timers,
            engine,
            wires,
            ..
        } = &mut sys;
        assert_eq!(
            timers[t].access(engine, wires, &mut req),
            IoStatus::Invalid
        );
    }
}
