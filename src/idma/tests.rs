//! Pipeline tests: transfers end to end through front-end, middle-end,
//! back-end and both protocol channels.

use crate::idma::fe_reg::*;
use crate::idma::insn::{self, OffloadInsn};
use crate::idma::{AxiPort, DmaConfig, FrontendKind};
use crate::req::IoStatus;
use crate::system::{GrantSink, System, SystemConfig};
use crate::test_utils::{drain, pattern};

const LOC_BASE: u64 = 0x0;
const LOC_SIZE: u64 = 0x2_0000;
const EXT_BASE: u64 = 0x4000_0000;

/// Minimal 1x1 fabric: scratchpad plus an external memory reached
/// directly through the AXI port.
fn engine_system(frontend: FrontendKind) -> (System, usize, usize, usize) {
    let mut sys = System::new(SystemConfig {
        dim_x: 1,
        dim_y: 1,
        wide_width: 64,
        narrow_width: 8,
        router_queue_size: 4,
        ni_outstanding_reqs: 8,
    })
    .unwrap();
    // The scratchpad is not a fabric target here; register it directly.
    let spm = sys.mems.len();
    sys.mems.push(crate::mem::Memory::new(LOC_BASE, LOC_SIZE as usize, 0));
    sys.mem_grant_events.push(
        sys.engine
            .new_event(crate::system::EventTarget::MemGrant(spm)),
    );
    let ext = sys.mems.len();
    sys.mems
        .push(crate::mem::Memory::new(EXT_BASE, 0x2_0000, 2));
    sys.mem_grant_events.push(
        sys.engine
            .new_event(crate::system::EventTarget::MemGrant(ext)),
    );

    let dma = sys
        .add_dma(DmaConfig {
            loc_base: LOC_BASE,
            loc_size: LOC_SIZE,
            tcdm_width: 8,
            burst_queue_size: 4,
            transfer_queue_size: 2,
            axi_port: AxiPort::Mem(ext),
            tcdm_mem: spm,
            frontend,
        })
        .unwrap();
    (sys, dma, spm, ext)
}

fn program_1d(sys: &mut System, dma: usize, src: u64, dst: u64, len: u32) -> u32 {
    sys.dma_reg_write(dma, REG_SRC_ADDR_LOW, src as u32);
    sys.dma_reg_write(dma, REG_DST_ADDR_LOW, dst as u32);
    sys.dma_reg_write(dma, REG_LENGTH, len);
    sys.dma_reg_write(dma, REG_CONFIG, 0);
    let (status, id) = sys.dma_reg_read(dma, REG_NEXT_ID);
    assert_eq!(status, IoStatus::Ok);
    id
}

#[test]
fn register_file_round_trips_and_rejects_bad_accesses() {
    let (mut sys, dma, _, _) = engine_system(FrontendKind::Reg);

    for (reg, value) in [
        (REG_CONFIG, 0x12),
        (REG_SRC_ADDR_LOW, 0xAABB_CC00),
        (REG_DST_ADDR_LOW, 0x1122_3344),
        (REG_LENGTH, 0x400),
        (REG_SRC_STRIDE_2, 0x80),
        (REG_DST_STRIDE_2, 0x40),
        (REG_REPS_2, 7),
        (REG_SRC_STRIDE_3, 5),
        (REG_DST_STRIDE_3, 6),
        (REG_REPS_3, 8),
    ] {
        assert_eq!(sys.dma_reg_write(dma, reg, value), IoStatus::Ok);
        let (status, read) = sys.dma_reg_read(dma, reg);
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(read, value, "register {reg:#x}");
    }

    // Off-map offsets and read-only registers reject writes.
    assert_eq!(sys.dma_reg_write(dma, 0x30, 1), IoStatus::Invalid);
    assert_eq!(sys.dma_reg_write(dma, REG_DONE_ID, 1), IoStatus::Invalid);
    assert_eq!(sys.dma_reg_write(dma, REG_NEXT_ID, 1), IoStatus::Invalid);
    assert_eq!(sys.dma_reg_write(dma, REG_STATUS, 1), IoStatus::Invalid);
}

#[test]
fn transfer_copies_local_to_external() {
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(spm).fill_pattern(0x5A);
    let expect = sys.mem(spm).peek(0x100, 0x800).to_vec();

    let id = program_1d(&mut sys, dma, 0x100, EXT_BASE + 0x1000, 0x800);
    drain(&mut sys, 100_000);

    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id);
    assert_eq!(sys.mem(ext).peek(EXT_BASE + 0x1000, 0x800), &expect[..]);
}

#[test]
fn transfer_copies_external_to_local() {
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(ext).fill_pattern(0x77);
    let expect = sys.mem(ext).peek(EXT_BASE + 0x400, 0x1000).to_vec();

    let id = program_1d(&mut sys, dma, EXT_BASE + 0x400, 0x2000, 0x1000);
    drain(&mut sys, 100_000);

    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id);
    assert_eq!(sys.mem(spm).peek(0x2000, 0x1000), &expect[..]);
}

#[test]
fn page_crossing_transfer_still_copies_exactly() {
    // A source 128 bytes short of a page boundary splits into 128 + 128,
    // and the copy must be byte-exact regardless.
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(ext).fill_pattern(0x99);
    let src = EXT_BASE + 0xF80;
    let expect = sys.mem(ext).peek(src, 256).to_vec();

    let id = program_1d(&mut sys, dma, src, 0x3000, 256);
    drain(&mut sys, 100_000);

    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id);
    assert_eq!(sys.mem(spm).peek(0x3000, 256), &expect[..]);
}

#[test]
fn two_dimensional_transfer_places_every_line() {
    // Four 64-byte lines, source stride 128, destination stride 64.
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(spm).fill_pattern(0x21);
    let (_, done_before) = sys.dma_reg_read(dma, REG_DONE_ID);

    sys.dma_reg_write(dma, REG_SRC_ADDR_LOW, 0);
    sys.dma_reg_write(dma, REG_DST_ADDR_LOW, (EXT_BASE + 0x8000) as u32);
    sys.dma_reg_write(dma, REG_LENGTH, 64);
    sys.dma_reg_write(dma, REG_SRC_STRIDE_2, 128);
    sys.dma_reg_write(dma, REG_DST_STRIDE_2, 64);
    sys.dma_reg_write(dma, REG_REPS_2, 4);
    sys.dma_reg_write(dma, REG_CONFIG, 1 << 1);
    let (_, id) = sys.dma_reg_read(dma, REG_NEXT_ID);

    drain(&mut sys, 100_000);

    for rep in 0..4u64 {
        let src = rep * 128;
        let dst = EXT_BASE + 0x8000 + rep * 64;
        let expect = sys.mem(spm).peek(src, 64).to_vec();
        assert_eq!(sys.mem(ext).peek(dst, 64), &expect[..], "rep {rep}");
    }
    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, done_before + 1);
    assert_eq!(done, id);
}

#[test]
fn zero_length_and_zero_reps_complete_immediately() {
    let (mut sys, dma, _, _) = engine_system(FrontendKind::Reg);

    sys.dma_reg_write(dma, REG_LENGTH, 0);
    let (_, id0) = sys.dma_reg_read(dma, REG_NEXT_ID);
    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id0);

    // 2D with zero repetitions behaves the same.
    sys.dma_reg_write(dma, REG_LENGTH, 64);
    sys.dma_reg_write(dma, REG_REPS_2, 0);
    sys.dma_reg_write(dma, REG_CONFIG, 1 << 1);
    let (_, id1) = sys.dma_reg_read(dma, REG_NEXT_ID);
    assert_eq!(id1, id0 + 1);
    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id1);
    // No burst reached any channel.
    assert!(sys.dma(dma).be.is_idle());
}

#[test]
fn completion_raises_the_bound_irq() {
    let (mut sys, dma, spm, _) = engine_system(FrontendKind::Reg);
    let line = sys.new_irq_line();
    sys.bind_dma_irq(dma, line);
    sys.mem(spm).fill_pattern(1);

    assert!(!sys.irq_level(line));
    program_1d(&mut sys, dma, 0x0, EXT_BASE, 0x100);
    drain(&mut sys, 100_000);
    assert!(sys.irq_level(line));
}

#[test]
fn full_middle_end_stalls_and_grants_in_order() {
    let (mut sys, dma, spm, _) = engine_system(FrontendKind::Reg);
    sys.bind_dma_grant_sink(dma, GrantSink::Harness);
    sys.mem(spm).fill_pattern(3);

    // Queue depth is 2: the third immediate enqueue is refused and held.
    let mut last_id = 0;
    for i in 0..3u64 {
        sys.dma_reg_write(dma, REG_SRC_ADDR_LOW, 0);
        sys.dma_reg_write(dma, REG_DST_ADDR_LOW, (EXT_BASE + i as u64 * 0x1000) as u32);
        sys.dma_reg_write(dma, REG_LENGTH, 0x1000);
        sys.dma_reg_write(dma, REG_CONFIG, 0);
        let (_, id) = sys.dma_reg_read(dma, REG_NEXT_ID);
        last_id = id;
    }

    drain(&mut sys, 200_000);

    // The stalled transfer was granted with its id and then completed.
    assert_eq!(sys.harness.offload_grants.len(), 1);
    assert_eq!(sys.harness.offload_grants[0].1, last_id);
    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, last_id);
}

#[test]
fn writes_to_one_address_land_in_program_order() {
    // Two transfers writing the same destination issued back to back:
    // the back-end's FIFO ordering must make the second value stick.
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(spm).poke(0x0, &pattern(256, 0xAA));
    sys.mem(spm).poke(0x100, &pattern(256, 0xBB));

    program_1d(&mut sys, dma, 0x0, EXT_BASE + 0x2000, 256);
    program_1d(&mut sys, dma, 0x100, EXT_BASE + 0x2000, 256);
    drain(&mut sys, 200_000);

    assert_eq!(
        sys.mem(ext).peek(EXT_BASE + 0x2000, 256),
        &pattern(256, 0xBB)[..]
    );
}

#[test]
fn instruction_front_end_runs_copies_and_reports_status() {
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Insn);
    sys.mem(spm).fill_pattern(0x44);
    let expect = sys.mem(spm).peek(0x200, 0x300).to_vec();

    let mut dmsrc = OffloadInsn::xdma(insn::DMSRC_FUNCT7, 0x200, 0);
    sys.dma_offload(dma, &mut dmsrc);
    let mut dmdst = OffloadInsn::xdma(insn::DMDST_FUNCT7, (EXT_BASE + 0x100) as u32, 0);
    sys.dma_offload(dma, &mut dmdst);

    let mut dmcpyi = OffloadInsn::xdma(insn::DMCPYI_FUNCT7, 0x300, 0);
    sys.dma_offload(dma, &mut dmcpyi);
    assert!(dmcpyi.granted);
    let id = dmcpyi.result;

    // Busy until the copy drains.
    let mut busy = OffloadInsn::xdma(insn::DMSTATI_FUNCT7, 0, 2);
    sys.dma_offload(dma, &mut busy);
    assert_eq!(busy.result, 1);

    drain(&mut sys, 100_000);

    let mut done = OffloadInsn::xdma(insn::DMSTATI_FUNCT7, 0, 0);
    sys.dma_offload(dma, &mut done);
    assert_eq!(done.result, id);
    let mut busy = OffloadInsn::xdma(insn::DMSTATI_FUNCT7, 0, 2);
    sys.dma_offload(dma, &mut busy);
    assert_eq!(busy.result, 0);

    assert_eq!(sys.mem(ext).peek(EXT_BASE + 0x100, 0x300), &expect[..]);
}

#[test]
fn strided_copy_through_instruction_front_end() {
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Insn);
    sys.mem(spm).fill_pattern(0x10);

    let mut dmsrc = OffloadInsn::xdma(insn::DMSRC_FUNCT7, 0, 0);
    sys.dma_offload(dma, &mut dmsrc);
    let mut dmdst = OffloadInsn::xdma(insn::DMDST_FUNCT7, (EXT_BASE + 0x4000) as u32, 0);
    sys.dma_offload(dma, &mut dmdst);
    let mut dmstr = OffloadInsn::xdma(insn::DMSTR_FUNCT7, 256, 32);
    sys.dma_offload(dma, &mut dmstr);
    let mut dmrep = OffloadInsn::xdma(insn::DMREP_FUNCT7, 8, 0);
    sys.dma_offload(dma, &mut dmrep);
    let mut dmcpy = OffloadInsn::xdma(insn::DMCPY_FUNCT7, 32, 0b10);
    sys.dma_offload(dma, &mut dmcpy);

    drain(&mut sys, 100_000);

    for rep in 0..8u64 {
        let expect = sys.mem(spm).peek(rep * 256, 32).to_vec();
        assert_eq!(
            sys.mem(ext).peek(EXT_BASE + 0x4000 + rep * 32, 32),
            &expect[..],
            "rep {rep}"
        );
    }
}

#[test]
fn dma_reaches_remote_memory_through_the_mesh() {
    // Full integration: the engine's AXI port feeds the NI at (0,0) and
    // the destination memory sits across the mesh.
    let mut sys = System::new(SystemConfig {
        dim_x: 3,
        dim_y: 3,
        wide_width: 8,
        narrow_width: 8,
        router_queue_size: 4,
        ni_outstanding_reqs: 16,
    })
    .unwrap();
    let ext = sys.add_memory(2, 2, EXT_BASE, 0x1_0000, 1).unwrap();
    // Local scratchpad outside the fabric address map.
    let spm = sys.mems.len();
    sys.mems.push(crate::mem::Memory::new(LOC_BASE, LOC_SIZE as usize, 0));
    sys.mem_grant_events.push(
        sys.engine
            .new_event(crate::system::EventTarget::MemGrant(spm)),
    );

    let dma = sys
        .add_dma(DmaConfig {
            loc_base: LOC_BASE,
            loc_size: LOC_SIZE,
            tcdm_width: 8,
            burst_queue_size: 4,
            transfer_queue_size: 2,
            axi_port: AxiPort::Ni { x: 0, y: 0, wide: true },
            tcdm_mem: spm,
            frontend: FrontendKind::Reg,
        })
        .unwrap();

    sys.mem(spm).fill_pattern(0x66);
    let expect = sys.mem(spm).peek(0x0, 0x400).to_vec();
    let id = program_1d(&mut sys, dma, 0x0, EXT_BASE + 0x800, 0x400);

    drain(&mut sys, 200_000);

    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, id);
    assert_eq!(sys.mem(ext).peek(EXT_BASE + 0x800, 0x400), &expect[..]);
}

#[test]
fn mm_ctrl_drives_wrapped_engines_and_pulses_irq() {
    let mut sys = System::new(SystemConfig {
        dim_x: 1,
        dim_y: 1,
        wide_width: 64,
        narrow_width: 8,
        router_queue_size: 4,
        ni_outstanding_reqs: 8,
    })
    .unwrap();
    let spm = sys.mems.len();
    sys.mems.push(crate::mem::Memory::new(LOC_BASE, LOC_SIZE as usize, 0));
    sys.mem_grant_events.push(
        sys.engine
            .new_event(crate::system::EventTarget::MemGrant(spm)),
    );
    let ext = sys.mems.len();
    sys.mems.push(crate::mem::Memory::new(EXT_BASE, 0x1_0000, 1));
    sys.mem_grant_events.push(
        sys.engine
            .new_event(crate::system::EventTarget::MemGrant(ext)),
    );

    let mk = |sys: &mut System| {
        sys.add_dma(DmaConfig {
            loc_base: LOC_BASE,
            loc_size: LOC_SIZE,
            tcdm_width: 8,
            burst_queue_size: 4,
            transfer_queue_size: 2,
            axi_port: AxiPort::Mem(ext),
            tcdm_mem: spm,
            frontend: FrontendKind::Insn,
        })
        .unwrap()
    };
    let dma0 = mk(&mut sys);
    let dma1 = mk(&mut sys);
    let ctrl = sys.add_mm_ctrl(dma0, dma1).unwrap();
    let line = sys.new_irq_line();
    sys.bind_mm_ctrl_irq(ctrl, 1, line);

    sys.mem(spm).fill_pattern(0x0F);
    let expect = sys.mem(spm).peek(0x1000, 0x200).to_vec();

    // Program channel 1 (L1 -> L2) through the register window.
    use crate::idma::mm_ctrl::*;
    let ctrl_write = |sys: &mut System, offset: u64, value: u32| {
        let req = sys.reqs.alloc();
        {
            let r = &mut sys.reqs[req];
            r.addr = DIRECTION_OFFSET + offset;
            r.size = 4;
            r.is_write = true;
            r.data = value.to_le_bytes().to_vec();
        }
        let status = sys.with_mm_ctrl(ctrl, |c, sys| c.access(sys, req));
        assert_eq!(status, IoStatus::Ok);
        sys.reqs.release(req);
    };
    ctrl_write(&mut sys, CTRL_SRC_ADDR_LOW, 0x1000);
    ctrl_write(&mut sys, CTRL_DST_ADDR_LOW, (EXT_BASE + 0x3000) as u32);
    ctrl_write(&mut sys, CTRL_LENGTH, 0x200);
    ctrl_write(&mut sys, CTRL_REPS_2, 1);

    // Reading next_id fires the offload sequence and starts polling.
    let req = sys.reqs.alloc();
    {
        let r = &mut sys.reqs[req];
        r.addr = DIRECTION_OFFSET + CTRL_NEXT_ID;
        r.size = 4;
        r.is_write = false;
    }
    let status = sys.with_mm_ctrl(ctrl, |c, sys| c.access(sys, req));
    assert_eq!(status, IoStatus::Ok);
    sys.reqs.release(req);
    sys.drain_wires();

    drain(&mut sys, 200_000);

    assert_eq!(sys.mem(ext).peek(EXT_BASE + 0x3000, 0x200), &expect[..]);
    assert!(sys.mm_ctrl(ctrl).is_idle(1));
    // The done IRQ pulsed: raised on completion, lowered back in IDLE.
    let ups = sys
        .harness
        .irq_log
        .iter()
        .filter(|&&(_, l, lv)| l == line && lv)
        .count();
    let downs = sys
        .harness
        .irq_log
        .iter()
        .filter(|&&(_, l, lv)| l == line && !lv)
        .count();
    assert_eq!(ups, 1);
    assert_eq!(downs, 1);
    assert!(!sys.irq_level(line));
}

#[test]
fn reset_reseeds_the_engine_and_it_runs_again() {
    let (mut sys, dma, spm, ext) = engine_system(FrontendKind::Reg);
    sys.mem(spm).fill_pattern(0x5C);

    let first = program_1d(&mut sys, dma, 0x0, EXT_BASE + 0x100, 0x100);
    drain(&mut sys, 100_000);
    assert_eq!(first, 1);

    sys.reset();

    // Ids restart from the seed and a fresh transfer runs to completion.
    let expect = sys.mem(spm).peek(0x40, 0x100).to_vec();
    let id = program_1d(&mut sys, dma, 0x40, EXT_BASE + 0x700, 0x100);
    assert_eq!(id, 1);
    drain(&mut sys, 100_000);

    let (_, done) = sys.dma_reg_read(dma, REG_DONE_ID);
    assert_eq!(done, 1);
    assert_eq!(sys.mem(ext).peek(EXT_BASE + 0x700, 0x100), &expect[..]);
}
