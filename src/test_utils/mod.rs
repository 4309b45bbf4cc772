//! Shared test utilities for building small meshes and payloads.
//!
//! These helpers de-duplicate fabric construction across the NoC, iDMA
//! and system-level test suites. They intentionally support just what the
//! tests need: square meshes, corner memories, deterministic payloads.

#![allow(dead_code)]

use crate::system::{System, SystemConfig};

/// Mesh with both channels at `width` bytes and the given NI budget.
pub fn mesh(dim_x: i32, dim_y: i32, width: u64, budget: usize) -> System {
    System::new(SystemConfig {
        dim_x,
        dim_y,
        wide_width: width,
        narrow_width: width,
        router_queue_size: 4,
        ni_outstanding_reqs: budget,
    })
    .expect("valid test mesh")
}

/// Deterministic position-dependent payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i & 0xFF) as u8) ^ ((i >> 8) as u8))
        .collect()
}

/// Run until the event queue drains, panicking if `max` cycles pass
/// first (hang guard for tests).
pub fn drain(sys: &mut System, max: u64) {
    assert!(
        sys.run_to_idle(max),
        "simulation still busy after {max} cycles"
    );
}

/// The single recorded response for `tag`, by copy.
pub fn response_cycle(sys: &System, tag: u64) -> u64 {
    let mut found = None;
    for r in &sys.harness.responses {
        if r.tag == tag {
            assert!(found.is_none(), "burst {tag} answered more than once");
            found = Some(r.cycle);
        }
    }
    found.unwrap_or_else(|| panic!("burst {tag} never answered"))
}
