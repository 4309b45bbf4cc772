#![doc = r#"
nocsim library crate.

Cycle-approximate simulator for a 2D mesh network-on-chip and the family of
iDMA engines that inject traffic into it. The crate exposes the simulation
core for use by binaries and tests.

Modules:
- engine: clocked event queue driving the single-threaded simulation
- req: I/O request objects, statuses and the request arena
- queue: FIFO primitive with one-cycle visibility latency
- signal: registers and signals with per-cell reset policies
- memmap: global memory map resolving addresses to mesh coordinates
- mem: functional byte memories used as fabric targets
- noc: routers and network interfaces of the mesh fabric
- idma: DMA pipeline (front-ends, middle-end, back-end, bus protocols)
- timer: programmable dual-counter timer block
- fsync: fractal synchronization tree
- system: facade owning every component plus the event dispatch loop

In tests, shared mesh/memory builders are available under `crate::test_utils`.
"#]

// Core simulation modules
pub mod engine;
pub mod fsync;
pub mod idma;
pub mod mem;
pub mod memmap;
pub mod noc;
pub mod queue;
pub mod req;
pub mod signal;
pub mod system;
pub mod timer;

// Re-export commonly used types at the crate root for convenience.
pub use engine::{Cycle, Engine, EventId};
pub use req::{IoRequest, IoStatus, ReqId};
pub use system::{System, SystemConfig};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
