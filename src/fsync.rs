/*!
Fractal synchronizer: a tree of nodes serving four compass-direction
slave ports and two master axes (nord-sud, east-west).

Wire encoding
- A request carries a one-hot `aggr` bitmask naming the levels taking
  part in the barrier; the top set bit is the level where it terminates.
  The encoding is kept on the wire exactly as the hardware defines it.
- `id_req` selects one of up to `MAX_IDS` independent barrier channels.

Node behavior, per arriving slave request:
- aggr bit set at this node's level and the top set bit *is* this level:
  the request terminates here. The node counts arrivals per axis (NS for
  nord/sud ports, EW for east/west); when both opposite ports of an axis
  presented the same id, a wake response is broadcast back to both.
- aggr bit set here but the barrier terminates higher: same counting,
  but completion forwards an upward request on the orthogonal axis.
- aggr bit not set here and the top bit is higher: direct forward to the
  next level on the same axis, remembering the entry port for the
  response fan-back.
- anything else is a malformed aggregate and answers `error`.

Responses coming back from a master axis wake whichever of the matching
slave ports have a recorded pending request for that id.
*/

use std::collections::VecDeque;

use log::{trace, warn};

use crate::engine::{Engine, EventId};
use crate::system::{EventTarget, System, WireMsg};

pub const MAX_IDS: usize = 128;

/// Sentinel marking an aggregate slot as empty.
const EMPTY: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPort {
    Nord = 0,
    Sud = 1,
    East = 2,
    West = 3,
}

impl FsyncPort {
    pub const ALL: [FsyncPort; 4] = [
        FsyncPort::Nord,
        FsyncPort::Sud,
        FsyncPort::East,
        FsyncPort::West,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Axis the port aggregates on.
    fn axis(self) -> Axis {
        match self {
            FsyncPort::Nord | FsyncPort::Sud => Axis::NordSud,
            FsyncPort::East | FsyncPort::West => Axis::EastWest,
        }
    }
}

/// Master-port axes. A completed NS aggregation continues upward on the
/// EW axis and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    EastWest = 0,
    NordSud = 1,
}

impl Axis {
    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Synchronization request (slave input / master output).
#[derive(Debug, Clone, Copy)]
pub struct FsyncMsg {
    pub sync: bool,
    pub aggr: u32,
    pub id_req: u32,
}

/// Synchronization response (slave output / master input).
#[derive(Debug, Clone, Copy)]
pub struct FsyncResp {
    pub wake: bool,
    pub lvl: u32,
    pub id_rsp: u32,
    pub error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Idle,
    SlaveReq(FsyncPort),
    NordSudUp,
    NordSudEnd,
    EastWestUp,
    EastWestEnd,
}

pub struct FsyncNode {
    /// This node's level in one-hot coding.
    level: u32,
    state: NodeState,
    sync_val_ns: [u8; MAX_IDS],
    sync_val_ew: [u8; MAX_IDS],
    /// Recorded aggregate per port and barrier id (EMPTY when clear).
    aggr: [[u32; MAX_IDS]; 4],
    /// Last id presented on each port.
    cur_id: [u32; 4],
    /// Staged upward request per axis (aggr, id).
    up_ns: (u32, u32),
    up_ew: (u32, u32),
    fsm: EventId,
}

impl FsyncNode {
    fn new(level_exp: u32, fsm: EventId) -> Self {
        Self {
            level: 1 << level_exp,
            state: NodeState::Idle,
            sync_val_ns: [0; MAX_IDS],
            sync_val_ew: [0; MAX_IDS],
            aggr: [[EMPTY; MAX_IDS]; 4],
            cur_id: [EMPTY; 4],
            up_ns: (EMPTY, EMPTY),
            up_ew: (EMPTY, EMPTY),
            fsm,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Back to power-on state.
    pub fn reset(&mut self) {
        self.state = NodeState::Idle;
        self.sync_val_ns = [0; MAX_IDS];
        self.sync_val_ew = [0; MAX_IDS];
        self.aggr = [[EMPTY; MAX_IDS]; 4];
        self.cur_id = [EMPTY; 4];
        self.up_ns = (EMPTY, EMPTY);
        self.up_ew = (EMPTY, EMPTY);
    }

    #[inline]
    fn level_exp(&self) -> u32 {
        self.level.trailing_zeros()
    }

    /// A request entered one of the four slave ports.
    fn slave_input(
        &mut self,
        node: usize,
        port: FsyncPort,
        msg: FsyncMsg,
        engine: &mut Engine<EventTarget>,
        out: &mut VecDeque<WireMsg>,
    ) {
        if !msg.sync || msg.id_req as usize >= MAX_IDS {
            trace!("fsync {}: malformed request ({:?}, no sync)", node, port);
            out.push_back(WireMsg::FsyncDown {
                node,
                port,
                resp: FsyncResp {
                    wake: false,
                    lvl: 0,
                    id_rsp: 0,
                    error: true,
                },
            });
            return;
        }

        // -1 for an all-zero aggregate, which lands in the error branch.
        let msb_pos = 31i32 - msg.aggr.leading_zeros() as i32;

        if msg.aggr & self.level != 0 {
            // This node takes part: stage the request for the FSM.
            self.aggr[port.index()][msg.id_req as usize] = msg.aggr;
            self.cur_id[port.index()] = msg.id_req;
            self.state = NodeState::SlaveReq(port);
            engine.enqueue(self.fsm);
        } else if msb_pos > self.level_exp() as i32 {
            // Passes through: remember the entry port for the fan-back
            // and forward toward the next level on the master port that
            // serves this slave pair.
            trace!(
                "fsync {}: forwarding id {} (aggr {:#x}) from {:?}",
                node, msg.id_req, msg.aggr, port
            );
            self.aggr[port.index()][msg.id_req as usize] = msg.aggr;
            let axis = match port.axis() {
                Axis::EastWest => Axis::NordSud,
                Axis::NordSud => Axis::EastWest,
            };
            out.push_back(WireMsg::FsyncUp { node, axis, msg });
        } else {
            trace!(
                "fsync {}: aggregate error ({:?}, aggr {:#x})",
                node, port, msg.aggr
            );
            out.push_back(WireMsg::FsyncDown {
                node,
                port,
                resp: FsyncResp {
                    wake: false,
                    lvl: 0,
                    id_rsp: 0,
                    error: true,
                },
            });
        }
    }

    /// A response came back from the level above on `axis`.
    fn master_input(
        &mut self,
        node: usize,
        axis: Axis,
        resp: FsyncResp,
        out: &mut VecDeque<WireMsg>,
    ) {
        let id = resp.id_rsp as usize;
        let down = FsyncResp {
            wake: true,
            lvl: self.level,
            id_rsp: resp.id_rsp,
            error: false,
        };
        // The EW axis serves the nord/sud pair, the NS axis the east/west
        // pair (responses retrace the orthogonal forwarding).
        let (a, b) = match axis {
            Axis::EastWest => (FsyncPort::Nord, FsyncPort::Sud),
            Axis::NordSud => (FsyncPort::East, FsyncPort::West),
        };
        for port in [a, b] {
            if self.aggr[port.index()][id] != EMPTY {
                out.push_back(WireMsg::FsyncDown {
                    node,
                    port,
                    resp: down,
                });
                self.aggr[port.index()][id] = EMPTY;
            }
        }
    }

    fn fsm(&mut self, node: usize, engine: &mut Engine<EventTarget>, out: &mut VecDeque<WireMsg>) {
        match self.state {
            NodeState::Idle => {}
            NodeState::SlaveReq(port) => {
                let id = self.cur_id[port.index()] as usize;
                let aggr = self.aggr[port.index()][id];
                let msb_pos = 31 - aggr.leading_zeros();
                trace!(
                    "fsync {}: processing id {} (aggr {:#x}) from {:?}",
                    node, id, aggr, port
                );

                let axis = port.axis();
                let level_exp = self.level_exp();
                let sync_val = match axis {
                    Axis::NordSud => &mut self.sync_val_ns[id],
                    Axis::EastWest => &mut self.sync_val_ew[id],
                };

                if msb_pos == level_exp {
                    // The barrier terminates at this node.
                    *sync_val += 1;
                    self.state = if *sync_val == 2 {
                        match axis {
                            Axis::NordSud => NodeState::NordSudEnd,
                            Axis::EastWest => NodeState::EastWestEnd,
                        }
                    } else {
                        NodeState::Idle
                    };
                } else {
                    // Participates here but continues upward.
                    *sync_val += 1;
                    if *sync_val == 2 {
                        match axis {
                            Axis::NordSud => {
                                self.up_ns = (aggr, id as u32);
                                self.state = NodeState::NordSudUp;
                            }
                            Axis::EastWest => {
                                self.up_ew = (aggr, id as u32);
                                self.state = NodeState::EastWestUp;
                            }
                        }
                    } else {
                        self.state = NodeState::Idle;
                    }
                }
                engine.enqueue(self.fsm);
            }
            NodeState::NordSudUp => {
                let (aggr, id) = self.up_ns;
                trace!("fsync {}: NS aggregation done, forwarding up (id {})", node, id);
                out.push_back(WireMsg::FsyncUp {
                    node,
                    axis: Axis::EastWest,
                    msg: FsyncMsg {
                        sync: true,
                        aggr,
                        id_req: id,
                    },
                });
                self.sync_val_ns[id as usize] = 0;
                self.state = NodeState::Idle;
                engine.enqueue(self.fsm);
            }
            NodeState::EastWestUp => {
                let (aggr, id) = self.up_ew;
                trace!("fsync {}: EW aggregation done, forwarding up (id {})", node, id);
                out.push_back(WireMsg::FsyncUp {
                    node,
                    axis: Axis::NordSud,
                    msg: FsyncMsg {
                        sync: true,
                        aggr,
                        id_req: id,
                    },
                });
                self.sync_val_ew[id as usize] = 0;
                self.state = NodeState::Idle;
                engine.enqueue(self.fsm);
            }
            NodeState::NordSudEnd => {
                let id = self.end_id(Axis::NordSud);
                trace!("fsync {}: NS barrier complete (id {})", node, id);
                self.sync_val_ns[id as usize] = 0;
                for port in [FsyncPort::Nord, FsyncPort::Sud] {
                    let aggr = self.aggr[port.index()][id as usize];
                    out.push_back(WireMsg::FsyncDown {
                        node,
                        port,
                        resp: FsyncResp {
                            wake: true,
                            lvl: aggr,
                            id_rsp: id,
                            error: false,
                        },
                    });
                    self.aggr[port.index()][id as usize] = EMPTY;
                }
                self.state = NodeState::Idle;
                engine.enqueue(self.fsm);
            }
            NodeState::EastWestEnd => {
                let id = self.end_id(Axis::EastWest);
                trace!("fsync {}: EW barrier complete (id {})", node, id);
                self.sync_val_ew[id as usize] = 0;
                for port in [FsyncPort::West, FsyncPort::East] {
                    let aggr = self.aggr[port.index()][id as usize];
                    out.push_back(WireMsg::FsyncDown {
                        node,
                        port,
                        resp: FsyncResp {
                            wake: true,
                            lvl: aggr,
                            id_rsp: id,
                            error: false,
                        },
                    });
                    self.aggr[port.index()][id as usize] = EMPTY;
                }
                self.state = NodeState::Idle;
                engine.enqueue(self.fsm);
            }
        }
    }

    /// Barrier id whose counter completed on `axis`.
    fn end_id(&self, axis: Axis) -> u32 {
        let (vals, ports) = match axis {
            Axis::NordSud => (&self.sync_val_ns, [FsyncPort::Nord, FsyncPort::Sud]),
            Axis::EastWest => (&self.sync_val_ew, [FsyncPort::East, FsyncPort::West]),
        };
        for port in ports {
            let id = self.cur_id[port.index()];
            if id != EMPTY && vals[id as usize] == 2 {
                return id;
            }
        }
        panic!("synchronizer completion with no completed barrier id");
    }
}

/// The synchronizer tree: nodes plus the port wiring between levels.
#[derive(Default)]
pub struct Fsync {
    pub(crate) nodes: Vec<FsyncNode>,
    /// Per node and axis: the parent node and the slave port entered.
    parents: Vec<[Option<(usize, FsyncPort)>; 2]>,
    /// Per node and slave port: the child node and its master axis.
    children: Vec<[Option<(usize, Axis)>; 4]>,
}

impl System {
    /// Add a synchronizer node at `level_exp` (level is one-hot encoded).
    pub fn add_fsync_node(&mut self, level_exp: u32) -> usize {
        let idx = self.fsync.nodes.len();
        let ev = self.engine.new_event(EventTarget::Fsync(idx));
        self.fsync.nodes.push(FsyncNode::new(level_exp, ev));
        self.fsync.parents.push([None, None]);
        self.fsync.children.push([None; 4]);
        idx
    }

    /// Wire `child`'s master `axis` port into `parent`'s slave `port`.
    pub fn connect_fsync(&mut self, parent: usize, port: FsyncPort, child: usize, axis: Axis) {
        self.fsync.parents[child][axis.index()] = Some((parent, port));
        self.fsync.children[parent][port.index()] = Some((child, axis));
    }

    /// Inject a leaf request into a node's slave port (harness side).
    pub fn fsync_leaf_req(&mut self, node: usize, port: FsyncPort, aggr: u32, id_req: u32) {
        let msg = FsyncMsg {
            sync: true,
            aggr,
            id_req,
        };
        {
            let Self {
                fsync,
                engine,
                wires,
                ..
            } = self;
            fsync.nodes[node].slave_input(node, port, msg, engine, wires);
        }
        self.drain_wires();
    }

    pub(crate) fn fsync_fsm(&mut self, node: usize) {
        let Self {
            fsync,
            engine,
            wires,
            ..
        } = self;
        fsync.nodes[node].fsm(node, engine, wires);
    }

    /// Deliver an upward request leaving `node` on `axis`.
    pub(crate) fn fsync_deliver_up(&mut self, node: usize, axis: Axis, msg: FsyncMsg) {
        match self.fsync.parents[node][axis.index()] {
            Some((parent, port)) => {
                let Self {
                    fsync,
                    engine,
                    wires,
                    ..
                } = self;
                fsync.nodes[parent].slave_input(parent, port, msg, engine, wires);
            }
            None => warn!(
                "fsync {}: upward request on unbound {:?} axis (aggr {:#x})",
                node, axis, msg.aggr
            ),
        }
    }

    /// Deliver a response leaving `node`'s slave `port` downward.
    pub(crate) fn fsync_deliver_down(&mut self, node: usize, port: FsyncPort, resp: FsyncResp) {
        match self.fsync.children[node][port.index()] {
            Some((child, axis)) => {
                let Self { fsync, wires, .. } = self;
                fsync.nodes[child].master_input(child, axis, resp, wires);
            }
            None => {
                let now = self.engine.now();
                self.harness.fsync_resps.push((now, node, port, resp));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mesh;

    fn leaf_wakes(sys: &crate::system::System) -> Vec<(usize, FsyncPort)> {
        sys.harness
            .fsync_resps
            .iter()
            .filter(|(_, _, _, r)| r.wake && !r.error)
            .map(|&(_, node, port, _)| (node, port))
            .collect()
    }

    #[test]
    fn single_node_barrier_wakes_all_four_ports() {
        // Four leaf requests with aggr = 0b11 and one id arrive
        // at the four cardinal ports of a level-1 node. NS and EW
        // aggregate locally and both axes broadcast wake responses.
        let mut sys = mesh(1, 1, 8, 4);
        let n = sys.add_fsync_node(1);

        for port in FsyncPort::ALL {
            sys.fsync_leaf_req(n, port, 0b11, 7);
            sys.run_cycles(8);
        }
        sys.run_cycles(32);

        let wakes = leaf_wakes(&sys);
        assert_eq!(wakes.len(), 4);
        for port in FsyncPort::ALL {
            assert!(wakes.contains(&(n, port)), "missing wake on {port:?}");
        }
        for (_, _, _, resp) in &sys.harness.fsync_resps {
            assert!(resp.wake);
            assert!(!resp.error);
            assert_eq!(resp.id_rsp, 7);
        }
    }

    #[test]
    fn barrier_ids_are_independent() {
        let mut sys = mesh(1, 1, 8, 4);
        let n = sys.add_fsync_node(1);

        // Two half-finished barriers on different ids: no wake yet.
        sys.fsync_leaf_req(n, FsyncPort::Nord, 0b10, 1);
        sys.run_cycles(8);
        sys.fsync_leaf_req(n, FsyncPort::Nord, 0b10, 2);
        sys.run_cycles(8);
        assert!(leaf_wakes(&sys).is_empty());

        // Completing id 2 wakes only id 2.
        sys.fsync_leaf_req(n, FsyncPort::Sud, 0b10, 2);
        sys.run_cycles(16);
        let wakes = leaf_wakes(&sys);
        assert_eq!(wakes.len(), 2);
        for (_, _, _, resp) in &sys.harness.fsync_resps {
            assert_eq!(resp.id_rsp, 2);
        }
    }

    #[test]
    fn two_level_tree_aggregates_upward() {
        // Leaves sync through two level-0 nodes whose EW masters feed the
        // nord/sud ports of a level-1 root.
        let mut sys = mesh(1, 1, 8, 4);
        let a = sys.add_fsync_node(0);
        let b = sys.add_fsync_node(0);
        let root = sys.add_fsync_node(1);
        sys.connect_fsync(root, FsyncPort::Nord, a, Axis::EastWest);
        sys.connect_fsync(root, FsyncPort::Sud, b, Axis::EastWest);

        // aggr 0b11: participate at level 0, terminate at level 1.
        sys.fsync_leaf_req(a, FsyncPort::Nord, 0b11, 3);
        sys.run_cycles(8);
        sys.fsync_leaf_req(a, FsyncPort::Sud, 0b11, 3);
        sys.run_cycles(8);
        // Only one child done: nobody wakes.
        assert!(leaf_wakes(&sys).is_empty());

        sys.fsync_leaf_req(b, FsyncPort::Nord, 0b11, 3);
        sys.run_cycles(8);
        sys.fsync_leaf_req(b, FsyncPort::Sud, 0b11, 3);
        sys.run_cycles(32);

        // The root completed and the fan-back reached all four leaves.
        let wakes = leaf_wakes(&sys);
        assert_eq!(wakes.len(), 4);
        for node in [a, b] {
            for port in [FsyncPort::Nord, FsyncPort::Sud] {
                assert!(wakes.contains(&(node, port)), "missing {node}/{port:?}");
            }
        }
    }

    #[test]
    fn malformed_aggregate_answers_error() {
        let mut sys = mesh(1, 1, 8, 4);
        let n = sys.add_fsync_node(2);

        // Level bit clear and top bit below this level: error.
        sys.fsync_leaf_req(n, FsyncPort::East, 0b01, 0);
        sys.run_cycles(8);

        let (_, node, port, resp) = sys.harness.fsync_resps[0];
        assert_eq!((node, port), (n, FsyncPort::East));
        assert!(resp.error);
        assert!(!resp.wake);
    }

    #[test]
    fn pass_through_node_forwards_and_fans_back() {
        // A level-0 node not named by the aggregate forwards straight up
        // and later fans the response back to its entry ports.
        let mut sys = mesh(1, 1, 8, 4);
        let child = sys.add_fsync_node(0);
        let root = sys.add_fsync_node(1);
        sys.connect_fsync(root, FsyncPort::Nord, child, Axis::NordSud);

        // aggr 0b10: level 0 does not participate, so the child's
        // east/west requests forward straight to the root, which counts
        // both and terminates the barrier.
        sys.fsync_leaf_req(child, FsyncPort::East, 0b10, 5);
        sys.run_cycles(8);
        assert!(leaf_wakes(&sys).is_empty());

        sys.fsync_leaf_req(child, FsyncPort::West, 0b10, 5);
        sys.run_cycles(32);

        // The root's nord response retraces through the child, waking
        // both of its recorded entry ports.
        let wakes = leaf_wakes(&sys);
        assert!(wakes.contains(&(child, FsyncPort::East)));
        assert!(wakes.contains(&(child, FsyncPort::West)));
    }
}
