/*!
2D middle-end: decomposes strided descriptors into 1D transfers.

A parent with the 2D config bit set expands into `reps` children of
`parent.size` bytes, stepping source and destination by the respective
strides. 1D parents are normalized to a single repetition. Children carry
a parent backlink and are counted in `nb_bursts`; the parent is
acknowledged to the front-end once every child came back and the last one
was emitted.
*/

use std::collections::VecDeque;

use log::trace;

use crate::system::System;

use super::{DmaEngine, TransferConfig, TransferId};

pub struct MiddleEnd {
    queue_size: usize,
    queue: VecDeque<TransferId>,
    /// Parent currently being expanded.
    current: Option<TransferId>,
    cur_src: u64,
    cur_dst: u64,
    cur_reps: u64,
}

impl MiddleEnd {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size,
            queue: VecDeque::new(),
            current: None,
            cur_src: 0,
            cur_dst: 0,
            cur_reps: 0,
        }
    }

    pub fn can_accept_transfer(&self) -> bool {
        self.queue.len() < self.queue_size
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.current.is_none()
    }

    /// Back to power-on state. Descriptor storage is reclaimed by the
    /// owning engine, which wipes the arena after every stage cleared.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.current = None;
    }
}

impl DmaEngine {
    /// Front-end pushes a parent descriptor.
    pub(crate) fn me_enqueue_transfer(&mut self, sys: &mut System, t: TransferId) {
        trace!("dma {}: me queueing transfer {:?}", self.id, t);
        {
            let tr = &mut self.transfers[t];
            tr.nb_bursts = 0;
            tr.bursts_sent = false;
        }
        self.me.queue.push_back(t);
        sys.engine.enqueue(self.ev.me);
    }

    /// Emit one child per cycle while the back-end accepts.
    pub(crate) fn me_fsm(&mut self, sys: &mut System) {
        if self.me.current.is_none() {
            if let Some(&head) = self.me.queue.front() {
                let t = &self.transfers[head];
                self.me.current = Some(head);
                self.me.cur_src = t.src;
                self.me.cur_dst = t.dst;
                // 1D parents become a single line.
                self.me.cur_reps = if t.config.contains(TransferConfig::ENABLE_2D) {
                    t.reps
                } else {
                    1
                };
                debug_assert!(self.me.cur_reps > 0, "zero-rep parent reached the middle-end");
            }
        }

        let Some(parent) = self.me.current else {
            return;
        };
        if !self.be.can_accept_transfer() {
            return;
        }

        let child = self.transfers.alloc();
        {
            let size = self.transfers[parent].size;
            let c = &mut self.transfers[child];
            c.parent = Some(parent);
            c.src = self.me.cur_src;
            c.dst = self.me.cur_dst;
            c.size = size;
        }
        self.transfers[parent].nb_bursts += 1;
        self.me.cur_reps -= 1;

        if self.me.cur_reps == 0 {
            // Last line: the parent is fully emitted.
            self.transfers[parent].bursts_sent = true;
            self.me.current = None;
            self.me.queue.pop_front();
            // The front-end may hold a stalled descriptor for this slot.
            self.fe_update(sys);
        } else {
            let (ss, ds) = {
                let p = &self.transfers[parent];
                (p.src_stride, p.dst_stride)
            };
            self.me.cur_src += ss;
            self.me.cur_dst += ds;
        }

        self.be_enqueue_transfer(sys, child);
        sys.engine.enqueue(self.ev.me);
    }

    /// Back-end finished a child: account it on the parent.
    pub(crate) fn me_ack_transfer(&mut self, sys: &mut System, child: TransferId) {
        let parent = self.transfers[child]
            .parent
            .expect("middle-end child without parent");
        let parent_done = {
            let p = &mut self.transfers[parent];
            debug_assert!(p.nb_bursts > 0);
            p.nb_bursts -= 1;
            p.bursts_sent && p.nb_bursts == 0
        };
        self.transfers.release(child);

        if parent_done {
            trace!("dma {}: me transfer {:?} complete", self.id, parent);
            self.stats.transfers_completed += 1;
            self.fe_ack_transfer(sys, parent);
        }
    }
}
