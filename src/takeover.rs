//! Coordinator-failure takeover.
//!
//! A new coordinator asks for every transaction the failed one owned
//! here. The walk over the op pool is rate-limited, pauses while an op
//! is driven through the abort machine, reports each commit-ack marker
//! the failed node left behind, and ends with a terminator record. A
//! second takeover arriving mid-walk restarts it transparently.

use crate::node::{Lqh, PeerStatus};
use crate::ops::{AbortState, ConnectState, OpH, TransactionState};
use crate::signal::{
    Block, BlockRef, ContinueB, NfCompleteRep, NodeFailRep, NodeId, Signal, TakeoverConf,
    TakeoverOpStatus, TakeoverReq,
};

const TAKEOVER_BATCH: u32 = 16;

#[derive(Debug, Clone, Copy)]
pub struct TakeoverRun {
    pub new_tc_ref: BlockRef,
    pub failed_node: NodeId,
    pub next_op: u32,
    /// Op currently being aborted on the takeover's behalf; the walk
    /// resumes when it reports.
    pub waiting_op: Option<OpH>,
}

#[derive(Default)]
pub struct Takeover {
    pub active: Option<TakeoverRun>,
}

impl Lqh {
    pub(crate) fn handle_node_fail_rep(&mut self, rep: NodeFailRep) {
        for node in rep.failed {
            tracing::info!(?node, "peer node reported down");
            self.peers.insert(node, PeerStatus::Dead);
            self.close_scans_for_node(node);
            self.lcp_forget_node(node);
            let own = self.own_node;
            self.send_to_block(
                own,
                Block::Dih,
                Signal::NfCompleteRep(NfCompleteRep {
                    node: own,
                    failed_node: node,
                }),
            );
        }
    }

    pub(crate) fn handle_takeover_req(&mut self, req: TakeoverReq) {
        if let Some(run) = &self.takeover.active {
            tracing::info!(
                previous = ?run.new_tc_ref,
                "takeover interrupted by a newer coordinator; restarting the walk"
            );
        }
        self.takeover.active = Some(TakeoverRun {
            new_tc_ref: req.new_tc_ref,
            failed_node: req.failed_node,
            next_op: 0,
            waiting_op: None,
        });
        self.continue_b(ContinueB::TakeoverScan { next_op: 0 });
    }

    /// ContinueB: walks a bounded slice of the op pool.
    pub(crate) fn takeover_scan_continue(&mut self, from: u32) {
        let Some(run) = self.takeover.active else {
            return;
        };
        if run.waiting_op.is_some() {
            // An abort is still reporting; it resumes the walk.
            return;
        }
        if from != run.next_op {
            // A stale continuation from before a restart of the walk.
            return;
        }
        let capacity = self.ops.pool.capacity() as u32;
        let mut idx = from;
        let mut budget = TAKEOVER_BATCH;
        while idx < capacity && budget > 0 {
            let h = OpH(idx);
            idx += 1;
            budget -= 1;
            if !self.ops.pool.is_busy(h) {
                continue;
            }
            let (owned, state, connect) = {
                let op = self.ops.pool.get(h);
                (
                    op.tc_ref.map(|r| r.node) == Some(run.failed_node),
                    op.state,
                    op.connect_state,
                )
            };
            if !owned || connect != ConnectState::Connected {
                continue;
            }
            {
                let op = self.ops.pool.get_mut(h);
                op.tc_node_failed = Some(run.failed_node);
                op.tc_ref = Some(run.new_tc_ref);
            }
            match state {
                TransactionState::Prepared | TransactionState::PreparedReceivedCommit => {
                    self.takeover_report(h, TakeoverOpStatus::Prepared);
                }
                TransactionState::Committed
                | TransactionState::LogCommitWritten
                | TransactionState::LogCommitQueued => {
                    self.takeover_report(h, TakeoverOpStatus::Committed);
                }
                _ => {
                    // Mid-prepare: drive it through the abort machine and
                    // resume the walk when it reports.
                    if let Some(run) = &mut self.takeover.active {
                        run.waiting_op = Some(h);
                        run.next_op = idx;
                    }
                    self.start_abort(h, AbortState::NewFromTc);
                    return;
                }
            }
        }
        if let Some(run) = &mut self.takeover.active {
            run.next_op = idx;
        }
        if idx < capacity {
            self.continue_b(ContinueB::TakeoverScan { next_op: idx });
            return;
        }
        self.takeover_report_markers();
    }

    fn takeover_report(&mut self, h: OpH, status: TakeoverOpStatus) {
        let Some(run) = self.takeover.active else {
            return;
        };
        let conf = {
            let op = self.ops.pool.get(h);
            TakeoverConf {
                status,
                transid: op.transid,
                tc_op: op.tc_op,
                lqh_op: h.0,
                gci: op.gci,
                api_ref: op.client_ref,
                api_op: op.client_op,
            }
        };
        self.send(run.new_tc_ref, Signal::TakeoverConf(conf));
    }

    /// Abort machine callback for ops aborted on a takeover's behalf.
    pub(crate) fn takeover_op_finished(&mut self, h: OpH, status: TakeoverOpStatus) {
        let Some(run) = self.takeover.active else {
            return;
        };
        self.takeover_report(h, status);
        if run.waiting_op == Some(h) {
            let next = run.next_op;
            if let Some(run) = &mut self.takeover.active {
                run.waiting_op = None;
            }
            self.continue_b(ContinueB::TakeoverScan { next_op: next });
        }
    }

    /// Ops done; now every marker the failed coordinator owned, in
    /// insertion order, then the terminator.
    fn takeover_report_markers(&mut self) {
        let Some(run) = self.takeover.active.take() else {
            return;
        };
        let markers = self.ops.markers_for_node(run.failed_node);
        for marker in markers {
            self.send(
                run.new_tc_ref,
                Signal::TakeoverConf(TakeoverConf {
                    status: TakeoverOpStatus::Marker,
                    transid: marker.transid,
                    tc_op: 0,
                    lqh_op: 0,
                    gci: 0,
                    api_ref: marker.api_ref,
                    api_op: marker.api_op,
                }),
            );
        }
        let node = self.own_node;
        self.send(
            run.new_tc_ref,
            Signal::TakeoverConf(TakeoverConf {
                status: TakeoverOpStatus::LastTransConf,
                transid: [0; 2],
                tc_op: 0,
                lqh_op: node.0,
                gci: 0,
                api_ref: None,
                api_op: 0,
            }),
        );
        tracing::info!(failed = ?run.failed_node, "coordinator takeover walk complete");
    }
}
