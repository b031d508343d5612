//! The local-checkpoint coordinator.
//!
//! One fragment at a time moves through prepare, hold-ops, blocked,
//! start-checkpoint and running; at most one further order queues behind
//! it. Completion of a fragment is reported to every placement manager,
//! and the log tail advances once the checkpoint bounds replay.

use crate::fragment::{FragH, FragStatus};
use crate::node::Lqh;
use crate::ops::TransactionState;
use crate::signal::{
    AccLcpConf, AccLcpFragIdConf, AccLcpStarted, Block, BlockRef, ContinueB, EmptyLcpConf,
    EmptyLcpReq, EndLcpConf, EngineBlock, LcpCompleteRep, LcpFragOrd, LcpFragRep, LcpHoldOpConf,
    NodeId, Signal, TupLcpConf, TupLcpStarted, TupPrepLcpConf,
};

/// Hold requests batch at most this many op handles.
pub const HOLD_OP_BATCH: u32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LcpState {
    #[default]
    Idle,
    WaitFragId,
    WaitTupPrepLcp,
    WaitHoldOps,
    WaitActiveFinish,
    StartChkp,
    Running,
    Completed,
    BlockedComp,
}

#[derive(Default)]
pub struct LcpCoordinator {
    pub state: LcpState,
    pub lcp_id: u32,
    pub keep_gci: u32,
    pub current: Option<LcpFragOrd>,
    pub current_frag: Option<FragH>,
    pub queued: Option<LcpFragOrd>,
    pub last_fragment_seen: bool,
    pub acc_frag: u32,
    pub acc_started: bool,
    pub tup_started: bool,
    pub acc_conf: bool,
    pub tup_conf: bool,
    pub end_acc: bool,
    pub end_tup: bool,
    /// Nodes that asked to hear about the next fragment completion.
    pub empty_lcp_waiters: Vec<BlockRef>,
}

impl Lqh {
    fn dih_refs(&self) -> Vec<BlockRef> {
        let mut out = vec![BlockRef::new(self.own_node, Block::Dih)];
        for (&node, &status) in self.peers.iter() {
            if status == crate::node::PeerStatus::Alive && node != self.own_node {
                out.push(BlockRef::new(node, Block::Dih));
            }
        }
        out
    }

    pub(crate) fn handle_lcp_frag_ord(&mut self, ord: LcpFragOrd) {
        self.lcp.lcp_id = ord.lcp_id;
        self.lcp.keep_gci = ord.keep_gci;
        if ord.last_fragment {
            self.lcp.last_fragment_seen = true;
        }

        let frag_exists = self.frags.find(ord.table, ord.fragment).is_some();
        let dropping = match self.frags.table(ord.table) {
            Some(h) => !matches!(
                self.frags.tables.get(h).status,
                crate::fragment::TableStatus::TableDefined
            ),
            None => true,
        };
        if dropping || !frag_exists {
            // Orders against a dropping table are consumed and reported
            // at once.
            self.report_fragment_checkpoint(ord, 0, 0);
            self.maybe_end_lcp();
            return;
        }

        if self.lcp.state != LcpState::Idle {
            assert!(
                self.lcp.queued.is_none(),
                "more than one queued checkpoint order"
            );
            self.lcp.queued = Some(ord);
            return;
        }
        self.start_lcp_fragment(ord);
    }

    fn start_lcp_fragment(&mut self, ord: LcpFragOrd) {
        let frag_h = self
            .frags
            .find(ord.table, ord.fragment)
            .expect("checked by caller");
        self.frags.pool.get_mut(frag_h).lcp_flag = true;
        self.lcp.current = Some(ord);
        self.lcp.current_frag = Some(frag_h);
        self.lcp.acc_started = false;
        self.lcp.tup_started = false;
        self.lcp.acc_conf = false;
        self.lcp.tup_conf = false;
        self.lcp.state = LcpState::WaitFragId;
        tracing::debug!(table = ord.table, fragment = ord.fragment, "checkpoint order accepted");
        self.acc
            .lcp_frag_id(0, ord.table, ord.fragment, &mut self.inbox);
    }

    pub(crate) fn handle_acc_lcp_frag_id_conf(&mut self, conf: AccLcpFragIdConf) {
        if self.lcp.state != LcpState::WaitFragId {
            tracing::warn!("fragment-id CONF outside an LCP start; discarded");
            return;
        }
        self.lcp.acc_frag = conf.acc_frag;
        self.lcp.state = LcpState::WaitTupPrepLcp;
        let ord = self.lcp.current.expect("LCP without a current fragment");
        self.tup.prep_lcp(0, ord.table, ord.fragment, &mut self.inbox);
    }

    pub(crate) fn handle_tup_prep_lcp_conf(&mut self, _conf: TupPrepLcpConf) {
        if self.lcp.state != LcpState::WaitTupPrepLcp {
            tracing::warn!("row-store prep CONF outside an LCP start; discarded");
            return;
        }
        self.lcp.state = LcpState::WaitHoldOps;
        let ord = self.lcp.current.expect("LCP without a current fragment");
        self.acc
            .lcp_hold_ops(0, ord.table, ord.fragment, HOLD_OP_BATCH, &mut self.inbox);
    }

    /// Queued hash-index ops move from the active list into the blocked
    /// list until the checkpoint has started.
    pub(crate) fn handle_lcp_hold_op_conf(&mut self, conf: LcpHoldOpConf) {
        if self.lcp.state != LcpState::WaitHoldOps {
            tracing::warn!("hold-op CONF outside an LCP start; discarded");
            return;
        }
        let frag_h = self.lcp.current_frag.expect("LCP without a fragment");
        for raw in conf.held {
            let h = crate::ops::OpH(raw);
            if !self.ops.pool.is_busy(h) {
                continue;
            }
            if self.ops.pool.get(h).state == TransactionState::WaitAcc {
                self.frags.unlink_active(&mut self.ops, frag_h, h);
                self.frags.link_acc_blocked(&mut self.ops, frag_h, h);
            }
        }
        if conf.more {
            let ord = self.lcp.current.expect("LCP without a current fragment");
            self.acc
                .lcp_hold_ops(0, ord.table, ord.fragment, HOLD_OP_BATCH, &mut self.inbox);
            return;
        }
        // Hold complete: block the fragment; new prepares park on the
        // wait queue from here.
        self.frags.pool.get_mut(frag_h).status = FragStatus::Blocked;
        if self.frags.pool.get(frag_h).active_count == 0 {
            self.send_start_lcp();
        } else {
            self.lcp.state = LcpState::WaitActiveFinish;
        }
    }

    /// Hook from the active-list unlink: the last in-engine op left a
    /// blocked fragment.
    pub(crate) fn lcp_fragment_drained(&mut self, frag_h: FragH) {
        if self.lcp.state == LcpState::WaitActiveFinish && self.lcp.current_frag == Some(frag_h) {
            self.send_start_lcp();
        }
    }

    fn send_start_lcp(&mut self) {
        self.lcp.state = LcpState::StartChkp;
        let acc_frag = self.lcp.acc_frag;
        let frag_h = self.lcp.current_frag.expect("LCP without a fragment");
        let tup_frag = self.frags.pool.get(frag_h).tup_frag;
        self.acc.lcp_start(0, acc_frag, &mut self.inbox);
        self.tup.lcp_start(0, tup_frag, &mut self.inbox);
    }

    pub(crate) fn handle_acc_lcp_started(&mut self, _s: AccLcpStarted) {
        self.lcp.acc_started = true;
        self.maybe_resume_operations();
    }

    pub(crate) fn handle_tup_lcp_started(&mut self, _s: TupLcpStarted) {
        self.lcp.tup_started = true;
        self.maybe_resume_operations();
    }

    /// Both engines hold a consistent view: writers may flow again while
    /// the checkpoint data drains to disk.
    fn maybe_resume_operations(&mut self) {
        if self.lcp.state != LcpState::StartChkp || !(self.lcp.acc_started && self.lcp.tup_started)
        {
            return;
        }
        self.lcp.state = LcpState::Running;
        let frag_h = self.lcp.current_frag.expect("LCP without a fragment");

        // Capture the consistent GCI bounds at the instant the fragment
        // reopens.
        {
            let newest = self.frags.pool.get(frag_h).newest_gci;
            let completed = self.newest_completed_gci;
            let frag = self.frags.pool.get_mut(frag_h);
            frag.max_gci_in_lcp = newest;
            frag.max_gci_completed_in_lcp = completed;
            frag.status = FragStatus::Active;
        }

        // Resume the held ops, then drain the wait queue in rate-limited
        // batches.
        let held = self.frags.drain_acc_blocked(&mut self.ops, frag_h);
        for h in held {
            let acc_ptr = self.ops.pool.get(h).acc_ptr;
            self.frags.link_active(&mut self.ops, frag_h, h);
            self.acc.cont_op(acc_ptr, &mut self.inbox);
        }
        self.continue_b(ContinueB::RestartQueuedOps {
            fragment: frag_h.0,
        });
    }

    pub(crate) fn handle_acc_lcp_conf(&mut self, _conf: AccLcpConf) {
        self.lcp.acc_conf = true;
        self.maybe_fragment_complete();
    }

    pub(crate) fn handle_tup_lcp_conf(&mut self, _conf: TupLcpConf) {
        self.lcp.tup_conf = true;
        self.maybe_fragment_complete();
    }

    fn maybe_fragment_complete(&mut self) {
        if self.lcp.state != LcpState::Running || !(self.lcp.acc_conf && self.lcp.tup_conf) {
            return;
        }
        let ord = self.lcp.current.take().expect("LCP without a fragment");
        let frag_h = self.lcp.current_frag.take().expect("LCP without a fragment");
        let (max_gci, max_completed) = {
            let frag = self.frags.pool.get_mut(frag_h);
            frag.lcp_flag = false;
            let slot = frag.next_lcp as usize % frag.lcp_ids.len();
            frag.lcp_ids[slot] = ord.lcp_id;
            frag.next_lcp = (frag.next_lcp + 1) % frag.lcp_ids.len() as u32;
            (frag.max_gci_in_lcp, frag.max_gci_completed_in_lcp)
        };
        self.report_fragment_checkpoint(ord, max_gci, max_completed);

        // The checkpoint bounds replay; megabytes older than keep_gci are
        // log history now.
        let keep_gci = self.lcp.keep_gci;
        self.redo.set_log_tail(keep_gci);
        for part in 0..crate::log::LOG_PARTS as u32 {
            self.pump_log_queue(part);
        }

        self.lcp.state = LcpState::Idle;
        self.maybe_end_lcp();
        if let Some(next) = self.lcp.queued.take() {
            if self.frags.find(next.table, next.fragment).is_some() {
                self.start_lcp_fragment(next);
            } else {
                self.report_fragment_checkpoint(next, 0, 0);
                self.maybe_end_lcp();
            }
        }
    }

    fn report_fragment_checkpoint(&mut self, ord: LcpFragOrd, max_gci: u32, max_completed: u32) {
        let node = self.own_node;
        let rep = LcpFragRep {
            node,
            table: ord.table,
            fragment: ord.fragment,
            lcp_id: ord.lcp_id,
            max_gci_in_lcp: max_gci,
            max_gci_completed_in_lcp: max_completed,
        };
        for dih in self.dih_refs() {
            self.send(dih, Signal::LcpFragRep(rep));
        }
        let waiters = std::mem::take(&mut self.lcp.empty_lcp_waiters);
        for waiter in waiters {
            self.send(
                waiter,
                Signal::EmptyLcpConf(EmptyLcpConf {
                    node,
                    idle: false,
                    table: ord.table,
                    fragment: ord.fragment,
                    lcp_id: ord.lcp_id,
                }),
            );
        }
    }

    fn maybe_end_lcp(&mut self) {
        if !self.lcp.last_fragment_seen
            || self.lcp.state != LcpState::Idle
            || self.lcp.queued.is_some()
        {
            return;
        }
        self.lcp.last_fragment_seen = false;
        self.lcp.end_acc = false;
        self.lcp.end_tup = false;
        self.lcp.state = LcpState::Completed;
        self.acc.end_lcp(&mut self.inbox);
        self.tup.end_lcp(&mut self.inbox);
    }

    pub(crate) fn handle_end_lcp_conf(&mut self, conf: EndLcpConf) {
        match conf.block {
            EngineBlock::Acc => self.lcp.end_acc = true,
            EngineBlock::Tup => self.lcp.end_tup = true,
        }
        if !(self.lcp.end_acc && self.lcp.end_tup) {
            return;
        }
        self.lcp.state = LcpState::Idle;
        let rep = LcpCompleteRep {
            node: self.own_node,
            lcp_id: self.lcp.lcp_id,
        };
        tracing::info!(lcp_id = rep.lcp_id, "local checkpoint complete");
        for dih in self.dih_refs() {
            self.send(dih, Signal::LcpCompleteRep(rep));
        }
    }

    pub(crate) fn handle_empty_lcp_req(&mut self, req: EmptyLcpReq) {
        if self.lcp.state == LcpState::Idle && self.lcp.queued.is_none() {
            let node = self.own_node;
            self.send(
                req.sender_ref,
                Signal::EmptyLcpConf(EmptyLcpConf {
                    node,
                    idle: true,
                    table: 0,
                    fragment: 0,
                    lcp_id: self.lcp.lcp_id,
                }),
            );
            return;
        }
        self.lcp.empty_lcp_waiters.push(req.sender_ref);
    }

    /// A dropping table cannot checkpoint; a queued order against it is
    /// answered as done.
    pub(crate) fn lcp_note_table_dropped(&mut self, table: u32) {
        if let Some(queued) = self.lcp.queued {
            if queued.table == table {
                self.lcp.queued = None;
                self.report_fragment_checkpoint(queued, 0, 0);
                self.maybe_end_lcp();
            }
        }
        if let Some(current) = self.lcp.current {
            if current.table == table {
                tracing::warn!(table, "table dropped while its checkpoint is in flight");
            }
        }
    }

    /// Drop bookkeeping for a peer that fell over mid-request.
    pub(crate) fn lcp_forget_node(&mut self, node: NodeId) {
        self.lcp.empty_lcp_waiters.retain(|r| r.node != node);
    }
}
