//! The node core: one struct owning every pool and coordinator, and the
//! run-to-completion dispatch loop.
//!
//! A handler is invoked per signal, may seize records, update state and
//! queue outbound signals, then returns. Nothing suspends mid-handler;
//! long work re-schedules itself with a ContinueB.

use std::cmp::Reverse;

use hashbrown::HashMap;
use priority_queue::PriorityQueue;

use crate::config::Config;
use crate::engines::{HashIndex, OrderedIndex, RowStore};
use crate::fragment::Fragments;
use crate::gcp::GcpCoordinator;
use crate::io::Io;
use crate::lcp::LcpCoordinator;
use crate::log::{LogEvent, RedoLog};
use crate::ops::Ops;
use crate::packed::PackedBuffers;
use crate::restart::Restart;
use crate::scan::Scans;
use crate::signal::{
    Block, BlockRef, ContinueB, Inbox, NodeId, Outbox, Signal, StartType,
};
use crate::takeover::Takeover;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Started,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    Unknown,
    Alive,
    Dead,
}

/// Deferred self-signals keyed on a millisecond deadline.
#[derive(Default)]
pub struct DelayQueue {
    queue: PriorityQueue<u64, Reverse<u64>>,
    payloads: HashMap<u64, Signal>,
    next_id: u64,
}

impl DelayQueue {
    pub fn push(&mut self, deadline_ms: u64, signal: Signal) {
        self.next_id += 1;
        let id = self.next_id;
        self.queue.push(id, Reverse(deadline_ms));
        self.payloads.insert(id, signal);
    }

    pub fn pop_due(&mut self, now_ms: u64) -> Option<Signal> {
        let deadline = self.queue.peek().map(|(_, r)| r.0)?;
        if deadline > now_ms {
            return None;
        }
        let (id, _) = self.queue.pop().unwrap();
        self.payloads.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct Lqh {
    pub cfg: Config,
    pub own_node: NodeId,
    pub state: NodeState,
    pub start_type: StartType,
    pub now_ms: u64,
    pub inbox: Inbox,
    pub outbox: Outbox,
    pub delayed: DelayQueue,
    pub ops: Ops,
    pub frags: Fragments,
    pub redo: RedoLog,
    pub scans: Scans,
    pub lcp: LcpCoordinator,
    pub gcp: GcpCoordinator,
    pub sr: Restart,
    pub takeover: Takeover,
    pub packed: PackedBuffers,
    pub peers: HashMap<NodeId, PeerStatus>,
    pub acc: Box<dyn HashIndex>,
    pub tup: Box<dyn RowStore>,
    pub tux: Box<dyn OrderedIndex>,
    pub io: Box<dyn Io>,
    /// Newest GCI seen in any commit on this node.
    pub newest_gci: u32,
    /// Newest globally completed GCI this node has durably recorded.
    pub newest_completed_gci: u32,
    /// Engine contexts seized at start, one pair per op record slot.
    pub acc_ctx: Vec<u32>,
    pub tup_ctx: Vec<u32>,
}

impl Lqh {
    pub fn new(
        cfg: Config,
        own_node: NodeId,
        acc: Box<dyn HashIndex>,
        tup: Box<dyn RowStore>,
        tux: Box<dyn OrderedIndex>,
        io: Box<dyn Io>,
    ) -> Self {
        let ops = Ops::new(
            cfg.op_records,
            cfg.key_buffers,
            cfg.attr_buffers,
            cfg.marker_records,
        );
        let redo = RedoLog::new(&cfg);
        let frags = Fragments::new(&cfg);
        let scans = Scans::new(&cfg);
        Self {
            own_node,
            state: NodeState::Starting,
            start_type: StartType::Initial,
            now_ms: 0,
            inbox: Inbox::default(),
            outbox: Outbox::default(),
            delayed: DelayQueue::default(),
            ops,
            frags,
            redo,
            scans,
            lcp: LcpCoordinator::default(),
            gcp: GcpCoordinator::default(),
            sr: Restart::default(),
            takeover: Takeover::default(),
            packed: PackedBuffers::default(),
            peers: HashMap::new(),
            acc,
            tup,
            tux,
            io,
            newest_gci: 0,
            newest_completed_gci: 0,
            acc_ctx: Vec::new(),
            tup_ctx: Vec::new(),
            cfg,
        }
    }

    /// Feeds one external signal through the node and drains everything it
    /// triggers internally.
    pub fn deliver(&mut self, signal: Signal) {
        self.dispatch(signal);
        self.pump();
    }

    /// Drains the self-inbox: engine replies, file completions, immediate
    /// continuations. Coalesced control signals are flushed at the end of
    /// the round.
    pub fn pump(&mut self) {
        while let Some(signal) = self.inbox.pop() {
            self.dispatch(signal);
        }
        self.send_packed_all();
    }

    /// Moves time forward, releasing due deferred signals and firing the
    /// one-second supervision tick.
    pub fn advance_time(&mut self, delta_ms: u64) {
        let before_sec = self.now_ms / 1000;
        self.now_ms += delta_ms;
        while let Some(signal) = self.delayed.pop_due(self.now_ms) {
            self.inbox.push(signal);
        }
        if self.now_ms / 1000 > before_sec {
            self.inbox.push(Signal::TimeSignal);
        }
        self.pump();
    }

    pub fn send(&mut self, to: BlockRef, signal: Signal) {
        self.outbox.send(to, signal);
    }

    pub fn send_to_block(&mut self, node: NodeId, block: Block, signal: Signal) {
        self.outbox.send(BlockRef::new(node, block), signal);
    }

    pub fn continue_b(&mut self, c: ContinueB) {
        self.inbox.push(Signal::ContinueB(c));
    }

    pub fn continue_b_delayed(&mut self, delay_ms: u64, c: ContinueB) {
        let deadline = self.now_ms + delay_ms;
        self.delayed.push(deadline, Signal::ContinueB(c));
    }

    pub fn peer_alive(&self, node: NodeId) -> bool {
        matches!(
            self.peers.get(&node).copied().unwrap_or_default(),
            PeerStatus::Alive | PeerStatus::Unknown
        )
    }

    pub fn dispatch(&mut self, signal: Signal) {
        match signal {
            Signal::KeyReq(req) => self.handle_key_req(req),
            Signal::KeyInfo(info) => self.handle_key_info(info),
            Signal::AttrInfo(info) => self.handle_attr_info(info),
            Signal::KeyConf(conf) => self.handle_copy_key_conf(conf),
            Signal::KeyRef(r) => self.handle_copy_key_ref(r),
            Signal::Packed(words) => self.handle_packed(words),
            Signal::Commit(ord) => self.handle_commit(ord),
            Signal::Complete(ord) => self.handle_complete(ord),
            Signal::Abort(abort) => self.handle_abort(abort),
            Signal::Aborted(_) => {
                tracing::warn!("unexpected ABORTED at a data node; discarded");
            }
            Signal::CommitReq(req) => self.handle_commit_req(req),
            Signal::CompleteReq(req) => self.handle_complete_req(req),
            Signal::AbortReq(req) => self.handle_abort_req(req),
            Signal::CommitConf(_) | Signal::CompleteConf(_) | Signal::AbortConf(_) => {
                tracing::warn!("slow-path CONF delivered to a data node; discarded");
            }
            Signal::RemoveMarker(ord) => self.handle_remove_marker(ord),
            Signal::TakeoverReq(req) => self.handle_takeover_req(req),
            Signal::TakeoverConf(_) => {
                tracing::warn!("unexpected takeover CONF at a data node; discarded");
            }
            Signal::GcpSaveReq(req) => self.handle_gcp_save_req(req),
            Signal::LcpFragOrd(ord) => self.handle_lcp_frag_ord(ord),
            Signal::EmptyLcpReq(req) => self.handle_empty_lcp_req(req),
            Signal::StartRecReq(req) => self.handle_start_rec_req(req),
            Signal::StartFragReq(req) => self.handle_start_frag_req(req),
            Signal::ExecFragReq(req) => self.handle_exec_frag_req(req),
            Signal::ExecFragConf(conf) => self.handle_exec_frag_conf(conf),
            Signal::ExecSrReq(req) => self.handle_exec_sr_req(req),
            Signal::ExecSrConf(conf) => self.handle_exec_sr_conf(conf),
            Signal::AddFragReq(req) => self.handle_add_frag_req(req),
            Signal::AddAttrReq(req) => self.handle_add_attr_req(req),
            Signal::PrepDropTabReq(req) => self.handle_prep_drop_tab_req(req),
            Signal::WaitDropTabReq(req) => self.handle_wait_drop_tab_req(req),
            Signal::DropTabReq(req) => self.handle_drop_tab_req(req),
            Signal::NodeFailRep(rep) => self.handle_node_fail_rep(rep),
            Signal::ScanFragReq(req) => self.handle_scan_frag_req(req),
            Signal::ScanNextReq(req) => self.handle_scan_next_req(req),
            Signal::CopyFragReq(req) => self.handle_copy_frag_req(req),
            Signal::CopyActiveReq(req) => self.handle_copy_active_req(req),
            Signal::StartPhaseReq(req) => self.handle_start_phase_req(req),
            Signal::ContinueB(c) => self.handle_continue_b(c),
            Signal::TimeSignal => self.handle_time_signal(),

            Signal::FsOpenConf(conf) => {
                let event = {
                    let io = self.io.as_mut();
                    self.redo
                        .open_confirmed(conf.user, conf.os_file, io, &mut self.inbox)
                };
                self.handle_log_event(event);
            }
            Signal::FsOpenRef(r) => {
                panic!("log file open failed (user {}, error {})", r.user, r.error);
            }
            Signal::FsReadConf(conf) => {
                let event = {
                    let io = self.io.as_mut();
                    self.redo.read_confirmed(conf.lfo, io, &mut self.inbox)
                };
                self.handle_log_event(event);
            }
            Signal::FsReadRef(r) => {
                panic!("log file read failed (lfo {}, error {})", r.lfo, r.error);
            }
            Signal::FsWriteConf(conf) => {
                let event = {
                    let io = self.io.as_mut();
                    self.redo.write_confirmed(conf.lfo, io, &mut self.inbox)
                };
                self.handle_log_event(event);
            }
            Signal::FsWriteRef(r) => {
                panic!("log file write failed (lfo {}, error {})", r.lfo, r.error);
            }
            Signal::FsSyncConf(conf) => self.gcp_sync_confirmed(conf.user),
            Signal::FsCloseConf(conf) => self.redo.close_confirmed(conf.user),

            Signal::AccKeyConf(conf) => self.handle_acc_key_conf(conf),
            Signal::AccKeyRef(r) => self.handle_acc_key_ref(r),
            Signal::AccAbortConf(conf) => self.handle_acc_abort_conf(conf),
            Signal::AccScanConf(conf) => self.handle_acc_scan_conf(conf),
            Signal::NextScanConf(conf) => self.handle_next_scan_conf(conf),
            Signal::TupKeyConf(conf) => self.handle_tup_key_conf(conf),
            Signal::TupKeyRef(r) => self.handle_tup_key_ref(r),
            Signal::AccLcpFragIdConf(conf) => self.handle_acc_lcp_frag_id_conf(conf),
            Signal::LcpHoldOpConf(conf) => self.handle_lcp_hold_op_conf(conf),
            Signal::TupPrepLcpConf(conf) => self.handle_tup_prep_lcp_conf(conf),
            Signal::AccLcpStarted(s) => self.handle_acc_lcp_started(s),
            Signal::TupLcpStarted(s) => self.handle_tup_lcp_started(s),
            Signal::AccLcpConf(conf) => self.handle_acc_lcp_conf(conf),
            Signal::TupLcpConf(conf) => self.handle_tup_lcp_conf(conf),
            Signal::EndLcpConf(conf) => self.handle_end_lcp_conf(conf),

            // Replies this node only ever sends.
            Signal::GcpSaveConf(_)
            | Signal::GcpSaveRef(_)
            | Signal::LcpFragRep(_)
            | Signal::LcpCompleteRep(_)
            | Signal::EmptyLcpConf(_)
            | Signal::StartRecConf(_)
            | Signal::StartFragConf(_)
            | Signal::AddFragConf(_)
            | Signal::AddFragRef(_)
            | Signal::AddAttrConf(_)
            | Signal::PrepDropTabConf { .. }
            | Signal::WaitDropTabConf { .. }
            | Signal::DropTabConf { .. }
            | Signal::NfCompleteRep(_)
            | Signal::ScanFragConf(_)
            | Signal::ScanFragRef(_)
            | Signal::ScanHbRep(_)
            | Signal::CopyFragConf(_)
            | Signal::CopyActiveConf(_)
            | Signal::StartPhaseConf(_) => {
                tracing::warn!("reply signal delivered to a data node; discarded");
            }
        }
    }

    fn handle_continue_b(&mut self, c: ContinueB) {
        match c {
            ContinueB::LogNextOp { part } => self.log_next_op(part),
            ContinueB::RestartQueuedOps { fragment } => self.restart_queued_ops(fragment),
            ContinueB::ExecLogLoop { part } => self.drive_exec(part),
            ContinueB::InvalidateLogLoop { part } => self.drive_exec(part),
            ContinueB::TakeoverScan { next_op } => self.takeover_scan_continue(next_op),
            ContinueB::WaitDropTab { table } => self.wait_drop_tab_check(table),
        }
    }

    /// One-second supervision duties.
    fn handle_time_signal(&mut self) {
        {
            let io = self.io.as_mut();
            self.redo.flush_unwritten(io, &mut self.inbox);
        }
        self.gcp_tick();
        self.sweep_idle_transactions();
        self.scan_heartbeats();
    }

    pub(crate) fn handle_log_event(&mut self, event: LogEvent) {
        match event {
            LogEvent::None => {}
            LogEvent::FlushConfirmed { part } => {
                // Returned pages can unblock commits queued on the part.
                self.pump_log_queue(part);
                self.gcp_tick();
            }
            LogEvent::FileChangeComplete { part } => self.pump_log_queue(part),
            LogEvent::InitComplete => self.log_init_complete(),
            LogEvent::FilesOpen { part } => {
                let event = {
                    let io = self.io.as_mut();
                    self.redo.start_head_find(part, io, &mut self.inbox)
                };
                self.handle_log_event(event);
            }
            LogEvent::HeadLocated { part } => self.head_located(part),
            LogEvent::ExecReady { part } => self.drive_exec(part),
            LogEvent::PartInvalidated { part } => self.part_invalidated(part),
        }
    }

    /// Removes transactions idle beyond the supervision threshold. The
    /// coordinator is assumed dead or confused; local state is aborted.
    fn sweep_idle_transactions(&mut self) {
        const IDLE_LIMIT_MS: u64 = 120_000;
        let now = self.now_ms;
        let stale: Vec<crate::ops::OpH> = self
            .ops
            .pool
            .iter_busy()
            .filter(|(_, op)| {
                op.last_touch_ms + IDLE_LIMIT_MS <= now
                    && matches!(
                        op.state,
                        crate::ops::TransactionState::Prepared
                            | crate::ops::TransactionState::Stopped
                    )
            })
            .map(|(h, _)| h)
            .collect();
        for h in stale {
            tracing::warn!(op = ?h, "aborting transaction idle for over 120s");
            self.start_abort(h, crate::ops::AbortState::FromLqh);
        }
    }
}
