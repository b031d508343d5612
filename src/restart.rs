//! Restart orchestration: start phases, fragment restore intake, the
//! four-pass log execution with barriers, and the epilogue that installs
//! the new head and invalidates the stale tail of the log.

use crate::fragment::{FragStatus, TableStatus};
use crate::log::files::LogPartState;
use crate::log::replay::{CommitRec, ExecOutcome, PreparedRecord};
use crate::log::{LogEvent, LOG_PARTS};
use crate::node::{Lqh, NodeState, PeerStatus};
use crate::signal::{
    Block, BlockRef, ExecFragConf, ExecFragReq, ExecSrConf, ExecSrReq, KeyReq, KeyReqFlags,
    LockMode, NodeId, OpKind, Signal, StartFragConf, StartFragReq, StartPhaseConf, StartPhaseReq,
    StartRecConf, StartRecReq, StartType,
};

pub const REPLAY_PHASES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartState {
    #[default]
    Idle,
    /// Restart phase 3: locating per-part heads.
    WaitHeads,
    Executing,
    Barrier,
    Invalidating,
    Done,
}

#[derive(Default)]
pub struct Restart {
    pub state: RestartState,
    /// Outstanding start-phase reply.
    pub phase_requester: Option<BlockRef>,
    pub pending_phase: Option<u32>,
    pub keep_gci: u32,
    pub last_completed_gci: u32,
    pub newest_gci: u32,
    pub start_rec_requester: Option<BlockRef>,
    pub start_rec_received: bool,
    pub heads_located: [bool; LOG_PARTS],
    pub phase: u32,
    pub parts_done: [bool; LOG_PARTS],
    pub parts_invalidated: [bool; LOG_PARTS],
    pub pending_commit: [Option<CommitRec>; LOG_PARTS],
    pub exec_sr_confs: usize,
    /// Synthetic transaction ids for replayed operations.
    pub replay_seq: u32,
}

impl Lqh {
    pub(crate) fn handle_start_phase_req(&mut self, req: StartPhaseReq) {
        let node = self.own_node;
        let conf = Signal::StartPhaseConf(StartPhaseConf {
            node,
            phase: req.phase,
        });
        match req.phase {
            1 => {
                self.start_type = req.start_type;
                self.send(req.sender_ref, conf);
            }
            2 => {
                // One engine context pair per op record.
                let count = self.cfg.op_records as usize;
                self.acc_ctx.clear();
                self.tup_ctx.clear();
                for _ in 0..count {
                    let a = self.acc.seize();
                    let t = self.tup.seize();
                    self.acc_ctx.push(a);
                    self.tup_ctx.push(t);
                }
                self.send(req.sender_ref, conf);
            }
            3 => {
                self.sr.phase_requester = Some(req.sender_ref);
                self.sr.pending_phase = Some(3);
                if self.start_type == StartType::Initial {
                    let io = self.io.as_mut();
                    self.redo.create_log(io, &mut self.inbox);
                } else {
                    self.sr.state = RestartState::WaitHeads;
                    let io = self.io.as_mut();
                    self.redo.open_log(io, &mut self.inbox);
                }
            }
            4 => {
                if self.start_type == StartType::Initial {
                    self.state = NodeState::Started;
                }
                self.send(req.sender_ref, conf);
            }
            other => {
                tracing::warn!(phase = other, "unknown start phase; confirmed blind");
                self.send(req.sender_ref, conf);
            }
        }
    }

    fn phase_conf_if_pending(&mut self) {
        if let (Some(requester), Some(phase)) =
            (self.sr.phase_requester.take(), self.sr.pending_phase.take())
        {
            let node = self.own_node;
            self.send(
                requester,
                Signal::StartPhaseConf(StartPhaseConf { node, phase }),
            );
        }
    }

    /// Initial start: the log exists and is described; phase 3 is done.
    pub(crate) fn log_init_complete(&mut self) {
        tracing::info!("redo log created and described");
        self.phase_conf_if_pending();
    }

    pub(crate) fn head_located(&mut self, part: u32) {
        self.sr.heads_located[part as usize] = true;
        if self.sr.heads_located.iter().all(|&b| b) {
            tracing::info!("all log part heads located");
            self.phase_conf_if_pending();
            self.maybe_begin_execution();
        }
    }

    /// A fragment to restore, with its replay range and per-phase log
    /// owners.
    pub(crate) fn handle_start_frag_req(&mut self, req: StartFragReq) {
        // Tables and fragments may not exist yet on a restarting node.
        let tab_h = match self.frags.table(req.table) {
            Some(h) => h,
            None => {
                let h = self
                    .frags
                    .tables
                    .seize()
                    .expect("table pool exhausted during restart");
                let table = self.frags.tables.get_mut(h);
                table.table_id = req.table;
                table.status = TableStatus::TableDefined;
                self.frags.table_map.insert(req.table, h);
                h
            }
        };
        let frag_h = match self.frags.find(req.table, req.fragment) {
            Some(h) => h,
            None => {
                let h = self
                    .frags
                    .pool
                    .seize()
                    .expect("fragment pool exhausted during restart");
                let acc_frag = self
                    .acc
                    .add_fragment(req.table, req.fragment)
                    .expect("hash index rejected a restored fragment");
                let tup_frag = self
                    .tup
                    .add_fragment(req.table, req.fragment)
                    .expect("row store rejected a restored fragment");
                {
                    let frag = self.frags.pool.get_mut(h);
                    frag.table = req.table;
                    frag.fragment = req.fragment;
                    frag.logged = true;
                    frag.acc_frag = acc_frag;
                    frag.tup_frag = tup_frag;
                }
                self.frags.frag_map.insert((req.table, req.fragment), h);
                self.frags.tables.get_mut(tab_h).fragments.push(h);
                h
            }
        };
        {
            let frag = self.frags.pool.get_mut(frag_h);
            frag.status = FragStatus::CrashRecovering;
            frag.start_gci = req.start_gci;
            frag.last_gci = req.last_gci;
            frag.log_nodes = req.log_nodes.clone();
        }
        // Reload the newest checkpoint image before the log replays on
        // top of it.
        self.acc.start_recovery(req.table, req.fragment, req.lcp_id);
        self.tup.start_recovery(req.table, req.fragment, req.lcp_id);
        self.send_to_block(
            self.own_node,
            Block::Dih,
            Signal::StartFragConf(StartFragConf {
                table: req.table,
                fragment: req.fragment,
            }),
        );
    }

    pub(crate) fn handle_start_rec_req(&mut self, req: StartRecReq) {
        self.sr.keep_gci = req.keep_gci;
        self.sr.last_completed_gci = req.last_completed_gci;
        self.sr.newest_gci = req.newest_gci;
        self.sr.start_rec_requester = Some(req.sender_ref);
        self.sr.start_rec_received = true;
        self.newest_completed_gci = req.last_completed_gci;
        self.newest_gci = req.newest_gci;
        tracing::info!(
            keep_gci = req.keep_gci,
            last_completed = req.last_completed_gci,
            newest = req.newest_gci,
            "recovery bounds received"
        );
        self.maybe_begin_execution();
    }

    fn maybe_begin_execution(&mut self) {
        if !self.sr.start_rec_received || !self.sr.heads_located.iter().all(|&b| b) {
            return;
        }
        if self.sr.state == RestartState::Executing || self.sr.state == RestartState::Barrier {
            return;
        }
        if self.redo.diskless {
            // Nothing on disk to execute; go straight to the epilogue.
            self.sr.state = RestartState::Invalidating;
            self.sr.parts_invalidated = [false; LOG_PARTS];
            for part in 0..LOG_PARTS as u32 {
                let event = {
                    let io = self.io.as_mut();
                    self.redo.start_invalidation(part, io, &mut self.inbox)
                };
                if !matches!(event, LogEvent::None) {
                    self.handle_log_event(event);
                }
            }
            return;
        }
        // Replay range across all fragments to restore.
        let log_start_gci = self
            .frags
            .pool
            .iter_busy()
            .filter(|(_, f)| f.status == FragStatus::CrashRecovering)
            .map(|(_, f)| f.start_gci)
            .min()
            .unwrap_or(self.sr.keep_gci);
        let log_last_gci = self.sr.newest_gci;
        for part in 0..LOG_PARTS as u32 {
            let part_usize = part as usize;
            self.redo.parts[part_usize].newest_completed_gci = self.sr.last_completed_gci;
            self.redo.parts[part_usize].newest_gci = self.sr.newest_gci;
            self.redo.set_exec_bounds(part, log_start_gci, log_last_gci);
        }
        self.sr.phase = 0;
        self.start_exec_pass_all();
    }

    fn start_exec_pass_all(&mut self) {
        self.sr.state = RestartState::Executing;
        self.sr.parts_done = [false; LOG_PARTS];
        tracing::info!(phase = self.sr.phase, "log execution pass starting");
        for part in 0..LOG_PARTS as u32 {
            self.redo.parts[part as usize].state = LogPartState::SrExecuting;
            let io = self.io.as_mut();
            self.redo.start_exec_pass(part, io, &mut self.inbox);
        }
    }

    /// Drives one part's replay loop until it stalls on io, finds a
    /// commit, or finishes its range.
    pub(crate) fn drive_exec(&mut self, part: u32) {
        if self.sr.state != RestartState::Executing {
            return;
        }
        if self.sr.parts_done[part as usize] {
            return;
        }
        // A prepare fetched asynchronously finishes the pending commit
        // first.
        if let Some(prep) = self.redo.take_fetched_prepare(part) {
            let rec = self.sr.pending_commit[part as usize]
                .take()
                .expect("fetched prepare without a pending commit");
            self.apply_replayed(part, rec, prep);
            return;
        }
        loop {
            let outcome = {
                let io = self.io.as_mut();
                self.redo.exec_continue(part, io, &mut self.inbox)
            };
            match outcome {
                ExecOutcome::Waiting => return,
                ExecOutcome::PartDone => {
                    self.sr.parts_done[part as usize] = true;
                    self.redo.parts[part as usize].state = LogPartState::Idle;
                    if self.sr.parts_done.iter().all(|&b| b) {
                        self.exec_pass_barrier();
                    }
                    return;
                }
                ExecOutcome::CommitFound(rec) => {
                    if !self.fragment_needs_commit(&rec) {
                        continue;
                    }
                    let fetched = {
                        let io = self.io.as_mut();
                        self.redo.fetch_prepare(part, &rec, io, &mut self.inbox)
                    };
                    match fetched {
                        Some(prep) => {
                            self.apply_replayed(part, rec, prep);
                            return;
                        }
                        None => {
                            self.sr.pending_commit[part as usize] = Some(rec);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Does any local fragment want this commit in the current pass?
    fn fragment_needs_commit(&self, rec: &CommitRec) -> bool {
        let Some(frag_h) = self.frags.find(rec.table, rec.fragment) else {
            return false;
        };
        let frag = self.frags.pool.get(frag_h);
        if frag.status != FragStatus::CrashRecovering {
            return false;
        }
        if rec.gci < frag.start_gci || rec.gci > frag.last_gci {
            return false;
        }
        let own = self.own_node;
        match frag.log_nodes.get(self.sr.phase as usize) {
            Some(&node) => node == own,
            None => self.sr.phase == 0 && frag.log_nodes.is_empty(),
        }
    }

    /// Reconstructs the original request and pushes it through the normal
    /// prepare machinery; commit follows as soon as it prepares.
    fn apply_replayed(&mut self, part: u32, rec: CommitRec, prep: PreparedRecord) {
        self.sr.replay_seq += 1;
        let transid = [0x5245_0000 | part, self.sr.replay_seq];
        let tc_op = self.sr.replay_seq;
        let own = self.own_node;
        let op_kind = OpKind::from_word(prep.op_kind).unwrap_or_else(|| {
            panic!(
                "replayed prepare carries unknown operation kind {}",
                prep.op_kind
            )
        });
        let key_len = prep.key.len() as u32;
        let attr_len = prep.attr.len() as u32;
        let req = KeyReq {
            client_ref: BlockRef::new(own, Block::Lqh),
            client_op: 0,
            tc_ref: BlockRef::new(own, Block::Lqh),
            tc_op,
            table: rec.table,
            schema_version: rec.schema_version,
            fragment: rec.fragment,
            transid,
            op: op_kind,
            lock: LockMode::Exclusive,
            flags: KeyReqFlags::RESTORE,
            seq_no_replica: 0,
            last_replica_no: 0,
            next_replica: None,
            node_after_next: [None; 2],
            prev_node: None,
            hash: prep.hash,
            gci: rec.gci,
            key_len,
            attr_len,
            key: prep.key,
            attr: prep.attr,
        };
        self.handle_key_req(req);
        // The op resumes this part's loop when it completes.
        if let Some(h) = self.find_op_any(transid, tc_op) {
            self.ops.pool.get_mut(h).exec_sr_part = Some(part);
        } else {
            // The op already ran to completion inside the engines.
            self.continue_b(crate::signal::ContinueB::ExecLogLoop { part });
        }
    }

    /// A replayed operation forwarded by a peer executing its log.
    pub(crate) fn handle_exec_frag_req(&mut self, req: ExecFragReq) {
        let table = req.key_req.table;
        let fragment = req.key_req.fragment;
        self.handle_key_req(req.key_req);
        self.send(
            req.sender_ref,
            Signal::ExecFragConf(ExecFragConf { table, fragment }),
        );
    }

    pub(crate) fn handle_exec_frag_conf(&mut self, _conf: ExecFragConf) {
        // Flow control for remote replay; nothing to do beyond logging.
        tracing::trace!("remote replay op confirmed");
    }

    fn lqh_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(&node, &status)| status == PeerStatus::Alive && node != self.own_node)
            .map(|(&node, _)| node)
            .collect()
    }

    /// All parts finished a pass: barrier with every participating peer.
    fn exec_pass_barrier(&mut self) {
        let peers = self.lqh_peers();
        tracing::info!(phase = self.sr.phase, peers = peers.len(), "pass barrier");
        if peers.is_empty() {
            self.exec_pass_confirmed();
            return;
        }
        self.sr.state = RestartState::Barrier;
        self.sr.exec_sr_confs = 0;
        let own = self.own_node;
        let phase = self.sr.phase;
        for node in peers {
            self.send_to_block(
                node,
                Block::Lqh,
                Signal::ExecSrReq(ExecSrReq { sender: own, phase }),
            );
        }
    }

    pub(crate) fn handle_exec_sr_req(&mut self, req: ExecSrReq) {
        let own = self.own_node;
        self.send_to_block(
            req.sender,
            Block::Lqh,
            Signal::ExecSrConf(ExecSrConf {
                sender: own,
                phase: req.phase,
            }),
        );
    }

    pub(crate) fn handle_exec_sr_conf(&mut self, conf: ExecSrConf) {
        if self.sr.state != RestartState::Barrier || conf.phase != self.sr.phase {
            tracing::warn!("stray pass-barrier CONF; discarded");
            return;
        }
        self.sr.exec_sr_confs += 1;
        if self.sr.exec_sr_confs >= self.lqh_peers().len() {
            self.exec_pass_confirmed();
        }
    }

    fn exec_pass_confirmed(&mut self) {
        self.sr.phase += 1;
        if self.sr.phase < REPLAY_PHASES {
            self.start_exec_pass_all();
            return;
        }
        // All passes done: install heads and wipe the stale tail.
        self.sr.state = RestartState::Invalidating;
        self.sr.parts_invalidated = [false; LOG_PARTS];
        for part in 0..LOG_PARTS as u32 {
            self.redo.parts[part as usize].state = LogPartState::SrInvalidating;
            let event = {
                let io = self.io.as_mut();
                self.redo.start_invalidation(part, io, &mut self.inbox)
            };
            if !matches!(event, LogEvent::None) {
                self.handle_log_event(event);
            }
        }
    }

    pub(crate) fn part_invalidated(&mut self, part: u32) {
        self.sr.parts_invalidated[part as usize] = true;
        self.redo.parts[part as usize].state = LogPartState::Idle;
        {
            let io = self.io.as_mut();
            self.redo.adjust_open_files(part, io, &mut self.inbox);
        }
        if !self.sr.parts_invalidated.iter().all(|&b| b) {
            return;
        }
        // Recovery epilogue: tail from the checkpoint horizon, fragments
        // go live, and the node opens for business.
        let keep_gci = self.sr.keep_gci;
        self.redo.set_log_tail(keep_gci);
        let recovering: Vec<crate::fragment::FragH> = self
            .frags
            .pool
            .iter_busy()
            .filter(|(_, f)| f.status == FragStatus::CrashRecovering)
            .map(|(h, _)| h)
            .collect();
        for h in recovering {
            self.frags.pool.get_mut(h).status = FragStatus::Active;
        }
        self.sr.state = RestartState::Done;
        self.state = NodeState::Started;
        tracing::info!("restart recovery complete");
        if let Some(requester) = self.sr.start_rec_requester.take() {
            let node = self.own_node;
            self.send(requester, Signal::StartRecConf(StartRecConf { node }));
        }
    }
}
