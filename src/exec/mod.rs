//! The operation state machine: prepare, commit and abort paths, plus the
//! per-part serialisation of log appends.

pub mod abort;
pub mod commit;
pub mod prepare;

use crate::fragment::{FragH, FragStatus};
use crate::log::files::LogPartState;
use crate::node::Lqh;
use crate::ops::{ConnectState, ListState, OpH, TransactionState};
use crate::signal::{ContinueB, KeyRef, Signal, TransId};

/// What a queued op wants appended once the part frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Prepare,
    Commit,
    Abort,
}

impl Lqh {
    /// Finds an op by coordinator identity. Ops sit in the transid hash
    /// only while PREPARED and later; earlier states are found by walking
    /// the pool, which stale signals make rare.
    pub(crate) fn find_op_any(&self, transid: TransId, tc_op: u32) -> Option<OpH> {
        if let Some(h) = self.ops.hash_find(transid, tc_op) {
            return Some(h);
        }
        self.ops
            .pool
            .iter_busy()
            .find(|(_, op)| op.transid == transid && op.tc_op == tc_op)
            .map(|(h, _)| h)
    }

    pub(crate) fn send_key_ref(&mut self, h: OpH, code: u32) {
        let (client, client_op, transid) = {
            let op = self.ops.pool.get(h);
            (op.client_ref, op.client_op, op.transid)
        };
        if let Some(client) = client {
            self.send(
                client,
                Signal::KeyRef(KeyRef {
                    client_op,
                    transid,
                    code,
                }),
            );
        }
    }

    /// Final teardown of an op record.
    pub(crate) fn release_op(&mut self, h: OpH) {
        let (table, in_hash, frag, connect, exec_part) = {
            let op = self.ops.pool.get(h);
            (
                op.table,
                op.list_state == ListState::InTransHash,
                op.frag,
                op.connect_state,
                op.exec_sr_part,
            )
        };
        if in_hash {
            self.ops.hash_remove(h);
        }
        if connect == ConnectState::Connected {
            self.table_usage_dec(table);
        }
        // Copy-active bring-up: the fragment reports fully active once the
        // transactions that predate activation drain.
        if let Some(frag) = frag {
            let frag_h = FragH(frag);
            if self.frags.pool.is_busy(frag_h) {
                let f = self.frags.pool.get_mut(frag_h);
                if f.active_tc_counter > 0 {
                    f.active_tc_counter -= 1;
                }
            }
        }
        self.ops.release(h);
        if let Some(part) = exec_part {
            // Replay waits for this op before reading on.
            self.continue_b(ContinueB::ExecLogLoop { part });
        }
    }

    /// Removes an op from the fragment active list; when the last one
    /// leaves a blocked fragment the checkpoint moves forward.
    pub(crate) fn release_active_frag(&mut self, h: OpH) {
        let Some(frag) = self.ops.pool.get(h).frag else {
            return;
        };
        let frag_h = FragH(frag);
        let drained = self.frags.unlink_active(&mut self.ops, frag_h, h);
        if drained && self.frags.pool.get(frag_h).status == FragStatus::Blocked {
            self.lcp_fragment_drained(frag_h);
        }
    }

    /// Claims the part for an append or queues the op behind the current
    /// writer.
    pub(crate) fn request_log(&mut self, h: OpH, action: LogAction) {
        let part_id = self.ops.pool.get(h).log_part;
        let busy = {
            let part = &self.redo.parts[part_id as usize];
            part.active_op.is_some() || !part.queue.is_empty()
        };
        if busy {
            self.enqueue_log(h, action);
            return;
        }
        self.execute_log_action(h, action);
    }

    fn enqueue_log(&mut self, h: OpH, action: LogAction) {
        let part_id = {
            let op = self.ops.pool.get_mut(h);
            op.state = match action {
                LogAction::Prepare => TransactionState::LogQueued,
                LogAction::Commit => TransactionState::LogCommitQueued,
                LogAction::Abort => TransactionState::LogAbortQueued,
            };
            op.list_state = ListState::InLogQueue;
            op.log_part
        };
        self.redo.parts[part_id as usize].queue.push_back(h.0);
    }

    pub(crate) fn execute_log_action(&mut self, h: OpH, action: LogAction) {
        let part_id = self.ops.pool.get(h).log_part;
        let state = self.redo.parts[part_id as usize].state;
        match state {
            LogPartState::TailProblem | LogPartState::FileChangeProblem => {
                match action {
                    LogAction::Prepare => {
                        let code = if state == LogPartState::TailProblem {
                            crate::error::codes::REDO_TAIL_PROBLEM
                        } else {
                            crate::error::codes::REDO_FILE_CHANGE_PROBLEM
                        };
                        self.start_abort_with_code(h, code);
                        self.pump_log_queue(part_id);
                    }
                    // Commits and aborts must reach the log; they wait for
                    // the part to clear.
                    LogAction::Commit | LogAction::Abort => self.enqueue_log(h, action),
                }
                return;
            }
            LogPartState::SrExecuting | LogPartState::SrInvalidating => {
                // The part belongs to restart; anything arriving now waits
                // until the recovered head is installed.
                self.enqueue_log(h, action);
                return;
            }
            LogPartState::Idle | LogPartState::Active => {}
        }

        self.redo.parts[part_id as usize].state = LogPartState::Active;
        self.redo.parts[part_id as usize].active_op = Some(h.0);
        match action {
            LogAction::Prepare => self.do_prepare_append(h),
            LogAction::Commit => self.do_commit_append(h),
            LogAction::Abort => self.do_abort_append(h),
        }
    }

    /// Called after every append attempt: frees the part, pumps the
    /// queue, and honours a pending completed-GCI request.
    pub(crate) fn after_log_release(&mut self, part_id: u32) {
        {
            let part = &mut self.redo.parts[part_id as usize];
            part.active_op = None;
            if part.state == LogPartState::Active {
                part.state = LogPartState::Idle;
            }
        }
        let (idle, wants_gci) = {
            let part = &self.redo.parts[part_id as usize];
            (
                part.state == LogPartState::Idle,
                part.write_completed_gci_after_write,
            )
        };
        if idle && wants_gci {
            self.gcp_write_pending(part_id);
        }
        self.pump_log_queue(part_id);
    }

    pub(crate) fn pump_log_queue(&mut self, part_id: u32) {
        if !self.redo.parts[part_id as usize].queue.is_empty() {
            self.continue_b(ContinueB::LogNextOp { part: part_id });
        }
    }

    /// ContinueB: runs one queued op against the part, then re-posts
    /// itself while work remains.
    pub(crate) fn log_next_op(&mut self, part_id: u32) {
        if self.redo.parts[part_id as usize].active_op.is_some() {
            return;
        }
        let state = self.redo.parts[part_id as usize].state;
        match state {
            LogPartState::SrExecuting | LogPartState::SrInvalidating => return,
            LogPartState::TailProblem | LogPartState::FileChangeProblem => {
                // Prepares queued behind the problem fail now; commits and
                // aborts keep waiting for the log to clear.
                let code = if state == LogPartState::TailProblem {
                    crate::error::codes::REDO_TAIL_PROBLEM
                } else {
                    crate::error::codes::REDO_FILE_CHANGE_PROBLEM
                };
                let queued: Vec<u32> =
                    self.redo.parts[part_id as usize].queue.drain(..).collect();
                for raw in queued {
                    let h = OpH(raw);
                    let op_state = self.ops.pool.get(h).state;
                    if op_state == TransactionState::LogQueued {
                        self.ops.pool.get_mut(h).list_state = ListState::NotInList;
                        self.start_abort_with_code(h, code);
                    } else {
                        self.redo.parts[part_id as usize].queue.push_back(raw);
                    }
                }
                return;
            }
            LogPartState::Idle | LogPartState::Active => {}
        }
        let Some(raw) = self.redo.parts[part_id as usize].queue.pop_front() else {
            return;
        };
        let h = OpH(raw);
        let action = {
            let op = self.ops.pool.get_mut(h);
            op.list_state = ListState::NotInList;
            match op.state {
                TransactionState::LogQueued | TransactionState::PreparedReceivedCommit => {
                    LogAction::Prepare
                }
                TransactionState::LogCommitQueued => LogAction::Commit,
                TransactionState::LogAbortQueued => LogAction::Abort,
                other => {
                    panic!("op {h:?} queued on log part {part_id} in state {other:?}");
                }
            }
        };
        self.execute_log_action(h, action);
        self.pump_log_queue(part_id);
    }
}
