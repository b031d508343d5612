//! The abort path. An abort honours whatever phase the op is in: it
//! defers to in-flight engine work, lets pending log writes finish, and
//! undoes whatever was already installed.

use super::LogAction;
use crate::error::codes;
use crate::fragment::FragH;
use crate::node::Lqh;
use crate::ops::{AbortState, ConnectState, ListState, LogWriteState, OpH, TransactionState};
use crate::signal::{Abort, AbortConf, AbortReq, Aborted, Signal};

impl Lqh {
    pub(crate) fn handle_abort(&mut self, sig: Abort) {
        let Some(h) = self.find_op_any(sig.transid, sig.tc_op) else {
            // Possibly already finished; answer so the coordinator can
            // move on.
            tracing::warn!(?sig.transid, "ABORT for an unknown op; confirmed blind");
            self.send(
                sig.tc_ref,
                Signal::Aborted(Aborted {
                    tc_op: sig.tc_op,
                    transid: sig.transid,
                }),
            );
            return;
        };
        self.start_abort(h, AbortState::FromTc);
    }

    pub(crate) fn handle_abort_req(&mut self, req: AbortReq) {
        let h = OpH(req.lqh_op);
        if !self.ops.pool.is_busy(h) || self.ops.pool.get(h).transid != req.transid {
            // Answer blind; the takeover coordinator retries idempotently.
            let node = self.own_node;
            self.send(
                req.reply_ref,
                Signal::AbortConf(AbortConf {
                    reply_op: req.reply_op,
                    node,
                    transid: req.transid,
                }),
            );
            return;
        }
        self.ops.pool.get_mut(h).slow_reply = Some((req.reply_ref, req.reply_op));
        self.start_abort(h, AbortState::NewFromTc);
    }

    pub(crate) fn start_abort_with_code(&mut self, h: OpH, code: u32) {
        self.ops.pool.get_mut(h).error_code = code;
        self.start_abort(h, AbortState::FromLqh);
    }

    /// Threads the op into the abort machine from whatever state it is
    /// in.
    pub(crate) fn start_abort(&mut self, h: OpH, origin: AbortState) {
        {
            let op = self.ops.pool.get_mut(h);
            if op.abort_state == AbortState::Idle || origin == AbortState::NewFromTc {
                op.abort_state = origin;
            }
        }
        let state = self.ops.pool.get(h).state;
        match state {
            TransactionState::Idle
            | TransactionState::WaitTupKeyInfo
            | TransactionState::WaitAttr => {
                // Nothing installed yet.
                self.finish_abort(h);
            }
            TransactionState::Stopped => {
                // Parked on the fragment wait queue during an LCP start.
                let frag = FragH(self.ops.pool.get(h).frag.expect("stopped op without frag"));
                self.frags.remove_from_wait(&mut self.ops, frag, h);
                self.finish_abort(h);
            }
            TransactionState::WaitAcc => {
                let list_state = self.ops.pool.get(h).list_state;
                if list_state == ListState::InAccBlockedList {
                    // Held by the hash index for an LCP; it never ran.
                    let frag =
                        FragH(self.ops.pool.get(h).frag.expect("blocked op without frag"));
                    self.frags.unlink_acc_blocked(&mut self.ops, frag, h);
                    self.abort_engines(h);
                } else {
                    // Mid-flight in the hash index; the CONF/REF handler
                    // diverts into the abort machine.
                    tracing::trace!(op = ?h, "abort deferred until the hash index answers");
                }
            }
            TransactionState::WaitTup => {
                self.ops.pool.get_mut(h).state = TransactionState::WaitTupToAbort;
            }
            TransactionState::LogQueued | TransactionState::PreparedReceivedCommit => {
                // Pull it off the log queue; the prepare was never
                // written.
                let part_id = self.ops.pool.get(h).log_part;
                self.redo.parts[part_id as usize].queue.retain(|&raw| raw != h.0);
                self.ops.pool.get_mut(h).list_state = ListState::NotInList;
                self.abort_engines(h);
            }
            TransactionState::Prepared => {
                if self.ops.pool.get(h).list_state == ListState::InTransHash {
                    self.ops.hash_remove(h);
                }
                let logged =
                    self.ops.pool.get(h).log_write_state == LogWriteState::Written;
                if logged {
                    self.request_log(h, LogAction::Abort);
                } else {
                    self.abort_engines(h);
                }
            }
            TransactionState::LogCommitQueued
            | TransactionState::LogCommitWritten
            | TransactionState::CommitQueued
            | TransactionState::Committed => {
                // The commit decision stands; an abort here is a protocol
                // timing artefact.
                tracing::warn!(op = ?h, ?state, "ABORT after commit decided; ignored");
                let op = self.ops.pool.get_mut(h);
                if op.abort_state != AbortState::NewFromTc {
                    op.abort_state = AbortState::Idle;
                }
            }
            TransactionState::WaitAccAbort
            | TransactionState::WaitTupToAbort
            | TransactionState::LogAbortQueued
            | TransactionState::AbortQueued
            | TransactionState::AbortStopped
            | TransactionState::WaitAiAfterAbort => {
                tracing::trace!(op = ?h, "abort already in progress");
            }
            TransactionState::CommitStopped
            | TransactionState::LogCommitQueuedWaitSignal
            | TransactionState::LogCommitWrittenWaitSignal
            | TransactionState::Scan
            | TransactionState::Copy => {
                tracing::warn!(op = ?h, ?state, "abort in an unhandled state; ignored");
            }
        }
    }

    /// The part is claimed; append the abort record, then undo the
    /// engines.
    pub(crate) fn do_abort_append(&mut self, h: OpH) {
        let (part_id, transid, prep_seq) = {
            let op = self.ops.pool.get(h);
            (
                op.log_part,
                op.transid,
                op.prep_pos.map(|p| p.mbyte_seq),
            )
        };
        let res = {
            let io = self.io.as_mut();
            self.redo
                .append_abort(part_id, transid, prep_seq, io, &mut self.inbox)
        };
        self.after_log_release(part_id);
        if let Err(code) = res {
            // The abort record waits for log pressure to clear; the
            // engines are undone regardless.
            tracing::warn!(code, op = ?h, "abort record deferred by log pressure");
        }
        self.abort_engines(h);
    }

    /// Orders the hash index to undo; the row store follows on its CONF.
    pub(crate) fn abort_engines(&mut self, h: OpH) {
        let acc_ptr = {
            let op = self.ops.pool.get_mut(h);
            op.state = TransactionState::WaitAccAbort;
            op.acc_ptr
        };
        self.acc.abort(h.0, acc_ptr, &mut self.inbox);
    }

    pub(crate) fn handle_acc_abort_conf(&mut self, conf: crate::signal::AccAbortConf) {
        let h = OpH(conf.op);
        if !self.ops.pool.is_busy(h) {
            tracing::warn!(op = conf.op, "abort CONF for a released op; discarded");
            return;
        }
        if self.ops.pool.get(h).state != TransactionState::WaitAccAbort {
            tracing::warn!(op = conf.op, "abort CONF in the wrong state; discarded");
            return;
        }
        let tup_ptr = self.ops.pool.get(h).tup_ptr;
        self.tup.abort(tup_ptr);
        self.finish_abort(h);
    }

    /// Everything undone: answer whoever drove the abort and free the
    /// record. The commit-ack marker dies with the transaction.
    pub(crate) fn finish_abort(&mut self, h: OpH) {
        let (origin, tc_ref, tc_op, transid, code, slow, connect, in_hash, exec_part) = {
            let op = self.ops.pool.get(h);
            (
                op.abort_state,
                op.tc_ref,
                op.tc_op,
                op.transid,
                if op.error_code != 0 {
                    op.error_code
                } else {
                    codes::NO_TUPLE_FOUND
                },
                op.slow_reply,
                op.connect_state,
                op.list_state == ListState::InTransHash,
                op.exec_sr_part,
            )
        };
        if in_hash {
            self.ops.hash_remove(h);
        }
        self.ops.remove_marker(transid);

        if connect == ConnectState::LogConnected {
            // Replay tolerates the benign engine verdicts; anything else
            // would have been forgiven upstream. Resume the log loop.
            tracing::warn!(op = ?h, code, "replayed operation refused by the engines");
            let _ = exec_part;
            self.release_op(h);
            return;
        }
        if let Some((reply_ref, reply_op)) = slow {
            let node = self.own_node;
            self.send(
                reply_ref,
                Signal::AbortConf(AbortConf {
                    reply_op,
                    node,
                    transid,
                }),
            );
        } else {
            match origin {
                AbortState::FromTc => {
                    if let Some(tc) = tc_ref {
                        self.send(
                            tc,
                            Signal::Aborted(Aborted {
                                tc_op,
                                transid,
                            }),
                        );
                    }
                }
                AbortState::FromLqh => {
                    self.send_key_ref(h, code);
                }
                AbortState::NewFromTc => {
                    self.takeover_op_finished(h, crate::signal::TakeoverOpStatus::Aborted);
                }
                AbortState::Idle => {
                    tracing::warn!(op = ?h, "abort finished without an origin");
                }
            }
        }
        self.release_op(h);
    }
}
