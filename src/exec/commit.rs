//! The commit and complete paths, including the slow-path variants a
//! takeover coordinator uses.

use super::LogAction;
use crate::fragment::FragH;
use crate::log::MIN_LOG_PAGES_OPERATION;
use crate::node::Lqh;
use crate::ops::{ConnectState, LogWriteState, OpH, TransactionState};
use crate::packed::{PackedEntry, UNKNOWN_OP};
use crate::signal::{
    CommitConf, CommitOrd, CommitReq, CompleteConf, CompleteOrd, CompleteReq, RemoveMarkerOrd,
    Signal, TransId,
};

impl Lqh {
    /// Resolves a commit/complete target: the direct index when the
    /// sender knew it, identity lookup for chained forwards.
    fn resolve_op(&self, lqh_op: u32, transid: TransId, tc_op: u32) -> Option<OpH> {
        if lqh_op != UNKNOWN_OP {
            let h = OpH(lqh_op);
            if self.ops.pool.is_busy(h) && self.ops.pool.get(h).transid == transid {
                return Some(h);
            }
        }
        self.find_op_any(transid, tc_op)
    }

    pub(crate) fn handle_commit(&mut self, ord: CommitOrd) {
        let Some(h) = self.resolve_op(ord.lqh_op, ord.transid, ord.tc_op) else {
            tracing::warn!(?ord.transid, "COMMIT for an unknown op; discarded");
            return;
        };
        self.ops.pool.get_mut(h).last_touch_ms = self.now_ms;
        match self.ops.pool.get(h).state {
            TransactionState::Prepared => self.commit_phase(h, ord.gci),
            TransactionState::LogQueued => {
                // The prepare record is still queued for the log; remember
                // the decision and act once it lands.
                let op = self.ops.pool.get_mut(h);
                op.state = TransactionState::PreparedReceivedCommit;
                op.deferred_commit_gci = Some(ord.gci);
            }
            other => {
                tracing::warn!(?other, "COMMIT in an unexpected state; discarded");
            }
        }
    }

    pub(crate) fn commit_phase(&mut self, h: OpH, gci: u32) {
        {
            let op = self.ops.pool.get_mut(h);
            op.gci = gci;
        }
        if gci > self.newest_gci {
            self.newest_gci = gci;
        }
        if let Some(frag) = self.ops.pool.get(h).frag {
            let f = self.frags.pool.get_mut(FragH(frag));
            if gci > f.newest_gci {
                f.newest_gci = gci;
            }
        }
        if self.ops.pool.get(h).log_write_state == LogWriteState::Written {
            if self.redo.pages.free() < MIN_LOG_PAGES_OPERATION {
                // Commits are never refused for log pressure; they queue
                // and the part drains them as flushes return pages.
                let part_id = self.ops.pool.get(h).log_part;
                self.enqueue_commit_wait(h, part_id);
                return;
            }
            self.request_log(h, LogAction::Commit);
        } else {
            self.commit_ops_engines(h);
            self.commit_done(h);
        }
    }

    fn enqueue_commit_wait(&mut self, h: OpH, part_id: u32) {
        {
            let op = self.ops.pool.get_mut(h);
            op.state = TransactionState::LogCommitQueued;
            op.list_state = crate::ops::ListState::InLogQueue;
        }
        self.redo.parts[part_id as usize].queue.push_back(h.0);
    }

    /// The part is claimed; append the commit record.
    pub(crate) fn do_commit_append(&mut self, h: OpH) {
        let (part_id, table, schema_version, fragment, pos, gci) = {
            let op = self.ops.pool.get(h);
            (
                op.log_part,
                op.table,
                op.schema_version,
                op.fragment,
                op.prep_pos.expect("commit append without a prepare position"),
                op.gci,
            )
        };
        let res = {
            let io = self.io.as_mut();
            self.redo.append_commit(
                part_id,
                table,
                schema_version,
                fragment,
                pos,
                gci,
                io,
                &mut self.inbox,
            )
        };
        match res {
            Ok(()) => {
                self.ops.pool.get_mut(h).state = TransactionState::LogCommitWritten;
                self.after_log_release(part_id);
                self.commit_ops_engines(h);
                self.commit_done(h);
            }
            Err(code) => {
                // Log pressure on the commit path clears when the tail
                // advances; keep the record queued.
                tracing::warn!(code, op = ?h, "commit record deferred by log pressure");
                self.after_log_release(part_id);
                self.enqueue_commit_wait(h, part_id);
            }
        }
    }

    pub(crate) fn commit_ops_engines(&mut self, h: OpH) {
        let (noop, acc_ptr, tup_ptr) = {
            let op = self.ops.pool.get(h);
            (op.noop, op.acc_ptr, op.tup_ptr)
        };
        if !noop {
            self.acc.commit(acc_ptr);
            self.tup.commit(tup_ptr);
        }
        self.ops.pool.get_mut(h).state = TransactionState::Committed;
    }

    /// Replies travel the replica chain in reverse; the primary answers
    /// the coordinator and is done.
    pub(crate) fn commit_done(&mut self, h: OpH) {
        let (connect, seq, prev, tc_ref, tc_op, transid, gci, slow) = {
            let op = self.ops.pool.get(h);
            (
                op.connect_state,
                op.seq_no_replica,
                op.prev_replica,
                op.tc_ref,
                op.tc_op,
                op.transid,
                op.gci,
                op.slow_reply,
            )
        };
        if let Some((reply_ref, reply_op)) = slow {
            // Takeover coordinator: confirm and hold the op for the
            // explicit complete request.
            self.ops.pool.get_mut(h).slow_reply = None;
            let node = self.own_node;
            self.send(
                reply_ref,
                Signal::CommitConf(CommitConf {
                    reply_op,
                    node,
                    transid,
                }),
            );
            return;
        }
        if connect == ConnectState::LogConnected {
            self.release_op(h);
            return;
        }
        if seq == 0 {
            if let Some(tc) = tc_ref {
                self.pack_to(tc.node, tc.block, PackedEntry::Committed { tc_op, transid });
            }
            self.release_op(h);
        } else {
            // A backup: push the commit towards the primary and hold for
            // the complete phase.
            if let Some(prev) = prev {
                self.pack_to(
                    prev,
                    crate::signal::Block::Lqh,
                    PackedEntry::Commit {
                        lqh_op: UNKNOWN_OP,
                        gci,
                        transid,
                        tc_op,
                    },
                );
            }
        }
    }

    pub(crate) fn handle_complete(&mut self, ord: CompleteOrd) {
        let Some(h) = self.resolve_op(ord.lqh_op, ord.transid, ord.tc_op) else {
            tracing::warn!(?ord.transid, "COMPLETE for an unknown op; discarded");
            return;
        };
        if self.ops.pool.get(h).state != TransactionState::Committed {
            tracing::warn!(op = ?h, "COMPLETE before COMMIT finished; discarded");
            return;
        }
        let (seq, prev, tc_ref, tc_op, transid) = {
            let op = self.ops.pool.get(h);
            (
                op.seq_no_replica,
                op.prev_replica,
                op.tc_ref,
                op.tc_op,
                op.transid,
            )
        };
        if seq > 1 {
            if let Some(prev) = prev {
                self.pack_to(
                    prev,
                    crate::signal::Block::Lqh,
                    PackedEntry::Complete {
                        lqh_op: UNKNOWN_OP,
                        transid,
                        tc_op,
                    },
                );
            }
        } else if let Some(tc) = tc_ref {
            self.pack_to(tc.node, tc.block, PackedEntry::Completed { tc_op, transid });
        }
        self.release_op(h);
    }

    pub(crate) fn handle_commit_req(&mut self, req: CommitReq) {
        let Some(h) = self.resolve_op(req.lqh_op, req.transid, 0) else {
            tracing::warn!("slow-path COMMIT for an unknown op; discarded");
            return;
        };
        if self.ops.pool.get(h).state != TransactionState::Prepared {
            tracing::warn!(op = ?h, "slow-path COMMIT in the wrong state; discarded");
            return;
        }
        self.ops.pool.get_mut(h).slow_reply = Some((req.reply_ref, req.reply_op));
        self.commit_phase(h, req.gci);
    }

    pub(crate) fn handle_complete_req(&mut self, req: CompleteReq) {
        let Some(h) = self.resolve_op(req.lqh_op, req.transid, 0) else {
            tracing::warn!("slow-path COMPLETE for an unknown op; discarded");
            return;
        };
        if self.ops.pool.get(h).state != TransactionState::Committed {
            tracing::warn!(op = ?h, "slow-path COMPLETE in the wrong state; discarded");
            return;
        }
        let node = self.own_node;
        let transid = self.ops.pool.get(h).transid;
        self.send(
            req.reply_ref,
            Signal::CompleteConf(CompleteConf {
                reply_op: req.reply_op,
                node,
                transid,
            }),
        );
        self.release_op(h);
    }

    pub(crate) fn handle_remove_marker(&mut self, ord: RemoveMarkerOrd) {
        if !self.ops.remove_marker(ord.transid) {
            tracing::warn!(?ord.transid, "remove-marker without a marker; discarded");
        }
    }
}
