//! The prepare path: key request intake, storage-engine forwarding,
//! prepare logging, and the replica-chain forward.

use super::LogAction;
use crate::error::codes;
use crate::fragment::{FragH, FragStatus, TableStatus};
use crate::log::LOG_PARTS;
use crate::node::{Lqh, NodeState};
use crate::ops::{
    AbortState, ConnectState, LogWriteState, OpH, TransactionState, INLINE_ATTR_WORDS,
    INLINE_KEY_WORDS,
};
use crate::packed::PackedEntry;
use crate::signal::{
    AccKeyConf, AccKeyRef, AttrInfo, ContinueB, KeyInfo, KeyRef, KeyReq, KeyReqFlags, OpKind,
    Signal, TupKeyConf, TupKeyRef,
};

impl Lqh {
    pub(crate) fn handle_key_req(&mut self, req: KeyReq) {
        let restore = req.flags.contains(KeyReqFlags::RESTORE);
        let refuse = |lqh: &mut Lqh, code: u32| {
            lqh.send(
                req.client_ref,
                Signal::KeyRef(KeyRef {
                    client_op: req.client_op,
                    transid: req.transid,
                    code,
                }),
            );
        };
        if self.state != NodeState::Started && !restore {
            refuse(self, codes::NODE_NOT_STARTED);
            return;
        }

        // Validate the target before any state is installed. Replayed
        // ops carry the schema version that was current when they were
        // logged; only live traffic is held to the current one.
        let tab_h = match self.frags.table(req.table) {
            Some(h) => h,
            None => {
                refuse(self, codes::TABLE_NOT_DEFINED);
                return;
            }
        };
        if !restore {
            let table = self.frags.tables.get(tab_h);
            match table.status {
                TableStatus::TableDefined => {}
                TableStatus::PrepDropTableOngoing | TableStatus::PrepDropTableDone => {
                    refuse(self, codes::DROP_TABLE_IN_PROGRESS);
                    return;
                }
                _ => {
                    refuse(self, codes::TABLE_NOT_DEFINED);
                    return;
                }
            }
            if table.schema_version != req.schema_version {
                refuse(self, codes::SCHEMA_VERSION_MISMATCH);
                return;
            }
        }
        let Some(frag_h) = self.frags.find(req.table, req.fragment) else {
            refuse(self, codes::FRAGMENT_NOT_DEFINED);
            return;
        };
        if req.key_len == 0 {
            refuse(self, codes::KEY_LENGTH_ERROR);
            return;
        }
        let Some(h) = self.ops.seize() else {
            refuse(self, codes::NO_FREE_OPERATION);
            return;
        };
        // One engine context pair per op slot, seized at start phase 2;
        // late growth only happens when the node is driven without the
        // start phases (tests).
        while self.acc_ctx.len() <= h.0 as usize {
            let a = self.acc.seize();
            let t = self.tup.seize();
            self.acc_ctx.push(a);
            self.tup_ctx.push(t);
        }

        let inline_key = (req.key_len as usize).min(INLINE_KEY_WORDS);
        let inline_attr = (req.attr_len as usize).min(INLINE_ATTR_WORDS);
        let now = self.now_ms;
        {
            let acc_ptr = self.acc_ctx[h.0 as usize];
            let tup_ptr = self.tup_ctx[h.0 as usize];
            let op = self.ops.pool.get_mut(h);
            op.connect_state = if restore {
                ConnectState::LogConnected
            } else if req.flags.contains(KeyReqFlags::COPY) {
                ConnectState::CopyConnected
            } else {
                ConnectState::Connected
            };
            op.client_ref = Some(req.client_ref);
            op.client_op = req.client_op;
            op.tc_ref = Some(req.tc_ref);
            op.tc_op = req.tc_op;
            op.table = req.table;
            op.schema_version = req.schema_version;
            op.fragment = req.fragment;
            op.frag = Some(frag_h.0);
            op.transid = req.transid;
            op.op_kind = req.op;
            op.lock = req.lock;
            op.flags = req.flags;
            op.seq_no_replica = req.seq_no_replica;
            op.last_replica_no = req.last_replica_no;
            op.next_replica = req.next_replica;
            op.node_after_next = req.node_after_next;
            op.prev_replica = req.prev_node;
            op.hash = req.hash;
            op.log_part = req.hash % LOG_PARTS as u32;
            op.gci = req.gci;
            op.key_len = req.key_len;
            op.attr_len = req.attr_len;
            op.acc_ptr = acc_ptr;
            op.tup_ptr = tup_ptr;
            op.last_touch_ms = now;
            for (i, &w) in req.key.iter().take(inline_key).enumerate() {
                op.key_inline[i] = w;
            }
            for (i, &w) in req.attr.iter().take(inline_attr).enumerate() {
                op.attr_inline[i] = w;
            }
            op.key_received = req.key.len().min(inline_key) as u32;
            op.attr_received = req.attr.len().min(inline_attr) as u32;
        }
        // Overflow words that arrived inline with the request.
        if req.key.len() > inline_key {
            let mut seg = self.ops.pool.get(h).key_overflow;
            let res = self.ops.append_overflow(&mut seg, &req.key[inline_key..]);
            self.ops.pool.get_mut(h).key_overflow = seg;
            if let Err(code) = res {
                self.ops.pool.get_mut(h).key_received = 0;
                self.ops.release(h);
                refuse(self, code);
                return;
            }
            self.ops.pool.get_mut(h).key_received += (req.key.len() - inline_key) as u32;
        }
        if req.attr.len() > inline_attr {
            let mut seg = self.ops.pool.get(h).attr_overflow;
            let res = self.ops.append_overflow(&mut seg, &req.attr[inline_attr..]);
            self.ops.pool.get_mut(h).attr_overflow = seg;
            if let Err(code) = res {
                self.ops.release(h);
                refuse(self, code);
                return;
            }
            self.ops.pool.get_mut(h).attr_received += (req.attr.len() - inline_attr) as u32;
        }

        if self.ops.pool.get(h).connect_state == ConnectState::Connected {
            self.table_usage_inc(req.table);
        }

        let (key_done, attr_done) = {
            let op = self.ops.pool.get(h);
            (op.key_received >= op.key_len, op.attr_received >= op.attr_len)
        };
        if !key_done {
            self.ops.pool.get_mut(h).state = TransactionState::WaitTupKeyInfo;
            return;
        }
        if !attr_done {
            self.ops.pool.get_mut(h).state = TransactionState::WaitAttr;
            return;
        }
        self.proceed_prepare(h);
    }

    pub(crate) fn handle_key_info(&mut self, info: KeyInfo) {
        let found = self
            .ops
            .pool
            .iter_busy()
            .find(|(_, op)| {
                op.transid == info.transid && op.state == TransactionState::WaitTupKeyInfo
            })
            .map(|(h, _)| h);
        let Some(h) = found else {
            tracing::warn!("key info without a waiting op; discarded");
            return;
        };
        let mut seg = self.ops.pool.get(h).key_overflow;
        let res = self.ops.append_overflow(&mut seg, &info.words);
        self.ops.pool.get_mut(h).key_overflow = seg;
        if let Err(code) = res {
            self.start_abort_with_code(h, code);
            return;
        }
        let (key_done, attr_done) = {
            let op = self.ops.pool.get_mut(h);
            op.key_received += info.words.len() as u32;
            (op.key_received >= op.key_len, op.attr_received >= op.attr_len)
        };
        if !key_done {
            return;
        }
        if !attr_done {
            self.ops.pool.get_mut(h).state = TransactionState::WaitAttr;
            return;
        }
        self.proceed_prepare(h);
    }

    pub(crate) fn handle_attr_info(&mut self, info: AttrInfo) {
        let found = self
            .ops
            .pool
            .iter_busy()
            .find(|(_, op)| op.transid == info.transid && op.state == TransactionState::WaitAttr)
            .map(|(h, _)| h);
        let Some(h) = found else {
            tracing::warn!("attribute info without a waiting op; discarded");
            return;
        };
        let mut seg = self.ops.pool.get(h).attr_overflow;
        let res = self.ops.append_overflow(&mut seg, &info.words);
        self.ops.pool.get_mut(h).attr_overflow = seg;
        if let Err(code) = res {
            self.start_abort_with_code(h, code);
            return;
        }
        let attr_done = {
            let op = self.ops.pool.get_mut(h);
            op.attr_received += info.words.len() as u32;
            op.attr_received >= op.attr_len
        };
        if attr_done {
            self.proceed_prepare(h);
        }
    }

    /// Key and attributes complete: check the fragment, install a marker
    /// when asked, and enter the hash index.
    pub(crate) fn proceed_prepare(&mut self, h: OpH) {
        let frag_h = FragH(self.ops.pool.get(h).frag.expect("prepare without fragment"));
        let status = self.frags.pool.get(frag_h).status;
        match status {
            FragStatus::Blocked => {
                // A checkpoint is starting here; park until it unblocks.
                self.ops.pool.get_mut(h).state = TransactionState::Stopped;
                self.frags.enqueue_wait(&mut self.ops, frag_h, h);
                return;
            }
            FragStatus::Removing | FragStatus::Defined => {
                self.start_abort_with_code(h, codes::DROP_TABLE_IN_PROGRESS);
                return;
            }
            FragStatus::CrashRecovering => {
                if self.ops.pool.get(h).connect_state != ConnectState::LogConnected {
                    self.start_abort_with_code(h, codes::FRAGMENT_NOT_DEFINED);
                    return;
                }
            }
            FragStatus::Active | FragStatus::ActiveCreation => {}
        }

        let (wants_marker, transid, client_ref, client_op, tc_node) = {
            let op = self.ops.pool.get(h);
            (
                op.flags.contains(KeyReqFlags::MARKER),
                op.transid,
                op.client_ref,
                op.client_op,
                op.tc_ref.map(|r| r.node),
            )
        };
        if wants_marker {
            let tc_node = tc_node.expect("marker without a coordinator");
            if let Err(code) = self
                .ops
                .insert_marker(transid, client_ref, client_op, tc_node)
            {
                self.start_abort_with_code(h, code);
                return;
            }
        }

        self.frags.link_active(&mut self.ops, frag_h, h);
        self.ops.pool.get_mut(h).state = TransactionState::WaitAcc;
        let req = {
            let op = self.ops.pool.get(h);
            crate::engines::AccKeyReq {
                op: h.0,
                acc_ptr: op.acc_ptr,
                table: op.table,
                fragment: op.fragment,
                kind: op.op_kind,
                lock: op.lock,
                transid: op.transid,
                hash: op.hash,
                key: self.ops.full_key(h),
            }
        };
        self.acc.key_req(req, &mut self.inbox);
    }

    pub(crate) fn handle_acc_key_conf(&mut self, conf: AccKeyConf) {
        let h = OpH(conf.op);
        if !self.ops.pool.is_busy(h) {
            tracing::warn!(op = conf.op, "hash-index CONF for a released op; discarded");
            return;
        }
        if self.ops.pool.get(h).abort_state != AbortState::Idle {
            // An abort raced the engine; undo what just succeeded.
            self.ops.pool.get_mut(h).local_key = conf.local_key;
            self.release_active_frag(h);
            self.abort_engines(h);
            return;
        }
        if self.ops.pool.get(h).state != TransactionState::WaitAcc {
            tracing::warn!(op = conf.op, "hash-index CONF in the wrong state; discarded");
            return;
        }
        {
            let op = self.ops.pool.get_mut(h);
            op.local_key = conf.local_key;
            op.state = TransactionState::WaitTup;
        }
        let req = {
            let op = self.ops.pool.get(h);
            crate::engines::TupKeyReq {
                op: h.0,
                tup_ptr: op.tup_ptr,
                table: op.table,
                fragment: op.fragment,
                kind: op.op_kind,
                local_key: op.local_key,
                attr: self.ops.full_attr(h),
            }
        };
        self.tup.key_req(req, &mut self.inbox);
    }

    pub(crate) fn handle_acc_key_ref(&mut self, r: AccKeyRef) {
        let h = OpH(r.op);
        if !self.ops.pool.is_busy(h) {
            tracing::warn!(op = r.op, "hash-index REF for a released op; discarded");
            return;
        }
        if self.ops.pool.get(h).state != TransactionState::WaitAcc {
            tracing::warn!(op = r.op, "hash-index REF in the wrong state; discarded");
            return;
        }
        if self.engine_error_forgiven(h, r.code) {
            // Copy-in-progress fragment: carry on as if committed.
            self.ops.pool.get_mut(h).noop = true;
            self.ops.pool.get_mut(h).log_write_state = LogWriteState::NotWritten;
            self.release_active_frag(h);
            self.prepared_finish(h);
            return;
        }
        self.release_active_frag(h);
        self.ops.pool.get_mut(h).error_code = r.code;
        if self.ops.pool.get(h).abort_state == AbortState::Idle {
            self.ops.pool.get_mut(h).abort_state = AbortState::FromLqh;
        }
        // The hash index rejected the op, so nothing there needs undoing;
        // the row store was never entered.
        self.finish_abort(h);
    }

    pub(crate) fn handle_tup_key_conf(&mut self, conf: TupKeyConf) {
        let h = OpH(conf.op);
        if !self.ops.pool.is_busy(h) {
            tracing::warn!(op = conf.op, "row-store CONF for a released op; discarded");
            return;
        }
        if self.ops.pool.get(h).abort_state != AbortState::Idle {
            self.release_active_frag(h);
            self.abort_engines(h);
            return;
        }
        if self.ops.pool.get(h).state != TransactionState::WaitTup {
            tracing::warn!(op = conf.op, "row-store CONF in the wrong state; discarded");
            return;
        }
        self.ops.pool.get_mut(h).read_len = conf.read_len;
        self.release_active_frag(h);

        let needs_log = {
            let op = self.ops.pool.get(h);
            let frag_logged = op
                .frag
                .map(|f| self.frags.pool.get(FragH(f)).logged)
                .unwrap_or(false);
            let replayed = op.connect_state == ConnectState::LogConnected;
            !op.op_kind.is_read() && frag_logged && !replayed
        };
        if needs_log {
            self.request_log(h, LogAction::Prepare);
        } else {
            self.ops.pool.get_mut(h).log_write_state = LogWriteState::NotWritten;
            self.prepared_finish(h);
        }
    }

    pub(crate) fn handle_tup_key_ref(&mut self, r: TupKeyRef) {
        let h = OpH(r.op);
        if !self.ops.pool.is_busy(h) {
            tracing::warn!(op = r.op, "row-store REF for a released op; discarded");
            return;
        }
        if self.ops.pool.get(h).state != TransactionState::WaitTup {
            tracing::warn!(op = r.op, "row-store REF in the wrong state; discarded");
            return;
        }
        if self.engine_error_forgiven(h, r.code) {
            self.ops.pool.get_mut(h).noop = true;
            self.ops.pool.get_mut(h).log_write_state = LogWriteState::NotWritten;
            self.release_active_frag(h);
            self.prepared_finish(h);
            return;
        }
        self.release_active_frag(h);
        {
            let op = self.ops.pool.get_mut(h);
            op.error_code = r.code;
            if op.abort_state == AbortState::Idle {
                op.abort_state = AbortState::FromLqh;
            }
        }
        // The hash index holds a lock for this op; undo it before
        // reporting.
        self.abort_engines(h);
    }

    /// On an active-creation fragment, "row missing" on UPDATE/DELETE and
    /// "row exists" on INSERT are forward references the copy will fill.
    fn engine_error_forgiven(&self, h: OpH, code: u32) -> bool {
        let op = self.ops.pool.get(h);
        let Some(frag) = op.frag else { return false };
        if self.frags.pool.get(FragH(frag)).status != FragStatus::ActiveCreation {
            return false;
        }
        match op.op_kind {
            OpKind::Insert => code == codes::TUPLE_ALREADY_EXIST,
            OpKind::Update | OpKind::Delete | OpKind::Write => code == codes::NO_TUPLE_FOUND,
            OpKind::Read => false,
        }
    }

    /// The part is claimed; append the prepare (and, for a dirty write,
    /// its commit record right behind).
    pub(crate) fn do_prepare_append(&mut self, h: OpH) {
        let key = self.ops.full_key(h);
        let attr = self.ops.full_attr(h);
        let (part_id, hash, kind, dirty, table, schema_version, fragment) = {
            let op = self.ops.pool.get(h);
            (
                op.log_part,
                op.hash,
                op.op_kind.as_word(),
                op.flags.contains(KeyReqFlags::DIRTY) && !op.op_kind.is_read(),
                op.table,
                op.schema_version,
                op.fragment,
            )
        };
        let res = {
            let io = self.io.as_mut();
            self.redo
                .append_prepare(part_id, hash, kind, &key, &attr, io, &mut self.inbox)
        };
        match res {
            Ok(pos) => {
                {
                    let op = self.ops.pool.get_mut(h);
                    op.prep_pos = Some(pos);
                    op.log_write_state = LogWriteState::Written;
                }
                if dirty {
                    // Dirty writes never see a separate COMMIT; the commit
                    // record rides right behind the prepare.
                    let gci = self.newest_gci;
                    self.ops.pool.get_mut(h).gci = gci;
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
                    if let Err(code) = res {
                        tracing::warn!(code, "dirty commit record deferred by log pressure");
                    }
                }
                self.after_log_release(part_id);
                self.prepared_finish(h);
            }
            Err(code) => {
                self.after_log_release(part_id);
                self.ops.pool.get_mut(h).error_code = code;
                self.ops.pool.get_mut(h).abort_state = AbortState::FromLqh;
                self.abort_engines(h);
            }
        }
    }

    /// The op is durable (or needs no log): answer or forward down the
    /// replica chain, and self-commit the flavours that never see COMMIT.
    pub(crate) fn prepared_finish(&mut self, h: OpH) {
        {
            let op = self.ops.pool.get_mut(h);
            op.state = TransactionState::Prepared;
            op.last_touch_ms = self.now_ms;
        }
        self.ops.hash_insert(h);

        let (connect, gci) = {
            let op = self.ops.pool.get(h);
            (op.connect_state, op.gci)
        };
        if connect == ConnectState::LogConnected {
            // Replayed op: the commit decision was taken before the crash.
            self.commit_phase(h, gci);
            return;
        }

        let (is_last, client, client_op, read_len, transid, dirty, is_read) = {
            let op = self.ops.pool.get(h);
            // A copy op's confirmation credits the payload words back to
            // the sender through the transid[0] slot; the overload is
            // wire-compatible and load-bearing.
            let transid = if op.flags.contains(KeyReqFlags::COPY) {
                [op.key_len + op.attr_len, op.transid[1]]
            } else {
                op.transid
            };
            (
                op.seq_no_replica == op.last_replica_no,
                op.client_ref,
                op.client_op,
                op.read_len,
                transid,
                op.flags.contains(KeyReqFlags::DIRTY),
                op.op_kind.is_read(),
            )
        };
        if is_last {
            if let Some(client) = client {
                self.pack_to(
                    client.node,
                    client.block,
                    PackedEntry::KeyConf {
                        client_op,
                        lqh_op: h.0,
                        read_len,
                        transid,
                    },
                );
            }
        } else {
            self.forward_key_req(h);
        }

        if dirty {
            if is_read {
                self.release_op(h);
            } else {
                // Engines commit right away; the log record is written.
                self.commit_ops_engines(h);
                self.release_op(h);
            }
            return;
        }

        // A COMMIT that overtook the queued prepare log write acts now.
        if let Some(gci) = self.ops.pool.get_mut(h).deferred_commit_gci.take() {
            self.commit_phase(h, gci);
        }
    }

    /// Sends the next replica its copy of the request, fully inline.
    fn forward_key_req(&mut self, h: OpH) {
        let key = self.ops.full_key(h);
        let attr = self.ops.full_attr(h);
        let op = self.ops.pool.get(h);
        let next = op.next_replica.expect("forward without a next replica");
        let mut node_after_next = [None; 2];
        node_after_next[0] = op.node_after_next[1];
        let req = KeyReq {
            client_ref: op.client_ref.expect("forward without a client"),
            client_op: op.client_op,
            tc_ref: op.tc_ref.expect("forward without a coordinator"),
            tc_op: op.tc_op,
            table: op.table,
            schema_version: op.schema_version,
            fragment: op.fragment,
            transid: op.transid,
            op: op.op_kind,
            lock: op.lock,
            flags: op.flags,
            seq_no_replica: op.seq_no_replica + 1,
            last_replica_no: op.last_replica_no,
            next_replica: op.node_after_next[0],
            node_after_next,
            prev_node: Some(self.own_node),
            hash: op.hash,
            gci: op.gci,
            key_len: op.key_len,
            attr_len: op.attr_len,
            key,
            attr,
        };
        self.send_to_block(next, crate::signal::Block::Lqh, Signal::KeyReq(req));
    }

    /// ContinueB: pulls parked prepares off an unblocked fragment, a
    /// bounded batch per break.
    pub(crate) fn restart_queued_ops(&mut self, frag_raw: u32) {
        const BATCH: u32 = 16;
        let frag_h = FragH(frag_raw);
        if !self.frags.pool.is_busy(frag_h) {
            return;
        }
        for _ in 0..BATCH {
            if self.frags.pool.get(frag_h).status == FragStatus::Blocked {
                // Blocked again before the queue drained; stop here.
                return;
            }
            let Some(h) = self.frags.dequeue_wait(&mut self.ops, frag_h) else {
                return;
            };
            self.ops.pool.get_mut(h).state = TransactionState::Idle;
            self.proceed_prepare(h);
        }
        if self.frags.pool.get(frag_h).wait_queue_first.is_some() {
            self.continue_b(ContinueB::RestartQueuedOps { fragment: frag_raw });
        }
    }
}
