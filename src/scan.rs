//! Scan and copy-fragment bookkeeping.
//!
//! Full scan iteration runs in the storage engines; this module owns the
//! resource discipline around it: the scan-record pool with one slot held
//! back for the restart copy scan, per-fragment scan numbers, the booked
//! hash-index op budget, and the in-flight word credit that throttles a
//! fragment copy to a starting node.

use crate::error::codes;
use crate::fragment::FragStatus;
use crate::node::Lqh;
use crate::ops::TransactionState;
use crate::pool::Pool;
use crate::signal::{
    AccScanConf, Block, BlockRef, CopyActiveConf, CopyActiveReq, CopyFragConf, CopyFragReq,
    KeyConf, KeyRef, KeyReq, KeyReqFlags, LockMode, NextScanConf, NodeId, OpKind, ScanFragConf,
    ScanFragRef, ScanFragReq, ScanHbRep, ScanNextReq, ScanRowRef, Signal, TransId,
};

crate::define_handle!(ScanH);

/// Copy-fragment window: payload words in flight before the sender
/// pauses for acknowledgements.
pub const MAX_WORDS_OUTSTANDING_COPY: u32 = 6000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Running,
    WaitNext,
    Queued,
    /// Copy stream holding a row because the credit window is full.
    CopyPaused,
    /// Copy cursor exhausted; waiting for the last acks to come home.
    CopyDraining,
}

pub struct ScanRecord {
    pub client_ref: Option<BlockRef>,
    pub client_op: u32,
    pub transid: TransId,
    pub table: u32,
    pub fragment: u32,
    pub scan_number: u32,
    pub ordered: bool,
    pub copy: bool,
    pub state: ScanState,
    pub booked_ops: u32,
    pub copy_dest: Option<NodeId>,
    /// Hash-index cursor driving a copy stream.
    pub cursor: Option<u32>,
    /// Row held back while the window is full.
    pub pending_row: Option<ScanRowRef>,
    /// Copy flow control: words sent but not yet credited back.
    pub words_outstanding: u32,
    pub rows_copied: u32,
    pub last_hb_ms: u64,
}

impl Default for ScanRecord {
    fn default() -> Self {
        Self {
            client_ref: None,
            client_op: 0,
            transid: [0; 2],
            table: 0,
            fragment: 0,
            scan_number: 0,
            ordered: false,
            copy: false,
            state: ScanState::Running,
            booked_ops: 0,
            copy_dest: None,
            cursor: None,
            pending_row: None,
            words_outstanding: 0,
            rows_copied: 0,
            last_hb_ms: 0,
        }
    }
}

pub struct Scans {
    pub pool: Pool<ScanH, ScanRecord>,
    /// Hash-index op budget claimed by open scans.
    pub booked_acc_ops: u32,
    pub max_acc_ops: u32,
}

impl Scans {
    pub fn new(cfg: &crate::config::Config) -> Self {
        Self {
            // One extra slot, reserved for the restart copy scan.
            pool: Pool::new(cfg.scan_records + 1),
            booked_acc_ops: 0,
            max_acc_ops: cfg.scan_records * cfg.max_parallel_ops_per_scan,
        }
    }

    /// True when a non-copy scan may take a record; the last slot only
    /// ever goes to a copy scan.
    pub fn can_seize(&self, copy: bool) -> bool {
        if copy {
            self.pool.free() > 0
        } else {
            self.pool.free() > 1
        }
    }
}

impl Lqh {
    pub(crate) fn handle_scan_frag_req(&mut self, req: ScanFragReq) {
        let refuse = |code: u32| {
            Signal::ScanFragRef(ScanFragRef {
                client_op: req.client_op,
                transid: req.transid,
                code,
            })
        };
        let Some(frag_h) = self.frags.find(req.table, req.fragment) else {
            self.send(req.sender_ref, refuse(codes::FRAGMENT_NOT_DEFINED));
            return;
        };
        if !self.scans.can_seize(req.copy) {
            self.send(req.sender_ref, refuse(codes::NO_FREE_SCAN));
            return;
        }
        if self.scans.booked_acc_ops + req.parallel_ops > self.scans.max_acc_ops {
            self.send(req.sender_ref, refuse(codes::SCAN_BOOK_OVERFLOW));
            return;
        }
        let Some(nr) = self.frags.alloc_scan_number(frag_h, req.ordered) else {
            // The mask is full; the scan waits for a number.
            let h = self.scans.pool.seize().expect("checked free above");
            let rec = self.scans.pool.get_mut(h);
            rec.client_ref = Some(req.sender_ref);
            rec.client_op = req.client_op;
            rec.transid = req.transid;
            rec.table = req.table;
            rec.fragment = req.fragment;
            rec.ordered = req.ordered;
            rec.copy = req.copy;
            rec.booked_ops = req.parallel_ops;
            rec.state = ScanState::Queued;
            self.scans.booked_acc_ops += req.parallel_ops;
            self.frags.pool.get_mut(frag_h).queued_scans.push_back(h.0);
            return;
        };
        let h = self.scans.pool.seize().expect("checked free above");
        self.scans.booked_acc_ops += req.parallel_ops;
        {
            let rec = self.scans.pool.get_mut(h);
            rec.client_ref = Some(req.sender_ref);
            rec.client_op = req.client_op;
            rec.transid = req.transid;
            rec.table = req.table;
            rec.fragment = req.fragment;
            rec.scan_number = nr;
            rec.ordered = req.ordered;
            rec.copy = req.copy;
            rec.booked_ops = req.parallel_ops;
            rec.state = ScanState::Running;
            rec.last_hb_ms = self.now_ms;
        }
        self.send(
            req.sender_ref,
            Signal::ScanFragConf(ScanFragConf {
                client_op: req.client_op,
                scan_op: h.0,
                transid: req.transid,
                closed: false,
            }),
        );
    }

    pub(crate) fn handle_scan_next_req(&mut self, req: ScanNextReq) {
        let h = ScanH(req.scan_op);
        if !self.scans.pool.is_busy(h) || self.scans.pool.get(h).transid != req.transid {
            tracing::warn!(scan = req.scan_op, "scan-next for an unknown scan; discarded");
            return;
        }
        if req.close {
            self.close_scan(h, true);
        } else {
            let rec = self.scans.pool.get_mut(h);
            rec.state = ScanState::WaitNext;
            rec.last_hb_ms = self.now_ms;
        }
    }

    /// Tears a scan down, frees its number and booked budget, and admits
    /// a queued scan waiting for the number. Copy scans hold a cursor and
    /// the reserved slot instead of a scan number.
    pub(crate) fn close_scan(&mut self, h: ScanH, reply: bool) {
        let (client, client_op, transid, table, fragment, nr, booked, queued, copy, cursor) = {
            let rec = self.scans.pool.get(h);
            (
                rec.client_ref,
                rec.client_op,
                rec.transid,
                rec.table,
                rec.fragment,
                rec.scan_number,
                rec.booked_ops,
                rec.state == ScanState::Queued,
                rec.copy,
                rec.cursor,
            )
        };
        self.scans.booked_acc_ops -= booked;
        if let Some(cursor) = cursor {
            self.acc.scan_release(cursor);
        }
        let frag_h = self.frags.find(table, fragment);
        if let Some(frag_h) = frag_h {
            if copy {
                self.frags.pool.get_mut(frag_h).copy_dest = None;
            } else if queued {
                let frag = self.frags.pool.get_mut(frag_h);
                frag.queued_scans.retain(|&s| s != h.0);
            } else {
                self.frags.release_scan_number(frag_h, nr);
            }
        }
        self.scans.pool.release(h);
        if reply {
            if let Some(client) = client {
                self.send(
                    client,
                    Signal::ScanFragConf(ScanFragConf {
                        client_op,
                        scan_op: h.0,
                        transid,
                        closed: true,
                    }),
                );
            }
        }
        // A freed number may admit a queued scan on the same fragment.
        if let Some(frag_h) = frag_h {
            self.admit_queued_scan(frag_h);
        }
    }

    fn admit_queued_scan(&mut self, frag_h: crate::fragment::FragH) {
        let Some(next) = self.frags.pool.get_mut(frag_h).queued_scans.pop_front() else {
            return;
        };
        let h = ScanH(next);
        let ordered = self.scans.pool.get(h).ordered;
        let Some(nr) = self.frags.alloc_scan_number(frag_h, ordered) else {
            self.frags.pool.get_mut(frag_h).queued_scans.push_front(next);
            return;
        };
        let (client, client_op, transid) = {
            let rec = self.scans.pool.get_mut(h);
            rec.scan_number = nr;
            rec.state = ScanState::Running;
            (rec.client_ref, rec.client_op, rec.transid)
        };
        if let Some(client) = client {
            self.send(
                client,
                Signal::ScanFragConf(ScanFragConf {
                    client_op,
                    scan_op: h.0,
                    transid,
                    closed: false,
                }),
            );
        }
    }

    /// Close everything a failed node had open here.
    pub(crate) fn close_scans_for_node(&mut self, node: NodeId) {
        let stale: Vec<ScanH> = self
            .scans
            .pool
            .iter_busy()
            .filter(|(_, rec)| {
                rec.client_ref.map(|r| r.node) == Some(node) || rec.copy_dest == Some(node)
            })
            .map(|(h, _)| h)
            .collect();
        for h in stale {
            tracing::info!(scan = ?h, ?node, "closing scan after node failure");
            self.close_scan(h, false);
        }
    }

    pub(crate) fn scan_heartbeats(&mut self) {
        let now = self.now_ms;
        let due: Vec<(BlockRef, u32, TransId)> = self
            .scans
            .pool
            .iter_busy()
            .filter(|(_, rec)| {
                rec.state == ScanState::Running && rec.last_hb_ms + 1000 <= now
            })
            .filter_map(|(_, rec)| rec.client_ref.map(|r| (r, rec.client_op, rec.transid)))
            .collect();
        for (client, client_op, transid) in due {
            self.send(
                client,
                Signal::ScanHbRep(ScanHbRep { client_op, transid }),
            );
        }
        let handles: Vec<ScanH> = self
            .scans
            .pool
            .iter_busy()
            .filter(|(_, rec)| rec.state == ScanState::Running)
            .map(|(h, _)| h)
            .collect();
        for h in handles {
            self.scans.pool.get_mut(h).last_hb_ms = now;
        }
    }

    /// Start streaming a fragment to a joining node: claim the reserved
    /// scan record, open a hash-index cursor, and pump rows out under the
    /// word-credit window.
    pub(crate) fn handle_copy_frag_req(&mut self, req: CopyFragReq) {
        let Some(frag_h) = self.frags.find(req.table, req.fragment) else {
            tracing::warn!(table = req.table, frag = req.fragment, "copy of unknown fragment");
            return;
        };
        if !self.scans.can_seize(true) {
            tracing::warn!("no scan record for a fragment copy");
            return;
        }
        let h = self.scans.pool.seize().expect("reserved copy slot");
        {
            let rec = self.scans.pool.get_mut(h);
            rec.client_ref = Some(req.sender_ref);
            rec.transid = req.transid;
            rec.table = req.table;
            rec.fragment = req.fragment;
            rec.copy = true;
            rec.copy_dest = Some(req.dest_node);
            rec.state = ScanState::Running;
        }
        self.frags.pool.get_mut(frag_h).copy_dest = Some(req.dest_node);
        tracing::info!(
            table = req.table,
            fragment = req.fragment,
            dest = ?req.dest_node,
            "fragment copy started"
        );
        self.acc
            .scan_req(h.0, req.table, req.fragment, &mut self.inbox);
    }

    /// The hash index opened the copy cursor; fetch the first row.
    pub(crate) fn handle_acc_scan_conf(&mut self, conf: AccScanConf) {
        let h = ScanH(conf.scan_op);
        if !self.scans.pool.is_busy(h) || !self.scans.pool.get(h).copy {
            tracing::warn!(scan = conf.scan_op, "scan CONF without a copy scan; discarded");
            return;
        }
        self.scans.pool.get_mut(h).cursor = Some(conf.cursor);
        self.copy_fetch_next(h);
    }

    fn copy_fetch_next(&mut self, h: ScanH) {
        let cursor = self
            .scans
            .pool
            .get(h)
            .cursor
            .expect("copy stream without a cursor");
        self.acc.next_scan_req(cursor, h.0, &mut self.inbox);
    }

    /// One row back from the cursor, or the end of the fragment.
    pub(crate) fn handle_next_scan_conf(&mut self, conf: NextScanConf) {
        let h = ScanH(conf.scan_op);
        if !self.scans.pool.is_busy(h) || !self.scans.pool.get(h).copy {
            tracing::warn!(scan = conf.scan_op, "next-scan CONF without a copy scan; discarded");
            return;
        }
        match conf.row {
            Some(row) => self.copy_send_row(h, row),
            None => {
                // Cursor exhausted; completion waits for in-flight acks.
                if self.scans.pool.get(h).words_outstanding == 0 {
                    self.copy_finish(h);
                } else {
                    self.scans.pool.get_mut(h).state = ScanState::CopyDraining;
                }
            }
        }
    }

    /// Ships one row if the window admits it; otherwise parks the row
    /// until `handle_copy_key_conf` credits words back.
    fn copy_send_row(&mut self, h: ScanH, row: ScanRowRef) {
        let (table, fragment) = {
            let rec = self.scans.pool.get(h);
            (rec.table, rec.fragment)
        };
        let attr = self
            .tup
            .read_row(table, fragment, row.local_key)
            .unwrap_or_default();
        let words = (row.key.len() + attr.len()) as u32;
        if !self.copy_credit_consume(h, words) {
            let rec = self.scans.pool.get_mut(h);
            rec.state = ScanState::CopyPaused;
            rec.pending_row = Some(row);
            return;
        }
        self.copy_emit(h, row, attr);
        self.copy_fetch_next(h);
    }

    /// The destination installs the row through its normal write path: a
    /// copy write commits at prepare, and a fragment in active creation
    /// forgives forward references.
    fn copy_emit(&mut self, h: ScanH, row: ScanRowRef, attr: Vec<u32>) {
        let (table, fragment, transid, dest) = {
            let rec = self.scans.pool.get(h);
            (
                rec.table,
                rec.fragment,
                rec.transid,
                rec.copy_dest.expect("copy stream without a destination"),
            )
        };
        let schema_version = self
            .frags
            .table(table)
            .map(|t| self.frags.tables.get(t).schema_version)
            .unwrap_or(0);
        let own = BlockRef::new(self.own_node, Block::Lqh);
        let req = KeyReq {
            client_ref: own,
            client_op: h.0,
            tc_ref: own,
            tc_op: h.0,
            table,
            schema_version,
            fragment,
            transid,
            op: OpKind::Write,
            lock: LockMode::Exclusive,
            flags: KeyReqFlags::COPY | KeyReqFlags::DIRTY,
            seq_no_replica: 0,
            last_replica_no: 0,
            next_replica: None,
            node_after_next: [None; 2],
            prev_node: None,
            hash: row.local_key,
            gci: self.newest_gci,
            key_len: row.key.len() as u32,
            attr_len: attr.len() as u32,
            key: row.key,
            attr,
        };
        self.send_to_block(dest, Block::Lqh, Signal::KeyReq(req));
    }

    /// Claims window credit before a row goes out; false tells the row
    /// pump to pause until acknowledgements return credit.
    pub fn copy_credit_consume(&mut self, h: ScanH, words: u32) -> bool {
        let rec = self.scans.pool.get_mut(h);
        if rec.words_outstanding + words > MAX_WORDS_OUTSTANDING_COPY {
            return false;
        }
        rec.words_outstanding += words;
        rec.rows_copied += 1;
        true
    }

    /// The destination acknowledges a copied row with a synthesized
    /// KeyConf whose transid[0] slot carries the credited word count.
    /// The overload is deliberate and wire-compatible; do not move it.
    /// Returned credit restarts a paused stream or closes a draining one.
    pub(crate) fn handle_copy_key_conf(&mut self, conf: KeyConf) {
        let credited_words = conf.transid[0];
        let copy_scan = self
            .scans
            .pool
            .iter_busy()
            .find(|(_, rec)| rec.copy && rec.transid[1] == conf.transid[1])
            .map(|(h, _)| h);
        let Some(h) = copy_scan else {
            tracing::warn!("key CONF without a matching copy scan; discarded");
            return;
        };
        let state = {
            let rec = self.scans.pool.get_mut(h);
            rec.words_outstanding = rec.words_outstanding.saturating_sub(credited_words);
            rec.state
        };
        match state {
            ScanState::CopyPaused => {
                if let Some(row) = self.scans.pool.get_mut(h).pending_row.take() {
                    self.scans.pool.get_mut(h).state = ScanState::Running;
                    self.copy_send_row(h, row);
                }
            }
            ScanState::CopyDraining => {
                if self.scans.pool.get(h).words_outstanding == 0 {
                    self.copy_finish(h);
                }
            }
            _ => {}
        }
    }

    /// Every row shipped and acknowledged: report and tear down.
    fn copy_finish(&mut self, h: ScanH) {
        let (client, table, fragment, rows) = {
            let rec = self.scans.pool.get(h);
            (rec.client_ref, rec.table, rec.fragment, rec.rows_copied)
        };
        tracing::info!(table, fragment, rows, "fragment copy complete");
        if let Some(client) = client {
            self.send(
                client,
                Signal::CopyFragConf(CopyFragConf {
                    table,
                    fragment,
                    rows_copied: rows,
                }),
            );
        }
        self.close_scan(h, false);
    }

    pub(crate) fn handle_copy_key_ref(&mut self, r: KeyRef) {
        // A refused copy row aborts the whole stream.
        let copy_scan = self
            .scans
            .pool
            .iter_busy()
            .find(|(_, rec)| rec.copy && rec.transid[1] == r.transid[1])
            .map(|(h, _)| h);
        if let Some(h) = copy_scan {
            tracing::warn!(scan = ?h, code = r.code, "fragment copy refused by destination");
            self.close_scan(h, false);
        }
    }

    /// The placement manager declares the copied fragment live: normal
    /// logging resumes and write errors stop being forgiven.
    pub(crate) fn handle_copy_active_req(&mut self, req: CopyActiveReq) {
        let Some(frag_h) = self.frags.find(req.table, req.fragment) else {
            tracing::warn!(table = req.table, "copy-active for unknown fragment");
            return;
        };
        {
            let frag = self.frags.pool.get_mut(frag_h);
            frag.status = FragStatus::Active;
            frag.copy_dest = None;
        }
        // Wait for in-flight transactions that predate activation.
        let pending = self
            .ops
            .pool
            .iter_busy()
            .filter(|(_, op)| {
                op.frag == Some(frag_h.0)
                    && matches!(
                        op.state,
                        TransactionState::Prepared | TransactionState::PreparedReceivedCommit
                    )
            })
            .count() as u32;
        self.frags.pool.get_mut(frag_h).active_tc_counter = pending;
        self.send(
            req.sender_ref,
            Signal::CopyActiveConf(CopyActiveConf {
                table: req.table,
                fragment: req.fragment,
            }),
        );
    }
}
