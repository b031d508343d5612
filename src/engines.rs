//! Seams to the local storage engines.
//!
//! The hash index (primary-key lookup), row store (tuples) and ordered
//! index are separate blocks in the node. Calls into them are direct;
//! whenever the protocol needs a wait state on our side, the engine
//! answers through the inbox instead of a return value.
//!
//! The `Mem*` implementations back tests and diskless deployments with
//! plain in-memory maps; `manual` mode parks requests so a test can decide
//! when (and how) each one is answered.

use hashbrown::HashMap;

use crate::error::codes;
use crate::signal::{
    AccAbortConf, AccKeyConf, AccKeyRef, AccLcpConf, AccLcpFragIdConf, AccLcpStarted, AccScanConf,
    EndLcpConf, EngineBlock, Inbox, LcpHoldOpConf, LockMode, NextScanConf, OpKind, ScanRowRef,
    Signal, TransId, TupKeyConf, TupKeyRef, TupLcpConf, TupLcpStarted, TupPrepLcpConf,
};

#[derive(Debug, Clone)]
pub struct AccKeyReq {
    /// Our op-record index, echoed in the reply.
    pub op: u32,
    /// Engine context seized for this op.
    pub acc_ptr: u32,
    pub table: u32,
    pub fragment: u32,
    pub kind: OpKind,
    pub lock: LockMode,
    pub transid: TransId,
    pub hash: u32,
    pub key: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct TupKeyReq {
    pub op: u32,
    pub tup_ptr: u32,
    pub table: u32,
    pub fragment: u32,
    pub kind: OpKind,
    /// Row reference produced by the hash index.
    pub local_key: u32,
    pub attr: Vec<u32>,
}

pub trait HashIndex {
    fn seize(&mut self) -> u32;
    fn release(&mut self, acc_ptr: u32);
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32>;
    fn drop_fragment(&mut self, table: u32, fragment: u32);
    /// Answers AccKeyConf or AccKeyRef.
    fn key_req(&mut self, req: AccKeyReq, inbox: &mut Inbox);
    fn commit(&mut self, acc_ptr: u32);
    /// Answers AccAbortConf.
    fn abort(&mut self, op: u32, acc_ptr: u32, inbox: &mut Inbox);
    /// Answers AccLcpFragIdConf.
    fn lcp_frag_id(&mut self, lcp: u32, table: u32, fragment: u32, inbox: &mut Inbox);
    /// Parks up to `max` queued ops on the fragment in the hold buffer.
    /// Answers LcpHoldOpConf with the parked op indices.
    fn lcp_hold_ops(&mut self, lcp: u32, table: u32, fragment: u32, max: u32, inbox: &mut Inbox);
    /// Answers AccLcpStarted when writers may resume, then AccLcpConf when
    /// the checkpoint data is durable.
    fn lcp_start(&mut self, lcp: u32, acc_frag: u32, inbox: &mut Inbox);
    /// Resumes one op parked by `lcp_hold_ops`.
    fn cont_op(&mut self, acc_ptr: u32, inbox: &mut Inbox);
    /// Answers EndLcpConf { block: Acc }.
    fn end_lcp(&mut self, inbox: &mut Inbox);
    /// Opens a cursor over a fragment's rows, for fragment copy.
    /// Answers AccScanConf.
    fn scan_req(&mut self, scan_op: u32, table: u32, fragment: u32, inbox: &mut Inbox);
    /// Fetches the row behind the cursor. Answers NextScanConf, with no
    /// row once the cursor is exhausted.
    fn next_scan_req(&mut self, cursor: u32, scan_op: u32, inbox: &mut Inbox);
    fn scan_release(&mut self, cursor: u32);
    /// Restores the fragment's checkpoint image during restart.
    fn start_recovery(&mut self, table: u32, fragment: u32, lcp_id: u32);
}

pub trait RowStore {
    fn seize(&mut self) -> u32;
    fn release(&mut self, tup_ptr: u32);
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32>;
    fn drop_fragment(&mut self, table: u32, fragment: u32);
    /// Answers TupKeyConf or TupKeyRef.
    fn key_req(&mut self, req: TupKeyReq, inbox: &mut Inbox);
    fn commit(&mut self, tup_ptr: u32);
    fn abort(&mut self, tup_ptr: u32);
    /// Committed row content behind a hash-index reference; direct call,
    /// used when streaming a fragment to a joining node.
    fn read_row(&self, table: u32, fragment: u32, local_key: u32) -> Option<Vec<u32>>;
    /// Answers TupPrepLcpConf.
    fn prep_lcp(&mut self, lcp: u32, table: u32, fragment: u32, inbox: &mut Inbox);
    /// Answers TupLcpStarted then TupLcpConf.
    fn lcp_start(&mut self, lcp: u32, tup_frag: u32, inbox: &mut Inbox);
    /// Answers EndLcpConf { block: Tup }.
    fn end_lcp(&mut self, inbox: &mut Inbox);
    fn start_recovery(&mut self, table: u32, fragment: u32, lcp_id: u32);
}

pub trait OrderedIndex {
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32>;
    fn add_attrs(&mut self, table: u32, count: u32) -> Result<(), u32>;
    fn drop_fragment(&mut self, table: u32, fragment: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingVerdict {
    InsertNew { local_key: u32 },
    Delete { local_key: u32 },
    Touch { local_key: u32 },
}

#[derive(Debug, Default)]
struct AccContext {
    pending: Option<(u32, u32, PendingVerdict)>,
}

/// A scan cursor: a stable snapshot of the fragment's rows.
#[derive(Debug, Default)]
struct AccCursor {
    rows: Vec<ScanRowRef>,
    pos: usize,
}

/// In-memory hash index.
#[derive(Default)]
pub struct MemAcc {
    frags: HashMap<(u32, u32), HashMap<Vec<u32>, u32>>,
    contexts: HashMap<u32, AccContext>,
    undo_keys: HashMap<u32, Vec<u32>>,
    cursors: HashMap<u32, AccCursor>,
    next_cursor: u32,
    next_ctx: u32,
    next_local_key: u32,
    next_frag: u32,
    /// When set, key requests park in `parked` until the test replies.
    pub manual: bool,
    pub parked: Vec<AccKeyReq>,
    /// Op indices handed out on the next hold-op request.
    pub hold_queue: Vec<u32>,
}

impl MemAcc {
    pub fn new() -> Self {
        Self {
            next_ctx: 1,
            next_local_key: 1,
            next_frag: 1,
            ..Default::default()
        }
    }

    pub fn answer_parked(&mut self, inbox: &mut Inbox) {
        let parked = std::mem::take(&mut self.parked);
        for req in parked {
            self.execute(req, inbox);
        }
    }

    fn execute(&mut self, req: AccKeyReq, inbox: &mut Inbox) {
        let frag = self.frags.entry((req.table, req.fragment)).or_default();
        let existing = frag.get(&req.key).copied();
        let verdict = match (req.kind, existing) {
            (OpKind::Insert, Some(_)) => {
                inbox.push(Signal::AccKeyRef(AccKeyRef {
                    op: req.op,
                    code: codes::TUPLE_ALREADY_EXIST,
                }));
                return;
            }
            (OpKind::Insert, None) | (OpKind::Write, None) => {
                let local_key = self.next_local_key;
                self.next_local_key += 1;
                frag.insert(req.key.clone(), local_key);
                PendingVerdict::InsertNew { local_key }
            }
            (OpKind::Delete, Some(local_key)) => PendingVerdict::Delete { local_key },
            (_, Some(local_key)) => PendingVerdict::Touch { local_key },
            (_, None) => {
                inbox.push(Signal::AccKeyRef(AccKeyRef {
                    op: req.op,
                    code: codes::NO_TUPLE_FOUND,
                }));
                return;
            }
        };
        let local_key = match verdict {
            PendingVerdict::InsertNew { local_key }
            | PendingVerdict::Delete { local_key }
            | PendingVerdict::Touch { local_key } => local_key,
        };
        self.contexts.entry(req.acc_ptr).or_default().pending =
            Some((req.table, req.fragment, verdict));
        // Remember the key so an abort can undo a provisional insert.
        if let PendingVerdict::InsertNew { .. } = verdict {
            self.undo_keys.insert(req.acc_ptr, req.key);
        }
        inbox.push(Signal::AccKeyConf(AccKeyConf {
            op: req.op,
            local_key,
            read_len: 0,
        }));
    }
}

impl HashIndex for MemAcc {
    fn seize(&mut self) -> u32 {
        let id = self.next_ctx;
        self.next_ctx += 1;
        self.contexts.insert(id, AccContext::default());
        id
    }

    fn release(&mut self, acc_ptr: u32) {
        self.contexts.remove(&acc_ptr);
        self.undo_keys.remove(&acc_ptr);
    }

    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32> {
        self.frags.entry((table, fragment)).or_default();
        let id = self.next_frag;
        self.next_frag += 1;
        Ok(id)
    }

    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.frags.remove(&(table, fragment));
    }

    fn key_req(&mut self, req: AccKeyReq, inbox: &mut Inbox) {
        if self.manual {
            self.parked.push(req);
            return;
        }
        self.execute(req, inbox);
    }

    fn commit(&mut self, acc_ptr: u32) {
        let pending = match self.contexts.get_mut(&acc_ptr) {
            Some(ctx) => ctx.pending.take(),
            None => return,
        };
        if let Some((table, fragment, PendingVerdict::Delete { local_key })) = pending {
            if let Some(frag) = self.frags.get_mut(&(table, fragment)) {
                frag.retain(|_, lk| *lk != local_key);
            }
        }
        self.undo_keys.remove(&acc_ptr);
    }

    fn abort(&mut self, op: u32, acc_ptr: u32, inbox: &mut Inbox) {
        let pending = match self.contexts.get_mut(&acc_ptr) {
            Some(ctx) => ctx.pending.take(),
            None => None,
        };
        if let Some((table, fragment, PendingVerdict::InsertNew { .. })) = pending {
            if let Some(key) = self.undo_keys.remove(&acc_ptr) {
                if let Some(frag) = self.frags.get_mut(&(table, fragment)) {
                    frag.remove(&key);
                }
            }
        }
        inbox.push(Signal::AccAbortConf(AccAbortConf { op }));
    }

    fn lcp_frag_id(&mut self, lcp: u32, _table: u32, _fragment: u32, inbox: &mut Inbox) {
        let acc_frag = self.next_frag;
        inbox.push(Signal::AccLcpFragIdConf(AccLcpFragIdConf { lcp, acc_frag }));
    }

    fn lcp_hold_ops(&mut self, lcp: u32, _table: u32, _fragment: u32, max: u32, inbox: &mut Inbox) {
        let take = (max as usize).min(self.hold_queue.len());
        let held: Vec<u32> = self.hold_queue.drain(..take).collect();
        let more = !self.hold_queue.is_empty();
        inbox.push(Signal::LcpHoldOpConf(LcpHoldOpConf { lcp, held, more }));
    }

    fn lcp_start(&mut self, lcp: u32, _acc_frag: u32, inbox: &mut Inbox) {
        inbox.push(Signal::AccLcpStarted(AccLcpStarted { lcp }));
        inbox.push(Signal::AccLcpConf(AccLcpConf { lcp }));
    }

    fn cont_op(&mut self, _acc_ptr: u32, _inbox: &mut Inbox) {}

    fn end_lcp(&mut self, inbox: &mut Inbox) {
        inbox.push(Signal::EndLcpConf(EndLcpConf {
            block: EngineBlock::Acc,
        }));
    }

    fn scan_req(&mut self, scan_op: u32, table: u32, fragment: u32, inbox: &mut Inbox) {
        let mut rows: Vec<ScanRowRef> = self
            .frags
            .get(&(table, fragment))
            .map(|frag| {
                frag.iter()
                    .map(|(key, &local_key)| ScanRowRef {
                        key: key.clone(),
                        local_key,
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| r.local_key);
        self.next_cursor += 1;
        let cursor = self.next_cursor;
        self.cursors.insert(cursor, AccCursor { rows, pos: 0 });
        inbox.push(Signal::AccScanConf(AccScanConf { scan_op, cursor }));
    }

    fn next_scan_req(&mut self, cursor: u32, scan_op: u32, inbox: &mut Inbox) {
        let row = self.cursors.get_mut(&cursor).and_then(|c| {
            let row = c.rows.get(c.pos).cloned();
            c.pos += 1;
            row
        });
        inbox.push(Signal::NextScanConf(NextScanConf { scan_op, row }));
    }

    fn scan_release(&mut self, cursor: u32) {
        self.cursors.remove(&cursor);
    }

    fn start_recovery(&mut self, table: u32, fragment: u32, _lcp_id: u32) {
        self.frags.entry((table, fragment)).or_default();
    }
}

#[derive(Debug, Default)]
struct TupContext {
    pending: Option<TupPending>,
}

#[derive(Debug, Clone)]
enum TupPending {
    Write {
        table: u32,
        fragment: u32,
        local_key: u32,
        attr: Vec<u32>,
    },
    Delete {
        table: u32,
        fragment: u32,
        local_key: u32,
    },
}

/// In-memory row store.
#[derive(Default)]
pub struct MemTup {
    rows: HashMap<(u32, u32, u32), Vec<u32>>,
    contexts: HashMap<u32, TupContext>,
    next_ctx: u32,
    next_frag: u32,
    pub manual: bool,
    pub parked: Vec<TupKeyReq>,
}

impl MemTup {
    pub fn new() -> Self {
        Self {
            next_ctx: 1,
            next_frag: 1,
            ..Default::default()
        }
    }

    pub fn row(&self, table: u32, fragment: u32, local_key: u32) -> Option<&Vec<u32>> {
        self.rows.get(&(table, fragment, local_key))
    }

    pub fn row_count(&self, table: u32, fragment: u32) -> usize {
        self.rows
            .keys()
            .filter(|(t, f, _)| *t == table && *f == fragment)
            .count()
    }

    pub fn answer_parked(&mut self, inbox: &mut Inbox) {
        let parked = std::mem::take(&mut self.parked);
        for req in parked {
            self.execute(req, inbox);
        }
    }

    fn execute(&mut self, req: TupKeyReq, inbox: &mut Inbox) {
        let ctx = self.contexts.entry(req.tup_ptr).or_default();
        match req.kind {
            OpKind::Read => {
                let len = self
                    .rows
                    .get(&(req.table, req.fragment, req.local_key))
                    .map(|r| r.len() as u32)
                    .unwrap_or(0);
                inbox.push(Signal::TupKeyConf(TupKeyConf {
                    op: req.op,
                    read_len: len,
                }));
            }
            OpKind::Insert | OpKind::Update | OpKind::Write => {
                ctx.pending = Some(TupPending::Write {
                    table: req.table,
                    fragment: req.fragment,
                    local_key: req.local_key,
                    attr: req.attr,
                });
                inbox.push(Signal::TupKeyConf(TupKeyConf {
                    op: req.op,
                    read_len: 0,
                }));
            }
            OpKind::Delete => {
                ctx.pending = Some(TupPending::Delete {
                    table: req.table,
                    fragment: req.fragment,
                    local_key: req.local_key,
                });
                inbox.push(Signal::TupKeyConf(TupKeyConf {
                    op: req.op,
                    read_len: 0,
                }));
            }
        }
    }
}

impl RowStore for MemTup {
    fn seize(&mut self) -> u32 {
        let id = self.next_ctx;
        self.next_ctx += 1;
        self.contexts.insert(id, TupContext::default());
        id
    }

    fn release(&mut self, tup_ptr: u32) {
        self.contexts.remove(&tup_ptr);
    }

    fn add_fragment(&mut self, _table: u32, _fragment: u32) -> Result<u32, u32> {
        let id = self.next_frag;
        self.next_frag += 1;
        Ok(id)
    }

    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.rows.retain(|(t, f, _), _| !(*t == table && *f == fragment));
    }

    fn key_req(&mut self, req: TupKeyReq, inbox: &mut Inbox) {
        if self.manual {
            self.parked.push(req);
            return;
        }
        self.execute(req, inbox);
    }

    fn commit(&mut self, tup_ptr: u32) {
        let Some(ctx) = self.contexts.get_mut(&tup_ptr) else {
            return;
        };
        match ctx.pending.take() {
            Some(TupPending::Write {
                table,
                fragment,
                local_key,
                attr,
            }) => {
                self.rows.insert((table, fragment, local_key), attr);
            }
            Some(TupPending::Delete {
                table,
                fragment,
                local_key,
            }) => {
                self.rows.remove(&(table, fragment, local_key));
            }
            None => {}
        }
    }

    fn abort(&mut self, tup_ptr: u32) {
        if let Some(ctx) = self.contexts.get_mut(&tup_ptr) {
            ctx.pending = None;
        }
    }

    fn read_row(&self, table: u32, fragment: u32, local_key: u32) -> Option<Vec<u32>> {
        self.rows.get(&(table, fragment, local_key)).cloned()
    }

    fn prep_lcp(&mut self, lcp: u32, _table: u32, _fragment: u32, inbox: &mut Inbox) {
        inbox.push(Signal::TupPrepLcpConf(TupPrepLcpConf { lcp }));
    }

    fn lcp_start(&mut self, lcp: u32, _tup_frag: u32, inbox: &mut Inbox) {
        inbox.push(Signal::TupLcpStarted(TupLcpStarted { lcp }));
        inbox.push(Signal::TupLcpConf(TupLcpConf { lcp }));
    }

    fn end_lcp(&mut self, inbox: &mut Inbox) {
        inbox.push(Signal::EndLcpConf(EndLcpConf {
            block: EngineBlock::Tup,
        }));
    }

    fn start_recovery(&mut self, _table: u32, _fragment: u32, _lcp_id: u32) {}
}

/// In-memory ordered index; only the fragment lifecycle matters here.
#[derive(Default)]
pub struct MemTux {
    frags: HashMap<(u32, u32), u32>,
    next_frag: u32,
}

impl MemTux {
    pub fn new() -> Self {
        Self {
            next_frag: 1,
            ..Default::default()
        }
    }
}

impl OrderedIndex for MemTux {
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32> {
        let id = self.next_frag;
        self.next_frag += 1;
        self.frags.insert((table, fragment), id);
        Ok(id)
    }

    fn add_attrs(&mut self, _table: u32, _count: u32) -> Result<(), u32> {
        Ok(())
    }

    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.frags.remove(&(table, fragment));
    }
}
