//! Table and fragment registries.
//!
//! A fragment record carries the checkpoint bookkeeping, the list of ops
//! currently inside the storage engines, the wait queue that fills while
//! an LCP blocks the fragment, and the scan-number mask. Tables add the
//! drop state machine gated on a usage count.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::config::Config;
use crate::error::codes;
use crate::node::Lqh;
use crate::ops::{ListState, OpH, Ops};
use crate::pool::Pool;
use crate::signal::{
    AddAttrReq, AddFragConf, AddFragRef, AddFragReq, BlockRef, ContinueB, NodeId, Signal,
    AddAttrConf, DropTabReq, PrepDropTabReq, WaitDropTabReq,
};

crate::define_handle!(FragH);
crate::define_handle!(TabH);

/// Scan-number ranges inside the per-fragment mask.
pub const SCAN_NR_NORMAL: std::ops::RangeInclusive<u32> = 1..=11;
pub const SCAN_NR_INDEX: std::ops::RangeInclusive<u32> = 12..=42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableStatus {
    #[default]
    NotDefined,
    AddTableOngoing,
    TableDefined,
    PrepDropTableOngoing,
    PrepDropTableDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragStatus {
    #[default]
    Defined,
    Active,
    /// An LCP is starting; new prepares park on the wait queue.
    Blocked,
    /// Being filled by copy from a live replica; storage-engine "row not
    /// found" and "row exists" verdicts are tolerated.
    ActiveCreation,
    /// Target of system-restart replay.
    CrashRecovering,
    Removing,
}

#[derive(Default)]
pub struct Table {
    pub table_id: u32,
    pub schema_version: u32,
    pub status: TableStatus,
    /// Ops currently referencing the table; gates the drop protocol.
    pub usage_count: u32,
    pub fragments: Vec<FragH>,
    pub attr_count: u32,
    pub waiting_dropper: Option<BlockRef>,
}

#[derive(Default)]
pub struct Fragment {
    pub table: u32,
    pub fragment: u32,
    pub status: FragStatus,
    pub logged: bool,
    pub acc_frag: u32,
    pub tup_frag: u32,
    pub tux_frag: u32,
    pub newest_gci: u32,
    /// Local checkpoint bookkeeping.
    pub next_lcp: u32,
    pub lcp_ids: [u32; 3],
    pub max_gci_in_lcp: u32,
    pub max_gci_completed_in_lcp: u32,
    pub lcp_flag: bool,
    /// Copy-active bring-up: transactions that must drain before the
    /// fragment reports fully active to the coordinator side.
    pub active_tc_counter: u32,
    pub active_list: Option<OpH>,
    pub active_count: u32,
    pub wait_queue_first: Option<OpH>,
    pub wait_queue_last: Option<OpH>,
    pub acc_blocked_list: Option<OpH>,
    pub scan_mask: u64,
    pub queued_scans: VecDeque<u32>,
    /// Restart replay range and the per-phase log owners.
    pub start_gci: u32,
    pub last_gci: u32,
    pub log_nodes: Vec<NodeId>,
    pub copy_dest: Option<NodeId>,
}

pub struct Fragments {
    pub tables: Pool<TabH, Table>,
    pub table_map: HashMap<u32, TabH>,
    pub pool: Pool<FragH, Fragment>,
    pub frag_map: HashMap<(u32, u32), FragH>,
}

impl Fragments {
    pub fn new(cfg: &Config) -> Self {
        Self {
            tables: Pool::new(cfg.table_records),
            table_map: HashMap::new(),
            pool: Pool::new(cfg.fragment_records),
            frag_map: HashMap::new(),
        }
    }

    pub fn table(&self, table_id: u32) -> Option<TabH> {
        self.table_map.get(&table_id).copied()
    }

    pub fn find(&self, table_id: u32, fragment: u32) -> Option<FragH> {
        self.frag_map.get(&(table_id, fragment)).copied()
    }

    /// Puts an op on the fragment's active list (it is entering the
    /// storage engines).
    pub fn link_active(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) {
        let head = self.pool.get(frag_h).active_list;
        if let Some(old) = head {
            ops.pool.get_mut(old).prev_list = Some(op_h);
        }
        {
            let op = ops.pool.get_mut(op_h);
            assert_eq!(op.list_state, ListState::NotInList);
            op.list_state = ListState::InActiveList;
            op.next_list = head;
            op.prev_list = None;
        }
        let frag = self.pool.get_mut(frag_h);
        frag.active_list = Some(op_h);
        frag.active_count += 1;
    }

    /// Takes an op off the active list; true when the list drained.
    pub fn unlink_active(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) -> bool {
        let (prev, next) = {
            let op = ops.pool.get_mut(op_h);
            assert_eq!(op.list_state, ListState::InActiveList);
            op.list_state = ListState::NotInList;
            (op.prev_list.take(), op.next_list.take())
        };
        match prev {
            Some(p) => ops.pool.get_mut(p).next_list = next,
            None => self.pool.get_mut(frag_h).active_list = next,
        }
        if let Some(n) = next {
            ops.pool.get_mut(n).prev_list = prev;
        }
        let frag = self.pool.get_mut(frag_h);
        frag.active_count -= 1;
        frag.active_count == 0
    }

    /// Parks a newly arrived prepare while the fragment is blocked.
    pub fn enqueue_wait(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) {
        {
            let op = ops.pool.get_mut(op_h);
            assert_eq!(op.list_state, ListState::NotInList);
            op.list_state = ListState::InWaitQueue;
            op.next_list = None;
            op.prev_list = None;
        }
        let frag = self.pool.get_mut(frag_h);
        match frag.wait_queue_last {
            Some(last) => {
                ops.pool.get_mut(last).next_list = Some(op_h);
                ops.pool.get_mut(op_h).prev_list = Some(last);
                self.pool.get_mut(frag_h).wait_queue_last = Some(op_h);
            }
            None => {
                frag.wait_queue_first = Some(op_h);
                frag.wait_queue_last = Some(op_h);
            }
        }
    }

    pub fn dequeue_wait(&mut self, ops: &mut Ops, frag_h: FragH) -> Option<OpH> {
        let first = self.pool.get(frag_h).wait_queue_first?;
        let next = {
            let op = ops.pool.get_mut(first);
            op.list_state = ListState::NotInList;
            op.prev_list = None;
            op.next_list.take()
        };
        let frag = self.pool.get_mut(frag_h);
        frag.wait_queue_first = next;
        match next {
            Some(n) => ops.pool.get_mut(n).prev_list = None,
            None => frag.wait_queue_last = None,
        }
        Some(first)
    }

    /// Removes a specific op from the wait queue (abort, takeover).
    pub fn remove_from_wait(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) {
        let (prev, next) = {
            let op = ops.pool.get_mut(op_h);
            assert_eq!(op.list_state, ListState::InWaitQueue);
            op.list_state = ListState::NotInList;
            (op.prev_list.take(), op.next_list.take())
        };
        let frag = self.pool.get_mut(frag_h);
        match prev {
            Some(p) => ops.pool.get_mut(p).next_list = next,
            None => frag.wait_queue_first = next,
        }
        match next {
            Some(n) => ops.pool.get_mut(n).prev_list = prev,
            None => self.pool.get_mut(frag_h).wait_queue_last = prev,
        }
    }

    /// Ops the hash index parked during LCP hold, kept per fragment.
    pub fn link_acc_blocked(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) {
        let head = self.pool.get(frag_h).acc_blocked_list;
        {
            let op = ops.pool.get_mut(op_h);
            op.list_state = ListState::InAccBlockedList;
            op.next_list = head;
            op.prev_list = None;
        }
        if let Some(old) = head {
            ops.pool.get_mut(old).prev_list = Some(op_h);
        }
        self.pool.get_mut(frag_h).acc_blocked_list = Some(op_h);
    }

    /// Removes one op from the blocked list (abort before the hash index
    /// ever executed it).
    pub fn unlink_acc_blocked(&mut self, ops: &mut Ops, frag_h: FragH, op_h: OpH) {
        let (prev, next) = {
            let op = ops.pool.get_mut(op_h);
            assert_eq!(op.list_state, ListState::InAccBlockedList);
            op.list_state = ListState::NotInList;
            (op.prev_list.take(), op.next_list.take())
        };
        match prev {
            Some(p) => ops.pool.get_mut(p).next_list = next,
            None => self.pool.get_mut(frag_h).acc_blocked_list = next,
        }
        if let Some(n) = next {
            ops.pool.get_mut(n).prev_list = prev;
        }
    }

    pub fn drain_acc_blocked(&mut self, ops: &mut Ops, frag_h: FragH) -> Vec<OpH> {
        let mut out = Vec::new();
        let mut cur = self.pool.get_mut(frag_h).acc_blocked_list.take();
        while let Some(h) = cur {
            let op = ops.pool.get_mut(h);
            op.list_state = ListState::NotInList;
            op.prev_list = None;
            cur = op.next_list.take();
            out.push(h);
        }
        out
    }

    /// Allocates a scan number from the normal or index range.
    pub fn alloc_scan_number(&mut self, frag_h: FragH, ordered: bool) -> Option<u32> {
        let range = if ordered { SCAN_NR_INDEX } else { SCAN_NR_NORMAL };
        let frag = self.pool.get_mut(frag_h);
        for nr in range {
            if frag.scan_mask & (1u64 << nr) == 0 {
                frag.scan_mask |= 1u64 << nr;
                return Some(nr);
            }
        }
        None
    }

    pub fn release_scan_number(&mut self, frag_h: FragH, nr: u32) {
        let frag = self.pool.get_mut(frag_h);
        assert!(frag.scan_mask & (1u64 << nr) != 0);
        frag.scan_mask &= !(1u64 << nr);
    }
}

impl Lqh {
    pub(crate) fn handle_add_frag_req(&mut self, req: AddFragReq) {
        let tab_h = match self.frags.table(req.table) {
            Some(h) => h,
            None => match self.frags.tables.seize() {
                Some(h) => {
                    let table = self.frags.tables.get_mut(h);
                    table.table_id = req.table;
                    table.schema_version = req.schema_version;
                    table.status = TableStatus::AddTableOngoing;
                    self.frags.table_map.insert(req.table, h);
                    h
                }
                None => {
                    self.send(
                        req.sender_ref,
                        Signal::AddFragRef(AddFragRef {
                            table: req.table,
                            fragment: req.fragment,
                            code: codes::NO_FREE_FRAGMENT,
                        }),
                    );
                    return;
                }
            },
        };
        let Some(frag_h) = self.frags.pool.seize() else {
            self.send(
                req.sender_ref,
                Signal::AddFragRef(AddFragRef {
                    table: req.table,
                    fragment: req.fragment,
                    code: codes::NO_FREE_FRAGMENT,
                }),
            );
            return;
        };
        let acc_frag = match self.acc.add_fragment(req.table, req.fragment) {
            Ok(id) => id,
            Err(code) => {
                self.frags.pool.release(frag_h);
                self.send(
                    req.sender_ref,
                    Signal::AddFragRef(AddFragRef {
                        table: req.table,
                        fragment: req.fragment,
                        code,
                    }),
                );
                return;
            }
        };
        let tup_frag = self
            .tup
            .add_fragment(req.table, req.fragment)
            .expect("row store rejected a fragment the hash index accepted");
        let tux_frag = if req.ordered_index {
            self.tux
                .add_fragment(req.table, req.fragment)
                .expect("ordered index rejected a fragment")
        } else {
            0
        };
        {
            let frag = self.frags.pool.get_mut(frag_h);
            frag.table = req.table;
            frag.fragment = req.fragment;
            frag.logged = req.logged;
            frag.acc_frag = acc_frag;
            frag.tup_frag = tup_frag;
            frag.tux_frag = tux_frag;
            frag.status = if req.active_creation {
                FragStatus::ActiveCreation
            } else {
                FragStatus::Active
            };
            frag.next_lcp = 0;
            frag.lcp_ids = [0; 3];
        }
        self.frags.frag_map.insert((req.table, req.fragment), frag_h);
        let table = self.frags.tables.get_mut(tab_h);
        table.fragments.push(frag_h);
        table.status = TableStatus::TableDefined;
        table.schema_version = req.schema_version;
        self.send(
            req.sender_ref,
            Signal::AddFragConf(AddFragConf {
                table: req.table,
                fragment: req.fragment,
            }),
        );
    }

    pub(crate) fn handle_add_attr_req(&mut self, req: AddAttrReq) {
        let Some(tab_h) = self.frags.table(req.table) else {
            tracing::warn!(table = req.table, "attributes for an unknown table");
            return;
        };
        self.frags.tables.get_mut(tab_h).attr_count += req.attr_count;
        if self
            .tux
            .add_attrs(req.table, req.attr_count)
            .is_err()
        {
            tracing::warn!(table = req.table, "ordered index rejected attributes");
        }
        self.send(req.sender_ref, Signal::AddAttrConf(AddAttrConf { table: req.table }));
    }

    pub(crate) fn handle_prep_drop_tab_req(&mut self, req: PrepDropTabReq) {
        let Some(tab_h) = self.frags.table(req.table) else {
            tracing::warn!(table = req.table, "prep-drop for an unknown table");
            return;
        };
        self.frags.tables.get_mut(tab_h).status = TableStatus::PrepDropTableOngoing;
        self.send(req.sender_ref, Signal::PrepDropTabConf { table: req.table });
    }

    pub(crate) fn handle_wait_drop_tab_req(&mut self, req: WaitDropTabReq) {
        let Some(tab_h) = self.frags.table(req.table) else {
            tracing::warn!(table = req.table, "wait-drop for an unknown table");
            return;
        };
        self.frags.tables.get_mut(tab_h).waiting_dropper = Some(req.sender_ref);
        self.wait_drop_tab_check(req.table);
    }

    pub(crate) fn wait_drop_tab_check(&mut self, table: u32) {
        let Some(tab_h) = self.frags.table(table) else {
            return;
        };
        let (usage, waiter) = {
            let t = self.frags.tables.get(tab_h);
            (t.usage_count, t.waiting_dropper)
        };
        let Some(waiter) = waiter else { return };
        if usage == 0 {
            let t = self.frags.tables.get_mut(tab_h);
            t.status = TableStatus::PrepDropTableDone;
            t.waiting_dropper = None;
            self.send(waiter, Signal::WaitDropTabConf { table });
        } else {
            self.continue_b_delayed(100, ContinueB::WaitDropTab { table });
        }
    }

    pub(crate) fn handle_drop_tab_req(&mut self, req: DropTabReq) {
        let Some(tab_h) = self.frags.table(req.table) else {
            tracing::warn!(table = req.table, "drop for an unknown table");
            return;
        };
        let frag_handles = {
            let t = self.frags.tables.get(tab_h);
            assert_eq!(
                t.status,
                TableStatus::PrepDropTableDone,
                "drop of table {} before prep-drop finished",
                req.table
            );
            t.fragments.clone()
        };
        // An order queued against the dropping table finishes right away.
        self.lcp_note_table_dropped(req.table);
        for frag_h in frag_handles {
            let (table_id, fragment) = {
                let f = self.frags.pool.get_mut(frag_h);
                f.status = FragStatus::Removing;
                (f.table, f.fragment)
            };
            self.acc.drop_fragment(table_id, fragment);
            self.tup.drop_fragment(table_id, fragment);
            self.tux.drop_fragment(table_id, fragment);
            self.frags.frag_map.remove(&(table_id, fragment));
            self.frags.pool.release(frag_h);
        }
        self.frags.table_map.remove(&req.table);
        self.frags.tables.release(tab_h);
        self.send(req.sender_ref, Signal::DropTabConf { table: req.table });
    }

    pub(crate) fn table_usage_inc(&mut self, table: u32) {
        if let Some(h) = self.frags.table(table) {
            self.frags.tables.get_mut(h).usage_count += 1;
        }
    }

    pub(crate) fn table_usage_dec(&mut self, table: u32) {
        if let Some(h) = self.frags.table(table) {
            let t = self.frags.tables.get_mut(h);
            assert!(t.usage_count > 0, "usage count underflow on table {table}");
            t.usage_count -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup() -> (Fragments, Ops, FragH) {
        let cfg = Config::default();
        let mut frags = Fragments::new(&cfg);
        let ops = Ops::new(16, 16, 16, 4);
        let h = frags.pool.seize().unwrap();
        frags.frag_map.insert((1, 0), h);
        (frags, ops, h)
    }

    #[test]
    fn active_list_link_unlink() {
        let (mut frags, mut ops, frag) = setup();
        let a = ops.seize().unwrap();
        let b = ops.seize().unwrap();
        frags.link_active(&mut ops, frag, a);
        frags.link_active(&mut ops, frag, b);
        assert_eq!(frags.pool.get(frag).active_count, 2);
        assert!(!frags.unlink_active(&mut ops, frag, a));
        assert!(frags.unlink_active(&mut ops, frag, b));
        assert!(frags.pool.get(frag).active_list.is_none());
        // Relink restores membership, as the checkpoint restart path does.
        frags.link_active(&mut ops, frag, a);
        assert_eq!(frags.pool.get(frag).active_count, 1);
        assert_eq!(frags.pool.get(frag).active_list, Some(a));
    }

    #[test]
    fn wait_queue_is_fifo() {
        let (mut frags, mut ops, frag) = setup();
        let a = ops.seize().unwrap();
        let b = ops.seize().unwrap();
        let c = ops.seize().unwrap();
        frags.enqueue_wait(&mut ops, frag, a);
        frags.enqueue_wait(&mut ops, frag, b);
        frags.enqueue_wait(&mut ops, frag, c);
        frags.remove_from_wait(&mut ops, frag, b);
        assert_eq!(frags.dequeue_wait(&mut ops, frag), Some(a));
        assert_eq!(frags.dequeue_wait(&mut ops, frag), Some(c));
        assert_eq!(frags.dequeue_wait(&mut ops, frag), None);
    }

    #[test]
    fn scan_numbers_partitioned() {
        let (mut frags, _ops, frag) = setup();
        for expected in SCAN_NR_NORMAL {
            assert_eq!(frags.alloc_scan_number(frag, false), Some(expected));
        }
        assert_eq!(frags.alloc_scan_number(frag, false), None);
        assert_eq!(frags.alloc_scan_number(frag, true), Some(12));
        frags.release_scan_number(frag, 5);
        assert_eq!(frags.alloc_scan_number(frag, false), Some(5));
    }
}
