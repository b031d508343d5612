//! Operation records: the per-request unit of work, its transid hash, the
//! overflow buffers for long keys and attributes, and the commit-ack
//! marker table.

use hashbrown::HashMap;

use crate::error::codes;
use crate::log::PrepPosition;
use crate::pool::Pool;
use crate::signal::{BlockRef, KeyReqFlags, LockMode, NodeId, OpKind, TransId};

crate::define_handle!(OpH);
crate::define_handle!(BufH);
crate::define_handle!(MarkerH);

pub const TRANS_HASH_BUCKETS: usize = 1024;
pub const INLINE_KEY_WORDS: usize = 4;
pub const INLINE_ATTR_WORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    WaitAcc,
    WaitTup,
    WaitTupKeyInfo,
    WaitAttr,
    LogQueued,
    Prepared,
    PreparedReceivedCommit,
    LogCommitQueued,
    LogCommitQueuedWaitSignal,
    LogCommitWritten,
    LogCommitWrittenWaitSignal,
    CommitQueued,
    CommitStopped,
    Committed,
    LogAbortQueued,
    AbortQueued,
    AbortStopped,
    WaitAccAbort,
    WaitTupToAbort,
    WaitAiAfterAbort,
    /// Parked on a fragment wait queue while an LCP blocks the fragment.
    Stopped,
    Scan,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWriteState {
    #[default]
    NotStarted,
    /// This op never writes a prepare (read, unlogged fragment).
    NotWritten,
    Written,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortState {
    #[default]
    Idle,
    FromTc,
    FromLqh,
    /// Driven by a takeover coordinator after the original TC failed.
    NewFromTc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Disconnected,
    Connected,
    /// Replayed from the log during restart.
    LogConnected,
    /// Part of a fragment-copy stream.
    CopyConnected,
}

/// Exclusive list membership; an op sits in at most one place at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListState {
    #[default]
    NotInList,
    InTransHash,
    InActiveList,
    InWaitQueue,
    InLogQueue,
    InAccBlockedList,
}

/// A 4-word overflow segment for keys and attributes past the inline
/// words.
#[derive(Default)]
pub struct DataBuf {
    pub words: [u32; 4],
    pub used: u32,
    pub next: Option<BufH>,
}

/// Head of an overflow chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegBuf {
    pub first: Option<BufH>,
    pub last: Option<BufH>,
    pub len: u32,
}

pub struct Operation {
    pub state: TransactionState,
    pub log_write_state: LogWriteState,
    pub abort_state: AbortState,
    pub connect_state: ConnectState,
    pub list_state: ListState,
    pub client_ref: Option<BlockRef>,
    pub client_op: u32,
    pub tc_ref: Option<BlockRef>,
    pub tc_op: u32,
    pub table: u32,
    pub schema_version: u32,
    pub fragment: u32,
    /// Fragment-pool index once resolved.
    pub frag: Option<u32>,
    pub transid: TransId,
    pub op_kind: OpKind,
    pub lock: LockMode,
    pub flags: KeyReqFlags,
    pub seq_no_replica: u8,
    pub last_replica_no: u8,
    pub next_replica: Option<NodeId>,
    pub node_after_next: [Option<NodeId>; 2],
    /// Replica that forwarded this op; commit/complete travel back to it.
    pub prev_replica: Option<NodeId>,
    pub hash: u32,
    pub log_part: u32,
    pub gci: u32,
    pub key_len: u32,
    pub attr_len: u32,
    pub key_inline: [u32; INLINE_KEY_WORDS],
    pub attr_inline: [u32; INLINE_ATTR_WORDS],
    pub key_overflow: SegBuf,
    pub attr_overflow: SegBuf,
    /// Words of key/attr received so far, for the streaming states.
    pub key_received: u32,
    pub attr_received: u32,
    pub acc_ptr: u32,
    pub tup_ptr: u32,
    pub local_key: u32,
    pub read_len: u32,
    /// Storage-engine verdict forgiven on an active-creation fragment;
    /// the op commits as a no-op.
    pub noop: bool,
    /// Failure code carried to the refusal reply.
    pub error_code: u32,
    pub prep_pos: Option<PrepPosition>,
    /// GCI that arrived while the prepare log write was still queued.
    pub deferred_commit_gci: Option<u32>,
    /// Slow-path commit/complete/abort reply target.
    pub slow_reply: Option<(BlockRef, u32)>,
    /// Replay: the log part whose execution waits on this op.
    pub exec_sr_part: Option<u32>,
    pub tc_node_failed: Option<NodeId>,
    pub last_touch_ms: u64,
    pub next_hash: Option<OpH>,
    pub prev_hash: Option<OpH>,
    /// Links for whichever exclusive list the op currently sits in.
    pub next_list: Option<OpH>,
    pub prev_list: Option<OpH>,
}

impl Default for Operation {
    fn default() -> Self {
        Self {
            state: TransactionState::Idle,
            log_write_state: LogWriteState::NotStarted,
            abort_state: AbortState::Idle,
            connect_state: ConnectState::Disconnected,
            list_state: ListState::NotInList,
            client_ref: None,
            client_op: 0,
            tc_ref: None,
            tc_op: 0,
            table: 0,
            schema_version: 0,
            fragment: 0,
            frag: None,
            transid: [0; 2],
            op_kind: OpKind::Read,
            lock: LockMode::Read,
            flags: KeyReqFlags::empty(),
            seq_no_replica: 0,
            last_replica_no: 0,
            next_replica: None,
            node_after_next: [None; 2],
            prev_replica: None,
            hash: 0,
            log_part: 0,
            gci: 0,
            key_len: 0,
            attr_len: 0,
            key_inline: [0; INLINE_KEY_WORDS],
            attr_inline: [0; INLINE_ATTR_WORDS],
            key_overflow: SegBuf::default(),
            attr_overflow: SegBuf::default(),
            key_received: 0,
            attr_received: 0,
            acc_ptr: 0,
            tup_ptr: 0,
            local_key: 0,
            read_len: 0,
            noop: false,
            error_code: 0,
            prep_pos: None,
            deferred_commit_gci: None,
            slow_reply: None,
            exec_sr_part: None,
            tc_node_failed: None,
            last_touch_ms: 0,
            next_hash: None,
            prev_hash: None,
            next_list: None,
            prev_list: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Marker {
    pub transid: TransId,
    pub api_ref: Option<BlockRef>,
    pub api_op: u32,
    pub tc_node: NodeId,
    /// Insertion order, so a restarted takeover scan observes a stable
    /// sequence.
    pub order: u64,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            transid: [0; 2],
            api_ref: None,
            api_op: 0,
            tc_node: NodeId(0),
            order: 0,
        }
    }
}

pub struct Ops {
    pub pool: Pool<OpH, Operation>,
    hash: Vec<Option<OpH>>,
    pub bufs: Pool<BufH, DataBuf>,
    pub markers: Pool<MarkerH, Marker>,
    marker_map: HashMap<TransId, MarkerH>,
    marker_seq: u64,
}

fn bucket(transid: TransId, tc_op: u32) -> usize {
    ((transid[0] ^ tc_op) as usize) % TRANS_HASH_BUCKETS
}

impl Ops {
    pub fn new(op_records: u32, key_buffers: u32, attr_buffers: u32, marker_records: u32) -> Self {
        Self {
            pool: Pool::new(op_records),
            hash: vec![None; TRANS_HASH_BUCKETS],
            bufs: Pool::new(key_buffers + attr_buffers),
            markers: Pool::new(marker_records),
            marker_map: HashMap::new(),
            marker_seq: 0,
        }
    }

    pub fn seize(&mut self) -> Option<OpH> {
        self.pool.seize()
    }

    /// Returns a finished op to the pool. It must already be off every
    /// list; a record still linked anywhere is a state-machine bug.
    pub fn release(&mut self, h: OpH) {
        let op = self.pool.get_mut(h);
        assert_eq!(
            op.list_state,
            ListState::NotInList,
            "released op {h:?} still on a list"
        );
        let key_chain = op.key_overflow.first.take();
        let attr_chain = op.attr_overflow.first.take();
        self.release_chain(key_chain);
        self.release_chain(attr_chain);
        self.pool.release(h);
    }

    fn release_chain(&mut self, mut next: Option<BufH>) {
        while let Some(h) = next {
            next = self.bufs.get(h).next;
            self.bufs.release(h);
        }
    }

    pub fn hash_insert(&mut self, h: OpH) {
        let (transid, tc_op) = {
            let op = self.pool.get(h);
            (op.transid, op.tc_op)
        };
        let b = bucket(transid, tc_op);
        let head = self.hash[b];
        if let Some(old) = head {
            self.pool.get_mut(old).prev_hash = Some(h);
        }
        {
            let op = self.pool.get_mut(h);
            op.next_hash = head;
            op.prev_hash = None;
            op.list_state = ListState::InTransHash;
        }
        self.hash[b] = Some(h);
    }

    pub fn hash_remove(&mut self, h: OpH) {
        let (transid, tc_op, prev, next) = {
            let op = self.pool.get_mut(h);
            assert_eq!(op.list_state, ListState::InTransHash);
            op.list_state = ListState::NotInList;
            (op.transid, op.tc_op, op.prev_hash.take(), op.next_hash.take())
        };
        match prev {
            Some(p) => self.pool.get_mut(p).next_hash = next,
            None => self.hash[bucket(transid, tc_op)] = next,
        }
        if let Some(n) = next {
            self.pool.get_mut(n).prev_hash = prev;
        }
    }

    /// Looks up an in-flight op by coordinator identity. Stale signals
    /// miss here and are discarded with a warning by the caller.
    pub fn hash_find(&self, transid: TransId, tc_op: u32) -> Option<OpH> {
        let mut cur = self.hash[bucket(transid, tc_op)];
        while let Some(h) = cur {
            let op = self.pool.get(h);
            if op.transid == transid && op.tc_op == tc_op {
                return Some(h);
            }
            cur = op.next_hash;
        }
        None
    }

    /// Appends words to an overflow chain, 4 to a segment.
    pub fn append_overflow(&mut self, seg: &mut SegBuf, words: &[u32]) -> Result<(), u32> {
        for &w in words {
            let need_new = match seg.last {
                Some(last) => self.bufs.get(last).used == 4,
                None => true,
            };
            if need_new {
                let h = self.bufs.seize().ok_or(codes::NO_FREE_BUFFER)?;
                match seg.last {
                    Some(last) => self.bufs.get_mut(last).next = Some(h),
                    None => seg.first = Some(h),
                }
                seg.last = Some(h);
            }
            let last = seg.last.unwrap();
            let buf = self.bufs.get_mut(last);
            buf.words[buf.used as usize] = w;
            buf.used += 1;
            seg.len += 1;
        }
        Ok(())
    }

    pub fn collect_overflow(&self, seg: &SegBuf) -> Vec<u32> {
        let mut out = Vec::with_capacity(seg.len as usize);
        let mut cur = seg.first;
        while let Some(h) = cur {
            let buf = self.bufs.get(h);
            out.extend_from_slice(&buf.words[..buf.used as usize]);
            cur = buf.next;
        }
        out
    }

    /// The full key of an op: inline words then overflow.
    pub fn full_key(&self, h: OpH) -> Vec<u32> {
        let op = self.pool.get(h);
        let inline = (op.key_len as usize).min(INLINE_KEY_WORDS);
        let mut out = op.key_inline[..inline].to_vec();
        out.extend(self.collect_overflow(&op.key_overflow));
        out
    }

    pub fn full_attr(&self, h: OpH) -> Vec<u32> {
        let op = self.pool.get(h);
        let inline = (op.attr_len as usize).min(INLINE_ATTR_WORDS);
        let mut out = op.attr_inline[..inline].to_vec();
        out.extend(self.collect_overflow(&op.attr_overflow));
        out
    }

    pub fn insert_marker(
        &mut self,
        transid: TransId,
        api_ref: Option<BlockRef>,
        api_op: u32,
        tc_node: NodeId,
    ) -> Result<MarkerH, u32> {
        if self.marker_map.contains_key(&transid) {
            // The transaction already carries a marker; reuse it.
            return Ok(self.marker_map[&transid]);
        }
        let h = self.markers.seize().ok_or(codes::NO_FREE_MARKER)?;
        self.marker_seq += 1;
        let order = self.marker_seq;
        *self.markers.get_mut(h) = Marker {
            transid,
            api_ref,
            api_op,
            tc_node,
            order,
        };
        self.marker_map.insert(transid, h);
        Ok(h)
    }

    pub fn remove_marker(&mut self, transid: TransId) -> bool {
        match self.marker_map.remove(&transid) {
            Some(h) => {
                self.markers.release(h);
                true
            }
            None => false,
        }
    }

    pub fn find_marker(&self, transid: TransId) -> Option<MarkerH> {
        self.marker_map.get(&transid).copied()
    }

    /// Markers owned by one TC node, in insertion order.
    pub fn markers_for_node(&self, node: NodeId) -> Vec<Marker> {
        let mut out: Vec<Marker> = self
            .markers
            .iter_busy()
            .map(|(_, m)| *m)
            .filter(|m| m.tc_node == node)
            .collect();
        out.sort_by_key(|m| m.order);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ops() -> Ops {
        Ops::new(8, 16, 16, 4)
    }

    #[test]
    fn hash_insert_find_remove() {
        let mut ops = ops();
        let a = ops.seize().unwrap();
        {
            let op = ops.pool.get_mut(a);
            op.transid = [0x100, 0x200];
            op.tc_op = 7;
        }
        ops.hash_insert(a);
        assert_eq!(ops.hash_find([0x100, 0x200], 7), Some(a));
        assert_eq!(ops.hash_find([0x100, 0x201], 7), None);
        assert_eq!(ops.hash_find([0x100, 0x200], 8), None);
        ops.hash_remove(a);
        assert_eq!(ops.hash_find([0x100, 0x200], 7), None);
        ops.release(a);
    }

    #[test]
    fn hash_chains_colliding_entries() {
        let mut ops = ops();
        // Same bucket: transid1 ^ tc_op equal mod 1024.
        let a = ops.seize().unwrap();
        {
            let op = ops.pool.get_mut(a);
            op.transid = [0, 0];
            op.tc_op = 5;
        }
        let b = ops.seize().unwrap();
        {
            let op = ops.pool.get_mut(b);
            op.transid = [1024, 0];
            op.tc_op = 5;
        }
        ops.hash_insert(a);
        ops.hash_insert(b);
        assert_eq!(ops.hash_find([0, 0], 5), Some(a));
        assert_eq!(ops.hash_find([1024, 0], 5), Some(b));
        ops.hash_remove(a);
        assert_eq!(ops.hash_find([1024, 0], 5), Some(b));
        ops.hash_remove(b);
        ops.release(a);
        ops.release(b);
    }

    #[test]
    fn overflow_buffers_exact_segments() {
        let mut ops = ops();
        let mut seg = SegBuf::default();
        ops.append_overflow(&mut seg, &[1, 2, 3, 4]).unwrap();
        assert_eq!(seg.len, 4);
        // Exactly one segment for four words.
        assert_eq!(ops.bufs.in_use(), 1);
        ops.append_overflow(&mut seg, &[5]).unwrap();
        assert_eq!(ops.bufs.in_use(), 2);
        assert_eq!(ops.collect_overflow(&seg), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn marker_order_is_stable() {
        let mut ops = ops();
        let n = NodeId(3);
        ops.insert_marker([1, 1], None, 0, n).unwrap();
        ops.insert_marker([2, 2], None, 0, NodeId(4)).unwrap();
        ops.insert_marker([3, 3], None, 0, n).unwrap();
        let for_n = ops.markers_for_node(n);
        assert_eq!(for_n.len(), 2);
        assert_eq!(for_n[0].transid, [1, 1]);
        assert_eq!(for_n[1].transid, [3, 3]);
        assert!(ops.remove_marker([1, 1]));
        assert!(!ops.remove_marker([1, 1]));
    }

    #[test]
    fn marker_pool_exhaustion() {
        let mut ops = ops();
        for i in 0..4u32 {
            ops.insert_marker([i, i], None, 0, NodeId(1)).unwrap();
        }
        assert_eq!(
            ops.insert_marker([9, 9], None, 0, NodeId(1)),
            Err(codes::NO_FREE_MARKER)
        );
    }
}
