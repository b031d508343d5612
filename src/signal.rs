//! The inter-block message contract.
//!
//! Every interaction with a peer (transaction coordinator, placement
//! manager, sibling data nodes, the file system) and every asynchronous
//! reply from the local storage engines is one of these signals. Handlers
//! run to completion: a signal in, state updates, zero or more signals out.

use std::collections::VecDeque;

pub type TransId = [u32; 2];
pub type Gci = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Addressable peer blocks. The storage engines are not here: they are
/// reached through direct trait calls and answer through the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    /// Transaction coordinator.
    Tc,
    /// Distribution / data-placement manager.
    Dih,
    /// A sibling local query handler (replica chain, replay barriers).
    Lqh,
    /// Schema manager, for table lifecycle replies.
    Dict,
    /// Cluster manager, for start-phase replies.
    Cm,
    /// Client API node.
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub node: NodeId,
    pub block: Block,
}

impl BlockRef {
    pub fn new(node: NodeId, block: Block) -> Self {
        Self { node, block }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Insert,
    Update,
    Write,
    Delete,
}

impl OpKind {
    pub fn as_word(self) -> u32 {
        match self {
            OpKind::Read => 0,
            OpKind::Insert => 1,
            OpKind::Update => 2,
            OpKind::Write => 3,
            OpKind::Delete => 4,
        }
    }

    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            0 => OpKind::Read,
            1 => OpKind::Insert,
            2 => OpKind::Update,
            3 => OpKind::Write,
            4 => OpKind::Delete,
            _ => return None,
        })
    }

    pub fn is_read(self) -> bool {
        matches!(self, OpKind::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Read,
    Exclusive,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyReqFlags: u32 {
        /// Commit at prepare; no separate COMMIT phase will follow.
        const DIRTY = 1 << 0;
        /// Short read, committed-read semantics.
        const SIMPLE = 1 << 1;
        /// A commit-ack marker must be installed for this transaction.
        const MARKER = 1 << 2;
        /// Replay of a logged operation during restart.
        const RESTORE = 1 << 3;
        /// Part of a fragment-copy stream to a starting node.
        const COPY = 1 << 4;
    }
}

/// Prepare an operation on a local fragment replica.
#[derive(Debug, Clone)]
pub struct KeyReq {
    pub client_ref: BlockRef,
    /// Op handle at the client (echoed in the reply).
    pub client_op: u32,
    pub tc_ref: BlockRef,
    pub tc_op: u32,
    pub table: u32,
    pub schema_version: u32,
    pub fragment: u32,
    pub transid: TransId,
    pub op: OpKind,
    pub lock: LockMode,
    pub flags: KeyReqFlags,
    pub seq_no_replica: u8,
    pub last_replica_no: u8,
    pub next_replica: Option<NodeId>,
    pub node_after_next: [Option<NodeId>; 2],
    /// The replica that forwarded this request; None when it came from
    /// the coordinator. Commit and complete travel back through it.
    pub prev_node: Option<NodeId>,
    pub hash: u32,
    /// Set on replayed and copied operations; zero otherwise.
    pub gci: Gci,
    pub key_len: u32,
    pub attr_len: u32,
    /// First words inline; the rest follows in KeyInfo / AttrInfo.
    pub key: Vec<u32>,
    pub attr: Vec<u32>,
}

pub const KEYREQ_INLINE_KEY: usize = 4;
pub const KEYREQ_INLINE_ATTR: usize = 5;

#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyConf {
    pub client_op: u32,
    pub lqh_op: u32,
    pub read_len: u32,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyRef {
    pub client_op: u32,
    pub transid: TransId,
    pub code: u32,
}

/// Commit order from the coordinator, normally carried packed. `lqh_op`
/// is this node's op index when the sender knows it; a chained forward
/// uses the unknown sentinel and the receiver resolves by identity.
#[derive(Debug, Clone, Copy)]
pub struct CommitOrd {
    pub lqh_op: u32,
    pub gci: Gci,
    pub transid: TransId,
    pub tc_op: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CompleteOrd {
    pub lqh_op: u32,
    pub transid: TransId,
    pub tc_op: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Abort {
    pub tc_ref: BlockRef,
    pub tc_op: u32,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct Aborted {
    pub tc_op: u32,
    pub transid: TransId,
}

/// Slow-path commit used by a coordinator taking over after a failure.
#[derive(Debug, Clone, Copy)]
pub struct CommitReq {
    pub reply_ref: BlockRef,
    pub reply_op: u32,
    pub lqh_op: u32,
    pub gci: Gci,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct CompleteReq {
    pub reply_ref: BlockRef,
    pub reply_op: u32,
    pub lqh_op: u32,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct AbortReq {
    pub reply_ref: BlockRef,
    pub reply_op: u32,
    pub lqh_op: u32,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitConf {
    pub reply_op: u32,
    pub node: NodeId,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct CompleteConf {
    pub reply_op: u32,
    pub node: NodeId,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct AbortConf {
    pub reply_op: u32,
    pub node: NodeId,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoveMarkerOrd {
    pub transid: TransId,
}

/// Takeover of a failed coordinator's transactions.
#[derive(Debug, Clone, Copy)]
pub struct TakeoverReq {
    pub new_tc_ref: BlockRef,
    pub failed_node: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverOpStatus {
    Prepared,
    Committed,
    Aborted,
    Marker,
    LastTransConf,
}

#[derive(Debug, Clone, Copy)]
pub struct TakeoverConf {
    pub status: TakeoverOpStatus,
    pub transid: TransId,
    pub tc_op: u32,
    pub lqh_op: u32,
    pub gci: Gci,
    pub api_ref: Option<BlockRef>,
    pub api_op: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GcpSaveReq {
    pub dih_ref: BlockRef,
    pub dih_ptr: u32,
    pub gci: Gci,
}

#[derive(Debug, Clone, Copy)]
pub struct GcpSaveConf {
    pub dih_ptr: u32,
    pub node: NodeId,
    pub gci: Gci,
}

#[derive(Debug, Clone, Copy)]
pub struct GcpSaveRef {
    pub dih_ptr: u32,
    pub node: NodeId,
    pub gci: Gci,
    pub code: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LcpFragOrd {
    pub table: u32,
    pub fragment: u32,
    pub lcp_id: u32,
    pub keep_gci: Gci,
    pub last_fragment: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LcpFragRep {
    pub node: NodeId,
    pub table: u32,
    pub fragment: u32,
    pub lcp_id: u32,
    pub max_gci_in_lcp: Gci,
    pub max_gci_completed_in_lcp: Gci,
}

#[derive(Debug, Clone, Copy)]
pub struct LcpCompleteRep {
    pub node: NodeId,
    pub lcp_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EmptyLcpReq {
    pub sender_ref: BlockRef,
}

#[derive(Debug, Clone, Copy)]
pub struct EmptyLcpConf {
    pub node: NodeId,
    pub idle: bool,
    pub table: u32,
    pub fragment: u32,
    pub lcp_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct StartRecReq {
    pub sender_ref: BlockRef,
    pub keep_gci: Gci,
    pub last_completed_gci: Gci,
    pub newest_gci: Gci,
}

#[derive(Debug, Clone, Copy)]
pub struct StartRecConf {
    pub node: NodeId,
}

/// One fragment to restore during system/node restart.
#[derive(Debug, Clone)]
pub struct StartFragReq {
    pub table: u32,
    pub fragment: u32,
    pub lcp_id: u32,
    /// Replay range requested by the placement manager.
    pub start_gci: Gci,
    pub last_gci: Gci,
    /// Nodes whose log must be executed for this fragment, one per
    /// replay phase; entry 0 is the primary's log.
    pub log_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct StartFragConf {
    pub table: u32,
    pub fragment: u32,
}

/// A replayed operation forwarded to the node that owns the replica.
#[derive(Debug, Clone)]
pub struct ExecFragReq {
    pub sender_ref: BlockRef,
    pub key_req: KeyReq,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecFragConf {
    pub table: u32,
    pub fragment: u32,
}

/// Barrier between replay phases, broadcast to every participating node.
#[derive(Debug, Clone, Copy)]
pub struct ExecSrReq {
    pub sender: NodeId,
    pub phase: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecSrConf {
    pub sender: NodeId,
    pub phase: u32,
}

#[derive(Debug, Clone)]
pub struct AddFragReq {
    pub sender_ref: BlockRef,
    pub table: u32,
    pub fragment: u32,
    pub schema_version: u32,
    /// Operations on this fragment write redo records.
    pub logged: bool,
    /// The fragment is being filled by copy from a live replica.
    pub active_creation: bool,
    /// An ordered index fragment is created alongside.
    pub ordered_index: bool,
}

#[derive(Debug, Clone)]
pub struct AddAttrReq {
    pub sender_ref: BlockRef,
    pub table: u32,
    pub attr_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AddFragConf {
    pub table: u32,
    pub fragment: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AddFragRef {
    pub table: u32,
    pub fragment: u32,
    pub code: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AddAttrConf {
    pub table: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PrepDropTabReq {
    pub sender_ref: BlockRef,
    pub table: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitDropTabReq {
    pub sender_ref: BlockRef,
    pub table: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DropTabReq {
    pub sender_ref: BlockRef,
    pub table: u32,
}

#[derive(Debug, Clone)]
pub struct NodeFailRep {
    pub failed: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct NfCompleteRep {
    pub node: NodeId,
    pub failed_node: NodeId,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanFragReq {
    pub sender_ref: BlockRef,
    pub client_op: u32,
    pub table: u32,
    pub fragment: u32,
    pub transid: TransId,
    pub parallel_ops: u32,
    /// Ordered-index scan; draws from the index scan-number range.
    pub ordered: bool,
    /// Fragment-copy scan; uses the reserved scan slot.
    pub copy: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanFragConf {
    pub client_op: u32,
    pub scan_op: u32,
    pub transid: TransId,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanFragRef {
    pub client_op: u32,
    pub transid: TransId,
    pub code: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanNextReq {
    pub scan_op: u32,
    pub transid: TransId,
    pub close: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanHbRep {
    pub client_op: u32,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyFragReq {
    pub sender_ref: BlockRef,
    pub table: u32,
    pub fragment: u32,
    pub dest_node: NodeId,
    pub transid: TransId,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyFragConf {
    pub table: u32,
    pub fragment: u32,
    pub rows_copied: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyActiveReq {
    pub sender_ref: BlockRef,
    pub table: u32,
    pub fragment: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyActiveConf {
    pub table: u32,
    pub fragment: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    Initial,
    NodeRestart,
    SystemRestart,
}

#[derive(Debug, Clone, Copy)]
pub struct StartPhaseReq {
    pub sender_ref: BlockRef,
    pub phase: u32,
    pub start_type: StartType,
}

#[derive(Debug, Clone, Copy)]
pub struct StartPhaseConf {
    pub node: NodeId,
    pub phase: u32,
}

/// Self-delivered continuations; the real-time-break primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinueB {
    /// Pump the waiting-operation queue of a log part.
    LogNextOp { part: u32 },
    /// Restart queued operations after an LCP unblocks a fragment.
    RestartQueuedOps { fragment: u32 },
    /// Drive the replay read/apply loop of a part.
    ExecLogLoop { part: u32 },
    /// Rewrite post-head pages with log lap zero.
    InvalidateLogLoop { part: u32 },
    /// Continue a takeover walk over op records.
    TakeoverScan { next_op: u32 },
    /// Re-check a dropping table's usage count.
    WaitDropTab { table: u32 },
}

// File-system completion signals. `user` identifies the log file record,
// `lfo` the in-flight file operation.

#[derive(Debug, Clone, Copy)]
pub struct FsOpenConf {
    pub user: u32,
    pub os_file: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsOpenRef {
    pub user: u32,
    pub error: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsReadConf {
    pub lfo: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsReadRef {
    pub lfo: u32,
    pub error: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsWriteConf {
    pub lfo: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsWriteRef {
    pub lfo: u32,
    pub error: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsSyncConf {
    pub user: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsCloseConf {
    pub user: u32,
}

// Asynchronous storage-engine replies. `op` / `lcp` are the pool indices
// handed to the engine with the request.

#[derive(Debug, Clone, Copy)]
pub struct AccKeyConf {
    pub op: u32,
    pub local_key: u32,
    pub read_len: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccKeyRef {
    pub op: u32,
    pub code: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccAbortConf {
    pub op: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TupKeyConf {
    pub op: u32,
    pub read_len: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TupKeyRef {
    pub op: u32,
    pub code: u32,
}

/// A row surfaced by a hash-index scan cursor.
#[derive(Debug, Clone)]
pub struct ScanRowRef {
    pub key: Vec<u32>,
    pub local_key: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccScanConf {
    pub scan_op: u32,
    pub cursor: u32,
}

#[derive(Debug, Clone)]
pub struct NextScanConf {
    pub scan_op: u32,
    /// None once the cursor is exhausted.
    pub row: Option<ScanRowRef>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccLcpFragIdConf {
    pub lcp: u32,
    pub acc_frag: u32,
}

#[derive(Debug, Clone)]
pub struct LcpHoldOpConf {
    pub lcp: u32,
    /// Ops the hash index parked in its hold buffer this batch.
    pub held: Vec<u32>,
    pub more: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TupPrepLcpConf {
    pub lcp: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccLcpStarted {
    pub lcp: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TupLcpStarted {
    pub lcp: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccLcpConf {
    pub lcp: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TupLcpConf {
    pub lcp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBlock {
    Acc,
    Tup,
}

#[derive(Debug, Clone, Copy)]
pub struct EndLcpConf {
    pub block: EngineBlock,
}

#[derive(Debug, Clone)]
pub enum Signal {
    KeyReq(KeyReq),
    KeyInfo(KeyInfo),
    AttrInfo(AttrInfo),
    KeyConf(KeyConf),
    KeyRef(KeyRef),
    Packed(Vec<u32>),
    Commit(CommitOrd),
    Complete(CompleteOrd),
    Abort(Abort),
    Aborted(Aborted),
    CommitReq(CommitReq),
    CommitConf(CommitConf),
    CompleteReq(CompleteReq),
    CompleteConf(CompleteConf),
    AbortReq(AbortReq),
    AbortConf(AbortConf),
    RemoveMarker(RemoveMarkerOrd),
    TakeoverReq(TakeoverReq),
    TakeoverConf(TakeoverConf),
    GcpSaveReq(GcpSaveReq),
    GcpSaveConf(GcpSaveConf),
    GcpSaveRef(GcpSaveRef),
    LcpFragOrd(LcpFragOrd),
    LcpFragRep(LcpFragRep),
    LcpCompleteRep(LcpCompleteRep),
    EmptyLcpReq(EmptyLcpReq),
    EmptyLcpConf(EmptyLcpConf),
    StartRecReq(StartRecReq),
    StartRecConf(StartRecConf),
    StartFragReq(StartFragReq),
    StartFragConf(StartFragConf),
    ExecFragReq(ExecFragReq),
    ExecFragConf(ExecFragConf),
    ExecSrReq(ExecSrReq),
    ExecSrConf(ExecSrConf),
    AddFragReq(AddFragReq),
    AddAttrReq(AddAttrReq),
    AddFragConf(AddFragConf),
    AddFragRef(AddFragRef),
    AddAttrConf(AddAttrConf),
    PrepDropTabReq(PrepDropTabReq),
    PrepDropTabConf { table: u32 },
    WaitDropTabReq(WaitDropTabReq),
    WaitDropTabConf { table: u32 },
    DropTabReq(DropTabReq),
    DropTabConf { table: u32 },
    NodeFailRep(NodeFailRep),
    NfCompleteRep(NfCompleteRep),
    ScanFragReq(ScanFragReq),
    ScanFragConf(ScanFragConf),
    ScanFragRef(ScanFragRef),
    ScanNextReq(ScanNextReq),
    ScanHbRep(ScanHbRep),
    CopyFragReq(CopyFragReq),
    CopyFragConf(CopyFragConf),
    CopyActiveReq(CopyActiveReq),
    CopyActiveConf(CopyActiveConf),
    StartPhaseReq(StartPhaseReq),
    StartPhaseConf(StartPhaseConf),
    ContinueB(ContinueB),
    TimeSignal,
    FsOpenConf(FsOpenConf),
    FsOpenRef(FsOpenRef),
    FsReadConf(FsReadConf),
    FsReadRef(FsReadRef),
    FsWriteConf(FsWriteConf),
    FsWriteRef(FsWriteRef),
    FsSyncConf(FsSyncConf),
    FsCloseConf(FsCloseConf),
    AccKeyConf(AccKeyConf),
    AccKeyRef(AccKeyRef),
    AccAbortConf(AccAbortConf),
    AccScanConf(AccScanConf),
    NextScanConf(NextScanConf),
    TupKeyConf(TupKeyConf),
    TupKeyRef(TupKeyRef),
    AccLcpFragIdConf(AccLcpFragIdConf),
    LcpHoldOpConf(LcpHoldOpConf),
    TupPrepLcpConf(TupPrepLcpConf),
    AccLcpStarted(AccLcpStarted),
    TupLcpStarted(TupLcpStarted),
    AccLcpConf(AccLcpConf),
    TupLcpConf(TupLcpConf),
    EndLcpConf(EndLcpConf),
}

/// A signal addressed to a peer block.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: BlockRef,
    pub signal: Signal,
}

/// Signals queued to this node itself: engine and file-system replies,
/// immediate continuations, decoded packed entries.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<Signal>,
}

impl Inbox {
    pub fn push(&mut self, signal: Signal) {
        self.queue.push_back(signal);
    }

    pub fn pop(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Signals queued for delivery to peer nodes; the embedding transport
/// drains this after each dispatch round.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Envelope>,
}

impl Outbox {
    pub fn send(&mut self, to: BlockRef, signal: Signal) {
        self.queue.push_back(Envelope { to, signal });
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }
}
