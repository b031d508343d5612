//! Test harness: a node wired to shared in-memory engines and files so a
//! test can park engine requests, inspect rows, and restart a second node
//! on the same log.

use std::cell::RefCell;
use std::rc::Rc;

use meridian_datanode::config::Config;
use meridian_datanode::engines::{
    AccKeyReq, HashIndex, MemAcc, MemTup, MemTux, OrderedIndex, RowStore, TupKeyReq,
};
use meridian_datanode::io::{Io, SimIo};
use meridian_datanode::node::Lqh;
use meridian_datanode::packed::{decode, PackedEntry};
use meridian_datanode::signal::{
    AddAttrReq, AddFragReq, Block, BlockRef, Envelope, Inbox, KeyReq, KeyReqFlags, LockMode,
    NodeId, OpKind, Signal, StartPhaseReq, StartType,
};

pub struct SharedAcc(pub Rc<RefCell<MemAcc>>);
pub struct SharedTup(pub Rc<RefCell<MemTup>>);
pub struct SharedTux(pub Rc<RefCell<MemTux>>);
pub struct SharedIo(pub Rc<RefCell<SimIo>>);

impl HashIndex for SharedAcc {
    fn seize(&mut self) -> u32 {
        self.0.borrow_mut().seize()
    }
    fn release(&mut self, acc_ptr: u32) {
        self.0.borrow_mut().release(acc_ptr)
    }
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32> {
        self.0.borrow_mut().add_fragment(table, fragment)
    }
    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.0.borrow_mut().drop_fragment(table, fragment)
    }
    fn key_req(&mut self, req: AccKeyReq, inbox: &mut Inbox) {
        self.0.borrow_mut().key_req(req, inbox)
    }
    fn commit(&mut self, acc_ptr: u32) {
        self.0.borrow_mut().commit(acc_ptr)
    }
    fn abort(&mut self, op: u32, acc_ptr: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().abort(op, acc_ptr, inbox)
    }
    fn lcp_frag_id(&mut self, lcp: u32, table: u32, fragment: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().lcp_frag_id(lcp, table, fragment, inbox)
    }
    fn lcp_hold_ops(&mut self, lcp: u32, table: u32, fragment: u32, max: u32, inbox: &mut Inbox) {
        self.0
            .borrow_mut()
            .lcp_hold_ops(lcp, table, fragment, max, inbox)
    }
    fn lcp_start(&mut self, lcp: u32, acc_frag: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().lcp_start(lcp, acc_frag, inbox)
    }
    fn cont_op(&mut self, acc_ptr: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().cont_op(acc_ptr, inbox)
    }
    fn end_lcp(&mut self, inbox: &mut Inbox) {
        self.0.borrow_mut().end_lcp(inbox)
    }
    fn scan_req(&mut self, scan_op: u32, table: u32, fragment: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().scan_req(scan_op, table, fragment, inbox)
    }
    fn next_scan_req(&mut self, cursor: u32, scan_op: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().next_scan_req(cursor, scan_op, inbox)
    }
    fn scan_release(&mut self, cursor: u32) {
        self.0.borrow_mut().scan_release(cursor)
    }
    fn start_recovery(&mut self, table: u32, fragment: u32, lcp_id: u32) {
        self.0.borrow_mut().start_recovery(table, fragment, lcp_id)
    }
}

impl RowStore for SharedTup {
    fn seize(&mut self) -> u32 {
        self.0.borrow_mut().seize()
    }
    fn release(&mut self, tup_ptr: u32) {
        self.0.borrow_mut().release(tup_ptr)
    }
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32> {
        self.0.borrow_mut().add_fragment(table, fragment)
    }
    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.0.borrow_mut().drop_fragment(table, fragment)
    }
    fn key_req(&mut self, req: TupKeyReq, inbox: &mut Inbox) {
        self.0.borrow_mut().key_req(req, inbox)
    }
    fn commit(&mut self, tup_ptr: u32) {
        self.0.borrow_mut().commit(tup_ptr)
    }
    fn abort(&mut self, tup_ptr: u32) {
        self.0.borrow_mut().abort(tup_ptr)
    }
    fn read_row(&self, table: u32, fragment: u32, local_key: u32) -> Option<Vec<u32>> {
        self.0.borrow().read_row(table, fragment, local_key)
    }
    fn prep_lcp(&mut self, lcp: u32, table: u32, fragment: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().prep_lcp(lcp, table, fragment, inbox)
    }
    fn lcp_start(&mut self, lcp: u32, tup_frag: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().lcp_start(lcp, tup_frag, inbox)
    }
    fn end_lcp(&mut self, inbox: &mut Inbox) {
        self.0.borrow_mut().end_lcp(inbox)
    }
    fn start_recovery(&mut self, table: u32, fragment: u32, lcp_id: u32) {
        self.0.borrow_mut().start_recovery(table, fragment, lcp_id)
    }
}

impl OrderedIndex for SharedTux {
    fn add_fragment(&mut self, table: u32, fragment: u32) -> Result<u32, u32> {
        self.0.borrow_mut().add_fragment(table, fragment)
    }
    fn add_attrs(&mut self, table: u32, count: u32) -> Result<(), u32> {
        self.0.borrow_mut().add_attrs(table, count)
    }
    fn drop_fragment(&mut self, table: u32, fragment: u32) {
        self.0.borrow_mut().drop_fragment(table, fragment)
    }
}

impl Io for SharedIo {
    fn open(&mut self, path: &str, size: u64, create: bool, user: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().open(path, size, create, user, inbox)
    }
    fn close(&mut self, os_file: u32, user: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().close(os_file, user, inbox)
    }
    fn write(&mut self, os_file: u32, offset: u64, bufs: &[&[u8]], sync: bool, lfo: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().write(os_file, offset, bufs, sync, lfo, inbox)
    }
    fn read(&mut self, os_file: u32, offset: u64, buf: &mut [u8], lfo: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().read(os_file, offset, buf, lfo, inbox)
    }
    fn sync(&mut self, os_file: u32, user: u32, inbox: &mut Inbox) {
        self.0.borrow_mut().sync(os_file, user, inbox)
    }
}

pub const OWN_NODE: NodeId = NodeId(1);
pub const TC_NODE: NodeId = NodeId(2);

pub fn tc_ref() -> BlockRef {
    BlockRef::new(TC_NODE, Block::Tc)
}

pub fn dih_ref() -> BlockRef {
    BlockRef::new(TC_NODE, Block::Dih)
}

pub struct TestNode {
    pub lqh: Lqh,
    pub acc: Rc<RefCell<MemAcc>>,
    pub tup: Rc<RefCell<MemTup>>,
    pub io: Rc<RefCell<SimIo>>,
}

impl TestNode {
    pub fn new(cfg: Config) -> Self {
        Self::with_io(cfg, Rc::new(RefCell::new(SimIo::new())))
    }

    pub fn with_io(cfg: Config, io: Rc<RefCell<SimIo>>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
            .try_init();
        let acc = Rc::new(RefCell::new(MemAcc::new()));
        let tup = Rc::new(RefCell::new(MemTup::new()));
        let tux = Rc::new(RefCell::new(MemTux::new()));
        let lqh = Lqh::new(
            cfg,
            OWN_NODE,
            Box::new(SharedAcc(acc.clone())),
            Box::new(SharedTup(tup.clone())),
            Box::new(SharedTux(tux)),
            Box::new(SharedIo(io.clone())),
        );
        Self { lqh, acc, tup, io }
    }

    pub fn start(&mut self, start_type: StartType) {
        let cm = BlockRef::new(TC_NODE, Block::Cm);
        for phase in 1..=4 {
            self.lqh.deliver(Signal::StartPhaseReq(StartPhaseReq {
                sender_ref: cm,
                phase,
                start_type,
            }));
        }
        self.drain();
    }

    pub fn add_table(&mut self, table: u32, fragment: u32) {
        let dict = BlockRef::new(TC_NODE, Block::Dict);
        self.lqh.deliver(Signal::AddFragReq(AddFragReq {
            sender_ref: dict,
            table,
            fragment,
            schema_version: 1,
            logged: true,
            active_creation: false,
            ordered_index: false,
        }));
        self.lqh.deliver(Signal::AddAttrReq(AddAttrReq {
            sender_ref: dict,
            table,
            attr_count: 2,
        }));
        self.drain();
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.lqh.outbox.drain()
    }

    /// All packed entries sent out, flattened.
    pub fn drained_packed(&mut self) -> Vec<PackedEntry> {
        self.drain()
            .into_iter()
            .filter_map(|env| match env.signal {
                Signal::Packed(words) => decode(&words),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn insert_req(
        &self,
        table: u32,
        fragment: u32,
        transid: [u32; 2],
        tc_op: u32,
        hash: u32,
        key: Vec<u32>,
        attr: Vec<u32>,
        flags: KeyReqFlags,
    ) -> KeyReq {
        KeyReq {
            client_ref: tc_ref(),
            client_op: tc_op,
            tc_ref: tc_ref(),
            tc_op,
            table,
            schema_version: 1,
            fragment,
            transid,
            op: OpKind::Insert,
            lock: LockMode::Exclusive,
            flags,
            seq_no_replica: 0,
            last_replica_no: 0,
            next_replica: None,
            node_after_next: [None; 2],
            prev_node: None,
            hash,
            gci: 0,
            key_len: key.len() as u32,
            attr_len: attr.len() as u32,
            key,
            attr,
        }
    }
}
