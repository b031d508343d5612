//! Crash the node after committed work and bring a fresh one up on the
//! same log files.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{dih_ref, TestNode};
use meridian_datanode::config::Config;
use meridian_datanode::io::SimIo;
use meridian_datanode::node::NodeState;
use meridian_datanode::packed::PackedEntry;
use meridian_datanode::signal::{
    CommitOrd, GcpSaveReq, KeyReqFlags, Signal, StartFragReq, StartRecReq, StartType,
};

fn commit(node: &mut TestNode, transid: [u32; 2], tc_op: u32, hash: u32, key: Vec<u32>, attr: Vec<u32>, gci: u32) {
    let req = node.insert_req(7, 0, transid, tc_op, hash, key, attr, KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(req));
    let lqh_op = node
        .drained_packed()
        .iter()
        .find_map(|e| match e {
            PackedEntry::KeyConf { lqh_op, .. } => Some(*lqh_op),
            _ => None,
        })
        .expect("prepare confirmed");
    node.lqh.deliver(Signal::Commit(CommitOrd {
        lqh_op,
        gci,
        transid,
        tc_op,
    }));
    node.drain();
}

#[test]
fn system_restart_replays_exactly_the_committed_horizon() {
    let io: Rc<RefCell<SimIo>> = Rc::new(RefCell::new(SimIo::new()));

    // First life: two commits inside the horizon, a global checkpoint,
    // then work the checkpoint never covered.
    {
        let mut node = TestNode::with_io(Config::default(), io.clone());
        node.start(StartType::Initial);
        node.add_table(7, 0);
        commit(&mut node, [1, 1], 1, 0, vec![0xa], vec![10, 11], 42);
        commit(&mut node, [2, 2], 2, 1, vec![0xb], vec![20, 21], 42);
        node.lqh.deliver(Signal::GcpSaveReq(GcpSaveReq {
            dih_ref: dih_ref(),
            dih_ptr: 1,
            gci: 42,
        }));
        assert!(node
            .drain()
            .iter()
            .any(|env| matches!(env.signal, Signal::GcpSaveConf(c) if c.gci == 42)));

        // Committed after the checkpoint horizon: durable in the log but
        // not coverable by this restart.
        commit(&mut node, [3, 3], 3, 2, vec![0xc], vec![30], 50);
        // An uncommitted prepare dies with the node.
        let req = node.insert_req(7, 0, [9, 9], 9, 3, vec![0xd], vec![90], KeyReqFlags::empty());
        node.lqh.deliver(Signal::KeyReq(req));
        node.drain();
        // The supervision flush pushes the trailing words to disk before
        // the crash.
        node.lqh.advance_time(1100);
        assert_eq!(node.tup.borrow().row_count(7, 0), 3);
    }

    // Second life on the same files.
    let mut node = TestNode::with_io(Config::default(), io);
    node.start(StartType::SystemRestart);
    assert_eq!(node.lqh.state, NodeState::Starting);

    node.lqh.deliver(Signal::StartFragReq(StartFragReq {
        table: 7,
        fragment: 0,
        lcp_id: 0,
        start_gci: 1,
        last_gci: 42,
        log_nodes: Vec::new(),
    }));
    node.lqh.deliver(Signal::StartRecReq(StartRecReq {
        sender_ref: dih_ref(),
        keep_gci: 1,
        last_completed_gci: 42,
        newest_gci: 42,
    }));

    let out = node.drain();
    assert!(
        out.iter()
            .any(|env| matches!(env.signal, Signal::StartRecConf(_))),
        "recovery must complete"
    );
    assert_eq!(node.lqh.state, NodeState::Started);

    // Exactly the two commits with gci <= 42 were re-applied, with their
    // original keys and attributes.
    let tup = node.tup.borrow();
    assert_eq!(tup.row_count(7, 0), 2);
    let rows: Vec<&Vec<u32>> = (1..=4).filter_map(|lk| tup.row(7, 0, lk)).collect();
    assert!(rows.contains(&&vec![10, 11]));
    assert!(rows.contains(&&vec![20, 21]));
    assert!(!rows.contains(&&vec![30]));
    assert!(!rows.contains(&&vec![90]));
    drop(tup);

    // The recovered node takes new work on the recovered log.
    let mut req = node.insert_req(7, 0, [5, 5], 5, 0, vec![0xe], vec![55], KeyReqFlags::empty());
    req.schema_version = 0;
    node.lqh.deliver(Signal::KeyReq(req));
    let lqh_op = node
        .drained_packed()
        .iter()
        .find_map(|e| match e {
            PackedEntry::KeyConf { lqh_op, .. } => Some(*lqh_op),
            _ => None,
        })
        .expect("post-restart prepare confirmed");
    node.lqh.deliver(Signal::Commit(CommitOrd {
        lqh_op,
        gci: 43,
        transid: [5, 5],
        tc_op: 5,
    }));
    node.drain();
    assert_eq!(node.tup.borrow().row_count(7, 0), 3);
}

#[test]
fn diskless_restart_synthesises_a_fresh_log() {
    let cfg = Config {
        diskless: true,
        ..Config::default()
    };
    let mut node = TestNode::new(cfg);
    node.start(StartType::SystemRestart);
    node.lqh.deliver(Signal::StartRecReq(StartRecReq {
        sender_ref: dih_ref(),
        keep_gci: 1,
        last_completed_gci: 1,
        newest_gci: 1,
    }));
    assert!(node
        .drain()
        .iter()
        .any(|env| matches!(env.signal, Signal::StartRecConf(_))));
    assert_eq!(node.lqh.state, NodeState::Started);
    for part in 0..4 {
        assert_eq!(node.lqh.redo.parts[part].log_lap, 1);
    }
}
