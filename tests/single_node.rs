//! End-to-end scenarios driven through one node with stub peers.

mod common;

use common::{dih_ref, TestNode, OWN_NODE, TC_NODE};
use meridian_datanode::config::Config;
use meridian_datanode::error::codes;
use meridian_datanode::fragment::FragStatus;
use meridian_datanode::lcp::LcpState;
use meridian_datanode::node::NodeState;
use meridian_datanode::ops::TransactionState;
use meridian_datanode::packed::PackedEntry;
use meridian_datanode::signal::{
    Block, BlockRef, CommitOrd, CopyFragReq, GcpSaveReq, KeyReqFlags, LcpFragOrd, NodeFailRep,
    NodeId, Signal, StartType, TakeoverOpStatus, TakeoverReq,
};

#[test]
fn prepare_and_commit_single_replica() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    let req = node.insert_req(
        7,
        0,
        [0x100, 0x200],
        11,
        0x1234,
        vec![0xa, 0xb, 0xc],
        vec![1, 2, 3, 4, 5],
        KeyReqFlags::empty(),
    );
    node.lqh.deliver(Signal::KeyReq(req));

    let entries = node.drained_packed();
    let (lqh_op, read_len) = entries
        .iter()
        .find_map(|e| match e {
            PackedEntry::KeyConf {
                client_op: 11,
                lqh_op,
                read_len,
                transid: [0x100, 0x200],
            } => Some((*lqh_op, *read_len)),
            _ => None,
        })
        .expect("prepare confirmed to the coordinator");
    assert_eq!(read_len, 0);
    // hash 0x1234 lands on part 0; the prepare is durable in the log.
    assert_eq!(node.lqh.ops.pool.in_use(), 1);
    assert_eq!(node.lqh.redo.parts[0].outstanding_preps.len(), 1);

    node.lqh.deliver(Signal::Commit(CommitOrd {
        lqh_op,
        gci: 42,
        transid: [0x100, 0x200],
        tc_op: 11,
    }));

    let entries = node.drained_packed();
    assert!(entries.iter().any(|e| matches!(
        e,
        PackedEntry::Committed {
            tc_op: 11,
            transid: [0x100, 0x200]
        }
    )));
    // Row visible, op record released, prepare resolved.
    assert_eq!(node.tup.borrow().row_count(7, 0), 1);
    assert_eq!(node.lqh.ops.pool.in_use(), 0);
    assert_eq!(node.lqh.redo.parts[0].outstanding_preps.len(), 0);
    assert_eq!(node.lqh.newest_gci, 42);
}

#[test]
fn prepare_refused_when_head_meets_tail() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    // Part 0: the next megabyte is the tail and the current one is spent.
    node.lqh.redo.parts[0].tail_file_no = 0;
    node.lqh.redo.parts[0].tail_mbyte = 1;
    node.lqh.redo.parts[0].mbyte_words_left = 0;

    let req = node.insert_req(
        7,
        0,
        [0x300, 0x400],
        21,
        0, // part 0
        vec![1],
        vec![2],
        KeyReqFlags::empty(),
    );
    node.lqh.deliver(Signal::KeyReq(req));

    let refused = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::KeyRef(r) => Some(r),
        _ => None,
    });
    let r = refused.expect("prepare refused");
    assert_eq!(r.code, codes::REDO_TAIL_PROBLEM);
    assert_eq!(r.client_op, 21);
    // Nothing written, nothing leaked.
    assert_eq!(node.lqh.redo.parts[0].current_mbyte, 0);
    assert_eq!(node.lqh.ops.pool.in_use(), 0);
    assert_eq!(node.tup.borrow().row_count(7, 0), 0);
}

fn committed_insert(node: &mut TestNode, transid: [u32; 2], tc_op: u32, hash: u32, key: Vec<u32>, attr: Vec<u32>, gci: u32) {
    let req = node.insert_req(7, 0, transid, tc_op, hash, key, attr, KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(req));
    let entries = node.drained_packed();
    let lqh_op = entries
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
fn gcp_save_syncs_all_parts() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    committed_insert(&mut node, [1, 1], 1, 0, vec![1], vec![10], 99);

    let syncs_before = node.io.borrow().syncs;
    node.lqh.deliver(Signal::GcpSaveReq(GcpSaveReq {
        dih_ref: dih_ref(),
        dih_ptr: 5,
        gci: 100,
    }));
    let conf = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::GcpSaveConf(c) => Some(c),
        _ => None,
    });
    let c = conf.expect("save confirmed");
    assert_eq!(c.gci, 100);
    assert_eq!(c.dih_ptr, 5);
    assert_eq!(node.lqh.newest_completed_gci, 100);
    assert!(node.io.borrow().syncs >= syncs_before + 4, "every part synced");

    // A repeated question about the same GCI answers from the stored
    // result.
    node.lqh.deliver(Signal::GcpSaveReq(GcpSaveReq {
        dih_ref: dih_ref(),
        dih_ptr: 6,
        gci: 100,
    }));
    let again = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::GcpSaveConf(c) => Some(c),
        _ => None,
    });
    assert_eq!(again.unwrap().dih_ptr, 6);
}

#[test]
fn gcp_save_waits_for_busy_part() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    // Part 3 is mid-append; it must emit the record after its writer.
    node.lqh.redo.parts[3].active_op = Some(0);
    node.lqh.deliver(Signal::GcpSaveReq(GcpSaveReq {
        dih_ref: dih_ref(),
        dih_ptr: 9,
        gci: 101,
    }));
    assert!(node
        .drain()
        .into_iter()
        .all(|env| !matches!(env.signal, Signal::GcpSaveConf(_))));
    assert!(node.lqh.redo.parts[3].write_completed_gci_after_write);

    // The writer finishes; the supervision tick pushes the save through.
    node.lqh.redo.parts[3].active_op = None;
    node.lqh.advance_time(1100);
    let conf = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::GcpSaveConf(c) => Some(c),
        _ => None,
    });
    assert_eq!(conf.expect("save confirmed after drain").gci, 101);
}

#[test]
fn lcp_blocks_fragment_and_queues_new_prepares() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    // O2 parks inside the row store, O1 inside the hash index.
    node.tup.borrow_mut().manual = true;
    let o2 = node.insert_req(7, 0, [2, 2], 2, 4, vec![2], vec![20], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(o2));
    node.acc.borrow_mut().manual = true;
    let o1 = node.insert_req(7, 0, [1, 1], 1, 8, vec![1], vec![10], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(o1));
    node.drain();
    let frag_h = node.lqh.frags.find(7, 0).unwrap();
    assert_eq!(node.lqh.frags.pool.get(frag_h).active_count, 2);

    node.lqh.deliver(Signal::LcpFragOrd(LcpFragOrd {
        table: 7,
        fragment: 0,
        lcp_id: 3,
        keep_gci: 1,
        last_fragment: false,
    }));
    assert_eq!(node.lqh.frags.pool.get(frag_h).status, FragStatus::Blocked);
    assert_eq!(node.lqh.lcp.state, LcpState::WaitActiveFinish);

    // A prepare arriving now parks on the fragment wait queue.
    node.acc.borrow_mut().manual = false;
    node.tup.borrow_mut().manual = false;
    let o3 = node.insert_req(7, 0, [3, 3], 3, 12, vec![3], vec![30], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(o3));
    assert!(node.lqh.frags.pool.get(frag_h).wait_queue_first.is_some());
    let queued = node
        .lqh
        .ops
        .pool
        .iter_busy()
        .filter(|(_, op)| op.state == TransactionState::Stopped)
        .count();
    assert_eq!(queued, 1);

    // The in-flight ops drain; the checkpoint starts and the fragment
    // reopens.
    node.tup.borrow_mut().answer_parked(&mut node.lqh.inbox);
    node.lqh.pump();
    node.acc.borrow_mut().answer_parked(&mut node.lqh.inbox);
    node.lqh.pump();

    assert_eq!(node.lqh.frags.pool.get(frag_h).status, FragStatus::Active);
    assert_eq!(node.lqh.lcp.state, LcpState::Idle);
    assert!(node.lqh.frags.pool.get(frag_h).wait_queue_first.is_none());
    let reps = node.drain();
    assert!(reps
        .iter()
        .any(|env| matches!(env.signal, Signal::LcpFragRep(r) if r.table == 7 && r.lcp_id == 3)));
    // O3 made it through the queue into the engines.
    let stopped = node
        .lqh
        .ops
        .pool
        .iter_busy()
        .filter(|(_, op)| op.state == TransactionState::Stopped)
        .count();
    assert_eq!(stopped, 0);

    // Final order: engines wind the checkpoint down and the completion is
    // broadcast.
    node.lqh.deliver(Signal::LcpFragOrd(LcpFragOrd {
        table: 7,
        fragment: 0,
        lcp_id: 3,
        keep_gci: 1,
        last_fragment: true,
    }));
    let out = node.drain();
    assert!(out
        .iter()
        .any(|env| matches!(env.signal, Signal::LcpCompleteRep(r) if r.lcp_id == 3)));
}

#[test]
fn coordinator_takeover_reports_every_op_and_marker() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    // Three prepared ops owned by the failing coordinator; the first one
    // carries a commit-ack marker.
    for i in 0..3u32 {
        let flags = if i == 0 {
            KeyReqFlags::MARKER
        } else {
            KeyReqFlags::empty()
        };
        let req = node.insert_req(
            7,
            0,
            [0x10 + i, 0x20 + i],
            100 + i,
            i * 4,
            vec![i],
            vec![i],
            flags,
        );
        node.lqh.deliver(Signal::KeyReq(req));
    }
    // A fourth op still inside the hash index when the coordinator dies.
    node.acc.borrow_mut().manual = true;
    let req = node.insert_req(7, 0, [0x99, 0x99], 200, 16, vec![9], vec![9], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(req));
    node.drain();

    node.lqh
        .deliver(Signal::NodeFailRep(NodeFailRep { failed: vec![TC_NODE] }));
    assert!(node
        .drain()
        .iter()
        .any(|env| matches!(env.signal, Signal::NfCompleteRep(r) if r.failed_node == TC_NODE)));

    let new_tc = BlockRef::new(NodeId(5), Block::Tc);
    node.lqh.deliver(Signal::TakeoverReq(TakeoverReq {
        new_tc_ref: new_tc,
        failed_node: TC_NODE,
    }));
    // The walk stalls on the in-flight op until the engine answers.
    node.acc.borrow_mut().answer_parked(&mut node.lqh.inbox);
    node.lqh.pump();

    let confs: Vec<_> = node
        .drain()
        .into_iter()
        .filter_map(|env| match env.signal {
            Signal::TakeoverConf(c) if env.to == new_tc => Some(c),
            _ => None,
        })
        .collect();
    let prepared = confs
        .iter()
        .filter(|c| c.status == TakeoverOpStatus::Prepared)
        .count();
    let aborted = confs
        .iter()
        .filter(|c| c.status == TakeoverOpStatus::Aborted)
        .count();
    assert_eq!(prepared, 3);
    assert_eq!(aborted, 1);
    let marker_at = confs
        .iter()
        .position(|c| c.status == TakeoverOpStatus::Marker)
        .expect("marker reported");
    let last_at = confs
        .iter()
        .position(|c| c.status == TakeoverOpStatus::LastTransConf)
        .expect("terminator reported");
    assert!(marker_at < last_at, "markers precede the terminator");
    assert_eq!(last_at, confs.len() - 1);

    // A second takeover mid-stream restarts cleanly instead of crashing.
    node.lqh.dispatch(Signal::TakeoverReq(TakeoverReq {
        new_tc_ref: new_tc,
        failed_node: TC_NODE,
    }));
    node.lqh.dispatch(Signal::TakeoverReq(TakeoverReq {
        new_tc_ref: new_tc,
        failed_node: TC_NODE,
    }));
    node.lqh.pump();
    let confs: Vec<_> = node
        .drain()
        .into_iter()
        .filter_map(|env| match env.signal {
            Signal::TakeoverConf(c) => Some(c),
            _ => None,
        })
        .collect();
    let terminators = confs
        .iter()
        .filter(|c| c.status == TakeoverOpStatus::LastTransConf)
        .count();
    assert_eq!(terminators, 1);
}

#[test]
fn node_refuses_traffic_before_started() {
    let mut node = TestNode::new(Config::default());
    assert_eq!(node.lqh.state, NodeState::Starting);
    let req = node.insert_req(7, 0, [1, 1], 1, 0, vec![1], vec![1], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(req));
    let refused = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::KeyRef(r) => Some(r.code),
        _ => None,
    });
    assert_eq!(refused, Some(codes::NODE_NOT_STARTED));
}

#[test]
fn dirty_write_commits_without_a_commit_phase() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    let req = node.insert_req(
        7,
        0,
        [8, 8],
        8,
        0,
        vec![5],
        vec![50],
        KeyReqFlags::DIRTY,
    );
    node.lqh.deliver(Signal::KeyReq(req));
    let entries = node.drained_packed();
    assert!(entries
        .iter()
        .any(|e| matches!(e, PackedEntry::KeyConf { client_op: 8, .. })));
    // Committed at prepare: row visible and op gone with no COMMIT
    // signal.
    assert_eq!(node.tup.borrow().row_count(7, 0), 1);
    assert_eq!(node.lqh.ops.pool.in_use(), 0);
}

#[test]
fn marker_removed_on_explicit_order() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    let req = node.insert_req(7, 0, [4, 4], 4, 0, vec![4], vec![40], KeyReqFlags::MARKER);
    node.lqh.deliver(Signal::KeyReq(req));
    node.drain();
    assert!(node.lqh.ops.find_marker([4, 4]).is_some());
    node.lqh
        .deliver(Signal::RemoveMarker(meridian_datanode::signal::RemoveMarkerOrd {
            transid: [4, 4],
        }));
    assert!(node.lqh.ops.find_marker([4, 4]).is_none());
    // A second removal is a timing artefact, not a crash.
    node.lqh
        .deliver(Signal::RemoveMarker(meridian_datanode::signal::RemoveMarkerOrd {
            transid: [4, 4],
        }));
}

#[test]
fn stale_commit_is_discarded() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    node.lqh.deliver(Signal::Commit(CommitOrd {
        lqh_op: 3,
        gci: 5,
        transid: [0xdead, 0xbeef],
        tc_op: 1,
    }));
    // No state was touched and nothing was sent.
    assert_eq!(node.lqh.ops.pool.in_use(), 0);
    assert!(node.drain().is_empty());
}

#[test]
fn duplicate_insert_refused_with_engine_verdict() {
    // An insert of an existing key aborts with the engine's verdict.
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    committed_insert(&mut node, [1, 1], 1, 0, vec![1], vec![10], 7);
    let dup = node.insert_req(7, 0, [2, 2], 2, 0, vec![1], vec![11], KeyReqFlags::empty());
    node.lqh.deliver(Signal::KeyReq(dup));
    let refused = node.drain().into_iter().find_map(|env| match env.signal {
        Signal::KeyRef(r) => Some(r),
        _ => None,
    });
    let r = refused.expect("duplicate insert refused");
    assert_eq!(r.code, codes::TUPLE_ALREADY_EXIST);
    assert_eq!(node.lqh.ops.pool.in_use(), 0);
    assert_eq!(node.tup.borrow().row_count(7, 0), 1);
}

#[test]
fn copy_credit_window_throttles_until_acked() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);

    let h = node.lqh.scans.pool.seize().unwrap();
    {
        let rec = node.lqh.scans.pool.get_mut(h);
        rec.copy = true;
        rec.transid = [0, 0x77];
    }
    assert!(node.lqh.copy_credit_consume(h, 5000));
    // The window is ~6000 words; the next row must wait.
    assert!(!node.lqh.copy_credit_consume(h, 2000));

    // The destination acks with the credited word count riding in the
    // first transid slot of the synthesized confirmation.
    node.lqh
        .deliver(Signal::KeyConf(meridian_datanode::signal::KeyConf {
            client_op: 0,
            lqh_op: 0,
            read_len: 0,
            transid: [4000, 0x77],
        }));
    assert!(node.lqh.copy_credit_consume(h, 2000));
    assert_eq!(node.lqh.scans.pool.get(h).words_outstanding, 3000);
}

#[test]
fn copy_fragment_streams_rows_and_completes_on_acks() {
    let mut node = TestNode::new(Config::default());
    node.start(StartType::Initial);
    node.add_table(7, 0);
    committed_insert(&mut node, [1, 1], 1, 0, vec![0xa], vec![10, 11], 7);
    committed_insert(&mut node, [2, 2], 2, 1, vec![0xb], vec![20], 7);
    committed_insert(&mut node, [3, 3], 3, 2, vec![0xc], vec![30, 31, 32], 7);

    let dest = NodeId(4);
    node.lqh.deliver(Signal::CopyFragReq(CopyFragReq {
        sender_ref: dih_ref(),
        table: 7,
        fragment: 0,
        dest_node: dest,
        transid: [0, 0xc0],
    }));

    // Play the destination: apply each streamed row through this node's
    // own write path and route the packed acknowledgements home.
    let mut rows_streamed = 0;
    let mut done = None;
    for _ in 0..8 {
        let envs = node.drain();
        if envs.is_empty() {
            break;
        }
        for env in envs {
            match env.signal {
                Signal::KeyReq(req) if env.to.node == dest => {
                    assert!(req.flags.contains(KeyReqFlags::COPY));
                    assert!(req.flags.contains(KeyReqFlags::DIRTY));
                    rows_streamed += 1;
                    node.lqh.deliver(Signal::KeyReq(req));
                }
                Signal::Packed(words) if env.to.node == OWN_NODE => {
                    node.lqh.deliver(Signal::Packed(words));
                }
                Signal::CopyFragConf(c) => done = Some(c),
                _ => {}
            }
        }
    }
    assert_eq!(rows_streamed, 3);
    let c = done.expect("copy completes after the last ack");
    assert_eq!(c.rows_copied, 3);
    // The stream tore its record, cursor and destination mark down.
    assert_eq!(node.lqh.scans.pool.in_use(), 0);
    let frag_h = node.lqh.frags.find(7, 0).unwrap();
    assert!(node.lqh.frags.pool.get(frag_h).copy_dest.is_none());
}
