//! Packed signals: small control messages bound for the same peer are
//! coalesced into one payload of at most 25 words and split again at the
//! receiver. The top 4 bits of an entry's first word carry its kind.

use hashbrown::HashMap;

use crate::node::Lqh;
use crate::signal::{
    Block, BlockRef, CommitOrd, CompleteOrd, KeyConf, NodeId, RemoveMarkerOrd, Signal, TransId,
};

pub const PACKED_WORDS: usize = 25;

/// Op-reference sentinel for chained forwards: the sender does not know
/// the receiver's op index, so the receiver resolves by identity.
pub const UNKNOWN_OP: u32 = (1 << 28) - 1;

const KIND_SHIFT: u32 = 28;
const REF_MASK: u32 = (1 << KIND_SHIFT) - 1;

const KIND_COMMIT: u32 = 1;
const KIND_COMPLETE: u32 = 2;
const KIND_COMMITTED: u32 = 3;
const KIND_COMPLETED: u32 = 4;
const KIND_KEY_CONF: u32 = 5;
const KIND_REMOVE_MARKER: u32 = 6;

fn tag(kind: u32, reference: u32) -> u32 {
    debug_assert_eq!(reference & !REF_MASK, 0, "reference overflows 28 bits");
    (kind << KIND_SHIFT) | (reference & REF_MASK)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackedEntry {
    Commit {
        lqh_op: u32,
        gci: u32,
        transid: TransId,
        tc_op: u32,
    },
    Complete {
        lqh_op: u32,
        transid: TransId,
        tc_op: u32,
    },
    Committed { tc_op: u32, transid: TransId },
    Completed { tc_op: u32, transid: TransId },
    KeyConf {
        client_op: u32,
        lqh_op: u32,
        read_len: u32,
        transid: TransId,
    },
    RemoveMarker { transid: TransId },
}

impl PackedEntry {
    pub fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            PackedEntry::Commit {
                lqh_op,
                gci,
                transid,
                tc_op,
            } => {
                out.extend([tag(KIND_COMMIT, lqh_op), gci, transid[0], transid[1], tc_op]);
            }
            PackedEntry::Complete {
                lqh_op,
                transid,
                tc_op,
            } => {
                out.extend([tag(KIND_COMPLETE, lqh_op), transid[0], transid[1], tc_op]);
            }
            PackedEntry::Committed { tc_op, transid } => {
                out.extend([tag(KIND_COMMITTED, tc_op), transid[0], transid[1]]);
            }
            PackedEntry::Completed { tc_op, transid } => {
                out.extend([tag(KIND_COMPLETED, tc_op), transid[0], transid[1]]);
            }
            PackedEntry::KeyConf {
                client_op,
                lqh_op,
                read_len,
                transid,
            } => {
                out.extend([
                    tag(KIND_KEY_CONF, client_op),
                    lqh_op,
                    read_len,
                    transid[0],
                    transid[1],
                ]);
            }
            PackedEntry::RemoveMarker { transid } => {
                out.extend([tag(KIND_REMOVE_MARKER, 0), transid[0], transid[1]]);
            }
        }
    }

    pub fn words(&self) -> usize {
        match self {
            PackedEntry::Commit { .. } => 5,
            PackedEntry::Complete { .. } => 4,
            PackedEntry::Committed { .. } => 3,
            PackedEntry::Completed { .. } => 3,
            PackedEntry::KeyConf { .. } => 5,
            PackedEntry::RemoveMarker { .. } => 3,
        }
    }
}

/// Splits a packed payload. Returns None on a malformed buffer; the
/// caller discards it with a warning rather than crashing on peer bugs.
pub fn decode(words: &[u32]) -> Option<Vec<PackedEntry>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let first = words[i];
        let kind = first >> KIND_SHIFT;
        let reference = first & REF_MASK;
        let entry = match kind {
            KIND_COMMIT => {
                if i + 5 > words.len() {
                    return None;
                }
                PackedEntry::Commit {
                    lqh_op: reference,
                    gci: words[i + 1],
                    transid: [words[i + 2], words[i + 3]],
                    tc_op: words[i + 4],
                }
            }
            KIND_COMPLETE => {
                if i + 4 > words.len() {
                    return None;
                }
                PackedEntry::Complete {
                    lqh_op: reference,
                    transid: [words[i + 1], words[i + 2]],
                    tc_op: words[i + 3],
                }
            }
            KIND_COMMITTED => {
                if i + 3 > words.len() {
                    return None;
                }
                PackedEntry::Committed {
                    tc_op: reference,
                    transid: [words[i + 1], words[i + 2]],
                }
            }
            KIND_COMPLETED => {
                if i + 3 > words.len() {
                    return None;
                }
                PackedEntry::Completed {
                    tc_op: reference,
                    transid: [words[i + 1], words[i + 2]],
                }
            }
            KIND_KEY_CONF => {
                if i + 5 > words.len() {
                    return None;
                }
                PackedEntry::KeyConf {
                    client_op: reference,
                    lqh_op: words[i + 1],
                    read_len: words[i + 2],
                    transid: [words[i + 3], words[i + 4]],
                }
            }
            KIND_REMOVE_MARKER => {
                if i + 3 > words.len() {
                    return None;
                }
                PackedEntry::RemoveMarker {
                    transid: [words[i + 1], words[i + 2]],
                }
            }
            _ => return None,
        };
        i += entry.words();
        out.push(entry);
    }
    Some(out)
}

/// One fill-and-flush buffer per destination block.
#[derive(Default)]
pub struct PackedBuffers {
    buffers: HashMap<(NodeId, Block), Vec<u32>>,
}

impl PackedBuffers {
    /// Appends an entry, returning a full payload that must be sent first
    /// when the buffer would overflow.
    pub fn push(&mut self, node: NodeId, block: Block, entry: &PackedEntry) -> Option<Vec<u32>> {
        let buf = self.buffers.entry((node, block)).or_default();
        let flushed = if buf.len() + entry.words() > PACKED_WORDS {
            Some(std::mem::take(buf))
        } else {
            None
        };
        let buf = self.buffers.entry((node, block)).or_default();
        entry.encode(buf);
        flushed
    }

    pub fn drain_all(&mut self) -> Vec<(NodeId, Block, Vec<u32>)> {
        let mut out = Vec::new();
        for ((node, block), buf) in self.buffers.iter_mut() {
            if !buf.is_empty() {
                out.push((*node, *block, std::mem::take(buf)));
            }
        }
        out
    }
}

impl Lqh {
    pub(crate) fn pack_to(&mut self, node: NodeId, block: Block, entry: PackedEntry) {
        if let Some(full) = self.packed.push(node, block, &entry) {
            self.send(BlockRef::new(node, block), Signal::Packed(full));
        }
    }

    /// FIFO per destination is preserved: buffers flush in one piece at
    /// the end of every dispatch round.
    pub(crate) fn send_packed_all(&mut self) {
        for (node, block, words) in self.packed.drain_all() {
            self.send(BlockRef::new(node, block), Signal::Packed(words));
        }
    }

    pub(crate) fn handle_packed(&mut self, words: Vec<u32>) {
        let Some(entries) = decode(&words) else {
            tracing::warn!("malformed packed payload of {} words discarded", words.len());
            return;
        };
        for entry in entries {
            match entry {
                PackedEntry::Commit {
                    lqh_op,
                    gci,
                    transid,
                    tc_op,
                } => {
                    self.handle_commit(CommitOrd {
                        lqh_op,
                        gci,
                        transid,
                        tc_op,
                    });
                }
                PackedEntry::Complete {
                    lqh_op,
                    transid,
                    tc_op,
                } => {
                    self.handle_complete(CompleteOrd {
                        lqh_op,
                        transid,
                        tc_op,
                    });
                }
                PackedEntry::RemoveMarker { transid } => {
                    self.handle_remove_marker(RemoveMarkerOrd { transid });
                }
                PackedEntry::KeyConf {
                    client_op,
                    lqh_op,
                    read_len,
                    transid,
                } => {
                    self.handle_copy_key_conf(KeyConf {
                        client_op,
                        lqh_op,
                        read_len,
                        transid,
                    });
                }
                PackedEntry::Committed { .. } | PackedEntry::Completed { .. } => {
                    tracing::warn!("coordinator-bound packed entry at a data node; discarded");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let entries = vec![
            PackedEntry::Commit {
                lqh_op: 12,
                gci: 42,
                transid: [0x100, 0x200],
                tc_op: 9,
            },
            PackedEntry::KeyConf {
                client_op: 3,
                lqh_op: 9,
                read_len: 0,
                transid: [7, 8],
            },
            PackedEntry::RemoveMarker { transid: [1, 2] },
            PackedEntry::Completed {
                tc_op: 77,
                transid: [5, 6],
            },
        ];
        let mut words = Vec::new();
        for e in &entries {
            e.encode(&mut words);
        }
        assert_eq!(decode(&words).unwrap(), entries);
    }

    #[test]
    fn malformed_payload_rejected() {
        // A commit entry cut short.
        let words = vec![(1u32 << 28) | 5, 42];
        assert!(decode(&words).is_none());
        // An unknown kind.
        let words = vec![15u32 << 28];
        assert!(decode(&words).is_none());
    }

    #[test]
    fn buffer_flushes_before_overflow() {
        let mut bufs = PackedBuffers::default();
        let node = NodeId(2);
        let entry = PackedEntry::Commit {
            lqh_op: 1,
            gci: 1,
            transid: [0, 0],
            tc_op: 2,
        };
        // Five 5-word commits fit (25 words); the sixth forces a flush.
        for _ in 0..5 {
            assert!(bufs.push(node, Block::Lqh, &entry).is_none());
        }
        let flushed = bufs.push(node, Block::Lqh, &entry).unwrap();
        assert_eq!(flushed.len(), 25);
        let rest = bufs.drain_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].2.len(), 5);
    }
}
