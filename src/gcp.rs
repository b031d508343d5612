//! The global-checkpoint save coordinator: drives every log part's
//! completed-GCI record onto disk and answers once all four are synced.

use crate::log::files::LogPartState;
use crate::log::{GcpWritePos, LOG_PARTS};
use crate::node::{Lqh, NodeState};
use crate::signal::{BlockRef, GcpSaveConf, GcpSaveRef, GcpSaveReq, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcpPartState {
    /// The completed-GCI record has not been appended yet.
    #[default]
    WaitWrite,
    /// Appended; waiting for the write cursor to pass it.
    WaitDisk,
    SyncIssued,
    OnDisk,
}

#[derive(Debug, Clone, Copy)]
pub struct GcpRecord {
    pub requester: BlockRef,
    pub dih_ptr: u32,
    pub gci: u32,
    pub part_pos: [Option<GcpWritePos>; LOG_PARTS],
    pub part_state: [GcpPartState; LOG_PARTS],
}

#[derive(Default)]
pub struct GcpCoordinator {
    pub active: Option<GcpRecord>,
}

impl Lqh {
    pub(crate) fn handle_gcp_save_req(&mut self, req: GcpSaveReq) {
        let node = self.own_node;
        if self.state != NodeState::Started {
            self.send(
                req.dih_ref,
                Signal::GcpSaveRef(GcpSaveRef {
                    dih_ptr: req.dih_ptr,
                    node,
                    gci: req.gci,
                    code: crate::error::codes::NODE_NOT_STARTED,
                }),
            );
            return;
        }
        if let Some(rec) = &mut self.gcp.active {
            if rec.gci == req.gci {
                // A new master is asking the question again; rebind the
                // reply target.
                rec.requester = req.dih_ref;
                rec.dih_ptr = req.dih_ptr;
                return;
            }
            tracing::warn!(
                in_flight = rec.gci,
                asked = req.gci,
                "global checkpoint save while another is in flight; refused"
            );
            self.send(
                req.dih_ref,
                Signal::GcpSaveRef(GcpSaveRef {
                    dih_ptr: req.dih_ptr,
                    node,
                    gci: req.gci,
                    code: crate::error::codes::NODE_NOT_STARTED,
                }),
            );
            return;
        }
        if req.gci == self.newest_completed_gci {
            // Already durable; the previous master got this answer before
            // it failed.
            self.send(
                req.dih_ref,
                Signal::GcpSaveConf(GcpSaveConf {
                    dih_ptr: req.dih_ptr,
                    node,
                    gci: req.gci,
                }),
            );
            return;
        }

        self.newest_completed_gci = req.gci;
        self.gcp.active = Some(GcpRecord {
            requester: req.dih_ref,
            dih_ptr: req.dih_ptr,
            gci: req.gci,
            part_pos: [None; LOG_PARTS],
            part_state: [GcpPartState::WaitWrite; LOG_PARTS],
        });
        for part_id in 0..LOG_PARTS as u32 {
            let idle = {
                let part = &self.redo.parts[part_id as usize];
                part.active_op.is_none() && part.state == LogPartState::Idle
            };
            if idle {
                self.gcp_append_completed(part_id);
            } else {
                // The current writer finishes first, then the record goes
                // out through the same serialised appender.
                let part = &mut self.redo.parts[part_id as usize];
                part.write_completed_gci_after_write = true;
                part.pending_completed_gci = req.gci;
            }
        }
    }

    /// The appender drained with a completed-GCI request pending.
    pub(crate) fn gcp_write_pending(&mut self, part_id: u32) {
        self.redo.parts[part_id as usize].write_completed_gci_after_write = false;
        self.gcp_append_completed(part_id);
    }

    fn gcp_append_completed(&mut self, part_id: u32) {
        let Some(gci) = self.gcp.active.as_ref().map(|r| r.gci) else {
            return;
        };
        let res = {
            let io = self.io.as_mut();
            self.redo
                .append_completed_gci(part_id, gci, io, &mut self.inbox)
        };
        match res {
            Ok(pos) => {
                if let Some(rec) = &mut self.gcp.active {
                    rec.part_pos[part_id as usize] = Some(pos);
                    rec.part_state[part_id as usize] = GcpPartState::WaitDisk;
                }
                self.gcp_check_progress();
            }
            Err(code) => {
                // Log pressure; the supervision tick retries.
                tracing::warn!(part = part_id, code, "completed-GCI record deferred");
                let part = &mut self.redo.parts[part_id as usize];
                part.write_completed_gci_after_write = true;
                part.pending_completed_gci = gci;
            }
        }
    }

    /// One-second supervision and flush-confirmation hook: move parts
    /// from waiting-on-disk to synced, retry deferred writes.
    pub(crate) fn gcp_tick(&mut self) {
        if self.gcp.active.is_none() {
            return;
        }
        for part_id in 0..LOG_PARTS as u32 {
            let retry = {
                let part = &self.redo.parts[part_id as usize];
                part.write_completed_gci_after_write
                    && part.active_op.is_none()
                    && part.state == LogPartState::Idle
            };
            if retry {
                self.gcp_write_pending(part_id);
            }
        }
        self.gcp_check_progress();
    }

    fn gcp_check_progress(&mut self) {
        let Some(rec) = self.gcp.active else { return };
        for part_id in 0..LOG_PARTS {
            if rec.part_state[part_id] != GcpPartState::WaitDisk {
                continue;
            }
            let Some(pos) = rec.part_pos[part_id] else {
                continue;
            };
            let confirmed = self.redo.parts[part_id].confirmed_flush_seq;
            if confirmed >= pos.flush_seq {
                // The record's pages are on their way down; pin them with
                // an explicit sync.
                let os_file = self.redo.files.get(pos.file).os_file;
                if let Some(rec) = &mut self.gcp.active {
                    rec.part_state[part_id] = GcpPartState::SyncIssued;
                }
                let io = self.io.as_mut();
                io.sync(os_file, part_id as u32, &mut self.inbox);
            }
        }
        self.gcp_maybe_done();
    }

    pub(crate) fn gcp_sync_confirmed(&mut self, part_id: u32) {
        if let Some(rec) = &mut self.gcp.active {
            if (part_id as usize) < LOG_PARTS {
                rec.part_state[part_id as usize] = GcpPartState::OnDisk;
            }
        }
        self.gcp_maybe_done();
    }

    fn gcp_maybe_done(&mut self) {
        let done = match &self.gcp.active {
            Some(rec) => rec
                .part_state
                .iter()
                .all(|&s| s == GcpPartState::OnDisk),
            None => return,
        };
        if !done {
            return;
        }
        let rec = self.gcp.active.take().unwrap();
        let node = self.own_node;
        tracing::debug!(gci = rec.gci, "global checkpoint durable on all log parts");
        self.send(
            rec.requester,
            Signal::GcpSaveConf(GcpSaveConf {
                dih_ptr: rec.dih_ptr,
                node,
                gci: rec.gci,
            }),
        );
    }
}
