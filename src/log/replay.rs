//! Restart execution of the redo log.
//!
//! Three stages per part: locate the head (file 0 names the current file,
//! the megabyte whose log lap disagrees bounds the head, the last
//! current-lap page inside it is the write cursor), execute the log
//! forward re-applying every needed commit, then rewrite every
//! current-lap page after the new head with lap zero so the next restart
//! finds an unambiguous head.

use std::collections::VecDeque;

use super::files::{LfoH, LfoKind, RedoLog};
use super::page::PageH;
use super::{
    hdr, records, LogEvent, FD_HEADER_WORDS, FD_PER_FILE_WORDS, MBYTES_PER_FILE, PAGES_PER_FILE,
    PAGES_PER_MBYTE, PAGE_BYTES, PAGE_HEADER_WORDS, PAGE_USABLE_WORDS, PAGE_VERSION, PAGE_WORDS,
    SR_READ_BATCH_PAGES,
};
use crate::error::LogDiagnostic;
use crate::io::Io;
use crate::signal::Inbox;

/// A commit record lifted off the log during execution.
#[derive(Debug, Clone, Copy)]
pub struct CommitRec {
    pub table: u32,
    pub schema_version: u32,
    pub fragment: u32,
    pub prep_file_no: u32,
    pub prep_start_page: u32,
    pub prep_start_index: u32,
    pub prep_stop_page: u32,
    pub gci: u32,
}

/// The prepare a commit points back at, decoded.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub hash: u32,
    pub op_kind: u32,
    pub key: Vec<u32>,
    pub attr: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecSrState {
    #[default]
    Idle,
    ReadFileZero,
    ReadCurrentFd,
    ChainFd,
    FindHeadMbyte,
    FindHeadPage,
    HeadDone,
    Executing,
    InvalidateRead,
    InvalidateWrite,
    RestoreHeadPage,
    WritePageZero,
    Done,
}

/// What the execution loop wants from its caller.
#[derive(Debug)]
pub enum ExecOutcome {
    /// File reads are in flight; call again on the next ExecReady.
    Waiting,
    /// A commit inside the replay bounds; the caller decides whether any
    /// local fragment needs it, then resumes the loop.
    CommitFound(CommitRec),
    /// This part has executed its whole range for the current pass.
    PartDone,
}

#[derive(Default)]
pub struct ExecSr {
    pub state: ExecSrState,
    pub log_start_gci: u32,
    pub log_last_gci: u32,
    /// Log lap of the head file, discovered from file 0.
    pub lap: u32,
    pub current_file_no: u32,
    /// End of the written log: (file_no, filepage, word index).
    pub head: Option<(u32, u32, u32)>,
    /// Position right after the completed-GCI record that matches
    /// `log_last_gci`; becomes the new head.
    pub completed_head: Option<(u32, u32, u32)>,
    pub start_file_no: u32,
    pub start_mbyte: u32,
    pub stop_file_no: u32,
    pub stop_mbyte: u32,
    pub head_mbyte: u32,
    /// Execution cursor.
    pub read_file_no: u32,
    pub cursor_page: u32,
    pub cursor_index: usize,
    pub window: VecDeque<PageH>,
    pub window_first: u32,
    pub reads_outstanding: u32,
    pub prep_pages: Vec<PageH>,
    pub prep_reads_outstanding: u32,
    pub pending_prep_pos: Option<(u32, u32, u32, u32)>,
    pub fetched_prep: Option<PreparedRecord>,
    /// Head-page scan bookkeeping.
    pub scan_filepage: u32,
    /// Invalidation cursor.
    pub inval_file_no: u32,
    pub inval_filepage: u32,
}

impl ExecSr {
    fn diag(&self, part: u32) -> LogDiagnostic {
        LogDiagnostic {
            part,
            file_no: self.read_file_no,
            mbyte: self.cursor_page / PAGES_PER_MBYTE,
            page: self.cursor_page,
            word: self.cursor_index as u32,
        }
    }
}

impl RedoLog {
    /// Begins head location for a part whose files are open.
    pub fn start_head_find(
        &mut self,
        part_id: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        if self.diskless {
            // Nothing on disk to trust; synthesise a pristine lap-1 log.
            let part = &mut self.parts[part_id as usize];
            part.log_lap = 1;
            part.current_file = part.first_file;
            part.current_mbyte = 0;
            part.current_filepage = 1;
            part.mbyte_words_left = (PAGES_PER_MBYTE - 1) * PAGE_USABLE_WORDS;
            part.exec.state = ExecSrState::Done;
            part.exec.head = Some((0, 1, PAGE_HEADER_WORDS as u32));
            part.exec.completed_head = part.exec.head;
            return LogEvent::HeadLocated { part: part_id };
        }
        self.parts[part_id as usize].exec.state = ExecSrState::ReadFileZero;
        let file0 = self.parts[part_id as usize].first_file.unwrap();
        self.read_one_page(part_id, file0, 0, |page| LfoKind::SrReadFileZero { page }, io, inbox);
        LogEvent::None
    }

    fn read_one_page(
        &mut self,
        part_id: u32,
        file_h: super::files::FileH,
        filepage: u32,
        kind: impl FnOnce(PageH) -> LfoKind,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) {
        let page_h = self.pages.seize().expect("no free page for restart read");
        self.pages.get_mut(page_h).filepage = filepage;
        let os_file = self.files.get(file_h).os_file;
        let lfo = self.seize_lfo(part_id, Some(file_h), kind(page_h));
        let buf = self.pages.get_mut(page_h).bytes_mut();
        io.read(os_file, filepage as u64 * PAGE_BYTES as u64, buf, lfo.0, inbox);
    }

    /// Routes a confirmed restart read to the right stage.
    pub fn read_confirmed(
        &mut self,
        lfo_index: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let lfo_h = LfoH(lfo_index);
        let part_id = self.lfos.get(lfo_h).part;
        let kind = std::mem::take(&mut self.lfos.get_mut(lfo_h).kind);
        self.lfos.release(lfo_h);
        match kind {
            LfoKind::SrReadFileZero { page } => self.got_file_zero(part_id, page, io, inbox),
            LfoKind::SrReadFd { page } => self.got_fd_page(part_id, page, io, inbox),
            LfoKind::SrReadMbyteFirst { page, mbyte } => {
                self.got_mbyte_first(part_id, page, mbyte, io, inbox)
            }
            LfoKind::SrReadHeadPage { page, filepage } => {
                self.got_head_page(part_id, page, filepage, io, inbox)
            }
            LfoKind::SrReadExecBatch { pages, first_filepage } => {
                self.got_exec_batch(part_id, pages, first_filepage)
            }
            LfoKind::SrReadPrepare { pages, start_page } => {
                self.got_prep_pages(part_id, pages, start_page)
            }
            LfoKind::SrInvalidateRead { page, filepage } => {
                self.got_invalidate_page(part_id, page, filepage, io, inbox)
            }
            other => {
                self.lfos_unreachable(part_id, other);
                LogEvent::None
            }
        }
    }

    fn lfos_unreachable(&self, part_id: u32, _kind: LfoKind) {
        panic!("unexpected read completion on part {part_id}");
    }

    /// Restart writes: invalidation steps and neutralised-commit pages.
    pub(super) fn sr_write_confirmed(
        &mut self,
        part_id: u32,
        kind: LfoKind,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        match kind {
            LfoKind::SrWriteDirtyPage { page: _ } => LogEvent::None,
            LfoKind::SrInvalidateWrite { page, filepage } => {
                self.pages.release(page);
                self.invalidate_advance(part_id, filepage, io, inbox)
            }
            LfoKind::SrWritePageZero { page } => {
                self.pages.release(page);
                self.read_head_page_back(part_id, io, inbox);
                LogEvent::None
            }
            _ => panic!("unexpected write completion on part {part_id}"),
        }
    }

    fn got_file_zero(
        &mut self,
        part_id: u32,
        page: PageH,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        self.verify_page(part_id, page, 0);
        let lap = self.pages.get(page).log_lap();
        let current_file_no = self.load_fd_page(part_id, page);
        self.pages.release(page);
        {
            let part = &mut self.parts[part_id as usize];
            part.log_lap = lap;
            part.exec.lap = lap;
            part.exec.current_file_no = current_file_no;
            part.exec.state = ExecSrState::ReadCurrentFd;
            part.current_file = None;
        }
        let current = self.file_by_no(part_id, current_file_no);
        self.parts[part_id as usize].current_file = Some(current);
        self.read_one_page(part_id, current, 0, |page| LfoKind::SrReadFd { page }, io, inbox);
        LogEvent::None
    }

    fn got_fd_page(
        &mut self,
        part_id: u32,
        page: PageH,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        self.verify_page(part_id, page, 0);
        self.load_fd_page(part_id, page);
        self.pages.release(page);

        // Chain backwards until every file's summaries are known.
        let mut unloaded = None;
        {
            let part = &self.parts[part_id as usize];
            let mut h = part.first_file.unwrap();
            for _ in 0..part.no_files {
                let file = self.files.get(h);
                if !file.fd_loaded {
                    unloaded = Some(file.file_no);
                    break;
                }
                h = file.next.unwrap();
            }
        }
        match unloaded {
            Some(file_no) => {
                // The descriptor written on the change into `file_no + 1`
                // covers this file.
                let no_files = self.parts[part_id as usize].no_files;
                let covering = (file_no + 1) % no_files;
                self.parts[part_id as usize].exec.state = ExecSrState::ChainFd;
                let h = self.file_by_no(part_id, covering);
                self.read_one_page(part_id, h, 0, |page| LfoKind::SrReadFd { page }, io, inbox);
                LogEvent::None
            }
            None => {
                self.parts[part_id as usize].exec.state = ExecSrState::FindHeadMbyte;
                self.read_mbyte_first(part_id, 1, io, inbox);
                LogEvent::None
            }
        }
    }

    fn read_mbyte_first(&mut self, part_id: u32, mbyte: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let current = self.parts[part_id as usize].current_file_h();
        self.read_one_page(
            part_id,
            current,
            mbyte * PAGES_PER_MBYTE,
            move |page| LfoKind::SrReadMbyteFirst { page, mbyte },
            io,
            inbox,
        );
    }

    fn got_mbyte_first(
        &mut self,
        part_id: u32,
        page: PageH,
        mbyte: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let lap = self.pages.get(page).log_lap();
        let expected = self.parts[part_id as usize].exec.lap;
        if lap == expected {
            self.verify_page(part_id, page, mbyte * PAGES_PER_MBYTE);
            // This megabyte was written on the current lap. Its header
            // carries the state as of the megabyte start, which closes the
            // previous megabyte's summary.
            let completed = self.pages.get(page).word(hdr::MAX_GCI_COMPLETED);
            let started = self.pages.get(page).word(hdr::MAX_GCI_STARTED);
            let prep_ref = self.pages.get(page).word(hdr::LAST_PREP_REF);
            let current = self.parts[part_id as usize].current_file_h();
            let file = self.files.get_mut(current);
            file.max_gci_completed[(mbyte - 1) as usize] = completed;
            file.max_gci_started[(mbyte - 1) as usize] = started;
            file.last_prep_ref[(mbyte - 1) as usize] = prep_ref;
            self.pages.release(page);
            if mbyte + 1 < MBYTES_PER_FILE {
                self.read_mbyte_first(part_id, mbyte + 1, io, inbox);
                return LogEvent::None;
            }
            // Whole file written on this lap; the head is in the last
            // megabyte.
            self.begin_head_page_scan(part_id, MBYTES_PER_FILE - 1, io, inbox);
        } else {
            self.pages.release(page);
            self.begin_head_page_scan(part_id, mbyte - 1, io, inbox);
        }
        LogEvent::None
    }

    fn begin_head_page_scan(
        &mut self,
        part_id: u32,
        head_mbyte: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) {
        let exec = &mut self.parts[part_id as usize].exec;
        exec.state = ExecSrState::FindHeadPage;
        exec.head_mbyte = head_mbyte;
        exec.head = None;
        let first = if head_mbyte == 0 {
            1
        } else {
            head_mbyte * PAGES_PER_MBYTE
        };
        exec.scan_filepage = first;
        let current = self.parts[part_id as usize].current_file_h();
        self.read_one_page(
            part_id,
            current,
            first,
            move |page| LfoKind::SrReadHeadPage { page, filepage: first },
            io,
            inbox,
        );
    }

    fn got_head_page(
        &mut self,
        part_id: u32,
        page: PageH,
        filepage: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let state = self.parts[part_id as usize].exec.state;
        if state == ExecSrState::RestoreHeadPage {
            return self.install_head_page(part_id, page, filepage);
        }
        let lap = self.pages.get(page).log_lap();
        let expected = self.parts[part_id as usize].exec.lap;
        let head_mbyte = self.parts[part_id as usize].exec.head_mbyte;
        if lap == expected {
            self.verify_page(part_id, page, filepage);
            let index = self.pages.get(page).curr_page_index();
            let completed = self.pages.get(page).word(hdr::MAX_GCI_COMPLETED);
            let started = self.pages.get(page).word(hdr::MAX_GCI_STARTED);
            let prep_ref = self.pages.get(page).word(hdr::LAST_PREP_REF);
            self.pages.release(page);
            {
                let current = self.parts[part_id as usize].current_file_h();
                let file_no = self.files.get(current).file_no;
                let file = self.files.get_mut(current);
                file.max_gci_completed[head_mbyte as usize] = completed;
                file.max_gci_started[head_mbyte as usize] = started;
                file.last_prep_ref[head_mbyte as usize] = prep_ref;
                let part = &mut self.parts[part_id as usize];
                part.exec.head = Some((file_no, filepage, index));
                part.newest_gci = started;
                if part.newest_completed_gci < completed {
                    part.newest_completed_gci = completed;
                }
            }
            let next = filepage + 1;
            if next % PAGES_PER_MBYTE != 0 {
                self.parts[part_id as usize].exec.scan_filepage = next;
                let current = self.parts[part_id as usize].current_file_h();
                self.read_one_page(
                    part_id,
                    current,
                    next,
                    move |page| LfoKind::SrReadHeadPage { page, filepage: next },
                    io,
                    inbox,
                );
                return LogEvent::None;
            }
        } else {
            self.pages.release(page);
        }
        // Either the lap broke or the megabyte is exhausted.
        if self.parts[part_id as usize].exec.head.is_none() {
            // The megabyte's first page never made it: head is the start
            // of the megabyte.
            let current = self.parts[part_id as usize].current_file_h();
            let file_no = self.files.get(current).file_no;
            let first = if head_mbyte == 0 {
                1
            } else {
                head_mbyte * PAGES_PER_MBYTE
            };
            let part = &mut self.parts[part_id as usize];
            part.exec.head = Some((file_no, first, PAGE_HEADER_WORDS as u32));
        }
        self.parts[part_id as usize].exec.state = ExecSrState::HeadDone;
        tracing::info!(
            part = part_id,
            head = ?self.parts[part_id as usize].exec.head,
            "redo log head located"
        );
        LogEvent::HeadLocated { part: part_id }
    }

    /// Computes the replay range for a part from the per-mbyte summaries.
    /// Walks backward from the head: the stop megabyte is the last that
    /// can hold a relevant commit, the start megabyte the first that can,
    /// widened to cover outstanding prepares.
    pub fn set_exec_bounds(&mut self, part_id: u32, log_start_gci: u32, log_last_gci: u32) {
        let (head_file_no, head_filepage, _) = self.parts[part_id as usize]
            .exec
            .head
            .expect("bounds before head location");
        let head_mbyte = head_filepage / PAGES_PER_MBYTE;
        let no_files = self.parts[part_id as usize].no_files;

        let mut file_no = head_file_no;
        let mut mbyte = head_mbyte;
        let mut stop = (head_file_no, head_mbyte);
        let mut steps = 0u32;
        let max_steps = no_files * MBYTES_PER_FILE;
        // Stop megabyte.
        loop {
            let h = self.file_by_no(part_id, file_no);
            if self.files.get(h).max_gci_completed[mbyte as usize] < log_last_gci {
                stop = (file_no, mbyte);
                break;
            }
            steps += 1;
            if steps >= max_steps {
                break;
            }
            if mbyte == 0 {
                file_no = (file_no + no_files - 1) % no_files;
                mbyte = MBYTES_PER_FILE - 1;
            } else {
                mbyte -= 1;
            }
        }
        // Start megabyte: continue backward until nothing as new as the
        // oldest needed GCI was committed there.
        let mut start = stop;
        loop {
            let h = self.file_by_no(part_id, file_no);
            let file = self.files.get(h);
            if file.max_gci_started[mbyte as usize] < log_start_gci {
                let (prep_file, prep_mbyte) =
                    super::decode_prep_ref(file.last_prep_ref[mbyte as usize]);
                start = (prep_file, prep_mbyte);
                break;
            }
            start = (file_no, mbyte);
            steps += 1;
            if steps >= max_steps {
                break;
            }
            if mbyte == 0 {
                file_no = (file_no + no_files - 1) % no_files;
                mbyte = MBYTES_PER_FILE - 1;
            } else {
                mbyte -= 1;
            }
        }

        let exec = &mut self.parts[part_id as usize].exec;
        exec.log_start_gci = log_start_gci;
        exec.log_last_gci = log_last_gci;
        exec.start_file_no = start.0;
        exec.start_mbyte = start.1;
        exec.stop_file_no = stop.0;
        exec.stop_mbyte = stop.1;
        tracing::debug!(
            part = part_id,
            ?start,
            ?stop,
            log_start_gci,
            log_last_gci,
            "replay bounds"
        );
    }

    /// Rewinds the cursor to the start megabyte and fills the window.
    pub fn start_exec_pass(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let pages: Vec<PageH> = {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.state = ExecSrState::Executing;
            exec.completed_head = None;
            exec.read_file_no = exec.start_file_no;
            exec.cursor_page = exec.start_mbyte * PAGES_PER_MBYTE;
            exec.cursor_index = PAGE_HEADER_WORDS;
            exec.window_first = exec.cursor_page;
            exec.window.drain(..).collect()
        };
        for p in pages {
            self.pages.release(p);
        }
        self.issue_exec_reads(part_id, io, inbox);
    }

    fn issue_exec_reads(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let (file_no, next_filepage, limit) = {
            let exec = &self.parts[part_id as usize].exec;
            let next = exec.window_first + exec.window.len() as u32 + exec.reads_outstanding;
            let head = exec.head.expect("exec without head");
            let limit = if head.0 == exec.read_file_no {
                head.1 + 1
            } else {
                PAGES_PER_FILE
            };
            (exec.read_file_no, next, limit)
        };
        if next_filepage >= limit {
            return;
        }
        let count = SR_READ_BATCH_PAGES.min(limit - next_filepage);
        let file_h = self.file_by_no(part_id, file_no);
        for i in 0..count {
            let filepage = next_filepage + i;
            self.parts[part_id as usize].exec.reads_outstanding += 1;
            self.read_one_page(
                part_id,
                file_h,
                filepage,
                move |page| LfoKind::SrReadExecBatch {
                    pages: vec![page],
                    first_filepage: filepage,
                },
                io,
                inbox,
            );
        }
    }

    fn got_exec_batch(&mut self, part_id: u32, pages: Vec<PageH>, first_filepage: u32) -> LogEvent {
        for (i, page) in pages.into_iter().enumerate() {
            self.verify_page(part_id, page, first_filepage + i as u32);
            self.pages.get_mut(page).filepage = first_filepage + i as u32;
            let exec = &mut self.parts[part_id as usize].exec;
            exec.reads_outstanding -= 1;
            exec.window.push_back(page);
        }
        // Keep the window sorted; reads complete in order with both io
        // implementations, but rely on the filepage, not on luck.
        let mut sorted: Vec<PageH> = {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.window.drain(..).collect()
        };
        sorted.sort_by_key(|&h| self.pages.get(h).filepage);
        let first = sorted.first().map(|&h| self.pages.get(h).filepage);
        {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.window = sorted.into();
            if let Some(fp) = first {
                exec.window_first = fp;
            }
        }
        if self.parts[part_id as usize].exec.reads_outstanding == 0 {
            LogEvent::ExecReady { part: part_id }
        } else {
            LogEvent::None
        }
    }

    /// Words readable from the cursor within the buffered window.
    fn window_available(&self, part_id: u32) -> usize {
        let exec = &self.parts[part_id as usize].exec;
        let in_window = exec
            .window
            .iter()
            .position(|&h| self.pages.get(h).filepage == exec.cursor_page);
        match in_window {
            Some(pos) => {
                let pages_after = exec.window.len() - pos - 1;
                (PAGE_WORDS - exec.cursor_index) + pages_after * (PAGE_WORDS - PAGE_HEADER_WORDS)
            }
            None => 0,
        }
    }

    fn release_consumed(&mut self, part_id: u32) {
        loop {
            let (front, cursor_page) = {
                let exec = &self.parts[part_id as usize].exec;
                (exec.window.front().copied(), exec.cursor_page)
            };
            let Some(h) = front else {
                self.parts[part_id as usize].exec.window_first = cursor_page;
                break;
            };
            if self.pages.get(h).filepage >= cursor_page {
                break;
            }
            self.parts[part_id as usize].exec.window.pop_front();
            self.pages.release(h);
            let next_first = {
                let exec = &self.parts[part_id as usize].exec;
                exec.window.front().copied()
            };
            let fp = next_first
                .map(|f| self.pages.get(f).filepage)
                .unwrap_or(cursor_page);
            self.parts[part_id as usize].exec.window_first = fp;
        }
    }

    fn cursor_word(&self, part_id: u32, offset: usize) -> u32 {
        let exec = &self.parts[part_id as usize].exec;
        let mut page_idx = exec
            .window
            .iter()
            .position(|&h| self.pages.get(h).filepage == exec.cursor_page)
            .expect("cursor outside window");
        let mut index = exec.cursor_index + offset;
        loop {
            if index < PAGE_WORDS {
                let h = exec.window[page_idx];
                return self.pages.get(h).word(index);
            }
            index = index - PAGE_WORDS + PAGE_HEADER_WORDS;
            page_idx += 1;
        }
    }

    fn advance_cursor(&mut self, part_id: u32, words: usize) {
        let mut index = self.parts[part_id as usize].exec.cursor_index + words;
        let mut crossed_file = false;
        while index >= PAGE_WORDS {
            index = index - PAGE_WORDS + PAGE_HEADER_WORDS;
            let cursor_page = {
                let exec = &mut self.parts[part_id as usize].exec;
                exec.cursor_page += 1;
                exec.cursor_page
            };
            if cursor_page == PAGES_PER_FILE {
                // Exact fill of the last page of a file: continue in the
                // next file's descriptor page.
                self.advance_cursor_file(part_id);
                crossed_file = true;
                break;
            }
        }
        self.parts[part_id as usize].exec.cursor_index = if crossed_file {
            PAGE_HEADER_WORDS
        } else {
            index
        };
        self.release_consumed(part_id);
    }

    fn advance_cursor_file(&mut self, part_id: u32) {
        let pages: Vec<PageH> = self.parts[part_id as usize].exec.window.drain(..).collect();
        for p in pages {
            self.pages.release(p);
        }
        let no_files = self.parts[part_id as usize].no_files;
        let exec = &mut self.parts[part_id as usize].exec;
        exec.read_file_no = (exec.read_file_no + 1) % no_files;
        exec.cursor_page = 0;
        exec.window_first = 0;
        exec.reads_outstanding = 0;
    }

    fn jump_to_page(&mut self, part_id: u32, filepage: u32) {
        if filepage >= PAGES_PER_FILE {
            self.advance_cursor_file(part_id);
            let exec = &mut self.parts[part_id as usize].exec;
            exec.cursor_index = PAGE_HEADER_WORDS;
            return;
        }
        {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.cursor_page = filepage;
            exec.cursor_index = PAGE_HEADER_WORDS;
            if exec.window.is_empty() {
                exec.window_first = filepage;
            }
        }
        self.release_consumed(part_id);
    }

    fn at_head(&self, part_id: u32) -> bool {
        let exec = &self.parts[part_id as usize].exec;
        let (hf, hp, hi) = exec.head.expect("exec without head");
        exec.read_file_no == hf
            && (exec.cursor_page > hp
                || (exec.cursor_page == hp && exec.cursor_index as u32 >= hi))
    }

    /// The replay loop. Parses records forward until it needs file reads,
    /// finds a commit for the caller to judge, or reaches the head.
    pub fn exec_continue(
        &mut self,
        part_id: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> ExecOutcome {
        loop {
            if self.at_head(part_id) {
                let exec = &self.parts[part_id as usize].exec;
                if exec.completed_head.is_none() {
                    let diag = exec.diag(part_id);
                    panic!(
                        "log executed to the head without the expected completed-GCI {} record: {:?}",
                        exec.log_last_gci, diag
                    );
                }
                tracing::info!(part = part_id, "log execution pass complete");
                return ExecOutcome::PartDone;
            }
            if !self.ensure_window(part_id, 1, io, inbox) {
                return ExecOutcome::Waiting;
            }
            let ty = self.cursor_word(part_id, 0);
            match ty {
                records::PREP_OP => {
                    if !self.ensure_window(part_id, 2, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    let len = self.cursor_word(part_id, 1) as usize;
                    if !self.ensure_window(part_id, len, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    self.advance_cursor(part_id, len);
                }
                records::COMMIT => {
                    if !self.ensure_window(part_id, super::COMMIT_LOG_WORDS as usize, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    let rec = CommitRec {
                        table: self.cursor_word(part_id, 1),
                        schema_version: self.cursor_word(part_id, 2),
                        fragment: self.cursor_word(part_id, 3),
                        prep_file_no: self.cursor_word(part_id, 4),
                        prep_start_page: self.cursor_word(part_id, 5),
                        prep_start_index: self.cursor_word(part_id, 6),
                        prep_stop_page: self.cursor_word(part_id, 7),
                        gci: self.cursor_word(part_id, 8),
                    };
                    if rec.gci > self.parts[part_id as usize].exec.log_last_gci {
                        // Newer than this restart's horizon: neutralise it
                        // so a later restart cannot re-execute it.
                        self.neutralise_commit(part_id, io, inbox);
                        self.advance_cursor(part_id, super::COMMIT_LOG_WORDS as usize);
                    } else {
                        self.advance_cursor(part_id, super::COMMIT_LOG_WORDS as usize);
                        return ExecOutcome::CommitFound(rec);
                    }
                }
                records::INVALID_COMMIT => {
                    self.advance_cursor(part_id, super::COMMIT_LOG_WORDS as usize);
                }
                records::ABORT => {
                    self.advance_cursor(part_id, super::ABORT_LOG_WORDS as usize);
                }
                records::COMPLETED_GCI => {
                    if !self.ensure_window(part_id, 2, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    let gci = self.cursor_word(part_id, 1);
                    self.advance_cursor(part_id, super::COMPLETED_GCI_WORDS as usize);
                    let exec = &mut self.parts[part_id as usize].exec;
                    if gci == exec.log_last_gci {
                        exec.completed_head = Some((
                            exec.read_file_no,
                            exec.cursor_page,
                            exec.cursor_index as u32,
                        ));
                    }
                }
                records::FD => {
                    if !self.ensure_window(part_id, FD_HEADER_WORDS as usize, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    let no_fd = self.cursor_word(part_id, 2);
                    let skip = (FD_HEADER_WORDS + no_fd * FD_PER_FILE_WORDS) as usize;
                    if !self.ensure_window(part_id, skip, io, inbox) {
                        return ExecOutcome::Waiting;
                    }
                    self.advance_cursor(part_id, skip);
                }
                records::NEXT_LOG_RECORD => {
                    let next = self.parts[part_id as usize].exec.cursor_page + 1;
                    self.jump_to_page(part_id, next);
                }
                records::NEXT_MBYTE => {
                    let exec = &self.parts[part_id as usize].exec;
                    let next_mbyte = exec.cursor_page / PAGES_PER_MBYTE + 1;
                    self.jump_to_page(part_id, next_mbyte * PAGES_PER_MBYTE);
                }
                other => {
                    let diag = self.parts[part_id as usize].exec.diag(part_id);
                    panic!("unknown log record type {other} during replay: {diag:?}");
                }
            }
        }
    }

    fn ensure_window(
        &mut self,
        part_id: u32,
        words: usize,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> bool {
        if self.window_available(part_id) >= words {
            return true;
        }
        self.issue_exec_reads(part_id, io, inbox);
        if self.parts[part_id as usize].exec.reads_outstanding == 0 {
            // Nothing left to read and still short of a whole record.
            let diag = self.parts[part_id as usize].exec.diag(part_id);
            panic!("redo log ends inside a record: {diag:?}");
        }
        false
    }

    /// Rewrites the commit type under the cursor as INVALID_COMMIT on its
    /// source page and pushes the page back to disk.
    fn neutralise_commit(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let (page_h, filepage) = {
            let exec = &self.parts[part_id as usize].exec;
            let h = *exec
                .window
                .iter()
                .find(|&&h| self.pages.get(h).filepage == exec.cursor_page)
                .expect("cursor outside window");
            (h, exec.cursor_page)
        };
        let index = self.parts[part_id as usize].exec.cursor_index;
        {
            let page = self.pages.get_mut(page_h);
            page.set_word(index, records::INVALID_COMMIT);
            page.dirty = true;
            page.store_checksum();
        }
        if self.diskless {
            return;
        }
        let file_no = self.parts[part_id as usize].exec.read_file_no;
        let file_h = self.file_by_no(part_id, file_no);
        let os_file = self.files.get(file_h).os_file;
        let lfo = self.seize_lfo(part_id, Some(file_h), LfoKind::SrWriteDirtyPage { page: page_h });
        let bytes: &[u8] = self.pages.get(page_h).as_bytes();
        io.write(
            os_file,
            filepage as u64 * PAGE_BYTES as u64,
            &[bytes],
            false,
            lfo.0,
            inbox,
        );
    }

    /// Fetches the prepare a commit references. Returns it right away when
    /// the pages are buffered; otherwise reads them and reports through
    /// [`LogEvent::ExecReady`] + [`RedoLog::take_fetched_prepare`].
    pub fn fetch_prepare(
        &mut self,
        part_id: u32,
        rec: &CommitRec,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Option<PreparedRecord> {
        let in_window = {
            let exec = &self.parts[part_id as usize].exec;
            exec.read_file_no == rec.prep_file_no
                && exec
                    .window
                    .iter()
                    .any(|&h| self.pages.get(h).filepage == rec.prep_start_page)
                && exec
                    .window
                    .iter()
                    .any(|&h| self.pages.get(h).filepage == rec.prep_stop_page)
        };
        if in_window {
            let pages: Vec<PageH> = {
                let exec = &self.parts[part_id as usize].exec;
                (rec.prep_start_page..=rec.prep_stop_page)
                    .map(|fp| {
                        *exec
                            .window
                            .iter()
                            .find(|&&h| self.pages.get(h).filepage == fp)
                            .expect("window hole")
                    })
                    .collect()
            };
            return Some(self.parse_prepare(&pages, rec.prep_start_index as usize));
        }
        let file_h = self.file_by_no(part_id, rec.prep_file_no);
        {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.pending_prep_pos = Some((
                rec.prep_file_no,
                rec.prep_start_page,
                rec.prep_start_index,
                rec.prep_stop_page,
            ));
            exec.prep_reads_outstanding = rec.prep_stop_page - rec.prep_start_page + 1;
        }
        for fp in rec.prep_start_page..=rec.prep_stop_page {
            let start_page = rec.prep_start_page;
            self.read_one_page(
                part_id,
                file_h,
                fp,
                move |page| LfoKind::SrReadPrepare {
                    pages: vec![page],
                    start_page,
                },
                io,
                inbox,
            );
        }
        None
    }

    fn got_prep_pages(&mut self, part_id: u32, pages: Vec<PageH>, _start_page: u32) -> LogEvent {
        for page in pages {
            let exec = &mut self.parts[part_id as usize].exec;
            exec.prep_pages.push(page);
            exec.prep_reads_outstanding -= 1;
        }
        if self.parts[part_id as usize].exec.prep_reads_outstanding > 0 {
            return LogEvent::None;
        }
        let (_, _, start_index, _) = self.parts[part_id as usize]
            .exec
            .pending_prep_pos
            .take()
            .expect("prepare pages without a pending fetch");
        let mut pages: Vec<PageH> =
            std::mem::take(&mut self.parts[part_id as usize].exec.prep_pages);
        let pages_pool = &self.pages;
        pages.sort_by_key(|&h| pages_pool.get(h).filepage);
        let prep = self.parse_prepare(&pages, start_index as usize);
        for p in pages {
            self.pages.release(p);
        }
        self.parts[part_id as usize].exec.fetched_prep = Some(prep);
        LogEvent::ExecReady { part: part_id }
    }

    pub fn take_fetched_prepare(&mut self, part_id: u32) -> Option<PreparedRecord> {
        self.parts[part_id as usize].exec.fetched_prep.take()
    }

    fn parse_prepare(&self, pages: &[PageH], start_index: usize) -> PreparedRecord {
        let word_at = |offset: usize| -> u32 {
            let mut page_idx = 0;
            let mut index = start_index + offset;
            loop {
                if index < PAGE_WORDS {
                    return self.pages.get(pages[page_idx]).word(index);
                }
                index = index - PAGE_WORDS + PAGE_HEADER_WORDS;
                page_idx += 1;
            }
        };
        assert_eq!(word_at(0), records::PREP_OP, "commit points at a non-prepare");
        let hash = word_at(2);
        let op_kind = word_at(3);
        let attr_len = word_at(4) as usize;
        let key_len = word_at(5) as usize;
        let key = (0..key_len)
            .map(|i| word_at(super::PREP_HEAD_WORDS as usize + i))
            .collect();
        let attr = (0..attr_len)
            .map(|i| word_at(super::PREP_HEAD_WORDS as usize + key_len + i))
            .collect();
        PreparedRecord {
            hash,
            op_kind,
            key,
            attr,
        }
    }

    /// After the last execution pass: install the recovered head and
    /// invalidate everything the crash left beyond it.
    pub fn start_invalidation(
        &mut self,
        part_id: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        // Drop any leftover window pages.
        let pages: Vec<PageH> = self.parts[part_id as usize].exec.window.drain(..).collect();
        for p in pages {
            self.pages.release(p);
        }
        let (head_file_no, head_page, head_index) = self.parts[part_id as usize]
            .exec
            .completed_head
            .expect("invalidation without a recovered head");
        {
            let file_h = self.file_by_no(part_id, head_file_no);
            let part = &mut self.parts[part_id as usize];
            part.current_file = Some(file_h);
            part.current_mbyte = head_page / PAGES_PER_MBYTE;
            part.current_filepage = head_page;
            part.current_page = None;
            let pages_left = PAGES_PER_MBYTE - 1 - (head_page % PAGES_PER_MBYTE);
            part.mbyte_words_left =
                (PAGE_WORDS as u32 - head_index) + pages_left * PAGE_USABLE_WORDS;
            part.exec.inval_file_no = head_file_no;
            part.exec.inval_filepage = head_page + 1;
            part.exec.state = ExecSrState::InvalidateRead;
        }
        if self.diskless {
            self.parts[part_id as usize].exec.state = ExecSrState::Done;
            return LogEvent::PartInvalidated { part: part_id };
        }
        self.invalidate_read_next(part_id, io, inbox);
        LogEvent::None
    }

    fn invalidate_read_next(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let (file_no, filepage) = {
            let no_files = self.parts[part_id as usize].no_files;
            let exec = &mut self.parts[part_id as usize].exec;
            if exec.inval_filepage == PAGES_PER_FILE {
                exec.inval_file_no = (exec.inval_file_no + 1) % no_files;
                exec.inval_filepage = 0;
            }
            (exec.inval_file_no, exec.inval_filepage)
        };
        let file_h = self.file_by_no(part_id, file_no);
        self.read_one_page(
            part_id,
            file_h,
            filepage,
            move |page| LfoKind::SrInvalidateRead { page, filepage },
            io,
            inbox,
        );
    }

    fn got_invalidate_page(
        &mut self,
        part_id: u32,
        page: PageH,
        filepage: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let lap = self.pages.get(page).log_lap();
        let current_lap = self.parts[part_id as usize].log_lap;
        if lap != current_lap {
            // First stale page: the invalidation frontier.
            self.pages.release(page);
            return self.finish_invalidation(part_id, io, inbox);
        }
        {
            let p = self.pages.get_mut(page);
            p.set_word(hdr::LOG_LAP, 0);
            p.store_checksum();
        }
        let file_no = self.parts[part_id as usize].exec.inval_file_no;
        let file_h = self.file_by_no(part_id, file_no);
        let os_file = self.files.get(file_h).os_file;
        let lfo = self.seize_lfo(
            part_id,
            Some(file_h),
            LfoKind::SrInvalidateWrite { page, filepage },
        );
        let bytes: &[u8] = self.pages.get(page).as_bytes();
        io.write(
            os_file,
            filepage as u64 * PAGE_BYTES as u64,
            &[bytes],
            false,
            lfo.0,
            inbox,
        );
        LogEvent::None
    }

    fn invalidate_advance(
        &mut self,
        part_id: u32,
        _filepage: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        self.parts[part_id as usize].exec.inval_filepage += 1;
        self.invalidate_read_next(part_id, io, inbox);
        LogEvent::None
    }

    /// Invalidation hit the stale frontier: rename file 0's current-file
    /// pointer to the recovered head file, then reload the head page.
    fn finish_invalidation(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) -> LogEvent {
        let head_file_no = {
            let part = &self.parts[part_id as usize];
            self.files.get(part.current_file_h()).file_no
        };
        self.parts[part_id as usize].exec.state = ExecSrState::WritePageZero;
        let fd_page = self.build_fd_page(part_id, head_file_no);
        self.pages.get_mut(fd_page).store_checksum();
        let file0 = self.parts[part_id as usize].first_file.unwrap();
        let os_file = self.files.get(file0).os_file;
        let lfo = self.seize_lfo(part_id, Some(file0), LfoKind::SrWritePageZero { page: fd_page });
        let bytes: &[u8] = self.pages.get(fd_page).as_bytes();
        io.write(os_file, 0, &[bytes], true, lfo.0, inbox);
        LogEvent::None
    }

    fn read_head_page_back(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let (_, head_page, _) = self.parts[part_id as usize]
            .exec
            .completed_head
            .expect("head restore without a head");
        self.parts[part_id as usize].exec.state = ExecSrState::RestoreHeadPage;
        let file_h = self.parts[part_id as usize].current_file_h();
        self.read_one_page(
            part_id,
            file_h,
            head_page,
            move |page| LfoKind::SrReadHeadPage { page, filepage: head_page },
            io,
            inbox,
        );
    }

    fn install_head_page(&mut self, part_id: u32, page: PageH, filepage: u32) -> LogEvent {
        let (_, head_page, head_index) = self.parts[part_id as usize]
            .exec
            .completed_head
            .expect("head restore without a head");
        assert_eq!(filepage, head_page);
        {
            let p = self.pages.get_mut(page);
            p.filepage = filepage;
            p.set_word(hdr::CURR_PAGE_INDEX, head_index);
            p.set_word(hdr::VERSION, PAGE_VERSION);
            p.dirty = false;
        }
        let part = &mut self.parts[part_id as usize];
        part.current_page = Some(page);
        part.current_filepage = filepage;
        part.exec.state = ExecSrState::Done;
        part.state = super::files::LogPartState::Idle;
        tracing::info!(part = part_id, filepage, head_index, "log head installed");
        LogEvent::PartInvalidated { part: part_id }
    }

    fn verify_page(&self, part_id: u32, page: PageH, filepage: u32) {
        if self.diskless {
            return;
        }
        let p = self.pages.get(page);
        if let Err(e) = p.verify() {
            let diag = LogDiagnostic {
                part: part_id,
                file_no: self.parts[part_id as usize].exec.read_file_no,
                mbyte: filepage / PAGES_PER_MBYTE,
                page: filepage,
                word: p.word(hdr::CHECKSUM),
            };
            panic!("{e} during restart: {diag:?}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::*;
    use super::*;
    use crate::config::Config;
    use crate::io::SimIo;
    use crate::signal::{Inbox, Signal};

    fn pump(log: &mut RedoLog, io: &mut SimIo, inbox: &mut Inbox) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(sig) = inbox.pop() {
            let event = match sig {
                Signal::FsOpenConf(c) => log.open_confirmed(c.user, c.os_file, io, inbox),
                Signal::FsWriteConf(c) => log.write_confirmed(c.lfo, io, inbox),
                Signal::FsReadConf(c) => log.read_confirmed(c.lfo, io, inbox),
                Signal::FsCloseConf(c) => {
                    log.close_confirmed(c.user);
                    LogEvent::None
                }
                Signal::FsSyncConf(_) | Signal::ContinueB(_) => LogEvent::None,
                other => panic!("unexpected signal in replay test: {other:?}"),
            };
            match event {
                LogEvent::None => {}
                LogEvent::FilesOpen { part } => {
                    let e = log.start_head_find(part, io, inbox);
                    if e != LogEvent::None {
                        events.push(e);
                    }
                }
                other => events.push(other),
            }
        }
        events
    }

    /// Writes a small log on part 0: one commit inside the recovery
    /// horizon, one beyond it, and the completed-GCI watermark between
    /// them.
    fn write_crashed_log() -> SimIo {
        let mut log = RedoLog::new(&Config::default());
        let mut io = SimIo::new();
        let mut inbox = Inbox::default();
        log.create_log(&mut io, &mut inbox);
        pump(&mut log, &mut io, &mut inbox);

        let key = [0xa, 0xb, 0xc];
        let attr = [7, 8, 9, 10, 11];
        let pos = log
            .append_prepare(0, 0x1234, 1, &key, &attr, &mut io, &mut inbox)
            .unwrap();
        log.append_commit(0, 7, 1, 0, pos, 42, &mut io, &mut inbox)
            .unwrap();
        log.append_completed_gci(0, 42, &mut io, &mut inbox).unwrap();

        // Work that had not reached a global checkpoint when the node
        // died.
        let pos2 = log
            .append_prepare(0, 0x99, 2, &[0xd], &[1], &mut io, &mut inbox)
            .unwrap();
        log.append_commit(0, 7, 1, 0, pos2, 50, &mut io, &mut inbox)
            .unwrap();
        log.flush_unwritten(&mut io, &mut inbox);
        pump(&mut log, &mut io, &mut inbox);
        io
    }

    #[test]
    fn head_location_and_replay_round_trip() {
        let mut io = write_crashed_log();
        let mut log = RedoLog::new(&Config::default());
        let mut inbox = Inbox::default();
        log.open_log(&mut io, &mut inbox);
        let events = pump(&mut log, &mut io, &mut inbox);
        let located = events
            .iter()
            .filter(|e| matches!(e, LogEvent::HeadLocated { .. }))
            .count();
        assert_eq!(located, LOG_PARTS);
        let (head_file, head_page, _head_index) = log.parts[0].exec.head.unwrap();
        assert_eq!((head_file, head_page), (0, 1));
        assert_eq!(log.parts[0].log_lap, 1);

        log.set_exec_bounds(0, 1, 42);
        log.start_exec_pass(0, &mut io, &mut inbox);
        pump(&mut log, &mut io, &mut inbox);

        let mut replayed = Vec::new();
        loop {
            match log.exec_continue(0, &mut io, &mut inbox) {
                ExecOutcome::Waiting => {
                    pump(&mut log, &mut io, &mut inbox);
                }
                ExecOutcome::CommitFound(rec) => {
                    let prep = match log.fetch_prepare(0, &rec, &mut io, &mut inbox) {
                        Some(p) => p,
                        None => {
                            pump(&mut log, &mut io, &mut inbox);
                            log.take_fetched_prepare(0).expect("prepare fetched")
                        }
                    };
                    replayed.push((rec, prep));
                }
                ExecOutcome::PartDone => break,
            }
        }

        // Exactly the in-horizon commit replays, bit for bit.
        assert_eq!(replayed.len(), 1);
        let (rec, prep) = &replayed[0];
        assert_eq!(rec.gci, 42);
        assert_eq!(rec.table, 7);
        assert_eq!(prep.hash, 0x1234);
        assert_eq!(prep.op_kind, 1);
        assert_eq!(prep.key, vec![0xa, 0xb, 0xc]);
        assert_eq!(prep.attr, vec![7, 8, 9, 10, 11]);

        // The out-of-horizon commit was neutralised on its source page.
        let completed_head = log.parts[0].exec.completed_head.unwrap();
        assert!(completed_head < log.parts[0].exec.head.unwrap());
        let bytes = io.file_bytes(&crate::io::log_file_path(0, 0)).unwrap();
        let commit2_at = {
            // completed_head points just past the watermark; the second
            // prepare (9 words) follows, then its commit.
            let (_, page, index) = completed_head;
            page as usize * PAGE_BYTES + (index as usize + 9) * 4
        };
        let ty = u32::from_le_bytes(bytes[commit2_at..commit2_at + 4].try_into().unwrap());
        assert_eq!(ty, records::INVALID_COMMIT);

        // Install the head and invalidate the stale tail.
        let ev = log.start_invalidation(0, &mut io, &mut inbox);
        assert_eq!(ev, LogEvent::None);
        let events = pump(&mut log, &mut io, &mut inbox);
        assert!(events.contains(&LogEvent::PartInvalidated { part: 0 }));
        assert_eq!(log.parts[0].current_filepage, completed_head.1);
        let page = log.parts[0].current_page.unwrap();
        assert_eq!(log.pages.get(page).curr_page_index(), completed_head.2);

        // A second head find on the recovered log agrees with the
        // installed head.
        let mut log2 = RedoLog::new(&Config::default());
        let mut inbox2 = Inbox::default();
        log2.open_log(&mut io, &mut inbox2);
        pump(&mut log2, &mut io, &mut inbox2);
        let (f2, p2, _) = log2.parts[0].exec.head.unwrap();
        assert_eq!((f2, p2), (0, 1));
    }
}
