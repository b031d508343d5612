//! Appending to the redo log.
//!
//! One record at a time, strictly serialised per part. The writer owns the
//! megabyte discipline (no record ever spans one), the page flush policy,
//! and the three-way write protocol of a file change.

use super::files::{FileChangeState, LfoKind, LogFileState, LogPartState, RedoLog};
use super::page::PageH;
use super::{
    hdr, records, GcpWritePos, LogEvent, PrepPosition, ABORT_LOG_WORDS, COMMIT_LOG_WORDS,
    COMPLETED_GCI_WORDS, FILE_BYTES, MAX_PAGES_WRITTEN, MAX_REDO_PAGES_WITHOUT_SYNC,
    MBYTES_PER_FILE, MIN_LOG_PAGES_OPERATION, PAGES_PER_MBYTE, PAGE_BYTES, PAGE_HEADER_WORDS,
    PAGE_USABLE_WORDS, PAGE_VERSION, PAGE_WORDS, PREP_HEAD_WORDS,
};
use crate::error::codes;
use crate::io::{log_file_path, Io};
use crate::signal::{Inbox, TransId};

impl RedoLog {
    /// Initial start: create every file of every part and write the first
    /// descriptors. Completion is reported as [`LogEvent::InitComplete`].
    pub fn create_log(&mut self, io: &mut dyn Io, inbox: &mut Inbox) {
        self.initial = true;
        for part_id in 0..self.parts.len() {
            let part = &mut self.parts[part_id];
            part.open_outstanding = part.no_files;
            let mut h = part.first_file.unwrap();
            for _ in 0..part.no_files {
                let file = self.files.get_mut(h);
                file.state = LogFileState::Opening;
                io.open(
                    &log_file_path(file.part, file.file_no),
                    FILE_BYTES,
                    true,
                    h.0,
                    inbox,
                );
                h = file.next.unwrap();
            }
        }
    }

    /// Restart: open every file so head finding can begin. Completion per
    /// part is reported as [`LogEvent::FilesOpen`].
    pub fn open_log(&mut self, io: &mut dyn Io, inbox: &mut Inbox) {
        self.initial = false;
        for part_id in 0..self.parts.len() {
            let part = &mut self.parts[part_id];
            part.open_outstanding = part.no_files;
            let mut h = part.first_file.unwrap();
            for _ in 0..part.no_files {
                let file = self.files.get_mut(h);
                file.state = LogFileState::Opening;
                io.open(
                    &log_file_path(file.part, file.file_no),
                    FILE_BYTES,
                    true,
                    h.0,
                    inbox,
                );
                h = file.next.unwrap();
            }
        }
    }

    pub fn open_confirmed(
        &mut self,
        file_index: u32,
        os_file: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let h = super::files::FileH(file_index);
        let file = self.files.get_mut(h);
        file.state = LogFileState::Open;
        file.os_file = os_file;
        let part_id = file.part;
        let part = &mut self.parts[part_id as usize];
        if part.open_outstanding > 0 {
            part.open_outstanding -= 1;
            if part.open_outstanding == 0 {
                if self.initial {
                    self.init_part(part_id, io, inbox);
                    return LogEvent::None;
                }
                return LogEvent::FilesOpen { part: part_id };
            }
        }
        LogEvent::None
    }

    pub fn close_confirmed(&mut self, file_index: u32) {
        let h = super::files::FileH(file_index);
        self.files.get_mut(h).state = LogFileState::Closed;
    }

    /// Sets up the write cursors of a freshly created part and writes the
    /// descriptor of file 0.
    fn init_part(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        {
            let part = &mut self.parts[part_id as usize];
            part.log_lap = 1;
            part.current_file = part.first_file;
            part.current_mbyte = 0;
            part.current_filepage = 1;
            part.mbyte_words_left = (PAGES_PER_MBYTE - 1) * PAGE_USABLE_WORDS;
            part.tail_file_no = 0;
            part.tail_mbyte = 0;
            part.init_outstanding = 1;
        }
        let fd_page = self.build_fd_page(part_id, 0);
        if self.diskless {
            self.pages.release(fd_page);
            self.parts[part_id as usize].init_outstanding = 0;
            if self.init_done() {
                inbox.push(crate::signal::Signal::FsWriteConf(
                    crate::signal::FsWriteConf { lfo: u32::MAX },
                ));
            }
            return;
        }
        {
            let page = self.pages.get_mut(fd_page);
            page.store_checksum();
        }
        let file_h = self.parts[part_id as usize].first_file.unwrap();
        let os_file = self.files.get(file_h).os_file;
        let lfo = self.seize_lfo(part_id, Some(file_h), LfoKind::InitFdWrite { page: fd_page });
        let bytes: &[u8] = self.pages.get(fd_page).as_bytes();
        io.write(os_file, 0, &[bytes], true, lfo.0, inbox);
    }

    fn init_done(&self) -> bool {
        self.parts
            .iter()
            .all(|p| p.init_outstanding == 0 && p.open_outstanding == 0)
    }

    /// Appends a prepare record. The caller has already claimed the part.
    pub fn append_prepare(
        &mut self,
        part_id: u32,
        hash: u32,
        op_kind: u32,
        key: &[u32],
        attr: &[u32],
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Result<PrepPosition, u32> {
        if self.pages.free() < MIN_LOG_PAGES_OPERATION {
            return Err(codes::REDO_LOG_OVERLOADED);
        }
        let total = PREP_HEAD_WORDS + key.len() as u32 + attr.len() as u32;
        self.check_mbyte_space(part_id, total, io, inbox)?;

        let part = &self.parts[part_id as usize];
        let file_no = self.files.get(part.current_file_h()).file_no;
        let start_page = part.current_filepage;
        let start_index = self.current_index(part_id);

        let head = [
            records::PREP_OP,
            total,
            hash,
            op_kind,
            attr.len() as u32,
            key.len() as u32,
        ];
        self.write_words(part_id, &head);
        self.write_words(part_id, key);
        self.write_words(part_id, attr);

        let part = &mut self.parts[part_id as usize];
        let stop_page = if part.current_page.is_some() {
            part.current_filepage
        } else {
            part.current_filepage - 1
        };
        let mbyte = start_page / PAGES_PER_MBYTE;
        let mbyte_seq = part.note_prepare(file_no, mbyte);

        self.flush_if_due(part_id, io, inbox);
        Ok(PrepPosition {
            file_no,
            start_page,
            start_index,
            stop_page,
            mbyte_seq,
        })
    }

    /// Appends a commit record referencing an earlier prepare.
    pub fn append_commit(
        &mut self,
        part_id: u32,
        table: u32,
        schema_version: u32,
        fragment: u32,
        prep: PrepPosition,
        gci: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Result<(), u32> {
        self.check_mbyte_space(part_id, COMMIT_LOG_WORDS, io, inbox)?;
        let words = [
            records::COMMIT,
            table,
            schema_version,
            fragment,
            prep.file_no,
            prep.start_page,
            prep.start_index,
            prep.stop_page,
            gci,
        ];
        self.write_words(part_id, &words);

        let part = &mut self.parts[part_id as usize];
        if gci > part.newest_gci {
            part.newest_gci = gci;
        }
        part.resolve_prepare(prep.mbyte_seq);
        let mbyte = part.current_mbyte as usize;
        let newest_completed = part.newest_completed_gci;
        let file_h = part.current_file_h();
        let file = self.files.get_mut(file_h);
        if gci > file.max_gci_started[mbyte] {
            file.max_gci_started[mbyte] = gci;
        }
        if newest_completed > file.max_gci_completed[mbyte] {
            file.max_gci_completed[mbyte] = newest_completed;
        }

        self.flush_if_due(part_id, io, inbox);
        Ok(())
    }

    pub fn append_abort(
        &mut self,
        part_id: u32,
        transid: TransId,
        prep_seq: Option<u64>,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Result<(), u32> {
        self.check_mbyte_space(part_id, ABORT_LOG_WORDS, io, inbox)?;
        let words = [records::ABORT, transid[0], transid[1]];
        self.write_words(part_id, &words);
        if let Some(seq) = prep_seq {
            self.parts[part_id as usize].resolve_prepare(seq);
        }
        self.flush_if_due(part_id, io, inbox);
        Ok(())
    }

    /// Appends a completed-GCI record and forces it towards the disk.
    /// Returns the record's position and the flush it rides on.
    pub fn append_completed_gci(
        &mut self,
        part_id: u32,
        gci: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Result<GcpWritePos, u32> {
        self.check_mbyte_space(part_id, COMPLETED_GCI_WORDS, io, inbox)?;
        let part = &self.parts[part_id as usize];
        let file_h = part.current_file_h();
        let file_no = self.files.get(file_h).file_no;
        let page = part.current_filepage;
        let word = self.current_index(part_id);
        self.write_words(part_id, &[records::COMPLETED_GCI, gci]);

        let part = &mut self.parts[part_id as usize];
        part.newest_completed_gci = gci;
        if gci > part.newest_gci {
            part.newest_gci = gci;
        }
        let mbyte = part.current_mbyte as usize;
        let file = self.files.get_mut(file_h);
        if gci > file.max_gci_completed[mbyte] {
            file.max_gci_completed[mbyte] = gci;
        }
        if gci > file.max_gci_started[mbyte] {
            file.max_gci_started[mbyte] = gci;
        }

        let flush_seq = self
            .flush_part(part_id, true, false, io, inbox)
            .unwrap_or(self.parts[part_id as usize].confirmed_flush_seq);
        Ok(GcpWritePos {
            file: file_h,
            file_no,
            page,
            word,
            flush_seq,
        })
    }

    /// One-second supervision: push any unwritten words to the file layer.
    pub fn flush_unwritten(&mut self, io: &mut dyn Io, inbox: &mut Inbox) {
        for part_id in 0..self.parts.len() as u32 {
            let part = &self.parts[part_id as usize];
            if part.unflushed || !part.flush_queue.is_empty() {
                self.flush_part(part_id, true, false, io, inbox);
            }
        }
    }

    pub fn current_index(&self, part_id: u32) -> u32 {
        let part = &self.parts[part_id as usize];
        match part.current_page {
            Some(h) => self.pages.get(h).curr_page_index(),
            None => PAGE_HEADER_WORDS as u32,
        }
    }

    fn write_words(&mut self, part_id: u32, words: &[u32]) {
        for &w in words {
            let page_h = self.ensure_page(part_id);
            let part = &mut self.parts[part_id as usize];
            debug_assert!(part.mbyte_words_left > 0, "megabyte budget exhausted");
            part.mbyte_words_left -= 1;
            part.unflushed = true;
            let page = self.pages.get_mut(page_h);
            let index = page.curr_page_index() as usize;
            page.set_word(index, w);
            page.set_word(hdr::CURR_PAGE_INDEX, index as u32 + 1);
            page.dirty = true;
            if index + 1 == PAGE_WORDS {
                self.complete_page(part_id);
            }
        }
    }

    fn ensure_page(&mut self, part_id: u32) -> PageH {
        if let Some(h) = self.parts[part_id as usize].current_page {
            return h;
        }
        let filepage = self.parts[part_id as usize].current_filepage;
        self.alloc_page(part_id, filepage)
    }

    fn alloc_page(&mut self, part_id: u32, filepage: u32) -> PageH {
        let h = self
            .pages
            .seize()
            .expect("redo page pool exhausted under the operation floor");
        {
            let part = &mut self.parts[part_id as usize];
            part.current_page = Some(h);
            part.current_filepage = filepage;
        }
        let part = &self.parts[part_id as usize];
        let log_lap = part.log_lap;
        let newest_completed = part.newest_completed_gci;
        let newest = part.newest_gci;
        let no_files = part.no_files;
        let current_file_no = self.files.get(part.current_file_h()).file_no;
        let prep_ref = part.earliest_prep_ref(current_file_no);
        let page = self.pages.get_mut(h);
        page.zero();
        page.filepage = filepage;
        page.set_word(hdr::LOG_LAP, log_lap);
        page.set_word(hdr::MAX_GCI_COMPLETED, newest_completed);
        page.set_word(hdr::MAX_GCI_STARTED, newest);
        page.set_word(hdr::VERSION, PAGE_VERSION);
        page.set_word(hdr::NO_LOG_FILES, no_files);
        page.set_word(hdr::CURR_PAGE_INDEX, PAGE_HEADER_WORDS as u32);
        page.set_word(hdr::LAST_PREP_REF, prep_ref);
        h
    }

    fn complete_page(&mut self, part_id: u32) {
        let h = {
            let part = &mut self.parts[part_id as usize];
            let h = part.current_page.take().expect("no page to complete");
            part.current_filepage += 1;
            h
        };
        let part = &self.parts[part_id as usize];
        let newest_completed = part.newest_completed_gci;
        let newest = part.newest_gci;
        let current_file_no = self.files.get(part.current_file_h()).file_no;
        let prep_ref = part.earliest_prep_ref(current_file_no);
        let page = self.pages.get_mut(h);
        page.set_word(hdr::MAX_GCI_COMPLETED, newest_completed);
        page.set_word(hdr::MAX_GCI_STARTED, newest);
        page.set_word(hdr::LAST_PREP_REF, prep_ref);
        page.store_checksum();
        self.parts[part_id as usize].flush_queue.push(h);
    }

    fn flush_if_due(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        if self.parts[part_id as usize].flush_queue.len() as u32 >= MAX_PAGES_WRITTEN {
            self.flush_part(part_id, false, false, io, inbox);
        }
    }

    /// Hands dirty pages to the file layer. Full pages return to the pool
    /// on confirmation; a written partial page stays current.
    pub(super) fn flush_part(
        &mut self,
        part_id: u32,
        include_partial: bool,
        last_write_in_file: bool,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Option<u64> {
        let part = &mut self.parts[part_id as usize];
        let release: Vec<PageH> = std::mem::take(&mut part.flush_queue);
        let mut keep: Vec<PageH> = Vec::new();
        if include_partial {
            if let Some(h) = part.current_page {
                keep.push(h);
            }
        }
        if release.is_empty() && keep.is_empty() {
            return None;
        }
        if include_partial {
            part.unflushed = false;
        }
        let page_count = (release.len() + keep.len()) as u32;
        part.pages_since_sync += page_count;
        let sync = part.pages_since_sync >= MAX_REDO_PAGES_WITHOUT_SYNC;
        if sync {
            part.pages_since_sync = 0;
        }
        part.next_flush_seq += 1;
        let flush_seq = part.next_flush_seq;
        let file_h = part.current_file_h();

        // Seal headers of the partial page for this write.
        for &h in &keep {
            let newest_completed = self.parts[part_id as usize].newest_completed_gci;
            let newest = self.parts[part_id as usize].newest_gci;
            let page = self.pages.get_mut(h);
            page.set_word(hdr::MAX_GCI_COMPLETED, newest_completed);
            page.set_word(hdr::MAX_GCI_STARTED, newest);
            page.store_checksum();
        }

        if self.diskless {
            for h in release {
                self.pages.release(h);
            }
            let part = &mut self.parts[part_id as usize];
            part.confirmed_flush_seq = flush_seq;
            return Some(flush_seq);
        }

        let first_filepage = release
            .first()
            .or(keep.first())
            .map(|&h| self.pages.get(h).filepage)
            .expect("flush with no pages");
        let os_file = self.files.get(file_h).os_file;
        let kind = if last_write_in_file {
            LfoKind::LastWriteOldFile {
                release: release.clone(),
                keep: keep.clone(),
                flush_seq,
            }
        } else {
            LfoKind::WriteLog {
                release: release.clone(),
                keep: keep.clone(),
                flush_seq,
            }
        };
        let lfo = self.seize_lfo(part_id, Some(file_h), kind);
        let handles: Vec<PageH> = release.iter().chain(keep.iter()).copied().collect();
        let bufs: Vec<&[u8]> = handles.iter().map(|&h| self.pages.get(h).as_bytes()).collect();
        io.write(
            os_file,
            first_filepage as u64 * PAGE_BYTES as u64,
            &bufs,
            sync,
            lfo.0,
            inbox,
        );
        Some(flush_seq)
    }

    /// Confirms an in-flight write and advances whatever protocol it was
    /// part of.
    pub fn write_confirmed(
        &mut self,
        lfo_index: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        if lfo_index == u32::MAX {
            // Diskless short-circuit used during log creation.
            return LogEvent::InitComplete;
        }
        let lfo_h = super::files::LfoH(lfo_index);
        let lfo = self.lfos.get_mut(lfo_h);
        let part_id = lfo.part;
        let kind = std::mem::take(&mut lfo.kind);
        self.lfos.release(lfo_h);
        match kind {
            LfoKind::Idle => LogEvent::None,
            LfoKind::WriteLog {
                release,
                keep: _,
                flush_seq,
            } => {
                for h in release {
                    self.pages.release(h);
                }
                let part = &mut self.parts[part_id as usize];
                if flush_seq > part.confirmed_flush_seq {
                    part.confirmed_flush_seq = flush_seq;
                }
                LogEvent::FlushConfirmed { part: part_id }
            }
            LfoKind::LastWriteOldFile {
                release,
                keep: _,
                flush_seq,
            } => {
                for h in release {
                    self.pages.release(h);
                }
                let part = &mut self.parts[part_id as usize];
                if flush_seq > part.confirmed_flush_seq {
                    part.confirmed_flush_seq = flush_seq;
                }
                self.file_change_step(part_id, true, false, io, inbox)
            }
            LfoKind::FirstWriteNewFile { page } => {
                self.pages.release(page);
                self.file_change_step(part_id, false, true, io, inbox)
            }
            LfoKind::WritePageZero { page } => {
                self.pages.release(page);
                self.finish_file_change(part_id, io, inbox);
                LogEvent::FileChangeComplete { part: part_id }
            }
            LfoKind::InitFdWrite { page } => {
                self.pages.release(page);
                let part = &mut self.parts[part_id as usize];
                part.init_outstanding = 0;
                if self.init_done() {
                    LogEvent::InitComplete
                } else {
                    LogEvent::None
                }
            }
            other => self.sr_write_confirmed(part_id, other, io, inbox),
        }
    }

    /// Guarantees the next record lands wholly inside one megabyte,
    /// advancing the megabyte or the file first when it would not.
    fn check_mbyte_space(
        &mut self,
        part_id: u32,
        record_words: u32,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> Result<(), u32> {
        debug_assert!(record_words < (PAGES_PER_MBYTE - 1) * PAGE_USABLE_WORDS);
        if record_words <= self.parts[part_id as usize].mbyte_words_left {
            return Ok(());
        }

        // Decide where the next megabyte lives before touching anything.
        let part = &self.parts[part_id as usize];
        let crossing_file = part.current_mbyte + 1 == MBYTES_PER_FILE;
        let current_file_h = part.current_file_h();
        let current_file_no = self.files.get(current_file_h).file_no;
        let (next_file_no, next_mbyte) = if crossing_file {
            let next_h = self.files.get(current_file_h).next.unwrap();
            (self.files.get(next_h).file_no, 0)
        } else {
            (current_file_no, part.current_mbyte + 1)
        };
        if next_file_no == part.tail_file_no && next_mbyte == part.tail_mbyte {
            self.parts[part_id as usize].state = LogPartState::TailProblem;
            tracing::warn!(part = part_id, "redo head reached the log tail");
            return Err(codes::REDO_TAIL_PROBLEM);
        }
        if crossing_file {
            let next_h = self.files.get(current_file_h).next.unwrap();
            let next_open = self.files.get(next_h).state == LogFileState::Open;
            let change_idle = self.parts[part_id as usize].file_change_state
                == FileChangeState::NotOngoing;
            if !(next_open && change_idle) && !self.diskless {
                self.parts[part_id as usize].state = LogPartState::FileChangeProblem;
                tracing::warn!(part = part_id, "file change still in flight");
                return Err(codes::REDO_FILE_CHANGE_PROBLEM);
            }
        }

        // Close the old megabyte.
        if self.parts[part_id as usize].mbyte_words_left > 0 {
            self.write_words(part_id, &[records::NEXT_MBYTE]);
        }
        if self.parts[part_id as usize].current_page.is_some() {
            self.complete_page(part_id);
        }
        self.seal_mbyte_summary(part_id);

        if crossing_file {
            self.change_file(part_id, io, inbox);
        } else {
            self.flush_part(part_id, false, false, io, inbox);
            let part = &mut self.parts[part_id as usize];
            part.current_mbyte += 1;
            part.mbyte_seq += 1;
            part.current_filepage = part.current_mbyte * PAGES_PER_MBYTE;
            part.current_page = None;
            part.mbyte_words_left = PAGES_PER_MBYTE * PAGE_USABLE_WORDS;
        }
        Ok(())
    }

    /// Records the closing megabyte's GCI summary on its file record.
    fn seal_mbyte_summary(&mut self, part_id: u32) {
        let part = &self.parts[part_id as usize];
        let mbyte = part.current_mbyte as usize;
        let newest_completed = part.newest_completed_gci;
        let newest = part.newest_gci;
        let file_h = part.current_file_h();
        let file_no = self.files.get(file_h).file_no;
        let prep_ref = part.earliest_prep_ref(file_no);
        let file = self.files.get_mut(file_h);
        if newest_completed > file.max_gci_completed[mbyte] {
            file.max_gci_completed[mbyte] = newest_completed;
        }
        if newest > file.max_gci_started[mbyte] {
            file.max_gci_started[mbyte] = newest;
        }
        file.last_prep_ref[mbyte] = prep_ref;
    }

    /// Moves the appender into the next file and starts the three writes
    /// that make the change durable.
    fn change_file(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let old_h = self.parts[part_id as usize].current_file_h();
        let new_h = self.files.get(old_h).next.unwrap();
        let new_file_no = self.files.get(new_h).file_no;

        // Trailing pages of the old file.
        let last_done = self
            .flush_part(part_id, false, true, io, inbox)
            .is_none()
            || self.diskless;

        let part = &mut self.parts[part_id as usize];
        part.change_old_file = Some(old_h);
        part.change_new_file = Some(new_h);
        part.current_file = Some(new_h);
        if new_file_no == 0 {
            part.log_lap += 1;
        }
        part.current_mbyte = 0;
        part.mbyte_seq += 1;
        part.current_filepage = 1;
        part.current_page = None;
        part.mbyte_words_left = (PAGES_PER_MBYTE - 1) * PAGE_USABLE_WORDS;

        if self.diskless {
            self.parts[part_id as usize].file_change_state = FileChangeState::NotOngoing;
            self.finish_file_change(part_id, io, inbox);
            return;
        }

        // The new file's descriptor page.
        let fd_page = self.build_fd_page(part_id, new_file_no);
        self.pages.get_mut(fd_page).store_checksum();
        let os_file = self.files.get(new_h).os_file;
        let lfo = self.seize_lfo(part_id, Some(new_h), LfoKind::FirstWriteNewFile { page: fd_page });
        let bytes: &[u8] = self.pages.get(fd_page).as_bytes();
        io.write(os_file, 0, &[bytes], true, lfo.0, inbox);

        self.parts[part_id as usize].file_change_state = if last_done {
            FileChangeState::FirstWriteOngoing
        } else {
            FileChangeState::BothWritesOngoing
        };
    }

    fn file_change_step(
        &mut self,
        part_id: u32,
        last_done: bool,
        first_done: bool,
        io: &mut dyn Io,
        inbox: &mut Inbox,
    ) -> LogEvent {
        let state = self.parts[part_id as usize].file_change_state;
        let next = match (state, last_done, first_done) {
            (FileChangeState::BothWritesOngoing, true, _) => FileChangeState::FirstWriteOngoing,
            (FileChangeState::BothWritesOngoing, _, true) => FileChangeState::LastWriteOngoing,
            (FileChangeState::FirstWriteOngoing, _, true)
            | (FileChangeState::LastWriteOngoing, true, _) => {
                self.parts[part_id as usize].file_change_state =
                    FileChangeState::WritePageZeroOngoing;
                self.write_page_zero(part_id, io, inbox);
                return LogEvent::None;
            }
            (s, _, _) => s,
        };
        self.parts[part_id as usize].file_change_state = next;
        LogEvent::None
    }

    /// Rewrites file 0 page 0 so restart can locate the current file.
    fn write_page_zero(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let current_file_no = {
            let part = &self.parts[part_id as usize];
            self.files.get(part.current_file_h()).file_no
        };
        let fd_page = self.build_fd_page(part_id, current_file_no);
        self.pages.get_mut(fd_page).store_checksum();
        let file0 = self.parts[part_id as usize].first_file.unwrap();
        let os_file = self.files.get(file0).os_file;
        let lfo = self.seize_lfo(part_id, Some(file0), LfoKind::WritePageZero { page: fd_page });
        let bytes: &[u8] = self.pages.get(fd_page).as_bytes();
        io.write(os_file, 0, &[bytes], true, lfo.0, inbox);
    }

    /// After the third write: release the appender if it was blocked and
    /// adjust which files stay open.
    fn finish_file_change(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        {
            let part = &mut self.parts[part_id as usize];
            part.file_change_state = FileChangeState::NotOngoing;
            part.change_old_file = None;
            part.change_new_file = None;
            if part.state == LogPartState::FileChangeProblem {
                part.state = LogPartState::Idle;
                inbox.push(crate::signal::Signal::ContinueB(
                    crate::signal::ContinueB::LogNextOp { part: part_id },
                ));
            }
        }
        self.adjust_open_files(part_id, io, inbox);
    }

    /// Keeps file 0, the current file and the next file open; closes the
    /// rest. File 0 is never closed: it carries the current-file pointer.
    pub(crate) fn adjust_open_files(&mut self, part_id: u32, io: &mut dyn Io, inbox: &mut Inbox) {
        let part = &self.parts[part_id as usize];
        let current_h = part.current_file_h();
        let next_h = self.files.get(current_h).next.unwrap();
        let first = part.first_file.unwrap();
        let mut h = first;
        let mut actions: Vec<(super::files::FileH, bool)> = Vec::new();
        loop {
            let file = self.files.get(h);
            let keep = h == first || h == current_h || h == next_h;
            match (file.state, keep) {
                (LogFileState::Open, false) => actions.push((h, false)),
                (LogFileState::Closed, true) => actions.push((h, true)),
                _ => {}
            }
            h = file.next.unwrap();
            if h == first {
                break;
            }
        }
        for (h, open) in actions {
            let file = self.files.get_mut(h);
            if open {
                file.state = LogFileState::Opening;
                let part_no = file.part;
                let file_no = file.file_no;
                io.open(&log_file_path(part_no, file_no), FILE_BYTES, true, h.0, inbox);
            } else {
                file.state = LogFileState::Closing;
                let os_file = file.os_file;
                io.close(os_file, h.0, inbox);
            }
        }
    }

    /// Words still unwritten in the current megabyte; exposed for tests
    /// and supervision assertions.
    pub fn mbyte_words_left(&self, part_id: u32) -> u32 {
        self.parts[part_id as usize].mbyte_words_left
    }

    /// Advances the tail once checkpoints make old megabytes redundant.
    /// Walks backwards from the head to the first megabyte whose newest
    /// commit predates `keep_gci`, then follows its prepare reference.
    pub fn set_log_tail(&mut self, keep_gci: u32) {
        for part_id in 0..self.parts.len() as u32 {
            let part = &self.parts[part_id as usize];
            let head_file_no = self.files.get(part.current_file_h()).file_no;
            let mut file_no = head_file_no;
            let mut mbyte = part.current_mbyte;
            let old_tail = (part.tail_file_no, part.tail_mbyte);
            let no_files = part.no_files;
            let mut candidate = None;
            loop {
                if (file_no, mbyte) == old_tail {
                    break;
                }
                let file_h = self.file_by_no(part_id, file_no);
                let file = self.files.get(file_h);
                if file.max_gci_started[mbyte as usize] < keep_gci {
                    candidate = Some(super::decode_prep_ref(file.last_prep_ref[mbyte as usize]));
                    break;
                }
                if mbyte == 0 {
                    file_no = (file_no + no_files - 1) % no_files;
                    mbyte = MBYTES_PER_FILE - 1;
                } else {
                    mbyte -= 1;
                }
            }
            if let Some((tail_file, tail_mbyte)) = candidate {
                let part = &mut self.parts[part_id as usize];
                part.tail_file_no = tail_file;
                part.tail_mbyte = tail_mbyte;
                if part.state == LogPartState::TailProblem {
                    // Re-check: the next megabyte may be free now.
                    let next = (part.current_mbyte + 1) % MBYTES_PER_FILE;
                    let next_file = if next == 0 {
                        (head_file_no + 1) % no_files
                    } else {
                        head_file_no
                    };
                    if (next_file, next) != (tail_file, tail_mbyte) {
                        part.state = LogPartState::Idle;
                    }
                }
                tracing::debug!(
                    part = part_id,
                    tail_file,
                    tail_mbyte,
                    keep_gci,
                    "log tail advanced"
                );
            }
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
                other => panic!("unexpected signal in log test: {other:?}"),
            };
            if event != LogEvent::None {
                events.push(event);
            }
        }
        events
    }

    fn created_log() -> (RedoLog, SimIo, Inbox) {
        let mut log = RedoLog::new(&Config::default());
        let mut io = SimIo::new();
        let mut inbox = Inbox::default();
        log.create_log(&mut io, &mut inbox);
        let events = pump(&mut log, &mut io, &mut inbox);
        assert!(events.contains(&LogEvent::InitComplete));
        (log, io, inbox)
    }

    #[test]
    fn initial_start_creates_described_files() {
        let (log, io, _inbox) = created_log();
        for part in 0..LOG_PARTS as u32 {
            assert_eq!(log.parts[part as usize].log_lap, 1);
            assert_eq!(log.parts[part as usize].current_filepage, 1);
            let bytes = io
                .file_bytes(&crate::io::log_file_path(part, 0))
                .expect("file 0 created");
            assert_eq!(bytes.len() as u64, FILE_BYTES);
            // Page zero carries a descriptor naming file 0 as current.
            let ty = u32::from_le_bytes(
                bytes[PAGE_HEADER_WORDS * 4..PAGE_HEADER_WORDS * 4 + 4]
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(ty, records::FD);
        }
    }

    #[test]
    fn prepare_and_commit_record_layout() {
        let (mut log, mut io, mut inbox) = created_log();
        let key = [0xa, 0xb, 0xc];
        let attr = [1, 2, 3, 4, 5];
        let pos = log
            .append_prepare(0, 0x1234, 1, &key, &attr, &mut io, &mut inbox)
            .unwrap();
        assert_eq!(pos.file_no, 0);
        assert_eq!(pos.start_page, 1);
        assert_eq!(pos.start_index, PAGE_HEADER_WORDS as u32);
        assert_eq!(pos.stop_page, 1);

        log.append_commit(0, 7, 1, 0, pos, 42, &mut io, &mut inbox)
            .unwrap();
        assert_eq!(log.parts[0].newest_gci, 42);
        assert_eq!(log.parts[0].outstanding_preps.len(), 0);

        let gcp = log.append_completed_gci(0, 42, &mut io, &mut inbox).unwrap();
        assert_eq!(gcp.file_no, 0);
        pump(&mut log, &mut io, &mut inbox);
        assert!(log.parts[0].confirmed_flush_seq >= gcp.flush_seq);

        // The flushed page is checksummed and parseable.
        let bytes = io.file_bytes(&crate::io::log_file_path(0, 0)).unwrap();
        let word = |page: usize, idx: usize| -> u32 {
            let at = page * PAGE_BYTES + idx * 4;
            u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
        };
        let mut page = crate::log::page::LogPage::default();
        for i in 0..PAGE_WORDS {
            page.set_word(i, word(1, i));
        }
        assert!(page.checksum_ok());
        let base = PAGE_HEADER_WORDS;
        assert_eq!(page.word(base), records::PREP_OP);
        assert_eq!(page.word(base + 1), PREP_HEAD_WORDS + 3 + 5);
        assert_eq!(page.word(base + 2), 0x1234);
        assert_eq!(page.word(base + 5), 3);
        assert_eq!(page.words(base + 6, 3), &key);
        assert_eq!(page.words(base + 9, 5), &attr);
        let commit_at = base + 14;
        assert_eq!(page.word(commit_at), records::COMMIT);
        assert_eq!(page.word(commit_at + 1), 7);
        assert_eq!(page.word(commit_at + 8), 42);
        assert_eq!(page.word(commit_at + 9), records::COMPLETED_GCI);
        assert_eq!(page.word(commit_at + 10), 42);
    }

    #[test]
    fn exact_megabyte_fill_skips_marker() {
        let (mut log, mut io, mut inbox) = created_log();
        // A prepare of exactly the remaining budget fits without a
        // megabyte change.
        let record = PREP_HEAD_WORDS + 3 + 5;
        log.parts[0].mbyte_words_left = record;
        log.append_prepare(0, 1, 1, &[1, 2, 3], &[1, 2, 3, 4, 5], &mut io, &mut inbox)
            .unwrap();
        assert_eq!(log.parts[0].current_mbyte, 0);
        assert_eq!(log.mbyte_words_left(0), 0);
        // The next record advances without room for a marker.
        let pos = log
            .append_prepare(0, 2, 1, &[9], &[8], &mut io, &mut inbox)
            .unwrap();
        assert_eq!(log.parts[0].current_mbyte, 1);
        assert_eq!(pos.start_page, PAGES_PER_MBYTE);
    }

    #[test]
    fn one_word_over_budget_emits_marker() {
        let (mut log, mut io, mut inbox) = created_log();
        let record = PREP_HEAD_WORDS + 3 + 5;
        log.parts[0].mbyte_words_left = record - 1;
        let index_before = log.current_index(0) as usize;
        let pos = log
            .append_prepare(0, 1, 1, &[1, 2, 3], &[1, 2, 3, 4, 5], &mut io, &mut inbox)
            .unwrap();
        assert_eq!(log.parts[0].current_mbyte, 1);
        assert_eq!(pos.start_page, PAGES_PER_MBYTE);
        // The closing megabyte got the marker at the old cursor.
        pump(&mut log, &mut io, &mut inbox);
        let bytes = io.file_bytes(&crate::io::log_file_path(0, 0)).unwrap();
        let at = PAGE_BYTES + index_before * 4;
        let marker = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(marker, records::NEXT_MBYTE);
    }

    #[test]
    fn head_into_tail_is_refused_without_writing() {
        let (mut log, mut io, mut inbox) = created_log();
        log.parts[0].tail_file_no = 0;
        log.parts[0].tail_mbyte = 1;
        log.parts[0].mbyte_words_left = 0;
        let words_before = log.mbyte_words_left(0);
        let err = log
            .append_prepare(0, 1, 1, &[1], &[2], &mut io, &mut inbox)
            .unwrap_err();
        assert_eq!(err, crate::error::codes::REDO_TAIL_PROBLEM);
        assert_eq!(log.parts[0].state, LogPartState::TailProblem);
        assert_eq!(log.parts[0].current_mbyte, 0);
        assert_eq!(log.mbyte_words_left(0), words_before);
    }

    #[test]
    fn tail_advance_clears_tail_problem() {
        let (mut log, mut io, mut inbox) = created_log();
        log.parts[0].tail_file_no = 0;
        log.parts[0].tail_mbyte = 1;
        log.parts[0].mbyte_words_left = 0;
        assert!(log
            .append_prepare(0, 1, 1, &[1], &[2], &mut io, &mut inbox)
            .is_err());
        assert_eq!(log.parts[0].state, LogPartState::TailProblem);
        // A checkpoint with a newer keep GCI walks the tail forward.
        {
            let h = log.file_by_no(0, 0);
            let file = log.files.get_mut(h);
            file.max_gci_started[0] = 5;
            file.last_prep_ref[0] = super::super::encode_prep_ref(0, 3);
            file.max_gci_started[1] = 2;
            file.last_prep_ref[1] = super::super::encode_prep_ref(0, 3);
        }
        log.set_log_tail(10);
        assert_eq!(log.parts[0].tail_mbyte, 3);
        assert_eq!(log.parts[0].state, LogPartState::Idle);
    }

    #[test]
    fn random_records_survive_page_crossings() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (mut log, mut io, mut inbox) = created_log();
        let mut rng = StdRng::seed_from_u64(7);
        let mut expected = Vec::new();
        for i in 0..40u32 {
            let klen = rng.gen_range(1..=12usize);
            let alen = rng.gen_range(0..=40usize);
            let key: Vec<u32> = (0..klen).map(|_| rng.gen()).collect();
            let attr: Vec<u32> = (0..alen).map(|_| rng.gen()).collect();
            let pos = log
                .append_prepare(0, i, 1, &key, &attr, &mut io, &mut inbox)
                .unwrap();
            expected.push((pos, key, attr));
            pump(&mut log, &mut io, &mut inbox);
        }
        log.flush_unwritten(&mut io, &mut inbox);
        pump(&mut log, &mut io, &mut inbox);

        let bytes = io.file_bytes(&crate::io::log_file_path(0, 0)).unwrap();
        // A record word, following the cursor across page headers.
        let record_word = |pos: &PrepPosition, offset: usize| -> u32 {
            let mut page = pos.start_page as usize;
            let mut index = pos.start_index as usize + offset;
            while index >= PAGE_WORDS {
                index = index - PAGE_WORDS + PAGE_HEADER_WORDS;
                page += 1;
            }
            let at = page * PAGE_BYTES + index * 4;
            u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
        };
        for (i, (pos, key, attr)) in expected.iter().enumerate() {
            assert_eq!(record_word(pos, 0), records::PREP_OP);
            assert_eq!(record_word(pos, 1), PREP_HEAD_WORDS + (key.len() + attr.len()) as u32);
            assert_eq!(record_word(pos, 2), i as u32);
            assert_eq!(record_word(pos, 4), attr.len() as u32);
            assert_eq!(record_word(pos, 5), key.len() as u32);
            for (k, &w) in key.iter().enumerate() {
                assert_eq!(record_word(pos, PREP_HEAD_WORDS as usize + k), w);
            }
            for (a, &w) in attr.iter().enumerate() {
                assert_eq!(record_word(pos, PREP_HEAD_WORDS as usize + key.len() + a), w);
            }
        }
    }

    #[test]
    fn flush_batches_after_max_pages() {
        let (mut log, mut io, mut inbox) = created_log();
        // Fill pages until the writer batches them out on its own.
        let attr: Vec<u32> = (0..900).collect();
        let writes_before = io.writes;
        for i in 0..24 {
            log.append_prepare(0, i, 1, &[i], &attr, &mut io, &mut inbox)
                .unwrap();
            pump(&mut log, &mut io, &mut inbox);
        }
        assert!(io.writes > writes_before, "full pages were never flushed");
        // Completed pages go back to the pool once written.
        assert!(log.pages.in_use() < 24);
    }
}
