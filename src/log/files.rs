//! Log parts, their circular file rings, and in-flight file operations.

use std::collections::{BTreeMap, VecDeque};

use super::page::{PageH, PagePool};
use super::replay::ExecSr;
use super::{
    hdr, records, FD_HEADER_WORDS, FD_PER_FILE_WORDS, MAX_FILES_IN_PAGE_ZERO, MBYTES_PER_FILE,
    PAGE_HEADER_WORDS, PAGE_VERSION,
};
use crate::config::Config;
use crate::pool::Pool;

crate::define_handle!(FileH);
crate::define_handle!(LfoH);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFileState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

/// Serialises the three writes of a file change: the trailing pages of
/// the old file, the new file's descriptor page, and the current-file
/// pointer in file 0 page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileChangeState {
    #[default]
    NotOngoing,
    FirstWriteOngoing,
    LastWriteOngoing,
    BothWritesOngoing,
    WritePageZeroOngoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogPartState {
    #[default]
    Idle,
    /// One op owns the appender; later arrivals queue.
    Active,
    /// The head would run into the tail; prepares fail temporarily.
    TailProblem,
    /// The next file is not yet usable; prepares fail temporarily.
    FileChangeProblem,
    /// Restart: executing the log.
    SrExecuting,
    /// Restart: rewriting post-head pages.
    SrInvalidating,
}

#[derive(Default)]
pub struct LogFile {
    pub part: u32,
    pub file_no: u32,
    pub state: LogFileState,
    pub os_file: u32,
    pub next: Option<FileH>,
    pub prev: Option<FileH>,
    /// Per-mbyte GCI summaries, mirrored into page-zero descriptors.
    pub max_gci_completed: [u32; MBYTES_PER_FILE as usize],
    pub max_gci_started: [u32; MBYTES_PER_FILE as usize],
    pub last_prep_ref: [u32; MBYTES_PER_FILE as usize],
    /// Summaries loaded from disk during restart head finding.
    pub fd_loaded: bool,
}

/// One outstanding-prepare bucket: prepares written in one megabyte whose
/// commit or abort record has not been written yet.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingPreps {
    pub file_no: u32,
    pub mbyte: u32,
    pub count: u32,
}

pub struct LogPart {
    pub id: u32,
    pub state: LogPartState,
    pub first_file: Option<FileH>,
    pub current_file: Option<FileH>,
    pub no_files: u32,
    pub current_mbyte: u32,
    /// Page index within the current file of the page being filled, or of
    /// the next page to allocate when no page is attached.
    pub current_filepage: u32,
    pub current_page: Option<PageH>,
    /// Content words still available in the current megabyte.
    pub mbyte_words_left: u32,
    pub log_lap: u32,
    /// Monotone count of megabytes entered; orders the outstanding-prepare
    /// buckets across the circular file space.
    pub mbyte_seq: u64,
    pub tail_file_no: u32,
    pub tail_mbyte: u32,
    pub newest_completed_gci: u32,
    /// Highest commit GCI written to this part.
    pub newest_gci: u32,
    /// Ops waiting for the appender, oldest first.
    pub queue: VecDeque<u32>,
    pub active_op: Option<u32>,
    /// Write a completed-GCI record as soon as the current append drains.
    pub write_completed_gci_after_write: bool,
    pub pending_completed_gci: u32,
    /// Completed dirty pages awaiting a write, in file order.
    pub flush_queue: Vec<PageH>,
    pub pages_since_sync: u32,
    pub next_flush_seq: u64,
    pub confirmed_flush_seq: u64,
    /// The current partial page holds words not yet handed to the file
    /// layer.
    pub unflushed: bool,
    pub outstanding_preps: BTreeMap<u64, OutstandingPreps>,
    pub file_change_state: FileChangeState,
    pub change_old_file: Option<FileH>,
    pub change_new_file: Option<FileH>,
    /// Opens still outstanding while bringing the part's files up.
    pub open_outstanding: u32,
    /// Creates/descriptor writes outstanding during an initial start.
    pub init_outstanding: u32,
    pub exec: ExecSr,
}

impl LogPart {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: LogPartState::Idle,
            first_file: None,
            current_file: None,
            no_files: 0,
            current_mbyte: 0,
            current_filepage: 0,
            current_page: None,
            mbyte_words_left: 0,
            log_lap: 0,
            mbyte_seq: 0,
            tail_file_no: 0,
            tail_mbyte: 0,
            newest_completed_gci: 0,
            newest_gci: 0,
            queue: VecDeque::new(),
            active_op: None,
            write_completed_gci_after_write: false,
            pending_completed_gci: 0,
            flush_queue: Vec::new(),
            pages_since_sync: 0,
            next_flush_seq: 0,
            confirmed_flush_seq: 0,
            unflushed: false,
            outstanding_preps: BTreeMap::new(),
            file_change_state: FileChangeState::NotOngoing,
            change_old_file: None,
            change_new_file: None,
            open_outstanding: 0,
            init_outstanding: 0,
            exec: ExecSr::default(),
        }
    }

    pub fn current_file_h(&self) -> FileH {
        self.current_file.expect("log part has no current file")
    }

    /// Earliest prepare without a commit, as a page-zero reference; the
    /// current megabyte when nothing is outstanding.
    pub fn earliest_prep_ref(&self, current_file_no: u32) -> u32 {
        match self.outstanding_preps.values().next() {
            Some(o) => super::encode_prep_ref(o.file_no, o.mbyte),
            None => super::encode_prep_ref(current_file_no, self.current_mbyte),
        }
    }

    pub fn note_prepare(&mut self, file_no: u32, mbyte: u32) -> u64 {
        let seq = self.mbyte_seq;
        let entry = self
            .outstanding_preps
            .entry(seq)
            .or_insert(OutstandingPreps {
                file_no,
                mbyte,
                count: 0,
            });
        entry.count += 1;
        seq
    }

    pub fn resolve_prepare(&mut self, mbyte_seq: u64) {
        if let Some(entry) = self.outstanding_preps.get_mut(&mbyte_seq) {
            entry.count -= 1;
            if entry.count == 0 {
                self.outstanding_preps.remove(&mbyte_seq);
            }
        }
    }
}

#[derive(Default)]
pub enum LfoKind {
    #[default]
    Idle,
    /// Routine flush; `release` pages go back to the pool on CONF,
    /// `keep` pages (the partial current page) stay attached to the part.
    WriteLog {
        release: Vec<PageH>,
        keep: Vec<PageH>,
        flush_seq: u64,
    },
    /// Trailing pages of the old file during a file change.
    LastWriteOldFile {
        release: Vec<PageH>,
        keep: Vec<PageH>,
        flush_seq: u64,
    },
    /// The new file's page-zero descriptor during a file change.
    FirstWriteNewFile { page: PageH },
    /// File 0 page 0 rewritten with the new current file number.
    WritePageZero { page: PageH },
    /// Initial start: descriptor write while creating the log.
    InitFdWrite { page: PageH },
    /// Restart reads.
    SrReadFileZero { page: PageH },
    SrReadFd { page: PageH },
    SrReadMbyteFirst { page: PageH, mbyte: u32 },
    SrReadHeadPage { page: PageH, filepage: u32 },
    SrReadExecBatch { pages: Vec<PageH>, first_filepage: u32 },
    SrReadPrepare { pages: Vec<PageH>, start_page: u32 },
    /// Write-back of a page whose commit record was neutralised.
    SrWriteDirtyPage { page: PageH },
    /// Tail invalidation loop.
    SrInvalidateRead { page: PageH, filepage: u32 },
    SrInvalidateWrite { page: PageH, filepage: u32 },
    /// Restart epilogue: file 0 page 0 renamed to the recovered head file.
    SrWritePageZero { page: PageH },
}

#[derive(Default)]
pub struct Lfo {
    pub part: u32,
    pub file: Option<FileH>,
    pub kind: LfoKind,
}

/// The whole redo engine: four parts sharing one page pool.
pub struct RedoLog {
    pub parts: Vec<LogPart>,
    pub files: Pool<FileH, LogFile>,
    pub pages: PagePool,
    pub lfos: Pool<LfoH, Lfo>,
    pub files_per_part: u32,
    pub diskless: bool,
    /// Set while the log is being created from scratch.
    pub initial: bool,
}

impl RedoLog {
    pub fn new(cfg: &Config) -> Self {
        let files_per_part = cfg.redo_log_files_per_part.max(3);
        let mut files: Pool<FileH, LogFile> = Pool::new(files_per_part * super::LOG_PARTS as u32);
        let mut parts = Vec::with_capacity(super::LOG_PARTS);
        for part_id in 0..super::LOG_PARTS as u32 {
            let mut part = LogPart::new(part_id);
            part.no_files = files_per_part;
            let handles: Vec<FileH> = (0..files_per_part)
                .map(|file_no| {
                    let h = files.seize().expect("file pool sized for all parts");
                    let file = files.get_mut(h);
                    file.part = part_id;
                    file.file_no = file_no;
                    h
                })
                .collect();
            for (i, &h) in handles.iter().enumerate() {
                let next = handles[(i + 1) % handles.len()];
                let prev = handles[(i + handles.len() - 1) % handles.len()];
                let file = files.get_mut(h);
                file.next = Some(next);
                file.prev = Some(prev);
            }
            part.first_file = Some(handles[0]);
            part.current_file = Some(handles[0]);
            parts.push(part);
        }
        Self {
            parts,
            files,
            pages: Pool::new(cfg.redo_log_pages.max(32)),
            lfos: Pool::new(64),
            files_per_part,
            diskless: cfg.diskless,
            initial: false,
        }
    }

    pub fn file_by_no(&self, part: u32, file_no: u32) -> FileH {
        let first = self.parts[part as usize]
            .first_file
            .expect("part has no files");
        let mut h = first;
        loop {
            let file = self.files.get(h);
            if file.file_no == file_no {
                return h;
            }
            h = file.next.expect("file ring is closed");
            assert_ne!(h, first, "file {file_no} not in ring of part {part}");
        }
    }

    pub fn seize_lfo(&mut self, part: u32, file: Option<FileH>, kind: LfoKind) -> LfoH {
        let h = self.lfos.seize().expect("no free file-operation record");
        let lfo = self.lfos.get_mut(h);
        lfo.part = part;
        lfo.file = file;
        lfo.kind = kind;
        h
    }

    /// Builds a page-zero file descriptor covering the most recent files
    /// of the part, newest first. `current_file_no` lands in the header
    /// slot that restart reads to locate the head.
    pub fn build_fd_page(&mut self, part_id: u32, current_file_no: u32) -> PageH {
        let no_files = self.parts[part_id as usize].no_files;
        let no_fd = no_files.min(MAX_FILES_IN_PAGE_ZERO);
        let log_lap = self.parts[part_id as usize].log_lap;
        let newest_completed = self.parts[part_id as usize].newest_completed_gci;
        let newest = self.parts[part_id as usize].newest_gci;
        let prep_ref = self.parts[part_id as usize].earliest_prep_ref(current_file_no);

        let mut described = Vec::with_capacity(no_fd as usize);
        for k in 0..no_fd {
            let file_no = (current_file_no + no_files - k) % no_files;
            let h = self.file_by_no(part_id, file_no);
            let f = self.files.get(h);
            described.push((f.max_gci_completed, f.max_gci_started, f.last_prep_ref));
        }

        let page_h = self.pages.seize().expect("no free page for descriptor");
        let page = self.pages.get_mut(page_h);
        page.zero();
        page.filepage = 0;
        page.set_word(hdr::LOG_LAP, log_lap);
        page.set_word(hdr::MAX_GCI_COMPLETED, newest_completed);
        page.set_word(hdr::MAX_GCI_STARTED, newest);
        page.set_word(hdr::VERSION, PAGE_VERSION);
        page.set_word(hdr::NO_LOG_FILES, no_files);
        page.set_word(hdr::LAST_PREP_REF, prep_ref);

        let mut index = PAGE_HEADER_WORDS;
        page.set_word(index, records::FD);
        page.set_word(index + 1, current_file_no);
        page.set_word(index + 2, no_fd);
        index += FD_HEADER_WORDS as usize;
        for (completed, started, prep) in described {
            for m in 0..MBYTES_PER_FILE as usize {
                page.set_word(index + m, completed[m]);
            }
            index += MBYTES_PER_FILE as usize;
            for m in 0..MBYTES_PER_FILE as usize {
                page.set_word(index + m, started[m]);
            }
            index += MBYTES_PER_FILE as usize;
            for m in 0..MBYTES_PER_FILE as usize {
                page.set_word(index + m, prep[m]);
            }
            index += MBYTES_PER_FILE as usize;
        }
        page.set_word(index, records::NEXT_LOG_RECORD);
        page.set_word(hdr::CURR_PAGE_INDEX, index as u32);
        page.dirty = true;
        page_h
    }

    /// Reads a page-zero descriptor back into the in-memory file records.
    /// Returns the file number the descriptor names as current.
    pub fn load_fd_page(&mut self, part_id: u32, page_h: PageH) -> u32 {
        let (current_file_no, no_fd, entries) = {
            let page = self.pages.get(page_h);
            let base = PAGE_HEADER_WORDS;
            assert_eq!(
                page.word(base),
                records::FD,
                "page zero of part {part_id} lacks a file descriptor"
            );
            let current_file_no = page.word(base + 1);
            let no_fd = page.word(base + 2);
            let mut entries = Vec::with_capacity(no_fd as usize);
            let mut index = base + FD_HEADER_WORDS as usize;
            for _ in 0..no_fd {
                let mut completed = [0u32; MBYTES_PER_FILE as usize];
                let mut started = [0u32; MBYTES_PER_FILE as usize];
                let mut prep = [0u32; MBYTES_PER_FILE as usize];
                for m in 0..MBYTES_PER_FILE as usize {
                    completed[m] = page.word(index + m);
                }
                index += MBYTES_PER_FILE as usize;
                for m in 0..MBYTES_PER_FILE as usize {
                    started[m] = page.word(index + m);
                }
                index += MBYTES_PER_FILE as usize;
                for m in 0..MBYTES_PER_FILE as usize {
                    prep[m] = page.word(index + m);
                }
                index += MBYTES_PER_FILE as usize;
                entries.push((completed, started, prep));
            }
            (current_file_no, no_fd, entries)
        };
        let no_files = self.parts[part_id as usize].no_files;
        for (k, (completed, started, prep)) in entries.into_iter().enumerate() {
            let file_no = (current_file_no + no_files - k as u32) % no_files;
            let h = self.file_by_no(part_id, file_no);
            let file = self.files.get_mut(h);
            // First load wins: descriptors are read newest-first during
            // head finding and a newer page zero has fresher summaries.
            if file.fd_loaded {
                continue;
            }
            file.max_gci_completed = completed;
            file.max_gci_started = started;
            file.last_prep_ref = prep;
            file.fd_loaded = true;
        }
        let _ = no_fd;
        current_file_no
    }

    /// Words the descriptor occupies in a page-zero, terminator excluded.
    pub fn fd_record_words(no_fd: u32) -> u32 {
        FD_HEADER_WORDS + no_fd * FD_PER_FILE_WORDS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_ring_is_circular() {
        let log = RedoLog::new(&Config::default());
        for part in 0..super::super::LOG_PARTS as u32 {
            let first = log.parts[part as usize].first_file.unwrap();
            let mut h = first;
            let mut seen = 0;
            loop {
                let file = log.files.get(h);
                assert_eq!(file.part, part);
                assert_eq!(file.file_no, seen);
                seen += 1;
                h = file.next.unwrap();
                if h == first {
                    break;
                }
            }
            assert_eq!(seen, log.files_per_part);
        }
    }

    #[test]
    fn fd_page_round_trip() {
        let mut log = RedoLog::new(&Config::default());
        let h = log.file_by_no(0, 2);
        {
            let file = log.files.get_mut(h);
            file.max_gci_completed[3] = 40;
            file.max_gci_started[3] = 44;
            file.last_prep_ref[3] = super::super::encode_prep_ref(1, 7);
        }
        log.parts[0].log_lap = 5;
        let page = log.build_fd_page(0, 2);

        // Wipe and reload from the page.
        let file = log.files.get_mut(h);
        file.max_gci_completed = [0; 16];
        file.max_gci_started = [0; 16];
        file.last_prep_ref = [0; 16];

        let current = log.load_fd_page(0, page);
        assert_eq!(current, 2);
        let file = log.files.get(h);
        assert_eq!(file.max_gci_completed[3], 40);
        assert_eq!(file.max_gci_started[3], 44);
        assert_eq!(
            super::super::decode_prep_ref(file.last_prep_ref[3]),
            (1, 7)
        );
    }

    #[test]
    fn outstanding_prep_bookkeeping() {
        let mut part = LogPart::new(0);
        part.current_mbyte = 4;
        let seq_a = part.note_prepare(0, 4);
        part.mbyte_seq += 1;
        part.current_mbyte = 5;
        let seq_b = part.note_prepare(0, 5);
        assert_eq!(part.earliest_prep_ref(0), super::super::encode_prep_ref(0, 4));
        part.resolve_prepare(seq_a);
        assert_eq!(part.earliest_prep_ref(0), super::super::encode_prep_ref(0, 5));
        part.resolve_prepare(seq_b);
        assert_eq!(part.earliest_prep_ref(0), super::super::encode_prep_ref(0, 5));
    }
}
